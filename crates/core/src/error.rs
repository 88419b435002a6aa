use thiserror::Error;

use crate::kv_cache::CacheError;

/// Errors surfaced by the pipeline layer.
///
/// Cache pressure is not represented here: allocation failures are recovered
/// locally through preemption, and a request that cannot be scheduled at all
/// finishes with [`GenerationStatus::OutOfMemory`] instead of erroring the
/// pipeline.
///
/// [`GenerationStatus::OutOfMemory`]: crate::pipeline::GenerationStatus::OutOfMemory
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("pipeline is poisoned by a previous internal error")]
    Poisoned,

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Shorthand for invariant checks that poison the pipeline when they fail.
pub(crate) fn internal(msg: impl Into<String>) -> EngineError {
    EngineError::Internal(msg.into())
}
