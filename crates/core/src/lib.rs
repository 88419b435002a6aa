//! Execution core of a continuous-batching inference pipeline.
//!
//! The crate schedules interleaved prompt and generation work across a
//! paged KV block pool, preempts requests under cache pressure, optionally
//! deduplicates prompt prefixes and evicts low-attention blocks, and
//! coordinates a draft/main pipeline pair for speculative decoding.
//! Tokenization, the model forward pass and sampling numerics stay outside,
//! behind the [`tokenizer::Tokenizer`], [`model::ModelRunner`] and
//! [`sampling::Sampler`] traits.

pub mod error;
pub mod eviction;
pub mod kv_cache;
pub mod model;
pub mod pipeline;
pub mod sampling;
pub mod scheduler;
pub mod sequence;
pub mod testing;
pub mod tokenizer;

pub use error::EngineError;
pub use pipeline::{
    ContinuousBatchingPipeline, EncodedGenerationResult, GenerationHandle, GenerationStatus,
    InferencePipeline, PipelineDesc, SpeculativeDecodingPipeline, Streamer,
};
pub use sampling::SamplingParams;
pub use scheduler::SchedulerConfig;
