use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },

    #[error("no block table for sequence {seq_id}")]
    UnknownSequence { seq_id: u64 },

    #[error("per-layer eviction sets mismatch: expected {expected} layers, found {found}")]
    LayerMismatch { expected: usize, found: usize },
}
