//! The model-runner contract.
//!
//! The forward pass is a black box to this crate: given the active groups
//! and the step's [`SchedulerOutput`] (token counts, per-layer block tables,
//! copy-on-write map) it returns logits, and optionally per-block attention
//! scores for the cache-eviction pass. The runner must honor the block
//! tables as KV addressing and perform the block copies named in
//! `block_copy_map` before reading any source block.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::scheduler::SchedulerOutput;
use crate::sequence::{SeqId, SequenceGroup};

/// Logits for one forward pass: one row of vocabulary scores per scheduled
/// token, ordered by `scheduled_group_ids`, then by running sequence within
/// the group, then by token position within the scheduled span.
#[derive(Debug, Default)]
pub struct Logits {
    rows: Vec<Vec<f32>>,
}

impl Logits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_row(&mut self, row: Vec<f32>) {
        self.rows.push(row);
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Accumulated attention mass per sequence: `[layer][logical_block] → score`.
pub type AttentionScores = HashMap<SeqId, Vec<Vec<f32>>>;

/// External forward-pass contract.
pub trait ModelRunner {
    fn forward(
        &mut self,
        groups: &[SequenceGroup],
        scheduler_output: &SchedulerOutput,
    ) -> Result<Logits, EngineError>;

    /// Attention scores observed during the most recent forward pass, when
    /// the runner collects them. Required for score-driven cache eviction.
    fn last_attention_scores(&self) -> Option<AttentionScores> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logits_rows_round_trip() {
        let mut logits = Logits::new();
        assert!(logits.is_empty());
        logits.push_row(vec![0.1, 0.9]);
        logits.push_row(vec![0.7, 0.3]);
        assert_eq!(logits.num_rows(), 2);
        assert_eq!(logits.row(1), Some(&[0.7, 0.3][..]));
        assert_eq!(logits.row(2), None);
    }
}
