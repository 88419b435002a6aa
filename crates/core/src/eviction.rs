//! Attention-score-driven eviction of intermediate KV blocks.
//!
//! For each sequence the pipeline accumulates the per-block attention mass
//! reported by the model runner. At eviction time the logical blocks are
//! partitioned into a reserved prefix window, a reserved recent window and
//! an evictable middle; when the middle outgrows its budget, the
//! lowest-scoring blocks are selected per layer. Only fully filled blocks
//! participate; a trailing partial block is always treated as recent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Zone sizes for the eviction policy, all in blocks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheEvictionConfig {
    /// Blocks at the start of the sequence that are never evicted.
    pub start_size: usize,
    /// Most recent full blocks that are never evicted.
    pub recent_size: usize,
    /// Budget for the evictable middle; anything beyond it is evicted.
    pub max_evictable_size: usize,
}

impl Default for CacheEvictionConfig {
    fn default() -> Self {
        Self {
            start_size: 1,
            recent_size: 2,
            max_evictable_size: 8,
        }
    }
}

/// Per-sequence rolling accumulator of attention scores, keyed by logical
/// block index per layer.
pub struct CacheEvictionScores {
    config: CacheEvictionConfig,
    num_layers: usize,
    scores: Vec<Vec<f64>>,
}

impl CacheEvictionScores {
    pub fn new(config: CacheEvictionConfig, num_layers: usize) -> Self {
        Self {
            config,
            num_layers,
            scores: vec![Vec::new(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Fold one forward pass's per-block attention mass into the
    /// accumulator. `per_layer[layer][logical_block]` follows the
    /// sequence's current block table; the accumulator grows as the table
    /// does.
    pub fn register_token_scores(&mut self, per_layer: &[Vec<f32>]) {
        for (layer, layer_scores) in per_layer.iter().enumerate().take(self.num_layers) {
            let acc = &mut self.scores[layer];
            for (i, &s) in layer_scores.iter().enumerate() {
                if i < acc.len() {
                    acc[i] += s as f64;
                } else {
                    acc.push(s as f64);
                }
            }
        }
    }

    /// Select blocks to evict, given how many of the sequence's blocks are
    /// completely filled. Returns one index set per layer, every set the
    /// same size; accumulator entries for the chosen blocks are removed so
    /// later indices realign with the shrunken block table.
    pub fn evict_logical_blocks(&mut self, num_full_blocks: usize) -> Vec<BTreeSet<usize>> {
        let start = self.config.start_size;
        let end = num_full_blocks.saturating_sub(self.config.recent_size);
        let evictable = end.saturating_sub(start);
        let to_evict = evictable.saturating_sub(self.config.max_evictable_size);
        if to_evict == 0 {
            return vec![BTreeSet::new(); self.num_layers];
        }

        let mut result = Vec::with_capacity(self.num_layers);
        for layer in 0..self.num_layers {
            let acc = &self.scores[layer];
            let mut candidates: Vec<(usize, f64)> = (start..end.min(acc.len()))
                .map(|i| (i, acc[i]))
                .collect();
            candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let chosen: BTreeSet<usize> =
                candidates.into_iter().take(to_evict).map(|(i, _)| i).collect();

            let acc = &mut self.scores[layer];
            for &i in chosen.iter().rev() {
                if i < acc.len() {
                    acc.remove(i);
                }
            }
            result.push(chosen);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start: usize, recent: usize, max_evictable: usize) -> CacheEvictionConfig {
        CacheEvictionConfig {
            start_size: start,
            recent_size: recent,
            max_evictable_size: max_evictable,
        }
    }

    #[test]
    fn no_eviction_within_budget() {
        let mut scores = CacheEvictionScores::new(config(1, 1, 2), 1);
        scores.register_token_scores(&[vec![1.0, 1.0, 1.0, 1.0]]);
        let evicted = scores.evict_logical_blocks(4);
        assert_eq!(evicted.len(), 1);
        assert!(evicted[0].is_empty());
    }

    #[test]
    fn evicts_lowest_scoring_middle_block() {
        // 5 full blocks, start=1, recent=1 → middle is blocks 1..4,
        // budget 2 → exactly one block goes, the lowest-scored
        let mut scores = CacheEvictionScores::new(config(1, 1, 2), 1);
        scores.register_token_scores(&[vec![9.0, 5.0, 4.0, 0.5, 9.0, 9.0]]);
        let evicted = scores.evict_logical_blocks(5);
        assert_eq!(evicted[0], [3].into_iter().collect());
    }

    #[test]
    fn prefix_and_recent_windows_are_protected() {
        // Lowest scores sit in the protected zones; eviction must pick from
        // the middle anyway
        let mut scores = CacheEvictionScores::new(config(1, 1, 2), 1);
        scores.register_token_scores(&[vec![0.0, 5.0, 3.0, 4.0, 0.0]]);
        let evicted = scores.evict_logical_blocks(5);
        assert_eq!(evicted[0], [2].into_iter().collect());
    }

    #[test]
    fn layers_evict_same_count_possibly_different_blocks() {
        let mut scores = CacheEvictionScores::new(config(1, 1, 2), 2);
        scores.register_token_scores(&[
            vec![9.0, 5.0, 0.1, 6.0, 9.0],
            vec![9.0, 0.1, 5.0, 6.0, 9.0],
        ]);
        let evicted = scores.evict_logical_blocks(5);
        assert_eq!(evicted[0].len(), evicted[1].len());
        assert_eq!(evicted[0], [2].into_iter().collect());
        assert_eq!(evicted[1], [1].into_iter().collect());
    }

    #[test]
    fn accumulator_shifts_after_eviction() {
        let mut scores = CacheEvictionScores::new(config(1, 1, 2), 1);
        scores.register_token_scores(&[vec![9.0, 5.0, 0.1, 6.0, 9.0]]);
        let evicted = scores.evict_logical_blocks(5);
        assert_eq!(evicted[0], [2].into_iter().collect());

        // Scores for blocks past the evicted one shifted down by one; the
        // next report realigns with the shorter table
        scores.register_token_scores(&[vec![1.0, 1.0, 1.0, 1.0]]);
        let evicted = scores.evict_logical_blocks(4);
        assert!(evicted[0].is_empty());
    }

    #[test]
    fn scores_accumulate_across_steps() {
        let mut scores = CacheEvictionScores::new(config(1, 1, 2), 1);
        scores.register_token_scores(&[vec![9.0, 1.0, 2.0, 9.0, 9.0]]);
        // Block 2 catches up past block 1 across steps
        scores.register_token_scores(&[vec![9.0, 1.0, 8.0, 9.0, 9.0]]);
        let evicted = scores.evict_logical_blocks(5);
        assert_eq!(evicted[0], [1].into_iter().collect());
    }

    #[test]
    fn partial_trailing_block_never_considered() {
        // 6 table entries reported but only 5 full blocks: index 5 is
        // partial and outside the evictable range by construction
        let mut scores = CacheEvictionScores::new(config(1, 1, 2), 1);
        scores.register_token_scores(&[vec![9.0, 5.0, 4.0, 0.5, 9.0, 0.0]]);
        let evicted = scores.evict_logical_blocks(5);
        assert_eq!(evicted[0], [3].into_iter().collect());
    }
}
