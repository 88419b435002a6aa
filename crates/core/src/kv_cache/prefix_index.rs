use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use super::block_pool::BlockId;
use crate::sequence::TokenId;

/// Content-hash index over full prompt blocks.
///
/// Maps chained block hashes to the physical blocks holding their computed
/// KV state. Entries survive the owning request (the block parks on the
/// pool's overwriteable list) and are dropped when the block is reclaimed.
#[derive(Default)]
pub struct PrefixIndex {
    map: HashMap<u64, BlockId>,
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: u64) -> Option<BlockId> {
        self.map.get(&hash).copied()
    }

    pub fn insert(&mut self, hash: u64, block_id: BlockId) {
        self.map.insert(hash, block_id);
    }

    pub fn remove(&mut self, hash: u64) {
        self.map.remove(&hash);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Chained hashes over the block-aligned prefix of `token_ids`.
///
/// Each block's hash folds in the previous block's hash, so a match at
/// logical index `i` implies the entire prefix up to `i` matches. Only full
/// blocks participate; a trailing partial block is never hashed.
pub fn block_hashes(token_ids: &[TokenId], block_size: usize) -> Vec<u64> {
    let mut hashes = Vec::new();
    let mut prev_hash: u64 = 0;

    for chunk in token_ids.chunks(block_size) {
        if chunk.len() < block_size {
            break;
        }
        let hash = hash_block(prev_hash, chunk);
        hashes.push(hash);
        prev_hash = hash;
    }
    hashes
}

fn hash_block(prev_hash: u64, tokens: &[TokenId]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prev_hash.hash(&mut hasher);
    for &t in tokens {
        t.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_last_block_not_hashed() {
        let hashes = block_hashes(&[1, 2, 3, 4, 5, 6], 4);
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn hashes_are_deterministic() {
        let a = block_hashes(&[1, 2, 3, 4, 5, 6, 7, 8], 4);
        let b = block_hashes(&[1, 2, 3, 4, 5, 6, 7, 8], 4);
        assert_eq!(a, b);
    }

    #[test]
    fn chained_hashes_diverge_after_first_difference() {
        let a = block_hashes(&[1, 2, 3, 4, 5, 6, 7, 8], 4);
        let b = block_hashes(&[1, 2, 3, 4, 9, 9, 9, 9], 4);
        assert_eq!(a[0], b[0]);
        assert_ne!(a[1], b[1]);

        // Same second-block content behind a different first block must not
        // collide either.
        let c = block_hashes(&[9, 9, 9, 9, 5, 6, 7, 8], 4);
        assert_ne!(a[1], c[1]);
    }

    #[test]
    fn index_insert_lookup_remove() {
        let mut index = PrefixIndex::new();
        assert!(index.is_empty());
        index.insert(42, 7);
        assert_eq!(index.get(42), Some(7));
        assert_eq!(index.len(), 1);
        index.remove(42);
        assert_eq!(index.get(42), None);
    }
}
