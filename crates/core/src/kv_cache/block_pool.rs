use std::collections::VecDeque;

use super::error::CacheError;

pub type BlockId = usize;

/// Result of drawing a fresh block from the pool.
pub(crate) struct FreshBlock {
    pub block_id: BlockId,
    /// Content hash of a reclaimed overwriteable block, so the caller can
    /// drop its prefix-index entry.
    pub reclaimed_hash: Option<u64>,
}

/// Reference-counted pool of physical KV blocks.
///
/// One block id addresses `block_size` token positions in every attention
/// layer; `ref_count` counts per-layer block-table entries referencing the
/// block, so the pool-wide sum equals the total number of table entries.
///
/// Hashed blocks whose ref_count drops to zero do not return to the free
/// list directly: they park on the *overwriteable* list, stay discoverable
/// through their content hash, count as free capacity, and are reclaimed
/// LRU-first once the free list runs dry.
pub struct BlockPool {
    num_blocks: usize,
    free_list: Vec<BlockId>,
    ref_counts: Vec<u32>,
    content_hashes: Vec<Option<u64>>,
    /// Front = least recently parked.
    overwriteable: VecDeque<BlockId>,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        // LIFO: pop hands out low ids first
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();
        Self {
            num_blocks,
            free_list,
            ref_counts: vec![0; num_blocks],
            content_hashes: vec![None; num_blocks],
            overwriteable: VecDeque::new(),
        }
    }

    pub fn num_total(&self) -> usize {
        self.num_blocks
    }

    /// Free capacity, counting parked overwriteable blocks.
    pub fn num_free(&self) -> usize {
        self.free_list.len() + self.overwriteable.len()
    }

    pub fn can_allocate(&self, n: usize) -> bool {
        n <= self.num_free()
    }

    pub fn ref_count(&self, block_id: BlockId) -> u32 {
        self.ref_counts[block_id]
    }

    pub fn content_hash(&self, block_id: BlockId) -> Option<u64> {
        self.content_hashes[block_id]
    }

    pub fn set_content_hash(&mut self, block_id: BlockId, hash: u64) {
        self.content_hashes[block_id] = Some(hash);
    }

    /// Draw one block, preferring the free list and falling back to
    /// reclaiming the least recently used overwriteable block.
    pub(crate) fn draw(&mut self) -> Result<FreshBlock, CacheError> {
        if let Some(block_id) = self.free_list.pop() {
            self.content_hashes[block_id] = None;
            return Ok(FreshBlock {
                block_id,
                reclaimed_hash: None,
            });
        }
        if let Some(block_id) = self.overwriteable.pop_front() {
            let reclaimed_hash = self.content_hashes[block_id].take();
            return Ok(FreshBlock {
                block_id,
                reclaimed_hash,
            });
        }
        Err(CacheError::OutOfBlocks {
            requested: 1,
            available: 0,
        })
    }

    /// Take a parked hashed block back into service (prefix-cache hit on a
    /// block with no live references).
    pub fn revive(&mut self, block_id: BlockId) {
        if let Some(pos) = self.overwriteable.iter().position(|&id| id == block_id) {
            self.overwriteable.remove(pos);
        }
    }

    pub fn ref_add(&mut self, block_id: BlockId, n: u32) {
        self.ref_counts[block_id] += n;
    }

    /// Drop one reference. At zero the block either parks (hashed) or
    /// returns to the free list.
    pub fn ref_release(&mut self, block_id: BlockId) -> Result<u32, CacheError> {
        let count = &mut self.ref_counts[block_id];
        if *count == 0 {
            return Err(CacheError::BlockNotAllocated { block_id });
        }
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            if self.content_hashes[block_id].is_some() {
                self.overwriteable.push_back(block_id);
            } else {
                self.free_list.push(block_id);
            }
        }
        Ok(remaining)
    }

    /// Sum of all reference counts; equals the total table-entry count.
    pub fn total_ref_count(&self) -> u64 {
        self.ref_counts.iter().map(|&c| c as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_all_free() {
        let pool = BlockPool::new(8);
        assert_eq!(pool.num_free(), 8);
        assert!(pool.can_allocate(8));
        assert!(!pool.can_allocate(9));
    }

    #[test]
    fn draw_hands_out_unique_ids() {
        let mut pool = BlockPool::new(4);
        let mut ids: Vec<BlockId> = (0..4).map(|_| pool.draw().unwrap().block_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert!(pool.draw().is_err());
    }

    #[test]
    fn release_returns_block_to_free_list() {
        let mut pool = BlockPool::new(2);
        let id = pool.draw().unwrap().block_id;
        pool.ref_add(id, 2);
        assert_eq!(pool.num_free(), 1);

        assert_eq!(pool.ref_release(id).unwrap(), 1);
        assert_eq!(pool.num_free(), 1);
        assert_eq!(pool.ref_release(id).unwrap(), 0);
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn release_unreferenced_block_errors() {
        let mut pool = BlockPool::new(2);
        let id = pool.draw().unwrap().block_id;
        assert!(matches!(
            pool.ref_release(id),
            Err(CacheError::BlockNotAllocated { .. })
        ));
    }

    #[test]
    fn hashed_block_parks_instead_of_freeing() {
        let mut pool = BlockPool::new(2);
        let id = pool.draw().unwrap().block_id;
        pool.ref_add(id, 1);
        pool.set_content_hash(id, 0xfeed);

        pool.ref_release(id).unwrap();
        // Parked block still counts as free capacity
        assert_eq!(pool.num_free(), 2);
        assert_eq!(pool.content_hash(id), Some(0xfeed));
    }

    #[test]
    fn reclaim_parked_block_reports_hash() {
        let mut pool = BlockPool::new(1);
        let id = pool.draw().unwrap().block_id;
        pool.ref_add(id, 1);
        pool.set_content_hash(id, 0xbeef);
        pool.ref_release(id).unwrap();

        let fresh = pool.draw().unwrap();
        assert_eq!(fresh.block_id, id);
        assert_eq!(fresh.reclaimed_hash, Some(0xbeef));
        assert_eq!(pool.content_hash(id), None);
    }

    #[test]
    fn reclaim_order_is_lru() {
        let mut pool = BlockPool::new(2);
        let a = pool.draw().unwrap().block_id;
        let b = pool.draw().unwrap().block_id;
        for (id, hash) in [(a, 1u64), (b, 2u64)] {
            pool.ref_add(id, 1);
            pool.set_content_hash(id, hash);
        }
        pool.ref_release(a).unwrap(); // parked first → reclaimed first
        pool.ref_release(b).unwrap();

        assert_eq!(pool.draw().unwrap().block_id, a);
        assert_eq!(pool.draw().unwrap().block_id, b);
    }

    #[test]
    fn revive_removes_from_overwriteable() {
        let mut pool = BlockPool::new(2);
        let id = pool.draw().unwrap().block_id;
        pool.ref_add(id, 1);
        pool.set_content_hash(id, 7);
        pool.ref_release(id).unwrap();
        assert_eq!(pool.num_free(), 2);

        pool.revive(id);
        pool.ref_add(id, 1);
        assert_eq!(pool.num_free(), 1);
        // The other block is still drawable; the revived one is not
        let other = pool.draw().unwrap().block_id;
        assert_ne!(other, id);
        assert!(pool.draw().is_err());
    }

    #[test]
    fn total_ref_count_tracks_entries() {
        let mut pool = BlockPool::new(4);
        let a = pool.draw().unwrap().block_id;
        let b = pool.draw().unwrap().block_id;
        pool.ref_add(a, 2);
        pool.ref_add(b, 3);
        assert_eq!(pool.total_ref_count(), 5);
        pool.ref_release(b).unwrap();
        assert_eq!(pool.total_ref_count(), 4);
    }
}
