//! Paged KV cache bookkeeping.
//!
//! The [`BlockManager`] owns the pool of physical blocks and every
//! sequence's per-layer block table. It is accessed exclusively from the
//! pipeline thread, so reference counts are single-writer and need no
//! locking. Ref counts are the single source of truth for sharing: a
//! sequence may write into a block only when every live reference to it
//! comes from that sequence's own table, and `append_slots` enforces this
//! with copy-on-write duplication.

mod block_pool;
mod error;
mod metrics;
mod prefix_index;

pub use block_pool::{BlockId, BlockPool};
pub use error::CacheError;
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use prefix_index::{block_hashes, PrefixIndex};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::sequence::{SeqId, SequenceGroup, TokenId};

/// Copy-on-write directives for one scheduling pass: source block id → the
/// destination blocks its content must be copied into before the forward
/// pass reads them.
pub type BlockCopyMap = HashMap<BlockId, Vec<BlockId>>;

/// A sequence's block table: `[layer][logical_index] → physical block`.
///
/// All layers always hold the same number of entries; score-driven eviction
/// may free different logical indices per layer but always the same count.
pub type BlockTables = Vec<Vec<BlockId>>;

pub struct BlockManager {
    pool: BlockPool,
    tables: HashMap<SeqId, BlockTables>,
    block_size: usize,
    num_layers: usize,
    enable_prefix_caching: bool,
    prefix_index: PrefixIndex,
    metrics: Arc<CacheMetrics>,
}

impl BlockManager {
    pub fn new(
        num_kv_blocks: usize,
        enable_prefix_caching: bool,
        block_size: usize,
        num_layers: usize,
    ) -> Self {
        assert!(num_layers > 0, "num_layers must be non-zero");
        assert!(block_size > 0, "block_size must be non-zero");
        Self {
            pool: BlockPool::new(num_kv_blocks),
            tables: HashMap::new(),
            block_size,
            num_layers,
            enable_prefix_caching,
            prefix_index: PrefixIndex::new(),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free()
    }

    pub fn num_total_blocks(&self) -> usize {
        self.pool.num_total()
    }

    pub fn can_allocate_blocks(&self, n: usize) -> bool {
        self.pool.can_allocate(n)
    }

    /// Fraction of the pool currently in use, in `[0, 1]`.
    pub fn get_used_percentage(&self) -> f32 {
        let total = self.pool.num_total();
        if total == 0 {
            return 0.0;
        }
        1.0 - self.pool.num_free() as f32 / total as f32
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn has_block_table(&self, seq_id: SeqId) -> bool {
        self.tables.contains_key(&seq_id)
    }

    pub fn get_block_tables(&self, seq_id: SeqId) -> Option<&BlockTables> {
        self.tables.get(&seq_id)
    }

    /// Logical blocks currently held by `seq_id` (0 when untracked).
    pub fn table_len(&self, seq_id: SeqId) -> usize {
        self.tables.get(&seq_id).map(|t| t[0].len()).unwrap_or(0)
    }

    /// Distinct physical blocks referenced by any sequence of `group`.
    pub fn blocks_occupied_by_group(&self, group: &SequenceGroup) -> usize {
        let mut distinct: HashSet<BlockId> = HashSet::new();
        for seq in group.sequences() {
            if let Some(table) = self.tables.get(&seq.id()) {
                for layer in table {
                    distinct.extend(layer.iter().copied());
                }
            }
        }
        distinct.len()
    }

    fn blocks_for_tokens(&self, n: usize) -> usize {
        n.div_ceil(self.block_size)
    }

    /// Table length a sequence of `group` needs to cover its scheduled span.
    fn required_table_len(&self, group: &SequenceGroup) -> usize {
        let occupied = group.num_processed_tokens() - group.num_evicted_tokens();
        self.blocks_for_tokens(occupied + group.num_scheduled_tokens())
    }

    /// Logical indices of already-present blocks the scheduled span writes
    /// into (candidates for copy-on-write).
    fn written_existing_range(&self, group: &SequenceGroup, table_len: usize) -> (usize, usize) {
        let occupied = group.num_processed_tokens() - group.num_evicted_tokens();
        let new_total = occupied + group.num_scheduled_tokens();
        if new_total == occupied {
            return (0, 0);
        }
        let first = occupied / self.block_size;
        let last = (new_total - 1) / self.block_size;
        (first.min(table_len), (last + 1).min(table_len))
    }

    /// How many of the layer entries at `table[..][logical]` reference `id`.
    fn own_refs_at(table: &BlockTables, logical: usize, id: BlockId) -> u32 {
        table
            .iter()
            .filter(|layer| layer.get(logical) == Some(&id))
            .count() as u32
    }

    /// Append `n` blocks to every layer of `seq_id`'s table.
    ///
    /// With prefix caching enabled, blocks covering full prompt blocks are
    /// content-hashed; on an index hit the cached physical block is reused
    /// (its ref count incremented) instead of drawing from the free list.
    pub fn allocate(
        &mut self,
        seq_id: SeqId,
        n: usize,
        prompt_ids: Option<&[TokenId]>,
    ) -> Result<(), CacheError> {
        if !self.pool.can_allocate(n) {
            return Err(CacheError::OutOfBlocks {
                requested: n,
                available: self.pool.num_free(),
            });
        }
        let hashes = match prompt_ids {
            Some(ids) if self.enable_prefix_caching => block_hashes(ids, self.block_size),
            _ => Vec::new(),
        };

        let num_layers = self.num_layers;
        let table = self
            .tables
            .entry(seq_id)
            .or_insert_with(|| vec![Vec::new(); num_layers]);

        let (mut hits, mut misses, mut fresh_count) = (0usize, 0usize, 0usize);
        for _ in 0..n {
            let logical = table[0].len();
            let hash = hashes.get(logical).copied();

            if let Some(h) = hash {
                if let Some(cached) = self.prefix_index.get(h) {
                    self.pool.revive(cached);
                    self.pool.ref_add(cached, num_layers as u32);
                    for layer in table.iter_mut() {
                        layer.push(cached);
                    }
                    hits += 1;
                    continue;
                }
                misses += 1;
            }

            let fresh = self.pool.draw()?;
            if let Some(reclaimed) = fresh.reclaimed_hash {
                self.prefix_index.remove(reclaimed);
            }
            if let Some(h) = hash {
                self.pool.set_content_hash(fresh.block_id, h);
                self.prefix_index.insert(h, fresh.block_id);
            }
            self.pool.ref_add(fresh.block_id, num_layers as u32);
            for layer in table.iter_mut() {
                layer.push(fresh.block_id);
            }
            fresh_count += 1;
        }

        self.metrics.record_allocation(fresh_count);
        if hits + misses > 0 {
            self.metrics.record_cache_query(hits, misses);
        }
        Ok(())
    }

    /// Fresh blocks `append_slots` would need for `group` (growth plus
    /// copy-on-write duplications). Prefix-cache hits are not discounted, so
    /// the estimate is conservative.
    pub fn required_blocks_count(&self, group: &SequenceGroup) -> usize {
        let required = self.required_table_len(group);
        let mut needed = 0;
        for seq in group.running_sequences() {
            let Some(table) = self.tables.get(&seq.id()) else {
                needed += required;
                continue;
            };
            let len = table[0].len();
            needed += required.saturating_sub(len);

            let (first, end) = self.written_existing_range(group, len.min(required));
            for logical in first..end {
                let mut seen: Vec<BlockId> = Vec::new();
                for layer in table {
                    let id = layer[logical];
                    if seen.contains(&id) {
                        continue;
                    }
                    seen.push(id);
                    if self.pool.ref_count(id) > Self::own_refs_at(table, logical, id) {
                        needed += 1;
                    }
                }
            }
        }
        needed
    }

    /// Non-destructive check that `append_slots` would succeed.
    pub fn can_append_slots(&self, group: &SequenceGroup) -> bool {
        self.pool.can_allocate(self.required_blocks_count(group))
    }

    /// Make room for every running sequence's scheduled tokens.
    ///
    /// Grows tables as needed and copy-on-writes any shared block the new
    /// tokens would land in; the returned map tells the model runner which
    /// block contents to duplicate before the forward pass.
    pub fn append_slots(&mut self, group: &SequenceGroup) -> Result<BlockCopyMap, CacheError> {
        if !self.can_append_slots(group) {
            return Err(CacheError::OutOfBlocks {
                requested: self.required_blocks_count(group),
                available: self.pool.num_free(),
            });
        }

        let mut copy_map = BlockCopyMap::new();
        let required = self.required_table_len(group);
        // Hashing is only meaningful while logical indices line up with
        // prompt content, which eviction breaks.
        let prompt_ids: Option<Vec<TokenId>> = (group.num_evicted_tokens() == 0)
            .then(|| group.prompt_ids().to_vec());

        let seq_ids: Vec<SeqId> = group.running_sequences().map(|s| s.id()).collect();
        for seq_id in seq_ids {
            let len = self
                .tables
                .get(&seq_id)
                .map(|t| t[0].len())
                .unwrap_or(0);

            // Copy-on-write on existing blocks receiving writes
            let (first, end) = self.written_existing_range(group, len.min(required));
            for logical in first..end {
                self.copy_on_write(seq_id, logical, &mut copy_map)?;
            }

            if required > len {
                self.allocate(seq_id, required - len, prompt_ids.as_deref())?;
            }
        }
        Ok(copy_map)
    }

    fn copy_on_write(
        &mut self,
        seq_id: SeqId,
        logical: usize,
        copy_map: &mut BlockCopyMap,
    ) -> Result<(), CacheError> {
        let table = self
            .tables
            .get(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })?;

        let mut shared: Vec<BlockId> = Vec::new();
        for layer in table {
            let id = layer[logical];
            if shared.contains(&id) {
                continue;
            }
            if self.pool.ref_count(id) > Self::own_refs_at(table, logical, id) {
                shared.push(id);
            }
        }

        for src in shared {
            let fresh = self.pool.draw()?;
            if let Some(reclaimed) = fresh.reclaimed_hash {
                self.prefix_index.remove(reclaimed);
            }
            let dst = fresh.block_id;
            let table = self
                .tables
                .get_mut(&seq_id)
                .ok_or(CacheError::UnknownSequence { seq_id })?;
            let mut replaced = 0u32;
            for layer in table.iter_mut() {
                if layer[logical] == src {
                    layer[logical] = dst;
                    replaced += 1;
                }
            }
            self.pool.ref_add(dst, replaced);
            for _ in 0..replaced {
                self.pool.ref_release(src)?;
            }
            self.metrics.record_allocation(1);
            self.metrics.record_cow_copy();
            copy_map.entry(src).or_default().push(dst);
        }
        Ok(())
    }

    /// Duplicate `parent_id`'s table for `child_id`, bumping every block's
    /// reference count.
    pub fn fork_sequence(&mut self, parent_id: SeqId, child_id: SeqId) -> Result<(), CacheError> {
        let table = self
            .tables
            .get(&parent_id)
            .ok_or(CacheError::UnknownSequence { seq_id: parent_id })?
            .clone();
        for layer in &table {
            for &id in layer {
                self.pool.ref_add(id, 1);
            }
        }
        self.tables.insert(child_id, table);
        Ok(())
    }

    /// Release every block referenced by `seq_id`.
    ///
    /// Hashed blocks whose last reference disappears stay discoverable in
    /// the prefix index until the pool reclaims them.
    pub fn free_sequence(&mut self, seq_id: SeqId) -> Result<(), CacheError> {
        let table = self
            .tables
            .remove(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })?;
        let mut freed = 0;
        for layer in &table {
            for &id in layer {
                if self.pool.ref_release(id)? == 0 {
                    freed += 1;
                }
            }
        }
        self.metrics.record_free(freed);
        Ok(())
    }

    /// Eviction path: release specific logical indices, possibly different
    /// per layer but always the same count per layer.
    pub fn free_blocks_from_sequence(
        &mut self,
        seq_id: SeqId,
        per_layer_indices: &[BTreeSet<usize>],
    ) -> Result<(), CacheError> {
        if per_layer_indices.len() != self.num_layers {
            return Err(CacheError::LayerMismatch {
                expected: self.num_layers,
                found: per_layer_indices.len(),
            });
        }
        let table = self
            .tables
            .get_mut(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })?;

        let mut freed = 0;
        for (layer_idx, indices) in per_layer_indices.iter().enumerate() {
            for &logical in indices.iter().rev() {
                if logical >= table[layer_idx].len() {
                    continue;
                }
                let id = table[layer_idx].remove(logical);
                if self.pool.ref_release(id)? == 0 {
                    freed += 1;
                }
            }
        }
        self.metrics.record_eviction(freed);
        Ok(())
    }

    /// Restore prefix-cached blocks for a freshly admitted single-sequence
    /// group and advance its processed counter to the longest matched
    /// block-aligned prefix.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) -> Result<(), CacheError> {
        if !self.enable_prefix_caching {
            return Ok(());
        }
        let seq_id = group.sequences()[0].id();
        if self.tables.get(&seq_id).is_some_and(|t| !t[0].is_empty()) {
            return Ok(());
        }

        let hashes = block_hashes(group.prompt_ids(), self.block_size);
        let mut matched: Vec<BlockId> = Vec::new();
        for h in &hashes {
            match self.prefix_index.get(*h) {
                Some(id) => matched.push(id),
                None => break,
            }
        }
        self.metrics
            .record_cache_query(matched.len(), hashes.len() - matched.len());
        if matched.is_empty() {
            return Ok(());
        }

        let num_layers = self.num_layers;
        let table = self
            .tables
            .entry(seq_id)
            .or_insert_with(|| vec![Vec::new(); num_layers]);
        for &id in &matched {
            self.pool.revive(id);
            self.pool.ref_add(id, num_layers as u32);
            for layer in table.iter_mut() {
                layer.push(id);
            }
        }
        let restored_tokens = matched.len() * self.block_size;
        group.update_processed_tokens(restored_tokens);
        debug!(
            request_id = group.request_id(),
            restored_tokens, "restored prefix-cached blocks"
        );
        Ok(())
    }

    fn pop_last_block(&mut self, seq_id: SeqId) -> Result<(), CacheError> {
        let table = self
            .tables
            .get_mut(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })?;
        let mut freed = 0;
        for layer in table.iter_mut() {
            if let Some(id) = layer.pop() {
                if self.pool.ref_release(id)? == 0 {
                    freed += 1;
                }
            }
        }
        self.metrics.record_free(freed);
        Ok(())
    }

    /// Drop trailing logical blocks from every running sequence of `group`
    /// until `blocks_needed` depth levels are released or only the prompt's
    /// first block remains. Returns the number of levels released.
    pub fn free_group_partially(
        &mut self,
        group: &SequenceGroup,
        blocks_needed: usize,
    ) -> Result<usize, CacheError> {
        let seq_ids: Vec<SeqId> = group
            .running_sequences()
            .map(|s| s.id())
            .filter(|id| self.has_block_table(*id))
            .collect();
        if seq_ids.is_empty() {
            return Ok(0);
        }

        let mut released = 0;
        while released < blocks_needed {
            let min_len = seq_ids
                .iter()
                .map(|id| self.tables[id][0].len())
                .min()
                .unwrap_or(0);
            if min_len <= 1 {
                break;
            }
            for &seq_id in &seq_ids {
                self.pop_last_block(seq_id)?;
            }
            released += 1;
        }
        Ok(released)
    }

    /// Beam-search variant of partial freeing: first drop tail blocks unique
    /// to the highest-scored loser beams, then fall back to synchronized
    /// tail dropping.
    pub fn free_partially_beam_search_group(
        &mut self,
        group: &SequenceGroup,
        blocks_needed: usize,
    ) -> Result<usize, CacheError> {
        let mut seqs: Vec<(SeqId, f32)> = group
            .running_sequences()
            .filter(|s| self.has_block_table(s.id()))
            .map(|s| (s.id(), s.cumulative_log_prob()))
            .collect();
        seqs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut released = 0;
        // seqs[0] is the current best beam; the rest are losers
        for &(seq_id, _) in seqs.iter().skip(1) {
            while released < blocks_needed {
                let table = &self.tables[&seq_id];
                let len = table[0].len();
                if len <= 1 {
                    break;
                }
                let logical = len - 1;
                let unique = table.iter().all(|layer| {
                    let id = layer[logical];
                    self.pool.ref_count(id) == Self::own_refs_at(table, logical, id)
                });
                if !unique {
                    break;
                }
                self.pop_last_block(seq_id)?;
                released += 1;
            }
        }

        if released < blocks_needed {
            released += self.free_group_partially(group, blocks_needed - released)?;
        }
        Ok(released)
    }

    /// Total entries across every live block table; equals the pool's total
    /// reference count.
    pub fn total_table_entries(&self) -> u64 {
        self.tables
            .values()
            .flat_map(|table| table.iter())
            .map(|layer| layer.len() as u64)
            .sum()
    }

    /// Sum of all block reference counts.
    pub fn total_ref_count(&self) -> u64 {
        self.pool.total_ref_count()
    }
}
