//! The iteration scheduler.
//!
//! Each step the scheduler decides which groups advance, by how many tokens,
//! and how their KV state fits into the block pool. Two policies exist:
//!
//! * **vLLM mode** (`dynamic_split_fuse = false`): whole prompts are
//!   admitted first; a step is either a dedicated prompt phase or a
//!   generation phase, never both.
//! * **dynamic split-fuse**: generation is scheduled first, then prompt
//!   *chunks* fill whatever remains of the mega-batch, so one prompt may be
//!   spread across several steps.
//!
//! When the pool cannot satisfy a generation step, lower-priority groups
//! (later in the active set) are preempted by recompute: their tail blocks
//! are released and their processed-token counters rolled back so the next
//! admission recomputes them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{internal, EngineError};
use crate::eviction::CacheEvictionConfig;
use crate::kv_cache::{BlockCopyMap, BlockManager, BlockTables};
use crate::sequence::{SeqId, SequenceGroup};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hard cap on tokens scheduled per step (the mega-batch).
    pub max_num_batched_tokens: usize,
    /// Hard cap on concurrently running request groups (vLLM mode).
    pub max_num_seqs: usize,
    pub block_size: usize,
    pub num_kv_blocks: usize,
    /// Policy switch; see the module docs.
    pub dynamic_split_fuse: bool,
    /// Hash-based block reuse across requests sharing a prompt prefix.
    pub enable_prefix_caching: bool,
    /// Attention-score-driven eviction of intermediate blocks.
    pub use_cache_eviction: bool,
    pub cache_eviction_config: CacheEvictionConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 2048,
            max_num_seqs: 256,
            block_size: 16,
            num_kv_blocks: 1024,
            dynamic_split_fuse: false,
            enable_prefix_caching: false,
            use_cache_eviction: false,
            cache_eviction_config: CacheEvictionConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.block_size == 0 || self.num_kv_blocks == 0 {
            return Err(EngineError::Validation(
                "block_size and num_kv_blocks must be non-zero".into(),
            ));
        }
        if self.max_num_seqs > self.max_num_batched_tokens {
            return Err(EngineError::Validation(format!(
                "max_num_batched_tokens ({}) must be >= max_num_seqs ({})",
                self.max_num_batched_tokens, self.max_num_seqs
            )));
        }
        Ok(())
    }
}

/// One scheduling decision.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Indices into the active set, in scheduling order.
    pub scheduled_group_ids: Vec<usize>,
    /// Copy-on-write directives the model runner must apply before reading.
    pub block_copy_map: BlockCopyMap,
    /// Per-layer block tables for every scheduled sequence.
    pub block_tables: HashMap<SeqId, BlockTables>,
    pub total_num_scheduled_tokens: usize,
    /// Whether this step is a dedicated prompt phase (vLLM mode).
    pub is_prompt: bool,
    /// Pool usage after scheduling, in `[0, 1]`.
    pub cache_usage: f32,
}

pub struct Scheduler {
    can_use_partial_preemption: bool,
    config: SchedulerConfig,
    block_manager: BlockManager,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, num_layers: usize) -> Self {
        Self::with_partial_preemption(config, num_layers, true)
    }

    pub fn with_partial_preemption(
        config: SchedulerConfig,
        num_layers: usize,
        can_use_partial_preemption: bool,
    ) -> Self {
        let block_manager = BlockManager::new(
            config.num_kv_blocks,
            config.enable_prefix_caching,
            config.block_size,
            num_layers,
        );
        Self {
            can_use_partial_preemption,
            config,
            block_manager,
        }
    }

    pub fn get_config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn block_manager_mut(&mut self) -> &mut BlockManager {
        &mut self.block_manager
    }

    /// Produce one scheduling decision over the active set.
    ///
    /// Groups earlier in the slice have higher priority; preemption victims
    /// are always picked from behind the group that needs room.
    pub fn schedule(
        &mut self,
        sequence_groups: &mut [SequenceGroup],
    ) -> Result<SchedulerOutput, EngineError> {
        let mut output = SchedulerOutput::default();

        if self.config.dynamic_split_fuse {
            // generation is always scheduled first, prompt chunks fill the rest
            self.schedule_generate_phase(sequence_groups, &mut output)?;
            self.schedule_prompt_phase_dynamic_split_fuse(sequence_groups, &mut output)?;
        } else {
            self.schedule_prompt_phase_vllm(sequence_groups, &mut output)?;
            if !output.is_prompt {
                self.schedule_generate_phase(sequence_groups, &mut output)?;
            }
        }

        for group in sequence_groups.iter_mut() {
            group.clear_waiting();
        }
        output.cache_usage = self.block_manager.get_used_percentage();
        Ok(output)
    }

    // ---- delegation to the block manager ----

    pub fn has_block_table(&self, seq_id: SeqId) -> bool {
        self.block_manager.has_block_table(seq_id)
    }

    pub fn get_block_tables(&self, seq_id: SeqId) -> Option<&BlockTables> {
        self.block_manager.get_block_tables(seq_id)
    }

    pub fn free_sequence(&mut self, seq_id: SeqId) -> Result<(), EngineError> {
        self.block_manager.free_sequence(seq_id)?;
        Ok(())
    }

    pub fn fork_sequence(&mut self, parent_id: SeqId, child_id: SeqId) -> Result<(), EngineError> {
        self.block_manager.fork_sequence(parent_id, child_id)?;
        Ok(())
    }

    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) -> Result<(), EngineError> {
        self.block_manager.restore_cached_blocks(group)?;
        Ok(())
    }

    pub fn free_blocks_from_sequence(
        &mut self,
        seq_id: SeqId,
        per_layer_indices: &[std::collections::BTreeSet<usize>],
    ) -> Result<(), EngineError> {
        self.block_manager
            .free_blocks_from_sequence(seq_id, per_layer_indices)?;
        Ok(())
    }

    // ---- internals ----

    fn schedulable(group: &SequenceGroup) -> bool {
        !group.has_finished()
            && !group.out_of_memory()
            && !group.handle_dropped()
            && !group.is_waiting()
    }

    /// Last group in the active set that still holds KV blocks worth
    /// reclaiming.
    fn lowest_priority_group_id(sequence_groups: &[SequenceGroup]) -> Option<usize> {
        sequence_groups
            .iter()
            .rposition(|g| g.num_processed_tokens() > 0)
    }

    fn apply_preemption(
        &mut self,
        group_id: usize,
        sequence_groups: &mut [SequenceGroup],
    ) -> Result<(), EngineError> {
        while !self.block_manager.can_append_slots(&sequence_groups[group_id]) {
            let Some(victim_id) = Self::lowest_priority_group_id(sequence_groups) else {
                break;
            };
            if victim_id <= group_id {
                // the current group would have to evict itself; give up
                break;
            }
            let blocks_needed = self
                .block_manager
                .required_blocks_count(&sequence_groups[group_id]);
            if !self.preempt_by_recompute(&mut sequence_groups[victim_id], blocks_needed)? {
                break;
            }
        }
        Ok(())
    }

    /// Reclaim KV blocks from `victim` so another group can run.
    ///
    /// Frees everything (full recompute) when the victim is small, partial
    /// preemption is disabled, or the victim was ever evicted-from;
    /// otherwise drops the tail of its tables and rolls the processed
    /// counter back accordingly. Returns whether any blocks were freed.
    fn preempt_by_recompute(
        &mut self,
        victim: &mut SequenceGroup,
        blocks_needed: usize,
    ) -> Result<bool, EngineError> {
        let processed_tokens = victim.num_processed_tokens();
        let block_size = self.config.block_size;
        let prev_free_blocks = self.block_manager.num_free_blocks();
        let occupied_blocks = self.block_manager.blocks_occupied_by_group(victim);
        let was_evicted_from = victim.num_evicted_tokens() != 0;

        if occupied_blocks <= blocks_needed || !self.can_use_partial_preemption || was_evicted_from
        {
            let seq_ids: Vec<SeqId> = victim.sequences().iter().map(|s| s.id()).collect();
            for seq_id in seq_ids {
                if self.block_manager.has_block_table(seq_id) {
                    self.block_manager.free_sequence(seq_id)?;
                }
            }
            victim.preempt_tokens(processed_tokens);
            if was_evicted_from {
                victim.reset_eviction_count();
            }
            victim.set_waiting();
            debug!(
                request_id = victim.request_id(),
                preempted_tokens = processed_tokens,
                "full preemption by recompute"
            );
            return Ok(self.block_manager.num_free_blocks() > prev_free_blocks);
        }

        let logical_blocks_released = if victim.sampling_params().is_beam_search() {
            self.block_manager
                .free_partially_beam_search_group(victim, blocks_needed)?
        } else {
            self.block_manager.free_group_partially(victim, blocks_needed)?
        };

        let mut tokens_in_last_block = processed_tokens % block_size;
        if tokens_in_last_block == 0 {
            tokens_in_last_block = block_size;
        }
        let mut preempted_tokens =
            tokens_in_last_block + logical_blocks_released.saturating_sub(1) * block_size;

        // In vLLM mode a partially processed prompt cannot be resumed; fall
        // back to recomputing the whole request.
        if !self.config.dynamic_split_fuse
            && processed_tokens - preempted_tokens.min(processed_tokens) < victim.prompt_len()
        {
            preempted_tokens = processed_tokens;
            let seq_ids: Vec<SeqId> = victim.sequences().iter().map(|s| s.id()).collect();
            for seq_id in seq_ids {
                if self.block_manager.has_block_table(seq_id) {
                    self.block_manager.free_sequence(seq_id)?;
                }
            }
        }
        victim.preempt_tokens(preempted_tokens);
        victim.set_waiting();
        debug!(
            request_id = victim.request_id(),
            preempted_tokens, logical_blocks_released, "partial preemption by recompute"
        );
        Ok(self.block_manager.num_free_blocks() > prev_free_blocks)
    }

    fn record_scheduled_group(
        &self,
        group_id: usize,
        group: &SequenceGroup,
        copy_map: BlockCopyMap,
        scheduled_tokens: usize,
        output: &mut SchedulerOutput,
    ) {
        output.scheduled_group_ids.push(group_id);
        output.total_num_scheduled_tokens += scheduled_tokens;
        for seq in group.running_sequences() {
            if let Some(tables) = self.block_manager.get_block_tables(seq.id()) {
                output.block_tables.insert(seq.id(), tables.clone());
            }
        }
        for (src, dsts) in copy_map {
            output.block_copy_map.entry(src).or_default().extend(dsts);
        }
    }

    fn schedule_generate_phase(
        &mut self,
        sequence_groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) -> Result<(), EngineError> {
        for group_id in 0..sequence_groups.len() {
            if !Self::schedulable(&sequence_groups[group_id])
                || !sequence_groups[group_id].can_generate_tokens()
            {
                continue;
            }

            let num_running_seqs = sequence_groups[group_id].num_running_sequences();
            if num_running_seqs == 0 {
                continue;
            }
            let tokens_in_megabatch =
                self.config.max_num_batched_tokens - output.total_num_scheduled_tokens;
            let available_per_seq_in_megabatch = tokens_in_megabatch / num_running_seqs;
            // cannot schedule even a single token per sequence of the group
            if available_per_seq_in_megabatch == 0 {
                continue;
            }

            // can exceed 1 when tokens of this group were evicted or appended
            // for verification earlier
            let num_available_per_seq =
                sequence_groups[group_id].num_tokens_available_for_batching();
            let scheduled_per_seq = available_per_seq_in_megabatch.min(num_available_per_seq);
            sequence_groups[group_id].schedule_tokens(scheduled_per_seq);

            self.apply_preemption(group_id, sequence_groups)?;

            if !self.block_manager.can_append_slots(&sequence_groups[group_id]) {
                sequence_groups[group_id].clear_scheduled_tokens();
                continue;
            }

            let copy_map = self.block_manager.append_slots(&sequence_groups[group_id])?;
            self.record_scheduled_group(
                group_id,
                &sequence_groups[group_id],
                copy_map,
                scheduled_per_seq * num_running_seqs,
                output,
            );

            if output.total_num_scheduled_tokens >= self.config.max_num_batched_tokens {
                break;
            }
        }
        Ok(())
    }

    fn schedule_prompt_phase_dynamic_split_fuse(
        &mut self,
        sequence_groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) -> Result<(), EngineError> {
        for group_id in 0..sequence_groups.len() {
            if !Self::schedulable(&sequence_groups[group_id])
                || sequence_groups[group_id].can_generate_tokens()
            {
                continue;
            }

            let group = &sequence_groups[group_id];
            if group.num_running_sequences() != 1 {
                return Err(internal("prompt phase requires a single running sequence"));
            }
            let seq_id = group.sequences()[0].id();

            let tokens_in_megabatch =
                self.config.max_num_batched_tokens - output.total_num_scheduled_tokens;
            let num_available_tokens = group.num_tokens_available_for_batching();
            let mut num_scheduled_tokens = tokens_in_megabatch.min(num_available_tokens);

            // apply KV cache limitations
            let allocated_slots = self.block_manager.table_len(seq_id) * self.config.block_size;
            let occupied_slots = group.num_processed_tokens() - group.num_evicted_tokens();
            if allocated_slots < occupied_slots {
                return Err(internal("allocated slots below occupied slots"));
            }
            let available_slots = allocated_slots - occupied_slots;
            let required_slots = num_scheduled_tokens.saturating_sub(available_slots);
            let num_required_blocks = required_slots.div_ceil(self.config.block_size);
            let num_scheduled_blocks =
                num_required_blocks.min(self.block_manager.num_free_blocks());
            // trailing scheduled blocks may end up only partially occupied
            num_scheduled_tokens = num_scheduled_tokens
                .min(available_slots + num_scheduled_blocks * self.config.block_size);

            if num_scheduled_tokens > 0 {
                if num_scheduled_blocks > 0 {
                    let prompt_ids = (sequence_groups[group_id].num_evicted_tokens() == 0)
                        .then(|| sequence_groups[group_id].prompt_ids().to_vec());
                    self.block_manager.allocate(
                        seq_id,
                        num_scheduled_blocks,
                        prompt_ids.as_deref(),
                    )?;
                }
                sequence_groups[group_id].schedule_tokens(num_scheduled_tokens);
                self.record_scheduled_group(
                    group_id,
                    &sequence_groups[group_id],
                    BlockCopyMap::new(),
                    num_scheduled_tokens,
                    output,
                );
            }

            if output.total_num_scheduled_tokens >= self.config.max_num_batched_tokens {
                break;
            }
        }
        Ok(())
    }

    fn schedule_prompt_phase_vllm(
        &mut self,
        sequence_groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) -> Result<(), EngineError> {
        if !output.scheduled_group_ids.is_empty() {
            return Err(internal("vLLM prompt phase must run first"));
        }

        let mut num_running_groups = sequence_groups
            .iter()
            .filter(|g| g.can_generate_tokens())
            .count();

        for group_id in 0..sequence_groups.len() {
            // groups that were fully preempted while partial preemption is
            // off are recomputed through the prompt phase as well
            let recompute_evicted = sequence_groups[group_id].num_processed_tokens() == 0
                && !self.can_use_partial_preemption;
            if !Self::schedulable(&sequence_groups[group_id])
                || (sequence_groups[group_id].can_generate_tokens() && !recompute_evicted)
            {
                continue;
            }

            let group = &sequence_groups[group_id];
            if group.num_running_sequences() != 1 && !group.sampling_params().is_speculative() {
                return Err(internal("prompt phase requires a single running sequence"));
            }

            let tokens_in_megabatch =
                self.config.max_num_batched_tokens - output.total_num_scheduled_tokens;
            let sequence_len = group.num_tokens_available_for_batching();
            if sequence_len == 0 {
                continue;
            }

            // admission limits: whole prompts only
            if num_running_groups >= self.config.max_num_seqs {
                break;
            }
            if tokens_in_megabatch < sequence_len {
                break;
            }
            let num_required_blocks = sequence_len.div_ceil(self.config.block_size);
            if !self.block_manager.can_allocate_blocks(num_required_blocks) {
                break;
            }

            let seq_id = sequence_groups[group_id].sequences()[0].id();
            sequence_groups[group_id].schedule_tokens(sequence_len);
            let copy_map = self.block_manager.append_slots(&sequence_groups[group_id])?;

            self.record_scheduled_group(
                group_id,
                &sequence_groups[group_id],
                copy_map,
                sequence_len,
                output,
            );
            debug!(
                request_id = sequence_groups[group_id].request_id(),
                seq_id, sequence_len, "admitted prompt"
            );
            output.is_prompt = true;
            num_running_groups += 1;
        }
        Ok(())
    }
}
