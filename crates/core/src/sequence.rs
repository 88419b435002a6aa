//! Per-request generation state: sequences and sequence groups.
//!
//! A [`SequenceGroup`] is one client request; it owns one or more
//! [`Sequence`]s (more than one only under beam-search style forking) plus
//! the counters the scheduler and block manager operate on. Sequences refer
//! back to their group only through the group's `request_id`; there is no
//! back-ownership.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::pipeline::handle::{
    GenerationOutput, GenerationOutputs, GenerationStatus, GenerationStream,
};
use crate::sampling::SamplingParams;

pub type RequestId = u64;
pub type SeqId = u64;
pub type TokenId = u32;

static NEXT_SEQ_ID: AtomicU64 = AtomicU64::new(0);

fn next_seq_id() -> SeqId {
    NEXT_SEQ_ID.fetch_add(1, Ordering::Relaxed)
}

/// One generation stream within a request.
#[derive(Debug)]
pub struct Sequence {
    seq_id: SeqId,
    grouped_id: u64,
    generated_ids: Vec<TokenId>,
    generated_log_probs: Vec<f32>,
    status: GenerationStatus,
}

impl Sequence {
    fn new(grouped_id: u64) -> Self {
        Self {
            seq_id: next_seq_id(),
            grouped_id,
            generated_ids: Vec::new(),
            generated_log_probs: Vec::new(),
            status: GenerationStatus::Running,
        }
    }

    /// Clone this sequence's generated content under a fresh global id.
    fn fork(&self, grouped_id: u64) -> Self {
        Self {
            seq_id: next_seq_id(),
            grouped_id,
            generated_ids: self.generated_ids.clone(),
            generated_log_probs: self.generated_log_probs.clone(),
            status: GenerationStatus::Running,
        }
    }

    pub fn id(&self) -> SeqId {
        self.seq_id
    }

    /// Index of this sequence within its group, stable across forks/drops.
    pub fn grouped_id(&self) -> u64 {
        self.grouped_id
    }

    pub fn generated_ids(&self) -> &[TokenId] {
        &self.generated_ids
    }

    pub fn generated_log_probs(&self) -> &[f32] {
        &self.generated_log_probs
    }

    pub fn num_generated(&self) -> usize {
        self.generated_ids.len()
    }

    pub fn status(&self) -> GenerationStatus {
        self.status
    }

    pub fn set_status(&mut self, status: GenerationStatus) {
        self.status = status;
    }

    pub fn is_running(&self) -> bool {
        self.status == GenerationStatus::Running
    }

    pub fn append_token(&mut self, token_id: TokenId, log_prob: f32) {
        self.generated_ids.push(token_id);
        self.generated_log_probs.push(log_prob);
    }

    /// Pop the last `n` generated tokens, returning them in original order.
    pub fn remove_last_tokens(&mut self, n: usize) -> Vec<TokenId> {
        let keep = self.generated_ids.len().saturating_sub(n);
        self.generated_log_probs.truncate(keep);
        self.generated_ids.split_off(keep)
    }

    pub fn cumulative_log_prob(&self) -> f32 {
        self.generated_log_probs.iter().sum()
    }

    fn to_output(&self) -> GenerationOutput {
        GenerationOutput {
            generated_ids: self.generated_ids.clone(),
            generated_log_probs: self.generated_log_probs.clone(),
            score: self.cumulative_log_prob(),
            finished: self.status.is_terminal(),
        }
    }
}

/// One request: prompt, sampling parameters, sequences and the counters that
/// drive scheduling.
pub struct SequenceGroup {
    request_id: RequestId,
    prompt_ids: Vec<TokenId>,
    sampling_params: SamplingParams,
    sequences: Vec<Sequence>,
    /// Token positions whose KV state has been computed.
    num_processed_tokens: usize,
    /// Tokens scheduled for the in-flight step (per running sequence).
    num_scheduled_tokens: usize,
    /// Tokens whose blocks were reclaimed by score-driven eviction.
    num_evicted_tokens: usize,
    /// Set while the group is preempted within a scheduling pass.
    waiting: bool,
    /// Set by the multistep loop when the draft budget is exhausted.
    paused: bool,
    out_of_memory: bool,
    /// Tokens already pushed to the stream (single-sequence streaming).
    num_streamed_tokens: usize,
    next_grouped_id: u64,
    stream: Arc<GenerationStream>,
}

impl SequenceGroup {
    pub fn new(
        request_id: RequestId,
        prompt_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
        stream: Arc<GenerationStream>,
    ) -> Self {
        Self {
            request_id,
            prompt_ids,
            sampling_params,
            sequences: vec![Sequence::new(0)],
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
            num_evicted_tokens: 0,
            waiting: false,
            paused: false,
            out_of_memory: false,
            num_streamed_tokens: 0,
            next_grouped_id: 1,
            stream,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn prompt_ids(&self) -> &[TokenId] {
        &self.prompt_ids
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequences_mut(&mut self) -> &mut [Sequence] {
        &mut self.sequences
    }

    pub fn sequence(&self, seq_id: SeqId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.id() == seq_id)
    }

    pub fn sequence_mut(&mut self, seq_id: SeqId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.id() == seq_id)
    }

    pub fn has_sequence_with_id(&self, seq_id: SeqId) -> bool {
        self.sequence(seq_id).is_some()
    }

    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|s| s.is_running())
    }

    pub fn num_running_sequences(&self) -> usize {
        self.running_sequences().count()
    }

    /// Terminal sequences, best score first.
    pub fn finished_sequences(&self) -> Vec<&Sequence> {
        let mut finished: Vec<&Sequence> = self
            .sequences
            .iter()
            .filter(|s| s.status().is_terminal())
            .collect();
        finished.sort_by(|a, b| {
            b.cumulative_log_prob()
                .partial_cmp(&a.cumulative_log_prob())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        finished
    }

    /// Prompt length plus the longest generated tail among live sequences.
    pub fn context_len(&self) -> usize {
        let generated = self
            .sequences
            .iter()
            .filter(|s| s.is_running())
            .map(Sequence::num_generated)
            .max()
            .unwrap_or_else(|| {
                self.sequences
                    .iter()
                    .map(Sequence::num_generated)
                    .max()
                    .unwrap_or(0)
            });
        self.prompt_len() + generated
    }

    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    pub fn num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    pub fn num_evicted_tokens(&self) -> usize {
        self.num_evicted_tokens
    }

    /// Tokens this group could contribute to the next mega-batch.
    ///
    /// Normally `context_len - num_processed_tokens`. When a prompt was fully
    /// restored from the prefix cache the two are equal and nothing would be
    /// scheduled; the final position is recomputed instead so the model still
    /// produces logits for the first generated token.
    pub fn num_tokens_available_for_batching(&self) -> usize {
        let context = self.context_len();
        if context <= self.num_processed_tokens {
            return if self.has_finished() { 0 } else { 1 };
        }
        context - self.num_processed_tokens
    }

    /// A group can enter the generation phase once its whole prompt has been
    /// processed and it is neither paused, preempted nor terminal.
    pub fn can_generate_tokens(&self) -> bool {
        !self.paused
            && !self.waiting
            && !self.out_of_memory
            && !self.has_finished()
            && self.num_processed_tokens >= self.prompt_len()
    }

    pub fn schedule_tokens(&mut self, n: usize) {
        self.num_scheduled_tokens = n;
    }

    pub fn clear_scheduled_tokens(&mut self) {
        self.num_scheduled_tokens = 0;
    }

    pub fn has_scheduled_tokens(&self) -> bool {
        self.num_scheduled_tokens > 0
    }

    /// Commit the in-flight step: advance the processed counter by what was
    /// scheduled and reset the schedule.
    ///
    /// The counter is capped below `context_len`: the token the sampler just
    /// appended (or substituted after truncating a rejected tail) occupies
    /// the final position and its KV state has not been computed yet.
    pub fn finish_iteration(&mut self) {
        let computed_limit = self.context_len().saturating_sub(1);
        let advanced = self.num_processed_tokens + self.num_scheduled_tokens;
        self.num_processed_tokens = advanced.min(computed_limit).max(self.num_processed_tokens);
        self.num_scheduled_tokens = 0;
    }

    /// Roll the processed counter back by `n` tokens (preemption).
    pub fn preempt_tokens(&mut self, n: usize) {
        self.num_processed_tokens = self.num_processed_tokens.saturating_sub(n);
    }

    pub fn update_processed_tokens(&mut self, n: usize) {
        self.num_processed_tokens = n;
    }

    pub fn register_token_eviction(&mut self, num_tokens: usize) {
        self.num_evicted_tokens += num_tokens;
    }

    pub fn reset_eviction_count(&mut self) {
        self.num_evicted_tokens = 0;
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn set_waiting(&mut self) {
        self.waiting = true;
    }

    pub fn clear_waiting(&mut self) {
        self.waiting = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause_generation(&mut self, pause: bool) {
        self.paused = pause;
    }

    pub fn set_out_of_memory(&mut self) {
        self.out_of_memory = true;
        for seq in &mut self.sequences {
            if seq.is_running() {
                seq.set_status(GenerationStatus::OutOfMemory);
            }
        }
    }

    pub fn out_of_memory(&self) -> bool {
        self.out_of_memory
    }

    /// Every sequence reached a terminal state through normal generation.
    pub fn has_finished(&self) -> bool {
        self.sequences
            .iter()
            .all(|s| s.status() == GenerationStatus::Finished)
    }

    /// Fork `parent_seq_id` into a new running sequence; returns the child's
    /// global id. The caller is responsible for mirroring the fork in the
    /// block manager.
    pub fn fork_sequence(&mut self, parent_seq_id: SeqId) -> Option<SeqId> {
        let grouped_id = self.next_grouped_id;
        let child = self.sequence(parent_seq_id)?.fork(grouped_id);
        self.next_grouped_id += 1;
        let child_id = child.id();
        self.sequences.push(child);
        Some(child_id)
    }

    pub fn handle_dropped(&self) -> bool {
        self.stream.handle_dropped()
    }

    pub(crate) fn stream(&self) -> &Arc<GenerationStream> {
        &self.stream
    }

    /// Push a final empty frame so a blocked reader unblocks.
    pub fn push_empty_outputs(&self) {
        if !self.stream.status().is_terminal() {
            self.stream.set_status(GenerationStatus::Dropped);
        }
        self.stream.push_empty();
    }

    /// Publish progress to the request's stream.
    ///
    /// Terminal groups push one frame holding every finished sequence, best
    /// score first inside the map; single-sequence groups stream the tokens
    /// generated since the previous notification.
    pub fn notify_handle(&mut self) {
        if self.handle_dropped() {
            return;
        }
        if self.has_finished() || self.out_of_memory {
            let mut outputs = GenerationOutputs::new();
            for seq in self.finished_sequences() {
                outputs.insert(seq.grouped_id(), seq.to_output());
            }
            self.stream.set_status(if self.out_of_memory {
                GenerationStatus::OutOfMemory
            } else {
                GenerationStatus::Finished
            });
            self.stream.push(outputs);
        } else if self.sequences.len() == 1 && !self.sampling_params.is_beam_search() {
            let seq = &self.sequences[0];
            let len = seq.num_generated();
            if len > self.num_streamed_tokens {
                let mut outputs = GenerationOutputs::new();
                outputs.insert(
                    seq.grouped_id(),
                    GenerationOutput {
                        generated_ids: seq.generated_ids()[self.num_streamed_tokens..].to_vec(),
                        generated_log_probs: seq.generated_log_probs()
                            [self.num_streamed_tokens..]
                            .to_vec(),
                        score: seq.cumulative_log_prob(),
                        finished: false,
                    },
                );
                self.num_streamed_tokens = len;
                self.stream.push(outputs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(prompt_len: usize) -> SequenceGroup {
        let (stream, handle) = GenerationStream::create();
        std::mem::forget(handle); // keep the dropped flag clear
        SequenceGroup::new(
            0,
            vec![0; prompt_len],
            SamplingParams::greedy(8),
            stream,
        )
    }

    #[test]
    fn sequence_ids_are_globally_unique() {
        let a = Sequence::new(0);
        let b = Sequence::new(0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn append_and_remove_tokens() {
        let mut seq = Sequence::new(0);
        seq.append_token(5, -0.1);
        seq.append_token(7, -0.2);
        seq.append_token(9, -0.3);

        let removed = seq.remove_last_tokens(2);
        assert_eq!(removed, vec![7, 9]);
        assert_eq!(seq.generated_ids(), &[5]);
        assert_eq!(seq.generated_log_probs().len(), 1);
    }

    #[test]
    fn remove_more_than_present_clears() {
        let mut seq = Sequence::new(0);
        seq.append_token(1, 0.0);
        let removed = seq.remove_last_tokens(5);
        assert_eq!(removed, vec![1]);
        assert_eq!(seq.num_generated(), 0);
    }

    #[test]
    fn fork_copies_content_with_fresh_id() {
        let mut seq = Sequence::new(0);
        seq.append_token(3, -0.5);
        let child = seq.fork(1);
        assert_ne!(child.id(), seq.id());
        assert_eq!(child.grouped_id(), 1);
        assert_eq!(child.generated_ids(), seq.generated_ids());
    }

    #[test]
    fn new_group_single_running_sequence() {
        let g = group(5);
        assert_eq!(g.num_running_sequences(), 1);
        assert_eq!(g.context_len(), 5);
        assert!(!g.can_generate_tokens());
        assert_eq!(g.num_tokens_available_for_batching(), 5);
    }

    #[test]
    fn generation_phase_after_prompt_processed() {
        let mut g = group(5);
        g.schedule_tokens(5);
        g.sequences_mut()[0].append_token(42, 0.0);
        g.finish_iteration();
        assert_eq!(g.num_processed_tokens(), 5);
        assert!(g.can_generate_tokens());
        assert_eq!(g.num_tokens_available_for_batching(), 1);
    }

    #[test]
    fn finish_iteration_never_counts_the_appended_token() {
        let mut g = group(4);
        g.schedule_tokens(4);
        g.sequences_mut()[0].append_token(1, 0.0);
        g.finish_iteration();
        // 4 prompt + 1 generated; the generated token is not computed yet
        assert_eq!(g.num_processed_tokens(), 4);

        g.schedule_tokens(3); // over-scheduled on purpose
        g.finish_iteration();
        assert_eq!(g.num_processed_tokens(), 4);

        // processing the pending position and appending one more advances
        g.schedule_tokens(1);
        g.sequences_mut()[0].append_token(2, 0.0);
        g.finish_iteration();
        assert_eq!(g.num_processed_tokens(), 5);
    }

    #[test]
    fn fully_cached_prompt_still_schedules_one_token() {
        let mut g = group(8);
        g.update_processed_tokens(8);
        assert!(g.can_generate_tokens());
        assert_eq!(g.num_tokens_available_for_batching(), 1);
    }

    #[test]
    fn preempt_rolls_processed_back() {
        let mut g = group(6);
        g.update_processed_tokens(6);
        g.preempt_tokens(4);
        assert_eq!(g.num_processed_tokens(), 2);
        g.preempt_tokens(10);
        assert_eq!(g.num_processed_tokens(), 0);
    }

    #[test]
    fn waiting_and_paused_block_generation() {
        let mut g = group(2);
        g.update_processed_tokens(2);
        assert!(g.can_generate_tokens());

        g.set_waiting();
        assert!(!g.can_generate_tokens());
        g.clear_waiting();

        g.pause_generation(true);
        assert!(!g.can_generate_tokens());
        g.pause_generation(false);
        assert!(g.can_generate_tokens());
    }

    #[test]
    fn out_of_memory_marks_sequences() {
        let mut g = group(2);
        g.set_out_of_memory();
        assert!(g.out_of_memory());
        assert_eq!(
            g.sequences()[0].status(),
            GenerationStatus::OutOfMemory
        );
        assert!(!g.can_generate_tokens());
    }

    #[test]
    fn group_fork_assigns_grouped_ids() {
        let mut g = group(2);
        let parent = g.sequences()[0].id();
        let child = g.fork_sequence(parent).unwrap();
        assert_eq!(g.sequences().len(), 2);
        assert_eq!(g.sequence(child).unwrap().grouped_id(), 1);
        assert!(g.fork_sequence(9999).is_none());
    }

    #[test]
    fn finished_sequences_sorted_by_score() {
        let mut g = group(1);
        let parent = g.sequences()[0].id();
        let child = g.fork_sequence(parent).unwrap();

        g.sequence_mut(parent).unwrap().append_token(1, -2.0);
        g.sequence_mut(child).unwrap().append_token(2, -0.5);
        for seq in g.sequences_mut() {
            seq.set_status(GenerationStatus::Finished);
        }

        let finished = g.finished_sequences();
        assert_eq!(finished[0].generated_ids(), &[2]);
        assert_eq!(finished[1].generated_ids(), &[1]);
    }

}
