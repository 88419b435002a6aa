//! The continuous-batching pipeline loop.
//!
//! Producer threads enqueue requests through [`ContinuousBatchingPipeline::add_request`];
//! a single consumer thread drives [`ContinuousBatchingPipeline::step`], which pulls the
//! awaiting queue, schedules, runs the model, optionally evicts cache
//! blocks, samples, applies fork/free directives and reaps finished
//! requests. The only cross-thread structures are the awaiting queue and
//! the per-request output streams.

pub mod handle;
pub mod metrics;
mod speculative;
mod streamer;

pub use handle::{GenerationHandle, GenerationOutput, GenerationOutputs, GenerationStatus};
pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use speculative::{PipelineDesc, SpeculativeDecodingMetrics, SpeculativeDecodingPipeline};
pub use streamer::{Streamer, StreamerBase, TextCallbackStreamer};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{internal, EngineError};
use crate::eviction::CacheEvictionScores;
use crate::model::ModelRunner;
use crate::sampling::{NumAssistantTokensSchedule, Sampler, SamplingParams};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::sequence::{RequestId, SeqId, SequenceGroup, TokenId};
use crate::tokenizer::Tokenizer;
use handle::GenerationStream;

/// Generated tokens of one sequence, exchanged between the speculative
/// coordinator's two pipelines.
#[derive(Debug, Clone, Default)]
pub struct GeneratedSequence {
    pub token_ids: Vec<TokenId>,
    pub log_probs: Vec<f32>,
}

/// Grouped id → generated sequence.
pub type GeneratedSequences = HashMap<u64, GeneratedSequence>;
/// Request id → its sequences.
pub type GeneratedRequests = HashMap<RequestId, GeneratedSequences>;

/// Outcome of a sequence-diff update (§ speculative resync).
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateRequestResult {
    pub inserted_tokens: usize,
    pub removed_tokens: usize,
}

/// Final result of one request in `generate()`.
#[derive(Debug, Clone)]
pub struct EncodedGenerationResult {
    pub request_id: RequestId,
    /// Up to `num_return_sequences` outputs, best score first.
    pub generation_ids: Vec<Vec<TokenId>>,
    pub scores: Vec<f32>,
    pub status: GenerationStatus,
}

pub struct ContinuousBatchingPipeline {
    tokenizer: Arc<dyn Tokenizer>,
    model_runner: Box<dyn ModelRunner>,
    sampler: Box<dyn Sampler>,
    scheduler: Scheduler,
    /// The active set, owned by the pipeline thread.
    requests: Vec<SequenceGroup>,
    /// Producer-side queue; ownership transfers under this mutex.
    awaiting: Mutex<Vec<SequenceGroup>>,
    eviction_state: HashMap<SeqId, CacheEvictionScores>,
    metrics: PipelineMetrics,
    /// Speculative main pipelines sample in validation mode and never run
    /// the draft multistep loop.
    is_validation_mode: bool,
    poisoned: bool,
}

impl ContinuousBatchingPipeline {
    pub fn new(
        model_runner: Box<dyn ModelRunner>,
        sampler: Box<dyn Sampler>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SchedulerConfig,
        num_layers: usize,
    ) -> Result<Self, EngineError> {
        Self::with_validation_mode(model_runner, sampler, tokenizer, config, num_layers, false)
    }

    pub fn with_validation_mode(
        model_runner: Box<dyn ModelRunner>,
        sampler: Box<dyn Sampler>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SchedulerConfig,
        num_layers: usize,
        is_validation_mode: bool,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            tokenizer,
            model_runner,
            sampler,
            scheduler: Scheduler::new(config, num_layers),
            requests: Vec::new(),
            awaiting: Mutex::new(Vec::new()),
            eviction_state: HashMap::new(),
            metrics: PipelineMetrics::new(),
            is_validation_mode,
            poisoned: false,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn get_metrics(&self) -> PipelineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn num_active_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn is_requests_empty(&self) -> bool {
        self.requests.is_empty() && self.awaiting.lock().is_empty()
    }

    /// Enqueue a text prompt.
    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt: &str,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        let token_ids = self.tokenizer.encode(prompt);
        self.add_request_with_ids(request_id, token_ids, sampling_params)
    }

    /// Enqueue a pre-tokenized prompt.
    pub fn add_request_with_ids(
        &self,
        request_id: RequestId,
        token_ids: Vec<TokenId>,
        mut sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        if sampling_params.eos_token_id.is_none() {
            sampling_params.eos_token_id = Some(self.tokenizer.eos_token_id());
        }
        sampling_params.validate()?;
        if token_ids.is_empty() {
            return Err(EngineError::Validation("prompt must not be empty".into()));
        }
        let config = self.scheduler.get_config();
        if !config.dynamic_split_fuse && token_ids.len() > config.max_num_batched_tokens {
            return Err(EngineError::Validation(format!(
                "prompt of {} tokens exceeds max_num_batched_tokens ({}); \
                 enable dynamic_split_fuse to chunk long prompts",
                token_ids.len(),
                config.max_num_batched_tokens
            )));
        }

        let (stream, handle) = GenerationStream::create();
        let group = SequenceGroup::new(request_id, token_ids, sampling_params, stream);
        self.awaiting.lock().push(group);
        Ok(handle)
    }

    pub fn has_non_finished_requests(&self) -> bool {
        !self.awaiting.lock().is_empty() || !self.requests.is_empty()
    }

    fn pull_awaiting_requests(&mut self) -> Result<(), EngineError> {
        let pulled: Vec<SequenceGroup> = {
            let mut queue = self.awaiting.lock();
            queue.drain(..).collect()
        };
        let mut pulled = pulled;
        if self.scheduler.get_config().enable_prefix_caching {
            for group in &mut pulled {
                self.scheduler.restore_cached_blocks(group)?;
            }
        }
        self.requests.extend(pulled);
        for request in &mut self.requests {
            request.pause_generation(false);
        }
        Ok(())
    }

    /// Advance the pipeline one iteration.
    ///
    /// For draft-side speculative groups the internal loop keeps iterating
    /// until every group either exhausts its assistant-token budget or can
    /// no longer generate; all other workloads run exactly one iteration.
    pub fn step(&mut self) -> Result<(), EngineError> {
        if self.poisoned {
            return Err(EngineError::Poisoned);
        }
        match self.step_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    fn step_inner(&mut self) -> Result<(), EngineError> {
        self.pull_awaiting_requests()?;
        self.metrics.requests = self.requests.len();

        let mut iteration_number = 0usize;
        let mut to_generate = true;
        while to_generate {
            let scheduler_output = self.scheduler.schedule(&mut self.requests)?;
            self.metrics.scheduled_requests = scheduler_output.scheduled_group_ids.len();
            self.metrics
                .register_step_cache_usage(scheduler_output.cache_usage);

            // no tokens scheduled at all: the cache cannot host a single
            // token, fail every active request
            if scheduler_output.total_num_scheduled_tokens == 0 {
                self.notify_requests_dropped_by_handle();
                let mut num_failed = 0;
                for group in &mut self.requests {
                    if group.handle_dropped() || group.has_finished() {
                        continue;
                    }
                    group.set_out_of_memory();
                    group.notify_handle();
                    num_failed += 1;
                }
                if num_failed > 0 {
                    warn!(num_failed, "cache exhausted, failing all active requests");
                }
                self.free_non_running_requests()?;
                return Ok(());
            }

            let logits = self
                .model_runner
                .forward(&self.requests, &scheduler_output)?;

            if self.scheduler.get_config().use_cache_eviction {
                self.maybe_evict_cache_blocks()?;
            }

            let sampler_output = self.sampler.sample(
                &mut self.requests,
                &scheduler_output,
                &logits,
                self.is_validation_mode,
            )?;

            // fork/drop directives feed back into the block manager
            for (parent_id, child_ids) in &sampler_output.forked_sequences {
                for &child_id in child_ids {
                    self.scheduler.fork_sequence(*parent_id, child_id)?;
                }
            }
            for seq_id in &sampler_output.dropped_sequences {
                if self.scheduler.has_block_table(*seq_id) {
                    self.scheduler.free_sequence(*seq_id)?;
                }
                self.eviction_state.remove(seq_id);
            }

            // commit counters and publish freshly generated tokens
            for &group_id in &scheduler_output.scheduled_group_ids {
                let group = &mut self.requests[group_id];
                group.finish_iteration();
                group.notify_handle();
            }

            self.notify_requests_dropped_by_handle();

            // iterate only while some group still holds draft tokens to
            // produce; validation-mode (speculative main) steps run once
            to_generate = false;
            if !self.is_validation_mode {
                for group in &mut self.requests {
                    let params = group.sampling_params().clone();
                    if !params.is_speculative() {
                        to_generate = false;
                        break;
                    }
                    match params.num_assistant_tokens_schedule {
                        NumAssistantTokensSchedule::Constant => {
                            if params.num_assistant_tokens <= iteration_number {
                                group.pause_generation(true);
                            }
                        }
                        NumAssistantTokensSchedule::Dynamic => {
                            let threshold = params.assistant_confidence_threshold;
                            let last_log_prob = group.sequences()[0]
                                .generated_log_probs()
                                .last()
                                .copied();
                            if threshold > 0.0
                                && last_log_prob.is_some_and(|lp| lp < threshold.ln())
                            {
                                group.pause_generation(true);
                            }
                        }
                    }
                    to_generate |= group.can_generate_tokens();
                }
            }
            iteration_number += 1;
        }

        self.free_non_running_requests()?;
        Ok(())
    }

    fn notify_requests_dropped_by_handle(&self) {
        // push one empty frame so a blocked reader returns
        for request in &self.requests {
            if request.handle_dropped() {
                request.push_empty_outputs();
            }
        }
    }

    fn free_non_running_requests(&mut self) -> Result<(), EngineError> {
        let mut i = 0;
        while i < self.requests.len() {
            let reap = {
                let request = &self.requests[i];
                request.has_finished() || request.out_of_memory() || request.handle_dropped()
            };
            if !reap {
                i += 1;
                continue;
            }
            let request = self.requests.remove(i);
            for seq in request.sequences() {
                if self.scheduler.has_block_table(seq.id()) {
                    self.scheduler.free_sequence(seq.id())?;
                }
                self.eviction_state.remove(&seq.id());
            }
            self.sampler.clear_beam_search_info(request.request_id());
            debug!(request_id = request.request_id(), "reaped request");
        }
        Ok(())
    }

    fn maybe_evict_cache_blocks(&mut self) -> Result<(), EngineError> {
        let Some(attention_scores) = self.model_runner.last_attention_scores() else {
            return Ok(());
        };
        let eviction_config = self.scheduler.get_config().cache_eviction_config;
        let block_size = self.scheduler.get_config().block_size;
        let num_layers = self.scheduler.block_manager().num_layers();

        let mut evicted_per_group: HashMap<usize, usize> = HashMap::new();
        for (seq_id, layer_scores) in &attention_scores {
            let Some(group_idx) = self
                .requests
                .iter()
                .position(|g| g.has_sequence_with_id(*seq_id))
            else {
                continue;
            };

            let group = &self.requests[group_idx];
            let occupied = group.num_processed_tokens() - group.num_evicted_tokens();
            let num_full_blocks = occupied / block_size;

            let state = self
                .eviction_state
                .entry(*seq_id)
                .or_insert_with(|| CacheEvictionScores::new(eviction_config, num_layers));
            state.register_token_scores(layer_scores);
            let to_evict = state.evict_logical_blocks(num_full_blocks);

            let num_blocks_evicted = to_evict[0].len();
            if num_blocks_evicted > 0 {
                self.scheduler.free_blocks_from_sequence(*seq_id, &to_evict)?;
            }
            match evicted_per_group.entry(group_idx) {
                Entry::Occupied(entry) => {
                    if *entry.get() != num_blocks_evicted {
                        return Err(internal(
                            "sequences of one group evicted different block counts",
                        ));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(num_blocks_evicted);
                }
            }
        }

        for (group_idx, num_blocks) in evicted_per_group {
            if num_blocks > 0 {
                let group = &mut self.requests[group_idx];
                group.register_token_eviction(num_blocks * block_size);
                debug!(
                    request_id = group.request_id(),
                    num_blocks, "evicted low-attention blocks"
                );
            }
        }
        Ok(())
    }

    /// Snapshot generated tokens of every tracked request (speculative
    /// coordinator exchange format).
    pub fn get_generated_requests(&mut self) -> Result<GeneratedRequests, EngineError> {
        self.pull_awaiting_requests()?;
        let mut result = GeneratedRequests::new();
        for request in &self.requests {
            let sequences: GeneratedSequences = request
                .sequences()
                .iter()
                .map(|seq| {
                    (
                        seq.grouped_id(),
                        GeneratedSequence {
                            token_ids: seq.generated_ids().to_vec(),
                            log_probs: seq.generated_log_probs().to_vec(),
                        },
                    )
                })
                .collect();
            result.insert(request.request_id(), sequences);
        }
        Ok(result)
    }

    /// Align a request's generated tokens with `candidates`: truncate the
    /// divergent tail, append the missing suffix, and roll the processed
    /// counter back so truncated KV state is recomputed.
    ///
    /// Only the group's first sequence participates; multi-sequence
    /// speculative verification is a gated feature.
    pub fn update_request(
        &mut self,
        request_id: RequestId,
        candidates: &GeneratedSequences,
        _is_validated: bool,
    ) -> Result<UpdateRequestResult, EngineError> {
        self.pull_awaiting_requests()?;
        let Some(group_idx) = self
            .requests
            .iter()
            .position(|g| g.request_id() == request_id)
        else {
            return Ok(UpdateRequestResult::default());
        };

        let group = &mut self.requests[group_idx];
        let grouped_id = group.sequences()[0].grouped_id();
        let Some(candidate) = candidates.get(&grouped_id) else {
            return Ok(UpdateRequestResult::default());
        };

        let seq = &mut group.sequences_mut()[0];
        let present_len = seq.num_generated();
        let common = longest_common_prefix(seq.generated_ids(), &candidate.token_ids);

        let to_remove = present_len - common;
        if to_remove > 0 {
            let removed = seq.remove_last_tokens(to_remove);
            self.sampler.on_tokens_removed(request_id, &removed);
        }

        let group = &mut self.requests[group_idx];
        let seq = &mut group.sequences_mut()[0];
        let to_insert = candidate.token_ids.len() - common;
        for i in common..candidate.token_ids.len() {
            let log_prob = candidate.log_probs.get(i).copied().unwrap_or(0.0);
            seq.append_token(candidate.token_ids[i], log_prob);
        }

        if to_remove > 0 {
            // everything from the first changed position on has to be
            // recomputed; a fully invalidated context rolls back to the
            // prompt boundary
            let recompute_from = group.prompt_len() + common;
            group.update_processed_tokens(group.num_processed_tokens().min(recompute_from));
        }

        Ok(UpdateRequestResult {
            inserted_tokens: to_insert,
            removed_tokens: to_remove,
        })
    }

    /// Finish one request (or all), releasing blocks and sampler state and
    /// unblocking any pending reader.
    pub fn finish_request(&mut self, request_id: Option<RequestId>) {
        {
            let mut awaiting = self.awaiting.lock();
            awaiting.retain(|group| {
                let matches = request_id.is_none_or(|id| group.request_id() == id);
                if matches {
                    group.push_empty_outputs();
                }
                !matches
            });
        }

        let mut i = 0;
        while i < self.requests.len() {
            let matches = request_id.is_none_or(|id| self.requests[i].request_id() == id);
            if !matches {
                i += 1;
                continue;
            }
            let request = self.requests.remove(i);
            for seq in request.sequences() {
                if self.scheduler.has_block_table(seq.id()) {
                    let _ = self.scheduler.free_sequence(seq.id());
                }
                self.eviction_state.remove(&seq.id());
            }
            self.sampler.clear_beam_search_info(request.request_id());
            request.push_empty_outputs();
        }
    }

    /// Run every queued request to completion.
    pub fn generate(
        &mut self,
        batch_token_ids: Vec<Vec<TokenId>>,
        sampling_params: Vec<SamplingParams>,
        streamer: Streamer,
    ) -> Result<Vec<EncodedGenerationResult>, EngineError> {
        if self.has_non_finished_requests() {
            return Err(EngineError::Validation(
                "generate() cannot run while requests are in flight; use add_request".into(),
            ));
        }
        if batch_token_ids.len() != sampling_params.len() {
            return Err(EngineError::Validation(
                "one SamplingParams per input is required".into(),
            ));
        }
        for pair in sampling_params.windows(2) {
            if pair[0].adapters != pair[1].adapters {
                return Err(EngineError::Validation(
                    "adapters must be the same for all requests of a batch".into(),
                ));
            }
        }
        let mut sink = streamer.into_sink(Arc::clone(&self.tokenizer));
        if sink.is_some()
            && !(batch_token_ids.len() == 1
                && (sampling_params[0].is_greedy() || sampling_params[0].is_multinomial()))
        {
            return Err(EngineError::Validation(
                "streaming requires a single greedy or multinomial request".into(),
            ));
        }

        let mut handles = Vec::with_capacity(batch_token_ids.len());
        for (request_id, (token_ids, params)) in
            batch_token_ids.iter().zip(&sampling_params).enumerate()
        {
            handles.push(self.add_request_with_ids(
                request_id as RequestId,
                token_ids.clone(),
                params.clone(),
            )?);
        }

        let mut frames: Vec<Vec<GenerationOutputs>> = vec![Vec::new(); handles.len()];
        let mut streamed_tokens = 0usize;
        let mut continue_generation = true;

        while self.has_non_finished_requests() && continue_generation {
            if let Err(err) = self.step() {
                // poisoned pipeline: drop every in-flight request before
                // surfacing the error
                self.finish_request(None);
                return Err(err);
            }
            if let Some(sink) = sink.as_mut() {
                while let Some(frame) = handles[0].try_read() {
                    if let Some(output) = frame.get(&0) {
                        let tokens: Vec<TokenId> = if output.finished {
                            // terminal frames repeat the full sequence
                            output.generated_ids[streamed_tokens.min(output.generated_ids.len())..]
                                .to_vec()
                        } else {
                            output.generated_ids.clone()
                        };
                        for token_id in tokens {
                            streamed_tokens += 1;
                            if sink.put(token_id) {
                                continue_generation = false;
                                handles[0].cancel();
                                break;
                            }
                        }
                    }
                    frames[0].push(frame);
                    if !continue_generation {
                        break;
                    }
                }
            }
        }
        if let Some(sink) = sink.as_mut() {
            sink.end();
        }
        if !continue_generation {
            // one more step to reap the cancelled request
            let _ = self.step();
        }

        let mut results = Vec::with_capacity(handles.len());
        for (i, handle) in handles.iter().enumerate() {
            let mut all_frames = std::mem::take(&mut frames[i]);
            all_frames.extend(handle.read_all());
            results.push(assemble_result(
                i as RequestId,
                &batch_token_ids[i],
                &sampling_params[i],
                &all_frames,
                handle.status(),
            ));
        }
        Ok(results)
    }
}

pub(crate) fn longest_common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub(crate) fn assemble_result(
    request_id: RequestId,
    prompt_ids: &[TokenId],
    params: &SamplingParams,
    frames: &[GenerationOutputs],
    status: GenerationStatus,
) -> EncodedGenerationResult {
    let mut result = EncodedGenerationResult {
        request_id,
        generation_ids: Vec::new(),
        scores: Vec::new(),
        status,
    };
    let Some(frame) = frames.iter().rev().find(|f| !f.is_empty()) else {
        return result;
    };

    let mut outputs: Vec<&GenerationOutput> = frame.values().collect();
    outputs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let num_outputs = params.num_return_sequences.min(outputs.len());
    for output in &outputs[..num_outputs] {
        let mut ids = if params.echo {
            prompt_ids.to_vec()
        } else {
            Vec::new()
        };
        ids.extend_from_slice(&output.generated_ids);
        result.generation_ids.push(ids);
        result.scores.push(output.score);
    }
    result
}

/// The pipeline kinds behind one public surface. Dispatch happens once at
/// construction; afterwards calls are a plain match.
pub enum InferencePipeline {
    Batching(ContinuousBatchingPipeline),
    Speculative(SpeculativeDecodingPipeline),
}

impl InferencePipeline {
    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt: &str,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        match self {
            Self::Batching(p) => p.add_request(request_id, prompt, sampling_params),
            Self::Speculative(p) => p.add_request(request_id, prompt, sampling_params),
        }
    }

    pub fn add_request_with_ids(
        &self,
        request_id: RequestId,
        token_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        match self {
            Self::Batching(p) => p.add_request_with_ids(request_id, token_ids, sampling_params),
            Self::Speculative(p) => p.add_request_with_ids(request_id, token_ids, sampling_params),
        }
    }

    pub fn step(&mut self) -> Result<(), EngineError> {
        match self {
            Self::Batching(p) => p.step(),
            Self::Speculative(p) => p.step(),
        }
    }

    pub fn has_non_finished_requests(&self) -> bool {
        match self {
            Self::Batching(p) => p.has_non_finished_requests(),
            Self::Speculative(p) => p.has_non_finished_requests(),
        }
    }

    pub fn generate(
        &mut self,
        batch_token_ids: Vec<Vec<TokenId>>,
        sampling_params: Vec<SamplingParams>,
        streamer: Streamer,
    ) -> Result<Vec<EncodedGenerationResult>, EngineError> {
        match self {
            Self::Batching(p) => p.generate(batch_token_ids, sampling_params, streamer),
            Self::Speculative(p) => p.generate(batch_token_ids, sampling_params, streamer),
        }
    }

    pub fn finish_request(&mut self, request_id: Option<RequestId>) {
        match self {
            Self::Batching(p) => p.finish_request(request_id),
            Self::Speculative(p) => p.finish_request(request_id),
        }
    }

    pub fn get_metrics(&self) -> PipelineMetricsSnapshot {
        match self {
            Self::Batching(p) => p.get_metrics(),
            Self::Speculative(p) => p.get_metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockModelRunner, MockSampler, MockTokenizer};

    fn pipeline(config: SchedulerConfig) -> ContinuousBatchingPipeline {
        ContinuousBatchingPipeline::new(
            Box::new(MockModelRunner::new(64)),
            Box::new(MockSampler::new()),
            Arc::new(MockTokenizer::new(2)),
            config,
            1,
        )
        .unwrap()
    }

    fn small_config() -> SchedulerConfig {
        SchedulerConfig {
            max_num_batched_tokens: 64,
            max_num_seqs: 8,
            block_size: 4,
            num_kv_blocks: 16,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn empty_step_is_a_noop() {
        let mut pipeline = pipeline(small_config());
        pipeline.step().unwrap();
        assert!(!pipeline.has_non_finished_requests());
    }

    #[test]
    fn requests_visible_after_enqueue() {
        let pipeline = pipeline(small_config());
        let _handle = pipeline
            .add_request_with_ids(7, vec![1, 2, 3], SamplingParams::greedy(4))
            .unwrap();
        assert!(pipeline.has_non_finished_requests());
    }

    #[test]
    fn empty_prompt_rejected() {
        let pipeline = pipeline(small_config());
        let err = pipeline
            .add_request_with_ids(0, vec![], SamplingParams::greedy(4))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn oversized_prompt_rejected_in_vllm_mode() {
        let pipeline = pipeline(small_config());
        let err = pipeline
            .add_request_with_ids(0, vec![1; 100], SamplingParams::greedy(4))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let dsf = ContinuousBatchingPipeline::new(
            Box::new(MockModelRunner::new(64)),
            Box::new(MockSampler::new()),
            Arc::new(MockTokenizer::new(2)),
            SchedulerConfig {
                dynamic_split_fuse: true,
                num_kv_blocks: 64,
                ..small_config()
            },
            1,
        )
        .unwrap();
        assert!(dsf
            .add_request_with_ids(0, vec![1; 100], SamplingParams::greedy(4))
            .is_ok());
    }

    #[test]
    fn update_request_inserts_and_removes() {
        let mut pipeline = pipeline(small_config());
        let _handle = pipeline
            .add_request_with_ids(0, vec![1, 2, 3], SamplingParams::greedy(16))
            .unwrap();

        // first update: plain insertion
        let mut candidates = GeneratedSequences::new();
        candidates.insert(
            0,
            GeneratedSequence {
                token_ids: vec![10, 11, 12],
                log_probs: vec![-0.1, -0.2, -0.3],
            },
        );
        let result = pipeline.update_request(0, &candidates, false).unwrap();
        assert_eq!(result.inserted_tokens, 3);
        assert_eq!(result.removed_tokens, 0);

        // second update diverges after the first token
        let mut candidates = GeneratedSequences::new();
        candidates.insert(
            0,
            GeneratedSequence {
                token_ids: vec![10, 20, 21, 22],
                log_probs: vec![0.0; 4],
            },
        );
        let result = pipeline.update_request(0, &candidates, true).unwrap();
        assert_eq!(result.removed_tokens, 2);
        assert_eq!(result.inserted_tokens, 3);

        let generated = pipeline.get_generated_requests().unwrap();
        assert_eq!(generated[&0][&0].token_ids, vec![10, 20, 21, 22]);
    }

    #[test]
    fn update_request_full_divergence_resets_processed() {
        let mut pipeline = pipeline(small_config());
        let _handle = pipeline
            .add_request_with_ids(0, vec![1, 2, 3, 4], SamplingParams::greedy(16))
            .unwrap();

        let mut candidates = GeneratedSequences::new();
        candidates.insert(
            0,
            GeneratedSequence {
                token_ids: vec![10, 11],
                log_probs: vec![0.0; 2],
            },
        );
        pipeline.update_request(0, &candidates, false).unwrap();
        // run the prompt so processed covers prompt + candidates
        pipeline.step().unwrap();

        let mut diverged = GeneratedSequences::new();
        diverged.insert(
            0,
            GeneratedSequence {
                token_ids: vec![30],
                log_probs: vec![0.0],
            },
        );
        let result = pipeline.update_request(0, &diverged, true).unwrap();
        assert!(result.removed_tokens > 0);
        // whole generated context invalidated → KV recomputed from prompt
        let generated = pipeline.get_generated_requests().unwrap();
        assert_eq!(generated[&0][&0].token_ids, vec![30]);
    }

    #[test]
    fn update_request_unknown_id_is_noop() {
        let mut pipeline = pipeline(small_config());
        let result = pipeline
            .update_request(99, &GeneratedSequences::new(), false)
            .unwrap();
        assert_eq!(result.inserted_tokens, 0);
        assert_eq!(result.removed_tokens, 0);
    }

    #[test]
    fn finish_request_unblocks_reader_and_frees_blocks() {
        let mut pipeline = pipeline(small_config());
        let handle = pipeline
            .add_request_with_ids(0, vec![1, 2, 3, 4, 5], SamplingParams::greedy(64))
            .unwrap();
        pipeline.step().unwrap();
        assert!(pipeline.scheduler().block_manager().get_used_percentage() > 0.0);

        pipeline.finish_request(Some(0));
        assert!(!pipeline.has_non_finished_requests());
        assert_eq!(
            pipeline.scheduler().block_manager().get_used_percentage(),
            0.0
        );
        // the reader gets a final empty frame
        let frames = handle.read_all();
        assert!(frames.iter().any(|f| f.is_empty()));
    }

    #[test]
    fn dropped_handle_reaps_request_within_one_step() {
        let mut pipeline = pipeline(small_config());
        let handle = pipeline
            .add_request_with_ids(0, vec![1, 2, 3, 4, 5], SamplingParams::greedy(64))
            .unwrap();
        pipeline.step().unwrap();
        assert!(pipeline.has_non_finished_requests());

        drop(handle);
        pipeline.step().unwrap();
        assert!(!pipeline.has_non_finished_requests());
        assert_eq!(pipeline.scheduler().block_manager().total_ref_count(), 0);
    }

    #[test]
    fn generate_validates_batch_shapes() {
        let mut pipeline = pipeline(small_config());
        let err = pipeline
            .generate(vec![vec![1, 2]], vec![], Streamer::None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn inference_pipeline_variant_exposes_the_surface() {
        let mut engine = InferencePipeline::Batching(pipeline(small_config()));
        let handle = engine
            .add_request_with_ids(0, vec![1, 2, 3], SamplingParams::greedy(2))
            .unwrap();
        while engine.has_non_finished_requests() {
            engine.step().unwrap();
        }
        assert_eq!(handle.status(), GenerationStatus::Finished);
        assert_eq!(engine.get_metrics().requests, 1);
    }

    #[test]
    fn generate_rejects_mismatched_adapters() {
        let mut pipeline = pipeline(small_config());
        let a = SamplingParams {
            adapters: vec!["lora-a".into()],
            ..SamplingParams::greedy(4)
        };
        let b = SamplingParams::greedy(4);
        let err = pipeline
            .generate(vec![vec![1], vec![2]], vec![a, b], Streamer::None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
