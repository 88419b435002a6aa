//! Speculative decoding: a draft pipeline proposes tokens several steps
//! ahead, the main pipeline verifies them in a single forward pass, and the
//! coordinator resynchronizes both KV caches around the accepted prefix.
//!
//! Every request is mirrored into both pipelines under a shared request id;
//! the draft-side mirror runs with `ignore_eos` so it never stops before
//! the main side does. One coordinator mutex gates admission during `step`
//! so the two pipelines always see the same request population.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::model::ModelRunner;
use crate::sampling::{Sampler, SamplingParams};
use crate::scheduler::SchedulerConfig;
use crate::sequence::{RequestId, TokenId};
use crate::tokenizer::{tokenizers_match, Tokenizer};

use super::{
    assemble_result, ContinuousBatchingPipeline, EncodedGenerationResult, GeneratedRequests,
    GeneratedSequence, GeneratedSequences, GenerationHandle, GenerationOutputs,
    PipelineMetricsSnapshot, Streamer, UpdateRequestResult,
};

/// Everything needed to build one of the coordinator's sub-pipelines.
pub struct PipelineDesc {
    pub model_runner: Box<dyn ModelRunner>,
    pub sampler: Box<dyn Sampler>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub scheduler_config: SchedulerConfig,
    pub num_layers: usize,
}

/// Per-request acceptance statistics.
#[derive(Default)]
pub struct SpeculativeDecodingMetrics {
    acceptance_rates: HashMap<RequestId, Vec<f32>>,
    draft_accepted_tokens: HashMap<RequestId, usize>,
    requested_generation_lens: HashMap<RequestId, usize>,
}

impl SpeculativeDecodingMetrics {
    pub fn set_generated_len(&mut self, request_id: RequestId, len: usize) {
        self.requested_generation_lens.insert(request_id, len);
    }

    /// Record one verification cycle's acceptance rate, a fraction in
    /// `[0, 1]`.
    pub fn update_acceptance_rate(&mut self, request_id: RequestId, rate: f32) {
        self.acceptance_rates
            .entry(request_id)
            .or_default()
            .push(rate.clamp(0.0, 1.0));
    }

    pub fn update_draft_accepted_tokens(&mut self, request_id: RequestId, accepted: usize) {
        *self.draft_accepted_tokens.entry(request_id).or_default() += accepted;
    }

    pub fn avg_acceptance_rate(&self, request_id: RequestId) -> Option<f32> {
        let rates = self.acceptance_rates.get(&request_id)?;
        if rates.is_empty() {
            return None;
        }
        Some(rates.iter().sum::<f32>() / rates.len() as f32)
    }

    pub fn draft_accepted_tokens(&self, request_id: RequestId) -> usize {
        self.draft_accepted_tokens
            .get(&request_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn requests(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.acceptance_rates.keys().copied()
    }
}

pub struct SpeculativeDecodingPipeline {
    main_pipeline: ContinuousBatchingPipeline,
    draft_pipeline: ContinuousBatchingPipeline,
    main_tokenizer: Arc<dyn Tokenizer>,
    draft_tokenizer: Arc<dyn Tokenizer>,
    same_tokenizers: bool,
    /// request id → draft-side handle; also the coordinator lock that gates
    /// admission while a step is in flight.
    draft_generations: Mutex<HashMap<RequestId, GenerationHandle>>,
    metrics: Mutex<SpeculativeDecodingMetrics>,
}

impl SpeculativeDecodingPipeline {
    pub fn new(main: PipelineDesc, draft: PipelineDesc) -> Result<Self, EngineError> {
        let same_tokenizers = tokenizers_match(&*main.tokenizer, &*draft.tokenizer);
        if !same_tokenizers {
            warn!("main and draft tokenizers differ; draft proposals will be retokenized");
        }
        let main_tokenizer = Arc::clone(&main.tokenizer);
        let draft_tokenizer = Arc::clone(&draft.tokenizer);

        // main verifies (validation mode), draft proposes
        let main_pipeline = ContinuousBatchingPipeline::with_validation_mode(
            main.model_runner,
            main.sampler,
            main.tokenizer,
            main.scheduler_config,
            main.num_layers,
            true,
        )?;
        let draft_pipeline = ContinuousBatchingPipeline::with_validation_mode(
            draft.model_runner,
            draft.sampler,
            draft.tokenizer,
            draft.scheduler_config,
            draft.num_layers,
            false,
        )?;

        Ok(Self {
            main_pipeline,
            draft_pipeline,
            main_tokenizer,
            draft_tokenizer,
            same_tokenizers,
            draft_generations: Mutex::new(HashMap::new()),
            metrics: Mutex::new(SpeculativeDecodingMetrics::default()),
        })
    }

    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt: &str,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        let token_ids = self.main_tokenizer.encode(prompt);
        self.add_request_with_ids(request_id, token_ids, sampling_params)
    }

    /// Mirror the request into both pipelines; the returned handle reads
    /// the main (verified) stream.
    pub fn add_request_with_ids(
        &self,
        request_id: RequestId,
        token_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle, EngineError> {
        let mut draft_generations = self.draft_generations.lock();
        self.metrics
            .lock()
            .set_generated_len(request_id, sampling_params.max_new_tokens);

        let draft_token_ids = if self.same_tokenizers {
            token_ids.clone()
        } else {
            self.draft_tokenizer
                .encode(&self.main_tokenizer.decode(&token_ids))
        };
        let mut draft_params = sampling_params.clone();
        // the draft must not stop on EOS before the main side confirms it
        draft_params.ignore_eos = true;

        let draft_handle =
            self.draft_pipeline
                .add_request_with_ids(request_id, draft_token_ids, draft_params)?;
        draft_generations.insert(request_id, draft_handle);
        self.main_pipeline
            .add_request_with_ids(request_id, token_ids, sampling_params)
    }

    pub fn has_non_finished_requests(&self) -> bool {
        self.main_pipeline.has_non_finished_requests()
    }

    pub fn get_metrics(&self) -> PipelineMetricsSnapshot {
        self.main_pipeline.get_metrics()
    }

    pub fn speculative_metrics(&self) -> &Mutex<SpeculativeDecodingMetrics> {
        &self.metrics
    }

    /// One speculative cycle: draft multistep, candidate hand-off, one main
    /// verification step, then resync of the draft against the accepted
    /// prefix.
    pub fn step(&mut self) -> Result<(), EngineError> {
        // blocks add_request during the step so the two pipelines stay
        // coherent
        let mut draft_generations = self.draft_generations.lock();

        // draft runs its multistep loop internally (assistant-token budget)
        self.draft_pipeline.step()?;

        let mut update_info: HashMap<RequestId, UpdateRequestResult> = HashMap::new();
        let mut draft_requests = self.draft_pipeline.get_generated_requests()?;
        if !self.same_tokenizers {
            draft_requests = retokenize_requests(
                &draft_requests,
                &*self.draft_tokenizer,
                &*self.main_tokenizer,
            );
        }
        for (request_id, sequences) in &draft_requests {
            let result = self
                .main_pipeline
                .update_request(*request_id, sequences, false)?;
            update_info.insert(*request_id, result);
        }

        // single verification step over the appended candidates
        self.main_pipeline.step()?;

        let mut main_requests = self.main_pipeline.get_generated_requests()?;
        if !self.same_tokenizers {
            main_requests = retokenize_requests(
                &main_requests,
                &*self.main_tokenizer,
                &*self.draft_tokenizer,
            );
        }
        for (request_id, sequences) in &main_requests {
            let result = self
                .draft_pipeline
                .update_request(*request_id, sequences, true)?;
            update_info.entry(*request_id).or_default().removed_tokens = result.removed_tokens;
        }

        let mut metrics = self.metrics.lock();
        for request_id in draft_requests.keys() {
            // the main side finished and was reaped: finish the partner
            if !main_requests.contains_key(request_id) {
                self.draft_pipeline.finish_request(Some(*request_id));
                draft_generations.remove(request_id);
            }
            let info = update_info
                .get(request_id)
                .copied()
                .unwrap_or_default();
            // pure prompt phases insert nothing and carry no signal
            if info.inserted_tokens == 0 {
                continue;
            }
            let acceptance_rate =
                1.0 - info.removed_tokens as f32 / info.inserted_tokens as f32;
            metrics.update_acceptance_rate(*request_id, acceptance_rate);
            metrics.update_draft_accepted_tokens(
                *request_id,
                info.inserted_tokens.saturating_sub(info.removed_tokens),
            );
            info!(
                request_id,
                acceptance_rate,
                inserted = info.inserted_tokens,
                removed = info.removed_tokens,
                "speculative verification cycle"
            );
        }
        Ok(())
    }

    pub fn finish_request(&mut self, request_id: Option<RequestId>) {
        self.draft_pipeline.finish_request(request_id);
        self.main_pipeline.finish_request(request_id);
        let mut draft_generations = self.draft_generations.lock();
        match request_id {
            Some(id) => {
                draft_generations.remove(&id);
            }
            None => draft_generations.clear(),
        }
    }

    fn drop_requests(&mut self) {
        self.finish_request(None);
    }

    pub fn is_requests_empty(&self) -> bool {
        self.main_pipeline.is_requests_empty() && self.draft_pipeline.is_requests_empty()
    }

    /// Run every queued request to completion through speculative cycles.
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
        let mut sink = streamer.into_sink(Arc::clone(&self.main_tokenizer));
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
                self.drop_requests();
                return Err(err);
            }
            if let Some(sink) = sink.as_mut() {
                while let Some(frame) = handles[0].try_read() {
                    if let Some(output) = frame.get(&0) {
                        let tokens: Vec<TokenId> = if output.finished {
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
            self.drop_requests();
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

/// Re-express generated sequences in another tokenizer's vocabulary by
/// round-tripping through text. Log-probs do not survive the trip.
fn retokenize_requests(
    source: &GeneratedRequests,
    source_tokenizer: &dyn Tokenizer,
    target_tokenizer: &dyn Tokenizer,
) -> GeneratedRequests {
    let mut target = GeneratedRequests::new();
    for (request_id, sequences) in source {
        let mut converted = GeneratedSequences::new();
        for (grouped_id, sequence) in sequences {
            let text = source_tokenizer.decode(&sequence.token_ids);
            let token_ids = target_tokenizer.encode(&text);
            let log_probs = vec![0.0; token_ids.len()];
            converted.insert(
                *grouped_id,
                GeneratedSequence {
                    token_ids,
                    log_probs,
                },
            );
        }
        target.insert(*request_id, converted);
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_rates_average_and_clamp() {
        let mut metrics = SpeculativeDecodingMetrics::default();
        assert!(metrics.avg_acceptance_rate(0).is_none());

        metrics.update_acceptance_rate(0, 1.0);
        metrics.update_acceptance_rate(0, 0.5);
        metrics.update_acceptance_rate(0, -0.5); // clamped to 0.0
        let avg = metrics.avg_acceptance_rate(0).unwrap();
        assert!((avg - 0.5).abs() < 1e-6);
    }

    #[test]
    fn accepted_tokens_accumulate() {
        let mut metrics = SpeculativeDecodingMetrics::default();
        metrics.update_draft_accepted_tokens(3, 4);
        metrics.update_draft_accepted_tokens(3, 2);
        assert_eq!(metrics.draft_accepted_tokens(3), 6);
        assert_eq!(metrics.draft_accepted_tokens(4), 0);
    }

    struct WordTokenizer {
        eos: TokenId,
        offset: u32,
    }

    impl Tokenizer for WordTokenizer {
        fn encode(&self, text: &str) -> Vec<TokenId> {
            text.split_whitespace()
                .filter_map(|t| t.parse::<u32>().ok())
                .map(|t| t + self.offset)
                .collect()
        }

        fn decode(&self, ids: &[TokenId]) -> String {
            ids.iter()
                .map(|id| (id - self.offset).to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }

        fn eos_token_id(&self) -> TokenId {
            self.eos
        }
    }

    #[test]
    fn retokenization_round_trips_content() {
        let source_tok = WordTokenizer { eos: 0, offset: 0 };
        let target_tok = WordTokenizer { eos: 0, offset: 100 };

        let mut source = GeneratedRequests::new();
        let mut seqs = GeneratedSequences::new();
        seqs.insert(
            0,
            GeneratedSequence {
                token_ids: vec![1, 2, 3],
                log_probs: vec![-0.5; 3],
            },
        );
        source.insert(7, seqs);

        let target = retokenize_requests(&source, &source_tok, &target_tok);
        assert_eq!(target[&7][&0].token_ids, vec![101, 102, 103]);
        assert_eq!(target[&7][&0].log_probs, vec![0.0; 3]);
    }
}
