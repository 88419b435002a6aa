//! Sampling parameters and the external sampler contract.
//!
//! The numerics of sampling (top-k/top-p, beam scoring, multinomial draws)
//! live outside this crate. The pipeline hands the sampler mutable access to
//! the scheduled groups plus the step's logits; the sampler writes generated
//! tokens onto the sequences and reports fork/drop directives back as an
//! explicit return value so the block manager is never re-entered mid-sample.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::Logits;
use crate::scheduler::SchedulerOutput;
use crate::sequence::{RequestId, SeqId, SequenceGroup, TokenId};

/// Decoding family for a request. Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodingKind {
    #[default]
    Greedy,
    Multinomial,
    BeamSearch,
}

/// How the draft pipeline's per-iteration token budget is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumAssistantTokensSchedule {
    /// Run exactly `num_assistant_tokens` draft iterations per cycle.
    #[default]
    Constant,
    /// Keep drafting while the last token's probability stays above
    /// `assistant_confidence_threshold`.
    Dynamic,
}

/// Per-request generation parameters shared by every sequence in a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub num_return_sequences: usize,
    pub eos_token_id: Option<TokenId>,
    /// When true, EOS does not stop generation (set on draft-side mirrors of
    /// speculative requests).
    pub ignore_eos: bool,
    pub decoding: DecodingKind,
    /// Draft lookahead per speculative cycle; 0 disables speculation.
    pub num_assistant_tokens: usize,
    pub num_assistant_tokens_schedule: NumAssistantTokensSchedule,
    pub assistant_confidence_threshold: f32,
    /// Prepend the prompt ids to the final result.
    pub echo: bool,
    /// Adapter names applied to this request; compared for equality across a
    /// batch, never interpreted here.
    pub adapters: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            num_return_sequences: 1,
            eos_token_id: None,
            ignore_eos: false,
            decoding: DecodingKind::Greedy,
            num_assistant_tokens: 0,
            num_assistant_tokens_schedule: NumAssistantTokensSchedule::Constant,
            assistant_confidence_threshold: 0.0,
            echo: false,
            adapters: Vec::new(),
        }
    }
}

impl SamplingParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Self::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.decoding == DecodingKind::Greedy
    }

    pub fn is_multinomial(&self) -> bool {
        self.decoding == DecodingKind::Multinomial
    }

    pub fn is_beam_search(&self) -> bool {
        self.decoding == DecodingKind::BeamSearch
    }

    /// Whether this request runs through the speculative-decoding path.
    pub fn is_speculative(&self) -> bool {
        self.num_assistant_tokens > 0
            || (self.num_assistant_tokens_schedule == NumAssistantTokensSchedule::Dynamic
                && self.assistant_confidence_threshold > 0.0)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_new_tokens == 0 {
            return Err(EngineError::Validation(
                "max_new_tokens must be non-zero".into(),
            ));
        }
        if self.num_return_sequences == 0 {
            return Err(EngineError::Validation(
                "num_return_sequences must be non-zero".into(),
            ));
        }
        if !self.is_beam_search() && !self.is_multinomial() && self.num_return_sequences > 1 {
            return Err(EngineError::Validation(
                "num_return_sequences > 1 requires beam search or multinomial sampling".into(),
            ));
        }
        if self.num_assistant_tokens_schedule == NumAssistantTokensSchedule::Dynamic
            && !(0.0..1.0).contains(&self.assistant_confidence_threshold)
        {
            return Err(EngineError::Validation(
                "assistant_confidence_threshold must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

/// Fork/drop directives produced by one sampling pass.
#[derive(Debug, Default)]
pub struct SamplerOutput {
    /// Parent sequence id → ids of children the sampler forked off it.
    pub forked_sequences: HashMap<SeqId, Vec<SeqId>>,
    /// Sequences whose KV blocks can be released.
    pub dropped_sequences: Vec<SeqId>,
}

/// External sampler contract.
///
/// `sample` runs once per forward pass over the groups named in
/// `scheduler_output.scheduled_group_ids`, in that order; the groups still
/// carry their scheduled-token counts at this point. In validation mode
/// (speculative main pipeline) the sampler checks previously appended
/// candidate tokens against the model's own choices and truncates any
/// divergent tail via [`Sequence::remove_last_tokens`].
///
/// [`Sequence::remove_last_tokens`]: crate::sequence::Sequence::remove_last_tokens
pub trait Sampler {
    fn sample(
        &mut self,
        groups: &mut [SequenceGroup],
        scheduler_output: &SchedulerOutput,
        logits: &Logits,
        validation_mode: bool,
    ) -> Result<SamplerOutput, EngineError>;

    /// Roll back per-request logit-processor history after tokens were
    /// removed from a sequence (repetition penalties and similar processors
    /// are stateful; skipping this is a correctness bug for them).
    fn on_tokens_removed(&mut self, _request_id: RequestId, _removed: &[TokenId]) {}

    /// Drop retained per-request state once a request is reaped.
    fn clear_beam_search_info(&mut self, _request_id: RequestId) {}
}
