use std::collections::HashMap;

use crate::error::{internal, EngineError};
use crate::model::Logits;
use crate::pipeline::GenerationStatus;
use crate::sampling::{Sampler, SamplerOutput, SamplingParams};
use crate::scheduler::SchedulerOutput;
use crate::sequence::{RequestId, SequenceGroup, TokenId};

/// Greedy argmax sampler with the validation semantics the speculative main
/// pipeline relies on: previously appended candidate tokens are checked
/// against the model's choice and any divergent tail is truncated before
/// the corrected token is appended.
pub struct MockSampler {
    log_prob: f32,
    /// request id → tokens removed, for asserting rollback notifications.
    pub rollback_counts: HashMap<RequestId, usize>,
    pub cleared_requests: Vec<RequestId>,
}

impl MockSampler {
    pub fn new() -> Self {
        Self::with_log_prob(0.0)
    }

    /// Appended tokens carry this log-prob (drives the dynamic
    /// assistant-confidence schedule in tests).
    pub fn with_log_prob(log_prob: f32) -> Self {
        Self {
            log_prob,
            rollback_counts: HashMap::new(),
            cleared_requests: Vec::new(),
        }
    }

    fn note_rollback(&mut self, request_id: RequestId, removed: usize) {
        *self.rollback_counts.entry(request_id).or_default() += removed;
    }

    fn should_finish(token: TokenId, generated_len: usize, params: &SamplingParams) -> bool {
        if !params.ignore_eos && params.eos_token_id == Some(token) {
            return true;
        }
        generated_len >= params.max_new_tokens
    }
}

impl Default for MockSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn argmax(row: &[f32]) -> TokenId {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as TokenId)
        .unwrap_or(0)
}

impl Sampler for MockSampler {
    fn sample(
        &mut self,
        groups: &mut [SequenceGroup],
        scheduler_output: &SchedulerOutput,
        logits: &Logits,
        validation_mode: bool,
    ) -> Result<SamplerOutput, EngineError> {
        let mut row_idx = 0usize;
        for &group_id in &scheduler_output.scheduled_group_ids {
            let group = &mut groups[group_id];
            let scheduled = group.num_scheduled_tokens();
            let processed = group.num_processed_tokens();
            let prompt_len = group.prompt_len();
            let params = group.sampling_params().clone();
            let request_id = group.request_id();

            let num_seqs = group.sequences().len();
            for seq_idx in 0..num_seqs {
                if !group.sequences()[seq_idx].is_running() {
                    continue;
                }
                let context0 = prompt_len + group.sequences()[seq_idx].num_generated();
                let mut done = false;

                for j in 0..scheduled {
                    let predicted = argmax(
                        logits
                            .row(row_idx)
                            .ok_or_else(|| internal("logits rows shorter than schedule"))?,
                    );
                    row_idx += 1;
                    if done {
                        continue;
                    }

                    let pos = (processed + j).min(context0 - 1);
                    let predicts_index = pos + 1;
                    if predicts_index < prompt_len {
                        continue; // mid-prompt position
                    }

                    let seq = &mut group.sequences_mut()[seq_idx];
                    if predicts_index < context0 {
                        if !validation_mode {
                            continue; // recomputation of already-known tokens
                        }
                        let existing = seq.generated_ids()[predicts_index - prompt_len];
                        if existing == predicted {
                            // candidate accepted; EOS or length may end the
                            // request mid-candidates
                            let accepted_len = predicts_index - prompt_len + 1;
                            if Self::should_finish(predicted, accepted_len, &params) {
                                let extra = context0 - predicts_index - 1;
                                let removed = seq.remove_last_tokens(extra);
                                seq.set_status(GenerationStatus::Finished);
                                self.note_rollback(request_id, removed.len());
                                done = true;
                            }
                        } else {
                            // divergence: drop the tail, keep the model's pick
                            let removed = seq.remove_last_tokens(context0 - predicts_index);
                            self.note_rollback(request_id, removed.len());
                            let seq = &mut group.sequences_mut()[seq_idx];
                            seq.append_token(predicted, self.log_prob);
                            if Self::should_finish(predicted, seq.num_generated(), &params) {
                                seq.set_status(GenerationStatus::Finished);
                            }
                            done = true;
                        }
                    } else {
                        // fresh position: exactly one new token per pass
                        seq.append_token(predicted, self.log_prob);
                        if Self::should_finish(predicted, seq.num_generated(), &params) {
                            seq.set_status(GenerationStatus::Finished);
                        }
                        done = true;
                    }
                }
            }
        }
        Ok(SamplerOutput::default())
    }

    fn on_tokens_removed(&mut self, request_id: RequestId, removed: &[TokenId]) {
        self.note_rollback(request_id, removed.len());
    }

    fn clear_beam_search_info(&mut self, request_id: RequestId) {
        self.cleared_requests.push(request_id);
    }
}
