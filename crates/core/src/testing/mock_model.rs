use crate::error::EngineError;
use crate::model::{AttentionScores, Logits, ModelRunner};
use crate::scheduler::SchedulerOutput;
use crate::sequence::{Sequence, SequenceGroup, TokenId};

/// Deterministic model: the logits row for a position puts all mass on
/// `transition(token_at(position))`.
///
/// Rows are emitted in schedule order (group, then running sequence, then
/// scheduled token), matching the layout the sampler expects. When built
/// with attention collection, every forward pass also reports per-block
/// scores with one configurable low-attention block.
pub struct MockModelRunner {
    vocab_size: usize,
    transition: Box<dyn Fn(TokenId) -> TokenId + Send>,
    collect_attention: bool,
    low_attention_block: Option<usize>,
    last_scores: Option<AttentionScores>,
}

impl MockModelRunner {
    pub fn new(vocab_size: usize) -> Self {
        let vocab = vocab_size as u32;
        Self::with_transition(
            vocab_size,
            Box::new(move |t| (t.wrapping_mul(7).wrapping_add(3)) % vocab),
        )
    }

    pub fn with_transition(
        vocab_size: usize,
        transition: Box<dyn Fn(TokenId) -> TokenId + Send>,
    ) -> Self {
        Self {
            vocab_size,
            transition,
            collect_attention: false,
            low_attention_block: None,
            last_scores: None,
        }
    }

    /// Report attention scores, scoring `low_attention_block` far below
    /// every other block.
    pub fn with_attention_scores(vocab_size: usize, low_attention_block: usize) -> Self {
        let mut runner = Self::new(vocab_size);
        runner.collect_attention = true;
        runner.low_attention_block = Some(low_attention_block);
        runner
    }

    fn token_at(group: &SequenceGroup, seq: &Sequence, pos: usize) -> TokenId {
        if pos < group.prompt_len() {
            group.prompt_ids()[pos]
        } else {
            seq.generated_ids()[pos - group.prompt_len()]
        }
    }
}

impl ModelRunner for MockModelRunner {
    fn forward(
        &mut self,
        groups: &[SequenceGroup],
        scheduler_output: &SchedulerOutput,
    ) -> Result<Logits, EngineError> {
        let mut logits = Logits::new();
        for &group_id in &scheduler_output.scheduled_group_ids {
            let group = &groups[group_id];
            let scheduled = group.num_scheduled_tokens();
            let processed = group.num_processed_tokens();
            for seq in group.running_sequences() {
                let context = group.prompt_len() + seq.num_generated();
                for j in 0..scheduled {
                    // a fully cached prompt reprocesses its final position
                    let pos = (processed + j).min(context.saturating_sub(1));
                    let current = Self::token_at(group, seq, pos);
                    let next = (self.transition)(current) as usize % self.vocab_size;
                    let mut row = vec![0.0f32; self.vocab_size];
                    row[next] = 1.0;
                    logits.push_row(row);
                }
            }
        }

        if self.collect_attention {
            let mut scores = AttentionScores::new();
            for (seq_id, tables) in &scheduler_output.block_tables {
                let per_layer: Vec<Vec<f32>> = tables
                    .iter()
                    .map(|layer| {
                        (0..layer.len())
                            .map(|i| {
                                if Some(i) == self.low_attention_block {
                                    0.01
                                } else {
                                    1.0
                                }
                            })
                            .collect()
                    })
                    .collect();
                scores.insert(*seq_id, per_layer);
            }
            self.last_scores = Some(scores);
        }
        Ok(logits)
    }

    fn last_attention_scores(&self) -> Option<AttentionScores> {
        self.last_scores.clone()
    }
}
