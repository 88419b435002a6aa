//! Speculative-decoding end-to-end scenarios: a draft/main pipeline pair
//! over deterministic mock models, checked against the main model running
//! alone.

use std::sync::Arc;

use streamline_core::pipeline::{
    ContinuousBatchingPipeline, GenerationStatus, PipelineDesc, SpeculativeDecodingPipeline,
};
use streamline_core::sampling::{NumAssistantTokensSchedule, SamplingParams};
use streamline_core::scheduler::SchedulerConfig;
use streamline_core::sequence::TokenId;
use streamline_core::testing::{MockModelRunner, MockSampler, MockTokenizer};
use streamline_core::Streamer;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_num_batched_tokens: 128,
        max_num_seqs: 8,
        block_size: 4,
        num_kv_blocks: 64,
        ..SchedulerConfig::default()
    }
}

fn desc(runner: MockModelRunner, sampler: MockSampler) -> PipelineDesc {
    PipelineDesc {
        model_runner: Box::new(runner),
        sampler: Box::new(sampler),
        tokenizer: Arc::new(MockTokenizer::new(2)),
        scheduler_config: config(),
        num_layers: 1,
    }
}

fn baseline_generation(prompt: Vec<TokenId>, max_new_tokens: usize) -> Vec<TokenId> {
    let mut pipeline = ContinuousBatchingPipeline::new(
        Box::new(MockModelRunner::new(64)),
        Box::new(MockSampler::new()),
        Arc::new(MockTokenizer::new(2)),
        config(),
        1,
    )
    .unwrap();
    let results = pipeline
        .generate(
            vec![prompt],
            vec![SamplingParams::greedy(max_new_tokens)],
            Streamer::None,
        )
        .unwrap();
    results[0].generation_ids[0].clone()
}

fn speculative_params(max_new_tokens: usize, num_assistant_tokens: usize) -> SamplingParams {
    SamplingParams {
        num_assistant_tokens,
        ..SamplingParams::greedy(max_new_tokens)
    }
}

// ==================== perfect draft ====================

#[test]
fn perfect_draft_matches_main_alone_with_full_acceptance() {
    let prompt = vec![1, 5];
    let expected = baseline_generation(prompt.clone(), 10);

    let mut pipeline = SpeculativeDecodingPipeline::new(
        desc(MockModelRunner::new(64), MockSampler::new()),
        desc(MockModelRunner::new(64), MockSampler::new()),
    )
    .unwrap();

    let results = pipeline
        .generate(
            vec![prompt],
            vec![speculative_params(10, 4)],
            Streamer::None,
        )
        .unwrap();

    assert_eq!(results[0].status, GenerationStatus::Finished);
    assert_eq!(results[0].generation_ids[0], expected);

    // the draft proposed exactly what the main would have produced
    let metrics = pipeline.speculative_metrics().lock();
    let rate = metrics.avg_acceptance_rate(0).unwrap();
    assert!((rate - 1.0).abs() < 1e-6);
    assert!(metrics.draft_accepted_tokens(0) > 0);
}

// ==================== diverging draft ====================

#[test]
fn diverging_draft_is_corrected_by_verification() {
    let prompt = vec![1, 5];
    let expected = baseline_generation(prompt.clone(), 8);

    // the draft follows a different transition and proposes garbage
    let draft_runner = MockModelRunner::with_transition(
        64,
        Box::new(|t| (t.wrapping_mul(11).wrapping_add(5)) % 64),
    );
    let mut pipeline = SpeculativeDecodingPipeline::new(
        desc(MockModelRunner::new(64), MockSampler::new()),
        desc(draft_runner, MockSampler::new()),
    )
    .unwrap();

    let results = pipeline
        .generate(vec![prompt], vec![speculative_params(8, 4)], Streamer::None)
        .unwrap();

    // verification rejects the bad proposals; output still exact
    assert_eq!(results[0].generation_ids[0], expected);

    let metrics = pipeline.speculative_metrics().lock();
    let rate = metrics.avg_acceptance_rate(0).unwrap();
    assert!((0.0..1.0).contains(&rate), "rate {rate} out of range");
    assert!(rate < 1.0);
}

// ==================== acceptance rate bounds ====================

#[test]
fn acceptance_rates_stay_within_unit_interval() {
    let prompt = vec![3, 7, 9];
    let draft_runner = MockModelRunner::with_transition(
        64,
        Box::new(|t| (t.wrapping_add(1)) % 64),
    );
    let mut pipeline = SpeculativeDecodingPipeline::new(
        desc(MockModelRunner::new(64), MockSampler::new()),
        desc(draft_runner, MockSampler::new()),
    )
    .unwrap();

    pipeline
        .generate(vec![prompt], vec![speculative_params(6, 3)], Streamer::None)
        .unwrap();

    let metrics = pipeline.speculative_metrics().lock();
    for request_id in metrics.requests().collect::<Vec<_>>() {
        let rate = metrics.avg_acceptance_rate(request_id).unwrap();
        assert!((0.0..=1.0).contains(&rate));
    }
}

// ==================== dynamic assistant schedule ====================

#[test]
fn dynamic_schedule_throttles_unconfident_draft() {
    let prompt = vec![1, 5];
    let expected = baseline_generation(prompt.clone(), 6);

    // draft tokens carry a very low log-prob, so the confidence gate pauses
    // the draft after every proposal
    let mut pipeline = SpeculativeDecodingPipeline::new(
        desc(MockModelRunner::new(64), MockSampler::new()),
        desc(MockModelRunner::new(64), MockSampler::with_log_prob(-10.0)),
    )
    .unwrap();

    let params = SamplingParams {
        num_assistant_tokens_schedule: NumAssistantTokensSchedule::Dynamic,
        assistant_confidence_threshold: 0.5,
        ..SamplingParams::greedy(6)
    };
    let results = pipeline
        .generate(vec![prompt], vec![params], Streamer::None)
        .unwrap();

    assert_eq!(results[0].generation_ids[0], expected);
}

// ==================== lifecycle ====================

#[test]
fn draft_partner_is_finished_with_the_main_request() {
    let prompt = vec![1, 5];
    let mut pipeline = SpeculativeDecodingPipeline::new(
        desc(MockModelRunner::new(64), MockSampler::new()),
        desc(MockModelRunner::new(64), MockSampler::new()),
    )
    .unwrap();

    let handle = pipeline
        .add_request_with_ids(0, prompt, speculative_params(5, 4))
        .unwrap();

    let mut steps = 0;
    while pipeline.has_non_finished_requests() {
        pipeline.step().unwrap();
        steps += 1;
        assert!(steps < 100);
    }

    assert_eq!(handle.status(), GenerationStatus::Finished);
    // both pipelines drained, including the ignore_eos draft mirror
    assert!(pipeline.is_requests_empty());
}

#[test]
fn cancelling_the_main_handle_tears_down_both_sides() {
    let prompt = vec![1, 5];
    let mut pipeline = SpeculativeDecodingPipeline::new(
        desc(MockModelRunner::new(64), MockSampler::new()),
        desc(MockModelRunner::new(64), MockSampler::new()),
    )
    .unwrap();

    let handle = pipeline
        .add_request_with_ids(0, prompt, speculative_params(1000, 4))
        .unwrap();
    pipeline.step().unwrap();
    assert!(pipeline.has_non_finished_requests());

    handle.cancel();
    pipeline.step().unwrap();
    pipeline.step().unwrap();

    assert!(!pipeline.has_non_finished_requests());
    assert!(pipeline.is_requests_empty());
}

#[test]
fn finish_request_clears_both_pipelines() {
    let mut pipeline = SpeculativeDecodingPipeline::new(
        desc(MockModelRunner::new(64), MockSampler::new()),
        desc(MockModelRunner::new(64), MockSampler::new()),
    )
    .unwrap();

    let _a = pipeline
        .add_request_with_ids(0, vec![1, 5], speculative_params(100, 4))
        .unwrap();
    let _b = pipeline
        .add_request_with_ids(1, vec![9, 11], speculative_params(100, 4))
        .unwrap();
    pipeline.step().unwrap();

    pipeline.finish_request(Some(0));
    assert!(pipeline.has_non_finished_requests()); // request 1 still live

    pipeline.finish_request(None);
    assert!(pipeline.is_requests_empty());
}
