//! Per-pipeline runtime metrics.

use std::collections::VecDeque;

use serde::Serialize;

/// Steps that contribute to the running cache-usage average.
const AVG_CACHE_USAGE_WINDOW_SIZE_IN_STEPS: usize = 256;

/// Counters updated once per scheduling step.
#[derive(Default)]
pub struct PipelineMetrics {
    pub requests: usize,
    pub scheduled_requests: usize,
    pub cache_usage: f32,
    pub max_cache_usage: f32,
    recent_cache_usages: VecDeque<f32>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_step_cache_usage(&mut self, step_cache_usage: f32) {
        self.cache_usage = step_cache_usage;
        self.max_cache_usage = self.max_cache_usage.max(step_cache_usage);
        if self.recent_cache_usages.len() >= AVG_CACHE_USAGE_WINDOW_SIZE_IN_STEPS {
            self.recent_cache_usages.pop_front();
        }
        self.recent_cache_usages.push_back(step_cache_usage);
    }

    pub fn avg_cache_usage(&self) -> f32 {
        if self.recent_cache_usages.is_empty() {
            return 0.0;
        }
        self.recent_cache_usages.iter().sum::<f32>() / self.recent_cache_usages.len() as f32
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            requests: self.requests,
            scheduled_requests: self.scheduled_requests,
            cache_usage: self.cache_usage,
            avg_cache_usage: self.avg_cache_usage(),
            max_cache_usage: self.max_cache_usage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub requests: usize,
    pub scheduled_requests: usize,
    pub cache_usage: f32,
    pub avg_cache_usage: f32,
    pub max_cache_usage: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_over_registered_steps() {
        let mut metrics = PipelineMetrics::new();
        metrics.register_step_cache_usage(0.2);
        metrics.register_step_cache_usage(0.4);
        assert!((metrics.avg_cache_usage() - 0.3).abs() < 1e-6);
        assert_eq!(metrics.cache_usage, 0.4);
        assert_eq!(metrics.max_cache_usage, 0.4);
    }

    #[test]
    fn max_survives_usage_drop() {
        let mut metrics = PipelineMetrics::new();
        metrics.register_step_cache_usage(0.9);
        metrics.register_step_cache_usage(0.1);
        assert_eq!(metrics.max_cache_usage, 0.9);
        assert_eq!(metrics.cache_usage, 0.1);
    }

    #[test]
    fn window_is_bounded() {
        let mut metrics = PipelineMetrics::new();
        for _ in 0..AVG_CACHE_USAGE_WINDOW_SIZE_IN_STEPS {
            metrics.register_step_cache_usage(0.0);
        }
        for _ in 0..AVG_CACHE_USAGE_WINDOW_SIZE_IN_STEPS {
            metrics.register_step_cache_usage(1.0);
        }
        // the zero-usage prefix aged out completely
        assert!((metrics.avg_cache_usage() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn snapshot_serializes() {
        let mut metrics = PipelineMetrics::new();
        metrics.requests = 3;
        metrics.register_step_cache_usage(0.5);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["requests"], 3);
    }
}
