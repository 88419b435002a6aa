//! Block-level cache counters for monitoring and tests.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe lifetime counters for block manager activity.
#[derive(Default)]
pub struct CacheMetrics {
    blocks_allocated: AtomicU64,
    blocks_freed: AtomicU64,
    /// Blocks released by the score-driven eviction pass.
    blocks_evicted: AtomicU64,
    /// Copy-on-write block duplications.
    cow_copies: AtomicU64,
    /// Prefix-cache block hits and misses.
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocation(&self, num_blocks: usize) {
        self.blocks_allocated
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_free(&self, num_blocks: usize) {
        self.blocks_freed
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, num_blocks: usize) {
        self.blocks_evicted
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_cow_copy(&self) {
        self.cow_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_query(&self, hits: usize, misses: usize) {
        self.cache_hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.cache_misses
            .fetch_add(misses as u64, Ordering::Relaxed);
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    pub fn blocks_freed(&self) -> u64 {
        self.blocks_freed.load(Ordering::Relaxed)
    }

    pub fn blocks_evicted(&self) -> u64 {
        self.blocks_evicted.load(Ordering::Relaxed)
    }

    pub fn cow_copies(&self) -> u64 {
        self.cow_copies.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Prefix-cache hit rate, `None` before the first query.
    pub fn hit_rate(&self) -> Option<f64> {
        let hits = self.cache_hits();
        let total = hits + self.cache_misses();
        if total == 0 {
            None
        } else {
            Some(hits as f64 / total as f64)
        }
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            blocks_allocated: self.blocks_allocated(),
            blocks_freed: self.blocks_freed(),
            blocks_evicted: self.blocks_evicted(),
            cow_copies: self.cow_copies(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetricsSnapshot {
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub blocks_evicted: u64,
    pub cow_copies: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}
