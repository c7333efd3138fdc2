//! `ChunkTableStats`: rolling average Task completion time per
//! `(chunkId, tableKey)` (spec.md section 3), used by the worker scheduler
//! to order Tasks within a scan tier so table pages are reused.
//!
//! The smoothing weights are config (spec.md section 9 flags the source's
//! hard-coded `49`/`1` constants as "undocumented ... treat as tunable
//! config"); see [`qserv_common::config::SchedulerConfig`].

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkTableKey {
    pub chunk_id: i32,
    pub table: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollingStats {
    pub avg_millis: f64,
    pub boot_count: u32,
}

impl RollingStats {
    /// Exponential moving average: `avg' = (avg*weight_avg + sample*weight_new)
    /// / (weight_avg + weight_new)`.
    fn record(&mut self, sample_millis: f64, weight_avg: f64, weight_new: f64) {
        self.avg_millis = if self.avg_millis == 0.0 {
            sample_millis
        } else {
            (self.avg_millis * weight_avg + sample_millis * weight_new) / (weight_avg + weight_new)
        };
    }
}

/// Concurrent table of rolling per-`(chunk, table)` completion stats.
#[derive(Debug, Default)]
pub struct ChunkTableStats {
    table: DashMap<ChunkTableKey, RollingStats>,
    weight_avg: f64,
    weight_new: f64,
}

impl ChunkTableStats {
    pub fn new(weight_avg: f64, weight_new: f64) -> Arc<Self> {
        Arc::new(Self {
            table: DashMap::new(),
            weight_avg,
            weight_new,
        })
    }

    /// Called by the worker scheduler on every Task completion.
    pub fn record_completion(&self, key: ChunkTableKey, elapsed_millis: f64) {
        self.table
            .entry(key)
            .or_default()
            .record(elapsed_millis, self.weight_avg, self.weight_new);
    }

    pub fn record_boot(&self, key: ChunkTableKey) {
        self.table.entry(key).or_default().boot_count += 1;
    }

    pub fn get(&self, key: ChunkTableKey) -> RollingStats {
        self.table.get(&key).map(|r| *r).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_converges_towards_repeated_samples() {
        let stats = ChunkTableStats::new(49.0, 1.0);
        let key = ChunkTableKey { chunk_id: 7, table: "Object".to_string() };
        stats.record_completion(key.clone(), 1000.0);
        for _ in 0..200 {
            stats.record_completion(key.clone(), 500.0);
        }
        let got = stats.get(key).avg_millis;
        assert!((got - 500.0).abs() < 1.0, "expected convergence to 500ms, got {got}");
    }

    #[test]
    fn boot_count_increments_independently() {
        let stats = ChunkTableStats::new(49.0, 1.0);
        let key = ChunkTableKey { chunk_id: 1, table: "Source".to_string() };
        stats.record_boot(key.clone());
        stats.record_boot(key.clone());
        assert_eq!(stats.get(key).boot_count, 2);
    }
}
