use serde::Deserialize;
use serde::Serialize;

/// Upper bounds of the latency histogram buckets, in milliseconds. The last
/// bucket is implicit (+Inf).
pub const LATENCY_BUCKETS_MS: [f64; 4] = [0.5, 1.0, 5.0, 10.0];

/// Per-sandbox counters reported by `profile()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Cumulative CPU time. When queried mid-operation this includes the
    /// in-flight operation's elapsed wall time.
    pub cpu_ms: f64,
    /// High-water mark of retained guest memory since start or reset.
    pub peak_mem_bytes: u64,
    pub operations: u64,
    pub errors: u64,
    /// Counts per latency bucket; index 4 is the +Inf bucket.
    pub latency_buckets: [u64; 5],
    pub latency_sum_ms: f64,
}

impl Stats {
    /// Internal accounting score used for scheduling decisions.
    pub fn cost(&self) -> f64 {
        self.cpu_ms * 1e-4 + self.peak_mem_bytes as f64 * 1e-9
    }

    pub fn record_latency(&mut self, elapsed_ms: f64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|limit| elapsed_ms <= *limit)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx] += 1;
        self.latency_sum_ms += elapsed_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_lands_in_the_right_bucket() {
        let mut stats = Stats::default();
        stats.record_latency(0.2);
        stats.record_latency(0.7);
        stats.record_latency(3.0);
        stats.record_latency(9.0);
        stats.record_latency(50.0);
        assert_eq!(stats.latency_buckets, [1, 1, 1, 1, 1]);
        assert!((stats.latency_sum_ms - 62.9).abs() < 1e-9);
    }

    #[test]
    fn cost_weights_cpu_and_memory() {
        let stats = Stats {
            cpu_ms: 100.0,
            peak_mem_bytes: 1_000_000_000,
            ..Default::default()
        };
        assert!((stats.cost() - (100.0 * 1e-4 + 1.0)).abs() < 1e-9);
    }
}
