//! Fixed-capacity latency histogram.
//!
//! Memory use is constant regardless of how many samples are recorded;
//! percentiles are estimated by linear interpolation inside the bucket that
//! holds the requested rank.

/// Upper bounds (inclusive, milliseconds) of the finite buckets
pub const LATENCY_BOUNDS_MS: [f64; 16] = [
    1.0, 2.0, 5.0, 10.0, 20.0, 35.0, 50.0, 75.0, 100.0, 150.0, 250.0, 500.0, 1000.0, 2500.0,
    5000.0, 10000.0,
];

const BUCKETS: usize = LATENCY_BOUNDS_MS.len() + 1;

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyHistogram {
    counts: [u64; BUCKETS],
    total: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            counts: [0; BUCKETS],
            total: 0,
            sum_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
        }
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency_ms: f64) {
        let value = if latency_ms.is_finite() {
            latency_ms.max(0.0)
        } else {
            return;
        };

        let index = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(BUCKETS - 1);

        self.counts[index] += 1;
        self.total += 1;
        self.sum_ms += value;
        self.min_ms = self.min_ms.min(value);
        self.max_ms = self.max_ms.max(value);
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
        self.total += other.total;
        self.sum_ms += other.sum_ms;
        self.min_ms = self.min_ms.min(other.min_ms);
        self.max_ms = self.max_ms.max(other.max_ms);
    }

    pub fn count(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn mean(&self) -> Option<f64> {
        (self.total > 0).then(|| self.sum_ms / self.total as f64)
    }

    pub fn max(&self) -> Option<f64> {
        (self.total > 0).then_some(self.max_ms)
    }

    /// Estimate the `p`th percentile (0-100)
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.total == 0 {
            return None;
        }

        let p = p.clamp(0.0, 100.0);
        let rank = ((p / 100.0) * self.total as f64).max(1.0);
        let mut cumulative = 0u64;

        for (index, count) in self.counts.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let before = cumulative as f64;
            cumulative += count;
            if (cumulative as f64) >= rank {
                let lower = if index == 0 {
                    0.0
                } else {
                    LATENCY_BOUNDS_MS[index - 1]
                };
                let upper = if index < LATENCY_BOUNDS_MS.len() {
                    LATENCY_BOUNDS_MS[index]
                } else {
                    self.max_ms
                };
                let fraction = (rank - before) / *count as f64;
                let estimate = lower + (upper - lower) * fraction;
                return Some(estimate.clamp(self.min_ms, self.max_ms));
            }
        }

        Some(self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram_has_no_statistics() {
        let histogram = LatencyHistogram::new();
        assert!(histogram.is_empty());
        assert_eq!(histogram.mean(), None);
        assert_eq!(histogram.percentile(50.0), None);
    }

    #[test]
    fn test_percentiles_are_ordered_and_bounded() {
        let mut histogram = LatencyHistogram::new();
        for i in 1..=1000 {
            histogram.record(i as f64 / 10.0); // 0.1ms .. 100ms
        }

        let p50 = histogram.percentile(50.0).unwrap();
        let p95 = histogram.percentile(95.0).unwrap();
        let p99 = histogram.percentile(99.0).unwrap();

        assert!(p50 <= p95 && p95 <= p99);
        assert!(p99 <= 100.0);
        // true median is 50ms, bucket (35, 50] gives a close estimate
        assert!((p50 - 50.0).abs() <= 15.0, "p50 was {p50}");
        assert!((histogram.mean().unwrap() - 50.05).abs() < 1e-6);
    }

    #[test]
    fn test_single_value_percentiles_collapse_to_value() {
        let mut histogram = LatencyHistogram::new();
        for _ in 0..10 {
            histogram.record(42.0);
        }
        assert_eq!(histogram.percentile(50.0), Some(42.0));
        assert_eq!(histogram.percentile(99.0), Some(42.0));
    }

    #[test]
    fn test_merge_combines_counts() {
        let mut a = LatencyHistogram::new();
        let mut b = LatencyHistogram::new();
        a.record(10.0);
        b.record(20000.0);
        a.merge(&b);
        assert_eq!(a.count(), 2);
        assert_eq!(a.max(), Some(20000.0));
    }

    #[test]
    fn test_non_finite_samples_are_ignored() {
        let mut histogram = LatencyHistogram::new();
        histogram.record(f64::NAN);
        histogram.record(f64::INFINITY);
        assert!(histogram.is_empty());
    }
}
