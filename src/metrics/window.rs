//! Time-bucketed sliding window of request outcomes.
//!
//! A series keeps at most `retention / bucket` buckets, so memory stays bounded
//! no matter how many predictions are recorded.

use super::histogram::LatencyHistogram;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GaugeStat {
    pub sum: f64,
    pub count: u64,
    pub last: f64,
}

impl GaugeStat {
    fn record(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.last = value;
    }

    fn merge(&mut self, other: &GaugeStat) {
        self.sum += other.sum;
        self.count += other.count;
        self.last = other.last;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    start: i64,
    requests: u64,
    errors: u64,
    latency: LatencyHistogram,
    gauges: HashMap<String, GaugeStat>,
}

impl Bucket {
    fn new(start: i64) -> Self {
        Self {
            start,
            requests: 0,
            errors: 0,
            latency: LatencyHistogram::new(),
            gauges: HashMap::new(),
        }
    }
}

/// Merged view over the buckets that overlap a query window
#[derive(Debug, Clone, Default)]
pub struct WindowAggregate {
    pub requests: u64,
    pub errors: u64,
    pub latency: LatencyHistogram,
    pub gauges: HashMap<String, GaugeStat>,
}

impl WindowAggregate {
    pub fn success_rate(&self) -> Option<f64> {
        (self.requests > 0).then(|| (self.requests - self.errors) as f64 / self.requests as f64)
    }

    pub fn error_rate(&self) -> Option<f64> {
        self.success_rate().map(|rate| 1.0 - rate)
    }

    pub fn gauge_mean(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).and_then(GaugeStat::mean)
    }
}

#[derive(Debug, Clone)]
pub struct WindowedSeries {
    bucket_seconds: i64,
    capacity: usize,
    buckets: VecDeque<Bucket>,
    total_requests: u64,
    total_errors: u64,
    last_seen: Option<DateTime<Utc>>,
}

impl WindowedSeries {
    pub fn new(bucket_seconds: u64, retention_seconds: u64) -> Self {
        let bucket_seconds = bucket_seconds.max(1) as i64;
        let capacity = ((retention_seconds.max(1) as i64 + bucket_seconds - 1) / bucket_seconds)
            .max(1) as usize;
        Self {
            bucket_seconds,
            capacity,
            buckets: VecDeque::with_capacity(capacity),
            total_requests: 0,
            total_errors: 0,
            last_seen: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn record_request(&mut self, at: DateTime<Utc>, latency_ms: f64, success: bool) {
        self.total_requests += 1;
        if !success {
            self.total_errors += 1;
        }
        self.last_seen = Some(self.last_seen.map_or(at, |seen| seen.max(at)));

        if let Some(bucket) = self.bucket_for(at) {
            bucket.requests += 1;
            if !success {
                bucket.errors += 1;
            }
            bucket.latency.record(latency_ms);
        }
    }

    pub fn record_gauge(&mut self, at: DateTime<Utc>, name: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        if let Some(bucket) = self.bucket_for(at) {
            bucket.gauges.entry(name.to_string()).or_default().record(value);
        }
    }

    /// Aggregate every bucket overlapping `(now - window_seconds, now]`
    pub fn aggregate(&self, now: DateTime<Utc>, window_seconds: u64) -> WindowAggregate {
        let now_ts = now.timestamp();
        let cutoff = now_ts - window_seconds as i64;
        let mut aggregate = WindowAggregate::default();

        for bucket in self
            .buckets
            .iter()
            .filter(|b| b.start + self.bucket_seconds > cutoff && b.start <= now_ts)
        {
            aggregate.requests += bucket.requests;
            aggregate.errors += bucket.errors;
            aggregate.latency.merge(&bucket.latency);
            for (name, stat) in &bucket.gauges {
                aggregate.gauges.entry(name.clone()).or_default().merge(stat);
            }
        }

        aggregate
    }

    fn align(&self, at: DateTime<Utc>) -> i64 {
        let ts = at.timestamp();
        ts - ts.rem_euclid(self.bucket_seconds)
    }

    /// Locate (or open) the bucket for `at`. Samples older than the retained
    /// history are dropped.
    fn bucket_for(&mut self, at: DateTime<Utc>) -> Option<&mut Bucket> {
        let start = self.align(at);

        let newest = self.buckets.back().map(|b| b.start);
        match newest {
            None => self.buckets.push_back(Bucket::new(start)),
            Some(newest) if start > newest => {
                self.buckets.push_back(Bucket::new(start));
                let horizon = start - self.bucket_seconds * self.capacity as i64;
                while self
                    .buckets
                    .front()
                    .is_some_and(|b| b.start <= horizon)
                {
                    self.buckets.pop_front();
                }
                while self.buckets.len() > self.capacity {
                    self.buckets.pop_front();
                }
            }
            Some(_) => {
                // Late sample: insert in order if still within retention
                let oldest_allowed = newest.unwrap_or(start)
                    - self.bucket_seconds * (self.capacity as i64 - 1);
                if start < oldest_allowed {
                    return None;
                }
                if !self.buckets.iter().any(|b| b.start == start) {
                    let position = self
                        .buckets
                        .iter()
                        .position(|b| b.start > start)
                        .unwrap_or(self.buckets.len());
                    self.buckets.insert(position, Bucket::new(start));
                    while self.buckets.len() > self.capacity {
                        self.buckets.pop_front();
                    }
                }
            }
        }

        self.buckets.iter_mut().find(|b| b.start == start)
    }
}
