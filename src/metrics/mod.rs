//! # Metrics Store
//!
//! Bounded, windowed counters and latency histograms keyed by
//! `(model_name, version)`. Each series sits behind its own mutex so that
//! concurrent writers to different series never contend, and concurrent
//! writers to the same series never lose samples.

pub mod histogram;
pub mod window;

pub use histogram::{LatencyHistogram, LATENCY_BOUNDS_MS};
pub use window::{GaugeStat, WindowAggregate, WindowedSeries};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifies one monitored model version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub model_name: String,
    pub version: u64,
}

impl SeriesKey {
    pub fn new(model_name: impl Into<String>, version: u64) -> Self {
        Self {
            model_name: model_name.into(),
            version,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.model_name, self.version)
    }
}

#[derive(Debug)]
pub struct MetricsStore {
    bucket_seconds: u64,
    retention_seconds: u64,
    series: DashMap<SeriesKey, Arc<Mutex<WindowedSeries>>>,
}

impl MetricsStore {
    pub fn new(bucket_seconds: u64, retention_seconds: u64) -> Self {
        Self {
            bucket_seconds,
            retention_seconds,
            series: DashMap::new(),
        }
    }

    fn series_for(&self, key: &SeriesKey) -> Arc<Mutex<WindowedSeries>> {
        if let Some(existing) = self.series.get(key) {
            return existing.value().clone();
        }
        self.series
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(WindowedSeries::new(
                    self.bucket_seconds,
                    self.retention_seconds,
                )))
            })
            .value()
            .clone()
    }

    pub fn record_request(
        &self,
        key: &SeriesKey,
        at: DateTime<Utc>,
        latency_ms: f64,
        success: bool,
    ) {
        let series = self.series_for(key);
        series.lock().record_request(at, latency_ms, success);
    }

    pub fn record_gauge(&self, key: &SeriesKey, at: DateTime<Utc>, name: &str, value: f64) {
        let series = self.series_for(key);
        series.lock().record_gauge(at, name, value);
    }

    /// Windowed aggregate for one series; `None` if the series was never seen
    pub fn aggregate(
        &self,
        key: &SeriesKey,
        now: DateTime<Utc>,
        window_seconds: u64,
    ) -> Option<WindowAggregate> {
        let series = self.series.get(key)?.value().clone();
        let aggregate = series.lock().aggregate(now, window_seconds);
        Some(aggregate)
    }

    /// Lifetime `(requests, errors)` for one series
    pub fn totals(&self, key: &SeriesKey) -> Option<(u64, u64)> {
        let series = self.series.get(key)?.value().clone();
        let guard = series.lock();
        Some((guard.total_requests(), guard.total_errors()))
    }

    /// Timestamp of the newest request recorded for one series
    pub fn last_seen(&self, key: &SeriesKey) -> Option<DateTime<Utc>> {
        let series = self.series.get(key)?.value().clone();
        let last_seen = series.lock().last_seen();
        last_seen
    }

    pub fn contains(&self, key: &SeriesKey) -> bool {
        self.series.contains_key(key)
    }

    /// All tracked series, sorted for stable iteration
    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.series.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn bucket_seconds(&self) -> u64 {
        self.bucket_seconds
    }

    pub fn retention_seconds(&self) -> u64 {
        self.retention_seconds
    }
}
