use super::alerts::{ActiveAlert, Alert, AlertSeverity, DRIFT_SCORE_GAUGE};
use super::drift::{score_drift, DriftReport, FeatureBaseline, FeatureVector};
use super::resources::{ResourceSampler, ResourceSnapshot};
use crate::clock::{system_clock, SharedClock};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::events::{names, EventPublisher};
use crate::metrics::{MetricsStore, SeriesKey, WindowAggregate};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Window the dashboard statistics cover unless asked otherwise
pub const DEFAULT_DASHBOARD_WINDOW_SECONDS: u64 = 300;

/// Gauge recording numeric prediction outputs
pub const PREDICTION_GAUGE: &str = "prediction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Worst severity among currently firing alerts decides health
    pub fn from_alerts(alerts: &[ActiveAlert]) -> Self {
        match alerts.iter().map(|a| a.severity).max() {
            Some(AlertSeverity::Critical) => Self::Critical,
            Some(_) => Self::Degraded,
            None => Self::Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTrend {
    Improving,
    Stable,
    Degrading,
    /// Not enough data in one of the window halves
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DashboardStatistics {
    pub request_count: u64,
    pub error_count: u64,
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
    pub total_requests: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl DashboardStatistics {
    fn from_aggregate(aggregate: &WindowAggregate, totals: Option<(u64, u64)>) -> Self {
        Self {
            request_count: aggregate.requests,
            error_count: aggregate.errors,
            success_rate: aggregate.success_rate(),
            avg_latency_ms: aggregate.latency.mean(),
            latency_p50: aggregate.latency.percentile(50.0),
            latency_p95: aggregate.latency.percentile(95.0),
            latency_p99: aggregate.latency.percentile(99.0),
            total_requests: totals.map_or(0, |(requests, _)| requests),
            last_seen: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDashboard {
    pub model_name: String,
    pub version: u64,
    pub health_status: HealthStatus,
    pub window_seconds: u64,
    pub statistics: DashboardStatistics,
    pub performance_trend: PerformanceTrend,
    pub active_alerts: Vec<ActiveAlert>,
    pub drift: DriftReport,
    pub resources: Option<ResourceSnapshot>,
    pub generated_at: DateTime<Utc>,
}

/// Health, drift and alerting for served model versions.
///
/// The recording path (`record_prediction`) never returns an error and only
/// touches per-series locks; alert evaluation runs separately, usually from
/// the background loop owned by [`MonitorHandle`](super::MonitorHandle).
pub struct ModelMonitor {
    config: MonitorConfig,
    metrics: MetricsStore,
    alerts: RwLock<Vec<Alert>>,
    active: Mutex<HashMap<(String, SeriesKey), ActiveAlert>>,
    baselines: DashMap<SeriesKey, FeatureBaseline>,
    feature_windows: DashMap<SeriesKey, Arc<Mutex<VecDeque<FeatureVector>>>>,
    resources: RwLock<HashMap<String, ResourceSnapshot>>,
    sampler: ResourceSampler,
    events: EventPublisher,
    clock: SharedClock,
}

impl fmt::Debug for ModelMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelMonitor")
            .field("series", &self.metrics.keys().len())
            .field("alerts", &self.alerts.read().len())
            .finish()
    }
}

impl ModelMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_parts(config, EventPublisher::default(), system_clock())
    }

    pub fn with_parts(config: MonitorConfig, events: EventPublisher, clock: SharedClock) -> Self {
        info!(
            bucket_seconds = config.bucket_seconds,
            retention_seconds = config.retention_seconds,
            drift_threshold = config.drift_threshold,
            "📊 MONITOR: Creating model monitor"
        );
        Self {
            metrics: MetricsStore::new(config.bucket_seconds, config.retention_seconds),
            config,
            alerts: RwLock::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            baselines: DashMap::new(),
            feature_windows: DashMap::new(),
            resources: RwLock::new(HashMap::new()),
            sampler: ResourceSampler::new(),
            events,
            clock,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record one served prediction. Best-effort: bad samples are logged and
    /// dropped, nothing is ever returned to the serving path.
    pub fn record_prediction(
        &self,
        model_name: &str,
        version: u64,
        latency_ms: f64,
        success: bool,
        features: Option<&FeatureVector>,
        prediction: Option<&Value>,
    ) {
        let key = SeriesKey::new(model_name, version);
        let now = self.clock.now();

        if !latency_ms.is_finite() || latency_ms < 0.0 {
            debug!(series = %key, latency_ms, "Dropping latency sample outside the valid range");
        }
        self.metrics.record_request(&key, now, latency_ms, success);

        if let Some(value) = prediction.and_then(Value::as_f64) {
            self.metrics.record_gauge(&key, now, PREDICTION_GAUGE, value);
        }

        if let Some(features) = features {
            self.push_features(&key, features.clone());
        }
    }

    fn feature_window(&self, key: &SeriesKey) -> Arc<Mutex<VecDeque<FeatureVector>>> {
        self.feature_windows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .value()
            .clone()
    }

    fn push_features(&self, key: &SeriesKey, features: FeatureVector) {
        let window = self.feature_window(key);
        let mut window = window.lock();
        window.push_back(features);
        while window.len() > self.config.drift_window.max(1) {
            window.pop_front();
        }
    }

    pub fn set_baseline(&self, model_name: &str, version: u64, baseline: FeatureBaseline) {
        info!(
            model_name = %model_name,
            version,
            features = baseline.features.len(),
            "📊 MONITOR: Drift baseline set"
        );
        self.baselines.insert(SeriesKey::new(model_name, version), baseline);
    }

    /// Add `feature_vector` to the observed window and score the window
    /// against the baseline
    pub fn detect_drift(
        &self,
        model_name: &str,
        version: u64,
        feature_vector: &FeatureVector,
    ) -> DriftReport {
        let key = SeriesKey::new(model_name, version);
        self.push_features(&key, feature_vector.clone());
        self.score_and_record(&key)
    }

    /// Score the current observed window without adding to it
    pub fn drift_report(&self, model_name: &str, version: u64) -> DriftReport {
        let key = SeriesKey::new(model_name, version);
        self.current_drift(&key)
    }

    fn current_drift(&self, key: &SeriesKey) -> DriftReport {
        let Some(baseline) = self.baselines.get(key).map(|b| b.value().clone()) else {
            return DriftReport::insufficient(0);
        };
        let window = self.feature_window(key);
        let window = window.lock();
        score_drift(
            &baseline,
            window.iter(),
            window.len(),
            self.config.min_drift_samples,
            self.config.drift_threshold,
        )
    }

    fn score_and_record(&self, key: &SeriesKey) -> DriftReport {
        let report = self.current_drift(key);
        if report.recommendation != super::drift::DriftRecommendation::InsufficientData {
            self.metrics
                .record_gauge(key, self.clock.now(), DRIFT_SCORE_GAUGE, report.score);
        }
        if report.has_drift {
            debug!(series = %key, score = report.score, "📊 MONITOR: Drift above threshold");
        }
        report
    }

    /// Register (or replace, by name and scope) an alert rule
    pub fn add_alert(&self, alert: Alert) -> Result<()> {
        alert.validate()?;
        let mut alerts = self.alerts.write();
        alerts.retain(|a| !(a.name == alert.name && a.model_name == alert.model_name));
        info!(
            alert = %alert.name,
            metric = %alert.metric,
            condition = %alert.condition,
            threshold = alert.threshold,
            "📊 MONITOR: Alert registered"
        );
        alerts.push(alert);
        Ok(())
    }

    /// Returns how many rules were removed
    pub fn remove_alert(&self, name: &str) -> usize {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.name != name);
        let removed = before - alerts.len();
        if removed > 0 {
            self.active.lock().retain(|(alert_name, _), _| alert_name != name);
        }
        removed
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    /// Evaluate every rule against every tracked series it applies to.
    /// Returns the alerts firing now; alerts whose aggregate returned
    /// in-bounds are cleared.
    pub fn check_alerts(&self) -> Vec<ActiveAlert> {
        let now = self.clock.now();
        let alerts = self.alerts.read().clone();
        let keys = self.metrics.keys();

        let mut firing: HashMap<(String, SeriesKey), (Alert, f64)> = HashMap::new();
        for alert in &alerts {
            for key in keys.iter().filter(|key| alert.applies_to(key)) {
                if let Some(value) = self.evaluate(alert, key, now) {
                    firing.insert((alert.name.clone(), key.clone()), (alert.clone(), value));
                }
            }
        }

        let mut active = self.active.lock();

        let cleared: Vec<(String, SeriesKey)> = active
            .keys()
            .filter(|k| !firing.contains_key(*k))
            .cloned()
            .collect();
        for id in cleared {
            if let Some(previous) = active.remove(&id) {
                info!(
                    alert = %previous.alert_name,
                    series = %id.1,
                    "📊 MONITOR: Alert cleared"
                );
                self.events.publish(
                    names::ALERT_CLEARED,
                    json!({
                        "alert_name": previous.alert_name,
                        "model_name": previous.model_name,
                        "version": previous.version,
                    }),
                );
            }
        }

        for (id, (alert, value)) in firing {
            let message = alert.render_message(value, &id.1);
            match active.get_mut(&id) {
                Some(existing) => {
                    existing.value = value;
                    existing.message = message;
                }
                None => {
                    warn!(
                        alert = %alert.name,
                        series = %id.1,
                        severity = %alert.severity,
                        value,
                        "📊 MONITOR: Alert fired - {message}"
                    );
                    let fired = ActiveAlert {
                        alert_name: alert.name.clone(),
                        model_name: id.1.model_name.clone(),
                        version: id.1.version,
                        severity: alert.severity,
                        metric: alert.metric,
                        value,
                        threshold: alert.threshold,
                        message,
                        fired_at: now,
                    };
                    if let Err(e) = self.events.publish_serialized(names::ALERT_FIRED, &fired) {
                        debug!(error = %e, "Could not serialize alert event");
                    }
                    active.insert(id, fired);
                }
            }
        }

        let mut current: Vec<ActiveAlert> = active.values().cloned().collect();
        current.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.alert_name.cmp(&b.alert_name))
                .then_with(|| a.model_name.cmp(&b.model_name))
                .then_with(|| a.version.cmp(&b.version))
        });
        current
    }

    /// `Some(value)` when the alert's condition holds for the series now
    fn evaluate(&self, alert: &Alert, key: &SeriesKey, now: DateTime<Utc>) -> Option<f64> {
        let aggregate = self.metrics.aggregate(key, now, alert.window_seconds)?;
        let value = alert.metric.value(&aggregate)?;
        alert.is_triggered(value).then_some(value)
    }

    /// Alerts that fire for one series right now, evaluated fresh
    pub fn alerts_for(&self, model_name: &str, version: u64) -> Vec<ActiveAlert> {
        let key = SeriesKey::new(model_name, version);
        let now = self.clock.now();
        let alerts = self.alerts.read().clone();
        let active = self.active.lock();

        let mut current: Vec<ActiveAlert> = alerts
            .iter()
            .filter(|alert| alert.applies_to(&key))
            .filter_map(|alert| {
                let value = self.evaluate(alert, &key, now)?;
                let fired_at = active
                    .get(&(alert.name.clone(), key.clone()))
                    .map_or(now, |existing| existing.fired_at);
                Some(ActiveAlert {
                    alert_name: alert.name.clone(),
                    model_name: key.model_name.clone(),
                    version: key.version,
                    severity: alert.severity,
                    metric: alert.metric,
                    value,
                    threshold: alert.threshold,
                    message: alert.render_message(value, &key),
                    fired_at,
                })
            })
            .collect();
        current.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.alert_name.cmp(&b.alert_name))
        });
        current
    }

    pub fn get_model_dashboard(&self, model_name: &str, version: u64) -> ModelDashboard {
        self.get_model_dashboard_with_window(model_name, version, DEFAULT_DASHBOARD_WINDOW_SECONDS)
    }

    /// Health summary for one version. Unknown or sparse series produce a
    /// neutral dashboard rather than an error.
    pub fn get_model_dashboard_with_window(
        &self,
        model_name: &str,
        version: u64,
        window_seconds: u64,
    ) -> ModelDashboard {
        let key = SeriesKey::new(model_name, version);
        let now = self.clock.now();
        let window_seconds = window_seconds.max(1);

        let aggregate = self
            .metrics
            .aggregate(&key, now, window_seconds)
            .unwrap_or_default();
        let mut statistics =
            DashboardStatistics::from_aggregate(&aggregate, self.metrics.totals(&key));
        statistics.last_seen = self.metrics.last_seen(&key);

        let active_alerts = self.alerts_for(model_name, version);
        let health_status = HealthStatus::from_alerts(&active_alerts);

        ModelDashboard {
            model_name: model_name.to_string(),
            version,
            health_status,
            window_seconds,
            statistics,
            performance_trend: self.performance_trend(&key, now, window_seconds),
            active_alerts,
            drift: self.current_drift(&key),
            resources: self.resources.read().get(model_name).cloned(),
            generated_at: now,
        }
    }

    /// Success rate of the newer half of the window against the older half
    fn performance_trend(
        &self,
        key: &SeriesKey,
        now: DateTime<Utc>,
        window_seconds: u64,
    ) -> PerformanceTrend {
        let half = (window_seconds / 2).max(1);
        let recent = self
            .metrics
            .aggregate(key, now, half)
            .and_then(|a| a.success_rate());
        let older = self
            .metrics
            .aggregate(key, now - ChronoDuration::seconds(half as i64), half)
            .and_then(|a| a.success_rate());

        match (recent, older) {
            (Some(recent), Some(older)) => {
                let change = recent - older;
                if change > self.config.trend_band {
                    PerformanceTrend::Improving
                } else if change < -self.config.trend_band {
                    PerformanceTrend::Degrading
                } else {
                    PerformanceTrend::Stable
                }
            }
            _ => PerformanceTrend::Unknown,
        }
    }

    /// Take a resource snapshot and attach it to `model_name`'s dashboard
    pub fn record_resource_usage(&self, model_name: &str) -> ResourceSnapshot {
        let snapshot = self.sampler.sample(self.clock.now());
        debug!(
            model_name = %model_name,
            memory_mb = snapshot.process_memory_mb(),
            cpu_percent = snapshot.process_cpu_percent,
            "📊 MONITOR: Resource snapshot"
        );
        self.resources
            .write()
            .insert(model_name.to_string(), snapshot.clone());
        snapshot
    }

    /// Distinct model names with recorded predictions
    pub fn tracked_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .metrics
            .keys()
            .into_iter()
            .map(|key| key.model_name)
            .collect();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::monitoring::alerts::{default_alerts, AlertCondition, AlertMetric};
    use chrono::TimeZone;

    fn monitor() -> (ModelMonitor, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap());
        let monitor = ModelMonitor::with_parts(
            MonitorConfig::default(),
            EventPublisher::default(),
            Arc::new(clock.clone()),
        );
        (monitor, clock)
    }

    fn low_success_alert() -> Alert {
        Alert::new(
            "low_success_rate",
            AlertMetric::SuccessRate,
            AlertCondition::LessThan,
            0.9,
            300,
            AlertSeverity::Critical,
        )
    }

    #[test]
    fn test_unknown_series_dashboard_is_neutral() {
        let (monitor, _) = monitor();
        let dashboard = monitor.get_model_dashboard("ranker", 1);
        assert_eq!(dashboard.health_status, HealthStatus::Healthy);
        assert_eq!(dashboard.statistics.success_rate, None);
        assert_eq!(dashboard.performance_trend, PerformanceTrend::Unknown);
        assert!(!dashboard.drift.has_drift);
    }

    #[test]
    fn test_record_prediction_tolerates_bad_samples() {
        let (monitor, _) = monitor();
        monitor.record_prediction("ranker", 1, f64::NAN, true, None, Some(&json!("label")));
        monitor.record_prediction("ranker", 1, -5.0, false, None, Some(&json!(0.7)));

        let dashboard = monitor.get_model_dashboard("ranker", 1);
        assert_eq!(dashboard.statistics.request_count, 2);
        assert_eq!(dashboard.statistics.error_count, 1);
    }

    #[test]
    fn test_alert_fires_and_clears() {
        let (monitor, clock) = monitor();
        monitor.add_alert(low_success_alert()).unwrap();

        for i in 0..100 {
            monitor.record_prediction("ranker", 2, 20.0, i % 5 != 0, None, None);
        }
        let firing = monitor.check_alerts();
        assert_eq!(firing.len(), 1);
        assert_eq!(firing[0].severity, AlertSeverity::Critical);
        assert!((firing[0].value - 0.8).abs() < 1e-9);
        assert_eq!(
            monitor.get_model_dashboard("ranker", 2).health_status,
            HealthStatus::Critical
        );

        // the bad minutes roll out of the window and healthy traffic follows
        clock.advance(ChronoDuration::seconds(400));
        for _ in 0..100 {
            monitor.record_prediction("ranker", 2, 20.0, true, None, None);
        }
        assert!(monitor.check_alerts().is_empty());
        assert_eq!(
            monitor.get_model_dashboard("ranker", 2).health_status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_alert_threshold_boundary() {
        let (monitor, _) = monitor();
        monitor.add_alert(low_success_alert()).unwrap();

        for i in 0..10 {
            monitor.record_prediction("ranker", 1, 5.0, i != 0, None, None);
        }
        // exactly 0.9 is not < 0.9
        assert!(monitor.check_alerts().is_empty());

        monitor.record_prediction("ranker", 1, 5.0, false, None, None);
        assert_eq!(monitor.check_alerts().len(), 1);
    }

    #[test]
    fn test_lower_severity_alert_degrades() {
        let (monitor, _) = monitor();
        for alert in default_alerts("ranker") {
            monitor.add_alert(alert).unwrap();
        }
        for _ in 0..20 {
            monitor.record_prediction("ranker", 3, 250.0, true, None, None);
        }
        let dashboard = monitor.get_model_dashboard("ranker", 3);
        assert_eq!(dashboard.health_status, HealthStatus::Degraded);
        assert_eq!(dashboard.active_alerts[0].alert_name, "high_latency");

        // scoped to another model
        for _ in 0..20 {
            monitor.record_prediction("classifier", 1, 250.0, true, None, None);
        }
        assert_eq!(
            monitor.get_model_dashboard("classifier", 1).health_status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_performance_trend() {
        let (monitor, clock) = monitor();
        for i in 0..100 {
            monitor.record_prediction("ranker", 1, 5.0, i % 2 == 0, None, None);
        }
        clock.advance(ChronoDuration::seconds(200));
        for _ in 0..100 {
            monitor.record_prediction("ranker", 1, 5.0, true, None, None);
        }
        let dashboard = monitor.get_model_dashboard("ranker", 1);
        assert_eq!(dashboard.performance_trend, PerformanceTrend::Improving);
    }

    #[test]
    fn test_drift_against_baseline() {
        let (monitor, _) = monitor();
        let training: Vec<FeatureVector> = (0..500)
            .map(|i| FeatureVector::from([("hour".to_string(), (i % 24) as f64)]))
            .collect();
        monitor.set_baseline(
            "ranker",
            1,
            FeatureBaseline::from_samples(&training, 10).unwrap(),
        );

        let mut last = None;
        for sample in &training {
            last = Some(monitor.detect_drift("ranker", 1, sample));
        }
        let report = last.unwrap();
        assert!(!report.has_drift);
        assert!(report.score < 1e-3, "score {}", report.score);

        let no_baseline = monitor.detect_drift("ranker", 2, &training[0]);
        assert_eq!(
            no_baseline.recommendation,
            crate::monitoring::DriftRecommendation::InsufficientData
        );
    }

    #[test]
    fn test_resource_usage_lands_on_dashboard() {
        let (monitor, _) = monitor();
        monitor.record_resource_usage("ranker");
        assert!(monitor.get_model_dashboard("ranker", 1).resources.is_some());
    }
}
