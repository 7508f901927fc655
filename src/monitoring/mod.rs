//! # Model Monitor
//!
//! Per-version health tracking for served models: windowed success rate and
//! latency, threshold alerts, population-stability drift against a training
//! baseline, and periodic process resource snapshots.
//!
//! `ModelMonitor::record_prediction` sits on the serving path and is
//! infallible. Alert evaluation and resource sampling run on a background
//! loop owned by [`MonitorHandle`].

pub mod alerts;
pub mod drift;
pub mod handle;
pub mod monitor;
pub mod resources;

pub use alerts::{
    default_alerts, ActiveAlert, Alert, AlertCondition, AlertMetric, AlertSeverity,
    DRIFT_SCORE_GAUGE,
};
pub use drift::{
    population_stability_index, score_drift, DriftRecommendation, DriftReport, FeatureBaseline,
    FeatureBins, FeatureVector,
};
pub use handle::MonitorHandle;
pub use monitor::{
    DashboardStatistics, HealthStatus, ModelDashboard, ModelMonitor, PerformanceTrend,
    DEFAULT_DASHBOARD_WINDOW_SECONDS, PREDICTION_GAUGE,
};
pub use resources::{ResourceSampler, ResourceSnapshot};
