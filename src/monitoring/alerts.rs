//! Alert rules.
//!
//! An alert is a stateless rule `aggregate(metric over window) <condition>
//! threshold`. Whether it currently fires is decided on every evaluation, so
//! an alert clears as soon as its aggregate returns in-bounds.

use crate::error::{ModelOpsError, Result};
use crate::metrics::{SeriesKey, WindowAggregate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Gauge name drift scores are recorded under
pub const DRIFT_SCORE_GAUGE: &str = "drift_score";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    SuccessRate,
    ErrorRate,
    AvgLatencyMs,
    LatencyP50,
    LatencyP95,
    LatencyP99,
    RequestCount,
    DriftScore,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuccessRate => "success_rate",
            Self::ErrorRate => "error_rate",
            Self::AvgLatencyMs => "avg_latency_ms",
            Self::LatencyP50 => "latency_p50",
            Self::LatencyP95 => "latency_p95",
            Self::LatencyP99 => "latency_p99",
            Self::RequestCount => "request_count",
            Self::DriftScore => "drift_score",
        }
    }

    /// Current value over a window; `None` when the window holds no data
    pub fn value(&self, aggregate: &WindowAggregate) -> Option<f64> {
        match self {
            Self::SuccessRate => aggregate.success_rate(),
            Self::ErrorRate => aggregate.error_rate(),
            Self::AvgLatencyMs => aggregate.latency.mean(),
            Self::LatencyP50 => aggregate.latency.percentile(50.0),
            Self::LatencyP95 => aggregate.latency.percentile(95.0),
            Self::LatencyP99 => aggregate.latency.percentile(99.0),
            Self::RequestCount => Some(aggregate.requests as f64),
            Self::DriftScore => aggregate.gauge_mean(DRIFT_SCORE_GAUGE),
        }
    }
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertMetric {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success_rate" => Ok(Self::SuccessRate),
            "error_rate" => Ok(Self::ErrorRate),
            "avg_latency_ms" | "latency_ms" => Ok(Self::AvgLatencyMs),
            "latency_p50" => Ok(Self::LatencyP50),
            "latency_p95" => Ok(Self::LatencyP95),
            "latency_p99" => Ok(Self::LatencyP99),
            "request_count" => Ok(Self::RequestCount),
            "drift_score" => Ok(Self::DriftScore),
            other => Err(ModelOpsError::Validation(format!(
                "unsupported alert metric '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertCondition {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl AlertCondition {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() <= f64::EPSILON * threshold.abs().max(1.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
        }
    }
}

impl fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertCondition {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            ">" => Ok(Self::GreaterThan),
            ">=" => Ok(Self::GreaterOrEqual),
            "<" => Ok(Self::LessThan),
            "<=" => Ok(Self::LessOrEqual),
            "==" | "=" => Ok(Self::Equal),
            other => Err(ModelOpsError::Validation(format!(
                "unsupported alert condition '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub name: String,
    pub metric: AlertMetric,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub window_seconds: u64,
    pub severity: AlertSeverity,
    /// Supports `{value}`, `{threshold}`, `{model_name}` and `{version}`
    pub message_template: String,
    /// Only evaluate for this model; every tracked series when `None`
    #[serde(default)]
    pub model_name: Option<String>,
}

impl Alert {
    pub fn new(
        name: impl Into<String>,
        metric: AlertMetric,
        condition: AlertCondition,
        threshold: f64,
        window_seconds: u64,
        severity: AlertSeverity,
    ) -> Self {
        let name = name.into();
        Self {
            message_template: format!(
                "{name}: {metric} is {{value}} ({condition} {{threshold}}) for {{model_name}} v{{version}}"
            ),
            name,
            metric,
            condition,
            threshold,
            window_seconds,
            severity,
            model_name: None,
        }
    }

    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message_template = template.into();
        self
    }

    pub fn for_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ModelOpsError::Validation("alert name must not be empty".to_string()));
        }
        if self.window_seconds == 0 {
            return Err(ModelOpsError::Validation(format!(
                "alert '{}' needs a window of at least one second",
                self.name
            )));
        }
        if !self.threshold.is_finite() {
            return Err(ModelOpsError::Validation(format!(
                "alert '{}' has a non-finite threshold",
                self.name
            )));
        }
        Ok(())
    }

    pub fn applies_to(&self, key: &SeriesKey) -> bool {
        self.model_name
            .as_deref()
            .map_or(true, |name| name == key.model_name)
    }

    pub fn is_triggered(&self, value: f64) -> bool {
        self.condition.holds(value, self.threshold)
    }

    pub fn render_message(&self, value: f64, key: &SeriesKey) -> String {
        self.message_template
            .replace("{value}", &format!("{value:.4}"))
            .replace("{threshold}", &self.threshold.to_string())
            .replace("{model_name}", &key.model_name)
            .replace("{version}", &key.version.to_string())
    }
}

/// An alert currently firing for one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub alert_name: String,
    pub model_name: String,
    pub version: u64,
    pub severity: AlertSeverity,
    pub metric: AlertMetric,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    /// First evaluation at which the alert fired in its current episode
    pub fired_at: DateTime<Utc>,
}

/// Default rule set watching one model
pub fn default_alerts(model_name: &str) -> Vec<Alert> {
    vec![
        Alert::new(
            "low_success_rate",
            AlertMetric::SuccessRate,
            AlertCondition::LessThan,
            0.95,
            300,
            AlertSeverity::Critical,
        )
        .with_message("Success rate for {model_name} v{version} dropped to {value} (threshold {threshold})")
        .for_model(model_name),
        Alert::new(
            "high_latency",
            AlertMetric::AvgLatencyMs,
            AlertCondition::GreaterThan,
            100.0,
            300,
            AlertSeverity::Warning,
        )
        .with_message("Average latency for {model_name} v{version} is {value}ms (threshold {threshold}ms)")
        .for_model(model_name),
        Alert::new(
            "data_drift",
            AlertMetric::DriftScore,
            AlertCondition::GreaterThan,
            0.15,
            600,
            AlertSeverity::Warning,
        )
        .with_message("Drift score for {model_name} v{version} is {value} (threshold {threshold})")
        .for_model(model_name),
    ]
}
