use crate::error::{ModelOpsError, Result};
use crate::state_machine::ExperimentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Tolerance when checking traffic shares against 100%
const TRAFFIC_EPSILON: f64 = 1e-9;

/// How requests are spread over variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Sticky hash of the caller identifier; uniform random without one
    #[default]
    Fixed,
    /// Uniform random weighted by traffic share on every request
    Random,
}

/// One arm of an experiment, bound to a registered model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub model_name: String,
    pub model_version: u64,
    pub traffic_percentage: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Variant {
    pub fn new(
        name: impl Into<String>,
        model_name: impl Into<String>,
        model_version: u64,
        traffic_percentage: f64,
    ) -> Self {
        Self {
            name: name.into(),
            model_name: model_name.into(),
            model_version,
            traffic_percentage,
            metadata: BTreeMap::new(),
        }
    }
}

/// Target and weight of one success metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessMetric {
    pub threshold: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Assigned on creation when left empty
    pub experiment_id: String,
    pub name: String,
    pub description: Option<String>,
    pub model_type: String,
    pub variants: Vec<Variant>,
    pub status: ExperimentStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub allocation_strategy: AllocationStrategy,
    pub success_metrics: BTreeMap<String, SuccessMetric>,
    /// Per-variant sample size required before a winner can be declared
    pub minimum_sample_size: u64,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        model_type: impl Into<String>,
        variants: Vec<Variant>,
    ) -> Self {
        Self {
            experiment_id: String::new(),
            name: name.into(),
            description: None,
            model_type: model_type.into(),
            variants,
            status: ExperimentStatus::Pending,
            start_time: None,
            end_time: None,
            allocation_strategy: AllocationStrategy::default(),
            success_metrics: BTreeMap::from([(
                "success_rate".to_string(),
                SuccessMetric {
                    threshold: 0.0,
                    weight: 1.0,
                },
            )]),
            minimum_sample_size: 0,
        }
    }

    /// Use a caller-chosen id instead of a generated one
    pub fn with_experiment_id(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = experiment_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_minimum_sample_size(mut self, minimum_sample_size: u64) -> Self {
        self.minimum_sample_size = minimum_sample_size;
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = strategy;
        self
    }

    /// Replace the default `success_rate` weighting with explicit metrics
    pub fn with_success_metrics(mut self, metrics: BTreeMap<String, SuccessMetric>) -> Self {
        self.success_metrics = metrics;
        self
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn total_traffic(&self) -> f64 {
        self.variants.iter().map(|v| v.traffic_percentage).sum()
    }

    /// Structural checks that need no other experiment for context
    pub fn validate(&self) -> Result<()> {
        if self.model_type.trim().is_empty() {
            return Err(ModelOpsError::Validation(
                "experiment model_type must not be empty".to_string(),
            ));
        }

        if self.variants.len() < 2 {
            return Err(ModelOpsError::Validation(format!(
                "experiment '{}' needs at least 2 variants, got {}",
                self.name,
                self.variants.len()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for variant in &self.variants {
            if !seen.insert(variant.name.as_str()) {
                return Err(ModelOpsError::Validation(format!(
                    "duplicate variant name '{}'",
                    variant.name
                )));
            }
            if !variant.traffic_percentage.is_finite() || variant.traffic_percentage < 0.0 {
                return Err(ModelOpsError::Validation(format!(
                    "variant '{}' has invalid traffic percentage {}",
                    variant.name, variant.traffic_percentage
                )));
            }
        }

        let total = self.total_traffic();
        if total > 100.0 + TRAFFIC_EPSILON {
            return Err(ModelOpsError::Validation(format!(
                "variant traffic sums to {total}%, which exceeds 100%"
            )));
        }

        for (name, metric) in &self.success_metrics {
            if !metric.weight.is_finite() || metric.weight < 0.0 {
                return Err(ModelOpsError::Validation(format!(
                    "success metric '{name}' has invalid weight {}",
                    metric.weight
                )));
            }
        }

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end <= start {
                return Err(ModelOpsError::Validation(
                    "experiment end_time must be after start_time".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Append-only record of one request served inside an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub experiment_id: String,
    pub variant_name: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ExperimentResult {
    pub fn new(
        experiment_id: impl Into<String>,
        variant_name: impl Into<String>,
        request_id: impl Into<String>,
        success: bool,
        latency_ms: f64,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            variant_name: variant_name.into(),
            request_id: request_id.into(),
            timestamp: Utc::now(),
            success,
            latency_ms,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Aggregated outcome of one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResults {
    pub variant_name: String,
    pub model_name: String,
    pub model_version: u64,
    pub sample_size: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    /// Mean of every custom metric reported for this variant
    pub metrics: BTreeMap<String, f64>,
    pub reached_minimum: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub minimum_sample_size: u64,
    pub total_samples: u64,
    pub variants: Vec<VariantResults>,
    /// Every variant reached `minimum_sample_size`
    pub minimum_reached: bool,
}

impl ExperimentResults {
    pub fn variant(&self, name: &str) -> Option<&VariantResults> {
        self.variants.iter().find(|v| v.variant_name == name)
    }
}

/// Output of `recommend_winner`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum WinnerRecommendation {
    Winner {
        variant_name: String,
        score: f64,
        /// Largest p-value among the pairwise tests against other variants
        p_value: f64,
        scores: BTreeMap<String, f64>,
    },
    Inconclusive {
        reason: String,
        scores: BTreeMap<String, f64>,
    },
}

impl WinnerRecommendation {
    pub fn winner(&self) -> Option<&str> {
        match self {
            Self::Winner { variant_name, .. } => Some(variant_name),
            Self::Inconclusive { .. } => None,
        }
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Self::Inconclusive { .. })
    }
}
