use crate::error::ModelOpsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named numeric metrics reported by training or by an experiment
pub type ModelMetrics = BTreeMap<String, f64>;

/// Free-form string tags attached to a version
pub type ModelTags = BTreeMap<String, String>;

/// Lifecycle slot a model version occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStage {
    #[default]
    None,
    Staging,
    Production,
    Archived,
}

impl ModelStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelStage {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            "archived" => Ok(Self::Archived),
            other => Err(ModelOpsError::Validation(format!(
                "Invalid model stage: {other}"
            ))),
        }
    }
}

/// Metadata for one registered version of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model_name: String,
    /// Monotonic per model name, starting at 1
    pub version: u64,
    pub stage: ModelStage,
    pub created_at: DateTime<Utc>,
    pub metrics: ModelMetrics,
    pub tags: ModelTags,
    pub description: Option<String>,
    pub artifact_type: String,
    /// Key of the persisted artifact payload, `<model_name>/v<version>`
    pub artifact_ref: String,
}

impl ModelVersion {
    pub fn artifact_ref_for(model_name: &str, version: u64) -> String {
        format!("{model_name}/v{version}")
    }

    pub fn is_production(&self) -> bool {
        self.stage == ModelStage::Production
    }
}

/// Everything needed to create a version; the store assigns the number
#[derive(Debug, Clone, PartialEq)]
pub struct NewModelVersion {
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub metrics: ModelMetrics,
    pub tags: ModelTags,
    pub description: Option<String>,
    pub artifact_type: String,
}

/// Selects a version by number or by the stage it occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Version(u64),
    Stage(ModelStage),
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(version) => write!(f, "version {version}"),
            Self::Stage(stage) => write!(f, "stage {stage}"),
        }
    }
}

impl From<u64> for VersionSelector {
    fn from(version: u64) -> Self {
        Self::Version(version)
    }
}

impl From<ModelStage> for VersionSelector {
    fn from(stage: ModelStage) -> Self {
        Self::Stage(stage)
    }
}

/// Result of a `promote` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionOutcome {
    /// False when the version already held the target stage
    pub changed: bool,
    /// Previous Production holder demoted to Archived by this promotion
    pub archived: Option<u64>,
}

/// Version metadata plus how its metrics moved relative to its predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLineage {
    pub model_name: String,
    pub version: u64,
    pub stage: ModelStage,
    pub created_at: DateTime<Utc>,
    pub metrics: ModelMetrics,
    pub tags: ModelTags,
    pub description: Option<String>,
    pub artifact_type: String,
    pub previous_version: Option<u64>,
    /// `metric(this) - metric(previous)` for metrics both versions report
    pub metric_changes: ModelMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub v1: f64,
    pub v2: f64,
    pub diff: f64,
    /// `None` when `v1` is zero
    pub pct_change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionComparison {
    pub model_name: String,
    pub version1: u64,
    pub version2: u64,
    pub stage1: ModelStage,
    pub stage2: ModelStage,
    /// Positive when `version2` is newer
    pub created_diff_days: f64,
    pub metrics: BTreeMap<String, MetricComparison>,
}

impl VersionComparison {
    pub fn between(v1: &ModelVersion, v2: &ModelVersion) -> Self {
        let metrics = v1
            .metrics
            .iter()
            .filter_map(|(name, a)| {
                v2.metrics.get(name).map(|b| {
                    let pct_change = (*a != 0.0).then(|| (b - a) / a.abs() * 100.0);
                    (
                        name.clone(),
                        MetricComparison {
                            v1: *a,
                            v2: *b,
                            diff: b - a,
                            pct_change,
                        },
                    )
                })
            })
            .collect();

        let created_diff_days =
            (v2.created_at - v1.created_at).num_seconds() as f64 / 86_400.0;

        Self {
            model_name: v1.model_name.clone(),
            version1: v1.version,
            version2: v2.version,
            stage1: v1.stage,
            stage2: v2.stage,
            created_diff_days,
            metrics,
        }
    }
}
