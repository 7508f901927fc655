use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// What a terminal task failure does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the run once the current wave settles
    #[default]
    Fail,
    /// Record the task as skipped; dependents run without its output
    Skip,
    /// Keep going with independent tasks; dependents are skipped
    Continue,
}

impl fmt::Display for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

impl FromStr for OnFailure {
    type Err = crate::error::ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            "continue" => Ok(Self::Continue),
            other => Err(crate::error::ModelOpsError::Validation(format!(
                "unknown on_failure policy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_id: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Retries after the first attempt
    pub retry_count: u32,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl TaskConfig {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            dependencies: BTreeSet::new(),
            retry_count: 3,
            timeout_seconds: 3600,
            on_failure: OnFailure::Fail,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }
}

/// Outcome of one task in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: Value,
    pub error: Option<String>,
    /// Numeric entries of the output's `metrics` object, if any
    pub metrics: BTreeMap<String, f64>,
    pub attempts: u32,
}

impl TaskResult {
    pub fn success(
        task_id: impl Into<String>,
        start_time: DateTime<Utc>,
        output: Value,
        attempts: u32,
    ) -> Self {
        let metrics = output
            .get("metrics")
            .and_then(Value::as_object)
            .map(|metrics| {
                metrics
                    .iter()
                    .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            task_id: task_id.into(),
            status: TaskStatus::Success,
            start_time,
            end_time: Some(Utc::now()),
            output,
            error: None,
            metrics,
            attempts,
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        start_time: DateTime<Utc>,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            start_time,
            end_time: Some(Utc::now()),
            output: Value::Null,
            error: Some(error.into()),
            metrics: BTreeMap::new(),
            attempts,
        }
    }

    /// A task that never ran
    pub fn skipped(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Skipped,
            start_time: now,
            end_time: Some(now),
            output: Value::Null,
            error: Some(reason.into()),
            metrics: BTreeMap::new(),
            attempts: 0,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}

/// Why a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    Scheduled,
    DataDrift,
    PerformanceDegradation,
    Manual,
    ModelFeedback,
}

impl TriggerCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::DataDrift => "data_drift",
            Self::PerformanceDegradation => "performance_degradation",
            Self::Manual => "manual",
            Self::ModelFeedback => "model_feedback",
        }
    }
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerCondition {
    type Err = crate::error::ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "data_drift" => Ok(Self::DataDrift),
            "performance_degradation" => Ok(Self::PerformanceDegradation),
            "manual" => Ok(Self::Manual),
            "model_feedback" => Ok(Self::ModelFeedback),
            other => Err(crate::error::ModelOpsError::Validation(format!(
                "unknown trigger condition '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub model_name: String,
    /// `@hourly`, `@daily` or `0 H * * *`
    pub schedule_interval: Option<String>,
    pub max_concurrent_tasks: usize,
    /// Completed runs kept for `history()`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    20
}

impl PipelineConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        let model_name = model_name.into();
        Self {
            pipeline_id: format!("{model_name}_retraining"),
            model_name,
            schedule_interval: Some("0 2 * * *".to_string()),
            max_concurrent_tasks: 4,
            history_limit: default_history_limit(),
        }
    }

    pub fn from_settings(
        model_name: impl Into<String>,
        settings: &crate::config::PipelineSettings,
    ) -> Self {
        Self {
            schedule_interval: settings.schedule_interval.clone(),
            max_concurrent_tasks: settings.max_concurrent_tasks,
            ..Self::new(model_name)
        }
    }
}

/// One completed (or aborted) execution of the DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub pipeline_id: String,
    pub model_name: String,
    pub trigger: TriggerCondition,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// False when the plan could not be built or a `fail` task aborted the run
    pub success: bool,
    pub error: Option<String>,
    pub plan: Vec<Vec<String>>,
    /// In plan order
    pub task_results: Vec<TaskResult>,
    /// Outputs written to the shared context during the run
    pub outputs: BTreeMap<String, Value>,
}

impl PipelineRun {
    pub fn task(&self, task_id: &str) -> Option<&TaskResult> {
        self.task_results.iter().find(|r| r.task_id == task_id)
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.task(task_id).map(|r| r.status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Box<PipelineRun>),
    /// Another run was in progress; the trigger was dropped
    Dropped,
}

impl RunOutcome {
    pub fn run(&self) -> Option<&PipelineRun> {
        match self {
            Self::Completed(run) => Some(run),
            Self::Dropped => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub pipeline_id: String,
    pub model_name: String,
    pub state: RunState,
    pub current_run_id: Option<String>,
    pub current_trigger: Option<TriggerCondition>,
    pub last_run: Option<PipelineRun>,
    pub total_runs: u64,
    pub dropped_triggers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_config_builder() {
        let config = TaskConfig::new("train")
            .depends_on(["collect", "validate"])
            .with_retry_count(1)
            .with_on_failure(OnFailure::Continue);
        assert_eq!(config.dependencies.len(), 2);
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.on_failure, OnFailure::Continue);
        assert_eq!(config.timeout_seconds, 3600);
    }

    #[test]
    fn test_success_result_lifts_numeric_metrics() {
        let output = json!({"metrics": {"accuracy": 0.91, "note": "x"}, "rows": 10});
        let result = TaskResult::success("train", Utc::now(), output, 1);
        assert_eq!(result.metrics.len(), 1);
        assert_eq!(result.metrics["accuracy"], 0.91);
    }

    #[test]
    fn test_trigger_and_policy_parse() {
        assert_eq!(
            "performance_degradation".parse::<TriggerCondition>().unwrap(),
            TriggerCondition::PerformanceDegradation
        );
        assert!("cron".parse::<TriggerCondition>().is_err());
        assert_eq!("Continue".parse::<OnFailure>().unwrap(), OnFailure::Continue);
        assert_eq!(
            serde_json::to_string(&TriggerCondition::DataDrift).unwrap(),
            "\"data_drift\""
        );
    }
}
