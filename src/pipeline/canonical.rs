//! The standard retraining DAG:
//! `collect_data -> validate_data_quality -> train_candidate ->
//! validate_candidate -> register_version -> run_ab_test ->
//! promote_to_production`.

use super::context::PipelineContext;
use super::retraining::RetrainingPipeline;
use super::task::PipelineTask;
use super::types::{OnFailure, PipelineConfig, TaskConfig};
use crate::ab_testing::{AbTestingFramework, Experiment, Variant, WinnerRecommendation};
use crate::error::Result;
use crate::registry::{ModelMetrics, ModelRegistry, ModelStage, ModelTags, SharedArtifact};
use crate::resilience::BackoffPolicy;
use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const COLLECT_DATA: &str = "collect_data";
pub const VALIDATE_DATA_QUALITY: &str = "validate_data_quality";
pub const TRAIN_CANDIDATE: &str = "train_candidate";
pub const VALIDATE_CANDIDATE: &str = "validate_candidate";
pub const REGISTER_VERSION: &str = "register_version";
pub const RUN_AB_TEST: &str = "run_ab_test";
pub const PROMOTE_TO_PRODUCTION: &str = "promote_to_production";

pub const PIPELINE_ID_TAG: &str = "pipeline_id";
pub const RUN_ID_TAG: &str = "run_id";
pub const TRIGGER_TAG: &str = "trigger";

pub const CONTROL_VARIANT: &str = "control";
pub const TREATMENT_VARIANT: &str = "treatment";

/// Fresh training data as handed from `collect_data` to `train_candidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    pub sample_count: u64,
    /// Fraction of usable rows, 0..=1
    pub quality: f64,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct TrainedCandidate {
    pub artifact: SharedArtifact,
    pub metrics: ModelMetrics,
}

/// Model-specific collaborator supplying data and producing new artifacts
#[async_trait]
pub trait CandidateTrainer: Send + Sync {
    async fn collect_data(&self, model_name: &str) -> anyhow::Result<TrainingData>;

    async fn train(&self, model_name: &str, data: &TrainingData)
        -> anyhow::Result<TrainedCandidate>;
}

/// Acceptance gates and A/B parameters of the standard DAG
#[derive(Debug, Clone)]
pub struct CanonicalSettings {
    pub min_data_quality: f64,
    pub accuracy_metric: String,
    pub min_accuracy: f64,
    pub latency_metric: String,
    pub max_latency_ms: f64,
    /// Traffic share of the candidate; production keeps the rest
    pub candidate_traffic_percentage: f64,
    /// 0 uses the framework default
    pub minimum_sample_size: u64,
    pub ab_poll_interval: Duration,
    pub ab_max_wait: Duration,
}

impl Default for CanonicalSettings {
    fn default() -> Self {
        Self {
            min_data_quality: 0.90,
            accuracy_metric: "accuracy".to_string(),
            min_accuracy: 0.90,
            latency_metric: "latency_ms".to_string(),
            max_latency_ms: 100.0,
            candidate_traffic_percentage: 50.0,
            minimum_sample_size: 0,
            ab_poll_interval: Duration::from_secs(30),
            ab_max_wait: Duration::from_secs(2 * 3600),
        }
    }
}

struct CollectData {
    trainer: Arc<dyn CandidateTrainer>,
}

#[async_trait]
impl PipelineTask for CollectData {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        let data = self.trainer.collect_data(context.model_name()).await?;
        info!(
            model_name = %context.model_name(),
            sample_count = data.sample_count,
            quality = data.quality,
            "🔁 PIPELINE: Collected training data"
        );
        Ok(serde_json::to_value(data)?)
    }
}

struct ValidateDataQuality {
    min_quality: f64,
}

#[async_trait]
impl PipelineTask for ValidateDataQuality {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        let quality = context
            .output_field(COLLECT_DATA, "quality")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        if quality < self.min_quality {
            bail!(
                "data quality {quality:.2} below threshold {:.2}",
                self.min_quality
            );
        }
        Ok(json!({ "validation_passed": true, "quality_score": quality }))
    }
}

struct TrainCandidate {
    trainer: Arc<dyn CandidateTrainer>,
}

#[async_trait]
impl PipelineTask for TrainCandidate {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        let data: TrainingData = serde_json::from_value(
            context
                .output(COLLECT_DATA)
                .ok_or_else(|| anyhow!("no training data in run context"))?,
        )
        .context("malformed training data")?;

        let candidate = self.trainer.train(context.model_name(), &data).await?;
        let artifact_type = candidate.artifact.artifact_type().to_string();
        context.put_artifact(TRAIN_CANDIDATE, candidate.artifact)?;

        Ok(json!({
            "artifact_type": artifact_type,
            "trained_on": data.sample_count,
            "metrics": candidate.metrics,
        }))
    }
}

struct ValidateCandidate {
    accuracy_metric: String,
    min_accuracy: f64,
    latency_metric: String,
    max_latency_ms: f64,
}

#[async_trait]
impl PipelineTask for ValidateCandidate {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        let metrics = candidate_metrics(&context)?;

        let accuracy = metrics
            .get(&self.accuracy_metric)
            .copied()
            .ok_or_else(|| anyhow!("candidate did not report '{}'", self.accuracy_metric))?;
        if accuracy < self.min_accuracy {
            bail!(
                "model {} {accuracy:.3} below threshold {:.2}",
                self.accuracy_metric,
                self.min_accuracy
            );
        }
        if let Some(latency) = metrics.get(&self.latency_metric).copied() {
            if latency > self.max_latency_ms {
                bail!(
                    "model latency {latency:.1}ms above threshold {}ms",
                    self.max_latency_ms
                );
            }
        }
        Ok(json!({ "validation_passed": true }))
    }
}

struct RegisterVersion {
    registry: Arc<ModelRegistry>,
}

#[async_trait]
impl PipelineTask for RegisterVersion {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        let model_name = context.model_name();

        // A retried attempt finds the version its predecessor registered
        let existing = self
            .registry
            .list_versions(model_name)
            .await?
            .into_iter()
            .find(|v| v.tags.get(RUN_ID_TAG).map(String::as_str) == Some(context.run_id()));

        let version = match existing {
            Some(registered) => {
                info!(
                    model_name = %model_name,
                    version = registered.version,
                    "🔁 PIPELINE: Candidate already registered in this run, resuming promotion"
                );
                registered.version
            }
            None => {
                let artifact = context
                    .artifact(TRAIN_CANDIDATE)
                    .ok_or_else(|| anyhow!("no trained artifact in run context"))?;
                let metrics = candidate_metrics(&context)?;
                let tags = ModelTags::from([
                    (PIPELINE_ID_TAG.to_string(), context.pipeline_id().to_string()),
                    (RUN_ID_TAG.to_string(), context.run_id().to_string()),
                    (TRIGGER_TAG.to_string(), context.trigger().to_string()),
                ]);
                self.registry
                    .register(
                        artifact,
                        model_name,
                        metrics,
                        tags,
                        Some(format!("retrained ({})", context.trigger())),
                    )
                    .await?
            }
        };

        self.registry
            .promote(model_name, version, ModelStage::Staging)
            .await?;

        Ok(json!({ "version": version, "stage": ModelStage::Staging.as_str() }))
    }
}

struct RunAbTest {
    registry: Arc<ModelRegistry>,
    ab_testing: Arc<AbTestingFramework>,
    candidate_traffic_percentage: f64,
    minimum_sample_size: u64,
    poll_interval: Duration,
    max_wait: Duration,
}

impl RunAbTest {
    /// Pick up the experiment an earlier attempt of this run started, stop
    /// one left running by an earlier run of this pipeline, or start a new one
    async fn resume_or_create(
        &self,
        context: &PipelineContext,
        control_version: u64,
        candidate_version: u64,
    ) -> anyhow::Result<String> {
        let model_name = context.model_name();
        let pipeline_prefix = format!("{}-", context.pipeline_id());
        let run_prefix = format!("{pipeline_prefix}{}-", context.run_id());

        if let Some(active) = self.ab_testing.active_experiment(model_name).await? {
            if active.experiment_id.starts_with(&run_prefix) {
                info!(
                    experiment_id = %active.experiment_id,
                    "🔁 PIPELINE: Resuming experiment started by an earlier attempt"
                );
                return Ok(active.experiment_id);
            }
            if active.experiment_id.starts_with(&pipeline_prefix) {
                warn!(
                    experiment_id = %active.experiment_id,
                    "🔁 PIPELINE: Stopping experiment left running by an earlier run"
                );
                self.ab_testing
                    .stop_experiment(&active.experiment_id)
                    .await?;
            }
        }

        let experiment = Experiment::new(
            format!("{} candidate evaluation", context.pipeline_id()),
            model_name,
            vec![
                Variant::new(
                    CONTROL_VARIANT,
                    model_name,
                    control_version,
                    100.0 - self.candidate_traffic_percentage,
                ),
                Variant::new(
                    TREATMENT_VARIANT,
                    model_name,
                    candidate_version,
                    self.candidate_traffic_percentage,
                ),
            ],
        )
        .with_experiment_id(format!("{run_prefix}{}", uuid::Uuid::new_v4().simple()))
        .with_description(format!("retraining run {}", context.run_id()))
        .with_minimum_sample_size(self.minimum_sample_size);

        Ok(self.ab_testing.create_experiment(experiment).await?)
    }

    /// Current recommendation and whether the experiment already ended
    async fn evaluate(&self, experiment_id: &str) -> Result<(WinnerRecommendation, bool)> {
        let recommendation = self.ab_testing.recommend_winner(experiment_id).await?;
        let status = self.ab_testing.get_experiment(experiment_id).await?.status;
        Ok((recommendation, status.is_terminal()))
    }
}

#[async_trait]
impl PipelineTask for RunAbTest {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        let model_name = context.model_name();
        let candidate = registered_version(&context)?;

        let Some(production) = self.registry.current_production(model_name).await? else {
            info!(
                model_name = %model_name,
                "🔁 PIPELINE: No production version, candidate wins by default"
            );
            return Ok(json!({
                "candidate_better": true,
                "reason": "no_production_version",
                "candidate_version": candidate,
            }));
        };

        let experiment_id = self
            .resume_or_create(&context, production.version, candidate)
            .await?;
        let mut cleanup = ExperimentCleanup::new(Arc::clone(&self.ab_testing), &experiment_id);
        let started = Instant::now();

        let recommendation = loop {
            tokio::time::sleep(self.poll_interval).await;
            let expired = started.elapsed() >= self.max_wait;
            match self.evaluate(&experiment_id).await {
                Ok((recommendation, ended)) => {
                    if !recommendation.is_inconclusive() || ended || expired {
                        break recommendation;
                    }
                }
                Err(e) if e.is_retryable() && !expired => {
                    warn!(
                        experiment_id = %experiment_id,
                        error = %e,
                        "🔁 PIPELINE: Experiment poll failed, will poll again"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        };

        if !self
            .ab_testing
            .get_experiment(&experiment_id)
            .await?
            .status
            .is_terminal()
        {
            self.ab_testing.stop_experiment(&experiment_id).await?;
        }
        cleanup.disarm();

        let winner = recommendation.winner().map(str::to_string);
        let candidate_better = winner.as_deref() == Some(TREATMENT_VARIANT);
        let p_value = match &recommendation {
            WinnerRecommendation::Winner { p_value, .. } => Some(*p_value),
            WinnerRecommendation::Inconclusive { .. } => None,
        };

        Ok(json!({
            "experiment_id": experiment_id,
            "winner": winner,
            "candidate_better": candidate_better,
            "p_value": p_value,
            "control_version": production.version,
            "candidate_version": candidate,
        }))
    }
}

/// Stops an experiment whose task exits before concluding it, whether by
/// error or by the attempt timeout dropping the task future
struct ExperimentCleanup {
    ab_testing: Arc<AbTestingFramework>,
    experiment_id: Option<String>,
}

impl ExperimentCleanup {
    fn new(ab_testing: Arc<AbTestingFramework>, experiment_id: &str) -> Self {
        Self {
            ab_testing,
            experiment_id: Some(experiment_id.to_string()),
        }
    }

    fn disarm(&mut self) {
        self.experiment_id = None;
    }
}

impl Drop for ExperimentCleanup {
    fn drop(&mut self) {
        let Some(experiment_id) = self.experiment_id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                experiment_id = %experiment_id,
                "🔁 PIPELINE: No runtime available to stop abandoned experiment"
            );
            return;
        };

        let ab_testing = Arc::clone(&self.ab_testing);
        runtime.spawn(async move {
            let ended = ab_testing
                .get_experiment(&experiment_id)
                .await
                .is_ok_and(|experiment| experiment.status.is_terminal());
            if ended {
                return;
            }
            match ab_testing.stop_experiment(&experiment_id).await {
                Ok(_) => info!(
                    experiment_id = %experiment_id,
                    "🔁 PIPELINE: Stopped experiment abandoned by a failed attempt"
                ),
                Err(e) => warn!(
                    experiment_id = %experiment_id,
                    error = %e,
                    "🔁 PIPELINE: Could not stop abandoned experiment"
                ),
            }
        });
    }
}

struct PromoteToProduction {
    registry: Arc<ModelRegistry>,
}

#[async_trait]
impl PipelineTask for PromoteToProduction {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        let candidate_better = context
            .output_field(RUN_AB_TEST, "candidate_better")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !candidate_better {
            info!(
                model_name = %context.model_name(),
                "🔁 PIPELINE: Candidate model not better, skipping promotion"
            );
            return Ok(json!({ "promoted": false, "reason": "candidate_not_better" }));
        }

        let version = registered_version(&context)?;
        let outcome = self
            .registry
            .promote(context.model_name(), version, ModelStage::Production)
            .await?;

        Ok(json!({
            "promoted": true,
            "production_version": version,
            "archived_version": outcome.archived,
        }))
    }
}

fn candidate_metrics(context: &PipelineContext) -> anyhow::Result<ModelMetrics> {
    let metrics = context
        .output_field(TRAIN_CANDIDATE, "metrics")
        .ok_or_else(|| anyhow!("no candidate metrics in run context"))?;
    Ok(serde_json::from_value(metrics)?)
}

fn registered_version(context: &PipelineContext) -> anyhow::Result<u64> {
    context
        .output_field(REGISTER_VERSION, "version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow!("no registered version in run context"))
}

/// Build the standard retraining DAG for `config.model_name`
pub fn canonical_pipeline(
    config: PipelineConfig,
    registry: Arc<ModelRegistry>,
    ab_testing: Arc<AbTestingFramework>,
    trainer: Arc<dyn CandidateTrainer>,
    settings: CanonicalSettings,
    backoff: BackoffPolicy,
) -> Result<RetrainingPipeline> {
    let pipeline = RetrainingPipeline::with_backoff(config, backoff);

    pipeline.add_task(
        TaskConfig::new(COLLECT_DATA).with_timeout_seconds(1800),
        Arc::new(CollectData {
            trainer: Arc::clone(&trainer),
        }),
    )?;
    pipeline.add_task(
        TaskConfig::new(VALIDATE_DATA_QUALITY)
            .depends_on([COLLECT_DATA])
            .with_retry_count(0),
        Arc::new(ValidateDataQuality {
            min_quality: settings.min_data_quality,
        }),
    )?;
    pipeline.add_task(
        TaskConfig::new(TRAIN_CANDIDATE)
            .depends_on([VALIDATE_DATA_QUALITY])
            .with_timeout_seconds(3600),
        Arc::new(TrainCandidate { trainer }),
    )?;
    pipeline.add_task(
        TaskConfig::new(VALIDATE_CANDIDATE)
            .depends_on([TRAIN_CANDIDATE])
            .with_retry_count(0),
        Arc::new(ValidateCandidate {
            accuracy_metric: settings.accuracy_metric.clone(),
            min_accuracy: settings.min_accuracy,
            latency_metric: settings.latency_metric.clone(),
            max_latency_ms: settings.max_latency_ms,
        }),
    )?;
    pipeline.add_task(
        TaskConfig::new(REGISTER_VERSION).depends_on([VALIDATE_CANDIDATE]),
        Arc::new(RegisterVersion {
            registry: Arc::clone(&registry),
        }),
    )?;
    pipeline.add_task(
        TaskConfig::new(RUN_AB_TEST)
            .depends_on([REGISTER_VERSION])
            .with_retry_count(1)
            .with_timeout_seconds(
                settings.ab_max_wait.as_secs() + settings.ab_poll_interval.as_secs() + 60,
            ),
        Arc::new(RunAbTest {
            registry: Arc::clone(&registry),
            ab_testing,
            candidate_traffic_percentage: settings.candidate_traffic_percentage,
            minimum_sample_size: settings.minimum_sample_size,
            poll_interval: settings.ab_poll_interval,
            max_wait: settings.ab_max_wait,
        }),
    )?;
    pipeline.add_task(
        TaskConfig::new(PROMOTE_TO_PRODUCTION)
            .depends_on([RUN_AB_TEST])
            .with_on_failure(OnFailure::Continue),
        Arc::new(PromoteToProduction { registry }),
    )?;

    Ok(pipeline)
}
