//! Shared fixtures for the integration suites: scoreable test artifacts, a
//! loader for them, and a canned candidate trainer.

#![allow(dead_code)] // Each test binary uses a different subset

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use modelops_core::ab_testing::{AbTestingFramework, Experiment, ExperimentResult};
use modelops_core::config::AbTestingConfig;
use modelops_core::error::{ModelOpsError, Result};
use modelops_core::pipeline::{CandidateTrainer, TrainedCandidate, TrainingData};
use modelops_core::registry::{
    ArtifactLoader, ModelArtifact, ModelMetrics, ModelRegistry, ModelStage, ModelVersion,
    NewModelVersion, SharedArtifact,
};
use modelops_core::store::{MemoryStore, ModelStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const LINEAR: &str = "linear";

/// `y = weight * x + bias`, serializable so durable stores can reload it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weight: f64,
    pub bias: f64,
}

impl LinearModel {
    pub fn new(weight: f64, bias: f64) -> Self {
        Self { weight, bias }
    }
}

impl ModelArtifact for LinearModel {
    fn artifact_type(&self) -> &str {
        LINEAR
    }

    fn train(&mut self, data: &Value) -> anyhow::Result<ModelMetrics> {
        let points = data
            .as_array()
            .ok_or_else(|| anyhow!("expected an array of [x, y] pairs"))?;
        if points.is_empty() {
            bail!("no training points");
        }
        let n = points.len() as f64;
        let mean_y = points
            .iter()
            .filter_map(|p| p.get(1).and_then(Value::as_f64))
            .sum::<f64>()
            / n;
        self.bias = mean_y;
        self.weight = 0.0;
        Ok(ModelMetrics::from([("accuracy".to_string(), 0.95)]))
    }

    fn predict(&self, input: &Value) -> anyhow::Result<Value> {
        let x = input
            .get("x")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("input is missing numeric 'x'"))?;
        Ok(json!(self.weight * x + self.bias))
    }

    fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

pub struct LinearLoader;

impl ArtifactLoader for LinearLoader {
    fn load(&self, artifact_type: &str, bytes: &[u8]) -> anyhow::Result<SharedArtifact> {
        if artifact_type != LINEAR {
            bail!("unknown artifact type '{artifact_type}'");
        }
        let model: LinearModel = serde_json::from_slice(bytes)?;
        Ok(Arc::new(model))
    }
}

/// Succeeds or fails by the index of the request it is serving, so success
/// rates are exact and reproducible: request `k` succeeds iff `succeeds(k)`
pub struct ScriptedModel {
    label: &'static str,
    served: AtomicU64,
    succeeds: fn(u64) -> bool,
}

impl ScriptedModel {
    pub fn new(label: &'static str, succeeds: fn(u64) -> bool) -> Self {
        Self {
            label,
            served: AtomicU64::new(0),
            succeeds,
        }
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ScriptedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedModel")
            .field("label", &self.label)
            .field("served", &self.served())
            .finish()
    }
}

impl ModelArtifact for ScriptedModel {
    fn artifact_type(&self) -> &str {
        "scripted"
    }

    fn train(&mut self, _data: &Value) -> anyhow::Result<ModelMetrics> {
        Ok(ModelMetrics::new())
    }

    fn predict(&self, _input: &Value) -> anyhow::Result<Value> {
        let k = self.served.fetch_add(1, Ordering::SeqCst);
        if (self.succeeds)(k) {
            Ok(json!({ "served_by": self.label }))
        } else {
            bail!("{} failed on request {k}", self.label)
        }
    }
}

/// Hands out a fixed dataset and a fixed candidate
pub struct StaticTrainer {
    pub quality: f64,
    pub candidate: SharedArtifact,
    pub metrics: ModelMetrics,
    pub trained: AtomicU64,
}

impl StaticTrainer {
    pub fn new(candidate: SharedArtifact, accuracy: f64) -> Self {
        Self {
            quality: 0.97,
            candidate,
            metrics: ModelMetrics::from([
                ("accuracy".to_string(), accuracy),
                ("latency_ms".to_string(), 12.0),
            ]),
            trained: AtomicU64::new(0),
        }
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    pub fn trained(&self) -> u64 {
        self.trained.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateTrainer for StaticTrainer {
    async fn collect_data(&self, _model_name: &str) -> anyhow::Result<TrainingData> {
        Ok(TrainingData {
            sample_count: 1_000,
            quality: self.quality,
            payload: json!([[1.0, 2.0], [2.0, 4.0]]),
        })
    }

    async fn train(
        &self,
        _model_name: &str,
        _data: &TrainingData,
    ) -> anyhow::Result<TrainedCandidate> {
        self.trained.fetch_add(1, Ordering::SeqCst);
        Ok(TrainedCandidate {
            artifact: Arc::clone(&self.candidate),
            metrics: self.metrics.clone(),
        })
    }
}

/// Memory store whose next `failures` stage changes fail after being
/// counted, like a write lost to a dropped connection
#[derive(Debug, Default)]
pub struct FlakyStageStore {
    inner: MemoryStore,
    failures: AtomicU32,
    stage_calls: AtomicU32,
}

impl FlakyStageStore {
    pub fn failing_stage_changes(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
            stage_calls: AtomicU32::new(0),
        }
    }

    pub fn stage_calls(&self) -> u32 {
        self.stage_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelStore for FlakyStageStore {
    fn backend_name(&self) -> &'static str {
        "flaky-memory"
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    async fn insert_version(
        &self,
        new_version: NewModelVersion,
        artifact: Option<Vec<u8>>,
    ) -> Result<ModelVersion> {
        self.inner.insert_version(new_version, artifact).await
    }

    async fn get_version(&self, model_name: &str, version: u64) -> Result<Option<ModelVersion>> {
        self.inner.get_version(model_name, version).await
    }

    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersion>> {
        self.inner.list_versions(model_name).await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.inner.list_models().await
    }

    async fn apply_stage_changes(
        &self,
        model_name: &str,
        changes: &[(u64, ModelStage)],
    ) -> Result<()> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(ModelOpsError::Storage(
                "connection reset while updating stages".to_string(),
            ));
        }
        self.inner.apply_stage_changes(model_name, changes).await
    }

    async fn delete_version(&self, model_name: &str, version: u64) -> Result<bool> {
        self.inner.delete_version(model_name, version).await
    }

    async fn load_artifact(&self, model_name: &str, version: u64) -> Result<Option<Vec<u8>>> {
        self.inner.load_artifact(model_name, version).await
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.inner.save_experiment(experiment).await
    }

    async fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>> {
        self.inner.get_experiment(experiment_id).await
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.inner.list_experiments().await
    }

    async fn append_results(&self, results: &[ExperimentResult]) -> Result<()> {
        self.inner.append_results(results).await
    }

    async fn load_results(&self, experiment_id: &str) -> Result<Vec<ExperimentResult>> {
        self.inner.load_results(experiment_id).await
    }
}

pub fn memory_registry() -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(Arc::new(MemoryStore::new())))
}

/// A/B framework with a fast writer and no default minimum
pub fn fast_ab_testing(registry: &Arc<ModelRegistry>) -> Arc<AbTestingFramework> {
    let config = AbTestingConfig {
        flush_interval_ms: 10,
        default_minimum_sample_size: 0,
        ..AbTestingConfig::default()
    };
    Arc::new(AbTestingFramework::new(Arc::clone(registry), config))
}

pub fn accuracy(value: f64) -> ModelMetrics {
    ModelMetrics::from([("accuracy".to_string(), value)])
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
