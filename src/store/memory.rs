use super::ModelStore;
use crate::ab_testing::{Experiment, ExperimentResult};
use crate::error::{ModelOpsError, Result};
use crate::registry::{ModelStage, ModelVersion, NewModelVersion};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct ModelEntry {
    /// Highest version ever issued, so deleted numbers are never reused
    last_version: u64,
    versions: BTreeMap<u64, ModelVersion>,
    artifacts: HashMap<u64, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Inner {
    models: BTreeMap<String, ModelEntry>,
    experiments: BTreeMap<String, Experiment>,
    results: HashMap<String, Vec<ExperimentResult>>,
}

/// In-process store. All mutations take one write lock, which makes every
/// multi-row change atomic to readers.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ModelOpsError::Storage(
                "memory store is unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn insert_version(
        &self,
        new_version: NewModelVersion,
        artifact: Option<Vec<u8>>,
    ) -> Result<ModelVersion> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        let entry = inner
            .models
            .entry(new_version.model_name.clone())
            .or_default();

        entry.last_version += 1;
        let version = entry.last_version;
        let record = ModelVersion {
            artifact_ref: ModelVersion::artifact_ref_for(&new_version.model_name, version),
            model_name: new_version.model_name,
            version,
            stage: ModelStage::None,
            created_at: new_version.created_at,
            metrics: new_version.metrics,
            tags: new_version.tags,
            description: new_version.description,
            artifact_type: new_version.artifact_type,
        };

        entry.versions.insert(version, record.clone());
        if let Some(bytes) = artifact {
            entry.artifacts.insert(version, bytes);
        }
        Ok(record)
    }

    async fn get_version(&self, model_name: &str, version: u64) -> Result<Option<ModelVersion>> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(inner
            .models
            .get(model_name)
            .and_then(|entry| entry.versions.get(&version))
            .cloned())
    }

    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersion>> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(inner
            .models
            .get(model_name)
            .map(|entry| entry.versions.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(inner
            .models
            .iter()
            .filter(|(_, entry)| !entry.versions.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn apply_stage_changes(
        &self,
        model_name: &str,
        changes: &[(u64, ModelStage)],
    ) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        let entry = inner
            .models
            .get_mut(model_name)
            .ok_or_else(|| ModelOpsError::NotFound(format!("model '{model_name}'")))?;

        if let Some((missing, _)) = changes
            .iter()
            .find(|(version, _)| !entry.versions.contains_key(version))
        {
            return Err(ModelOpsError::NotFound(format!(
                "model '{model_name}' version {missing}"
            )));
        }

        for (version, stage) in changes {
            if let Some(record) = entry.versions.get_mut(version) {
                record.stage = *stage;
            }
        }
        Ok(())
    }

    async fn delete_version(&self, model_name: &str, version: u64) -> Result<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        let Some(entry) = inner.models.get_mut(model_name) else {
            return Ok(false);
        };
        entry.artifacts.remove(&version);
        Ok(entry.versions.remove(&version).is_some())
    }

    async fn load_artifact(&self, model_name: &str, version: u64) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(inner
            .models
            .get(model_name)
            .and_then(|entry| entry.artifacts.get(&version))
            .cloned())
    }

    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.ensure_available()?;
        self.inner
            .write()
            .experiments
            .insert(experiment.experiment_id.clone(), experiment.clone());
        Ok(())
    }

    async fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>> {
        self.ensure_available()?;
        Ok(self.inner.read().experiments.get(experiment_id).cloned())
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.ensure_available()?;
        Ok(self.inner.read().experiments.values().cloned().collect())
    }

    async fn append_results(&self, results: &[ExperimentResult]) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        for result in results {
            inner
                .results
                .entry(result.experiment_id.clone())
                .or_default()
                .push(result.clone());
        }
        Ok(())
    }

    async fn load_results(&self, experiment_id: &str) -> Result<Vec<ExperimentResult>> {
        self.ensure_available()?;
        Ok(self
            .inner
            .read()
            .results
            .get(experiment_id)
            .cloned()
            .unwrap_or_default())
    }
}
