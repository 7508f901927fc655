use super::artifact::{ArtifactLoader, ModelArtifact, SharedArtifact};
use super::types::{
    ModelLineage, ModelMetrics, ModelStage, ModelTags, ModelVersion, NewModelVersion,
    PromotionOutcome, VersionComparison, VersionSelector,
};
use crate::clock::{system_clock, SharedClock};
use crate::config::RegistryConfig;
use crate::error::{ModelOpsError, Result};
use crate::events::{names, EventPublisher};
use crate::logging::log_registry_operation;
use crate::store::SharedStore;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// Versioned store of model artifacts and their lifecycle stage.
///
/// `register`, `promote` and `delete_version` serialize on a per-model lock,
/// and every stage change of one promotion is applied by the store in a
/// single atomic step, so readers never observe zero or two Production
/// holders for a model.
pub struct ModelRegistry {
    store: SharedStore,
    loader: Option<Arc<dyn ArtifactLoader>>,
    artifacts: DashMap<(String, u64), SharedArtifact>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    lock_timeout: Duration,
    events: EventPublisher,
    clock: SharedClock,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("store", &self.store.backend_name())
            .field("cached_artifacts", &self.artifacts.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl ModelRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            loader: None,
            artifacts: DashMap::new(),
            locks: DashMap::new(),
            lock_timeout: RegistryConfig::default().promotion_lock_timeout(),
            events: EventPublisher::default(),
            clock: system_clock(),
        }
    }

    pub fn from_config(store: SharedStore, config: &RegistryConfig) -> Self {
        Self::new(store).with_lock_timeout(config.promotion_lock_timeout())
    }

    /// Decoder for artifacts that are not in the in-process cache
    pub fn with_loader(mut self, loader: Arc<dyn ArtifactLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    async fn lock_model(&self, model_name: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(model_name.to_string())
            .or_default()
            .value()
            .clone();

        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                ModelOpsError::Concurrency(format!(
                    "timed out after {:?} waiting for the lock on model '{model_name}'",
                    self.lock_timeout
                ))
            })
    }

    /// Register a new version of `model_name`. The version always starts
    /// with stage `None`.
    pub async fn register(
        &self,
        artifact: SharedArtifact,
        model_name: &str,
        metrics: ModelMetrics,
        tags: ModelTags,
        description: Option<String>,
    ) -> Result<u64> {
        validate_model_name(model_name)?;
        if let Some((name, value)) = metrics.iter().find(|(_, value)| !value.is_finite()) {
            return Err(ModelOpsError::Validation(format!(
                "metric '{name}' has non-finite value {value}"
            )));
        }

        let payload = match artifact.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(
                    model_name = %model_name,
                    error = %e,
                    "Artifact has no serialized form - keeping it in the in-process cache only"
                );
                None
            }
        };

        let _guard = self.lock_model(model_name).await?;

        let new_version = NewModelVersion {
            model_name: model_name.to_string(),
            created_at: self.clock.now(),
            metrics,
            tags,
            description,
            artifact_type: artifact.artifact_type().to_string(),
        };

        let record = match self.store.insert_version(new_version, payload).await {
            Ok(record) => record,
            Err(e) => {
                log_registry_operation("register", model_name, None, "failed", Some(&e.to_string()));
                return Err(e);
            }
        };

        self.artifacts
            .insert((model_name.to_string(), record.version), artifact);

        log_registry_operation("register", model_name, Some(record.version), "success", None);
        self.events.publish(
            names::MODEL_REGISTERED,
            json!({
                "model_name": model_name,
                "version": record.version,
                "metrics": record.metrics,
            }),
        );

        Ok(record.version)
    }

    /// Resolve a selector to the version metadata. A stage held by several
    /// versions resolves to the newest of them.
    pub async fn get_version(
        &self,
        model_name: &str,
        selector: impl Into<VersionSelector>,
    ) -> Result<ModelVersion> {
        let selector = selector.into();
        let found = match selector {
            VersionSelector::Version(version) => {
                self.store.get_version(model_name, version).await?
            }
            VersionSelector::Stage(stage) => self
                .store
                .list_versions(model_name)
                .await?
                .into_iter()
                .find(|v| v.stage == stage),
        };

        found.ok_or_else(|| ModelOpsError::NotFound(format!("model '{model_name}' {selector}")))
    }

    /// Resolve a selector to the artifact itself
    pub async fn get(
        &self,
        model_name: &str,
        selector: impl Into<VersionSelector>,
    ) -> Result<SharedArtifact> {
        let record = self.get_version(model_name, selector).await?;
        self.artifact_for(&record).await
    }

    async fn artifact_for(&self, record: &ModelVersion) -> Result<SharedArtifact> {
        let key = (record.model_name.clone(), record.version);
        if let Some(cached) = self.artifacts.get(&key) {
            return Ok(cached.value().clone());
        }

        let bytes = self
            .store
            .load_artifact(&record.model_name, record.version)
            .await?
            .ok_or_else(|| {
                ModelOpsError::NotFound(format!(
                    "artifact {} is not available in this process or the store",
                    record.artifact_ref
                ))
            })?;

        let loader = self.loader.as_ref().ok_or_else(|| {
            ModelOpsError::Configuration(format!(
                "no artifact loader configured to decode {}",
                record.artifact_ref
            ))
        })?;

        let artifact = loader
            .load(&record.artifact_type, &bytes)
            .map_err(|e| {
                ModelOpsError::Serialization(format!(
                    "failed to decode artifact {}: {e}",
                    record.artifact_ref
                ))
            })?;

        self.artifacts.insert(key, artifact.clone());
        Ok(artifact)
    }

    /// Move `version` into `target`. Promoting to Production archives the
    /// previous holder in the same atomic store update. Promoting a version
    /// that already holds `target` succeeds without changing anything.
    #[instrument(skip(self))]
    pub async fn promote(
        &self,
        model_name: &str,
        version: u64,
        target: ModelStage,
    ) -> Result<PromotionOutcome> {
        let _guard = self.lock_model(model_name).await?;

        let record = self
            .store
            .get_version(model_name, version)
            .await?
            .ok_or_else(|| {
                ModelOpsError::NotFound(format!("model '{model_name}' version {version}"))
            })?;

        if record.stage == target {
            debug!(version, stage = %target, "Version already holds target stage");
            return Ok(PromotionOutcome {
                changed: false,
                archived: None,
            });
        }

        let mut changes = Vec::new();
        let mut archived = None;
        if target == ModelStage::Production {
            let holders: Vec<u64> = self
                .store
                .list_versions(model_name)
                .await?
                .into_iter()
                .filter(|v| v.stage == ModelStage::Production && v.version != version)
                .map(|v| v.version)
                .collect();
            if holders.len() > 1 {
                warn!(
                    holders = ?holders,
                    "Found more than one Production holder - archiving all of them"
                );
            }
            archived = holders.first().copied();
            changes.extend(holders.into_iter().map(|v| (v, ModelStage::Archived)));
        }
        changes.push((version, target));

        if let Err(e) = self.store.apply_stage_changes(model_name, &changes).await {
            log_registry_operation("promote", model_name, Some(version), "failed", Some(&e.to_string()));
            return Err(e);
        }

        info!(
            version,
            from = %record.stage,
            to = %target,
            archived = ?archived,
            "🏷️ REGISTRY: Stage changed"
        );
        log_registry_operation("promote", model_name, Some(version), "success", Some(target.as_str()));
        self.events.publish(
            names::MODEL_PROMOTED,
            json!({
                "model_name": model_name,
                "version": version,
                "from": record.stage,
                "to": target,
                "archived": archived,
            }),
        );

        Ok(PromotionOutcome {
            changed: true,
            archived,
        })
    }

    /// Newest first
    pub async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersion>> {
        self.store.list_versions(model_name).await
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        self.store.list_models().await
    }

    pub async fn current_production(&self, model_name: &str) -> Result<Option<ModelVersion>> {
        Ok(self
            .store
            .list_versions(model_name)
            .await?
            .into_iter()
            .find(ModelVersion::is_production))
    }

    pub async fn lineage(&self, model_name: &str, version: u64) -> Result<ModelLineage> {
        let versions = self.store.list_versions(model_name).await?;
        let record = versions
            .iter()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                ModelOpsError::NotFound(format!("model '{model_name}' version {version}"))
            })?;

        // newest first, so the first older version is the direct predecessor
        let previous = versions.iter().find(|v| v.version < version);
        let metric_changes = previous
            .map(|prev| {
                record
                    .metrics
                    .iter()
                    .filter_map(|(name, value)| {
                        prev.metrics.get(name).map(|old| (name.clone(), value - old))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ModelLineage {
            model_name: record.model_name.clone(),
            version: record.version,
            stage: record.stage,
            created_at: record.created_at,
            metrics: record.metrics.clone(),
            tags: record.tags.clone(),
            description: record.description.clone(),
            artifact_type: record.artifact_type.clone(),
            previous_version: previous.map(|p| p.version),
            metric_changes,
        })
    }

    pub async fn compare_versions(
        &self,
        model_name: &str,
        version1: u64,
        version2: u64,
    ) -> Result<VersionComparison> {
        let v1 = self.get_version(model_name, version1).await?;
        let v2 = self.get_version(model_name, version2).await?;
        Ok(VersionComparison::between(&v1, &v2))
    }

    /// Administrative removal of a version. The Production holder must be
    /// replaced before it can be deleted.
    pub async fn delete_version(&self, model_name: &str, version: u64) -> Result<()> {
        let _guard = self.lock_model(model_name).await?;

        let record = self
            .store
            .get_version(model_name, version)
            .await?
            .ok_or_else(|| {
                ModelOpsError::NotFound(format!("model '{model_name}' version {version}"))
            })?;

        if record.is_production() {
            return Err(ModelOpsError::Validation(format!(
                "model '{model_name}' version {version} is in Production; promote another version first"
            )));
        }

        self.store.delete_version(model_name, version).await?;
        self.artifacts.remove(&(model_name.to_string(), version));

        log_registry_operation("delete", model_name, Some(version), "success", None);
        self.events.publish(
            names::MODEL_DELETED,
            json!({ "model_name": model_name, "version": version }),
        );
        Ok(())
    }

    /// Register-time helper for callers holding an owned artifact
    pub async fn register_owned<A: ModelArtifact + 'static>(
        &self,
        artifact: A,
        model_name: &str,
        metrics: ModelMetrics,
    ) -> Result<u64> {
        self.register(Arc::new(artifact), model_name, metrics, ModelTags::new(), None)
            .await
    }
}

fn validate_model_name(model_name: &str) -> Result<()> {
    if model_name.trim().is_empty() {
        return Err(ModelOpsError::Validation(
            "model_name must not be empty".to_string(),
        ));
    }
    if model_name.contains('/') {
        return Err(ModelOpsError::Validation(format!(
            "model_name '{model_name}' must not contain '/'"
        )));
    }
    Ok(())
}
