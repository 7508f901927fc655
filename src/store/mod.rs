//! # Persistence
//!
//! Registry and experiment state live behind the [`ModelStore`] trait so the
//! control plane can run fully in memory or against a durable sqlite file.
//! Every multi-row mutation is applied atomically by the backend: a failed
//! call leaves no partial writes behind.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::ab_testing::{Experiment, ExperimentResult};
use crate::config::{RegistryConfig, StoreBackend};
use crate::error::Result;
use crate::registry::{ModelStage, ModelVersion, NewModelVersion};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait ModelStore: Send + Sync + std::fmt::Debug {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> Result<()>;

    /// Insert a new version with the next number for its model, together
    /// with its serialized artifact when one is available
    async fn insert_version(
        &self,
        new_version: NewModelVersion,
        artifact: Option<Vec<u8>>,
    ) -> Result<ModelVersion>;

    async fn get_version(&self, model_name: &str, version: u64) -> Result<Option<ModelVersion>>;

    /// Newest first
    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersion>>;

    /// Sorted model names
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Apply every `(version, stage)` change for one model atomically. Fails
    /// with `NotFound` and changes nothing if any version is missing.
    async fn apply_stage_changes(
        &self,
        model_name: &str,
        changes: &[(u64, ModelStage)],
    ) -> Result<()>;

    /// Returns whether the version existed
    async fn delete_version(&self, model_name: &str, version: u64) -> Result<bool>;

    async fn load_artifact(&self, model_name: &str, version: u64) -> Result<Option<Vec<u8>>>;

    /// Insert or replace
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()>;

    async fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>>;

    async fn list_experiments(&self) -> Result<Vec<Experiment>>;

    async fn append_results(&self, results: &[ExperimentResult]) -> Result<()>;

    /// In insertion order
    async fn load_results(&self, experiment_id: &str) -> Result<Vec<ExperimentResult>>;
}

pub type SharedStore = Arc<dyn ModelStore>;

/// Build the backend selected in configuration
pub async fn connect(config: &RegistryConfig) -> Result<SharedStore> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let store = SqliteStore::connect(&config.sqlite_url, config.max_connections).await?;
            Ok(Arc::new(store))
        }
    }
}
