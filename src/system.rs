//! # System Bootstrap
//!
//! Wires the registry, A/B framework, monitor and serving facade around one
//! store and one event publisher, starts their background loops, and stops
//! them again on shutdown.

use crate::ab_testing::{AbTestingFramework, ExperimentResults};
use crate::clock::system_clock;
use crate::config::ConfigManager;
use crate::error::{ModelOpsError, Result};
use crate::events::EventPublisher;
use crate::logging::init_structured_logging_with;
use crate::monitoring::{ModelDashboard, ModelMonitor, MonitorHandle};
use crate::pipeline::{
    canonical_pipeline, spawn_triggers_with, CandidateTrainer, CanonicalSettings, EventSink,
    LoggingSink, PipelineConfig, PipelineStatus, RetrainingPipeline, TriggerCondition,
    TriggerHandle,
};
use crate::registry::{ArtifactLoader, ModelRegistry, ModelVersion};
use crate::resilience::BackoffPolicy;
use crate::serving::ModelServer;
use crate::store::{self, SharedStore};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Point-in-time view of one model across every component
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model_name: String,
    pub versions: Vec<ModelVersion>,
    pub production: Option<ModelVersion>,
    pub dashboard: Option<ModelDashboard>,
    pub active_experiment: Option<ExperimentResults>,
    pub pipeline: Option<PipelineStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub environment: String,
    pub store_backend: String,
    pub models: Vec<String>,
    pub pipelines: Vec<String>,
}

pub struct ModelOpsSystem {
    config_manager: Arc<ConfigManager>,
    store: SharedStore,
    events: EventPublisher,
    registry: Arc<ModelRegistry>,
    ab_testing: Arc<AbTestingFramework>,
    monitor: Arc<ModelMonitor>,
    server: ModelServer,
    monitor_handle: Mutex<Option<MonitorHandle>>,
    pipelines: RwLock<HashMap<String, Arc<RetrainingPipeline>>>,
    triggers: Mutex<HashMap<String, TriggerHandle>>,
    running: AtomicBool,
}

impl std::fmt::Debug for ModelOpsSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelOpsSystem")
            .field("environment", &self.config_manager.environment())
            .field("store", &self.store.backend_name())
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

impl ModelOpsSystem {
    /// Connect the configured store and start every component
    pub async fn bootstrap(config_manager: Arc<ConfigManager>) -> Result<Self> {
        init_structured_logging_with(&config_manager.config().telemetry);
        let store = store::connect(&config_manager.config().registry).await?;
        Self::bootstrap_with(config_manager, store, None).await
    }

    /// Start every component over an existing store. `loader` rebuilds
    /// artifacts persisted by an earlier process.
    pub async fn bootstrap_with(
        config_manager: Arc<ConfigManager>,
        store: SharedStore,
        loader: Option<Arc<dyn ArtifactLoader>>,
    ) -> Result<Self> {
        let config = config_manager.config();
        info!(
            environment = %config_manager.environment(),
            store = store.backend_name(),
            "🚀 BOOTSTRAP: Starting model ops system"
        );

        store.health_check().await?;

        let events = EventPublisher::default();
        let mut registry = ModelRegistry::from_config(store.clone(), &config.registry)
            .with_events(events.clone());
        if let Some(loader) = loader {
            registry = registry.with_loader(loader);
        }
        let registry = Arc::new(registry);

        let ab_testing = Arc::new(AbTestingFramework::with_parts(
            Arc::clone(&registry),
            config.ab_testing.clone(),
            events.clone(),
            system_clock(),
        ));
        let hydrated = ab_testing.hydrate().await?;

        let monitor = Arc::new(ModelMonitor::with_parts(
            config.monitor.clone(),
            events.clone(),
            system_clock(),
        ));
        let monitor_handle = MonitorHandle::spawn(Arc::clone(&monitor));

        let server = ModelServer::new(
            Arc::clone(&registry),
            Arc::clone(&ab_testing),
            Arc::clone(&monitor),
        );

        info!(
            experiments = hydrated,
            "🚀 BOOTSTRAP: Model ops system started"
        );

        Ok(Self {
            config_manager,
            store,
            events,
            registry,
            ab_testing,
            monitor,
            server,
            monitor_handle: Mutex::new(Some(monitor_handle)),
            pipelines: RwLock::new(HashMap::new()),
            triggers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        })
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn ab_testing(&self) -> &Arc<AbTestingFramework> {
        &self.ab_testing
    }

    pub fn monitor(&self) -> &Arc<ModelMonitor> {
        &self.monitor
    }

    pub fn server(&self) -> &ModelServer {
        &self.server
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Take ownership of `pipeline`: attach notification sinks and start its
    /// schedule and degradation triggers
    pub fn register_pipeline(&self, pipeline: RetrainingPipeline) -> Result<Arc<RetrainingPipeline>> {
        if !self.is_running() {
            return Err(ModelOpsError::Validation(
                "system is shut down".to_string(),
            ));
        }

        let model_name = pipeline.config().model_name.clone();
        if self.pipelines.read().contains_key(&model_name) {
            return Err(ModelOpsError::Validation(format!(
                "a pipeline for '{model_name}' is already registered"
            )));
        }

        pipeline.add_sink(Arc::new(LoggingSink));
        pipeline.add_sink(Arc::new(EventSink::new(self.events.clone())));
        let pipeline = Arc::new(pipeline);

        let settings = &self.config_manager.config().pipeline;
        let handle = spawn_triggers_with(
            Arc::clone(&pipeline),
            Arc::clone(&self.monitor),
            Arc::clone(&self.registry),
            settings.trigger_poll_interval(),
            TriggerHandle::new().with_drain_timeout(settings.shutdown_timeout()),
        )?;
        self.triggers.lock().insert(model_name.clone(), handle);
        self.pipelines
            .write()
            .insert(model_name, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Build the standard retraining DAG for `model_name` from configuration
    /// and register it
    pub fn register_canonical_pipeline(
        &self,
        model_name: &str,
        trainer: Arc<dyn CandidateTrainer>,
        settings: CanonicalSettings,
    ) -> Result<Arc<RetrainingPipeline>> {
        let config = self.config_manager.config();
        let pipeline = canonical_pipeline(
            PipelineConfig::from_settings(model_name, &config.pipeline),
            Arc::clone(&self.registry),
            Arc::clone(&self.ab_testing),
            trainer,
            settings,
            BackoffPolicy::from_config(&config.backoff),
        )?;
        self.register_pipeline(pipeline)
    }

    pub fn pipeline(&self, model_name: &str) -> Option<Arc<RetrainingPipeline>> {
        self.pipelines.read().get(model_name).cloned()
    }

    /// Start a run of `model_name`'s pipeline in the background. Shutdown
    /// waits for it like for scheduled runs.
    pub fn trigger_pipeline(&self, model_name: &str, trigger: TriggerCondition) -> Result<()> {
        if !self.is_running() {
            return Err(ModelOpsError::Validation(
                "system is shut down".to_string(),
            ));
        }
        let pipeline = self
            .pipeline(model_name)
            .ok_or_else(|| ModelOpsError::NotFound(format!("pipeline for '{model_name}'")))?;
        let triggers = self.triggers.lock();
        let handle = triggers
            .get(model_name)
            .ok_or_else(|| ModelOpsError::NotFound(format!("triggers for '{model_name}'")))?;
        handle.dispatch(&pipeline, trigger);
        Ok(())
    }

    pub async fn status(&self) -> Result<SystemStatus> {
        let mut pipelines: Vec<String> = self.pipelines.read().keys().cloned().collect();
        pipelines.sort();
        Ok(SystemStatus {
            running: self.is_running(),
            environment: self.config_manager.environment().to_string(),
            store_backend: self.store.backend_name().to_string(),
            models: self.registry.list_models().await?,
            pipelines,
        })
    }

    /// Everything known about one model: versions, the production dashboard,
    /// the running experiment's results and the pipeline state
    pub async fn model_status(&self, model_name: &str) -> Result<ModelStatus> {
        let versions = self.registry.list_versions(model_name).await?;
        let production = versions.iter().find(|v| v.is_production()).cloned();
        let dashboard = production
            .as_ref()
            .map(|p| self.monitor.get_model_dashboard(model_name, p.version));

        let active_experiment = match self.ab_testing.active_experiment(model_name).await? {
            Some(experiment) => Some(
                self.ab_testing
                    .get_experiment_results(&experiment.experiment_id)
                    .await?,
            ),
            None => None,
        };

        Ok(ModelStatus {
            model_name: model_name.to_string(),
            versions,
            production,
            dashboard,
            active_experiment,
            pipeline: self.pipeline(model_name).map(|p| p.get_run_status()),
        })
    }

    /// Stop trigger and monitor loops and flush buffered experiment results.
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            warn!("🛑 SHUTDOWN: Model ops system already stopped");
            return Ok(());
        }
        info!("🛑 SHUTDOWN: Stopping model ops system");

        let triggers: Vec<TriggerHandle> =
            self.triggers.lock().drain().map(|(_, handle)| handle).collect();
        for handle in triggers {
            handle.shutdown().await;
        }

        let monitor_handle = self.monitor_handle.lock().take();
        if let Some(handle) = monitor_handle {
            handle.shutdown().await;
        }

        self.ab_testing.shutdown().await?;
        info!("🛑 SHUTDOWN: Model ops system stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelOpsConfig;
    use crate::registry::{ModelArtifact, ModelMetrics, ModelStage};
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    #[derive(Debug)]
    struct Echo;

    impl ModelArtifact for Echo {
        fn artifact_type(&self) -> &str {
            "echo"
        }

        fn train(&mut self, _data: &Value) -> anyhow::Result<ModelMetrics> {
            Ok(ModelMetrics::new())
        }

        fn predict(&self, input: &Value) -> anyhow::Result<Value> {
            Ok(input.clone())
        }
    }

    async fn test_system() -> ModelOpsSystem {
        let manager = ConfigManager::from_config(ModelOpsConfig::default(), "test").unwrap();
        ModelOpsSystem::bootstrap_with(manager, Arc::new(MemoryStore::new()), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_serve_and_shutdown() {
        let system = test_system().await;
        assert!(system.is_running());

        let version = system
            .registry()
            .register_owned(Echo, "ranker", ModelMetrics::new())
            .await
            .unwrap();
        system
            .registry()
            .promote("ranker", version, ModelStage::Production)
            .await
            .unwrap();

        let prediction = system
            .server()
            .predict("ranker", &json!({"x": 1.5}), Some("req-1"))
            .await
            .unwrap();
        assert_eq!(prediction.version, version);
        assert_eq!(prediction.output, json!({"x": 1.5}));

        let status = system.model_status("ranker").await.unwrap();
        assert_eq!(status.production.map(|v| v.version), Some(version));
        let dashboard = status.dashboard.unwrap();
        assert_eq!(dashboard.statistics.total_requests, 1);
        assert!(status.active_experiment.is_none());
        assert!(status.pipeline.is_none());

        let overview = system.status().await.unwrap();
        assert_eq!(overview.environment, "test");
        assert_eq!(overview.store_backend, "memory");
        assert_eq!(overview.models, vec!["ranker".to_string()]);

        system.shutdown().await.unwrap();
        assert!(!system.is_running());
        // second call is a no-op
        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_pipeline_rejects_duplicates_and_shutdown() {
        let system = test_system().await;
        let settings = &system.config_manager().config().pipeline;

        let first = RetrainingPipeline::new(PipelineConfig::from_settings("ranker", settings));
        let pipeline = system.register_pipeline(first).unwrap();
        assert_eq!(pipeline.config().pipeline_id, "ranker_retraining");
        assert!(system.pipeline("ranker").is_some());

        let second = RetrainingPipeline::new(PipelineConfig::from_settings("ranker", settings));
        assert!(matches!(
            system.register_pipeline(second),
            Err(ModelOpsError::Validation(_))
        ));

        system.shutdown().await.unwrap();
        let late = RetrainingPipeline::new(PipelineConfig::from_settings("other", settings));
        assert!(system.register_pipeline(late).is_err());
    }
}
