//! # Serving Facade
//!
//! Routes one prediction request through the control plane: experiment
//! allocation, artifact resolution, `predict`, then outcome reporting to the
//! Monitor and the A/B framework.

use crate::ab_testing::{AbTestingFramework, ExperimentResult};
use crate::error::{ModelOpsError, Result};
use crate::monitoring::{FeatureVector, ModelMonitor};
use crate::registry::{ModelRegistry, ModelStage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Result of one served request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_name: String,
    pub version: u64,
    pub request_id: String,
    pub experiment_id: Option<String>,
    pub variant: Option<String>,
    pub output: Value,
    pub latency_ms: f64,
}

struct Route {
    version: u64,
    experiment: Option<(String, String)>,
}

#[derive(Debug)]
pub struct ModelServer {
    registry: Arc<ModelRegistry>,
    ab_testing: Arc<AbTestingFramework>,
    monitor: Arc<ModelMonitor>,
    requests: AtomicU64,
    resource_sample_every: u64,
    sampling: Arc<AtomicBool>,
}

impl ModelServer {
    pub fn new(
        registry: Arc<ModelRegistry>,
        ab_testing: Arc<AbTestingFramework>,
        monitor: Arc<ModelMonitor>,
    ) -> Self {
        let resource_sample_every = monitor.config().resource_sample_every_n_requests;
        Self {
            registry,
            ab_testing,
            monitor,
            requests: AtomicU64::new(0),
            resource_sample_every,
            sampling: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Serve `input` with `model_name`. `request_id` doubles as the sticky
    /// allocation key when present.
    pub async fn predict(
        &self,
        model_name: &str,
        input: &Value,
        request_id: Option<&str>,
    ) -> Result<Prediction> {
        self.predict_for(model_name, input, request_id, request_id)
            .await
    }

    /// Like [`predict`](Self::predict) with a separate stable identifier
    /// (usually a user id) for experiment allocation
    pub async fn predict_for(
        &self,
        model_name: &str,
        input: &Value,
        identifier: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<Prediction> {
        let request_id = request_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let route = self.route(model_name, identifier).await?;
        let artifact = self.registry.get(model_name, route.version).await?;

        let started = Instant::now();
        let outcome = artifact.predict(input);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let success = outcome.is_ok();

        let features = features_from_input(input);
        self.monitor.record_prediction(
            model_name,
            route.version,
            latency_ms,
            success,
            features.as_ref(),
            outcome.as_ref().ok(),
        );

        if let Some((experiment_id, variant)) = &route.experiment {
            let result =
                ExperimentResult::new(experiment_id, variant, &request_id, success, latency_ms);
            if let Err(e) = self.ab_testing.record_result(result).await {
                warn!(
                    experiment_id = %experiment_id,
                    error = %e,
                    "🧪 AB_TESTING: Could not record result"
                );
            }
        }

        let served = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if self.resource_sample_every > 0 && served % self.resource_sample_every == 0 {
            self.sample_resources(model_name);
        }

        let output = outcome.map_err(|e| {
            ModelOpsError::Task(format!(
                "predict failed for {model_name} v{}: {e:#}",
                route.version
            ))
        })?;

        let (experiment_id, variant) = route.experiment.unzip();
        Ok(Prediction {
            model_name: model_name.to_string(),
            version: route.version,
            request_id,
            experiment_id,
            variant,
            output,
            latency_ms,
        })
    }

    /// Running experiment for the model first; any A/B failure falls back to
    /// the Production version
    /// Refresh the process snapshot off the request path. Skipped while a
    /// previous sample is still running.
    fn sample_resources(&self, model_name: &str) {
        if self.sampling.swap(true, Ordering::AcqRel) {
            debug!(model_name = %model_name, "📊 MONITOR: Resource sample in progress, skipping");
            return;
        }
        let monitor = Arc::clone(&self.monitor);
        let sampling = Arc::clone(&self.sampling);
        let model_name = model_name.to_string();
        tokio::task::spawn_blocking(move || {
            monitor.record_resource_usage(&model_name);
            sampling.store(false, Ordering::Release);
        });
    }

    async fn route(&self, model_name: &str, identifier: Option<&str>) -> Result<Route> {
        match self.experiment_route(model_name, identifier).await {
            Ok(Some(route)) => return Ok(route),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    model_name = %model_name,
                    error = %e,
                    "🧪 AB_TESTING: Allocation failed, serving production"
                );
            }
        }

        let production = self
            .registry
            .get_version(model_name, ModelStage::Production)
            .await?;
        Ok(Route {
            version: production.version,
            experiment: None,
        })
    }

    async fn experiment_route(
        &self,
        model_name: &str,
        identifier: Option<&str>,
    ) -> Result<Option<Route>> {
        let Some(experiment) = self.ab_testing.active_experiment(model_name).await? else {
            return Ok(None);
        };
        let variant = self
            .ab_testing
            .get_variant(&experiment.experiment_id, identifier)
            .await?;
        debug!(
            experiment_id = %experiment.experiment_id,
            variant = %variant.name,
            version = variant.model_version,
            "🧪 AB_TESTING: Routed request"
        );
        Ok(Some(Route {
            version: variant.model_version,
            experiment: Some((experiment.experiment_id, variant.name)),
        }))
    }

    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Numeric top-level fields of an object input, used for drift tracking
fn features_from_input(input: &Value) -> Option<FeatureVector> {
    let object = input.as_object()?;
    let features: FeatureVector = object
        .iter()
        .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
        .collect();
    (!features.is_empty()).then_some(features)
}
