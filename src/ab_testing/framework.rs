use super::allocation;
use super::statistics;
use super::types::{
    Experiment, ExperimentResult, ExperimentResults, Variant, VariantResults,
    WinnerRecommendation,
};
use crate::clock::{system_clock, SharedClock};
use crate::config::AbTestingConfig;
use crate::error::{ModelOpsError, Result};
use crate::events::{names, EventPublisher};
use crate::logging::log_experiment_operation;
use crate::registry::ModelRegistry;
use crate::state_machine::{ExperimentEvent, ExperimentStateMachine, ExperimentStatus};
use crate::store::SharedStore;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest batch the background writer appends in one store call
const MAX_WRITE_BATCH: usize = 500;

enum WriterCommand {
    Record(ExperimentResult),
    Flush(oneshot::Sender<()>),
}

/// Live A/B experiments over registry versions.
///
/// Results are buffered in a bounded channel and appended to the store by a
/// background writer, so `record_result` costs one channel send on the
/// serving path. `flush` and `shutdown` drain the buffer.
pub struct AbTestingFramework {
    registry: Arc<ModelRegistry>,
    store: SharedStore,
    config: AbTestingConfig,
    experiments: RwLock<HashMap<String, Experiment>>,
    /// Serializes lifecycle changes so the one-running-per-model-type check
    /// and the write that follows it cannot interleave
    lifecycle: Mutex<()>,
    sender: RwLock<Option<mpsc::Sender<WriterCommand>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    events: EventPublisher,
    clock: SharedClock,
}

impl std::fmt::Debug for AbTestingFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbTestingFramework")
            .field("experiments", &self.experiments.read().len())
            .field("config", &self.config)
            .finish()
    }
}

impl AbTestingFramework {
    /// Create the framework and spawn its result writer. Must be called from
    /// within a tokio runtime.
    pub fn new(registry: Arc<ModelRegistry>, config: AbTestingConfig) -> Self {
        Self::with_parts(registry, config, EventPublisher::default(), system_clock())
    }

    pub fn with_parts(
        registry: Arc<ModelRegistry>,
        config: AbTestingConfig,
        events: EventPublisher,
        clock: SharedClock,
    ) -> Self {
        let store = registry.store().clone();
        let (sender, receiver) = mpsc::channel(config.result_buffer_capacity.max(1));
        let writer = tokio::spawn(run_result_writer(
            store.clone(),
            receiver,
            config.flush_interval(),
        ));

        Self {
            registry,
            store,
            config,
            experiments: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            sender: RwLock::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            events,
            clock,
        }
    }

    /// Load persisted experiments into the cache; used after a restart
    pub async fn hydrate(&self) -> Result<usize> {
        let stored = self.store.list_experiments().await?;
        let count = stored.len();
        let mut cache = self.experiments.write();
        for experiment in stored {
            cache.insert(experiment.experiment_id.clone(), experiment);
        }
        Ok(count)
    }

    /// Validate and start an experiment. Returns its id.
    pub async fn create_experiment(&self, mut experiment: Experiment) -> Result<String> {
        experiment.validate()?;
        if experiment.minimum_sample_size == 0 {
            experiment.minimum_sample_size = self.config.default_minimum_sample_size;
        }

        for variant in &experiment.variants {
            self.registry
                .get_version(&variant.model_name, variant.model_version)
                .await
                .map_err(|e| match e {
                    ModelOpsError::NotFound(what) => ModelOpsError::Validation(format!(
                        "variant '{}' references unknown {what}",
                        variant.name
                    )),
                    other => other,
                })?;
        }

        let _lifecycle = self.lifecycle.lock().await;
        self.complete_expired_locked().await?;

        if let Some(running) = self.running_for(&experiment.model_type) {
            return Err(ModelOpsError::Validation(format!(
                "experiment '{}' is already running for model type '{}'",
                running.experiment_id, experiment.model_type
            )));
        }

        if experiment.experiment_id.is_empty() {
            experiment.experiment_id = uuid::Uuid::new_v4().to_string();
        } else if self.find(&experiment.experiment_id).await?.is_some() {
            return Err(ModelOpsError::Validation(format!(
                "experiment id '{}' already exists",
                experiment.experiment_id
            )));
        }

        let now = self.clock.now();
        experiment.status =
            ExperimentStateMachine::determine_target_state(experiment.status, ExperimentEvent::Start)?;
        experiment.start_time = Some(now);
        if experiment.end_time.is_some_and(|end| end <= now) {
            return Err(ModelOpsError::Validation(
                "experiment end_time must be in the future".to_string(),
            ));
        }

        self.store.save_experiment(&experiment).await?;
        self.experiments
            .write()
            .insert(experiment.experiment_id.clone(), experiment.clone());

        let variant_names: Vec<&str> = experiment.variants.iter().map(|v| v.name.as_str()).collect();
        log_experiment_operation(
            "create",
            &experiment.experiment_id,
            Some(&experiment.model_type),
            "running",
            Some(&experiment.name),
        );
        self.events.publish(
            names::EXPERIMENT_CREATED,
            json!({
                "experiment_id": experiment.experiment_id,
                "model_type": experiment.model_type,
                "variants": variant_names,
            }),
        );

        Ok(experiment.experiment_id)
    }

    fn running_for(&self, model_type: &str) -> Option<Experiment> {
        self.experiments
            .read()
            .values()
            .find(|e| e.model_type == model_type && e.status == ExperimentStatus::Running)
            .cloned()
    }

    async fn find(&self, experiment_id: &str) -> Result<Option<Experiment>> {
        if let Some(cached) = self.experiments.read().get(experiment_id) {
            return Ok(Some(cached.clone()));
        }
        let stored = self.store.get_experiment(experiment_id).await?;
        if let Some(experiment) = &stored {
            self.experiments
                .write()
                .insert(experiment_id.to_string(), experiment.clone());
        }
        Ok(stored)
    }

    /// Current state of an experiment, completing it first if its end time
    /// has passed
    pub async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        let experiment = self
            .find(experiment_id)
            .await?
            .ok_or_else(|| ModelOpsError::NotFound(format!("experiment '{experiment_id}'")))?;

        if self.is_expired(&experiment) {
            let _lifecycle = self.lifecycle.lock().await;
            return self.transition(experiment_id, ExperimentEvent::Complete).await;
        }
        Ok(experiment)
    }

    pub async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self.experiments.read().values().cloned().collect();
        experiments.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(experiments)
    }

    /// The running experiment for a model type, if any
    pub async fn active_experiment(&self, model_type: &str) -> Result<Option<Experiment>> {
        let Some(running) = self.running_for(model_type) else {
            return Ok(None);
        };
        let current = self.get_experiment(&running.experiment_id).await?;
        Ok((current.status == ExperimentStatus::Running).then_some(current))
    }

    fn is_expired(&self, experiment: &Experiment) -> bool {
        experiment.status == ExperimentStatus::Running
            && experiment
                .end_time
                .is_some_and(|end| end <= self.clock.now())
    }

    /// Apply a lifecycle event. Caller holds the lifecycle lock.
    async fn transition(&self, experiment_id: &str, event: ExperimentEvent) -> Result<Experiment> {
        let mut experiment = self
            .find(experiment_id)
            .await?
            .ok_or_else(|| ModelOpsError::NotFound(format!("experiment '{experiment_id}'")))?;

        // lost a race with an explicit stop
        if event == ExperimentEvent::Complete && experiment.status.is_terminal() {
            return Ok(experiment);
        }

        let target = ExperimentStateMachine::determine_target_state(experiment.status, event)?;
        if target == experiment.status {
            return Ok(experiment);
        }

        let previous = experiment.status;
        experiment.status = target;
        if target == ExperimentStatus::Stopped {
            let now = self.clock.now();
            experiment.end_time = Some(experiment.end_time.map_or(now, |end| end.min(now)));
        }

        self.store.save_experiment(&experiment).await?;
        self.experiments
            .write()
            .insert(experiment_id.to_string(), experiment.clone());

        let event_name = match target {
            ExperimentStatus::Completed => names::EXPERIMENT_COMPLETED,
            _ => names::EXPERIMENT_STOPPED,
        };
        log_experiment_operation(
            event.event_type(),
            experiment_id,
            Some(&experiment.model_type),
            &target.to_string(),
            Some(&format!("from {previous}")),
        );
        self.events.publish(
            event_name,
            json!({ "experiment_id": experiment_id, "status": target }),
        );

        Ok(experiment)
    }

    /// Stop a running experiment. Allocation is frozen; results stay
    /// queryable. Stopping a stopped experiment is a no-op.
    pub async fn stop_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        let _lifecycle = self.lifecycle.lock().await;
        self.transition(experiment_id, ExperimentEvent::Stop).await
    }

    /// Complete every running experiment whose end time has passed
    pub async fn complete_expired(&self) -> Result<Vec<String>> {
        let _lifecycle = self.lifecycle.lock().await;
        self.complete_expired_locked().await
    }

    async fn complete_expired_locked(&self) -> Result<Vec<String>> {
        let expired: Vec<String> = self
            .experiments
            .read()
            .values()
            .filter(|e| self.is_expired(e))
            .map(|e| e.experiment_id.clone())
            .collect();

        for experiment_id in &expired {
            self.transition(experiment_id, ExperimentEvent::Complete).await?;
        }
        Ok(expired)
    }

    /// Variant serving `identifier`. Sticky for a given identifier; uniform
    /// random when `identifier` is `None`.
    pub async fn get_variant(
        &self,
        experiment_id: &str,
        identifier: Option<&str>,
    ) -> Result<Variant> {
        let experiment = self.get_experiment(experiment_id).await?;
        if !experiment.status.accepts_allocation() {
            return Err(ModelOpsError::Validation(format!(
                "experiment '{experiment_id}' is {} and no longer allocates traffic",
                experiment.status
            )));
        }

        allocation::allocate(&experiment, identifier)
            .cloned()
            .ok_or_else(|| {
                ModelOpsError::Validation(format!("experiment '{experiment_id}' has no variants"))
            })
    }

    /// Append one result. Never drops: if the buffer is full or the writer is
    /// gone the result is written straight to the store.
    pub async fn record_result(&self, result: ExperimentResult) -> Result<()> {
        let experiment = self
            .find(&result.experiment_id)
            .await?
            .ok_or_else(|| {
                ModelOpsError::NotFound(format!("experiment '{}'", result.experiment_id))
            })?;

        if experiment.variant(&result.variant_name).is_none() {
            return Err(ModelOpsError::Validation(format!(
                "experiment '{}' has no variant '{}'",
                result.experiment_id, result.variant_name
            )));
        }

        if !result.latency_ms.is_finite() || result.latency_ms < 0.0 {
            return Err(ModelOpsError::Validation(format!(
                "invalid latency {} for request '{}'",
                result.latency_ms, result.request_id
            )));
        }

        let sender = self.sender.read().clone();
        let result = match sender {
            Some(sender) => match sender.try_send(WriterCommand::Record(result)) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(WriterCommand::Record(result)))
                | Err(mpsc::error::TrySendError::Closed(WriterCommand::Record(result))) => {
                    debug!(
                        experiment_id = %result.experiment_id,
                        "Result buffer unavailable - appending directly"
                    );
                    result
                }
                Err(_) => return Ok(()),
            },
            None => result,
        };

        self.store.append_results(std::slice::from_ref(&result)).await
    }

    /// Wait until every buffered result has been handed to the store
    pub async fn flush(&self) -> Result<()> {
        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            return Ok(());
        };

        let (ack, done) = oneshot::channel();
        if sender.send(WriterCommand::Flush(ack)).await.is_err() {
            return Ok(());
        }
        done.await.map_err(|_| {
            ModelOpsError::Storage("experiment result writer stopped during flush".to_string())
        })
    }

    /// Drain the buffer and stop the writer. Later results go straight to the
    /// store.
    pub async fn shutdown(&self) -> Result<()> {
        let sender = self.sender.write().take();
        drop(sender);

        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            writer.await.map_err(|e| {
                ModelOpsError::Storage(format!("experiment result writer failed: {e}"))
            })?;
        }
        info!("🧪 AB_TESTING: Result writer stopped");
        Ok(())
    }

    /// Per-variant aggregates over every recorded result
    pub async fn get_experiment_results(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let experiment = self.get_experiment(experiment_id).await?;
        self.flush().await?;
        let results = self.store.load_results(experiment_id).await?;
        Ok(aggregate_results(&experiment, &results))
    }

    /// Declare a winner only when every variant reached the minimum sample
    /// size and the best one is significantly better than all others
    pub async fn recommend_winner(&self, experiment_id: &str) -> Result<WinnerRecommendation> {
        let experiment = self.get_experiment(experiment_id).await?;
        let results = self.get_experiment_results(experiment_id).await?;
        let recommendation = statistics::recommend(
            &results,
            &experiment.success_metrics,
            self.config.significance_level,
        );

        log_experiment_operation(
            "recommend_winner",
            experiment_id,
            Some(&experiment.model_type),
            recommendation.winner().unwrap_or("inconclusive"),
            None,
        );
        Ok(recommendation)
    }

    pub fn config(&self) -> &AbTestingConfig {
        &self.config
    }
}

#[derive(Default)]
struct VariantAccumulator {
    samples: u64,
    successes: u64,
    latency_sum: f64,
    metric_sums: BTreeMap<String, (f64, u64)>,
}

fn aggregate_results(experiment: &Experiment, results: &[ExperimentResult]) -> ExperimentResults {
    let mut by_variant: HashMap<&str, VariantAccumulator> = HashMap::new();
    for result in results {
        let acc = by_variant.entry(result.variant_name.as_str()).or_default();
        acc.samples += 1;
        if result.success {
            acc.successes += 1;
        }
        acc.latency_sum += result.latency_ms;
        for (name, value) in &result.metrics {
            let entry = acc.metric_sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    let variants: Vec<VariantResults> = experiment
        .variants
        .iter()
        .map(|variant| {
            let acc = by_variant.remove(variant.name.as_str()).unwrap_or_default();
            let n = acc.samples as f64;
            VariantResults {
                variant_name: variant.name.clone(),
                model_name: variant.model_name.clone(),
                model_version: variant.model_version,
                sample_size: acc.samples,
                success_count: acc.successes,
                success_rate: if acc.samples > 0 { acc.successes as f64 / n } else { 0.0 },
                avg_latency_ms: if acc.samples > 0 { acc.latency_sum / n } else { 0.0 },
                metrics: acc
                    .metric_sums
                    .into_iter()
                    .map(|(name, (sum, count))| (name, sum / count as f64))
                    .collect(),
                reached_minimum: acc.samples >= experiment.minimum_sample_size,
            }
        })
        .collect();

    if !by_variant.is_empty() {
        warn!(
            experiment_id = %experiment.experiment_id,
            unknown = ?by_variant.keys().collect::<Vec<_>>(),
            "Ignoring results for variants that are not part of the experiment"
        );
    }

    ExperimentResults {
        experiment_id: experiment.experiment_id.clone(),
        name: experiment.name.clone(),
        status: experiment.status,
        minimum_sample_size: experiment.minimum_sample_size,
        total_samples: variants.iter().map(|v| v.sample_size).sum(),
        minimum_reached: variants.iter().all(|v| v.reached_minimum),
        variants,
    }
}

async fn write_batch(store: &SharedStore, batch: &mut Vec<ExperimentResult>) {
    if batch.is_empty() {
        return;
    }
    match store.append_results(batch).await {
        Ok(()) => {
            debug!(count = batch.len(), "🧪 AB_TESTING: Results flushed");
            batch.clear();
        }
        Err(e) => {
            // Kept for the next tick; the buffer in front stays bounded
            error!(count = batch.len(), error = %e, "🧪 AB_TESTING: Failed to flush results");
        }
    }
}

async fn run_result_writer(
    store: SharedStore,
    mut receiver: mpsc::Receiver<WriterCommand>,
    flush_interval: Duration,
) {
    let mut batch: Vec<ExperimentResult> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(WriterCommand::Record(result)) => {
                    batch.push(result);
                    if batch.len() >= MAX_WRITE_BATCH {
                        write_batch(&store, &mut batch).await;
                    }
                }
                Some(WriterCommand::Flush(ack)) => {
                    write_batch(&store, &mut batch).await;
                    let _ = ack.send(());
                }
                None => {
                    write_batch(&store, &mut batch).await;
                    if !batch.is_empty() {
                        error!(lost = batch.len(), "🧪 AB_TESTING: Results could not be persisted at shutdown");
                    }
                    break;
                }
            },
            _ = ticker.tick() => write_batch(&store, &mut batch).await,
        }
    }
}
