//! Trigger sources feeding `RetrainingPipeline::run`: a wall-clock schedule
//! and a watcher over the Monitor's view of the production version.

use super::retraining::RetrainingPipeline;
use super::schedule::Schedule;
use super::types::TriggerCondition;
use crate::clock::{system_clock, SharedClock};
use crate::monitoring::{HealthStatus, ModelMonitor};
use crate::registry::ModelRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns the production version's dashboard into edge-triggered pipeline
/// triggers: a condition that persists across polls fires once.
#[derive(Debug)]
pub struct DegradationWatcher {
    model_name: String,
    monitor: Arc<ModelMonitor>,
    registry: Arc<ModelRegistry>,
    was_critical: bool,
    was_drifting: bool,
}

impl DegradationWatcher {
    pub fn new(
        model_name: impl Into<String>,
        monitor: Arc<ModelMonitor>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            monitor,
            registry,
            was_critical: false,
            was_drifting: false,
        }
    }

    /// Inspect the current production version and return the triggers whose
    /// condition started since the previous poll
    pub async fn poll(&mut self) -> Vec<TriggerCondition> {
        let production = match self.registry.current_production(&self.model_name).await {
            Ok(Some(version)) => version,
            Ok(None) => {
                self.was_critical = false;
                self.was_drifting = false;
                return Vec::new();
            }
            Err(e) => {
                warn!(
                    model_name = %self.model_name,
                    error = %e,
                    "🔁 PIPELINE: Could not resolve production version for trigger check"
                );
                return Vec::new();
            }
        };

        let dashboard = self
            .monitor
            .get_model_dashboard(&self.model_name, production.version);
        let critical = dashboard.health_status == HealthStatus::Critical;
        let drifting = dashboard.drift.has_drift;

        let mut triggers = Vec::new();
        if critical && !self.was_critical {
            warn!(
                model_name = %self.model_name,
                version = production.version,
                "🔁 PIPELINE: Critical health status detected"
            );
            triggers.push(TriggerCondition::PerformanceDegradation);
        }
        if drifting && !self.was_drifting {
            warn!(
                model_name = %self.model_name,
                version = production.version,
                score = dashboard.drift.score,
                "🔁 PIPELINE: Data drift detected"
            );
            triggers.push(TriggerCondition::DataDrift);
        }

        self.was_critical = critical;
        self.was_drifting = drifting;
        triggers
    }
}

/// How long [`TriggerHandle::shutdown`] waits for triggered runs by default
pub const DEFAULT_RUN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs started by trigger loops. Runs are spawned so a long run never
/// stalls the loop that triggered it; overlapping triggers are dropped by the
/// pipeline's run guard.
#[derive(Debug, Clone, Default)]
struct InFlightRuns {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl InFlightRuns {
    fn spawn(&self, pipeline: &Arc<RetrainingPipeline>, trigger: TriggerCondition) {
        let pipeline = Arc::clone(pipeline);
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            pipeline.run(trigger).await;
        });
    }

    fn len(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Wait up to `limit` for every run, then abort the stragglers
    async fn drain(&self, limit: Duration) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        info!(runs = tasks.len(), "🛑 SHUTDOWN: Waiting for in-flight pipeline runs");
        let drained = tokio::time::timeout(limit, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "🔁 PIPELINE: Triggered run ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout_secs = limit.as_secs(),
                "🛑 SHUTDOWN: Pipeline runs still in flight, aborting them"
            );
            tasks.shutdown().await;
        }
    }
}

/// Background loops that call into a pipeline. Dropping the handle cancels
/// the loops and aborts runs they started; `shutdown` lets those runs finish
/// first, within the drain timeout.
#[derive(Debug)]
pub struct TriggerHandle {
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    runs: InFlightRuns,
    drain_timeout: Duration,
}

impl TriggerHandle {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            tasks: Vec::new(),
            runs: InFlightRuns::default(),
            drain_timeout: DEFAULT_RUN_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Fire `run(Scheduled)` at every schedule point
    pub fn spawn_scheduler(
        &mut self,
        pipeline: Arc<RetrainingPipeline>,
        schedule: Schedule,
        clock: SharedClock,
    ) {
        let token = self.cancel_token.clone();
        let runs = self.runs.clone();
        self.tasks.push(tokio::spawn(async move {
            info!(
                pipeline_id = %pipeline.config().pipeline_id,
                schedule = %schedule,
                "🔁 PIPELINE: Scheduler started"
            );
            loop {
                let delay = schedule.delay_from(clock.now());
                debug!(delay_secs = delay.as_secs(), "🔁 PIPELINE: Next scheduled run");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        runs.spawn(&pipeline, TriggerCondition::Scheduled);
                    }
                }
            }
            info!("🔁 PIPELINE: Scheduler stopped");
        }));
    }

    /// Poll `watcher` every `poll_interval` and run the pipeline on each
    /// trigger it reports
    pub fn spawn_watcher(
        &mut self,
        pipeline: Arc<RetrainingPipeline>,
        mut watcher: DegradationWatcher,
        poll_interval: Duration,
    ) {
        let token = self.cancel_token.clone();
        let runs = self.runs.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for trigger in watcher.poll().await {
                            runs.spawn(&pipeline, trigger);
                        }
                    }
                }
            }
            info!("🔁 PIPELINE: Trigger watcher stopped");
        }));
    }

    /// Start a run in the background, tracked like the loop-triggered ones.
    /// Used for manual and model-feedback triggers.
    pub fn dispatch(&self, pipeline: &Arc<RetrainingPipeline>, trigger: TriggerCondition) {
        if self.cancel_token.is_cancelled() {
            warn!(trigger = %trigger, "🔁 PIPELINE: Triggers are shut down, dropping trigger");
            return;
        }
        self.runs.spawn(pipeline, trigger);
    }

    /// Runs started through this handle that have not finished yet
    pub fn in_flight_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled() && self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop the loops, then wait for the runs they started
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "🔁 PIPELINE: Trigger loop ended abnormally");
            }
        }
        self.runs.drain(self.drain_timeout).await;
    }
}

impl Default for TriggerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn the scheduler (when the pipeline has a schedule) and the degradation
/// watcher for `pipeline`
pub fn spawn_triggers(
    pipeline: Arc<RetrainingPipeline>,
    monitor: Arc<ModelMonitor>,
    registry: Arc<ModelRegistry>,
    poll_interval: Duration,
) -> crate::error::Result<TriggerHandle> {
    spawn_triggers_with(pipeline, monitor, registry, poll_interval, TriggerHandle::new())
}

/// [`spawn_triggers`] onto a preconfigured handle
pub fn spawn_triggers_with(
    pipeline: Arc<RetrainingPipeline>,
    monitor: Arc<ModelMonitor>,
    registry: Arc<ModelRegistry>,
    poll_interval: Duration,
    mut handle: TriggerHandle,
) -> crate::error::Result<TriggerHandle> {
    if let Some(expression) = pipeline.config().schedule_interval.clone() {
        let schedule: Schedule = expression.parse()?;
        handle.spawn_scheduler(Arc::clone(&pipeline), schedule, system_clock());
    }
    let watcher = DegradationWatcher::new(
        pipeline.config().model_name.clone(),
        monitor,
        registry,
    );
    handle.spawn_watcher(pipeline, watcher, poll_interval);
    Ok(handle)
}
