use super::context::PipelineContext;
use super::executor::execute_task;
use super::notification::{NotificationSink, PipelineNotification};
use super::plan::build_execution_plan;
use super::run_guard::RunGuard;
use super::task::PipelineTask;
use super::types::{
    OnFailure, PipelineConfig, PipelineRun, PipelineStatus, RunOutcome, TaskConfig, TaskResult,
    TriggerCondition,
};
use crate::error::{ModelOpsError, Result};
use crate::logging::log_pipeline_operation;
use crate::resilience::BackoffPolicy;
use crate::state_machine::TaskStatus;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

struct RegisteredTask {
    config: TaskConfig,
    body: Arc<dyn PipelineTask>,
}

#[derive(Debug, Default)]
struct CurrentRun {
    run_id: Option<String>,
    trigger: Option<TriggerCondition>,
}

/// DAG orchestrator for one model's retraining.
///
/// Tasks run wave by wave. Inside a wave tasks run concurrently, bounded by
/// `max_concurrent_tasks`, and the next wave starts only after every task of
/// the current one has settled. At most one run is in flight per instance:
/// triggers arriving mid-run are dropped.
pub struct RetrainingPipeline {
    config: PipelineConfig,
    tasks: RwLock<BTreeMap<String, RegisteredTask>>,
    guard: RunGuard,
    backoff: BackoffPolicy,
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
    current: RwLock<CurrentRun>,
    history: RwLock<VecDeque<PipelineRun>>,
    total_runs: AtomicU64,
    dropped_triggers: AtomicU64,
}

impl std::fmt::Debug for RetrainingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrainingPipeline")
            .field("pipeline_id", &self.config.pipeline_id)
            .field("tasks", &self.tasks.read().keys().collect::<Vec<_>>())
            .field("state", &self.guard.state())
            .finish()
    }
}

impl RetrainingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_backoff(config, BackoffPolicy::default())
    }

    pub fn with_backoff(config: PipelineConfig, backoff: BackoffPolicy) -> Self {
        info!(
            pipeline_id = %config.pipeline_id,
            model_name = %config.model_name,
            max_concurrent_tasks = config.max_concurrent_tasks,
            "🔁 PIPELINE: Creating retraining pipeline"
        );
        Self {
            config,
            tasks: RwLock::new(BTreeMap::new()),
            guard: RunGuard::new(),
            backoff,
            sinks: RwLock::new(Vec::new()),
            current: RwLock::new(CurrentRun::default()),
            history: RwLock::new(VecDeque::new()),
            total_runs: AtomicU64::new(0),
            dropped_triggers: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(sink);
    }

    /// Register a task and its dependency set. Dependencies may name tasks
    /// added later; they are resolved when the plan is built.
    pub fn add_task(&self, config: TaskConfig, body: Arc<dyn PipelineTask>) -> Result<()> {
        if config.task_id.trim().is_empty() {
            return Err(ModelOpsError::Validation(
                "task_id must not be empty".to_string(),
            ));
        }
        if config.dependencies.contains(&config.task_id) {
            return Err(ModelOpsError::Cycle(format!(
                "task '{}' depends on itself",
                config.task_id
            )));
        }

        let mut tasks = self.tasks.write();
        if tasks.contains_key(&config.task_id) {
            return Err(ModelOpsError::Validation(format!(
                "task '{}' is already registered",
                config.task_id
            )));
        }

        info!(
            pipeline_id = %self.config.pipeline_id,
            task_id = %config.task_id,
            dependencies = ?config.dependencies,
            on_failure = %config.on_failure,
            "🔁 PIPELINE: Added task"
        );
        tasks.insert(config.task_id.clone(), RegisteredTask { config, body });
        Ok(())
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }

    pub fn build_execution_plan(&self) -> Result<Vec<Vec<String>>> {
        let configs: BTreeMap<String, TaskConfig> = self
            .tasks
            .read()
            .iter()
            .map(|(id, task)| (id.clone(), task.config.clone()))
            .collect();
        build_execution_plan(&configs)
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Execute the DAG once. Returns `Dropped` if another run holds the
    /// pipeline. Task failures never surface as errors here; they are
    /// recorded in the returned run and in the notification.
    #[instrument(skip(self), fields(pipeline_id = %self.config.pipeline_id))]
    pub async fn run(&self, trigger: TriggerCondition) -> RunOutcome {
        let Some(_permit) = self.guard.try_acquire() else {
            self.dropped_triggers.fetch_add(1, Ordering::Relaxed);
            info!(
                trigger = %trigger,
                current_run = ?self.current.read().run_id,
                "🔁 PIPELINE: Pipeline already running, dropping trigger"
            );
            return RunOutcome::Dropped;
        };

        let run_id = uuid::Uuid::new_v4().to_string();
        {
            let mut current = self.current.write();
            current.run_id = Some(run_id.clone());
            current.trigger = Some(trigger);
        }
        info!(run_id = %run_id, trigger = %trigger, "🔁 PIPELINE: Triggering pipeline");
        log_pipeline_operation(
            "run_started",
            &self.config.pipeline_id,
            None,
            "running",
            Some(trigger.as_str()),
        );

        let run = self.execute_run(run_id, trigger).await;

        self.notify(&run).await;
        self.finish(&run);
        RunOutcome::Completed(Box::new(run))
    }

    async fn execute_run(&self, run_id: String, trigger: TriggerCondition) -> PipelineRun {
        let started_at = Utc::now();
        let context = Arc::new(PipelineContext::new(
            run_id.clone(),
            self.config.pipeline_id.clone(),
            self.config.model_name.clone(),
            trigger,
        ));

        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut run_error: Option<String> = None;

        let plan = match self.build_execution_plan() {
            Ok(plan) => plan,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "🔁 PIPELINE: Cannot build execution plan");
                return self.assemble_run(
                    run_id,
                    trigger,
                    started_at,
                    Vec::new(),
                    results,
                    Some(e.to_string()),
                    &context,
                );
            }
        };

        // Snapshot of task bodies so the registry lock is not held across awaits
        let tasks: HashMap<String, (TaskConfig, Arc<dyn PipelineTask>)> = self
            .tasks
            .read()
            .iter()
            .map(|(id, task)| (id.clone(), (task.config.clone(), Arc::clone(&task.body))))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        // Tasks whose dependents must not run
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        for (wave_index, wave) in plan.iter().enumerate() {
            if let Some(reason) = &run_error {
                for task_id in wave {
                    results.insert(
                        task_id.clone(),
                        TaskResult::skipped(task_id, format!("run aborted: {reason}")),
                    );
                }
                continue;
            }

            let mut dispatch = Vec::new();
            for task_id in wave {
                let (config, body) = &tasks[task_id];
                match config.dependencies.iter().find(|dep| blocked.contains(*dep)) {
                    Some(upstream) => {
                        info!(
                            task_id = %task_id,
                            upstream = %upstream,
                            "🔁 PIPELINE: Skipping task, upstream task did not succeed"
                        );
                        blocked.insert(task_id.clone());
                        results.insert(
                            task_id.clone(),
                            TaskResult::skipped(
                                task_id,
                                format!("upstream task '{upstream}' did not succeed"),
                            ),
                        );
                    }
                    None => dispatch.push((config, Arc::clone(body))),
                }
            }

            info!(
                run_id = %run_id,
                wave = wave_index,
                tasks = dispatch.len(),
                "🔁 PIPELINE: Dispatching wave"
            );

            let settled = join_all(dispatch.into_iter().map(|(config, body)| {
                let semaphore = Arc::clone(&semaphore);
                let context = Arc::clone(&context);
                let backoff = &self.backoff;
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (config, execute_task(config, body, context, backoff).await)
                }
            }))
            .await;

            for (config, mut result) in settled {
                match result.status {
                    TaskStatus::Success => {
                        if let Err(e) =
                            context.insert_output(&config.task_id, result.output.clone())
                        {
                            warn!(
                                task_id = %config.task_id,
                                error = %e,
                                "🔁 PIPELINE: Output not recorded"
                            );
                        }
                    }
                    _ => match config.on_failure {
                        OnFailure::Fail => {
                            run_error.get_or_insert_with(|| {
                                result
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| format!("task '{}' failed", config.task_id))
                            });
                        }
                        OnFailure::Continue => {
                            blocked.insert(config.task_id.clone());
                        }
                        OnFailure::Skip => {
                            result.status = TaskStatus::Skipped;
                        }
                    },
                }
                log_pipeline_operation(
                    "task_finished",
                    &self.config.pipeline_id,
                    Some(&config.task_id),
                    &result.status.to_string(),
                    result.error.as_deref(),
                );
                results.insert(config.task_id.clone(), result);
            }
        }

        self.assemble_run(run_id, trigger, started_at, plan, results, run_error, &context)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_run(
        &self,
        run_id: String,
        trigger: TriggerCondition,
        started_at: chrono::DateTime<Utc>,
        plan: Vec<Vec<String>>,
        mut results: HashMap<String, TaskResult>,
        error: Option<String>,
        context: &PipelineContext,
    ) -> PipelineRun {
        let finished_at = Utc::now();
        let task_results = plan
            .iter()
            .flatten()
            .filter_map(|task_id| results.remove(task_id))
            .collect();

        PipelineRun {
            run_id,
            pipeline_id: self.config.pipeline_id.clone(),
            model_name: self.config.model_name.clone(),
            trigger,
            started_at,
            finished_at,
            duration_seconds: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
            success: error.is_none(),
            error,
            plan,
            task_results,
            outputs: context.snapshot(),
        }
    }

    /// Deliver the completion message to every sink. Sink failures are
    /// logged and never affect the run.
    async fn notify(&self, run: &PipelineRun) {
        let notification = PipelineNotification::from_run(run);
        let sinks: Vec<Arc<dyn NotificationSink>> = self.sinks.read().clone();

        info!(
            run_id = %run.run_id,
            success = run.success,
            duration_seconds = run.duration_seconds,
            "🔁 PIPELINE: Pipeline completed with status {}",
            if run.success { "SUCCESS" } else { "FAILED" }
        );

        for sink in sinks {
            if let Err(e) = sink.notify(&notification).await {
                warn!(sink = sink.name(), error = %e, "🔁 PIPELINE: Notification sink failed");
            }
        }
    }

    fn finish(&self, run: &PipelineRun) {
        log_pipeline_operation(
            "run_finished",
            &self.config.pipeline_id,
            None,
            if run.success { "success" } else { "failed" },
            run.error.as_deref(),
        );

        self.total_runs.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.write();
        history.push_back(run.clone());
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
        drop(history);

        *self.current.write() = CurrentRun::default();
    }

    pub fn get_run_status(&self) -> PipelineStatus {
        let current = self.current.read();
        PipelineStatus {
            pipeline_id: self.config.pipeline_id.clone(),
            model_name: self.config.model_name.clone(),
            state: self.guard.state(),
            current_run_id: current.run_id.clone(),
            current_trigger: current.trigger,
            last_run: self.history.read().back().cloned(),
            total_runs: self.total_runs.load(Ordering::Relaxed),
            dropped_triggers: self.dropped_triggers.load(Ordering::Relaxed),
        }
    }

    /// Completed runs, oldest first
    pub fn history(&self) -> Vec<PipelineRun> {
        self.history.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::notification::CollectingSink;
    use crate::pipeline::task::task_fn;
    use crate::pipeline::types::RunState;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(20), 0.0)
    }

    fn pipeline() -> RetrainingPipeline {
        RetrainingPipeline::with_backoff(PipelineConfig::new("ranker"), fast_backoff())
    }

    fn ok(value: Value) -> Arc<dyn PipelineTask> {
        task_fn(move |_ctx| {
            let value = value.clone();
            async move { Ok::<_, anyhow::Error>(value) }
        })
    }

    fn failing() -> Arc<dyn PipelineTask> {
        task_fn(|_ctx| async { Err::<Value, _>(anyhow::anyhow!("boom")) })
    }

    #[tokio::test]
    async fn test_outputs_flow_downstream() {
        let pipeline = pipeline();
        pipeline
            .add_task(TaskConfig::new("collect"), ok(json!({"rows": 42})))
            .unwrap();
        pipeline
            .add_task(
                TaskConfig::new("train").depends_on(["collect"]),
                task_fn(|ctx: Arc<PipelineContext>| async move {
                    let rows = ctx
                        .output_field("collect", "rows")
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| anyhow::anyhow!("no rows"))?;
                    Ok::<_, anyhow::Error>(json!({"trained_on": rows}))
                }),
            )
            .unwrap();

        let outcome = pipeline.run(TriggerCondition::Manual).await;
        let run = outcome.run().unwrap();
        assert!(run.success);
        assert_eq!(run.outputs["train"], json!({"trained_on": 42}));
        assert_eq!(pipeline.get_run_status().state, RunState::Idle);
        assert_eq!(pipeline.get_run_status().total_runs, 1);
    }

    #[tokio::test]
    async fn test_cycle_executes_nothing_and_still_notifies() {
        let pipeline = pipeline();
        let sink = Arc::new(CollectingSink::new());
        pipeline.add_sink(sink.clone());

        let calls = Arc::new(AtomicU32::new(0));
        for (id, dep) in [("a", "b"), ("b", "a")] {
            let calls = Arc::clone(&calls);
            pipeline
                .add_task(
                    TaskConfig::new(id).depends_on([dep]),
                    task_fn(move |_ctx| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, anyhow::Error>(Value::Null)
                        }
                    }),
                )
                .unwrap();
        }

        assert!(matches!(
            pipeline.build_execution_plan(),
            Err(ModelOpsError::Cycle(_))
        ));

        let run = pipeline.run(TriggerCondition::Manual).await;
        let run = run.run().unwrap();
        assert!(!run.success);
        assert!(run.task_results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_policy_aborts_after_wave() {
        let pipeline = pipeline();
        pipeline
            .add_task(TaskConfig::new("bad").with_retry_count(0), failing())
            .unwrap();
        pipeline
            .add_task(TaskConfig::new("sibling"), ok(json!({"done": true})))
            .unwrap();
        pipeline
            .add_task(TaskConfig::new("later").depends_on(["sibling"]), ok(Value::Null))
            .unwrap();

        let outcome = pipeline.run(TriggerCondition::Manual).await;
        let run = outcome.run().unwrap();
        assert!(!run.success);
        assert_eq!(run.status_of("bad"), Some(TaskStatus::Failed));
        // the sibling in the same wave is allowed to finish
        assert_eq!(run.status_of("sibling"), Some(TaskStatus::Success));
        assert_eq!(run.status_of("later"), Some(TaskStatus::Skipped));
    }

    #[tokio::test]
    async fn test_skip_policy_lets_dependents_run() {
        let pipeline = pipeline();
        pipeline
            .add_task(
                TaskConfig::new("optional")
                    .with_retry_count(0)
                    .with_on_failure(OnFailure::Skip),
                failing(),
            )
            .unwrap();
        pipeline
            .add_task(
                TaskConfig::new("next").depends_on(["optional"]),
                task_fn(|ctx: Arc<PipelineContext>| async move {
                    Ok::<_, anyhow::Error>(json!({"saw_output": ctx.has_output("optional")}))
                }),
            )
            .unwrap();

        let outcome = pipeline.run(TriggerCondition::Manual).await;
        let run = outcome.run().unwrap();
        assert!(run.success);
        let optional = run.task("optional").unwrap();
        assert_eq!(optional.status, TaskStatus::Skipped);
        assert!(optional.error.is_some());
        assert_eq!(run.outputs["next"], json!({"saw_output": false}));
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_dropped() {
        let pipeline = Arc::new(pipeline());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        pipeline
            .add_task(
                TaskConfig::new("slow"),
                task_fn(move |_ctx| {
                    let release_rx = Arc::clone(&release_rx);
                    async move {
                        if let Some(rx) = release_rx.lock().await.take() {
                            let _ = rx.await;
                        }
                        Ok::<_, anyhow::Error>(Value::Null)
                    }
                }),
            )
            .unwrap();

        let first = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run(TriggerCondition::Scheduled).await }
        });
        while !pipeline.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(pipeline.run(TriggerCondition::Manual).await.is_dropped());
        assert_eq!(
            pipeline.get_run_status().current_trigger,
            Some(TriggerCondition::Scheduled)
        );

        release_tx.send(()).unwrap();
        assert!(!first.await.unwrap().is_dropped());
        let status = pipeline.get_run_status();
        assert_eq!(status.total_runs, 1);
        assert_eq!(status.dropped_triggers, 1);
    }

    #[test]
    fn test_add_task_validation() {
        let pipeline = pipeline();
        assert!(pipeline
            .add_task(TaskConfig::new("a").depends_on(["a"]), ok(Value::Null))
            .is_err());
        pipeline.add_task(TaskConfig::new("a"), ok(Value::Null)).unwrap();
        assert!(pipeline.add_task(TaskConfig::new("a"), ok(Value::Null)).is_err());
    }
}
