//! # Retraining Pipeline
//!
//! A small DAG orchestrator. Tasks declare dependencies, the plan groups them
//! into waves, and each wave runs concurrently behind a barrier. Every task
//! attempt runs under a timeout and failed attempts retry with exponential
//! backoff before the task's `on_failure` policy decides what the run does
//! next.
//!
//! Runs are started through one entry point, [`RetrainingPipeline::run`],
//! whatever the trigger: schedule, Monitor degradation or drift, a manual
//! call or model feedback. One run at a time; extra triggers are dropped.

pub mod canonical;
pub mod context;
pub mod executor;
pub mod notification;
pub mod plan;
pub mod retraining;
pub mod run_guard;
pub mod schedule;
pub mod task;
pub mod triggers;
pub mod types;

pub use canonical::{
    canonical_pipeline, CandidateTrainer, CanonicalSettings, TrainedCandidate, TrainingData,
};
pub use context::PipelineContext;
pub use executor::execute_task;
pub use notification::{
    CollectingSink, EventSink, LoggingSink, NotificationSink, NotificationStatus,
    PipelineNotification,
};
pub use plan::build_execution_plan;
pub use retraining::RetrainingPipeline;
pub use run_guard::{RunGuard, RunPermit};
pub use schedule::Schedule;
pub use task::{task_fn, FnTask, PipelineTask};
pub use triggers::{
    spawn_triggers, spawn_triggers_with, DegradationWatcher, TriggerHandle,
    DEFAULT_RUN_DRAIN_TIMEOUT,
};
pub use types::{
    OnFailure, PipelineConfig, PipelineRun, PipelineStatus, RunOutcome, RunState, TaskConfig,
    TaskResult, TriggerCondition,
};
