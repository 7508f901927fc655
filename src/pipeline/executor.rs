//! Executes one task: per-attempt timeout, retries with exponential backoff,
//! status tracked by the task state machine.

use super::context::PipelineContext;
use super::task::PipelineTask;
use super::types::{TaskConfig, TaskResult};
use crate::resilience::BackoffPolicy;
use crate::state_machine::{TaskEvent, TaskStateMachine};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Run `task` until it succeeds or `config.retry_count` retries are used up.
/// Never returns an error: failures are folded into the `TaskResult`. A
/// panicking body counts as a failed attempt.
pub async fn execute_task(
    config: &TaskConfig,
    task: Arc<dyn PipelineTask>,
    context: Arc<PipelineContext>,
    backoff: &BackoffPolicy,
) -> TaskResult {
    let task_id = config.task_id.as_str();
    let start_time = Utc::now();
    let attempt_timeout = Duration::from_secs(config.timeout_seconds.max(1));
    let mut machine = TaskStateMachine::new(task_id, config.retry_count);
    let mut previous_delay: Option<Duration> = None;

    if let Err(e) = machine.transition(TaskEvent::Start) {
        return TaskResult::failed(task_id, start_time, e.to_string(), 0);
    }

    loop {
        let attempt = machine.attempts();
        info!(
            task_id = %task_id,
            run_id = %context.run_id(),
            attempt,
            "🔁 PIPELINE: Executing task"
        );

        let attempt_future = AssertUnwindSafe(task.execute(Arc::clone(&context))).catch_unwind();
        let error = match timeout(attempt_timeout, attempt_future).await {
            Ok(Ok(Ok(output))) => {
                if let Err(e) = machine.transition(TaskEvent::Succeed) {
                    return TaskResult::failed(task_id, start_time, e.to_string(), attempt);
                }
                info!(task_id = %task_id, attempt, "🔁 PIPELINE: Task completed successfully");
                return TaskResult::success(task_id, start_time, output, attempt);
            }
            Ok(Ok(Err(e))) => format!("Task {task_id} failed: {e:#}"),
            Ok(Err(payload)) => format!("Task {task_id} panicked: {}", panic_message(&*payload)),
            Err(_) => format!(
                "Task {task_id} timed out after {}s",
                attempt_timeout.as_secs()
            ),
        };

        if machine.can_retry() {
            warn!(task_id = %task_id, attempt, error = %error, "🔁 PIPELINE: Task attempt failed");
            if let Err(e) = machine.transition(TaskEvent::Fail {
                error: error.clone(),
                retryable: true,
            }) {
                return TaskResult::failed(task_id, start_time, e.to_string(), attempt);
            }

            let delay = backoff.next_delay(attempt, previous_delay);
            previous_delay = Some(delay);
            debug!(
                task_id = %task_id,
                delay_ms = delay.as_millis() as u64,
                "🔁 PIPELINE: Backing off before retry"
            );
            tokio::time::sleep(delay).await;

            if let Err(e) = machine.transition(TaskEvent::Resume) {
                return TaskResult::failed(task_id, start_time, e.to_string(), attempt);
            }
            continue;
        }

        error!(
            task_id = %task_id,
            attempts = attempt,
            error = %error,
            "🔁 PIPELINE: Task failed after exhausting retries"
        );
        if let Err(e) = machine.transition(TaskEvent::Fail {
            error: error.clone(),
            retryable: false,
        }) {
            debug!(task_id = %task_id, error = %e, "Terminal transition rejected");
        }
        return TaskResult::failed(task_id, start_time, error, attempt);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
