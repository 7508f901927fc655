use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskStatus,
};
use chrono::{DateTime, Utc};

/// One applied transition, kept for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub event: &'static str,
    pub at: DateTime<Utc>,
}

/// Attempt-level state machine for a single pipeline task.
///
/// `Pending -> Running -> {Success, Retry -> Running, Failed, Skipped}` with
/// at most `retry_limit` re-entries into `Running` after the first attempt.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    task_id: String,
    status: TaskStatus,
    attempts: u32,
    retry_limit: u32,
    history: Vec<TaskTransition>,
}

impl TaskStateMachine {
    pub fn new(task_id: impl Into<String>, retry_limit: u32) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            retry_limit,
            history: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn history(&self) -> &[TaskTransition] {
        &self.history
    }

    /// Whether another attempt is allowed after the current one fails
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.retry_limit
    }

    /// Apply an event, returning the new status
    pub fn transition(&mut self, event: TaskEvent) -> StateMachineResult<TaskStatus> {
        let target = self.determine_target_state(self.status, &event)?;

        if matches!(
            (self.status, target),
            (TaskStatus::Pending, TaskStatus::Running) | (TaskStatus::Retry, TaskStatus::Running)
        ) {
            self.attempts += 1;
        }

        tracing::trace!(
            task_id = %self.task_id,
            from = %self.status,
            to = %target,
            event = event.event_type(),
            attempts = self.attempts,
            "Task transition"
        );

        self.history.push(TaskTransition {
            from: self.status,
            to: target,
            event: event.event_type(),
            at: Utc::now(),
        });
        self.status = target;
        Ok(target)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        &self,
        current: TaskStatus,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        let target = match (current, event) {
            (TaskStatus::Pending, TaskEvent::Start) => TaskStatus::Running,
            (TaskStatus::Retry, TaskEvent::Resume) => TaskStatus::Running,

            (TaskStatus::Running, TaskEvent::Succeed) => TaskStatus::Success,

            (TaskStatus::Running, TaskEvent::Fail { retryable: true, .. }) => {
                if !self.can_retry() {
                    return Err(StateMachineError::RetryLimitExhausted {
                        limit: self.retry_limit,
                    });
                }
                TaskStatus::Retry
            }
            (TaskStatus::Running, TaskEvent::Fail { retryable: false, .. }) => TaskStatus::Failed,

            (TaskStatus::Pending, TaskEvent::Skip { .. }) => TaskStatus::Skipped,
            (TaskStatus::Running, TaskEvent::Skip { .. }) => TaskStatus::Skipped,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}
