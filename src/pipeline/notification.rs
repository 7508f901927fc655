//! Pipeline completion notifications.

use super::types::{PipelineRun, TaskResult, TriggerCondition};
use crate::events::{names, EventPublisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Success,
    Failed,
}

/// Structured completion message sent for every run, aborted ones included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineNotification {
    pub pipeline_id: String,
    pub run_id: String,
    pub model_name: String,
    pub status: NotificationStatus,
    pub trigger: TriggerCondition,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub task_results: Vec<TaskResult>,
}

impl PipelineNotification {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            pipeline_id: run.pipeline_id.clone(),
            run_id: run.run_id.clone(),
            model_name: run.model_name.clone(),
            status: if run.success {
                NotificationStatus::Success
            } else {
                NotificationStatus::Failed
            },
            trigger: run.trigger,
            duration_seconds: run.duration_seconds,
            timestamp: run.finished_at,
            error: run.error.clone(),
            task_results: run.task_results.clone(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &PipelineNotification) -> anyhow::Result<()>;
}

/// Writes each notification as one structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    fn name(&self) -> &str {
        "logging"
    }

    async fn notify(&self, notification: &PipelineNotification) -> anyhow::Result<()> {
        let message = serde_json::to_string(notification)?;
        tracing::info!(
            pipeline_id = %notification.pipeline_id,
            run_id = %notification.run_id,
            status = ?notification.status,
            notification = %message,
            "🔁 PIPELINE: Notification"
        );
        Ok(())
    }
}

/// Forwards notifications as `pipeline.completed` events
#[derive(Debug, Clone)]
pub struct EventSink {
    events: EventPublisher,
}

impl EventSink {
    pub fn new(events: EventPublisher) -> Self {
        Self { events }
    }
}

#[async_trait]
impl NotificationSink for EventSink {
    fn name(&self) -> &str {
        "events"
    }

    async fn notify(&self, notification: &PipelineNotification) -> anyhow::Result<()> {
        self.events
            .publish_serialized(names::PIPELINE_COMPLETED, notification)?;
        Ok(())
    }
}

/// Keeps notifications in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    received: Mutex<Vec<PipelineNotification>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<PipelineNotification> {
        self.received.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn notify(&self, notification: &PipelineNotification) -> anyhow::Result<()> {
        self.received.lock().push(notification.clone());
        Ok(())
    }
}
