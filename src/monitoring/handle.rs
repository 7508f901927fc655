//! Background evaluation loop for a [`ModelMonitor`].

use super::monitor::ModelMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the task that periodically evaluates alerts and samples resources.
/// Dropping the handle cancels the loop; `shutdown` also waits for it.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Spawn the loop on the current tokio runtime
    pub fn spawn(monitor: Arc<ModelMonitor>) -> Self {
        let evaluation_interval = monitor.config().evaluation_interval();
        let resource_interval = monitor.config().resource_sample_interval();
        Self::spawn_with_intervals(monitor, evaluation_interval, resource_interval)
    }

    pub fn spawn_with_intervals(
        monitor: Arc<ModelMonitor>,
        evaluation_interval: Duration,
        resource_interval: Duration,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let task = tokio::spawn(async move {
            info!(
                evaluation_interval_ms = evaluation_interval.as_millis() as u64,
                resource_interval_ms = resource_interval.as_millis() as u64,
                "📊 MONITOR: Background evaluation started"
            );

            let mut evaluation = tokio::time::interval(evaluation_interval.max(Duration::from_millis(1)));
            evaluation.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut resources = tokio::time::interval(resource_interval.max(Duration::from_millis(1)));
            resources.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = evaluation.tick() => {
                        let firing = monitor.check_alerts();
                        if !firing.is_empty() {
                            warn!(count = firing.len(), "📊 MONITOR: Alerts firing");
                        }
                    }
                    _ = resources.tick() => {
                        for model_name in monitor.tracked_models() {
                            monitor.record_resource_usage(&model_name);
                        }
                        debug!("📊 MONITOR: Resource sample taken");
                    }
                }
            }

            info!("📊 MONITOR: Background evaluation stopped");
        });

        Self {
            cancel_token,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "📊 MONITOR: Background task ended abnormally");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitoring::{Alert, AlertCondition, AlertMetric, AlertSeverity};

    #[tokio::test]
    async fn test_loop_evaluates_and_stops() {
        let monitor = Arc::new(ModelMonitor::new(MonitorConfig::default()));
        monitor
            .add_alert(Alert::new(
                "errors",
                AlertMetric::ErrorRate,
                AlertCondition::GreaterThan,
                0.5,
                60,
                AlertSeverity::Warning,
            ))
            .unwrap();
        let mut events = monitor.events().subscribe();
        monitor.record_prediction("ranker", 1, 3.0, false, None, None);

        let handle = MonitorHandle::spawn_with_intervals(
            Arc::clone(&monitor),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        assert!(handle.is_running());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("alert event in time")
            .unwrap();
        assert_eq!(event.name, crate::events::names::ALERT_FIRED);

        handle.shutdown().await;
    }
}
