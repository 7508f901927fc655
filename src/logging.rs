//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and, optionally, a JSON
//! log file, so rollout decisions and pipeline runs can be reconstructed later.

use crate::config::TelemetryConfig;
use chrono::Utc;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with default telemetry settings
pub fn init_structured_logging() {
    init_structured_logging_with(&TelemetryConfig::default());
}

/// Initialize structured logging. Safe to call more than once; only the
/// first call installs a subscriber.
pub fn init_structured_logging_with(telemetry: &TelemetryConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = telemetry
            .log_level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        let (file_layer, guard, log_path) = if telemetry.file_output {
            let log_dir = PathBuf::from(&telemetry.log_directory);
            match std::fs::create_dir_all(&log_dir) {
                Ok(()) => {
                    let pid = process::id();
                    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
                    let log_filename = format!("{environment}.{pid}.{timestamp}.log");
                    let log_path = log_dir.join(&log_filename);
                    let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
                    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

                    let layer = fmt::layer()
                        .with_writer(file_writer)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(EnvFilter::new(log_level.clone()));
                    (Some(layer), Some(guard), Some(log_path))
                }
                Err(e) => {
                    eprintln!("failed to create log directory {}: {e}", log_dir.display());
                    (None, None, None)
                }
            }
        } else {
            (None, None, None)
        };

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        if subscriber.try_init().is_err() {
            // Someone else (usually a test harness) owns the global subscriber
            tracing::debug!("Global tracing subscriber already initialized - continuing");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
            "🔧 STRUCTURED LOGGING: Initialized"
        );

        guard
    });
}

fn get_environment() -> String {
    std::env::var("MODELOPS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for registry operations
pub fn log_registry_operation(
    operation: &str,
    model_name: &str,
    version: Option<u64>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        model_name = %model_name,
        version = version,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📚 REGISTRY_OPERATION"
    );
}

/// Log structured data for experiment operations
pub fn log_experiment_operation(
    operation: &str,
    experiment_id: &str,
    model_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        experiment_id = %experiment_id,
        model_type = model_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🧪 EXPERIMENT_OPERATION"
    );
}

/// Log structured data for pipeline operations
pub fn log_pipeline_operation(
    operation: &str,
    pipeline_id: &str,
    task_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        pipeline_id = %pipeline_id,
        task_id = task_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 PIPELINE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let telemetry = TelemetryConfig {
            file_output: false,
            ..TelemetryConfig::default()
        };
        init_structured_logging_with(&telemetry);
        init_structured_logging_with(&telemetry);
        log_registry_operation("register", "ranker", Some(1), "success", None);
    }
}
