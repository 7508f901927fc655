use crate::config::ConfigurationError;

/// Crate-wide error taxonomy.
///
/// Registry and A/B operations fail fast with these before mutating anything.
/// Monitor recording paths never surface them, and pipeline task failures are
/// contained in `TaskResult`s rather than returned from `run()`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelOpsError {
    /// Malformed input or configuration, rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown model, version, experiment or variant
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence backend unavailable or failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A task or health check exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Task dependencies do not form an orderable DAG
    #[error("Cycle error: {0}")]
    Cycle(String),

    /// Two promotions or runs collided
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A pipeline task body or artifact call returned an error
    #[error("Task error: {0}")]
    Task(String),
}

impl ModelOpsError {
    /// Whether the caller may reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Timeout(_) | Self::Concurrency(_)
        )
    }

    /// Short machine-readable kind, used in logs and notifications
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::Timeout(_) => "timeout",
            Self::Cycle(_) => "cycle",
            Self::Concurrency(_) => "concurrency",
            Self::Configuration(_) => "configuration",
            Self::Serialization(_) => "serialization",
            Self::Task(_) => "task",
        }
    }
}

impl From<serde_json::Error> for ModelOpsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for ModelOpsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<ConfigurationError> for ModelOpsError {
    fn from(err: ConfigurationError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelOpsError>;
