#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # ModelOps Core
//!
//! Control plane for the lifecycle of machine-learning models in production.
//!
//! ## Overview
//!
//! ModelOps Core keeps versioned model artifacts with stage promotion, splits
//! live traffic between versions for statistically evaluated experiments,
//! watches serving health and input drift, and retrains models through a
//! dependency-ordered task pipeline when schedules or degradation call for it.
//!
//! ## Module Organization
//!
//! - [`registry`] - Versioned artifacts, stage promotion, lineage
//! - [`ab_testing`] - Experiments, sticky allocation, winner recommendation
//! - [`monitoring`] - Alerts, drift detection, dashboards, resource sampling
//! - [`metrics`] - Bounded windowed counters and latency histograms
//! - [`pipeline`] - Retraining DAG, task executor, triggers, notifications
//! - [`serving`] - Prediction facade tying the components together
//! - [`system`] - Bootstrap and shutdown of the whole control plane
//! - [`store`] - In-memory and SQLite persistence
//! - [`state_machine`] - Task and experiment lifecycles
//! - [`config`] - YAML configuration with environment overrides
//! - [`error`] - Structured error handling
//! - [`events`] - Lifecycle event publishing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modelops_core::config::ConfigManager;
//! use modelops_core::system::ModelOpsSystem;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?;
//! let system = ModelOpsSystem::bootstrap(config).await?;
//!
//! let prediction = system
//!     .server()
//!     .predict("ranker", &serde_json::json!({"clicks": 3}), Some("user-42"))
//!     .await?;
//! println!("served by v{}", prediction.version);
//!
//! system.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and property tests
//! ```

pub mod ab_testing;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod monitoring;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod serving;
pub mod state_machine;
pub mod store;
pub mod system;

pub use ab_testing::{AbTestingFramework, Experiment, Variant, WinnerRecommendation};
pub use config::{ConfigManager, ModelOpsConfig};
pub use error::{ModelOpsError, Result};
pub use events::EventPublisher;
pub use monitoring::{Alert, HealthStatus, ModelMonitor};
pub use pipeline::{RetrainingPipeline, TaskConfig, TriggerCondition};
pub use registry::{ModelArtifact, ModelRegistry, ModelStage, ModelVersion};
pub use serving::{ModelServer, Prediction};
pub use system::ModelOpsSystem;
