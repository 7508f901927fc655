//! Lifecycle event broadcasting.

pub mod publisher;

pub use publisher::{EventPublisher, PublishError, PublishedEvent};

/// Event names published by the control plane
pub mod names {
    pub const MODEL_REGISTERED: &str = "model.registered";
    pub const MODEL_PROMOTED: &str = "model.promoted";
    pub const MODEL_DELETED: &str = "model.deleted";
    pub const EXPERIMENT_CREATED: &str = "experiment.created";
    pub const EXPERIMENT_STOPPED: &str = "experiment.stopped";
    pub const EXPERIMENT_COMPLETED: &str = "experiment.completed";
    pub const ALERT_FIRED: &str = "alert.fired";
    pub const ALERT_CLEARED: &str = "alert.cleared";
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
}
