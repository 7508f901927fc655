//! # Model Registry
//!
//! Durable store of model artifacts, their version metadata and the stage
//! each version occupies. At most one version per model name is in
//! Production at any instant.

pub mod artifact;
pub mod model_registry;
pub mod types;

pub use artifact::{ArtifactLoader, ModelArtifact, SharedArtifact};
pub use model_registry::ModelRegistry;
pub use types::{
    MetricComparison, ModelLineage, ModelMetrics, ModelStage, ModelTags, ModelVersion,
    NewModelVersion, PromotionOutcome, VersionComparison, VersionSelector,
};
