//! Opaque model artifacts.
//!
//! The registry never inspects an artifact beyond these traits. Once
//! registered an artifact is shared behind `Arc` and only `predict` can be
//! called on it; retraining always produces a fresh artifact.

use super::types::ModelMetrics;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// A trainable, scoreable model
pub trait ModelArtifact: Send + Sync + Debug {
    /// Identifier used to pick an [`ArtifactLoader`] when decoding
    fn artifact_type(&self) -> &str;

    /// Fit on `data`, returning training metrics
    fn train(&mut self, data: &Value) -> anyhow::Result<ModelMetrics>;

    fn predict(&self, input: &Value) -> anyhow::Result<Value>;

    /// Serialized form for durable stores. Artifacts without one are kept
    /// only in the in-process cache.
    fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!(
            "artifact type '{}' does not support serialization",
            self.artifact_type()
        )
    }
}

/// Rebuilds artifacts from their persisted bytes
pub trait ArtifactLoader: Send + Sync {
    fn load(&self, artifact_type: &str, bytes: &[u8]) -> anyhow::Result<Arc<dyn ModelArtifact>>;
}

/// Shared handle to a registered artifact
pub type SharedArtifact = Arc<dyn ModelArtifact>;
