//! Task bodies.

use super::context::PipelineContext;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// The work a pipeline task performs. Returns the JSON output stored in the
/// run context under the task's id.
#[async_trait]
pub trait PipelineTask: Send + Sync {
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`PipelineTask`]
pub struct FnTask<F> {
    body: F,
}

impl<F, Fut> FnTask<F>
where
    F: Fn(Arc<PipelineContext>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

#[async_trait]
impl<F, Fut> PipelineTask for FnTask<F>
where
    F: Fn(Arc<PipelineContext>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn execute(&self, context: Arc<PipelineContext>) -> anyhow::Result<Value> {
        (self.body)(context).await
    }
}

/// Shorthand for `Arc::new(FnTask::new(body))`
pub fn task_fn<F, Fut>(body: F) -> Arc<dyn PipelineTask>
where
    F: Fn(Arc<PipelineContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnTask::new(body))
}
