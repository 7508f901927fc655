//! Shared state of one pipeline run.
//!
//! Every key is written at most once. Task outputs are written by the
//! pipeline after a task succeeds, under that task's id, so one task can read
//! what its dependencies produced but can never overwrite it.

use super::types::TriggerCondition;
use crate::error::{ModelOpsError, Result};
use crate::registry::SharedArtifact;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct PipelineContext {
    run_id: String,
    pipeline_id: String,
    model_name: String,
    trigger: TriggerCondition,
    started_at: DateTime<Utc>,
    outputs: RwLock<BTreeMap<String, Value>>,
    artifacts: RwLock<HashMap<String, SharedArtifact>>,
}

impl PipelineContext {
    pub fn new(
        run_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        model_name: impl Into<String>,
        trigger: TriggerCondition,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_id: pipeline_id.into(),
            model_name: model_name.into(),
            trigger,
            started_at: Utc::now(),
            outputs: RwLock::new(BTreeMap::new()),
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn trigger(&self) -> TriggerCondition {
        self.trigger
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Output a finished task produced, if it succeeded
    pub fn output(&self, task_id: &str) -> Option<Value> {
        self.outputs.read().get(task_id).cloned()
    }

    /// One field of a task's output
    pub fn output_field(&self, task_id: &str, field: &str) -> Option<Value> {
        self.outputs
            .read()
            .get(task_id)
            .and_then(|output| output.get(field))
            .cloned()
    }

    pub fn has_output(&self, task_id: &str) -> bool {
        self.outputs.read().contains_key(task_id)
    }

    pub(crate) fn insert_output(&self, task_id: &str, output: Value) -> Result<()> {
        let mut outputs = self.outputs.write();
        if outputs.contains_key(task_id) {
            return Err(ModelOpsError::Validation(format!(
                "output for task '{task_id}' was already written in run {}",
                self.run_id
            )));
        }
        outputs.insert(task_id.to_string(), output);
        Ok(())
    }

    /// Hand an artifact to downstream tasks under the producing task's id
    pub fn put_artifact(&self, task_id: &str, artifact: SharedArtifact) -> Result<()> {
        let mut artifacts = self.artifacts.write();
        if artifacts.contains_key(task_id) {
            return Err(ModelOpsError::Validation(format!(
                "artifact for task '{task_id}' was already written in run {}",
                self.run_id
            )));
        }
        artifacts.insert(task_id.to_string(), artifact);
        Ok(())
    }

    pub fn artifact(&self, task_id: &str) -> Option<SharedArtifact> {
        self.artifacts.read().get(task_id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.outputs.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outputs_are_write_once() {
        let context = PipelineContext::new("run-1", "p", "ranker", TriggerCondition::Manual);
        context.insert_output("collect", json!({"rows": 10})).unwrap();

        let err = context.insert_output("collect", json!({"rows": 0})).unwrap_err();
        assert!(matches!(err, ModelOpsError::Validation(_)));
        assert_eq!(context.output_field("collect", "rows"), Some(json!(10)));
        assert_eq!(context.output("train"), None);
    }
}
