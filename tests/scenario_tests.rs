//! End-to-end flows across registry, serving, experiments, monitoring and
//! the retraining pipeline.

mod common;

use common::{accuracy, fast_ab_testing, memory_registry, wait_until, ScriptedModel, StaticTrainer};
use modelops_core::config::{ConfigManager, ModelOpsConfig, MonitorConfig};
use modelops_core::events::names;
use modelops_core::monitoring::{Alert, AlertCondition, AlertMetric, AlertSeverity, ModelMonitor};
use modelops_core::pipeline::canonical::{PROMOTE_TO_PRODUCTION, RUN_AB_TEST};
use modelops_core::pipeline::{
    canonical_pipeline, spawn_triggers, task_fn, CanonicalSettings, PipelineConfig,
    PipelineContext, RetrainingPipeline, TaskConfig, TriggerCondition,
};
use modelops_core::registry::{ModelStage, SharedArtifact};
use modelops_core::resilience::BackoffPolicy;
use modelops_core::serving::ModelServer;
use modelops_core::store::MemoryStore;
use modelops_core::system::ModelOpsSystem;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn control_script(k: u64) -> bool {
    k % 20 < 17
}

fn treatment_script(k: u64) -> bool {
    k % 20 != 0
}

#[tokio::test]
async fn test_better_candidate_wins_experiment_and_is_promoted() {
    let registry = memory_registry();
    let control = Arc::new(ScriptedModel::new("control", control_script));
    let incumbent = registry
        .register(
            Arc::clone(&control) as SharedArtifact,
            "ranker",
            accuracy(0.91),
            Default::default(),
            None,
        )
        .await
        .unwrap();
    registry
        .promote("ranker", incumbent, ModelStage::Production)
        .await
        .unwrap();

    let ab = fast_ab_testing(&registry);
    let monitor = Arc::new(ModelMonitor::new(MonitorConfig::default()));
    let server = ModelServer::new(Arc::clone(&registry), Arc::clone(&ab), monitor);

    let treatment = Arc::new(ScriptedModel::new("treatment", treatment_script));
    let trainer = Arc::new(StaticTrainer::new(
        Arc::clone(&treatment) as SharedArtifact,
        0.95,
    ));
    let settings = CanonicalSettings {
        minimum_sample_size: 100,
        ab_poll_interval: Duration::from_millis(20),
        ab_max_wait: Duration::from_secs(30),
        ..CanonicalSettings::default()
    };
    let pipeline = Arc::new(
        canonical_pipeline(
            PipelineConfig {
                schedule_interval: None,
                ..PipelineConfig::new("ranker")
            },
            Arc::clone(&registry),
            Arc::clone(&ab),
            trainer,
            settings,
            BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(10), 0.0),
        )
        .unwrap(),
    );

    let runner = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run(TriggerCondition::ModelFeedback).await })
    };

    let mut experiment = None;
    for _ in 0..1_000 {
        if let Some(active) = ab.active_experiment("ranker").await.unwrap() {
            experiment = Some(active);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let experiment = experiment.expect("pipeline never started an experiment");
    assert_eq!(experiment.variants.len(), 2);

    let mut user = 0u64;
    while (control.served() < 100 || treatment.served() < 100) && user < 20_000 {
        let identifier = format!("user-{user}");
        // failures are part of the script
        let _ = server
            .predict_for("ranker", &json!({"x": user}), Some(&identifier), None)
            .await;
        user += 1;
    }
    assert!(control.served() >= 100 && treatment.served() >= 100);

    let outcome = tokio::time::timeout(Duration::from_secs(20), runner)
        .await
        .expect("pipeline run did not finish")
        .unwrap();
    let run = outcome.run().unwrap();
    assert!(run.success, "run failed: {:?}", run.error);
    assert_eq!(run.outputs[RUN_AB_TEST]["winner"], json!("treatment"));
    assert_eq!(run.outputs[PROMOTE_TO_PRODUCTION]["promoted"], json!(true));
    assert_eq!(
        run.outputs[PROMOTE_TO_PRODUCTION]["archived_version"],
        json!(incumbent)
    );

    let production = registry.current_production("ranker").await.unwrap().unwrap();
    assert_eq!(production.version, 2);
    let old = registry.get_version("ranker", incumbent).await.unwrap();
    assert_eq!(old.stage, ModelStage::Archived);

    let results = ab
        .get_experiment_results(&experiment.experiment_id)
        .await
        .unwrap();
    let per_variant: u64 = results.variants.iter().map(|v| v.sample_size).sum();
    assert_eq!(per_variant, results.total_samples);
    assert!(results.variant("treatment").unwrap().success_rate > 0.9);
}

#[tokio::test]
async fn test_persistent_degradation_triggers_a_single_run() {
    let registry = memory_registry();
    let flaky = ScriptedModel::new("flaky", |_| false);
    let version = registry
        .register_owned(flaky, "ranker", accuracy(0.9))
        .await
        .unwrap();
    registry
        .promote("ranker", version, ModelStage::Production)
        .await
        .unwrap();

    let monitor = Arc::new(ModelMonitor::new(MonitorConfig::default()));
    monitor
        .add_alert(
            Alert::new(
                "low_success_rate",
                AlertMetric::SuccessRate,
                AlertCondition::LessThan,
                0.9,
                300,
                AlertSeverity::Critical,
            )
            .for_model("ranker"),
        )
        .unwrap();
    for _ in 0..100 {
        monitor.record_prediction("ranker", version, 15.0, false, None, None);
    }

    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let pipeline = RetrainingPipeline::new(PipelineConfig {
        schedule_interval: None,
        ..PipelineConfig::new("ranker")
    });
    pipeline
        .add_task(
            TaskConfig::new("retrain"),
            task_fn(move |ctx: Arc<PipelineContext>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(json!({ "trigger": ctx.trigger() }))
                }
            }),
        )
        .unwrap();
    let pipeline = Arc::new(pipeline);

    let handle = spawn_triggers(
        Arc::clone(&pipeline),
        Arc::clone(&monitor),
        Arc::clone(&registry),
        Duration::from_millis(10),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || pipeline.history().len() == 1).await);
    // the condition persists across many more polls
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let history = pipeline.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].trigger, TriggerCondition::PerformanceDegradation);
    assert_eq!(
        history[0].outputs["retrain"],
        json!({ "trigger": "performance_degradation" })
    );
}

#[tokio::test]
async fn test_system_runs_registered_pipeline_and_publishes_completion() {
    let manager = ConfigManager::from_config(ModelOpsConfig::default(), "test").unwrap();
    let system = ModelOpsSystem::bootstrap_with(manager, Arc::new(MemoryStore::new()), None)
        .await
        .unwrap();
    let mut events = system.events().subscribe();

    let candidate: SharedArtifact = Arc::new(ScriptedModel::new("candidate", |_| true));
    let trainer = Arc::new(StaticTrainer::new(candidate, 0.96));
    let pipeline = system
        .register_canonical_pipeline(
            "ranker",
            trainer,
            CanonicalSettings {
                ab_poll_interval: Duration::from_millis(10),
                ab_max_wait: Duration::from_millis(100),
                ..CanonicalSettings::default()
            },
        )
        .unwrap();

    let outcome = pipeline.run(TriggerCondition::Manual).await;
    assert!(outcome.run().unwrap().success);

    let prediction = system
        .server()
        .predict("ranker", &json!({"x": 1}), Some("req-1"))
        .await
        .unwrap();
    assert_eq!(prediction.version, 1);
    assert_eq!(prediction.output, json!({"served_by": "candidate"}));

    let status = system.model_status("ranker").await.unwrap();
    assert_eq!(status.production.map(|v| v.version), Some(1));
    let pipeline_status = status.pipeline.unwrap();
    assert_eq!(pipeline_status.total_runs, 1);
    assert!(pipeline_status.last_run.is_some_and(|run| run.success));

    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        if event.name == names::PIPELINE_COMPLETED {
            completed = Some(event.context);
        }
    }
    let completed: Value = completed.expect("no completion event");
    assert_eq!(completed["status"], json!("SUCCESS"));
    assert_eq!(completed["model_name"], json!("ranker"));

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_manually_triggered_run() {
    let manager = ConfigManager::from_config(ModelOpsConfig::default(), "test").unwrap();
    let system = ModelOpsSystem::bootstrap_with(manager, Arc::new(MemoryStore::new()), None)
        .await
        .unwrap();

    let pipeline = RetrainingPipeline::new(PipelineConfig {
        schedule_interval: None,
        ..PipelineConfig::new("ranker")
    });
    pipeline
        .add_task(
            TaskConfig::new("retrain"),
            task_fn(|_ctx| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, anyhow::Error>(json!({ "retrained": true }))
            }),
        )
        .unwrap();
    let pipeline = system.register_pipeline(pipeline).unwrap();

    system
        .trigger_pipeline("ranker", TriggerCondition::Manual)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || pipeline.is_running()).await);

    system.shutdown().await.unwrap();
    assert!(!pipeline.is_running());
    let history = pipeline.history();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].outputs["retrain"], json!({ "retrained": true }));

    assert!(system
        .trigger_pipeline("ranker", TriggerCondition::Manual)
        .is_err());
}
