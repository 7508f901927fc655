mod common;

use common::{accuracy, memory_registry, LinearLoader, LinearModel};
use modelops_core::error::ModelOpsError;
use modelops_core::events::{names, EventPublisher};
use modelops_core::registry::{ModelRegistry, ModelStage, ModelTags};
use modelops_core::store::SqliteStore;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_concurrent_promotions_leave_one_production_version() {
    let registry = memory_registry();
    let mut versions = Vec::new();
    for i in 0..8 {
        versions.push(
            registry
                .register_owned(LinearModel::new(1.0, i as f64), "ranker", accuracy(0.9))
                .await
                .unwrap(),
        );
    }

    let handles: Vec<_> = versions
        .iter()
        .map(|&version| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .promote("ranker", version, ModelStage::Production)
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let all = registry.list_versions("ranker").await.unwrap();
    let production: Vec<_> = all.iter().filter(|v| v.is_production()).collect();
    assert_eq!(production.len(), 1);

    let archived = all
        .iter()
        .filter(|v| v.stage == ModelStage::Archived)
        .count();
    assert_eq!(archived, versions.len() - 1);
}

#[tokio::test]
async fn test_promotion_lifecycle_and_events() {
    let events = EventPublisher::new(64);
    let mut subscriber = events.subscribe();
    let registry = ModelRegistry::new(Arc::new(modelops_core::store::MemoryStore::new()))
        .with_events(events.clone());

    let v1 = registry
        .register_owned(LinearModel::new(1.0, 0.0), "ranker", accuracy(0.88))
        .await
        .unwrap();
    let v2 = registry
        .register(
            Arc::new(LinearModel::new(2.0, 0.0)),
            "ranker",
            accuracy(0.93),
            ModelTags::from([("team".to_string(), "search".to_string())]),
            Some("wider features".to_string()),
        )
        .await
        .unwrap();
    assert_eq!((v1, v2), (1, 2));

    registry
        .promote("ranker", v1, ModelStage::Production)
        .await
        .unwrap();
    let outcome = registry
        .promote("ranker", v2, ModelStage::Production)
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.archived, Some(v1));

    // idempotent
    let again = registry
        .promote("ranker", v2, ModelStage::Production)
        .await
        .unwrap();
    assert!(!again.changed);
    assert_eq!(again.archived, None);

    let production = registry.get("ranker", ModelStage::Production).await.unwrap();
    assert_eq!(production.predict(&json!({"x": 3.0})).unwrap(), json!(6.0));

    let lineage = registry.lineage("ranker", v2).await.unwrap();
    assert_eq!(lineage.previous_version, Some(v1));
    assert!((lineage.metric_changes["accuracy"] - 0.05).abs() < 1e-9);

    let comparison = registry.compare_versions("ranker", v1, v2).await.unwrap();
    assert_eq!(comparison.stage1, ModelStage::Archived);
    assert_eq!(comparison.stage2, ModelStage::Production);

    let mut seen = Vec::new();
    while let Ok(event) = subscriber.try_recv() {
        seen.push(event.name);
    }
    assert_eq!(
        seen.iter().filter(|n| n.as_str() == names::MODEL_REGISTERED).count(),
        2
    );
    assert_eq!(
        seen.iter().filter(|n| n.as_str() == names::MODEL_PROMOTED).count(),
        2
    );
}

#[tokio::test]
async fn test_unknown_versions_are_not_found() {
    let registry = memory_registry();
    registry
        .register_owned(LinearModel::new(1.0, 0.0), "ranker", accuracy(0.9))
        .await
        .unwrap();

    assert!(matches!(
        registry.promote("ranker", 7, ModelStage::Staging).await,
        Err(ModelOpsError::NotFound(_))
    ));
    assert!(matches!(
        registry.get("ranker", ModelStage::Production).await,
        Err(ModelOpsError::NotFound(_))
    ));
    assert!(matches!(
        registry.get_version("classifier", 1).await,
        Err(ModelOpsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_sqlite_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("registry.db").display()
    );

    {
        let store = SqliteStore::connect(&url, 2).await.unwrap();
        let registry = ModelRegistry::new(Arc::new(store));
        let v1 = registry
            .register_owned(LinearModel::new(3.0, 1.0), "ranker", accuracy(0.91))
            .await
            .unwrap();
        registry
            .promote("ranker", v1, ModelStage::Production)
            .await
            .unwrap();
    }

    let store = SqliteStore::connect(&url, 2).await.unwrap();
    let registry = ModelRegistry::new(Arc::new(store)).with_loader(Arc::new(LinearLoader));

    let production = registry.current_production("ranker").await.unwrap().unwrap();
    assert_eq!(production.version, 1);
    assert_eq!(production.metrics["accuracy"], 0.91);

    // artifact is decoded from the stored payload on first access
    let artifact = registry.get("ranker", 1).await.unwrap();
    assert_eq!(artifact.predict(&json!({"x": 2.0})).unwrap(), json!(7.0));

    let v2 = registry
        .register_owned(LinearModel::new(1.0, 0.0), "ranker", accuracy(0.94))
        .await
        .unwrap();
    assert_eq!(v2, 2);
}

#[tokio::test]
async fn test_sqlite_without_loader_reports_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("registry.db").display()
    );

    {
        let registry = ModelRegistry::new(Arc::new(SqliteStore::connect(&url, 1).await.unwrap()));
        registry
            .register_owned(LinearModel::new(1.0, 0.0), "ranker", accuracy(0.9))
            .await
            .unwrap();
    }

    let registry = ModelRegistry::new(Arc::new(SqliteStore::connect(&url, 1).await.unwrap()));
    assert!(matches!(
        registry.get("ranker", 1).await,
        Err(ModelOpsError::Configuration(_))
    ));
}
