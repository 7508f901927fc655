mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{accuracy, fast_ab_testing, memory_registry, LinearModel, ScriptedModel};
use modelops_core::clock::ManualClock;
use modelops_core::config::MonitorConfig;
use modelops_core::events::{names, EventPublisher};
use modelops_core::monitoring::{
    Alert, AlertCondition, AlertMetric, AlertSeverity, DriftRecommendation, FeatureBaseline,
    FeatureVector, HealthStatus, ModelMonitor,
};
use modelops_core::registry::ModelStage;
use modelops_core::serving::ModelServer;
use serde_json::json;
use std::sync::Arc;

fn manual_monitor() -> (Arc<ModelMonitor>, ManualClock, EventPublisher) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap());
    let events = EventPublisher::new(256);
    let monitor = Arc::new(ModelMonitor::with_parts(
        MonitorConfig::default(),
        events.clone(),
        Arc::new(clock.clone()),
    ));
    (monitor, clock, events)
}

fn success_rate_alert() -> Alert {
    Alert::new(
        "low_success_rate",
        AlertMetric::SuccessRate,
        AlertCondition::LessThan,
        0.9,
        300,
        AlertSeverity::Critical,
    )
    .for_model("ranker")
}

#[tokio::test]
async fn test_alert_lifecycle_publishes_events() {
    let (monitor, clock, events) = manual_monitor();
    let mut subscriber = events.subscribe();
    monitor.add_alert(success_rate_alert()).unwrap();

    for i in 0..100 {
        monitor.record_prediction("ranker", 1, 20.0, i % 5 != 0, None, None);
    }

    let firing = monitor.check_alerts();
    assert_eq!(firing.len(), 1);
    assert_eq!(firing[0].alert_name, "low_success_rate");
    assert!((firing[0].value - 0.8).abs() < 1e-9);
    assert_eq!(
        monitor.get_model_dashboard("ranker", 1).health_status,
        HealthStatus::Critical
    );

    // still firing: no second event
    assert_eq!(monitor.check_alerts().len(), 1);

    // window slides past the bad traffic
    clock.advance(Duration::seconds(400));
    for _ in 0..20 {
        monitor.record_prediction("ranker", 1, 20.0, true, None, None);
    }
    assert!(monitor.check_alerts().is_empty());
    assert_eq!(
        monitor.get_model_dashboard("ranker", 1).health_status,
        HealthStatus::Healthy
    );

    let mut names_seen = Vec::new();
    while let Ok(event) = subscriber.try_recv() {
        names_seen.push(event.name);
    }
    assert_eq!(names_seen, vec![names::ALERT_FIRED, names::ALERT_CLEARED]);
}

#[tokio::test]
async fn test_alerts_are_scoped_per_version() {
    let (monitor, _clock, _events) = manual_monitor();
    monitor.add_alert(success_rate_alert()).unwrap();

    for i in 0..50 {
        monitor.record_prediction("ranker", 1, 10.0, true, None, None);
        monitor.record_prediction("ranker", 2, 10.0, i % 2 == 0, None, None);
        monitor.record_prediction("classifier", 1, 10.0, false, None, None);
    }

    let firing = monitor.check_alerts();
    assert_eq!(firing.len(), 1);
    assert_eq!((firing[0].model_name.as_str(), firing[0].version), ("ranker", 2));
    assert!(monitor.alerts_for("ranker", 1).is_empty());
}

#[tokio::test]
async fn test_served_traffic_feeds_dashboard_and_drift() {
    let registry = memory_registry();
    let version = registry
        .register_owned(LinearModel::new(2.0, 0.0), "ranker", accuracy(0.93))
        .await
        .unwrap();
    registry
        .promote("ranker", version, ModelStage::Production)
        .await
        .unwrap();
    let ab = fast_ab_testing(&registry);
    let monitor = Arc::new(ModelMonitor::new(MonitorConfig::default()));
    let server = ModelServer::new(Arc::clone(&registry), ab, Arc::clone(&monitor));

    let training: Vec<FeatureVector> = (0..500)
        .map(|i| FeatureVector::from([("x".to_string(), f64::from(i % 100))]))
        .collect();
    monitor.set_baseline(
        "ranker",
        version,
        FeatureBaseline::from_samples(&training, 10).unwrap(),
    );

    for i in 0..40 {
        server
            .predict("ranker", &json!({"x": i % 100}), None)
            .await
            .unwrap();
    }
    let early = monitor.drift_report("ranker", version);
    assert_eq!(early.recommendation, DriftRecommendation::InsufficientData);

    for i in 0..200 {
        server
            .predict("ranker", &json!({"x": 500 + i % 100}), None)
            .await
            .unwrap();
    }
    // requests without the feature are still served and counted
    assert!(server.predict("ranker", &json!({"y": 1}), None).await.is_err());

    let dashboard = monitor.get_model_dashboard("ranker", version);
    assert_eq!(dashboard.statistics.total_requests, 241);
    assert_eq!(dashboard.statistics.error_count, 1);
    assert!(dashboard.drift.has_drift);
    assert_eq!(dashboard.drift.recommendation, DriftRecommendation::Retrain);
    assert!(dashboard.statistics.latency_p50.is_some());
}

#[tokio::test]
async fn test_failed_predictions_degrade_health() {
    let registry = memory_registry();
    let flaky = ScriptedModel::new("flaky", |k| k % 4 != 0);
    let version = registry
        .register_owned(flaky, "ranker", accuracy(0.9))
        .await
        .unwrap();
    registry
        .promote("ranker", version, ModelStage::Production)
        .await
        .unwrap();

    let monitor = Arc::new(ModelMonitor::new(MonitorConfig::default()));
    monitor.add_alert(success_rate_alert()).unwrap();
    let server = ModelServer::new(
        Arc::clone(&registry),
        fast_ab_testing(&registry),
        Arc::clone(&monitor),
    );

    let mut failures = 0;
    for i in 0..100 {
        let request_id = format!("req-{i}");
        if server
            .predict("ranker", &json!({"x": i}), Some(&request_id))
            .await
            .is_err()
        {
            failures += 1;
        }
    }
    assert_eq!(failures, 25);
    assert_eq!(server.requests_served(), 100);

    let dashboard = monitor.get_model_dashboard("ranker", version);
    assert_eq!(dashboard.health_status, HealthStatus::Critical);
    assert_eq!(dashboard.active_alerts.len(), 1);
}
