//! Rule evaluation through delivery, against mocked backend and alertmanager

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rule_evaluator::actors::discovery::DiscoveryManager;
use rule_evaluator::actors::notifier::{NotificationManager, NotifierOptions};
use rule_evaluator::actors::rules::RuleManager;
use rule_evaluator::actors::{ActorSupervisor, reload_targets};
use rule_evaluator::alerts::{AlertSender, NotificationAlert};
use rule_evaluator::query::http::PrometheusClient;
use rule_evaluator::reload::ReloadCoordinator;
use tokio_test::assert_ok;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::helpers::*;

const RULES: &str = r#"
[[groups]]
name = "api"

[[groups.rules]]
record = "job:up:sum"
expr = "sum by (job) (up)"

[[groups.rules]]
alert = "InstanceDown"
expr = "up == 0"
labels = { severity = "page" }
annotations = { summary = "{{ $labels.instance }} of {{ $labels.job }} is down" }
"#;

async fn mock_backend() -> MockServer {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .and(query_param("query", "sum by (job) (up)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{"metric": {"job": "api"}, "value": [1700000000, "3"]}]
            }
        })))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .and(query_param("query", "up == 0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{
                    "metric": {"__name__": "up", "job": "api", "instance": "a:1"},
                    "value": [1700000000, "0"]
                }]
            }
        })))
        .mount(&backend)
        .await;
    backend
}

fn received_alerts(requests: &[Request]) -> Vec<NotificationAlert> {
    requests
        .iter()
        .flat_map(|r| serde_json::from_slice::<Vec<NotificationAlert>>(&r.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_rules_evaluated_and_alerts_delivered() {
    let backend = mock_backend().await;
    let alertmanager = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&alertmanager)
        .await;

    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "rules/api.toml", RULES);
    let rule_glob = dir.path().join("rules").join("*.toml").display().to_string();
    let am_addr = alertmanager.address().to_string();
    let config = write_file(dir.path(), "config.toml", &config_toml(&am_addr, &[rule_glob]));

    let discovery = Arc::new(DiscoveryManager::new("notify"));
    let notifier = Arc::new(NotificationManager::new(NotifierOptions::default()).unwrap());
    let recorder = Arc::new(Recorder::default());
    let rules = Arc::new(RuleManager::new(
        Arc::new(PrometheusClient::new(&backend.uri()).unwrap()),
        recorder.clone(),
        AlertSender::new(notifier.clone(), backend.uri()),
    ));
    let coordinator = ReloadCoordinator::new(
        &config,
        reload_targets(notifier.clone(), discovery.clone(), rules.clone()),
    );
    let report = assert_ok!(coordinator.reload().await);
    let names: Vec<_> = report.timings.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["notify", "notify_sd", "rules"]);

    let sync_rx = discovery.sync_channel();
    let supervisor = ActorSupervisor::new()
        .with(notifier.clone().actor(sync_rx))
        .with(discovery.clone().actor());
    let delivery = tokio::spawn(supervisor.run());

    // alerts sent before discovery completes would be dropped
    wait_until(|| notifier.alertmanagers().len() == 1).await;
    let evaluation = tokio::spawn({
        let rules = rules.clone();
        async move { rules.run().await }
    });

    wait_until(|| !recorder.samples.lock().unwrap().is_empty()).await;
    let sample = recorder.samples.lock().unwrap()[0].clone();
    assert_eq!(sample.metric.get("__name__"), Some("job:up:sum"));
    assert_eq!(sample.metric.get("job"), Some("api"));
    assert_eq!(sample.metric.get("cluster"), Some("test"));
    assert_eq!(sample.value, 3.0);

    let mut delivered = vec![];
    for _ in 0..200 {
        delivered = received_alerts(&alertmanager.received_requests().await.unwrap_or_default());
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let alert = delivered.first().expect("alert was not delivered");
    assert_eq!(alert.labels.get("alertname"), Some("InstanceDown"));
    assert_eq!(alert.labels.get("severity"), Some("page"));
    assert_eq!(alert.labels.get("cluster"), Some("test"));
    assert_eq!(alert.annotations.get("summary"), Some("a:1 of api is down"));
    assert!(alert.generator_url.starts_with(&backend.uri()));
    assert!(alert.ends_at > alert.starts_at);

    rules.stop();
    assert_ok!(evaluation.await.unwrap());
    notifier.stop();
    assert_ok!(delivery.await.unwrap());
}
