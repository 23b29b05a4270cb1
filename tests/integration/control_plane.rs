//! HTTP control plane served under the supervisor

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use pretty_assertions::assert_eq;
use rule_evaluator::actors::ActorSupervisor;
use rule_evaluator::actors::reload::ReloadListener;
use rule_evaluator::actors::signals::termination_actor_with;
use rule_evaluator::api::{ApiState, ControlPlane};
use rule_evaluator::query::http::PrometheusClient;
use rule_evaluator::reload::ReloadCoordinator;
use tokio::sync::oneshot;
use tokio_test::assert_ok;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn vector_one() -> serde_json::Value {
    serde_json::json!({
        "status": "success",
        "data": {
            "resultType": "vector",
            "result": [{"metric": {}, "value": [1700000000, "1"]}]
        }
    })
}

#[tokio::test]
async fn test_control_plane_endpoints() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend starting"))
        .up_to_n_times(1)
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vector_one()))
        .mount(&backend)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_file(dir.path(), "config.toml", "");
    let (listener, reload) = ReloadListener::new(ReloadCoordinator::new(&config, vec![]));
    let source = Arc::new(PrometheusClient::new(&backend.uri()).unwrap());
    let state = ApiState::new(reload, source, PrometheusBuilder::new().build_recorder().handle());

    let plane = ControlPlane::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let base = format!("http://{}", plane.local_addr());
    let (hangup_tx, hangup_rx) = hangups();
    let (term_tx, term_rx) = oneshot::channel::<()>();

    let supervisor = tokio::spawn(
        ActorSupervisor::new()
            .with(termination_actor_with(async move {
                let _ = term_rx.await;
            }))
            .with(plane.actor(state))
            .with(listener.actor(hangup_rx))
            .run(),
    );
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/-/healthy")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // readiness follows the backend
    let response = client.get(format!("{base}/-/ready")).send().await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "Prometheus is not Ready.\n");

    let response = client.get(format!("{base}/-/ready")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Prometheus is Ready.\n");

    let response = client.post(format!("{base}/-/reload")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let response = client.put(format!("{base}/-/reload")).send().await.unwrap();
    assert_eq!(response.status(), 405);
    assert_eq!(response.text().await.unwrap(), "Only POST requests allowed.\n");

    std::fs::write(&config, "rule_files = [").unwrap();
    let response = client.post(format!("{base}/-/reload")).send().await.unwrap();
    assert_eq!(response.status(), 500);
    assert!(
        response
            .text()
            .await
            .unwrap()
            .starts_with("Failed to reload config: couldn't load configuration")
    );

    term_tx.send(()).unwrap();
    assert_ok!(supervisor.await.unwrap());
    drop(hangup_tx);
}
