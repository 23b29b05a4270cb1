//! Reload serialization and partial failure tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rule_evaluator::actors::discovery::DiscoveryManager;
use rule_evaluator::actors::notifier::{NotificationManager, NotifierOptions};
use rule_evaluator::actors::reload::ReloadListener;
use rule_evaluator::actors::rules::RuleManager;
use rule_evaluator::actors::signals::termination_actor_with;
use rule_evaluator::actors::{ActorSupervisor, reload_targets};
use rule_evaluator::alerts::AlertSender;
use rule_evaluator::query::http::PrometheusClient;
use rule_evaluator::reload::{ReloadCoordinator, ReloadError};
use tokio::sync::{Semaphore, oneshot};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

#[tokio::test]
async fn test_hangup_during_http_reload_runs_after_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "config.toml", "");
    let events = Arc::new(Mutex::new(vec![]));
    let gate = Arc::new(Semaphore::new(0));

    let coordinator = ReloadCoordinator::new(path, vec![gated_target(events.clone(), gate.clone())]);
    let (listener, handle) = ReloadListener::new(coordinator);
    let (hangup_tx, hangup_rx) = hangups();
    let token = CancellationToken::new();
    let task = tokio::spawn(listener.run(hangup_rx, token.clone()));

    let http = tokio::spawn(async move { handle.reload().await });
    wait_until(|| events.lock().unwrap().len() == 1).await;

    hangup_tx.unbounded_send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*events.lock().unwrap(), vec!["start"]);

    gate.add_permits(1);
    assert_ok!(http.await.unwrap());

    gate.add_permits(1);
    wait_until(|| events.lock().unwrap().len() == 4).await;
    assert_eq!(*events.lock().unwrap(), vec!["start", "end", "start", "end"]);

    token.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unmatched_rule_glob_fails_only_rules_target() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("rules").join("*.toml").display().to_string();
    let path = write_file(
        dir.path(),
        "config.toml",
        &config_toml("localhost:9093", &[missing]),
    );

    let discovery = Arc::new(DiscoveryManager::new("notify"));
    let notifier = Arc::new(NotificationManager::new(NotifierOptions::default()).unwrap());
    let source = Arc::new(PrometheusClient::new("http://localhost:9090").unwrap());
    let recorder = Arc::new(Recorder::default());
    let rules = Arc::new(RuleManager::new(
        source,
        recorder,
        AlertSender::new(notifier.clone(), "http://localhost:9090"),
    ));

    let coordinator = ReloadCoordinator::new(
        path,
        reload_targets(notifier.clone(), discovery.clone(), rules.clone()),
    );

    let err = assert_err!(coordinator.reload().await);
    assert_matches!(&err, ReloadError::Apply { .. });
    assert_eq!(err.failed_targets(), vec!["rules"]);
    assert!(err.to_string().contains("Error retrieving rule file"));

    // notify and notify_sd were applied: the static alertmanager is in use
    let sync_rx = discovery.sync_channel();
    let discovery_task = tokio::spawn({
        let discovery = discovery.clone();
        async move { discovery.run().await }
    });
    let notifier_task = tokio::spawn({
        let notifier = notifier.clone();
        async move { notifier.run(sync_rx).await }
    });

    wait_until(|| notifier.alertmanagers().len() == 1).await;
    let am = &notifier.alertmanagers()[0];
    assert_eq!(am.set, "config-0");
    assert_eq!(am.url.as_str(), "http://localhost:9093/api/v2/alerts");
    assert!(rules.group_keys().await.is_empty());

    discovery.cancel();
    notifier.stop();
    discovery_task.await.unwrap().unwrap();
    notifier_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_termination_waits_for_inflight_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "config.toml", "");
    let events = Arc::new(Mutex::new(vec![]));
    let gate = Arc::new(Semaphore::new(0));

    let coordinator = ReloadCoordinator::new(path, vec![gated_target(events.clone(), gate.clone())]);
    let (listener, handle) = ReloadListener::new(coordinator);
    let (_hangup_tx, hangup_rx) = hangups();
    let (term_tx, term_rx) = oneshot::channel::<()>();

    let supervisor = ActorSupervisor::new()
        .with(termination_actor_with(async move {
            let _ = term_rx.await;
        }))
        .with(listener.actor(hangup_rx));
    let supervisor = tokio::spawn(supervisor.run());

    let http = tokio::spawn(async move { handle.reload().await });
    wait_until(|| events.lock().unwrap().len() == 1).await;

    term_tx.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!supervisor.is_finished());

    gate.add_permits(1);
    assert_ok!(supervisor.await.unwrap());
    assert_ok!(http.await.unwrap());
    assert_eq!(*events.lock().unwrap(), vec!["start", "end"]);
}
