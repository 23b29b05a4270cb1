//! RuleManager - drives rule group evaluation
//!
//! Every rule group runs in its own task and evaluates its rules at the group
//! interval. Groups created before [`RuleManager::run`] wait until the manager
//! is started, so the first evaluation never precedes the complete startup.
//!
//! On [`RuleManager::update`] all files are parsed first. A parse error rejects
//! the whole update and the running groups stay untouched. Otherwise the old
//! groups are stopped, their alert state is handed to the new groups with the
//! same `file;name` key and the new groups are started.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use metrics::gauge;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::export::SampleAppender;
use super::supervisor::Actor;
use crate::alerts::AlertSender;
use crate::query::MetricsSource;
use crate::rules::{self, EvalContext, RuleGroup};
use crate::{Labels, telemetry};

/// Minimum delay between two notifications of the same alert
pub const DEFAULT_RESEND_DELAY: Duration = Duration::from_secs(60);

struct GroupHandle {
    token: CancellationToken,
    task: JoinHandle<RuleGroup>,
}

pub struct RuleManager {
    source: Arc<dyn MetricsSource>,
    appender: Arc<dyn SampleAppender>,
    sender: AlertSender,
    resend_delay: Duration,
    groups: Mutex<HashMap<String, GroupHandle>>,
    started: watch::Sender<bool>,
    token: CancellationToken,
}

impl RuleManager {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        appender: Arc<dyn SampleAppender>,
        sender: AlertSender,
    ) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            source,
            appender,
            sender,
            resend_delay: DEFAULT_RESEND_DELAY,
            groups: Mutex::new(HashMap::new()),
            started,
            token: CancellationToken::new(),
        }
    }

    pub fn with_resend_delay(mut self, resend_delay: Duration) -> Self {
        self.resend_delay = resend_delay;
        self
    }

    /// Keys (`file;name`) of the running groups, sorted
    pub async fn group_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.groups.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Replaces the running groups with the groups of `files`
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn update(
        &self,
        interval: Duration,
        files: &[PathBuf],
        external_labels: Labels,
    ) -> Result<(), rules::RuleError> {
        let new_groups = rules::load_groups(files, interval)?;

        let mut groups = self.groups.lock().await;

        let old = std::mem::take(&mut *groups);
        for handle in old.values() {
            handle.token.cancel();
        }

        // stop all groups at once, so the update waits for the slowest evaluation only
        let stopped = join_all(
            old.into_iter()
                .map(|(key, handle)| async move { (key, handle.task.await) }),
        )
        .await;

        let mut previous = HashMap::with_capacity(stopped.len());
        for (key, result) in stopped {
            match result {
                Ok(group) => {
                    previous.insert(key, group);
                }
                Err(e) => warn!(group = %key, "rule group task failed: {e}"),
            }
        }

        let external_labels = Arc::new(external_labels);
        for mut group in new_groups {
            let key = group.key();
            if let Some(old_group) = previous.get_mut(&key) {
                group.copy_state(old_group);
            }

            let token = self.token.child_token();
            let task = tokio::spawn(
                run_group(
                    group,
                    GroupDeps {
                        source: Arc::clone(&self.source),
                        appender: Arc::clone(&self.appender),
                        sender: self.sender.clone(),
                        external_labels: Arc::clone(&external_labels),
                        resend_delay: self.resend_delay,
                    },
                    self.started.subscribe(),
                    token.clone(),
                )
                .instrument(info_span!("rule_group", group = %key)),
            );
            groups.insert(key, GroupHandle { token, task });
        }

        gauge!(telemetry::RULE_GROUPS).set(groups.len() as f64);
        info!(groups = groups.len(), "rule groups updated");
        Ok(())
    }

    /// Releases group evaluation and blocks until stopped
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("starting rule manager");
        self.started.send_replace(true);
        self.token.cancelled().await;

        let handles: Vec<_> = self.groups.lock().await.drain().collect();
        for (key, handle) in handles {
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                warn!(group = %key, "rule group task failed: {e}");
            }
        }

        info!("rule manager stopped");
        Ok(())
    }

    /// Stops all groups and makes `run` return
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wraps the manager into a supervised actor
    pub fn actor(self: Arc<Self>) -> Actor {
        let manager = Arc::clone(&self);
        Actor::new(
            "rules",
            async move { manager.run().await },
            move |_| self.stop(),
        )
    }
}

struct GroupDeps {
    source: Arc<dyn MetricsSource>,
    appender: Arc<dyn SampleAppender>,
    sender: AlertSender,
    external_labels: Arc<Labels>,
    resend_delay: Duration,
}

/// Evaluation loop of one group, hands the group back once cancelled
async fn run_group(
    mut group: RuleGroup,
    deps: GroupDeps,
    mut started: watch::Receiver<bool>,
    token: CancellationToken,
) -> RuleGroup {
    let released = async { started.wait_for(|started| *started).await.is_ok() };
    tokio::select! {
        _ = token.cancelled() => return group,
        released = released => {
            if !released {
                return group;
            }
        }
    }

    debug!(interval = ?group.interval(), "starting rule group");
    let mut ticker = time::interval(group.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let ctx = EvalContext {
                    source: deps.source.as_ref(),
                    appender: deps.appender.as_ref(),
                    sender: &deps.sender,
                    external_labels: &deps.external_labels,
                    resend_delay: deps.resend_delay,
                };
                group.eval(Utc::now(), &ctx).await;
            }
        }
    }

    debug!("rule group stopped");
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;
    use crate::alerts::{AlertSink, NotificationAlert};
    use crate::query::{InstantSample, QueryResponse, QueryResult, QueryResultOf};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    /// Backend answering every query with a single `instance="a:1"` sample
    struct FakeSource {
        queries: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        async fn query(&self, expr: &str, at: DateTime<Utc>) -> QueryResultOf<QueryResponse> {
            self.queries.lock().unwrap().push(expr.to_string());
            Ok(QueryResponse {
                result: QueryResult::Vector(vec![InstantSample {
                    metric: BTreeMap::from([("instance".to_string(), "a:1".to_string())]),
                    timestamp: at.timestamp_millis(),
                    value: 1.0,
                }]),
                warnings: vec![],
            })
        }
    }

    #[derive(Default)]
    struct Collected {
        samples: StdMutex<Vec<Sample>>,
        alerts: StdMutex<Vec<NotificationAlert>>,
    }

    #[async_trait]
    impl SampleAppender for Collected {
        async fn append(&self, samples: Vec<Sample>) -> anyhow::Result<()> {
            self.samples.lock().unwrap().extend(samples);
            Ok(())
        }
    }

    impl AlertSink for Collected {
        fn send(&self, alerts: Vec<NotificationAlert>) {
            self.alerts.lock().unwrap().extend(alerts);
        }
    }

    fn manager() -> (Arc<RuleManager>, Arc<FakeSource>, Arc<Collected>) {
        let source = Arc::new(FakeSource {
            queries: StdMutex::new(vec![]),
        });
        let collected = Arc::new(Collected::default());
        let manager = RuleManager::new(
            source.clone(),
            collected.clone(),
            AlertSender::new(collected.clone(), "http://rule-evaluator"),
        );
        (Arc::new(manager), source, collected)
    }

    fn write_rules(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const RULES: &str = r#"
        [[groups]]
        name = "api"

        [[groups.rules]]
        record = "instance:up"
        expr = "up"

        [[groups.rules]]
        alert = "Up"
        expr = "up == 1"
    "#;

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_groups_wait_for_start() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_rules(&dir, "rules.toml", RULES);
        let (manager, source, collected) = manager();

        manager
            .update(Duration::from_secs(60), &[file], Labels::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(source.queries.lock().unwrap().is_empty());

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        wait_until(|| !collected.alerts.lock().unwrap().is_empty()).await;

        let samples = collected.samples.lock().unwrap().clone();
        assert_eq!(samples[0].metric.get("__name__"), Some("instance:up"));
        let alerts = collected.alerts.lock().unwrap().clone();
        assert_eq!(alerts[0].labels.get("alertname"), Some("Up"));
        assert!(alerts[0].generator_url.starts_with("http://rule-evaluator/graph?g0.expr="));

        manager.stop();
        task.await.unwrap().unwrap();
        assert!(manager.group_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_parse_error_keeps_running_groups() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_rules(&dir, "good.toml", RULES);
        let bad = write_rules(&dir, "bad.toml", "[[groups]]\nname = 1\n");
        let (manager, _source, _collected) = manager();

        manager
            .update(Duration::from_secs(60), &[good.clone()], Labels::new())
            .await
            .unwrap();
        let before = manager.group_keys().await;

        let err = manager
            .update(Duration::from_secs(60), &[good, bad], Labels::new())
            .await
            .unwrap_err();
        assert!(matches!(err, rules::RuleError::Parse { .. }));
        assert_eq!(manager.group_keys().await, before);
    }

    #[tokio::test]
    async fn test_update_replaces_groups() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_rules(&dir, "first.toml", RULES);
        let second = write_rules(&dir, "second.toml", "[[groups]]\nname = \"other\"\n");
        let (manager, _source, _collected) = manager();

        manager
            .update(Duration::from_secs(60), &[first.clone()], Labels::new())
            .await
            .unwrap();
        manager
            .update(Duration::from_secs(60), &[second.clone()], Labels::new())
            .await
            .unwrap();

        assert_eq!(
            manager.group_keys().await,
            vec![rules::group_key(&second, "other")]
        );
    }

    #[tokio::test]
    async fn test_alert_state_survives_update() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_rules(&dir, "rules.toml", RULES);
        let (manager, _source, collected) = manager();
        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });

        manager
            .update(Duration::from_secs(60), &[file.clone()], Labels::new())
            .await
            .unwrap();
        wait_until(|| collected.alerts.lock().unwrap().len() == 1).await;

        // the reloaded group evaluates at once but must not resend within the delay
        manager
            .update(Duration::from_secs(60), &[file], Labels::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(collected.alerts.lock().unwrap().len(), 1);

        manager.stop();
        task.await.unwrap().unwrap();
    }

    /// Backend taking `delay` per query, recording every expression
    struct SlowSource {
        delay: Duration,
        queries: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricsSource for SlowSource {
        async fn query(&self, expr: &str, _at: DateTime<Utc>) -> QueryResultOf<QueryResponse> {
            self.queries.lock().unwrap().push(expr.to_string());
            tokio::time::sleep(self.delay).await;
            Ok(QueryResponse {
                result: QueryResult::Vector(vec![]),
                warnings: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_update_stops_old_groups_together() {
        let dir = tempfile::tempdir().unwrap();
        let old_rules = (0..3)
            .map(|i| format!("[[groups]]\nname = \"g{i}\"\n\n[[groups.rules]]\nrecord = \"r{i}\"\nexpr = \"old\"\n"))
            .collect::<String>();
        let old = write_rules(&dir, "old.toml", &old_rules);
        let new = write_rules(
            &dir,
            "new.toml",
            "[[groups]]\nname = \"n\"\n\n[[groups.rules]]\nrecord = \"n\"\nexpr = \"new\"\n",
        );

        // evaluations outlast the interval, so an uncancelled group starts over at once
        let source = Arc::new(SlowSource {
            delay: Duration::from_millis(1200),
            queries: StdMutex::new(vec![]),
        });
        let collected = Arc::new(Collected::default());
        let manager = Arc::new(RuleManager::new(
            source.clone(),
            collected.clone(),
            AlertSender::new(collected.clone(), "http://rule-evaluator"),
        ));
        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });

        manager
            .update(Duration::from_secs(1), &[old], Labels::new())
            .await
            .unwrap();
        wait_until(|| source.queries.lock().unwrap().len() == 3).await;

        manager
            .update(Duration::from_secs(1), &[new], Labels::new())
            .await
            .unwrap();

        let old_queries = source
            .queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.as_str() == "old")
            .count();
        assert_eq!(old_queries, 3);

        manager.stop();
        task.await.unwrap().unwrap();
    }
}
