//! NotificationManager - delivers alerts to alertmanagers
//!
//! ## Message Flow
//!
//! ```text
//! AlertSender ──► send() ──► bounded queue ──► run() ──► POST api/v2/alerts
//!                                                ▲        (every alertmanager)
//!                         watch<TargetGroups> ───┘
//! ```
//!
//! The queue holds at most `queue_capacity` alerts. When it overflows, the
//! oldest alerts are dropped and counted. Batches of up to `max_batch_size`
//! alerts are sent concurrently to every discovered alertmanager, each request
//! bounded by the timeout of its alertmanager set.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use metrics::{counter, gauge};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use super::messages::TargetGroups;
use super::supervisor::Actor;
use crate::alerts::{AlertSink, NotificationAlert};
use crate::config::{Config, Scheme};
use crate::{Labels, telemetry};

const ALERTS_API_PATH: &str = "api/v2/alerts";

#[derive(Debug, Clone)]
pub struct NotifierOptions {
    pub queue_capacity: usize,
    pub max_batch_size: usize,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_batch_size: 64,
        }
    }
}

/// Delivery settings of one alertmanager set
#[derive(Debug, Clone, PartialEq)]
struct SetSettings {
    scheme: Scheme,
    path_prefix: String,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct Settings {
    external_labels: Labels,
    sets: BTreeMap<String, SetSettings>,
}

/// A resolved alertmanager endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Alertmanager {
    pub set: String,
    pub url: Url,
    pub timeout: Duration,
}

pub struct NotificationManager {
    options: NotifierOptions,
    client: reqwest::Client,
    queue: Mutex<VecDeque<NotificationAlert>>,
    more: Notify,
    settings: Mutex<Settings>,
    targets: Mutex<TargetGroups>,
    token: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // critical sections never leave partial state behind
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NotificationManager {
    pub fn new(options: NotifierOptions) -> anyhow::Result<Self> {
        anyhow::ensure!(
            options.queue_capacity > 0,
            "notification queue capacity must be greater than zero"
        );
        anyhow::ensure!(options.max_batch_size > 0, "batch size must be greater than zero");

        let client = reqwest::Client::builder()
            .build()
            .context("failed to build notifier HTTP client")?;

        Ok(Self {
            options,
            client,
            queue: Mutex::new(VecDeque::new()),
            more: Notify::new(),
            settings: Mutex::new(Settings::default()),
            targets: Mutex::new(TargetGroups::new()),
            token: CancellationToken::new(),
        })
    }

    /// Takes over external labels and per-set delivery settings
    pub fn apply_config(&self, config: &Config) -> anyhow::Result<()> {
        let sets = config
            .alerting
            .alertmanager_map()
            .into_iter()
            .map(|(name, am)| {
                (
                    name,
                    SetSettings {
                        scheme: am.scheme,
                        path_prefix: am.path_prefix.clone(),
                        timeout: am.timeout(),
                    },
                )
            })
            .collect();

        *lock(&self.settings) = Settings {
            external_labels: config.global.external_labels.clone(),
            sets,
        };
        self.refresh_discovered_gauge();
        Ok(())
    }

    /// Number of alerts waiting for delivery
    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Endpoints alerts are currently sent to
    pub fn alertmanagers(&self) -> Vec<Alertmanager> {
        let settings = lock(&self.settings);
        let targets = lock(&self.targets);

        let mut result = vec![];
        for (set, group) in targets.iter() {
            let Some(set_settings) = settings.sets.get(set) else {
                continue;
            };
            for target in group {
                match alerts_url(set_settings, &target.address) {
                    Ok(url) => result.push(Alertmanager {
                        set: set.clone(),
                        url,
                        timeout: set_settings.timeout,
                    }),
                    Err(e) => warn!(set = %set, "skipping alertmanager {}: {e:#}", target.address),
                }
            }
        }
        result
    }

    /// Stops the run loop
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Main loop, follows discovered targets and drains the queue
    ///
    /// Alerts still queued at shutdown get one final delivery attempt.
    #[instrument(skip_all, name = "notification_manager")]
    pub async fn run(&self, mut sync_rx: watch::Receiver<TargetGroups>) -> anyhow::Result<()> {
        info!("starting notification manager");
        self.update_targets(sync_rx.borrow_and_update().clone());

        let mut discovery_open = true;
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,

                changed = sync_rx.changed(), if discovery_open => match changed {
                    Ok(()) => self.update_targets(sync_rx.borrow_and_update().clone()),
                    Err(_) => {
                        warn!("discovery channel closed, keeping last known alertmanagers");
                        discovery_open = false;
                    }
                },

                _ = self.more.notified() => self.send_queued().await,
            }
        }

        if self.queue_len() > 0 {
            debug!("sending {} queued alerts before shutdown", self.queue_len());
            self.send_queued().await;
        }

        info!("notification manager stopped");
        Ok(())
    }

    /// Wraps the manager into a supervised actor
    pub fn actor(self: Arc<Self>, sync_rx: watch::Receiver<TargetGroups>) -> Actor {
        let manager = Arc::clone(&self);
        Actor::new(
            "notifier",
            async move { manager.run(sync_rx).await },
            move |_| self.stop(),
        )
    }

    fn update_targets(&self, groups: TargetGroups) {
        let total: usize = groups.values().map(Vec::len).sum();
        debug!(targets = total, "alertmanager targets updated");
        *lock(&self.targets) = groups;
        self.refresh_discovered_gauge();
    }

    fn refresh_discovered_gauge(&self) {
        gauge!(telemetry::ALERTMANAGERS_DISCOVERED).set(self.alertmanagers().len() as f64);
    }

    fn next_batch(&self) -> Vec<NotificationAlert> {
        let mut queue = lock(&self.queue);
        let take = queue.len().min(self.options.max_batch_size);
        let batch = queue.drain(..take).collect();
        gauge!(telemetry::NOTIFICATIONS_QUEUE_LENGTH).set(queue.len() as f64);
        batch
    }

    async fn send_queued(&self) {
        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                return;
            }
            self.send_all(&batch).await;
        }
    }

    /// Sends one batch to every alertmanager concurrently
    async fn send_all(&self, batch: &[NotificationAlert]) {
        let alertmanagers = self.alertmanagers();
        if alertmanagers.is_empty() {
            warn!(alerts = batch.len(), "no alertmanager to send alerts to, dropping alerts");
            counter!(telemetry::NOTIFICATIONS_DROPPED).increment(batch.len() as u64);
            return;
        }

        let requests = alertmanagers.iter().map(|am| async move {
            let result = self.post(am, batch).await;
            (am, result)
        });

        for (am, result) in join_all(requests).await {
            let url = am.url.to_string();
            match result {
                Ok(()) => {
                    trace!(alertmanager = %url, "sent {} alerts", batch.len());
                    counter!(telemetry::NOTIFICATIONS_SENT, "alertmanager" => url)
                        .increment(batch.len() as u64);
                }
                Err(e) => {
                    warn!(alertmanager = %url, count = batch.len(), "error sending alerts: {e:#}");
                    counter!(telemetry::NOTIFICATIONS_ERRORS, "alertmanager" => url)
                        .increment(batch.len() as u64);
                }
            }
        }
    }

    async fn post(&self, am: &Alertmanager, batch: &[NotificationAlert]) -> anyhow::Result<()> {
        let response = self
            .client
            .post(am.url.clone())
            .timeout(am.timeout)
            .json(batch)
            .send()
            .await
            .context("failed to send HTTP request")?;

        if !response.status().is_success() {
            anyhow::bail!("bad response status {}", response.status());
        }
        Ok(())
    }
}

impl AlertSink for NotificationManager {
    fn send(&self, mut alerts: Vec<NotificationAlert>) {
        if alerts.is_empty() {
            return;
        }

        {
            let settings = lock(&self.settings);
            for alert in &mut alerts {
                alert.labels.merge_missing(&settings.external_labels);
            }
        }

        let capacity = self.options.queue_capacity;
        let mut dropped = 0;

        // a batch larger than the queue keeps only its newest alerts
        if alerts.len() > capacity {
            dropped += alerts.len() - capacity;
            alerts.drain(..alerts.len() - capacity);
        }

        let mut queue = lock(&self.queue);
        let overflow = (queue.len() + alerts.len()).saturating_sub(capacity);
        queue.drain(..overflow);
        dropped += overflow;
        queue.extend(alerts);
        gauge!(telemetry::NOTIFICATIONS_QUEUE_LENGTH).set(queue.len() as f64);
        drop(queue);

        if dropped > 0 {
            warn!(count = dropped, "alert notification queue full, dropping alerts");
            counter!(telemetry::NOTIFICATIONS_DROPPED).increment(dropped as u64);
        }

        self.more.notify_one();
    }
}

fn alerts_url(settings: &SetSettings, address: &str) -> anyhow::Result<Url> {
    let prefix = settings.path_prefix.trim_end_matches('/');
    let raw = format!(
        "{}://{address}{prefix}/{ALERTS_API_PATH}",
        settings.scheme.as_str()
    );
    Url::parse(&raw).with_context(|| format!("invalid alertmanager URL {raw:?}"))
}
