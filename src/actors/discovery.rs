//! DiscoveryManager - resolves alertmanager targets
//!
//! Each alertmanager set (`config-0`, ...) has a static target list and any
//! number of file-SD globs. The manager re-resolves all providers whenever the
//! configuration changes and on the shortest file refresh interval, and
//! publishes the result on a `watch` channel.
//!
//! ```text
//! apply_config() ──► resync ──┐
//! refresh timer ──────────────┼──► discover() ──► watch::Sender<TargetGroups>
//!                             │
//! cancel() ───────────────────┘ (stop)
//! ```
//!
//! File-SD documents use the Prometheus format:
//! `[{"targets": ["host:port"], "labels": {"k": "v"}}]`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::messages::{Target, TargetGroups};
use super::supervisor::Actor;
use crate::Labels;
use crate::config::{DiscoveryConfigs, is_valid_target};

/// One entry of a file-SD document
#[derive(Debug, Deserialize)]
struct FileSdGroup {
    targets: Vec<String>,

    #[serde(default)]
    labels: Labels,
}

pub struct DiscoveryManager {
    /// Name used in logs and as actor name
    name: String,

    providers: Mutex<BTreeMap<String, DiscoveryConfigs>>,

    resync: Notify,

    sync_tx: watch::Sender<TargetGroups>,

    token: CancellationToken,
}

impl DiscoveryManager {
    pub fn new(name: impl Into<String>) -> Self {
        let (sync_tx, _) = watch::channel(TargetGroups::new());
        Self {
            name: name.into(),
            providers: Mutex::new(BTreeMap::new()),
            resync: Notify::new(),
            sync_tx,
            token: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribes to published target groups
    pub fn sync_channel(&self) -> watch::Receiver<TargetGroups> {
        self.sync_tx.subscribe()
    }

    /// Replaces all providers and triggers a resync
    ///
    /// Every file-SD glob is checked first; an invalid pattern rejects the
    /// whole configuration and keeps the previous providers.
    pub fn apply_config(&self, configs: BTreeMap<String, DiscoveryConfigs>) -> anyhow::Result<()> {
        for (name, sd) in &configs {
            for file_sd in &sd.file_sd_configs {
                for pattern in &file_sd.files {
                    glob::Pattern::new(pattern)
                        .with_context(|| format!("{name}: invalid file_sd pattern {pattern:?}"))?;
                }
            }
        }

        debug!(manager = %self.name, providers = configs.len(), "applying discovery configuration");
        *self
            .providers
            .lock()
            .map_err(|_| anyhow::anyhow!("discovery providers lock poisoned"))? = configs;
        self.resync.notify_one();
        Ok(())
    }

    /// Stops the run loop
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Main loop, returns once cancelled
    #[instrument(skip(self), fields(manager = %self.name))]
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("starting discovery manager");

        loop {
            let (providers, refresh) = self.snapshot()?;
            let groups = discover(&providers).await;

            let total: usize = groups.values().map(Vec::len).sum();
            let changed = self.sync_tx.send_if_modified(|current| {
                if *current == groups {
                    false
                } else {
                    *current = groups;
                    true
                }
            });
            if changed {
                debug!(targets = total, "published discovered targets");
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = self.resync.notified() => trace!("resync requested"),
                _ = sleep_or_pending(refresh) => trace!("refreshing file discovery"),
            }
        }

        info!("discovery manager stopped");
        Ok(())
    }

    /// Wraps the manager into a supervised actor
    pub fn actor(self: Arc<Self>) -> Actor {
        let manager = Arc::clone(&self);
        Actor::new(
            format!("discovery ({})", self.name),
            async move { manager.run().await },
            move |_| self.cancel(),
        )
    }

    fn snapshot(&self) -> anyhow::Result<(BTreeMap<String, DiscoveryConfigs>, Option<Duration>)> {
        let providers = self
            .providers
            .lock()
            .map_err(|_| anyhow::anyhow!("discovery providers lock poisoned"))?
            .clone();

        let refresh = providers
            .values()
            .flat_map(|sd| sd.file_sd_configs.iter())
            .map(|f| f.refresh_interval())
            .min();

        Ok((providers, refresh))
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Resolves every provider into its target list
async fn discover(providers: &BTreeMap<String, DiscoveryConfigs>) -> TargetGroups {
    let mut groups = TargetGroups::new();

    for (name, sd) in providers {
        let mut seen = BTreeSet::new();
        let mut targets = vec![];

        for static_config in &sd.static_configs {
            for address in &static_config.targets {
                if seen.insert(address.clone()) {
                    targets.push(Target {
                        address: address.clone(),
                        labels: static_config.labels.clone(),
                    });
                }
            }
        }

        for file_sd in &sd.file_sd_configs {
            for pattern in &file_sd.files {
                let paths = match glob::glob(pattern) {
                    Ok(paths) => paths,
                    Err(e) => {
                        warn!(provider = %name, "invalid file_sd pattern {pattern:?}: {e}");
                        continue;
                    }
                };

                for path in paths.flatten() {
                    match read_file_sd(&path).await {
                        Ok(file_groups) => {
                            for group in file_groups {
                                for address in group.targets {
                                    if !is_valid_target(&address) {
                                        warn!(provider = %name, file = %path.display(), "skipping invalid target {address:?}");
                                        continue;
                                    }
                                    if seen.insert(address.clone()) {
                                        targets.push(Target {
                                            address,
                                            labels: group.labels.clone(),
                                        });
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(provider = %name, file = %path.display(), "failed to read file_sd document: {e:#}")
                        }
                    }
                }
            }
        }

        groups.insert(name.clone(), targets);
    }

    groups
}

async fn read_file_sd(path: &Path) -> anyhow::Result<Vec<FileSdGroup>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .context("failed to read file")?;
    serde_json::from_str(&content).context("failed to parse file_sd JSON")
}
