//! Configuration reloading
//!
//! A [`ReloadCoordinator`] loads the configuration file and hands the new
//! snapshot to every registered [`ReloadTarget`] in registration order. A
//! failing target does not stop the remaining ones, and already applied
//! targets are not rolled back: after a failed reload subsystems may run on
//! different configuration generations.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{gauge, histogram};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::{self, Config, ConfigError};
use crate::telemetry;

type ApplyFn = dyn Fn(Arc<Config>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A named subsystem that accepts new configuration snapshots
#[derive(Clone)]
pub struct ReloadTarget {
    name: String,
    apply: Arc<ApplyFn>,
}

impl ReloadTarget {
    pub fn new<F, Fut>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Arc<Config>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(move |config| apply(config).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ReloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadTarget")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A target that rejected a configuration
#[derive(Debug)]
pub struct TargetFailure {
    pub target: String,
    pub error: anyhow::Error,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.target, self.error)
    }
}

fn join_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("couldn't load configuration (--config.file={}): {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error(
        "one or more errors occurred while applying the new configuration (--config.file={}): {}",
        path.display(),
        join_failures(.failures)
    )]
    Apply {
        path: PathBuf,
        failures: Vec<TargetFailure>,
    },
}

impl ReloadError {
    /// Names of the targets that failed to apply
    pub fn failed_targets(&self) -> Vec<&str> {
        match self {
            ReloadError::Load { .. } => vec![],
            ReloadError::Apply { failures, .. } => {
                failures.iter().map(|f| f.target.as_str()).collect()
            }
        }
    }
}

/// Timings of a completed reload
#[derive(Debug, Clone)]
pub struct ReloadReport {
    pub total: Duration,
    pub timings: Vec<(String, Duration)>,
}

/// Loads the configuration file and applies it to a fixed list of targets
#[derive(Debug, Clone)]
pub struct ReloadCoordinator {
    config_file: PathBuf,
    targets: Arc<[ReloadTarget]>,
}

impl ReloadCoordinator {
    pub fn new(config_file: impl Into<PathBuf>, targets: Vec<ReloadTarget>) -> Self {
        Self {
            config_file: config_file.into(),
            targets: targets.into(),
        }
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn targets(&self) -> &[ReloadTarget] {
        &self.targets
    }

    /// Loads the configuration file and applies it to every target
    ///
    /// A load failure touches no target. Apply failures are collected and the
    /// remaining targets still receive the same snapshot.
    #[instrument(skip(self), fields(filename = %self.config_file.display()))]
    pub async fn reload(&self) -> Result<ReloadReport, ReloadError> {
        let start = Instant::now();
        info!("loading configuration file");

        let config = match config::load_file(&self.config_file) {
            Ok(config) => Arc::new(config),
            Err(source) => {
                gauge!(telemetry::CONFIG_RELOAD_SUCCESS).set(0.0);
                return Err(ReloadError::Load {
                    path: self.config_file.clone(),
                    source,
                });
            }
        };

        let mut failures = vec![];
        let mut timings = Vec::with_capacity(self.targets.len());

        for target in self.targets.iter() {
            let target_start = Instant::now();
            if let Err(e) = (target.apply)(Arc::clone(&config)).await {
                error!(reload_target = %target.name, "failed to apply configuration: {e:#}");
                failures.push(TargetFailure {
                    target: target.name.clone(),
                    error: e,
                });
            }

            let elapsed = target_start.elapsed();
            histogram!(telemetry::CONFIG_RELOAD_TARGET_DURATION, "target" => target.name.clone())
                .record(elapsed.as_secs_f64());
            timings.push((target.name.clone(), elapsed));
        }

        if !failures.is_empty() {
            gauge!(telemetry::CONFIG_RELOAD_SUCCESS).set(0.0);
            return Err(ReloadError::Apply {
                path: self.config_file.clone(),
                failures,
            });
        }

        let total = start.elapsed();
        gauge!(telemetry::CONFIG_RELOAD_SUCCESS).set(1.0);
        gauge!(telemetry::CONFIG_RELOAD_SUCCESS_TIMESTAMP)
            .set(chrono::Utc::now().timestamp() as f64);

        let timing_summary = timings
            .iter()
            .map(|(name, d)| format!("{name}={d:?}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            total_duration = ?total,
            timings = %timing_summary,
            "completed loading of configuration file"
        );

        Ok(ReloadReport { total, timings })
    }
}
