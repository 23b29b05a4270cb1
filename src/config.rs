//! Configuration file model
//!
//! The configuration is a TOML document holding the global evaluation settings,
//! the rule file globs and the alertmanager routing targets. A loaded [`Config`]
//! is immutable and shared as `Arc<Config>` between reload targets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

use crate::Labels;

/// Errors raised while loading or validating a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    /// Glob patterns resolved on every reload
    #[serde(default)]
    pub rule_files: Vec<String>,

    #[serde(default)]
    pub alerting: AlertingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Evaluation interval in seconds
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval: u64,

    /// Labels attached to every rule result and outgoing alert
    #[serde(default)]
    pub external_labels: Labels,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: default_evaluation_interval(),
            external_labels: Labels::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertingConfig {
    #[serde(default)]
    pub alertmanagers: Vec<AlertmanagerConfig>,
}

impl AlertingConfig {
    /// Alertmanager sets keyed by their position (`config-0`, `config-1`, ...)
    pub fn alertmanager_map(&self) -> BTreeMap<String, &AlertmanagerConfig> {
        self.alertmanagers
            .iter()
            .enumerate()
            .map(|(i, am)| (format!("config-{i}"), am))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlertmanagerConfig {
    #[serde(default)]
    pub scheme: Scheme,

    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(flatten)]
    pub service_discovery: DiscoveryConfigs,
}

impl AlertmanagerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Service discovery configuration of one alertmanager set
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct DiscoveryConfigs {
    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,

    #[serde(default)]
    pub file_sd_configs: Vec<FileSdConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    pub targets: Vec<String>,

    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSdConfig {
    /// Glob patterns of Prometheus file-SD JSON documents
    pub files: Vec<String>,

    /// Re-read interval in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl FileSdConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

fn default_evaluation_interval() -> u64 {
    60
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    300 // 5 minutes
}

fn label_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static regex is valid"))
}

pub fn is_valid_label_name(name: &str) -> bool {
    label_name_regex().is_match(name)
}

impl Config {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.global.evaluation_interval)
    }

    /// Checks semantic constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.evaluation_interval == 0 {
            return Err(ConfigError::Invalid(
                "global.evaluation_interval must be greater than zero".to_string(),
            ));
        }

        validate_label_names(&self.global.external_labels, "global.external_labels")?;

        for pattern in &self.rule_files {
            if pattern.trim().is_empty() {
                return Err(ConfigError::Invalid("empty rule_files pattern".to_string()));
            }
        }

        for (name, am) in self.alerting.alertmanager_map() {
            if am.timeout == 0 {
                return Err(ConfigError::Invalid(format!(
                    "alertmanager {name}: timeout must be greater than zero"
                )));
            }
            if !am.path_prefix.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "alertmanager {name}: path_prefix must start with '/'"
                )));
            }
            validate_discovery(&name, &am.service_discovery)?;
        }

        Ok(())
    }
}

fn validate_label_names(labels: &Labels, context: &str) -> Result<(), ConfigError> {
    match labels.iter().find(|l| !is_valid_label_name(&l.name)) {
        Some(label) => Err(ConfigError::Invalid(format!(
            "{context}: invalid label name {:?}",
            label.name
        ))),
        None => Ok(()),
    }
}

fn validate_discovery(name: &str, sd: &DiscoveryConfigs) -> Result<(), ConfigError> {
    for static_config in &sd.static_configs {
        for target in &static_config.targets {
            if !is_valid_target(target) {
                return Err(ConfigError::Invalid(format!(
                    "alertmanager {name}: invalid target {target:?}, expected host:port"
                )));
            }
        }
        validate_label_names(&static_config.labels, name)?;
    }

    for file_sd in &sd.file_sd_configs {
        if file_sd.files.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "alertmanager {name}: file_sd_configs entry without files"
            )));
        }
        if file_sd.refresh_interval == 0 {
            return Err(ConfigError::Invalid(format!(
                "alertmanager {name}: refresh_interval must be greater than zero"
            )));
        }
    }

    Ok(())
}

/// A target is `host:port` with a numeric port
pub fn is_valid_target(target: &str) -> bool {
    match target.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Reads, parses and validates the configuration at `path`
pub fn load_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;

    trace!("loaded config: {config:?}");
    Ok(config)
}
