//! Rule files and rule evaluation
//!
//! Rule files are TOML documents with a list of groups:
//!
//! ```toml
//! [[groups]]
//! name = "api"
//! interval = 30
//!
//! [[groups.rules]]
//! record = "job:http_requests:rate5m"
//! expr = "sum by (job) (rate(http_requests_total[5m]))"
//!
//! [[groups.rules]]
//! alert = "HighErrorRate"
//! expr = "job:http_errors:ratio5m > 0.05"
//! for = 300
//! labels = { severity = "page" }
//! annotations = { summary = "{{ $labels.job }} error rate is {{ $value }}" }
//! ```
//!
//! Expressions are evaluated by the remote backend; this module only handles
//! what happens with the resulting vectors.

pub mod alerting;
pub mod recording;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::actors::export::SampleAppender;
use crate::alerts::AlertSender;
use crate::config::is_valid_label_name;
use crate::query::{self, MetricsSource, QueryError};
use crate::{Labels, telemetry};

pub use alerting::{ActiveAlert, AlertState, AlertingRule};
pub use recording::RecordingRule;

/// Errors raised while resolving or loading rule files
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Error retrieving rule file: {pattern}")]
    Glob { pattern: String },

    #[error("failed to read rule file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rule file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{}: group {group:?}: {message}", path.display())]
    Invalid {
        path: PathBuf,
        group: String,
        message: String,
    },
}

/// Errors raised while evaluating a single rule
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("vector contains metrics with the same labelset after applying rule labels: {0}")]
    DuplicateLabelset(Labels),

    #[error("failed to append samples: {0:#}")]
    Append(anyhow::Error),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    groups: Vec<RuleGroupConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleGroupConfig {
    name: String,

    /// Evaluation interval in seconds, defaults to the global one
    interval: Option<u64>,

    #[serde(default)]
    rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleConfig {
    record: Option<String>,
    alert: Option<String>,
    expr: String,

    /// Pending duration in seconds
    #[serde(rename = "for", default)]
    hold: u64,

    #[serde(default)]
    labels: Labels,

    #[serde(default)]
    annotations: Labels,
}

fn metric_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("static regex is valid"))
}

/// A configured rule
#[derive(Debug)]
pub enum Rule {
    Recording(RecordingRule),
    Alerting(AlertingRule),
}

impl Rule {
    pub fn name(&self) -> &str {
        match self {
            Rule::Recording(r) => r.name(),
            Rule::Alerting(r) => r.name(),
        }
    }

    pub fn expr(&self) -> &str {
        match self {
            Rule::Recording(r) => r.expr(),
            Rule::Alerting(r) => r.expr(),
        }
    }
}

/// Collaborators of a group evaluation
pub struct EvalContext<'a> {
    pub source: &'a dyn MetricsSource,
    pub appender: &'a dyn SampleAppender,
    pub sender: &'a AlertSender,
    pub external_labels: &'a Labels,
    pub resend_delay: Duration,
}

/// Rules of one group, evaluated sequentially at a fixed interval
#[derive(Debug)]
pub struct RuleGroup {
    name: String,
    file: PathBuf,
    interval: Duration,
    rules: Vec<Rule>,
}

impl RuleGroup {
    pub fn new(name: impl Into<String>, file: impl Into<PathBuf>, interval: Duration, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            interval,
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Identity of the group across reloads
    pub fn key(&self) -> String {
        group_key(&self.file, &self.name)
    }

    /// Takes over the alert state of matching alerting rules from `old`
    ///
    /// Rules match when name and expression are equal.
    pub fn copy_state(&mut self, old: &mut RuleGroup) {
        for rule in &mut self.rules {
            let Rule::Alerting(new_rule) = rule else {
                continue;
            };
            let matching = old.rules.iter_mut().find_map(|r| match r {
                Rule::Alerting(old_rule)
                    if old_rule.name() == new_rule.name() && old_rule.expr() == new_rule.expr() =>
                {
                    Some(old_rule)
                }
                _ => None,
            });
            if let Some(old_rule) = matching {
                new_rule.take_state(old_rule);
            }
        }
    }

    /// Evaluates every rule at `ts`
    ///
    /// A failing rule is logged and counted; the remaining rules are still
    /// evaluated.
    pub async fn eval(&mut self, ts: DateTime<Utc>, ctx: &EvalContext<'_>) {
        let start = Instant::now();
        let group = self.key();

        for rule in &mut self.rules {
            counter!(telemetry::RULE_EVALUATIONS, "rule_group" => group.clone()).increment(1);

            if let Err(e) = eval_rule(rule, ts, self.interval, ctx).await {
                warn!(group = %group, rule = %rule.name(), "evaluating rule failed: {e}");
                counter!(telemetry::RULE_EVALUATION_FAILURES, "rule_group" => group.clone())
                    .increment(1);
            }
        }

        let elapsed = start.elapsed();
        trace!(group = %group, duration = ?elapsed, "group evaluated");
        histogram!(telemetry::RULE_GROUP_DURATION, "rule_group" => group).record(elapsed.as_secs_f64());
    }
}

async fn eval_rule(
    rule: &mut Rule,
    ts: DateTime<Utc>,
    interval: Duration,
    ctx: &EvalContext<'_>,
) -> Result<(), EvalError> {
    let vector = query::query_vector(ctx.source, rule.expr(), ts).await?;

    match rule {
        Rule::Recording(rule) => {
            let samples = rule.eval(ts, vector, ctx.external_labels)?;
            ctx.appender
                .append(samples)
                .await
                .map_err(EvalError::Append)?;
        }
        Rule::Alerting(rule) => {
            rule.eval(ts, vector)?;
            let alerts = rule.alerts_to_send(ts, ctx.resend_delay, interval);
            ctx.sender.send(rule.expr(), &alerts);
        }
    }
    Ok(())
}

pub fn group_key(file: &Path, name: &str) -> String {
    format!("{};{name}", file.display())
}

/// Expands rule file glob patterns into a sorted, de-duplicated file list
///
/// A pattern that is invalid or matches no file fails the whole resolution.
pub fn resolve_files(patterns: &[String]) -> Result<Vec<PathBuf>, RuleError> {
    let mut files = BTreeSet::new();

    for pattern in patterns {
        let paths = glob::glob(pattern).map_err(|_| RuleError::Glob {
            pattern: pattern.clone(),
        })?;

        let matched: Vec<PathBuf> = paths.flatten().collect();
        if matched.is_empty() {
            return Err(RuleError::Glob {
                pattern: pattern.clone(),
            });
        }
        files.extend(matched);
    }

    Ok(files.into_iter().collect())
}

/// Loads and validates every group of `files`
///
/// Groups without an own interval use `default_interval`.
pub fn load_groups(files: &[PathBuf], default_interval: Duration) -> Result<Vec<RuleGroup>, RuleError> {
    let mut groups = vec![];
    for file in files {
        groups.extend(load_file(file, default_interval)?);
    }
    debug!(files = files.len(), groups = groups.len(), "loaded rule groups");
    Ok(groups)
}

fn load_file(path: &Path, default_interval: Duration) -> Result<Vec<RuleGroup>, RuleError> {
    let content = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_groups(&content, path, default_interval)
}

/// Parses and validates a rule file document
pub fn parse_groups(content: &str, path: &Path, default_interval: Duration) -> Result<Vec<RuleGroup>, RuleError> {
    let file: RuleFile = toml::from_str(content).map_err(|source| RuleError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut names = BTreeSet::new();
    let mut groups = Vec::with_capacity(file.groups.len());

    for group in file.groups {
        let invalid = |message: String| RuleError::Invalid {
            path: path.to_path_buf(),
            group: group.name.clone(),
            message,
        };

        if group.name.is_empty() {
            return Err(invalid("group name must not be empty".to_string()));
        }
        if !names.insert(group.name.clone()) {
            return Err(invalid("repeated group name".to_string()));
        }

        let interval = match group.interval {
            Some(0) => return Err(invalid("interval must be greater than zero".to_string())),
            Some(secs) => Duration::from_secs(secs),
            None => default_interval,
        };

        let mut rules = Vec::with_capacity(group.rules.len());
        for (index, rule) in group.rules.into_iter().enumerate() {
            rules.push(build_rule(rule).map_err(|e| invalid(format!("rule {index}: {e}")))?);
        }

        groups.push(RuleGroup::new(group.name, path, interval, rules));
    }

    Ok(groups)
}

fn build_rule(rule: RuleConfig) -> Result<Rule, String> {
    if rule.expr.trim().is_empty() {
        return Err("field 'expr' must be set".to_string());
    }
    if let Some(label) = rule.labels.iter().find(|l| !is_valid_label_name(&l.name)) {
        return Err(format!("invalid label name {:?}", label.name));
    }

    match (rule.record, rule.alert) {
        (Some(_), Some(_)) => Err("only one of 'record' and 'alert' must be set".to_string()),
        (None, None) => Err("one of 'record' or 'alert' must be set".to_string()),
        (Some(record), None) => {
            if !metric_name_regex().is_match(&record) {
                return Err(format!("invalid recording rule name {record:?}"));
            }
            if !rule.annotations.is_empty() {
                return Err("invalid field 'annotations' in recording rule".to_string());
            }
            if rule.hold != 0 {
                return Err("invalid field 'for' in recording rule".to_string());
            }
            Ok(Rule::Recording(RecordingRule::new(record, rule.expr, rule.labels)))
        }
        (None, Some(alert)) => {
            if !is_valid_label_name(&alert) {
                return Err(format!("invalid alert name {alert:?}"));
            }
            if let Some(a) = rule.annotations.iter().find(|a| !is_valid_label_name(&a.name)) {
                return Err(format!("invalid annotation name {:?}", a.name));
            }
            Ok(Rule::Alerting(AlertingRule::new(
                alert,
                rule.expr,
                Duration::from_secs(rule.hold),
                rule.labels,
                rule.annotations,
            )))
        }
    }
}
