//! Alerting rules
//!
//! Each evaluation maps the result vector onto a set of active alerts keyed by
//! their final label set:
//!
//! ```text
//!            present for `for`           absent
//! (new) ──► Pending ──────────────► Firing ────────► Inactive (resolved)
//!              │                                        │
//!              └── absent: deleted          kept 15m, then deleted
//! ```
//!
//! Firing and resolved alerts are re-sent every `resend_delay`. Each sent
//! alert is valid for four times the larger of evaluation interval and resend
//! delay, so a receiver resolves it on its own once evaluation stops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

use super::EvalError;
use crate::alerts::AlertRecord;
use crate::{Labels, METRIC_NAME, Vector};

/// Label carrying the alerting rule name
pub const ALERT_NAME_LABEL: &str = "alertname";

/// Retention of resolved alerts
const RESOLVED_RETENTION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Inactive,
    Pending,
    Firing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveAlert {
    pub state: AlertState,
    pub labels: Labels,
    pub annotations: Labels,
    pub value: f64,
    pub active_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl ActiveAlert {
    fn needs_sending(&self, ts: DateTime<Utc>, resend_delay: Duration) -> bool {
        if self.state == AlertState::Pending {
            return false;
        }
        match (self.last_sent_at, self.resolved_at) {
            (None, _) => true,
            (Some(sent), Some(resolved)) if resolved > sent => true,
            (Some(sent), _) => sent + resend_delay <= ts,
        }
    }
}

#[derive(Debug)]
pub struct AlertingRule {
    name: String,
    expr: String,
    hold: Duration,
    labels: Labels,
    annotations: Labels,
    active: BTreeMap<Labels, ActiveAlert>,
}

impl AlertingRule {
    pub fn new(
        name: impl Into<String>,
        expr: impl Into<String>,
        hold: Duration,
        labels: Labels,
        annotations: Labels,
    ) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
            hold,
            labels,
            annotations,
            active: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Duration an alert stays pending before it fires
    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Alerts tracked by the rule, including resolved ones
    pub fn active_alerts(&self) -> impl Iterator<Item = &ActiveAlert> {
        self.active.values()
    }

    pub(super) fn take_state(&mut self, old: &mut AlertingRule) {
        self.active = std::mem::take(&mut old.active);
    }

    /// Updates the alert states with the query result at `ts`
    pub fn eval(&mut self, ts: DateTime<Utc>, vector: Vector) -> Result<(), EvalError> {
        let mut present = BTreeSet::new();

        for sample in vector {
            let mut labels = sample.metric;
            labels.remove(METRIC_NAME);

            let expand = |text: &str| expand_template(text, &labels, sample.value);
            let rule_labels: Vec<(String, String)> = self
                .labels
                .iter()
                .map(|l| (l.name.clone(), expand(&l.value)))
                .collect();
            let annotations: Labels = self
                .annotations
                .iter()
                .map(|a| (a.name.clone(), expand(&a.value)))
                .collect();

            for (name, value) in rule_labels {
                if value.is_empty() {
                    labels.remove(&name);
                } else {
                    labels.set(name, value);
                }
            }
            labels.set(ALERT_NAME_LABEL, self.name.as_str());

            if !present.insert(labels.clone()) {
                return Err(EvalError::DuplicateLabelset(labels));
            }

            match self.active.get_mut(&labels) {
                Some(alert) if alert.state != AlertState::Inactive => {
                    alert.value = sample.value;
                    alert.annotations = annotations;
                }
                _ => {
                    self.active.insert(
                        labels.clone(),
                        ActiveAlert {
                            state: AlertState::Pending,
                            labels,
                            annotations,
                            value: sample.value,
                            active_at: ts,
                            fired_at: None,
                            resolved_at: None,
                            last_sent_at: None,
                            valid_until: None,
                        },
                    );
                }
            }
        }

        let hold = chrono::Duration::from_std(self.hold).unwrap_or(chrono::Duration::MAX);
        let retention = chrono::Duration::from_std(RESOLVED_RETENTION).unwrap_or(chrono::Duration::MAX);

        self.active.retain(|labels, alert| {
            if present.contains(labels) {
                return true;
            }
            match (alert.state, alert.resolved_at) {
                (AlertState::Pending, _) => false,
                (AlertState::Inactive, Some(resolved)) => ts - resolved <= retention,
                _ => true,
            }
        });

        for (labels, alert) in self.active.iter_mut() {
            if !present.contains(labels) {
                if alert.state == AlertState::Firing {
                    alert.state = AlertState::Inactive;
                    alert.resolved_at = Some(ts);
                }
                continue;
            }
            if alert.state == AlertState::Pending && ts - alert.active_at >= hold {
                alert.state = AlertState::Firing;
                alert.fired_at = Some(ts);
            }
        }

        Ok(())
    }

    /// Collects firing and resolved alerts due for (re-)sending at `ts`
    pub fn alerts_to_send(
        &mut self,
        ts: DateTime<Utc>,
        resend_delay: Duration,
        interval: Duration,
    ) -> Vec<AlertRecord> {
        let validity = chrono::Duration::from_std(4 * interval.max(resend_delay))
            .unwrap_or(chrono::Duration::MAX);

        let mut records = vec![];
        for alert in self.active.values_mut() {
            if !alert.needs_sending(ts, resend_delay) {
                continue;
            }
            if alert.resolved_at.is_none() {
                alert.valid_until = Some(ts + validity);
            }
            alert.last_sent_at = Some(ts);

            let resolved_at = alert.resolved_at;
            records.push(AlertRecord {
                labels: alert.labels.clone(),
                annotations: alert.annotations.clone(),
                fired_at: alert.fired_at.unwrap_or(alert.active_at),
                resolved_at,
                valid_until: alert.valid_until.or(resolved_at).unwrap_or(ts + validity),
            });
        }
        records
    }
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*\$(?:labels\.([a-zA-Z_][a-zA-Z0-9_]*)|(value))\s*\}\}")
            .expect("static regex is valid")
    })
}

/// Expands `{{ $labels.<name> }}` and `{{ $value }}`
///
/// Unknown labels expand to the empty string.
pub fn expand_template(text: &str, labels: &Labels, value: f64) -> String {
    template_regex()
        .replace_all(text, |caps: &Captures<'_>| match caps.get(1) {
            Some(name) => labels.get(name.as_str()).unwrap_or_default().to_string(),
            None => value.to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;
    use pretty_assertions::assert_eq;

    const INTERVAL: Duration = Duration::from_secs(60);
    const RESEND: Duration = Duration::from_secs(60);

    fn vector(instances: &[&str]) -> Vector {
        instances
            .iter()
            .map(|instance| Sample {
                metric: [("__name__", "up"), ("instance", *instance)].into_iter().collect(),
                timestamp: 0,
                value: 0.0,
            })
            .collect()
    }

    fn rule(hold: Duration) -> AlertingRule {
        AlertingRule::new(
            "InstanceDown",
            "up == 0",
            hold,
            [("severity", "page")].into_iter().collect(),
            [("summary", "{{ $labels.instance }} is down ({{$value}})")]
                .into_iter()
                .collect(),
        )
    }

    fn states(rule: &AlertingRule) -> Vec<AlertState> {
        rule.active_alerts().map(|a| a.state).collect()
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    #[test]
    fn test_pending_then_firing_after_hold() {
        let mut rule = rule(Duration::from_secs(300));
        let t0 = Utc::now();

        rule.eval(t0, vector(&["a:1"])).unwrap();
        assert_eq!(states(&rule), vec![AlertState::Pending]);
        assert!(rule.alerts_to_send(t0, RESEND, INTERVAL).is_empty());

        rule.eval(t0 + minutes(5), vector(&["a:1"])).unwrap();
        assert_eq!(states(&rule), vec![AlertState::Firing]);

        let sent = rule.alerts_to_send(t0 + minutes(5), RESEND, INTERVAL);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].fired_at, t0 + minutes(5));
        assert_eq!(sent[0].valid_until, t0 + minutes(5) + minutes(4));
        assert_eq!(sent[0].resolved_at, None);
    }

    #[test]
    fn test_zero_hold_fires_immediately() {
        let mut rule = rule(Duration::ZERO);
        rule.eval(Utc::now(), vector(&["a:1"])).unwrap();
        assert_eq!(states(&rule), vec![AlertState::Firing]);
    }

    #[test]
    fn test_labels_and_annotations() {
        let mut rule = rule(Duration::ZERO);
        rule.eval(Utc::now(), vector(&["a:1"])).unwrap();

        let alert = rule.active_alerts().next().unwrap();
        let expected: Labels = [("alertname", "InstanceDown"), ("instance", "a:1"), ("severity", "page")]
            .into_iter()
            .collect();
        assert_eq!(alert.labels, expected);
        assert_eq!(alert.annotations.get("summary"), Some("a:1 is down (0)"));
    }

    #[test]
    fn test_pending_alert_deleted_when_absent() {
        let mut rule = rule(Duration::from_secs(300));
        let t0 = Utc::now();
        rule.eval(t0, vector(&["a:1"])).unwrap();
        rule.eval(t0 + minutes(1), vector(&[])).unwrap();
        assert!(states(&rule).is_empty());
    }

    #[test]
    fn test_resolved_alert_sent_and_retained() {
        let mut rule = rule(Duration::ZERO);
        let t0 = Utc::now();

        rule.eval(t0, vector(&["a:1"])).unwrap();
        rule.alerts_to_send(t0, RESEND, INTERVAL);

        let t1 = t0 + minutes(1);
        rule.eval(t1, vector(&[])).unwrap();
        assert_eq!(states(&rule), vec![AlertState::Inactive]);

        // resolution is sent right away, regardless of the resend delay
        let sent = rule.alerts_to_send(t1, Duration::from_secs(3600), INTERVAL);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].resolved_at, Some(t1));

        rule.eval(t1 + minutes(15), vector(&[])).unwrap();
        assert_eq!(states(&rule), vec![AlertState::Inactive]);

        rule.eval(t1 + minutes(16), vector(&[])).unwrap();
        assert!(states(&rule).is_empty());
    }

    #[test]
    fn test_resolved_alert_restarts_pending() {
        let mut rule = rule(Duration::from_secs(300));
        let t0 = Utc::now();

        rule.eval(t0, vector(&["a:1"])).unwrap();
        rule.eval(t0 + minutes(5), vector(&["a:1"])).unwrap();
        rule.eval(t0 + minutes(6), vector(&[])).unwrap();
        rule.eval(t0 + minutes(7), vector(&["a:1"])).unwrap();

        let alert = rule.active_alerts().next().unwrap();
        assert_eq!(alert.state, AlertState::Pending);
        assert_eq!(alert.active_at, t0 + minutes(7));
    }

    #[test]
    fn test_resend_delay_is_honoured() {
        let mut rule = rule(Duration::ZERO);
        let t0 = Utc::now();

        rule.eval(t0, vector(&["a:1"])).unwrap();
        assert_eq!(rule.alerts_to_send(t0, RESEND, INTERVAL).len(), 1);

        let t1 = t0 + chrono::Duration::seconds(30);
        rule.eval(t1, vector(&["a:1"])).unwrap();
        assert!(rule.alerts_to_send(t1, RESEND, INTERVAL).is_empty());

        let t2 = t0 + minutes(1);
        rule.eval(t2, vector(&["a:1"])).unwrap();
        assert_eq!(rule.alerts_to_send(t2, RESEND, INTERVAL).len(), 1);
    }

    #[test]
    fn test_duplicate_labelset_rejected() {
        let mut rule = AlertingRule::new(
            "Down",
            "up == 0",
            Duration::ZERO,
            [("instance", "")].into_iter().collect(),
            Labels::new(),
        );
        let result = rule.eval(Utc::now(), vector(&["a:1", "b:1"]));
        assert!(matches!(result, Err(EvalError::DuplicateLabelset(_))));
    }

    #[test]
    fn test_state_taken_over() {
        let mut old = rule(Duration::ZERO);
        old.eval(Utc::now(), vector(&["a:1"])).unwrap();

        let mut new = rule(Duration::ZERO);
        new.take_state(&mut old);
        assert_eq!(states(&new), vec![AlertState::Firing]);
        assert!(states(&old).is_empty());
    }

    #[test]
    fn test_expand_template() {
        let labels: Labels = [("job", "api")].into_iter().collect();
        assert_eq!(
            expand_template("{{ $labels.job }}/{{ $labels.missing }} = {{ $value }}", &labels, 0.5),
            "api/ = 0.5"
        );
        assert_eq!(expand_template("no templates", &labels, 1.0), "no templates");
    }
}
