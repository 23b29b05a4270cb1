//! Translation of rule engine alerts into notification alerts

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::Labels;

/// An alert as tracked by the rule engine
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub labels: Labels,
    pub annotations: Labels,
    pub fired_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,

    /// Expiry of the current evaluation; the notification auto-resolves at
    /// this point unless refreshed.
    pub valid_until: DateTime<Utc>,
}

/// An alert in the Alertmanager v2 API shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAlert {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub labels: Labels,
    pub annotations: Labels,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
}

/// Receiver of translated alert batches
pub trait AlertSink: Send + Sync {
    fn send(&self, alerts: Vec<NotificationAlert>);
}

/// Relative link to the expression browser showing `expr` in table view
pub fn table_link_for_expression(expr: &str) -> String {
    let escaped: String = url::form_urlencoded::byte_serialize(expr.as_bytes()).collect();
    format!("/graph?g0.expr={escaped}&g0.tab=1")
}

pub fn to_notification(alert: &AlertRecord, expr: &str, external_url: &str) -> NotificationAlert {
    NotificationAlert {
        starts_at: alert.fired_at,
        ends_at: alert.resolved_at.unwrap_or(alert.valid_until),
        labels: alert.labels.clone(),
        annotations: alert.annotations.clone(),
        generator_url: format!("{external_url}{}", table_link_for_expression(expr)),
    }
}

/// Bridges the rule engine's notify hook to an [`AlertSink`]
#[derive(Clone)]
pub struct AlertSender {
    sink: Arc<dyn AlertSink>,
    external_url: String,
}

impl AlertSender {
    pub fn new(sink: Arc<dyn AlertSink>, external_url: impl Into<String>) -> Self {
        Self {
            sink,
            external_url: external_url.into(),
        }
    }

    /// Translates and forwards `alerts`; an empty batch is not forwarded
    pub fn send(&self, expr: &str, alerts: &[AlertRecord]) {
        if alerts.is_empty() {
            return;
        }

        let batch: Vec<_> = alerts
            .iter()
            .map(|alert| to_notification(alert, expr, &self.external_url))
            .collect();

        trace!("forwarding {} alerts for {expr}", batch.len());
        self.sink.send(batch);
    }
}
