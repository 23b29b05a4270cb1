//! Prometheus HTTP API client
//!
//! Queries `GET <base>/api/v1/query` and decodes the JSON envelope into a
//! [`QueryResult`]. Sample timestamps arrive as fractional Unix seconds and are
//! stored as milliseconds.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{instrument, trace};
use url::Url;

use super::{
    InstantSample, MetricsSource, QueryError, QueryResponse, QueryResult, QueryResultOf,
    RangeSeries,
};

/// Envelope of every Prometheus API response
#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    data: Option<ApiData>,
    error: Option<String>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Vector(Vec<ApiInstant>),
    Matrix(Vec<ApiRange>),
    Scalar((f64, String)),
    String((f64, String)),
}

#[derive(Debug, Deserialize)]
struct ApiInstant {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

#[derive(Debug, Deserialize)]
struct ApiRange {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

fn to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

fn parse_value(value: &str) -> QueryResultOf<f64> {
    value
        .parse::<f64>()
        .map_err(|e| QueryError::Decode(format!("invalid sample value {value:?}: {e}")))
}

impl ApiData {
    fn into_result(self) -> QueryResultOf<QueryResult> {
        Ok(match self {
            ApiData::Vector(samples) => QueryResult::Vector(
                samples
                    .into_iter()
                    .map(|s| {
                        Ok(InstantSample {
                            metric: s.metric,
                            timestamp: to_millis(s.value.0),
                            value: parse_value(&s.value.1)?,
                        })
                    })
                    .collect::<QueryResultOf<_>>()?,
            ),
            ApiData::Matrix(series) => QueryResult::Matrix(
                series
                    .into_iter()
                    .map(|s| {
                        let values = s
                            .values
                            .iter()
                            .map(|(t, v)| Ok((to_millis(*t), parse_value(v)?)))
                            .collect::<QueryResultOf<_>>()?;
                        Ok(RangeSeries {
                            metric: s.metric,
                            values,
                        })
                    })
                    .collect::<QueryResultOf<_>>()?,
            ),
            ApiData::Scalar((t, v)) => QueryResult::Scalar {
                timestamp: to_millis(t),
                value: parse_value(&v)?,
            },
            ApiData::String((t, v)) => QueryResult::String {
                timestamp: to_millis(t),
                value: v,
            },
        })
    }
}

/// Client for the Prometheus-compatible query endpoint at `base_url`
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base_url: Url,
    client: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build HTTP client")?;
        Self::with_client(base_url, client)
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid query target URL {base_url:?}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { base_url, client })
    }

    fn query_url(&self) -> QueryResultOf<Url> {
        self.base_url
            .join("api/v1/query")
            .map_err(|e| QueryError::Decode(format!("invalid query URL: {e}")))
    }
}

#[async_trait]
impl MetricsSource for PrometheusClient {
    #[instrument(skip(self), fields(backend = %self.base_url))]
    async fn query(&self, expr: &str, at: DateTime<Utc>) -> QueryResultOf<QueryResponse> {
        let time = format!("{:.3}", at.timestamp_millis() as f64 / 1000.0);
        let response = self
            .client
            .get(self.query_url()?)
            .query(&[("query", expr), ("time", time.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        trace!(%status, "received query response");

        // Error responses still carry the JSON envelope; fall back to the raw
        // body when they do not.
        let envelope: ApiResponse = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(QueryError::Backend(format!("HTTP {status}: {body}")));
            }
            Err(e) => return Err(QueryError::Decode(e.to_string())),
        };

        if envelope.status != "success" {
            let kind = envelope.error_type.unwrap_or_else(|| "unknown".to_string());
            let message = envelope.error.unwrap_or_else(|| format!("HTTP {status}"));
            return Err(QueryError::Backend(format!("{kind}: {message}")));
        }

        let data = envelope
            .data
            .ok_or_else(|| QueryError::Decode("missing data field".to_string()))?;

        Ok(QueryResponse {
            result: data.into_result()?,
            warnings: envelope.warnings,
        })
    }
}
