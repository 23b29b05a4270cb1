//! Remote query backend
//!
//! PromQL expressions are evaluated by a remote backend. The [`MetricsSource`]
//! trait is the seam the rule manager and the readiness probe query through;
//! [`http::PrometheusClient`] implements it against the Prometheus HTTP API.

pub mod http;
pub mod vector;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::Vector;

pub use vector::to_vector;

/// Result type alias for query operations
pub type QueryResultOf<T> = Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("error querying backend: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned an error: {0}")]
    Backend(String),

    #[error("invalid backend response: {0}")]
    Decode(String),

    #[error("expected query result of type vector, actual result type: {actual}")]
    UnexpectedShape { actual: ResultShape },

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// Shape of a backend query result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Vector,
    Scalar,
    Matrix,
    String,
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultShape::Vector => "vector",
            ResultShape::Scalar => "scalar",
            ResultShape::Matrix => "matrix",
            ResultShape::String => "string",
        };
        f.write_str(name)
    }
}

/// One element of an instant vector, as returned by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSample {
    pub metric: BTreeMap<String, String>,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    pub value: f64,
}

/// One series of a range vector
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<(i64, f64)>,
}

/// Decoded backend query result
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Vector(Vec<InstantSample>),
    Scalar { timestamp: i64, value: f64 },
    Matrix(Vec<RangeSeries>),
    String { timestamp: i64, value: String },
}

impl QueryResult {
    pub fn shape(&self) -> ResultShape {
        match self {
            QueryResult::Vector(_) => ResultShape::Vector,
            QueryResult::Scalar { .. } => ResultShape::Scalar,
            QueryResult::Matrix(_) => ResultShape::Matrix,
            QueryResult::String { .. } => ResultShape::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub result: QueryResult,
    pub warnings: Vec<String>,
}

/// A backend able to evaluate an instant query
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(&self, expr: &str, at: DateTime<Utc>) -> QueryResultOf<QueryResponse>;
}

/// Runs `expr` at `at` and converts the result into a [`Vector`]
///
/// Backend warnings are logged, never returned.
pub async fn query_vector(
    source: &dyn MetricsSource,
    expr: &str,
    at: DateTime<Utc>,
) -> QueryResultOf<Vector> {
    let response = source.query(expr, at).await?;
    if !response.warnings.is_empty() {
        warn!(warnings = ?response.warnings, "querying backend returned warnings");
    }
    to_vector(response.result)
}

/// Like [`query_vector`], bounded by `timeout`
pub async fn query_vector_with_timeout(
    source: &dyn MetricsSource,
    expr: &str,
    at: DateTime<Utc>,
    timeout: Duration,
) -> QueryResultOf<Vector> {
    match tokio::time::timeout(timeout, query_vector(source, expr, at)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout(timeout)),
    }
}
