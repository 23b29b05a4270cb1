//! Recording rules

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::EvalError;
use crate::{Labels, METRIC_NAME, Sample, Vector};

/// Stores the result of an expression as a new series named `name`
#[derive(Debug, Clone)]
pub struct RecordingRule {
    name: String,
    expr: String,
    labels: Labels,
}

impl RecordingRule {
    pub fn new(name: impl Into<String>, expr: impl Into<String>, labels: Labels) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
            labels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Turns the query result at `ts` into the samples to store
    ///
    /// The metric name is replaced, rule labels override sample labels (an
    /// empty rule label value removes the label) and external labels are added
    /// where absent.
    pub fn eval(
        &self,
        ts: DateTime<Utc>,
        vector: Vector,
        external_labels: &Labels,
    ) -> Result<Vec<Sample>, EvalError> {
        let timestamp = ts.timestamp_millis();
        let mut seen = BTreeSet::new();
        let mut samples = Vec::with_capacity(vector.len());

        for sample in vector {
            let mut metric = sample.metric;
            metric.set(METRIC_NAME, self.name.as_str());
            for label in self.labels.iter() {
                if label.value.is_empty() {
                    metric.remove(&label.name);
                } else {
                    metric.set(label.name.as_str(), label.value.as_str());
                }
            }
            metric.merge_missing(external_labels);

            if !seen.insert(metric.clone()) {
                return Err(EvalError::DuplicateLabelset(metric));
            }

            samples.push(Sample {
                metric,
                timestamp,
                value: sample.value,
            });
        }

        Ok(samples)
    }
}
