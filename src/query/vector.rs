//! Conversion of backend results into rule engine vectors

use crate::{Labels, Sample, Vector};

use super::{QueryError, QueryResult, QueryResultOf};

/// Converts a backend result into a [`Vector`]
///
/// Only vector results are accepted. Every label of every sample is kept, the
/// sample order is preserved, and timestamps and values are passed through
/// unchanged.
pub fn to_vector(result: QueryResult) -> QueryResultOf<Vector> {
    let samples = match result {
        QueryResult::Vector(samples) => samples,
        other => {
            return Err(QueryError::UnexpectedShape {
                actual: other.shape(),
            });
        }
    };

    Ok(samples
        .into_iter()
        .map(|sample| Sample {
            metric: Labels::from(sample.metric),
            timestamp: sample.timestamp,
            value: sample.value,
        })
        .collect())
}
