//! Aggregate functions and fixed-window bucketing.
//!
//! Backends that aggregate natively get the function's name in their own
//! dialect (`to_flux`, `consolidation_function`, `graphite_name`). Backends
//! that aggregate in-process use [`AggregateFunction::apply`] and
//! [`downsample`].

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::Error;

/// Aggregation functions that can be applied to time-series data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    /// Count the number of values
    Count,
    /// Sum all values
    Sum,
    /// Calculate the average
    Avg,
    /// Find the minimum value
    Min,
    /// Find the maximum value
    Max,
    /// Keep the most recent value
    Last,
}

impl Display for AggregateFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateFunction::Count => write!(f, "COUNT"),
            AggregateFunction::Sum => write!(f, "SUM"),
            AggregateFunction::Avg => write!(f, "AVG"),
            AggregateFunction::Min => write!(f, "MIN"),
            AggregateFunction::Max => write!(f, "MAX"),
            AggregateFunction::Last => write!(f, "LAST"),
        }
    }
}

impl FromStr for AggregateFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(AggregateFunction::Count),
            "sum" => Ok(AggregateFunction::Sum),
            "avg" | "mean" | "average" => Ok(AggregateFunction::Avg),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "last" => Ok(AggregateFunction::Last),
            other => Err(Error::Validation(format!("unknown aggregate function '{}'", other))),
        }
    }
}

impl AggregateFunction {
    /// Flux function name
    pub fn to_flux(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "mean",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Last => "last",
        }
    }

    /// RRD consolidation function. Round-robin archives only keep
    /// AVERAGE, MIN, MAX and LAST, so sums and counts have none.
    pub fn consolidation_function(&self) -> Option<&'static str> {
        match self {
            AggregateFunction::Avg => Some("AVERAGE"),
            AggregateFunction::Min => Some("MIN"),
            AggregateFunction::Max => Some("MAX"),
            AggregateFunction::Last => Some("LAST"),
            AggregateFunction::Sum | AggregateFunction::Count => None,
        }
    }

    /// Graphite aggregation method name
    pub fn graphite_name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "average",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Last => "last",
        }
    }

    /// Applies the function to a slice of values in arrival order.
    /// Returns `None` for an empty slice.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }

        match self {
            AggregateFunction::Sum => Some(values.iter().sum()),
            AggregateFunction::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
            AggregateFunction::Min => Some(values.iter().copied().fold(f64::INFINITY, f64::min)),
            AggregateFunction::Max => {
                Some(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            }
            AggregateFunction::Count => Some(values.len() as f64),
            AggregateFunction::Last => values.last().copied(),
        }
    }
}

/// Start of the fixed window of size `step` containing `timestamp`.
/// Both are in the same unit; `step` must be positive.
pub fn window_start(timestamp: i64, step: i64) -> i64 {
    timestamp.div_euclid(step) * step
}

/// Buckets `points` into fixed windows of `step` and aggregates each bucket.
/// Points must be sorted by timestamp; the output carries window starts.
pub fn downsample(points: &[(i64, f64)], step: i64, function: AggregateFunction) -> Vec<(i64, f64)> {
    if step <= 0 {
        return points.to_vec();
    }

    let mut out = Vec::new();
    let mut current: Option<i64> = None;
    let mut bucket = Vec::new();

    for &(ts, value) in points {
        let start = window_start(ts, step);
        if current != Some(start) {
            if let Some(prev) = current {
                if let Some(v) = function.apply(&bucket) {
                    out.push((prev, v));
                }
            }
            bucket.clear();
            current = Some(start);
        }
        bucket.push(value);
    }
    if let Some(prev) = current {
        if let Some(v) = function.apply(&bucket) {
            out.push((prev, v));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_functions() {
        let values = [4.0, 1.0, 3.0];
        assert_eq!(AggregateFunction::Sum.apply(&values), Some(8.0));
        assert_eq!(AggregateFunction::Min.apply(&values), Some(1.0));
        assert_eq!(AggregateFunction::Max.apply(&values), Some(4.0));
        assert_eq!(AggregateFunction::Count.apply(&values), Some(3.0));
        assert_eq!(AggregateFunction::Last.apply(&values), Some(3.0));
        assert_eq!(AggregateFunction::Avg.apply(&[]), None);
    }

    #[test]
    fn test_downsample_buckets() {
        let points = [(0, 1.0), (30, 3.0), (60, 10.0), (130, 5.0)];
        let out = downsample(&points, 60, AggregateFunction::Avg);
        assert_eq!(out, vec![(0, 2.0), (60, 10.0), (120, 5.0)]);
    }

    #[test]
    fn test_window_start_negative() {
        assert_eq!(window_start(-1, 60), -60);
        assert_eq!(window_start(59, 60), 0);
    }

    #[test]
    fn test_consolidation_functions() {
        assert_eq!(AggregateFunction::Avg.consolidation_function(), Some("AVERAGE"));
        assert_eq!(AggregateFunction::Sum.consolidation_function(), None);
        assert_eq!("mean".parse::<AggregateFunction>().unwrap(), AggregateFunction::Avg);
    }
}
