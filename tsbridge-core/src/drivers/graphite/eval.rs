//! Local evaluation of flat-file queries.
//!
//! Works in epoch seconds and converts to the query precision at the end.

use crate::aggregation::downsample;
use crate::drivers::{aggregate_series, Series};
use crate::error::{Error, Result};
use crate::query::{Operation, OperationType, Query};
use crate::time::TimePrecision;

/// Parses `"<epoch_seconds> <value>"` lines. Blank and `#` lines are skipped.
pub fn parse_points(body: &str) -> Result<Vec<(i64, f64)>> {
    let mut points = Vec::new();
    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (ts, value) = match (parts.next(), parts.next()) {
            (Some(ts), Some(value)) => (ts, value),
            _ => return Err(Error::Transport(format!("malformed series line '{}'", line))),
        };
        let ts: i64 = ts
            .parse()
            .map_err(|e| Error::Transport(format!("bad timestamp '{}': {}", ts, e)))?;
        let value: f64 = value
            .parse()
            .map_err(|e| Error::Transport(format!("bad value '{}': {}", value, e)))?;
        points.push((ts, value));
    }
    points.sort_by_key(|(ts, _)| *ts);
    Ok(points)
}

/// Non-negative per-second derivative; counter resets are dropped.
fn per_second(points: &[(i64, f64)]) -> Vec<(i64, f64)> {
    points
        .windows(2)
        .filter_map(|pair| {
            let ((t0, v0), (t1, v1)) = (pair[0], pair[1]);
            let dt = t1 - t0;
            (dt > 0 && v1 >= v0).then(|| (t1, (v1 - v0) / dt as f64))
        })
        .collect()
}

fn increase(points: &[(i64, f64)]) -> Vec<(i64, f64)> {
    points
        .windows(2)
        .filter_map(|pair| {
            let ((_, v0), (t1, v1)) = (pair[0], pair[1]);
            (v1 >= v0).then(|| (t1, v1 - v0))
        })
        .collect()
}

/// Runs the query pipeline over raw series read between `start` and `end`
/// (inclusive, epoch seconds).
pub fn evaluate(mut series: Vec<Series>, query: &Query, start: i64, end: i64) -> Vec<Series> {
    for s in &mut series {
        s.points.retain(|(ts, _)| *ts >= start && *ts <= end);
        if let Some(window) = query.downsample() {
            let step = window.step().num_seconds().max(1);
            s.points = downsample(&s.points, step, window.function());
        }
    }

    for op in query.operations() {
        match op {
            Operation::Basic(basic) => {
                for s in &mut series {
                    s.points = match basic.op_type() {
                        OperationType::Increase => increase(&s.points),
                        _ => per_second(&s.points),
                    };
                }
            }
            Operation::Math(math) => {
                for s in &mut series {
                    for point in &mut s.points {
                        point.1 = math.apply(point.1);
                    }
                }
            }
            Operation::Aggregate(agg) => {
                series = aggregate_series(series, agg.function(), agg.by());
            }
            // Rejected at compile time.
            Operation::Histogram(_) | Operation::LabelJoin(_) => {}
        }
    }

    let precision = query.precision();
    for s in &mut series {
        for point in &mut s.points {
            point.0 = TimePrecision::S.convert(point.0, precision);
        }
        if let Some(limit) = query.limit() {
            s.points.truncate(limit);
        }
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateFunction;
    use crate::query::{BasicOperation, MathOperation, MathOperator, MetricIdentifier};
    use crate::time::TimeRange;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn series(points: Vec<(i64, f64)>) -> Series {
        Series {
            name: "requests".to_string(),
            labels: BTreeMap::new(),
            points,
        }
    }

    fn query() -> Query {
        Query::new(
            MetricIdentifier::new("requests").unwrap(),
            TimeRange::last(Duration::hours(1)).unwrap(),
        )
    }

    #[test]
    fn test_parse_points_sorts_and_skips_comments() {
        let points = parse_points("# header\n20 2.5\n\n10 1\n").unwrap();
        assert_eq!(points, vec![(10, 1.0), (20, 2.5)]);
        assert!(parse_points("10\n").is_err());
    }

    #[test]
    fn test_rate_drops_counter_resets() {
        let q = query().with_operation(BasicOperation::rate());
        let out = evaluate(vec![series(vec![(0, 0.0), (10, 50.0), (20, 5.0), (30, 25.0)])], &q, 0, 100);
        assert_eq!(out[0].points, vec![(10, 5.0), (30, 2.0)]);
    }

    #[test]
    fn test_range_downsample_math_and_precision() {
        let q = query()
            .with_downsample(Duration::seconds(10), AggregateFunction::Sum)
            .unwrap()
            .with_operation(MathOperation::new(MathOperator::Mul, 2.0).unwrap())
            .with_precision(TimePrecision::Ms)
            .with_limit(1);
        let raw = series(vec![(5, 100.0), (10, 1.0), (12, 2.0), (20, 4.0)]);
        let out = evaluate(vec![raw], &q, 10, 20);
        assert_eq!(out[0].points, vec![(10_000, 6.0)]);
    }

    #[test]
    fn test_increase() {
        let q = query().with_operation(BasicOperation::increase());
        let out = evaluate(vec![series(vec![(0, 1.0), (10, 4.0)])], &q, 0, 10);
        assert_eq!(out[0].points, vec![(10, 3.0)]);
    }
}
