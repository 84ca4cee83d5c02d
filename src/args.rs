//! Parsers for the compact expressions accepted on the command line.

use crate::error::{ClientError, Result};
use chrono::{DateTime, Duration, Utc};
use tsbridge_core::aggregation::AggregateFunction;
use tsbridge_core::labels::{LabelFilter, LabelMatcher, MatchType};
use tsbridge_core::query::{AggregateOperation, MathOperation, MathOperator};
use tsbridge_core::TimeRange;

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::Argument(message.into())
}

/// `host=a`, `host!=a`, `host=~web-.*`, `host!~db-.*`
pub fn parse_matcher(expr: &str) -> Result<(String, LabelMatcher)> {
    // Longest operators first so `!=` is not read as `=`.
    for (token, match_type) in [
        ("!~", MatchType::RegexNoMatch),
        ("=~", MatchType::RegexMatch),
        ("!=", MatchType::NotEqual),
        ("=", MatchType::Equal),
    ] {
        if let Some((label, value)) = expr.split_once(token) {
            let label = label.trim();
            if label.is_empty() {
                return Err(invalid(format!("missing label name in '{}'", expr)));
            }
            return Ok((label.to_string(), LabelMatcher::new(match_type, value.trim())?));
        }
    }
    Err(invalid(format!("'{}' is not a label matcher", expr)))
}

pub fn parse_filter(exprs: &[String]) -> Result<LabelFilter> {
    exprs.iter().try_fold(LabelFilter::new(), |filter, expr| {
        let (label, matcher) = parse_matcher(expr)?;
        Ok(filter.with_matcher(label, matcher)?)
    })
}

/// `key=value` pairs for metric labels on writes.
pub fn parse_pair(expr: &str) -> Result<(String, String)> {
    expr.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| invalid(format!("'{}' is not a key=value pair", expr)))
}

/// `*2`, `/1024`, `+1.5`, `-3`
pub fn parse_math(expr: &str) -> Result<MathOperation> {
    let expr = expr.trim();
    let mut chars = expr.chars();
    let operator = match chars.next() {
        Some('+') => MathOperator::Add,
        Some('-') => MathOperator::Sub,
        Some('*') => MathOperator::Mul,
        Some('/') => MathOperator::Div,
        _ => return Err(invalid(format!("math expression '{}' must start with + - * or /", expr))),
    };
    let value: f64 = chars
        .as_str()
        .trim()
        .parse()
        .map_err(|e| invalid(format!("bad operand in '{}': {}", expr, e)))?;
    Ok(MathOperation::new(operator, value)?)
}

/// `sum` or `max:host,dc`
pub fn parse_aggregate(expr: &str) -> Result<AggregateOperation> {
    let (function, by) = match expr.split_once(':') {
        Some((function, by)) => (function, by),
        None => (expr, ""),
    };
    let function: AggregateFunction = function.parse()?;
    let by = by
        .split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .collect();
    Ok(AggregateOperation::new(function, by))
}

/// `5m:max` or `30s` (average)
pub fn parse_downsample(expr: &str) -> Result<(Duration, AggregateFunction)> {
    let (step, function) = match expr.split_once(':') {
        Some((step, function)) => (step, function.parse::<AggregateFunction>()?),
        None => (expr, AggregateFunction::Avg),
    };
    Ok((parse_duration(step)?, function))
}

pub fn parse_duration(expr: &str) -> Result<Duration> {
    let std = humantime::parse_duration(expr.trim())
        .map_err(|e| invalid(format!("bad duration '{}': {}", expr, e)))?;
    Duration::from_std(std).map_err(|e| invalid(format!("duration '{}' out of range: {}", expr, e)))
}

pub fn parse_instant(expr: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(expr.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| invalid(format!("bad RFC 3339 timestamp '{}': {}", expr, e)))
}

/// Range from optional `--start`/`--end` instants and a `--last` window.
pub fn parse_range(start: Option<&str>, end: Option<&str>, last: Option<&str>) -> Result<TimeRange> {
    let start = start.map(parse_instant).transpose()?;
    let end = end.map(parse_instant).transpose()?;
    let duration = last.map(parse_duration).transpose()?;

    let range = match (start, end, duration) {
        (None, None, None) => TimeRange::last(Duration::hours(1))?,
        (start, end, duration) => TimeRange::new(start, end, duration)?,
    };
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matchers() {
        let (label, matcher) = parse_matcher("host!=db-1").unwrap();
        assert_eq!(label, "host");
        assert_eq!(matcher.match_type(), MatchType::NotEqual);
        assert_eq!(matcher.value(), "db-1");

        let (_, matcher) = parse_matcher("host=~web-.*").unwrap();
        assert_eq!(matcher.match_type(), MatchType::RegexMatch);
        let (_, matcher) = parse_matcher("host!~web-.*").unwrap();
        assert_eq!(matcher.match_type(), MatchType::RegexNoMatch);

        assert!(parse_matcher("=value").is_err());
        assert!(parse_matcher("host").is_err());
        assert!(parse_matcher("host=~(").is_err());
    }

    #[test]
    fn test_filter_from_many() {
        let filter = parse_filter(&["host=a".to_string(), "dc!~us-.*".to_string()]).unwrap();
        assert_eq!(filter.len(), 2);
        assert!(filter.requires_regex());
    }

    #[test]
    fn test_math_and_aggregate() {
        let op = parse_math("/1024").unwrap();
        assert_eq!(op.operator(), MathOperator::Div);
        assert_eq!(op.value(), 1024.0);
        assert!(parse_math("/0").is_err());
        assert!(parse_math("%2").is_err());

        let agg = parse_aggregate("max:host, dc").unwrap();
        assert_eq!(agg.function(), AggregateFunction::Max);
        assert_eq!(agg.by(), ["host".to_string(), "dc".to_string()]);
        assert!(parse_aggregate("sum").unwrap().by().is_empty());
        assert!(parse_aggregate("median").is_err());
    }

    #[test]
    fn test_downsample_and_ranges() {
        assert_eq!(
            parse_downsample("5m:max").unwrap(),
            (Duration::minutes(5), AggregateFunction::Max)
        );
        assert_eq!(parse_downsample("30s").unwrap().1, AggregateFunction::Avg);

        let range = parse_range(None, None, None).unwrap();
        assert_eq!(range.duration(), Some(Duration::hours(1)));
        let range = parse_range(Some("2023-11-14T22:13:20Z"), None, Some("10m")).unwrap();
        assert_eq!(range.start_bound().map(|s| s.timestamp()), Some(1_700_000_000));
        assert!(parse_range(Some("yesterday"), None, None).is_err());
    }
}
