use crate::aggregation::AggregateFunction;
use crate::drivers::{CompiledQuery, QueryBuilder};
use crate::error::{Error, Result};
use crate::labels::MatchType;
use crate::query::{Downsample, MathOperator, Operation, OperationType, Query};
use crate::time::{ceil_seconds, RangeShape, TimePrecision, TimeRange};
use std::path::PathBuf;

/// Extension of the flat files holding one series each.
pub const EXTENSION: &str = ".dat";

/// Compiled flat-file query.
///
/// `target` is the equivalent graphite render expression; execution reads
/// the files under `directory` and evaluates the same pipeline locally.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphiteQuery {
    pub(crate) path: String,
    pub(crate) directory: PathBuf,
    pub(crate) leaf: String,
    pub(crate) target: String,
    pub(crate) from: String,
    pub(crate) until: String,
    pub(crate) query: Query,
}

impl GraphiteQuery {
    /// Dotted series path including the prefix.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Directory holding the series files, relative to the store root.
    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn until(&self) -> &str {
        &self.until
    }

    pub fn precision(&self) -> TimePrecision {
        self.query.precision()
    }
}

/// Builds graphite targets over a store rooted at `root`.
#[derive(Debug, Clone)]
pub struct GraphiteBuilder {
    prefix: String,
    root: PathBuf,
}

impl GraphiteBuilder {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('.').to_string(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Dotted path of a metric, prefix first.
    pub fn path_of(&self, name: &str) -> Result<String> {
        let path = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        };
        for segment in path.split('.') {
            if segment.is_empty() || segment.contains(['/', ';', '\\']) || segment == ".." {
                return Err(Error::Validation(format!("invalid graphite path '{}'", path)));
            }
        }
        Ok(path)
    }

    /// Parent directory and leaf name of a dotted path.
    pub fn split_path(path: &str) -> (PathBuf, String) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let leaf = segments.pop().unwrap_or_default().to_string();
        (segments.iter().collect(), leaf)
    }
}

/// graphite `from`/`until` pair. Relative ranges stay relative.
pub fn time_bounds(range: &TimeRange) -> Result<(String, String)> {
    Ok(match range.shape()? {
        RangeShape::Absolute { start, end } => (start.timestamp().to_string(), end.timestamp().to_string()),
        RangeShape::Since { start } => (start.timestamp().to_string(), "now".to_string()),
        RangeShape::Trailing { duration } => (format!("-{}s", ceil_seconds(duration)), "now".to_string()),
    })
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "\\'"))
}

fn series_by_tag(path: &str, query: &Query) -> String {
    let mut expressions = vec![quote(&format!("name={}", path))];
    for (label, matcher) in query.effective_filter().iter() {
        let op = match matcher.match_type() {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::RegexMatch => "=~",
            MatchType::RegexNoMatch => "!=~",
        };
        expressions.push(quote(&format!("{}{}{}", label, op, matcher.value())));
    }
    format!("seriesByTag({})", expressions.join(","))
}

fn summarize(inner: String, downsample: Downsample) -> String {
    format!(
        "summarize({},\"{}s\",\"{}\")",
        inner,
        downsample.step().num_seconds(),
        downsample.function().graphite_name()
    )
}

fn wrap(inner: String, op: &Operation, query: &Query) -> Result<String> {
    Ok(match op {
        Operation::Basic(basic) => match basic.op_type() {
            OperationType::Increase => format!("nonNegativeDerivative({})", inner),
            _ => format!("perSecond({})", inner),
        },
        Operation::Math(math) => match math.operator() {
            MathOperator::Add => format!("offset({},{})", inner, math.value()),
            MathOperator::Sub => format!("offset({},{})", inner, -math.value()),
            MathOperator::Mul => format!("scale({},{})", inner, math.value()),
            MathOperator::Div => format!("scale({},{})", inner, 1.0 / math.value()),
        },
        Operation::Aggregate(agg) if agg.by().is_empty() => {
            format!("aggregate({},\"{}\")", inner, agg.function().graphite_name())
        }
        Operation::Aggregate(agg) => {
            let tags: Vec<String> = agg.by().iter().map(|t| format!("\"{}\"", t)).collect();
            format!(
                "groupByTags({},\"{}\",{})",
                inner,
                agg.function().graphite_name(),
                tags.join(",")
            )
        }
        Operation::Histogram(_) | Operation::LabelJoin(_) => {
            return Err(Error::query(
                format!("{:?} has no flat-file evaluation", op.op_type()),
                query,
            ))
        }
    })
}

impl QueryBuilder for GraphiteBuilder {
    fn build(&self, query: &Query) -> Result<CompiledQuery> {
        let path = self
            .path_of(query.metric().name())
            .map_err(|e| Error::query(e.to_string(), query))?;
        let (directory, leaf) = Self::split_path(&path);
        let (from, until) = time_bounds(query.range())?;

        let mut target = series_by_tag(&path, query);
        if let Some(downsample) = query.downsample() {
            target = summarize(target, downsample);
        }
        for op in query.operations() {
            target = wrap(target, op, query)?;
        }

        Ok(CompiledQuery::FlatFile(GraphiteQuery {
            path,
            directory,
            leaf,
            target,
            from,
            until,
            query: query.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LabelFilter, LabelMatcher};
    use crate::query::{AggregateOperation, BasicOperation, MathOperation, MetricIdentifier};
    use chrono::{Duration, TimeZone, Utc};

    fn compiled(builder: &GraphiteBuilder, query: &Query) -> GraphiteQuery {
        match builder.build(query).unwrap() {
            CompiledQuery::FlatFile(q) => q,
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_target_wraps_operations_in_order() {
        let filter = LabelFilter::matching("host", "a")
            .unwrap()
            .with_matcher("dc", LabelMatcher::new(MatchType::RegexMatch, "us-.*").unwrap())
            .unwrap();
        let query = Query::new(
            MetricIdentifier::new("cpu.load").unwrap(),
            TimeRange::last(Duration::hours(1)).unwrap(),
        )
        .with_filter(filter)
        .with_downsample(Duration::minutes(1), AggregateFunction::Avg)
        .unwrap()
        .with_operation(BasicOperation::rate())
        .with_operation(MathOperation::new(MathOperator::Div, 4.0).unwrap())
        .with_operation(AggregateOperation::new(AggregateFunction::Sum, vec!["dc".into()]));

        let q = compiled(&GraphiteBuilder::new("stats", "/srv/graphite"), &query);
        assert_eq!(q.path(), "stats.cpu.load");
        assert_eq!(q.directory(), &PathBuf::from("stats/cpu"));
        assert_eq!(q.from(), "-3600s");
        assert_eq!(q.until(), "now");
        assert_eq!(
            q.target(),
            "groupByTags(scale(perSecond(summarize(seriesByTag('name=stats.cpu.load',\
             'dc=~us-.*','host=a'),\"60s\",\"average\")),0.25),\"sum\",\"dc\")"
        );
    }

    #[test]
    fn test_absolute_bounds_and_empty_prefix() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let query = Query::new(
            MetricIdentifier::new("mem").unwrap(),
            TimeRange::between(at, at).unwrap(),
        );
        let q = compiled(&GraphiteBuilder::new("", "/srv"), &query);
        assert_eq!(q.path(), "mem");
        assert_eq!((q.from(), q.until()), ("1700000000", "1700000000"));
        assert_eq!(q.target(), "seriesByTag('name=mem')");
    }

    #[test]
    fn test_sub_second_window_rounds_up() {
        let query = Query::new(
            MetricIdentifier::new("cpu").unwrap(),
            TimeRange::last(Duration::milliseconds(500)).unwrap(),
        );
        let q = compiled(&GraphiteBuilder::new("stats", "/srv"), &query);
        assert_eq!((q.from(), q.until()), ("-1s", "now"));
    }

    #[test]
    fn test_invalid_path_is_query_error() {
        let query = Query::new(
            MetricIdentifier::new("cpu..load").unwrap(),
            TimeRange::last(Duration::hours(1)).unwrap(),
        );
        let err = GraphiteBuilder::new("stats", "/srv").build(&query).unwrap_err();
        assert_eq!(err.offending_query(), Some(&query));
    }
}
