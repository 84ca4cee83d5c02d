use super::command::{RrdCommand, RrdCommandKind, RrdCommandSequence, RrdOutput, FILE_PLACEHOLDER};
use crate::aggregation::AggregateFunction;
use crate::drivers::{CompiledQuery, QueryBuilder};
use crate::error::{Error, Result};
use crate::query::{AggregateOperation, MathOperation, Operation, Query};
use crate::time::{ceil_seconds, RangeShape, TimeRange};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Data source name used when the metric has no field.
pub const DEFAULT_DATA_SOURCE: &str = "value";

/// rrdtool AT-style bounds for a range. Relative ranges stay relative.
pub fn at_bounds(range: &TimeRange) -> Result<(String, String)> {
    Ok(match range.shape()? {
        RangeShape::Absolute { start, end } => (start.timestamp().to_string(), end.timestamp().to_string()),
        RangeShape::Since { start } => (start.timestamp().to_string(), "now".to_string()),
        RangeShape::Trailing { duration } => (format!("end-{}s", ceil_seconds(duration)), "now".to_string()),
    })
}

/// Builds list-then-fetch (or list-then-xport) command sequences.
#[derive(Debug, Clone)]
pub struct RrdBuilder {
    directory: PathBuf,
    enabled: BTreeSet<RrdCommandKind>,
}

impl RrdBuilder {
    pub fn new(directory: impl Into<PathBuf>, enabled: BTreeSet<RrdCommandKind>) -> Self {
        Self {
            directory: directory.into(),
            enabled,
        }
    }

    pub fn with_all_commands(directory: impl Into<PathBuf>) -> Self {
        Self::new(directory, RrdCommandKind::ALL.into_iter().collect())
    }

    pub fn is_enabled(&self, kind: RrdCommandKind) -> bool {
        self.enabled.contains(&kind)
    }

    fn require(&self, kind: RrdCommandKind, query: &Query) -> Result<()> {
        if self.is_enabled(kind) {
            Ok(())
        } else {
            Err(Error::query(format!("rrdtool command '{}' is not enabled", kind), query))
        }
    }

    /// Consolidation function: downsample first, then the aggregate op,
    /// AVERAGE otherwise.
    fn consolidation(query: &Query, aggregate: Option<&AggregateOperation>) -> Result<&'static str> {
        let function = query
            .downsample()
            .map(|d| d.function())
            .or_else(|| aggregate.map(|a| a.function()))
            .unwrap_or(AggregateFunction::Avg);
        function.consolidation_function().ok_or_else(|| {
            Error::query(format!("{} has no rrdtool consolidation function", function), query)
        })
    }

    fn split_operations(query: &Query) -> Result<(Vec<MathOperation>, Option<AggregateOperation>)> {
        let mut math = Vec::new();
        let mut aggregate = None;

        for op in query.operations() {
            match op {
                Operation::Math(m) if aggregate.is_none() => math.push(*m),
                Operation::Aggregate(a) if aggregate.is_none() => aggregate = Some(a.clone()),
                Operation::Math(_) | Operation::Aggregate(_) => {
                    return Err(Error::query("aggregate must be the last rrd operation", query))
                }
                other => {
                    return Err(Error::query(
                        format!("{:?} cannot be expressed with rrdtool", other.op_type()),
                        query,
                    ))
                }
            }
        }
        Ok((math, aggregate))
    }
}

fn rpn(variable: &str, math: &[MathOperation]) -> String {
    let mut expr = variable.to_string();
    for op in math {
        expr.push_str(&format!(",{},{}", op.value(), op.operator().symbol()));
    }
    expr
}

impl QueryBuilder for RrdBuilder {
    fn build(&self, query: &Query) -> Result<CompiledQuery> {
        let (math, aggregate) = Self::split_operations(query)?;
        let cf = Self::consolidation(query, aggregate.as_ref())?;
        let (start, end) = at_bounds(query.range())?;
        let data_source = query.metric().field().unwrap_or(DEFAULT_DATA_SOURCE).to_string();
        let step = query.downsample().map(|d| d.step().num_seconds().max(1));

        self.require(RrdCommandKind::List, query)?;
        let list = RrdCommand::new(
            RrdCommandKind::List,
            vec![self.directory.display().to_string()],
        );

        let (template, output) = if math.is_empty() {
            self.require(RrdCommandKind::Fetch, query)?;
            let mut args = vec![
                FILE_PLACEHOLDER.to_string(),
                cf.to_string(),
                "--start".to_string(),
                start,
                "--end".to_string(),
                end,
            ];
            if let Some(step) = step {
                args.push("--resolution".to_string());
                args.push(step.to_string());
            }
            (
                RrdCommand::new(RrdCommandKind::Fetch, args),
                RrdOutput::Fetch { data_source },
            )
        } else {
            self.require(RrdCommandKind::Xport, query)?;
            let mut args = vec![
                "--json".to_string(),
                "--start".to_string(),
                start,
                "--end".to_string(),
                end,
            ];
            if let Some(step) = step {
                args.push("--step".to_string());
                args.push(step.to_string());
            }
            args.push(format!("DEF:v={}:{}:{}", FILE_PLACEHOLDER, data_source, cf));
            args.push(format!("CDEF:r={}", rpn("v", &math)));
            args.push("XPORT:r".to_string());
            (RrdCommand::new(RrdCommandKind::Xport, args), RrdOutput::Xport)
        };

        Ok(CompiledQuery::RoundRobin(RrdCommandSequence {
            commands: vec![list, template],
            metric: query.metric().name().to_string(),
            filter: query.effective_filter(),
            output,
            aggregate,
            precision: query.precision(),
            limit: query.limit(),
            source: query.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{MathOperator, MetricIdentifier};
    use chrono::{Duration, TimeZone, Utc};

    fn query(range: TimeRange) -> Query {
        Query::new(MetricIdentifier::new("cpu").unwrap(), range)
    }

    fn sequence(builder: &RrdBuilder, query: &Query) -> RrdCommandSequence {
        match builder.build(query).unwrap() {
            CompiledQuery::RoundRobin(seq) => seq,
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_relative_fetch() {
        let builder = RrdBuilder::with_all_commands("/var/rrd");
        let seq = sequence(&builder, &query(TimeRange::last(Duration::hours(1)).unwrap()));
        assert_eq!(
            seq.to_string(),
            "list /var/rrd; fetch {file} AVERAGE --start end-3600s --end now"
        );
        assert_eq!(
            seq.output(),
            &RrdOutput::Fetch { data_source: "value".to_string() }
        );
    }

    #[test]
    fn test_sub_second_window_rounds_up() {
        let range = TimeRange::last(Duration::milliseconds(500)).unwrap();
        assert_eq!(range.is_empty(), Some(false));
        assert_eq!(at_bounds(&range).unwrap(), ("end-1s".to_string(), "now".to_string()));

        let range = TimeRange::last(Duration::milliseconds(90_250)).unwrap();
        assert_eq!(at_bounds(&range).unwrap().0, "end-91s");
    }

    #[test]
    fn test_math_uses_xport_with_rpn() {
        let range = TimeRange::between(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            Utc.timestamp_opt(1_700_003_600, 0).unwrap(),
        )
        .unwrap();
        let q = query(range)
            .with_downsample(Duration::minutes(5), AggregateFunction::Max)
            .unwrap()
            .with_operation(MathOperation::new(MathOperator::Mul, 8.0).unwrap())
            .with_operation(MathOperation::new(MathOperator::Add, 1.5).unwrap());
        let seq = sequence(&RrdBuilder::with_all_commands("/data"), &q);
        assert_eq!(
            seq.commands()[1].to_string(),
            "xport --json --start 1700000000 --end 1700003600 --step 300 \
             DEF:v={file}:value:MAX CDEF:r=v,8,*,1.5,+ XPORT:r"
        );
    }

    #[test]
    fn test_sum_has_no_consolidation_function() {
        let q = query(TimeRange::last(Duration::hours(1)).unwrap())
            .with_operation(AggregateOperation::new(AggregateFunction::Sum, vec![]));
        let err = RrdBuilder::with_all_commands("/data").build(&q).unwrap_err();
        assert_eq!(err.offending_query(), Some(&q));
    }

    #[test]
    fn test_disabled_command_is_query_error() {
        let enabled = [RrdCommandKind::List, RrdCommandKind::Xport].into_iter().collect();
        let q = query(TimeRange::last(Duration::hours(1)).unwrap());
        let err = RrdBuilder::new("/data", enabled).build(&q).unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
        assert!(err.to_string().contains("fetch"));
    }

    #[test]
    fn test_identical_queries_compile_identically() {
        let builder = RrdBuilder::with_all_commands("/data");
        let q = query(TimeRange::last(Duration::minutes(10)).unwrap());
        assert_eq!(builder.build(&q).unwrap(), builder.build(&q).unwrap());
    }
}
