//! Flux query builder and annotated-CSV response parser.

use crate::drivers::{CompiledQuery, QueryBuilder, Series};
use crate::error::{Error, Result};
use crate::labels::MatchType;
use crate::query::{Operation, OperationType, Query};
use crate::time::{RangeShape, TimePrecision};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// Compiled Flux program plus the precision results are reported in.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxQuery {
    flux: String,
    precision: TimePrecision,
    measurement: String,
    source: Query,
}

impl FluxQuery {
    pub fn flux(&self) -> &str {
        &self.flux
    }

    pub fn precision(&self) -> TimePrecision {
        self.precision
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn source(&self) -> &Query {
        &self.source
    }
}

/// Builds Flux pipelines against one bucket.
#[derive(Debug, Clone)]
pub struct FluxBuilder {
    bucket: String,
}

impl FluxBuilder {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    fn range_clause(query: &Query) -> Result<String> {
        Ok(match query.range().shape()? {
            RangeShape::Absolute { start, end } => {
                format!("range(start: {}, stop: {})", rfc3339(start), rfc3339(end))
            }
            RangeShape::Since { start } => format!("range(start: {})", rfc3339(start)),
            RangeShape::Trailing { duration } => format!("range(start: -{})", flux_duration(duration)),
        })
    }

    fn label_predicate(query: &Query) -> Option<String> {
        let filter = query.effective_filter();
        if filter.is_empty() {
            return None;
        }

        let clauses: Vec<String> = filter
            .iter()
            .map(|(name, matcher)| {
                let column = format!("r[{}]", string_literal(name));
                match matcher.match_type() {
                    MatchType::Equal => format!("{} == {}", column, string_literal(matcher.value())),
                    MatchType::NotEqual => format!("{} != {}", column, string_literal(matcher.value())),
                    MatchType::RegexMatch => format!("{} =~ {}", column, regex_literal(matcher.value())),
                    MatchType::RegexNoMatch => format!("{} !~ {}", column, regex_literal(matcher.value())),
                }
            })
            .collect();

        Some(clauses.join(" and "))
    }

    fn operation_stage(op: &Operation, query: &Query) -> Result<String> {
        Ok(match op {
            Operation::Basic(basic) => match basic.op_type() {
                OperationType::Increase => "difference(nonNegative: true)".to_string(),
                _ => "derivative(unit: 1s, nonNegative: true)".to_string(),
            },
            Operation::Math(math) => format!(
                "map(fn: (r) => ({{ r with _value: r._value {} {} }}))",
                math.operator().symbol(),
                float_literal(math.value())
            ),
            Operation::Aggregate(agg) => {
                let mut keys = vec![string_literal("_time")];
                keys.extend(agg.by().iter().map(|l| string_literal(l)));
                let by: Vec<String> = agg.by().iter().map(|l| string_literal(l)).collect();
                format!(
                    "group(columns: [{}])\n  |> {}()\n  |> group(columns: [{}])",
                    keys.join(", "),
                    agg.function().to_flux(),
                    by.join(", ")
                )
            }
            Operation::Histogram(hist) => {
                format!("histogramQuantile(quantile: {})", float_literal(hist.quantile()))
            }
            Operation::LabelJoin(_) => {
                return Err(Error::query("label join has no Flux equivalent", query))
            }
        })
    }
}

impl QueryBuilder for FluxBuilder {
    fn build(&self, query: &Query) -> Result<CompiledQuery> {
        let mut flux = format!("from(bucket: {})", string_literal(&self.bucket));
        let mut stage = |text: &str| {
            flux.push_str("\n  |> ");
            flux.push_str(text);
        };

        stage(&Self::range_clause(query)?);
        stage(&format!(
            "filter(fn: (r) => r._measurement == {})",
            string_literal(query.metric().name())
        ));
        if let Some(field) = query.metric().field() {
            stage(&format!("filter(fn: (r) => r._field == {})", string_literal(field)));
        }
        if let Some(predicate) = Self::label_predicate(query) {
            stage(&format!("filter(fn: (r) => {})", predicate));
        }
        if let Some(downsample) = query.downsample() {
            stage(&format!(
                "aggregateWindow(every: {}, fn: {}, createEmpty: false)",
                flux_duration(downsample.step()),
                downsample.function().to_flux()
            ));
        }
        for op in query.operations() {
            stage(&Self::operation_stage(op, query)?);
        }
        if let Some(limit) = query.limit() {
            stage(&format!("limit(n: {})", limit));
        }

        Ok(CompiledQuery::LineProtocol(FluxQuery {
            flux,
            precision: query.precision(),
            measurement: query.metric().name().to_string(),
            source: query.clone(),
        }))
    }
}

fn rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Whole seconds when possible, nanoseconds otherwise.
fn flux_duration(duration: Duration) -> String {
    match duration.num_nanoseconds() {
        Some(ns) if ns % 1_000_000_000 != 0 => format!("{}ns", ns),
        _ => format!("{}s", duration.num_seconds()),
    }
}

fn string_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn regex_literal(pattern: &str) -> String {
    format!("/{}/", pattern.replace('/', "\\/"))
}

/// Flux distinguishes ints from floats, so always emit a decimal point.
fn float_literal(value: f64) -> String {
    let text = value.to_string();
    if text.contains('.') {
        text
    } else {
        format!("{}.0", text)
    }
}

/// Splits one CSV line, honouring double-quoted cells.
fn split_csv(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    cells.push(current);
    cells
}

const RESERVED_COLUMNS: [&str; 5] = ["", "result", "table", "_start", "_stop"];

/// Parses the annotated CSV Flux returns into one series per table.
///
/// `default_name` names series whose `_measurement` column was dropped by
/// the pipeline (for example after a cross-series aggregate).
pub fn parse_csv(body: &str, precision: TimePrecision, default_name: &str) -> Result<Vec<Series>> {
    let mut header: Option<Vec<String>> = None;
    let mut order: Vec<String> = Vec::new();
    let mut series: HashMap<String, Series> = HashMap::new();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let cells = split_csv(line);
        let columns = match &header {
            None => {
                header = Some(cells);
                continue;
            }
            Some(columns) => columns,
        };

        let row: HashMap<&str, &str> = columns
            .iter()
            .map(String::as_str)
            .zip(cells.iter().map(String::as_str))
            .collect();

        if let Some(message) = row.get("error").filter(|m| !m.is_empty()) {
            return Err(Error::Transport(format!("flux error: {}", message)));
        }

        let value = match row.get("_value").filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|e| Error::Transport(format!("bad _value '{}': {}", raw, e)))?,
            None => continue,
        };
        let time = match row.get("_time").filter(|t| !t.is_empty()) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| Error::Transport(format!("bad _time '{}': {}", raw, e)))?
                .with_timezone(&Utc),
            None => continue,
        };

        let mut name = row
            .get("_measurement")
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string())
            .unwrap_or_else(|| default_name.to_string());
        if let Some(field) = row.get("_field").filter(|f| !f.is_empty()) {
            let _ = write!(name, ".{}", field);
        }

        let labels: BTreeMap<String, String> = row
            .iter()
            .filter(|(column, _)| !RESERVED_COLUMNS.contains(*column) && !column.starts_with('_'))
            .map(|(column, value)| (column.to_string(), value.to_string()))
            .collect();

        let key = format!(
            "{}|{}|{}",
            row.get("result").copied().unwrap_or(""),
            row.get("table").copied().unwrap_or(""),
            name
        );
        let entry = series.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Series::new(name, labels)
        });
        entry.points.push((precision.timestamp(time), value));
    }

    Ok(order
        .into_iter()
        .filter_map(|key| series.remove(&key))
        .map(|mut s| {
            s.points.sort_by_key(|(ts, _)| *ts);
            s
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateFunction;
    use crate::labels::{LabelFilter, LabelMatcher};
    use crate::query::{
        AggregateOperation, BasicOperation, LabelJoinOperation, MathOperation, MathOperator,
        MetricIdentifier,
    };
    use crate::time::TimeRange;
    use chrono::TimeZone;

    fn flux_of(query: &Query) -> String {
        match FluxBuilder::new("metrics").build(query).unwrap() {
            CompiledQuery::LineProtocol(q) => q.flux().to_string(),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_absolute_range_with_filters_and_ops() {
        let range = TimeRange::between(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            Utc.timestamp_opt(1_700_003_600, 0).unwrap(),
        )
        .unwrap();
        let filter = LabelFilter::matching("host", "a")
            .unwrap()
            .with_matcher("dc", LabelMatcher::new(MatchType::RegexNoMatch, "us-.*").unwrap())
            .unwrap();
        let query = Query::new(MetricIdentifier::new("cpu").unwrap().with_field("usage"), range)
            .with_filter(filter)
            .with_operation(BasicOperation::rate())
            .with_operation(MathOperation::new(MathOperator::Mul, 100.0).unwrap())
            .with_limit(10);

        let expected = "from(bucket: \"metrics\")\n  \
            |> range(start: 2023-11-14T22:13:20Z, stop: 2023-11-14T23:13:20Z)\n  \
            |> filter(fn: (r) => r._measurement == \"cpu\")\n  \
            |> filter(fn: (r) => r._field == \"usage\")\n  \
            |> filter(fn: (r) => r[\"dc\"] !~ /us-.*/ and r[\"host\"] == \"a\")\n  \
            |> derivative(unit: 1s, nonNegative: true)\n  \
            |> map(fn: (r) => ({ r with _value: r._value * 100.0 }))\n  \
            |> limit(n: 10)";
        assert_eq!(flux_of(&query), expected);
    }

    #[test]
    fn test_relative_range_is_clock_free() {
        let query = Query::new(
            MetricIdentifier::new("mem").unwrap(),
            TimeRange::last(Duration::minutes(90)).unwrap(),
        );
        let first = flux_of(&query);
        assert!(first.contains("range(start: -5400s)"));
        assert_eq!(first, flux_of(&query));
    }

    #[test]
    fn test_aggregate_and_downsample() {
        let query = Query::new(
            MetricIdentifier::new("mem").unwrap(),
            TimeRange::last(Duration::hours(1)).unwrap(),
        )
        .with_downsample(Duration::minutes(1), AggregateFunction::Max)
        .unwrap()
        .with_operation(AggregateOperation::new(AggregateFunction::Sum, vec!["host".into()]));
        let flux = flux_of(&query);
        assert!(flux.contains("aggregateWindow(every: 60s, fn: max, createEmpty: false)"));
        assert!(flux.contains("group(columns: [\"_time\", \"host\"])\n  |> sum()\n  |> group(columns: [\"host\"])"));
    }

    #[test]
    fn test_label_join_is_a_query_error() {
        let query = Query::new(
            MetricIdentifier::new("mem").unwrap(),
            TimeRange::last(Duration::hours(1)).unwrap(),
        )
        .with_operation(LabelJoinOperation::new("id", "-", vec!["host".into()]).unwrap());
        let err = FluxBuilder::new("b").build(&query).unwrap_err();
        assert_eq!(err.offending_query(), Some(&query));
    }

    #[test]
    fn test_parse_annotated_csv() {
        let body = "#group,false,false,true,true,false,false,true,true,true\r\n\
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,double,string,string,string\r\n\
#default,_result,,,,,,,,\r\n\
,result,table,_start,_stop,_time,_value,_field,_measurement,host\r\n\
,,0,2023-11-14T22:00:00Z,2023-11-14T23:00:00Z,2023-11-14T22:13:21Z,2.5,usage,cpu,b\r\n\
,,0,2023-11-14T22:00:00Z,2023-11-14T23:00:00Z,2023-11-14T22:13:20Z,1.5,usage,cpu,b\r\n\
,,1,2023-11-14T22:00:00Z,2023-11-14T23:00:00Z,2023-11-14T22:13:20Z,7,usage,cpu,a\r\n\
\r\n";
        let series = parse_csv(body, TimePrecision::Ms, "cpu").unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].name, "cpu.usage");
        assert_eq!(series[0].labels.get("host").map(String::as_str), Some("b"));
        assert_eq!(
            series[0].points,
            vec![(1_700_000_000_000, 1.5), (1_700_000_001_000, 2.5)]
        );
        assert_eq!(series[1].points, vec![(1_700_000_000_000, 7.0)]);
    }

    #[test]
    fn test_parse_error_table() {
        let body = ",error,reference\r\n,\"bucket \"\"x\"\" not found\",\r\n";
        let err = parse_csv(body, TimePrecision::S, "cpu").unwrap_err();
        assert!(err.to_string().contains("bucket \"x\" not found"));
    }

    #[test]
    fn test_float_literal() {
        assert_eq!(float_literal(2.0), "2.0");
        assert_eq!(float_literal(-0.5), "-0.5");
    }
}
