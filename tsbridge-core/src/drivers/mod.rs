//! Backend drivers.
//!
//! This module provides the driver contract and four implementations:
//! - `influxdb`: HTTP line-protocol store, queried with Flux
//! - `rrd`: round-robin database files, driven through `rrdtool` commands
//! - `graphite`: dotted metric paths stored as flat files, evaluated in-process
//! - `null`: no backend at all; the conformance reference
//!
//! Each driver composes a fixed [`Capabilities`] value, a [`QueryBuilder`]
//! and a [`ConnectionAdapter`](crate::connection::ConnectionAdapter).

pub mod graphite;
pub mod influxdb;
pub mod null;
pub mod rrd;

use crate::aggregation::AggregateFunction;
use crate::capabilities::{Capabilities, Capability};
use crate::connection::CommandResponse;
use crate::error::{Error, Result};
use crate::query::{MetricIdentifier, Query};
use crate::time::TimeRange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::debug;

use self::graphite::GraphiteQuery;
use self::influxdb::FluxQuery;
use self::rrd::RrdCommandSequence;

/// Driver-specific executable form of a query. Only the driver that
/// produced a variant knows how to run it.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledQuery {
    LineProtocol(FluxQuery),
    RoundRobin(RrdCommandSequence),
    FlatFile(GraphiteQuery),
    Noop(Box<Query>),
}

impl CompiledQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            CompiledQuery::LineProtocol(_) => "line-protocol",
            CompiledQuery::RoundRobin(_) => "round-robin",
            CompiledQuery::FlatFile(_) => "flat-file",
            CompiledQuery::Noop(_) => "noop",
        }
    }

    /// The query this was compiled from.
    pub fn source(&self) -> &Query {
        match self {
            CompiledQuery::LineProtocol(q) => q.source(),
            CompiledQuery::RoundRobin(q) => q.source(),
            CompiledQuery::FlatFile(q) => &q.query,
            CompiledQuery::Noop(query) => query,
        }
    }

    /// Backend text of the query, for logs and diagnostics.
    pub fn raw(&self) -> String {
        match self {
            CompiledQuery::LineProtocol(q) => q.flux().to_string(),
            CompiledQuery::RoundRobin(q) => q.to_string(),
            CompiledQuery::FlatFile(q) => q.target().to_string(),
            CompiledQuery::Noop(_) => String::new(),
        }
    }
}

/// Turns a [`Query`] into a [`CompiledQuery`]. Implementations are pure:
/// equal queries compile to equal output.
pub trait QueryBuilder: Send + Sync {
    fn build(&self, query: &Query) -> Result<CompiledQuery>;
}

/// Capability gate followed by the builder. All or nothing.
pub fn compile_with<B>(capabilities: &Capabilities, builder: &B, query: &Query) -> Result<CompiledQuery>
where
    B: QueryBuilder + ?Sized,
{
    capabilities.check(query)?;
    let compiled = builder.build(query)?;
    debug!(kind = compiled.kind(), raw = %compiled.raw(), "compiled query");
    Ok(compiled)
}

pub(crate) fn wrong_variant(driver: &str, compiled: &CompiledQuery) -> Error {
    Error::query(
        format!("{} driver cannot execute a {} query", driver, compiled.kind()),
        compiled.source(),
    )
}

/// One series in a result. Timestamps use the query's precision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(i64, f64)>,
}

impl Series {
    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            labels,
            points: Vec::new(),
        }
    }
}

/// Combines series point-wise per group of `by` label values. Output series
/// keep only the grouping labels.
pub fn aggregate_series(series: Vec<Series>, function: AggregateFunction, by: &[String]) -> Vec<Series> {
    let mut groups: BTreeMap<Vec<String>, (Series, BTreeMap<i64, Vec<f64>>)> = BTreeMap::new();

    for s in series {
        let key: Vec<String> = by
            .iter()
            .map(|label| s.labels.get(label).cloned().unwrap_or_default())
            .collect();
        let (_, buckets) = groups.entry(key.clone()).or_insert_with(|| {
            let labels = by.iter().cloned().zip(key).filter(|(_, v)| !v.is_empty()).collect();
            (Series::new(s.name.clone(), labels), BTreeMap::new())
        });
        for (ts, value) in s.points {
            buckets.entry(ts).or_default().push(value);
        }
    }

    groups
        .into_values()
        .map(|(mut out, buckets)| {
            out.points = buckets
                .into_iter()
                .filter_map(|(ts, values)| function.apply(&values).map(|v| (ts, v)))
                .collect();
            out
        })
        .collect()
}

/// Normalized driver answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    series: Vec<Series>,
    error: Option<String>,
    metadata: HashMap<String, Value>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_series(series: Vec<Series>, metadata: HashMap<String, Value>) -> Self {
        Self {
            series,
            error: None,
            metadata,
        }
    }

    pub fn failed(error: impl Into<String>, metadata: HashMap<String, Value>) -> Self {
        Self {
            series: Vec::new(),
            error: Some(error.into()),
            metadata,
        }
    }

    /// Maps an adapter response, parsing the payload on success. A payload
    /// that does not parse turns into a failed result, not an error.
    pub fn from_response<F>(response: CommandResponse, parse: F) -> Self
    where
        F: FnOnce(&str) -> Result<Vec<Series>>,
    {
        let metadata = response.metadata().clone();
        match response.error() {
            Some(error) => Self::failed(error, metadata),
            None => match parse(response.data()) {
                Ok(series) => Self::from_series(series, metadata),
                Err(e) => Self::failed(e.to_string(), metadata),
            },
        }
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn into_series(self) -> Vec<Series> {
        self.series
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn has_data(&self) -> bool {
        self.series.iter().any(|s| !s.points.is_empty())
    }
}

/// A single value to write.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub metric: MetricIdentifier,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    pub fn new(metric: MetricIdentifier, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            metric,
            value,
            timestamp,
        }
    }
}

/// One plotted line of a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphLine {
    pub metric: MetricIdentifier,
    pub legend: String,
    pub color: String,
    pub function: AggregateFunction,
}

/// Rendering request for drivers that declare `supportsGraph`.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRequest {
    pub output: PathBuf,
    pub range: TimeRange,
    pub title: String,
    pub vertical_label: String,
    pub width: u32,
    pub height: u32,
    pub lines: Vec<GraphLine>,
}

/// Driver contract. Drivers are long-lived and shared behind `Arc`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registered name of the driver.
    fn name(&self) -> &str;

    /// Flags fixed at construction.
    fn capabilities(&self) -> &Capabilities;

    /// Checks capabilities and compiles. Never touches the transport.
    fn compile(&self, query: &Query) -> Result<CompiledQuery>;

    /// Executes a query this driver compiled.
    async fn query(&self, compiled: &CompiledQuery) -> Result<QueryResult>;

    async fn write(&self, points: &[DataPoint]) -> Result<CommandResponse>;

    async fn connect(&self) -> bool;

    fn is_connected(&self) -> bool;

    async fn close(&self);

    /// Compile and execute in one step.
    async fn execute(&self, query: &Query) -> Result<QueryResult> {
        let compiled = self.compile(query)?;
        self.query(&compiled).await
    }

    async fn render_graph(&self, _request: &GraphRequest) -> Result<CommandResponse> {
        Err(Error::unsupported(Capability::Graph.flag()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::metadata;

    #[test]
    fn test_result_from_failed_response_has_no_data() {
        let response = CommandResponse::failure("connection refused", HashMap::new());
        let result = QueryResult::from_response(response, |_| unreachable!());
        assert!(!result.is_success());
        assert!(!result.has_data());
        assert_eq!(result.error(), Some("connection refused"));
    }

    #[test]
    fn test_result_from_unparsable_response_fails() {
        let response = CommandResponse::success("garbage", metadata("status", 200));
        let result = QueryResult::from_response(response, |_| {
            Err(Error::Transport("unexpected payload".to_string()))
        });
        assert!(!result.is_success());
        assert_eq!(result.metadata()["status"], Value::from(200));
    }

    #[test]
    fn test_aggregate_series_groups_by_label() {
        let series = |host: &str, dc: &str, points: Vec<(i64, f64)>| {
            let mut labels = BTreeMap::new();
            labels.insert("host".to_string(), host.to_string());
            labels.insert("dc".to_string(), dc.to_string());
            Series { name: "cpu".to_string(), labels, points }
        };
        let input = vec![
            series("a", "east", vec![(1, 1.0), (2, 2.0)]),
            series("b", "east", vec![(1, 3.0)]),
            series("c", "west", vec![(1, 10.0)]),
        ];

        let out = aggregate_series(input, AggregateFunction::Max, &["dc".to_string()]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].labels.get("dc").map(String::as_str), Some("east"));
        assert!(!out[0].labels.contains_key("host"));
        assert_eq!(out[0].points, vec![(1, 3.0), (2, 2.0)]);
        assert_eq!(out[1].points, vec![(1, 10.0)]);
    }

    #[test]
    fn test_has_data_requires_points() {
        let empty_series = QueryResult::from_series(
            vec![Series::new("cpu", BTreeMap::new())],
            HashMap::new(),
        );
        assert!(empty_series.is_success());
        assert!(!empty_series.has_data());
    }
}
