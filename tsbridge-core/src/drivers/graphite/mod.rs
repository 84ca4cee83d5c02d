//! Flat-file driver with graphite-style dotted paths.
//!
//! A metric `cpu.load` under prefix `stats` lives in directory `stats/cpu`
//! of the store root; each series is a file `load[;label=value...].dat` of
//! `"<epoch_seconds> <value>"` lines. Queries compile to a graphite render
//! target and are evaluated locally over the matching files.
//!
//! Options: `prefix`, `timeout_secs`, `auto_reconnect` (default `false`).

mod eval;
mod store;
mod target;

pub use self::eval::{evaluate, parse_points};
pub use self::store::{AppendRequest, FlatFileAdapter};
pub use self::target::{time_bounds, GraphiteBuilder, GraphiteQuery, EXTENSION};

use crate::capabilities::{Capabilities, Capability};
use crate::config::ConnectionConfig;
use crate::connection::{metadata, CommandResponse, ConnectionAdapter, ReconnectPolicy};
use crate::drivers::{compile_with, wrong_variant, CompiledQuery, DataPoint, Driver, QueryResult, Series};
use crate::error::{Error, Result};
use crate::query::{MetricIdentifier, Query};
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "graphite";

pub fn capabilities() -> Capabilities {
    Capabilities::none()
        .with(Capability::Rate)
        .with(Capability::Regex)
        .with(Capability::Aggregation)
        .with(Capability::Math)
        .with(Capability::Write)
        .with(Capability::EmptyRange)
}

/// Series file name for a leaf and its labels.
fn series_file(leaf: &str, labels: &BTreeMap<String, String>) -> Result<String> {
    let mut name = leaf.to_string();
    for (label, value) in labels {
        if label.is_empty() || [label, value].iter().any(|s| s.contains(['/', ';', '='])) {
            return Err(Error::Validation(format!(
                "label {}={} cannot be stored in a file name",
                label, value
            )));
        }
        name.push_str(&format!(";{}={}", label, value));
    }
    name.push_str(EXTENSION);
    Ok(name)
}

/// Leaf and labels of a series file name, `None` for foreign files.
fn parse_series_file(file: &str) -> Option<(String, BTreeMap<String, String>)> {
    let stem = file.trim().strip_suffix(EXTENSION)?;
    let mut parts = stem.split(';');
    let leaf = parts.next()?.to_string();
    let mut labels = BTreeMap::new();
    for part in parts {
        let (label, value) = part.split_once('=')?;
        labels.insert(label.to_string(), value.to_string());
    }
    Some((leaf, labels))
}

pub struct GraphiteDriver<A: ConnectionAdapter = FlatFileAdapter> {
    capabilities: Capabilities,
    builder: GraphiteBuilder,
    adapter: A,
    clock: Arc<dyn Clock>,
}

impl GraphiteDriver<FlatFileAdapter> {
    /// Registry factory.
    pub fn from_config(config: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
        let root = PathBuf::from(config.require_connection()?);
        let prefix = config.option_str("prefix").unwrap_or_default();
        let reconnect = if config.option::<bool>("auto_reconnect")?.unwrap_or(false) {
            ReconnectPolicy::Once
        } else {
            ReconnectPolicy::Never
        };
        let adapter = FlatFileAdapter::new(root.clone(), config.timeout()?, reconnect);
        info!(root = %root.display(), prefix, "configured graphite driver");
        Ok(Arc::new(Self::with_adapter(GraphiteBuilder::new(prefix, root), adapter)))
    }
}

impl<A: ConnectionAdapter> GraphiteDriver<A> {
    pub fn with_adapter(builder: GraphiteBuilder, adapter: A) -> Self {
        Self {
            capabilities: capabilities(),
            builder,
            adapter,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used to resolve relative ranges at execution.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    fn relative_file(&self, metric: &MetricIdentifier) -> Result<String> {
        let (directory, leaf) = GraphiteBuilder::split_path(&self.builder.path_of(metric.name())?);
        Ok(directory
            .join(series_file(&leaf, metric.labels())?)
            .display()
            .to_string())
    }
}

#[async_trait]
impl<A: ConnectionAdapter + 'static> Driver for GraphiteDriver<A> {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn compile(&self, query: &Query) -> Result<CompiledQuery> {
        compile_with(&self.capabilities, &self.builder, query)
    }

    async fn query(&self, compiled: &CompiledQuery) -> Result<QueryResult> {
        let graphite = match compiled {
            CompiledQuery::FlatFile(graphite) => graphite,
            other => return Err(wrong_variant(DRIVER_NAME, other)),
        };
        let (start, end) = graphite.query.range().resolve_with(self.clock.as_ref())?;
        let directory = graphite.directory().display().to_string();

        let listing = self.adapter.execute_command("list", &directory).await?;
        if let Some(error) = listing.error() {
            return Ok(QueryResult::failed(error, listing.metadata().clone()));
        }

        let filter = graphite.query.effective_filter();
        let mut raw = Vec::new();
        for file in listing.data().lines() {
            let (leaf, labels) = match parse_series_file(file) {
                Some(parsed) => parsed,
                None => continue,
            };
            if leaf != graphite.leaf || !filter.matches(&labels) {
                continue;
            }

            let path = graphite.directory().join(file.trim()).display().to_string();
            let body = self.adapter.execute_command("read", &path).await?;
            if let Some(error) = body.error() {
                return Ok(QueryResult::failed(error, body.metadata().clone()));
            }
            let points = match parse_points(body.data()) {
                Ok(points) => points,
                Err(e) => return Ok(QueryResult::failed(e.to_string(), body.metadata().clone())),
            };
            raw.push(Series {
                name: graphite.path().to_string(),
                labels,
                points,
            });
        }

        debug!(target = graphite.target(), series = raw.len(), "evaluating flat-file query");
        let series = evaluate(raw, &graphite.query, start.timestamp(), end.timestamp());
        Ok(QueryResult::from_series(series, metadata("target", graphite.target())))
    }

    async fn write(&self, points: &[DataPoint]) -> Result<CommandResponse> {
        self.capabilities.require(Capability::Write)?;

        let mut files: BTreeMap<String, String> = BTreeMap::new();
        for point in points {
            if !point.value.is_finite() {
                return Err(Error::Validation(format!("cannot write non-finite value for {}", point.metric)));
            }
            let content = files.entry(self.relative_file(&point.metric)?).or_default();
            content.push_str(&format!("{} {}\n", point.timestamp.timestamp(), point.value));
        }

        for (path, content) in files {
            let request = serde_json::to_string(&AppendRequest { path, content })
                .map_err(|e| Error::Validation(e.to_string()))?;
            let response = self.adapter.execute_command("append", &request).await?;
            if !response.is_success() {
                return Ok(response);
            }
        }
        Ok(CommandResponse::success("", metadata("points", points.len())))
    }

    async fn connect(&self) -> bool {
        self.adapter.connect().await
    }

    fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    async fn close(&self) {
        self.adapter.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateFunction;
    use crate::labels::{LabelFilter, LabelMatcher, MatchType};
    use crate::query::{AggregateOperation, BasicOperation, HistogramOperation};
    use crate::time::{MockClock, TimeRange};
    use chrono::{Duration, TimeZone, Utc};
    use std::path::Path;
    use std::time::Duration as StdDuration;

    fn driver(root: &Path) -> GraphiteDriver<FlatFileAdapter> {
        let adapter = FlatFileAdapter::new(root, StdDuration::from_secs(5), ReconnectPolicy::Never);
        let clock = MockClock::with_time(Utc.timestamp_opt(1_700_000_100, 0).unwrap());
        GraphiteDriver::with_adapter(GraphiteBuilder::new("stats", root), adapter).with_clock(Arc::new(clock))
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn seed(driver: &GraphiteDriver<FlatFileAdapter>) {
        let metric = MetricIdentifier::new("web.requests").unwrap();
        let points = vec![
            DataPoint::new(metric.with_label("host", "web-1"), 10.0, at(1_700_000_000)),
            DataPoint::new(metric.with_label("host", "web-1"), 30.0, at(1_700_000_010)),
            DataPoint::new(metric.with_label("host", "db-1"), 5.0, at(1_700_000_000)),
            DataPoint::new(metric.with_label("host", "db-1"), 6.0, at(1_700_000_010)),
        ];
        assert!(driver.write(&points).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_write_then_query_with_regex_and_rate() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        assert!(driver.connect().await);
        seed(&driver).await;

        let filter = LabelFilter::new()
            .with_matcher("host", LabelMatcher::new(MatchType::RegexMatch, "web-.*").unwrap())
            .unwrap();
        let query = Query::new(
            MetricIdentifier::new("web.requests").unwrap(),
            TimeRange::last(Duration::minutes(5)).unwrap(),
        )
        .with_filter(filter)
        .with_operation(BasicOperation::rate());

        let result = driver.execute(&query).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.series().len(), 1);
        assert_eq!(result.series()[0].labels.get("host").map(String::as_str), Some("web-1"));
        assert_eq!(result.series()[0].points, vec![(1_700_000_010, 2.0)]);
    }

    #[tokio::test]
    async fn test_sum_across_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        assert!(driver.connect().await);
        seed(&driver).await;

        let query = Query::new(
            MetricIdentifier::new("web.requests").unwrap(),
            TimeRange::between(at(1_700_000_000), at(1_700_000_000)).unwrap(),
        )
        .with_operation(AggregateOperation::new(AggregateFunction::Sum, vec![]));
        let result = driver.execute(&query).await.unwrap();
        assert_eq!(result.series().len(), 1);
        assert_eq!(result.series()[0].points, vec![(1_700_000_000, 15.0)]);
    }

    #[tokio::test]
    async fn test_histogram_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let query = Query::new(
            MetricIdentifier::new("latency").unwrap(),
            TimeRange::last(Duration::minutes(5)).unwrap(),
        )
        .with_operation(HistogramOperation::new(0.99).unwrap());
        assert!(matches!(
            driver.execute(&query).await,
            Err(Error::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_driver_reports_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        assert!(driver.connect().await);
        driver.close().await;
        assert!(!driver.is_connected());

        let query = Query::new(
            MetricIdentifier::new("web.requests").unwrap(),
            TimeRange::last(Duration::minutes(5)).unwrap(),
        );
        assert!(matches!(driver.execute(&query).await, Err(Error::NotConnected(_))));
    }

    #[test]
    fn test_series_file_names() {
        let mut labels = BTreeMap::new();
        labels.insert("host".to_string(), "a".to_string());
        assert_eq!(series_file("load", &labels).unwrap(), "load;host=a.dat");
        assert_eq!(parse_series_file("load;host=a.dat"), Some(("load".to_string(), labels)));
        assert!(parse_series_file("load.txt").is_none());
    }
}
