//! Round-robin database driver, driven through `rrdtool`.
//!
//! One `.rrd` file per series inside the connection directory (see
//! [`file_name`]). Queries list the directory, match file names against the
//! label filter and run one `fetch` or `xport` per match.
//!
//! Options read from the connection config:
//! - `binary`: rrdtool executable, default `rrdtool`
//! - `daemon`: rrdcached address
//! - `commands`: comma-separated enabled command kinds, default all
//! - `timeout_secs`, `auto_reconnect` (default `false`)

mod builder;
mod command;
mod parse;
mod process;

pub use self::builder::{at_bounds, RrdBuilder, DEFAULT_DATA_SOURCE};
pub use self::command::{RrdCommand, RrdCommandKind, RrdCommandSequence, RrdOutput, FILE_PLACEHOLDER};
pub use self::parse::{file_name, parse_fetch, parse_file_name, parse_xport};
pub use self::process::{ProcessAdapter, ProcessSettings};

use crate::capabilities::{Capabilities, Capability};
use crate::config::ConnectionConfig;
use crate::connection::{metadata, CommandResponse, ConnectionAdapter, ReconnectPolicy};
use crate::drivers::{
    aggregate_series, compile_with, wrong_variant, CompiledQuery, DataPoint, Driver, GraphRequest,
    QueryResult, Series,
};
use crate::error::{Error, Result};
use crate::query::{MetricIdentifier, Query};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "rrd";

pub fn capabilities() -> Capabilities {
    Capabilities::none()
        .with(Capability::Aggregation)
        .with(Capability::Math)
        .with(Capability::Write)
        .with(Capability::Graph)
}

/// Static driver settings resolved from a [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct RrdSettings {
    pub process: ProcessSettings,
    pub commands: BTreeSet<RrdCommandKind>,
}

impl RrdSettings {
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let commands = match config.option_str("commands") {
            None => RrdCommandKind::ALL.into_iter().collect(),
            Some(list) => list
                .split(',')
                .filter(|c| !c.trim().is_empty())
                .map(|c| {
                    c.parse::<RrdCommandKind>()
                        .map_err(|e| Error::Configuration(e.to_string()))
                })
                .collect::<Result<BTreeSet<_>>>()?,
        };
        let reconnect = if config.option::<bool>("auto_reconnect")?.unwrap_or(false) {
            ReconnectPolicy::Once
        } else {
            ReconnectPolicy::Never
        };

        Ok(Self {
            process: ProcessSettings {
                binary: PathBuf::from(config.option_str("binary").unwrap_or("rrdtool")),
                directory: PathBuf::from(config.require_connection()?),
                daemon: config.option_str("daemon").map(str::to_string),
                timeout: config.timeout()?,
                reconnect,
            },
            commands,
        })
    }
}

pub struct RrdDriver<A: ConnectionAdapter = ProcessAdapter> {
    capabilities: Capabilities,
    builder: RrdBuilder,
    directory: PathBuf,
    adapter: A,
}

impl RrdDriver<ProcessAdapter> {
    pub fn new(settings: RrdSettings) -> Self {
        let directory = settings.process.directory.clone();
        let builder = RrdBuilder::new(directory.clone(), settings.commands);
        Self::with_adapter(builder, directory, ProcessAdapter::new(settings.process))
    }

    /// Registry factory.
    pub fn from_config(config: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
        let settings = RrdSettings::from_config(config)?;
        info!(directory = %settings.process.directory.display(), "configured rrd driver");
        Ok(Arc::new(Self::new(settings)))
    }
}

impl<A: ConnectionAdapter> RrdDriver<A> {
    pub fn with_adapter(builder: RrdBuilder, directory: impl Into<PathBuf>, adapter: A) -> Self {
        Self {
            capabilities: capabilities(),
            builder,
            directory: directory.into(),
            adapter,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    fn path_of(&self, metric: &MetricIdentifier) -> Result<String> {
        Ok(self.directory.join(file_name(metric)?).display().to_string())
    }

    async fn run(&self, kind: RrdCommandKind, args: Vec<String>) -> Result<CommandResponse> {
        if !self.builder.is_enabled(kind) {
            return Err(Error::Configuration(format!("rrdtool command '{}' is not enabled", kind)));
        }
        let command = RrdCommand::new(kind, args);
        self.adapter.execute_command(kind.as_str(), &command.payload()).await
    }

    /// Creates the file backing `metric`: one GAUGE data source and an
    /// archive per consolidation function, `rows` points at `step` each.
    pub async fn create_series(&self, metric: &MetricIdentifier, step: Duration, rows: u32) -> Result<CommandResponse> {
        let step = step.num_seconds();
        if step <= 0 || rows == 0 {
            return Err(Error::Validation("rrd step and row count must be positive".to_string()));
        }
        let data_source = metric.field().unwrap_or(DEFAULT_DATA_SOURCE);
        let mut args = vec![
            self.path_of(metric)?,
            "--step".to_string(),
            step.to_string(),
            format!("DS:{}:GAUGE:{}:U:U", data_source, step * 2),
        ];
        for cf in ["AVERAGE", "MIN", "MAX", "LAST"] {
            args.push(format!("RRA:{}:0.5:1:{}", cf, rows));
        }
        self.run(RrdCommandKind::Create, args).await
    }

    async fn fetch_file(&self, template: &RrdCommand, file: &str) -> Result<CommandResponse> {
        let command = template.for_file(file);
        debug!(%command, "running per-file rrd command");
        self.adapter.execute_command(command.kind.as_str(), &command.payload()).await
    }
}

#[async_trait]
impl<A: ConnectionAdapter + 'static> Driver for RrdDriver<A> {
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
        let sequence = match compiled {
            CompiledQuery::RoundRobin(sequence) => sequence,
            other => return Err(wrong_variant(DRIVER_NAME, other)),
        };
        let (list, template) = match sequence.commands() {
            [list, template] => (list, template),
            _ => return Err(Error::Validation("malformed rrd command sequence".to_string())),
        };

        let listing = self.adapter.execute_command(list.kind.as_str(), &list.payload()).await?;
        if let Some(error) = listing.error() {
            return Ok(QueryResult::failed(error, listing.metadata().clone()));
        }

        let mut series = Vec::new();
        for line in listing.data().lines() {
            let (metric, labels) = match parse_file_name(line) {
                Some(parsed) => parsed,
                None => continue,
            };
            if metric != sequence.metric() || !sequence.filter.matches(&labels) {
                continue;
            }

            let file = Path::new(line.trim());
            let file = if file.is_absolute() {
                file.to_path_buf()
            } else {
                self.directory.join(file)
            };
            let response = self.fetch_file(template, &file.display().to_string()).await?;
            if let Some(error) = response.error() {
                return Ok(QueryResult::failed(error, response.metadata().clone()));
            }

            let points = match sequence.output() {
                RrdOutput::Fetch { data_source } => {
                    parse_fetch(response.data(), data_source, sequence.precision())
                }
                RrdOutput::Xport => parse_xport(response.data(), sequence.precision()),
            };
            let points = match points {
                Ok(points) => points,
                Err(e) => return Ok(QueryResult::failed(e.to_string(), response.metadata().clone())),
            };
            series.push(Series {
                name: metric,
                labels,
                points,
            });
        }

        if let Some(aggregate) = &sequence.aggregate {
            series = aggregate_series(series, aggregate.function(), aggregate.by());
        }
        if let Some(limit) = sequence.limit {
            for s in &mut series {
                s.points.truncate(limit);
            }
        }

        Ok(QueryResult::from_series(series, metadata("files", listing.data().lines().count())))
    }

    async fn write(&self, points: &[DataPoint]) -> Result<CommandResponse> {
        self.capabilities.require(Capability::Write)?;

        let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for point in points {
            if !point.value.is_finite() {
                return Err(Error::Validation(format!("cannot write non-finite value for {}", point.metric)));
            }
            files
                .entry(self.path_of(&point.metric)?)
                .or_default()
                .push(format!("{}:{}", point.timestamp.timestamp(), point.value));
        }

        let mut written = 0usize;
        for (file, mut updates) in files {
            let count = updates.len();
            let mut args = vec![file];
            args.append(&mut updates);
            let response = self.run(RrdCommandKind::Update, args).await?;
            if !response.is_success() {
                return Ok(response);
            }
            written += count;
        }
        Ok(CommandResponse::success("", metadata("points", written)))
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

    async fn render_graph(&self, request: &GraphRequest) -> Result<CommandResponse> {
        self.capabilities.require(Capability::Graph)?;
        if request.lines.is_empty() {
            return Err(Error::Validation("graph needs at least one line".to_string()));
        }

        let (start, end) = at_bounds(&request.range)?;
        let mut args = vec![
            request.output.display().to_string(),
            "--start".to_string(),
            start,
            "--end".to_string(),
            end,
            "--title".to_string(),
            request.title.clone(),
            "--vertical-label".to_string(),
            request.vertical_label.clone(),
            "--width".to_string(),
            request.width.to_string(),
            "--height".to_string(),
            request.height.to_string(),
        ];
        for (index, line) in request.lines.iter().enumerate() {
            let cf = line.function.consolidation_function().ok_or_else(|| {
                Error::Validation(format!("{} has no rrdtool consolidation function", line.function))
            })?;
            let data_source = line.metric.field().unwrap_or(DEFAULT_DATA_SOURCE);
            args.push(format!("DEF:l{}={}:{}:{}", index, self.path_of(&line.metric)?, data_source, cf));
            args.push(format!(
                "LINE1:l{}#{}:{}",
                index,
                line.color.trim_start_matches('#'),
                line.legend.replace(':', "\\:")
            ));
        }
        self.run(RrdCommandKind::Graph, args).await
    }
}
