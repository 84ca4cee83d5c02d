//! tsbridge command-line client.
//!
//! Runs backend-neutral queries, writes and graphs against any configured
//! time-series connection.
//!
//! # Configuration
//!
//! Configuration can be provided through multiple sources, in order of precedence:
//!
//! 1. Command-line arguments (highest precedence)
//! 2. Environment variables (prefixed with `TSBRIDGE_`)
//! 3. User-specified configuration file (via `--config`)
//! 4. System-wide configuration (`/etc/tsbridge/config.toml`)
//! 5. Default configuration (embedded in binary)
//!
//! A `.env` file in the working directory is loaded before anything else.
//!
//! ## Global Options
//!
//! ```text
//!   -c, --config <FILE>          Path to configuration file
//!       --connection <NAME>      Named connection [env: TSBRIDGE_CONNECTION]
//!       --driver <NAME>          Driver for the selected connection
//!       --url <STR>              Connection string for the selected connection
//!       --option <KEY=VALUE>     Driver option (can be specified multiple times)
//!       --username <USER>        Username for the selected connection
//!       --password <SECRET>      Password or token for the selected connection
//! ```
//!
//! ## Configuration File Format (TOML)
//!
//! ```toml
//! default = "influx"
//!
//! [connections.influx]
//! driver = "influxdb"
//! connection = "http://localhost:8086"
//! options = { org = "acme", bucket = "metrics", precision = "s" }
//!
//! [connections.rrd]
//! driver = "rrd"
//! connection = "/var/lib/rrd"
//! options = { daemon = "unix:/run/rrdcached.sock" }
//!
//! [connections.graphite]
//! driver = "graphite"
//! connection = "/var/lib/graphite"
//! options = { prefix = "servers" }
//! ```
//!
//! # Examples
//!
//! ```text
//! tsbridge query cpu --field usage --label host=~web-.* --last 1h --rate --aggregate avg:dc
//! tsbridge query cpu --downsample 5m:max --sparkline
//! tsbridge write cpu 0.42 --label host=web-1
//! tsbridge --connection rrd graph /tmp/cpu.png cpu:avg mem:max --last 1d
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tsbridge::args;
use tsbridge::{sparkline, CliArgs, ClientError, ConnectionManager, Graph, Schema, Settings};
use tsbridge_core::aggregation::AggregateFunction;
use tsbridge_core::drivers::DataPoint;
use tsbridge_core::query::{BasicOperation, HistogramOperation};
use tsbridge_core::registry;
use tsbridge_core::{MetricIdentifier, Query, TimePrecision};

#[derive(Parser, Debug)]
#[command(name = "tsbridge", version, about = "Query heterogeneous time-series stores")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

/// Time range shared by reading commands.
#[derive(clap::Args, Debug)]
struct RangeArgs {
    /// Range start (RFC 3339)
    #[arg(long)]
    start: Option<String>,

    /// Range end (RFC 3339)
    #[arg(long)]
    end: Option<String>,

    /// Range length, e.g. `15m` or `1d`; defaults to the last hour
    #[arg(long)]
    last: Option<String>,
}

impl RangeArgs {
    fn range(&self) -> tsbridge::Result<tsbridge_core::TimeRange> {
        args::parse_range(self.start.as_deref(), self.end.as_deref(), self.last.as_deref())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered drivers
    Drivers,

    /// Connect and report connection state
    Ping,

    /// Run a query and print the result as JSON
    Query {
        metric: String,

        /// Field within the metric
        #[arg(long)]
        field: Option<String>,

        /// Label matcher: `k=v`, `k!=v`, `k=~re`, `k!~re`
        #[arg(short, long = "label")]
        labels: Vec<String>,

        #[command(flatten)]
        range: RangeArgs,

        /// Per-second rate
        #[arg(long, conflicts_with = "increase")]
        rate: bool,

        /// Increase over the range
        #[arg(long)]
        increase: bool,

        /// Scalar math applied after rate/increase, e.g. `*8` or `/1024`
        #[arg(long, allow_hyphen_values = true)]
        math: Vec<String>,

        /// Aggregation across series, e.g. `sum` or `max:host,dc`
        #[arg(long)]
        aggregate: Option<String>,

        /// Histogram quantile in [0, 1]
        #[arg(long)]
        quantile: Option<f64>,

        /// Fixed-window downsampling, e.g. `5m:max`
        #[arg(long)]
        downsample: Option<String>,

        /// Timestamp precision: s, ms, us or ns
        #[arg(long, default_value = "s")]
        precision: String,

        /// Maximum points per series
        #[arg(long)]
        limit: Option<usize>,

        /// Print the compiled backend query without running it
        #[arg(long)]
        explain: bool,

        /// Print one sparkline per series instead of JSON
        #[arg(long)]
        sparkline: bool,
    },

    /// Write a single value
    Write {
        metric: String,

        value: f64,

        #[arg(long)]
        field: Option<String>,

        /// Metric label as `k=v`
        #[arg(short, long = "label")]
        labels: Vec<String>,

        /// Timestamp (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// List label names and values seen for a metric
    Labels {
        metric: String,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Render a graph image through the connection
    Graph {
        output: PathBuf,

        /// Lines as `metric` or `metric:function`
        #[arg(required = true)]
        lines: Vec<String>,

        #[command(flatten)]
        range: RangeArgs,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        vertical_label: Option<String>,

        #[arg(long, default_value_t = 800)]
        width: u32,

        #[arg(long, default_value_t = 200)]
        height: u32,
    },
}

fn metric(name: &str, field: Option<&str>) -> tsbridge::Result<MetricIdentifier> {
    let metric = MetricIdentifier::new(name)?;
    Ok(match field {
        Some(field) => metric.with_field(field),
        None => metric,
    })
}

fn graph_line(expr: &str) -> tsbridge::Result<(MetricIdentifier, AggregateFunction)> {
    match expr.split_once(':') {
        Some((name, function)) => Ok((MetricIdentifier::new(name)?, function.parse::<AggregateFunction>()?)),
        None => Ok((MetricIdentifier::new(expr)?, AggregateFunction::Avg)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Drivers = cli.command {
        for name in registry::global().names() {
            println!("{}", name);
        }
        return Ok(());
    }

    // Load settings from config files, environment and CLI args
    let settings = Settings::new(&cli.args)?;
    debug!(default = %settings.default, connections = settings.connections.len(), "settings loaded");
    let manager = ConnectionManager::new(settings);

    let outcome = run(&manager, cli.command).await;
    manager.close_all().await;
    outcome?;
    Ok(())
}

async fn run(manager: &ConnectionManager, command: Command) -> tsbridge::Result<()> {
    let driver = manager.default_connection().await?;

    match command {
        Command::Drivers => {}

        Command::Ping => {
            let state = if driver.is_connected() { "connected" } else { "disconnected" };
            println!("{} ({}): {}", manager.settings().default, driver.name(), state);
            if !driver.is_connected() {
                return Err(ClientError::Backend("connection is down".to_string()));
            }
        }

        Command::Query {
            metric: name,
            field,
            labels,
            range,
            rate,
            increase,
            math,
            aggregate,
            quantile,
            downsample,
            precision,
            limit,
            explain,
            sparkline: as_sparkline,
        } => {
            let precision: TimePrecision = precision.parse()?;
            let mut query = Query::new(metric(&name, field.as_deref())?, range.range()?)
                .with_filter(args::parse_filter(&labels)?)
                .with_precision(precision);

            // Operations run in a fixed order: rate/increase, math, aggregate, quantile.
            if rate {
                query = query.with_operation(BasicOperation::rate());
            }
            if increase {
                query = query.with_operation(BasicOperation::increase());
            }
            for expr in &math {
                query = query.with_operation(args::parse_math(expr)?);
            }
            if let Some(expr) = aggregate {
                query = query.with_operation(args::parse_aggregate(&expr)?);
            }
            if let Some(q) = quantile {
                query = query.with_operation(HistogramOperation::new(q)?);
            }
            if let Some(expr) = downsample {
                let (step, function) = args::parse_downsample(&expr)?;
                query = query.with_downsample(step, function)?;
            }
            if let Some(limit) = limit {
                query = query.with_limit(limit);
            }

            if explain {
                println!("{}", driver.compile(&query)?.raw());
                return Ok(());
            }

            let result = driver.execute(&query).await?;
            if let Some(error) = result.error() {
                return Err(ClientError::Backend(error.to_string()));
            }
            if as_sparkline {
                for series in result.series() {
                    println!("{} {:?} {}", series.name, series.labels, sparkline(series));
                }
            } else {
                let json = serde_json::to_string_pretty(&result)
                    .map_err(|e| ClientError::Backend(e.to_string()))?;
                println!("{}", json);
            }
        }

        Command::Write {
            metric: name,
            value,
            field,
            labels,
            at,
        } => {
            let mut metric = metric(&name, field.as_deref())?;
            for expr in &labels {
                let (key, label_value) = args::parse_pair(expr)?;
                metric = metric.with_label(key, label_value);
            }
            let timestamp = match at {
                Some(at) => args::parse_instant(&at)?,
                None => chrono::Utc::now(),
            };
            let response = driver.write(&[DataPoint::new(metric, value, timestamp)]).await?;
            match response.error() {
                Some(error) => return Err(ClientError::Backend(error.to_string())),
                None => println!("ok"),
            }
        }

        Command::Labels { metric: name, range } => {
            let schema = Schema::new(driver);
            let labels = schema.labels(&MetricIdentifier::new(name)?, &range.range()?).await?;
            for (label, values) in labels {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                println!("{}: {}", label, values.join(", "));
            }
        }

        Command::Graph {
            output,
            lines,
            range,
            title,
            vertical_label,
            width,
            height,
        } => {
            let mut graph = Graph::new(output, range.range()?).with_size(width, height);
            if let Some(title) = title {
                graph = graph.with_title(title);
            }
            if let Some(label) = vertical_label {
                graph = graph.with_vertical_label(label);
            }
            for expr in &lines {
                let (metric, function) = graph_line(expr)?;
                graph = graph.with_line(metric, function);
            }
            let response = graph.render(driver.as_ref()).await?;
            println!("{}", response.data());
        }
    }

    Ok(())
}
