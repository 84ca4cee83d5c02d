/*!
# tsbridge-core: one query model for heterogeneous time-series stores

tsbridge-core describes time-series reads and writes once and runs them
against backends with very different wire formats: an HTTP line-protocol
store queried with Flux, round-robin database files driven through
`rrdtool`, and graphite-style flat files. Drivers declare what they can do;
queries they cannot run are rejected before any I/O.

## Key Features

### Backend-neutral queries
- Label matchers (`=`, `!=`, `=~`, `!~`) combined into filters
- Absolute, open-ended and trailing time ranges with s/ms/us/ns precision
- Ordered operations: rate, increase, math, aggregation, histogram quantile, label join
- Optional fixed-window downsampling

### Capability negotiation
- Each driver carries an immutable set of capability flags
- Compilation checks every flag a query needs and fails with
  `UnsupportedOperation` instead of returning wrong data

### Drivers
- `influxdb`: Flux over HTTP, annotated CSV results, line-protocol writes
- `rrd`: `list` + `fetch`/`xport` command sequences, graph rendering
- `graphite`: dotted paths on disk, evaluated in-process
- `null`: always connected, answers with empty results

## Usage

```rust,no_run
use tsbridge_core::config::ConnectionConfig;
use tsbridge_core::labels::LabelFilter;
use tsbridge_core::query::{BasicOperation, MetricIdentifier, Query};
use tsbridge_core::registry;
use tsbridge_core::time::TimeRange;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConnectionConfig::new("influxdb", "http://localhost:8086")
        .with_option("org", "acme")
        .with_option("bucket", "metrics");
    let driver = registry::global().create(&config)?;
    driver.connect().await;

    let query = Query::new(
        MetricIdentifier::new("http_requests")?.with_field("count"),
        TimeRange::last(chrono::Duration::hours(1))?,
    )
    .with_filter(LabelFilter::matching("service", "api")?)
    .with_operation(BasicOperation::rate());

    let result = driver.execute(&query).await?;
    for series in result.series() {
        println!("{} {:?}: {} points", series.name, series.labels, series.points.len());
    }
    Ok(())
}
```

See [`drivers`] for the driver contract and [`capabilities`] for the flags.
*/

pub mod aggregation;
pub mod capabilities;
pub mod config;
pub mod connection;
pub mod drivers;
pub mod error;
pub mod labels;
pub mod query;
pub mod registry;
pub mod time;

pub use capabilities::{Capabilities, Capability};
pub use connection::{CommandResponse, ConnectionAdapter, ReconnectPolicy};
pub use drivers::{CompiledQuery, DataPoint, Driver, QueryResult, Series};
pub use error::{Error, Result};
pub use query::{MetricIdentifier, Operation, Query};
pub use registry::DriverRegistry;
pub use time::{Clock, SystemClock, TimePrecision, TimeRange};
