//! HTTP line-protocol driver (InfluxDB 2.x API).
//!
//! Options read from the connection config:
//! - `org` and `bucket` (required)
//! - `token` (falls back to the credential password)
//! - `precision`: write and result precision, default `ns`
//! - `timeout_secs`: per-request timeout
//! - `auto_reconnect`: reconnect once on a closed adapter, default `true`

mod flux;
mod http;
mod line_protocol;

pub use self::flux::{parse_csv, FluxBuilder, FluxQuery};
pub use self::http::{HttpAdapter, HttpSettings};
pub use self::line_protocol::{encode_batch, encode_point, DEFAULT_FIELD};

use crate::capabilities::{Capabilities, Capability};
use crate::config::ConnectionConfig;
use crate::connection::{metadata, CommandResponse, ConnectionAdapter, ReconnectPolicy};
use crate::drivers::{compile_with, wrong_variant, CompiledQuery, DataPoint, Driver, QueryResult};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::time::TimePrecision;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "influxdb";

pub fn capabilities() -> Capabilities {
    Capabilities::none()
        .with(Capability::Rate)
        .with(Capability::Histogram)
        .with(Capability::Regex)
        .with(Capability::Aggregation)
        .with(Capability::Math)
        .with(Capability::Write)
}

fn required_option(config: &ConnectionConfig, key: &str) -> Result<String> {
    config
        .option_str(key)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Configuration(format!("{} driver needs option '{}'", DRIVER_NAME, key)))
}

impl HttpSettings {
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let token = config
            .option_str("token")
            .map(str::to_string)
            .or_else(|| config.credentials.as_ref().map(|c| c.password.clone()));
        let reconnect = if config.option::<bool>("auto_reconnect")?.unwrap_or(true) {
            ReconnectPolicy::Once
        } else {
            ReconnectPolicy::Never
        };

        Ok(Self {
            url: config.require_connection()?.to_string(),
            org: required_option(config, "org")?,
            bucket: required_option(config, "bucket")?,
            token,
            precision: config.option::<TimePrecision>("precision")?.unwrap_or(TimePrecision::Ns),
            timeout: config.timeout()?,
            reconnect,
        })
    }
}

pub struct InfluxDriver<A: ConnectionAdapter = HttpAdapter> {
    capabilities: Capabilities,
    builder: FluxBuilder,
    adapter: A,
    precision: TimePrecision,
}

impl InfluxDriver<HttpAdapter> {
    pub fn new(settings: HttpSettings) -> Self {
        let builder = FluxBuilder::new(settings.bucket.clone());
        let precision = settings.precision;
        Self::with_adapter(builder, HttpAdapter::new(settings), precision)
    }

    /// Registry factory.
    pub fn from_config(config: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
        let settings = HttpSettings::from_config(config)?;
        info!(url = %settings.url, bucket = %settings.bucket, "configured influxdb driver");
        Ok(Arc::new(Self::new(settings)))
    }
}

impl<A: ConnectionAdapter> InfluxDriver<A> {
    pub fn with_adapter(builder: FluxBuilder, adapter: A, precision: TimePrecision) -> Self {
        Self {
            capabilities: capabilities(),
            builder,
            adapter,
            precision,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

#[async_trait]
impl<A: ConnectionAdapter + 'static> Driver for InfluxDriver<A> {
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
        let flux = match compiled {
            CompiledQuery::LineProtocol(flux) => flux,
            other => return Err(wrong_variant(DRIVER_NAME, other)),
        };

        let response = self.adapter.execute_command("query", flux.flux()).await?;
        Ok(QueryResult::from_response(response, |body| {
            parse_csv(body, flux.precision(), flux.measurement())
        }))
    }

    async fn write(&self, points: &[DataPoint]) -> Result<CommandResponse> {
        self.capabilities.require(Capability::Write)?;
        if points.is_empty() {
            return Ok(CommandResponse::success("", metadata("points", 0)));
        }
        let body = encode_batch(points, self.precision)?;
        debug!(points = points.len(), "writing line protocol");
        self.adapter.execute_command("write", &body).await
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
    use crate::config::Credentials;
    use crate::drivers::null::NullDriver;
    use crate::query::MetricIdentifier;
    use crate::time::TimeRange;
    use chrono::Duration;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(DRIVER_NAME, "http://localhost:8086")
            .with_option("org", "acme")
            .with_option("bucket", "metrics")
    }

    #[test]
    fn test_settings_from_config() {
        let settings = HttpSettings::from_config(&config().with_credentials(Credentials {
            username: "admin".into(),
            password: "secret-token".into(),
        }))
        .unwrap();
        assert_eq!(settings.token.as_deref(), Some("secret-token"));
        assert_eq!(settings.precision, TimePrecision::Ns);
        assert_eq!(settings.reconnect, ReconnectPolicy::Once);

        let settings = HttpSettings::from_config(
            &config()
                .with_option("token", "explicit")
                .with_option("auto_reconnect", "false")
                .with_option("precision", "ms"),
        )
        .unwrap();
        assert_eq!(settings.token.as_deref(), Some("explicit"));
        assert_eq!(settings.reconnect, ReconnectPolicy::Never);
        assert_eq!(settings.precision, TimePrecision::Ms);
    }

    #[test]
    fn test_missing_bucket_is_configuration_error() {
        let config = ConnectionConfig::new(DRIVER_NAME, "http://localhost:8086").with_option("org", "acme");
        assert!(matches!(HttpSettings::from_config(&config), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_foreign_compiled_query_rejected() {
        let driver = InfluxDriver::new(HttpSettings::from_config(&config()).unwrap());
        let query = Query::new(
            MetricIdentifier::new("cpu").unwrap(),
            TimeRange::last(Duration::hours(1)).unwrap(),
        );
        let foreign = NullDriver::new().compile(&query).unwrap();
        let err = driver.query(&foreign).await.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
        assert_eq!(err.offending_query(), Some(&query));
        assert!(driver.compile(&query).is_ok());
    }

    #[test]
    fn test_declared_capabilities() {
        let caps = capabilities();
        assert!(caps.supports(Capability::Rate));
        assert!(caps.supports(Capability::Histogram));
        assert!(!caps.supports(Capability::LabelJoin));
        assert!(!caps.supports(Capability::EmptyRange));
        assert!(!caps.supports(Capability::Graph));
    }
}
