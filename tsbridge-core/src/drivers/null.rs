//! Driver with no backend.
//!
//! Always connected, declares no capability, answers every query with an
//! empty successful result and accepts every write without effect. Useful as
//! a safe default connection and as the reference for the driver contract.

use crate::capabilities::Capabilities;
use crate::config::ConnectionConfig;
use crate::connection::CommandResponse;
use crate::drivers::{compile_with, CompiledQuery, DataPoint, Driver, QueryBuilder, QueryResult};
use crate::error::Result;
use crate::query::Query;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub const DRIVER_NAME: &str = "null";

struct NoopBuilder;

impl QueryBuilder for NoopBuilder {
    fn build(&self, query: &Query) -> Result<CompiledQuery> {
        Ok(CompiledQuery::Noop(Box::new(query.clone())))
    }
}

#[derive(Debug, Clone)]
pub struct NullDriver {
    capabilities: Capabilities,
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NullDriver {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::none(),
        }
    }

    /// Registry factory. The null driver ignores its settings.
    pub fn from_config(_config: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(Self::new()))
    }
}

#[async_trait]
impl Driver for NullDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn compile(&self, query: &Query) -> Result<CompiledQuery> {
        compile_with(&self.capabilities, &NoopBuilder, query)
    }

    async fn query(&self, _compiled: &CompiledQuery) -> Result<QueryResult> {
        Ok(QueryResult::empty())
    }

    async fn write(&self, _points: &[DataPoint]) -> Result<CommandResponse> {
        Ok(CommandResponse::success("", HashMap::new()))
    }

    async fn connect(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::graphite::GraphiteBuilder;
    use crate::error::Error;
    use crate::query::{BasicOperation, MetricIdentifier};
    use crate::time::TimeRange;
    use chrono::Duration;

    fn query() -> Query {
        Query::new(
            MetricIdentifier::new("cpu").unwrap(),
            TimeRange::last(Duration::hours(1)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_any_compiled_query_yields_empty_result() {
        let driver = NullDriver::new();
        let foreign = GraphiteBuilder::new("stats", "/tmp").build(&query()).unwrap();

        for compiled in [CompiledQuery::Noop(Box::new(query())), foreign] {
            let result = driver.query(&compiled).await.unwrap();
            assert!(result.is_success());
            assert!(!result.has_data());
            assert!(result.series().is_empty());
        }
    }

    #[tokio::test]
    async fn test_always_connected() {
        let driver = NullDriver::new();
        driver.close().await;
        assert!(driver.is_connected());
        assert!(driver.connect().await);
    }

    #[test]
    fn test_every_flag_false() {
        let driver = NullDriver::new();
        assert!(driver.capabilities().flags().values().all(|enabled| !enabled));
        let err = driver
            .compile(&query().with_operation(BasicOperation::rate()))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert_eq!(
            driver.compile(&query()).unwrap(),
            CompiledQuery::Noop(Box::new(query()))
        );
    }

    #[tokio::test]
    async fn test_write_is_accepted() {
        let point = DataPoint::new(MetricIdentifier::new("cpu").unwrap(), 1.0, chrono::Utc::now());
        let response = NullDriver::new().write(&[point]).await.unwrap();
        assert!(response.is_success());
    }
}
