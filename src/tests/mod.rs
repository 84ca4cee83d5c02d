use crate::config::Settings;
use crate::error::ClientError;
use crate::graph::Graph;
use crate::manager::ConnectionManager;
use crate::schema::Schema;
use async_trait::async_trait;
use chrono::Duration;
use mockall::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tsbridge_core::aggregation::AggregateFunction;
use tsbridge_core::config::ConnectionConfig;
use tsbridge_core::drivers::null::NullDriver;
use tsbridge_core::drivers::{CompiledQuery, DataPoint, GraphRequest, Series};
use tsbridge_core::registry::DriverRegistry;
use tsbridge_core::{Capabilities, CommandResponse, Driver, Error, MetricIdentifier, Query, QueryResult, TimeRange};

mock! {
    pub Driver {}

    #[async_trait]
    impl Driver for Driver {
        fn name(&self) -> &str;
        fn capabilities(&self) -> &Capabilities;
        fn compile(&self, query: &Query) -> tsbridge_core::Result<CompiledQuery>;
        async fn query(&self, compiled: &CompiledQuery) -> tsbridge_core::Result<QueryResult>;
        async fn write(&self, points: &[DataPoint]) -> tsbridge_core::Result<CommandResponse>;
        async fn connect(&self) -> bool;
        fn is_connected(&self) -> bool;
        async fn close(&self);
        async fn execute(&self, query: &Query) -> tsbridge_core::Result<QueryResult>;
        async fn render_graph(&self, request: &GraphRequest) -> tsbridge_core::Result<CommandResponse>;
    }
}

/// Null driver whose connect takes a while, like an unreachable HTTP backend.
struct SlowDriver(NullDriver);

#[async_trait]
impl Driver for SlowDriver {
    fn name(&self) -> &str {
        "slow"
    }

    fn capabilities(&self) -> &Capabilities {
        self.0.capabilities()
    }

    fn compile(&self, query: &Query) -> tsbridge_core::Result<CompiledQuery> {
        self.0.compile(query)
    }

    async fn query(&self, compiled: &CompiledQuery) -> tsbridge_core::Result<QueryResult> {
        self.0.query(compiled).await
    }

    async fn write(&self, points: &[DataPoint]) -> tsbridge_core::Result<CommandResponse> {
        self.0.write(points).await
    }

    async fn connect(&self) -> bool {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

fn slow_driver(_config: &ConnectionConfig) -> tsbridge_core::Result<Arc<dyn Driver>> {
    Ok(Arc::new(SlowDriver(NullDriver::new())))
}

fn query(name: &str) -> Query {
    Query::new(
        MetricIdentifier::new(name).unwrap(),
        TimeRange::last(Duration::minutes(5)).unwrap(),
    )
}

fn series(host: &str, dc: &str) -> Series {
    let mut labels = BTreeMap::new();
    labels.insert("host".to_string(), host.to_string());
    labels.insert("dc".to_string(), dc.to_string());
    let mut s = Series::new("cpu", labels);
    s.points = vec![(1_700_000_000, 1.0)];
    s
}

#[tokio::test]
async fn test_connections_are_created_once_and_closed() {
    let manager = ConnectionManager::new(Settings::default());

    let first = manager.connection("local").await.unwrap();
    let second = manager.default_connection().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.name(), "null");
    assert_eq!(manager.open_connections().await, vec!["local".to_string()]);

    manager.close_all().await;
    assert!(manager.open_connections().await.is_empty());
}

#[tokio::test]
async fn test_slow_connect_does_not_block_other_connections() {
    let mut registry = DriverRegistry::with_builtins();
    registry.register_driver("slow", slow_driver);
    let mut settings = Settings::default();
    settings
        .connections
        .insert("remote".to_string(), ConnectionConfig::new("slow", ""));
    let manager = Arc::new(ConnectionManager::with_registry(settings, registry));

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connection("remote").await.map(|d| d.name().to_string()) })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let local = tokio::time::timeout(std::time::Duration::from_millis(200), manager.connection("local"))
        .await
        .expect("local lookup waited on the slow connect")
        .unwrap();
    assert_eq!(local.name(), "null");

    assert_eq!(connecting.await.unwrap().unwrap(), "slow");
    assert_eq!(
        manager.open_connections().await,
        vec!["local".to_string(), "remote".to_string()]
    );
}

#[tokio::test]
async fn test_unknown_connection_is_reported() {
    let manager = ConnectionManager::new(Settings::default());
    let err = manager.connection("missing").await.err().unwrap();
    assert!(matches!(err, ClientError::UnknownConnection(name) if name == "missing"));
}

#[tokio::test]
async fn test_batch_keeps_outcomes_independent() {
    let mut driver = MockDriver::new();
    driver.expect_execute().times(3).returning(|query| {
        if query.metric().name() == "broken" {
            Err(Error::Transport("connection reset".to_string()))
        } else {
            Ok(QueryResult::from_series(vec![series("a", "east")], HashMap::new()))
        }
    });
    driver.expect_close().times(1).return_const(());

    let manager = ConnectionManager::new(Settings::default());
    manager.insert("mock", Arc::new(driver)).await;

    let outcomes = manager
        .query_batch("mock", &[query("cpu"), query("broken"), query("mem")])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].as_ref().unwrap().has_data());
    assert!(matches!(outcomes[1], Err(ClientError::Core(Error::Transport(_)))));
    assert!(outcomes[2].is_ok());

    manager.close_all().await;
}

#[tokio::test]
async fn test_schema_collects_label_values() {
    let mut driver = MockDriver::new();
    driver.expect_execute().times(1).returning(|_| {
        Ok(QueryResult::from_series(
            vec![series("a", "east"), series("b", "east"), series("a", "west")],
            HashMap::new(),
        ))
    });

    let schema = Schema::new(Arc::new(driver));
    let labels = schema
        .labels(
            &MetricIdentifier::new("cpu").unwrap(),
            &TimeRange::last(Duration::hours(1)).unwrap(),
        )
        .await
        .unwrap();

    let hosts: Vec<&str> = labels["host"].iter().map(String::as_str).collect();
    let dcs: Vec<&str> = labels["dc"].iter().map(String::as_str).collect();
    assert_eq!(hosts, vec!["a", "b"]);
    assert_eq!(dcs, vec!["east", "west"]);
}

#[tokio::test]
async fn test_schema_surfaces_failed_results() {
    let mut driver = MockDriver::new();
    driver
        .expect_execute()
        .returning(|_| Ok(QueryResult::failed("bucket not found", HashMap::new())));

    let schema = Schema::new(Arc::new(driver));
    let err = schema
        .labels(
            &MetricIdentifier::new("cpu").unwrap(),
            &TimeRange::last(Duration::hours(1)).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Backend(message) if message == "bucket not found"));
}

#[tokio::test]
async fn test_metric_exists_is_unsupported() {
    let schema = Schema::new(Arc::new(MockDriver::new()));
    let err = schema
        .metric_exists(&MetricIdentifier::new("cpu").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Core(Error::UnsupportedOperation { .. })
    ));
}

#[tokio::test]
async fn test_graph_needs_graph_capable_driver() {
    let manager = ConnectionManager::new(Settings::default());
    let driver = manager.default_connection().await.unwrap();

    let graph = Graph::new("/tmp/cpu.png", TimeRange::last(Duration::hours(1)).unwrap())
        .with_line(MetricIdentifier::new("cpu").unwrap(), AggregateFunction::Avg);
    let err = graph.render(driver.as_ref()).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Core(Error::UnsupportedOperation { .. })
    ));
}

#[tokio::test]
async fn test_graph_reports_backend_failure() {
    let mut driver = MockDriver::new();
    driver
        .expect_render_graph()
        .withf(|request| request.lines.len() == 1 && request.width == 400)
        .times(1)
        .returning(|_| Ok(CommandResponse::failure("rrdtool: no such file", HashMap::new())));

    let graph = Graph::new("/tmp/cpu.png", TimeRange::last(Duration::hours(1)).unwrap())
        .with_size(400, 100)
        .with_line(MetricIdentifier::new("cpu").unwrap(), AggregateFunction::Max);
    let err = graph.render(&driver).await.unwrap_err();
    assert!(matches!(err, ClientError::Backend(_)));
}
