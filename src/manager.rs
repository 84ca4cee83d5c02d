//! Named connections, created on first use and shared afterwards.

use crate::config::Settings;
use crate::error::{ClientError, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tsbridge_core::registry::{self, DriverRegistry};
use tsbridge_core::{Driver, Query, QueryResult};

pub struct ConnectionManager {
    settings: Settings,
    registry: DriverRegistry,
    drivers: Arc<Mutex<HashMap<String, Arc<dyn Driver>>>>,
}

impl ConnectionManager {
    /// Manager over the process-wide driver registry.
    pub fn new(settings: Settings) -> Self {
        Self::with_registry(settings, registry::global().clone())
    }

    pub fn with_registry(settings: Settings, registry: DriverRegistry) -> Self {
        Self {
            settings,
            registry,
            drivers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registers an already built driver under `name`, replacing any cached one.
    pub async fn insert(&self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.lock().await.insert(name.into(), driver);
    }

    /// Driver for connection `name`, built and connected on first use.
    ///
    /// A failed initial connect is logged, not returned: the driver's
    /// reconnect policy decides what happens on the first command.
    /// The map is not locked while connecting, so a slow backend does not
    /// stall lookups of other connections. If two callers race on the same
    /// name, the first driver stored wins and the other is closed.
    pub async fn connection(&self, name: &str) -> Result<Arc<dyn Driver>> {
        if let Some(driver) = self.drivers.lock().await.get(name) {
            return Ok(driver.clone());
        }

        let config = self.settings.connection(name)?;
        let driver = self.registry.create(config)?;
        if driver.connect().await {
            info!(connection = name, driver = driver.name(), "connected");
        } else {
            warn!(connection = name, driver = driver.name(), "initial connect failed");
        }

        let stored = self
            .drivers
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| driver.clone())
            .clone();
        if !Arc::ptr_eq(&stored, &driver) {
            driver.close().await;
        }
        Ok(stored)
    }

    pub async fn default_connection(&self) -> Result<Arc<dyn Driver>> {
        let name = self.settings.default.clone();
        self.connection(&name).await
    }

    /// Runs independent queries concurrently on one connection. Each query
    /// gets its own outcome; one failure does not affect the others.
    pub async fn query_batch(&self, name: &str, queries: &[Query]) -> Result<Vec<Result<QueryResult>>> {
        let driver = self.connection(name).await?;
        let outcomes = join_all(queries.iter().map(|query| driver.execute(query))).await;
        Ok(outcomes
            .into_iter()
            .map(|outcome| outcome.map_err(ClientError::from))
            .collect())
    }

    /// Closes and forgets every open connection.
    pub async fn close_all(&self) {
        let drivers: Vec<(String, Arc<dyn Driver>)> = self.drivers.lock().await.drain().collect();
        for (name, driver) in drivers {
            driver.close().await;
            info!(connection = %name, "closed");
        }
    }

    pub async fn open_connections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
