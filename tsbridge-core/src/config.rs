//! Resolved per-connection settings consumed by driver factories.
//!
//! Loading these (files, environment, CLI) is the caller's business; the
//! core only reads the resolved struct. Option values are strings, parsed by
//! each driver with [`ConnectionConfig::option`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Authentication credentials for a backend.
#[derive(Clone, Deserialize, Serialize)]
pub struct Credentials {
    /// Username for authentication
    pub username: String,
    /// Password or API token
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings for one named connection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Registered driver name ("influxdb", "rrd", "graphite", "null")
    pub driver: String,
    /// Backend location: a base URL or a directory path
    #[serde(default)]
    pub connection: String,
    /// Driver-specific options
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Authentication credentials (never read from config files)
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

/// Default command timeout when a connection does not set `timeout_secs`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl ConnectionConfig {
    pub fn new(driver: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            connection: connection.into(),
            options: HashMap::new(),
            credentials: None,
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Parses option `key`. A present but unparsable value is an error.
    pub fn option<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.options.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                Error::Configuration(format!("invalid value '{}' for option '{}': {}", raw, key, e))
            }),
        }
    }

    pub fn timeout(&self) -> Result<Duration> {
        Ok(self
            .option::<u64>("timeout_secs")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT))
    }

    pub fn require_connection(&self) -> Result<&str> {
        if self.connection.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "driver '{}' needs a connection string",
                self.driver
            )));
        }
        Ok(&self.connection)
    }
}
