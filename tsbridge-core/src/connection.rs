//! Transport-neutral connection adapter contract.
//!
//! Adapters move between two states: `Disconnected` and `Connected`.
//! `connect` enters `Connected` on success; `close` or a fatal transport
//! error leaves it. `execute_command` only runs while connected; otherwise
//! the adapter's declared [`ReconnectPolicy`] decides between one reconnect
//! attempt and an immediate [`Error::NotConnected`].
//!
//! Transport failures during a command are not errors at this level. They
//! come back as [`CommandResponse::failure`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Outcome of one command. `error` is set exactly when `success` is false.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    success: bool,
    data: String,
    metadata: HashMap<String, Value>,
    error: Option<String>,
}

impl CommandResponse {
    pub fn success(data: impl Into<String>, metadata: HashMap<String, Value>) -> Self {
        Self {
            success: true,
            data: data.into(),
            metadata,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, metadata: HashMap<String, Value>) -> Self {
        Self {
            success: false,
            data: String::new(),
            metadata,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// What an adapter does when a command arrives while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Fail with `NotConnected`.
    #[default]
    Never,
    /// Try `connect` once, then fail with `NotConnected`.
    Once,
}

/// Contract every backend transport implements.
#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    /// Opens the transport. Returns whether the adapter is now connected.
    async fn connect(&self) -> bool;

    /// Current state, without side effects.
    fn is_connected(&self) -> bool;

    /// Runs one command. Only `NotConnected` is returned as an error.
    async fn execute_command(&self, command: &str, data: &str) -> Result<CommandResponse>;

    /// Closes the transport. Idempotent.
    async fn close(&self);

    fn reconnect_policy(&self) -> ReconnectPolicy;
}

/// Applies `adapter`'s reconnect policy before a command.
pub async fn ensure_connected<A>(adapter: &A, name: &str) -> Result<()>
where
    A: ConnectionAdapter + ?Sized,
{
    if adapter.is_connected() {
        return Ok(());
    }

    match adapter.reconnect_policy() {
        ReconnectPolicy::Never => Err(Error::NotConnected(format!("{} adapter is closed", name))),
        ReconnectPolicy::Once => {
            warn!(adapter = name, "command on closed adapter, reconnecting once");
            if adapter.connect().await {
                Ok(())
            } else {
                Err(Error::NotConnected(format!("{} adapter failed to reconnect", name)))
            }
        }
    }
}

/// Connected/disconnected flag with logged transitions.
#[derive(Debug)]
pub struct ConnectionState {
    name: &'static str,
    connected: AtomicBool,
}

impl ConnectionState {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            debug!(adapter = self.name, "connected");
        }
    }

    pub fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(adapter = self.name, reason, "disconnected");
        }
    }
}

/// Metadata map with a single entry.
pub fn metadata(key: &str, value: impl Into<Value>) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert(key.to_string(), value.into());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_has_no_error() {
        let response = CommandResponse::success("ok", metadata("rows", 3));
        assert!(response.is_success());
        assert_eq!(response.error(), None);
        assert_eq!(response.data(), "ok");
        assert_eq!(response.metadata()["rows"], Value::from(3));
    }

    #[test]
    fn test_failure_has_empty_data() {
        let response = CommandResponse::failure("boom", HashMap::new());
        assert!(!response.is_success());
        assert_eq!(response.data(), "");
        assert_eq!(response.error(), Some("boom"));
    }

    #[test]
    fn test_state_transitions() {
        let state = ConnectionState::new("test");
        assert!(!state.is_connected());
        state.mark_connected();
        assert!(state.is_connected());
        state.mark_disconnected("closed");
        assert!(!state.is_connected());
    }
}
