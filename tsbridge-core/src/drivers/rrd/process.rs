//! `rrdtool` child-process transport.
//!
//! `execute_command(kind, data)` runs `<binary> <kind> <args...>` where `data`
//! is a JSON array of string arguments. Commands run one at a time, each under
//! the configured timeout; a child that overruns is killed.

use super::command::RrdCommandKind;
use crate::connection::{
    ensure_connected, metadata, CommandResponse, ConnectionAdapter, ConnectionState, ReconnectPolicy,
};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ADAPTER_NAME: &str = "rrdtool";

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub binary: PathBuf,
    pub directory: PathBuf,
    /// rrdcached address, passed through `RRDCACHED_ADDRESS`
    pub daemon: Option<String>,
    pub timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

pub struct ProcessAdapter {
    settings: ProcessSettings,
    lock: Mutex<()>,
    state: ConnectionState,
}

impl ProcessAdapter {
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            settings,
            lock: Mutex::new(()),
            state: ConnectionState::new(ADAPTER_NAME),
        }
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    fn parse_args(data: &str) -> std::result::Result<Vec<String>, String> {
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<String>>(data)
            .map_err(|e| format!("arguments must be a JSON array of strings: {}", e))
    }
}

#[async_trait]
impl ConnectionAdapter for ProcessAdapter {
    async fn connect(&self) -> bool {
        match tokio::fs::metadata(&self.settings.directory).await {
            Ok(meta) if meta.is_dir() => {
                self.state.mark_connected();
                true
            }
            Ok(_) => {
                warn!(directory = %self.settings.directory.display(), "rrd store is not a directory");
                false
            }
            Err(e) => {
                warn!(directory = %self.settings.directory.display(), error = %e, "rrd store unavailable");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn execute_command(&self, command: &str, data: &str) -> Result<CommandResponse> {
        ensure_connected(self, ADAPTER_NAME).await?;

        let kind = match command.parse::<RrdCommandKind>() {
            Ok(kind) => kind,
            Err(e) => return Ok(CommandResponse::failure(e.to_string(), metadata("command", command))),
        };
        let args = match Self::parse_args(data) {
            Ok(args) => args,
            Err(e) => return Ok(CommandResponse::failure(e, metadata("command", command))),
        };

        let _guard = self.lock.lock().await;
        let mut child = Command::new(&self.settings.binary);
        child
            .arg(kind.as_str())
            .args(&args)
            .current_dir(&self.settings.directory)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(daemon) = &self.settings.daemon {
            child.env("RRDCACHED_ADDRESS", daemon);
        }

        debug!(command = kind.as_str(), args = args.len(), "spawning rrdtool");
        let mut meta = metadata("command", kind.as_str());
        let output = match tokio::time::timeout(self.settings.timeout, child.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(CommandResponse::failure(format!("failed to run rrdtool: {}", e), meta)),
            Err(_) => {
                warn!(command = kind.as_str(), timeout = ?self.settings.timeout, "rrdtool timed out");
                meta.insert("kind".to_string(), Value::from("timeout"));
                return Ok(CommandResponse::failure(
                    format!("rrdtool {} timed out after {:?}", kind, self.settings.timeout),
                    meta,
                ));
            }
        };

        meta.insert("exit_code".to_string(), Value::from(output.status.code().unwrap_or(-1)));
        if output.status.success() {
            Ok(CommandResponse::success(String::from_utf8_lossy(&output.stdout), meta))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(CommandResponse::failure(stderr.trim().to_string(), meta))
        }
    }

    async fn close(&self) {
        self.state.mark_disconnected("closed");
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        self.settings.reconnect
    }
}
