//! Flat-file transport.
//!
//! Commands, with paths relative to the store root:
//! - `list <dir>`: series file names in `dir`, one per line
//! - `read <file>`: file contents
//! - `append {"path": .., "content": ..}`: appends to a file, creating it

use super::target::EXTENSION;
use crate::connection::{
    ensure_connected, metadata, CommandResponse, ConnectionAdapter, ConnectionState, ReconnectPolicy,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ADAPTER_NAME: &str = "flat-file";

/// Payload of the `append` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub path: String,
    pub content: String,
}

pub struct FlatFileAdapter {
    root: PathBuf,
    timeout: Duration,
    reconnect: ReconnectPolicy,
    lock: Mutex<()>,
    state: ConnectionState,
}

impl FlatFileAdapter {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration, reconnect: ReconnectPolicy) -> Self {
        Self {
            root: root.into(),
            timeout,
            reconnect,
            lock: Mutex::new(()),
            state: ConnectionState::new(ADAPTER_NAME),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a store-relative path, refusing anything that escapes the root.
    fn resolve(&self, relative: &str) -> std::result::Result<PathBuf, String> {
        let relative = Path::new(relative.trim());
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(format!("path '{}' escapes the store", relative.display()));
        }
        Ok(self.root.join(relative))
    }

    async fn list(&self, dir: &Path) -> std::io::Result<String> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(EXTENSION) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names.join("\n"))
    }

    async fn append(&self, file: &Path, content: &str) -> std::io::Result<String> {
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .await?;
        handle.write_all(content.as_bytes()).await?;
        if !content.ends_with('\n') {
            handle.write_all(b"\n").await?;
        }
        handle.flush().await?;
        Ok(String::new())
    }

    async fn dispatch(&self, command: &str, data: &str) -> std::result::Result<std::io::Result<String>, String> {
        match command {
            "list" => Ok(self.list(&self.resolve(data)?).await),
            "read" => Ok(tokio::fs::read_to_string(self.resolve(data)?).await),
            "append" => {
                let request: AppendRequest = serde_json::from_str(data)
                    .map_err(|e| format!("malformed append request: {}", e))?;
                let file = self.resolve(&request.path)?;
                Ok(self.append(&file, &request.content).await)
            }
            other => Err(format!("unknown {} command '{}'", ADAPTER_NAME, other)),
        }
    }
}

#[async_trait]
impl ConnectionAdapter for FlatFileAdapter {
    async fn connect(&self) -> bool {
        match tokio::fs::create_dir_all(&self.root).await {
            Ok(()) => {
                self.state.mark_connected();
                true
            }
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "flat-file store unavailable");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn execute_command(&self, command: &str, data: &str) -> Result<CommandResponse> {
        ensure_connected(self, ADAPTER_NAME).await?;
        let _guard = self.lock.lock().await;
        debug!(command, "flat-file command");

        let meta = metadata("command", command);
        match tokio::time::timeout(self.timeout, self.dispatch(command, data)).await {
            Err(_) => Ok(CommandResponse::failure(
                format!("{} timed out after {:?}", command, self.timeout),
                meta,
            )),
            Ok(Err(message)) => Ok(CommandResponse::failure(message, meta)),
            Ok(Ok(Err(e))) => Ok(CommandResponse::failure(e.to_string(), meta)),
            Ok(Ok(Ok(body))) => Ok(CommandResponse::success(body, meta)),
        }
    }

    async fn close(&self) {
        self.state.mark_disconnected("closed");
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn adapter(root: &Path) -> FlatFileAdapter {
        FlatFileAdapter::new(root, Duration::from_secs(5), ReconnectPolicy::Never)
    }

    #[tokio::test]
    async fn test_closed_adapter_fails_commands() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        assert!(adapter.connect().await);
        assert!(adapter.is_connected());

        adapter.close().await;
        assert!(!adapter.is_connected());
        assert!(matches!(
            adapter.execute_command("list", ".").await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_append_list_read() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        assert!(adapter.connect().await);

        let request = AppendRequest {
            path: "stats/cpu/load.dat".to_string(),
            content: "1700000000 1.5".to_string(),
        };
        let payload = serde_json::to_string(&request).unwrap();
        assert!(adapter.execute_command("append", &payload).await.unwrap().is_success());
        assert!(adapter.execute_command("append", &payload).await.unwrap().is_success());

        let listing = adapter.execute_command("list", "stats/cpu").await.unwrap();
        assert_eq!(listing.data(), "load.dat");
        let body = adapter.execute_command("read", "stats/cpu/load.dat").await.unwrap();
        assert_eq!(body.data(), "1700000000 1.5\n1700000000 1.5\n");

        let missing = adapter.execute_command("list", "nothing/here").await.unwrap();
        assert!(missing.is_success());
        assert_eq!(missing.data(), "");
    }

    #[tokio::test]
    async fn test_escaping_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        assert!(adapter.connect().await);

        let response = adapter.execute_command("read", "../secret.dat").await.unwrap();
        assert!(!response.is_success());
        assert!(adapter.is_connected());
        let response = adapter.execute_command("read", "/etc/passwd").await.unwrap();
        assert!(!response.is_success());
    }
}
