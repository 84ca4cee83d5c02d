//! HTTP transport for the line-protocol store.
//!
//! Commands understood by [`HttpAdapter::execute_command`]:
//! - `query`: POST the Flux program in `data` to `/api/v2/query`
//! - `write`: POST the line protocol in `data` to `/api/v2/write`
//! - `ping`: GET `/health`

use crate::connection::{
    ensure_connected, metadata, CommandResponse, ConnectionAdapter, ConnectionState, ReconnectPolicy,
};
use crate::error::{Error, Result};
use crate::time::TimePrecision;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ADAPTER_NAME: &str = "influxdb-http";

/// Resolved HTTP endpoint settings.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    pub precision: TimePrecision,
    pub timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

pub struct HttpAdapter {
    settings: HttpSettings,
    client: Mutex<Option<Client>>,
    lock: Mutex<()>,
    state: ConnectionState,
}

impl HttpAdapter {
    pub fn new(settings: HttpSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
            lock: Mutex::new(()),
            state: ConnectionState::new(ADAPTER_NAME),
        }
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.settings.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.settings.token {
            Some(token) => request.header("Authorization", format!("Token {}", token)),
            None => request,
        }
    }

    /// `None` for commands this adapter does not know.
    fn request(&self, client: &Client, command: &str, data: &str) -> Option<RequestBuilder> {
        let request = match command {
            "query" => client
                .post(self.endpoint("/api/v2/query"))
                .query(&[("org", self.settings.org.as_str())])
                .header("Content-Type", "application/vnd.flux")
                .header("Accept", "application/csv")
                .body(data.to_string()),
            "write" => client
                .post(self.endpoint("/api/v2/write"))
                .query(&[
                    ("org", self.settings.org.as_str()),
                    ("bucket", self.settings.bucket.as_str()),
                    ("precision", self.settings.precision.as_str()),
                ])
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(data.to_string()),
            "ping" => client.get(self.endpoint("/health")),
            _ => return None,
        };
        Some(self.authorize(request))
    }

    async fn current_client(&self) -> Option<Client> {
        self.client.lock().await.clone()
    }
}

#[async_trait]
impl ConnectionAdapter for HttpAdapter {
    async fn connect(&self) -> bool {
        let client = match Client::builder().timeout(self.settings.timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "failed to build HTTP client");
                return false;
            }
        };

        match client.get(self.endpoint("/health")).send().await {
            Ok(response) if response.status().is_success() => {
                *self.client.lock().await = Some(client);
                self.state.mark_connected();
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), url = %self.settings.url, "health check failed");
                false
            }
            Err(e) => {
                warn!(error = %e, url = %self.settings.url, "backend unreachable");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn execute_command(&self, command: &str, data: &str) -> Result<CommandResponse> {
        ensure_connected(self, ADAPTER_NAME).await?;
        let client = self
            .current_client()
            .await
            .ok_or_else(|| Error::NotConnected(format!("{} adapter has no client", ADAPTER_NAME)))?;

        let request = match self.request(&client, command, data) {
            Some(request) => request,
            None => {
                let mut meta = metadata("kind", "unknown_command");
                meta.insert("command".to_string(), Value::from(command));
                return Ok(CommandResponse::failure(
                    format!("unknown {} command '{}'", ADAPTER_NAME, command),
                    meta,
                ));
            }
        };

        // Held until the body is read so commands never interleave.
        let _guard = self.lock.lock().await;
        debug!(command, bytes = data.len(), "sending request");
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if e.is_timeout() || e.is_connect() {
                    self.state.mark_disconnected(&e.to_string());
                }
                let kind = if e.is_timeout() { "timeout" } else { "transport" };
                return Ok(CommandResponse::failure(e.to_string(), metadata("kind", kind)));
            }
        };

        let status = response.status();
        let mut meta = metadata("status", status.as_u16());
        meta.insert("command".to_string(), Value::from(command));
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(CommandResponse::failure(e.to_string(), meta)),
        };

        if status.is_success() {
            Ok(CommandResponse::success(body, meta))
        } else {
            Ok(CommandResponse::failure(
                format!("HTTP {}: {}", status.as_u16(), body.trim()),
                meta,
            ))
        }
    }

    async fn close(&self) {
        self.client.lock().await.take();
        self.state.mark_disconnected("closed");
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        self.settings.reconnect
    }
}
