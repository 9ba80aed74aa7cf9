//! HTTP transport for the collector API
//!
//! Uploads and session calls are plain JSON POSTs carrying an optional
//! `X-API-Key` header. The termination signal goes through a host
//! [`BeaconSink`] when one is installed, and otherwise through a detached
//! best-effort POST.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::config::AgentConfig;
use crate::error::{Error, Result};

use super::wire::{
    HeartbeatRequest, IngestRequest, IngestResponse, SessionEndRequest, SessionStartRequest,
    HEARTBEAT_PATH, INGEST_PATH, SESSION_END_PATH, SESSION_START_PATH,
};
use super::Transport;

/// Header carrying the project API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Largest body the teardown-safe delivery mode will carry
pub const KEEPALIVE_BODY_LIMIT: usize = 64 * 1024;

/// Host delivery primitive that survives page teardown
///
/// Implementations queue the payload and return immediately. They can't set
/// headers, which is why the termination body embeds the API key.
pub trait BeaconSink: Send + Sync + fmt::Debug {
    /// Queue `body` for delivery to `url`. Returns false if the payload was not accepted.
    fn send_beacon(&self, url: &str, body: Vec<u8>) -> bool;
}

/// HTTP client for the collector API
#[derive(Debug)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_key_header: Option<HeaderValue>,
    unload_timeout: Duration,
    beacon_sink: Option<Arc<dyn BeaconSink>>,
    pending_beacons: Mutex<JoinSet<()>>,
}

impl HttpTransport {
    /// Create a new transport from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config.base_url()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let api_key_header = config
            .api_key
            .as_deref()
            .map(|key| {
                HeaderValue::from_str(key)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))
            })
            .transpose()?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            api_key: config.api_key.clone(),
            api_key_header,
            unload_timeout: config.unload_timeout(),
            beacon_sink: None,
            pending_beacons: Mutex::new(JoinSet::new()),
        })
    }

    /// Route termination signals through a host beacon primitive
    pub fn with_beacon_sink(mut self, sink: Arc<dyn BeaconSink>) -> Self {
        self.beacon_sink = Some(sink);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a JSON POST to `path`
    ///
    /// Unloading requests get the short teardown timeout and are refused
    /// locally when the body exceeds [`KEEPALIVE_BODY_LIMIT`].
    pub(crate) fn build_post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        unloading: bool,
    ) -> Result<reqwest::Request> {
        let bytes = serde_json::to_vec(body)?;
        if unloading && bytes.len() > KEEPALIVE_BODY_LIMIT {
            return Err(Error::PayloadTooLarge {
                size: bytes.len(),
                limit: KEEPALIVE_BODY_LIMIT,
            });
        }

        let mut builder = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .body(bytes);
        if let Some(key) = &self.api_key_header {
            builder = builder.header(API_KEY_HEADER, key.clone());
        }
        if unloading {
            builder = builder.timeout(self.unload_timeout);
        }
        Ok(builder.build()?)
    }

    /// Termination body with the API key embedded
    pub(crate) fn beacon_body(&self, request: &SessionEndRequest) -> Result<Vec<u8>> {
        let mut request = request.clone();
        request.api_key = self.api_key.clone();
        Ok(serde_json::to_vec(&request)?)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let response = self.http_client.execute(request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Status {
                status: status.as_u16(),
                body: error_text,
            })
        }
    }

    fn spawn_fallback_beacon(&self, request: SessionEndRequest) {
        let session_id = request.session_id.clone();
        let post = self.beacon_body(&request).and_then(|body| {
            let mut builder = self
                .http_client
                .post(format!("{}{}", self.base_url, SESSION_END_PATH))
                .body(body)
                .timeout(self.unload_timeout);
            if let Some(key) = &self.api_key_header {
                builder = builder.header(API_KEY_HEADER, key.clone());
            }
            Ok(builder.build()?)
        });

        let post = match post {
            Ok(post) => post,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Dropping termination signal");
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(session_id = %session_id, "No runtime for termination signal, dropping");
            return;
        };

        let client = self.http_client.clone();
        let task = async move {
            match client.execute(post).await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(session_id = %session_id, "Termination signal delivered");
                }
                Ok(response) => {
                    tracing::debug!(
                        session_id = %session_id,
                        status = response.status().as_u16(),
                        "Termination signal rejected"
                    );
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Termination signal failed");
                }
            }
        };

        if let Ok(mut pending) = self.pending_beacons.lock() {
            // Reap finished deliveries so the set doesn't grow across sessions.
            while pending.try_join_next().is_some() {}
            pending.spawn_on(task, &runtime);
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start_session(&self, request: &SessionStartRequest) -> Result<()> {
        let post = self.build_post(SESSION_START_PATH, request, false)?;
        self.execute(post).await?;
        Ok(())
    }

    async fn upload(&self, request: &IngestRequest, unloading: bool) -> Result<()> {
        let post = self.build_post(INGEST_PATH, request, unloading)?;
        let response = self.execute(post).await?;

        // The collector stored the batch once it answered 2xx; an unreadable
        // acknowledgement must not trigger a duplicate upload.
        match response.json::<IngestResponse>().await {
            Ok(ack) => tracing::debug!(
                session_id = %request.session_id,
                events_received = ack.events_received,
                "Collector acknowledged batch"
            ),
            Err(e) => tracing::debug!(
                session_id = %request.session_id,
                error = %e,
                "Unreadable ingest acknowledgement"
            ),
        }
        Ok(())
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<()> {
        let post = self.build_post(HEARTBEAT_PATH, request, false)?;
        self.execute(post).await?;
        Ok(())
    }

    fn beacon(&self, request: SessionEndRequest) {
        if let Some(sink) = &self.beacon_sink {
            match self.beacon_body(&request) {
                Ok(body) => {
                    let url = format!("{}{}", self.base_url, SESSION_END_PATH);
                    if sink.send_beacon(&url, body) {
                        tracing::debug!(session_id = %request.session_id, "Termination signal queued");
                        return;
                    }
                    tracing::debug!(
                        session_id = %request.session_id,
                        "Beacon refused payload, falling back to POST"
                    );
                }
                Err(e) => {
                    tracing::debug!(session_id = %request.session_id, error = %e, "Dropping termination signal");
                    return;
                }
            }
        }
        self.spawn_fallback_beacon(request);
    }

    async fn close(&self) {
        let mut pending = match self.pending_beacons.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        let wait = async { while pending.join_next().await.is_some() {} };
        if tokio::time::timeout(self.unload_timeout, wait).await.is_err() {
            tracing::debug!("Abandoning undelivered termination signals");
        }
    }
}
