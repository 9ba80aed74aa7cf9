//! Delivery to the collector
//!
//! [`Transport`] is the seam to the network: one call per collector
//! endpoint. [`TransportLayer`] wraps a transport with the delivery contract
//! for one session:
//!
//! - a failed upload hands its batch back to the front of the
//!   [`EventBuffer`], so the next flush retries it (at-least-once, batch
//!   order preserved, no deduplication);
//! - transient failures of ordinary uploads are first retried in place with
//!   bounded exponential backoff;
//! - uploads issued while the page is unloading never sleep;
//! - session start, heartbeat and termination are fire-and-forget.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sessionreel_core::config::AgentConfig;
//! use sessionreel_core::transport::HttpTransport;
//!
//! let transport = HttpTransport::new(&AgentConfig::new("https://collector.example"))
//!     .expect("valid configuration");
//! ```

mod http;
mod memory;
pub mod wire;

pub use http::{BeaconSink, HttpTransport, API_KEY_HEADER, KEEPALIVE_BODY_LIMIT};
pub use memory::{MemoryTransport, SentRequest};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::buffer::EventBuffer;
use crate::clock::Clock;
use crate::error::Result;
use crate::stats::StatsRecorder;
use crate::types::EventBatch;

use wire::{HeartbeatRequest, IngestRequest, SessionEndRequest, SessionStartRequest};

/// One call per collector endpoint
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// `POST /api/sessions/start`
    async fn start_session(&self, request: &SessionStartRequest) -> Result<()>;

    /// `POST /api/ingest`; `unloading` selects teardown-safe delivery
    async fn upload(&self, request: &IngestRequest, unloading: bool) -> Result<()>;

    /// `POST /api/sessions/heartbeat`
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<()>;

    /// Queue the termination signal. Must not block; failures are swallowed.
    fn beacon(&self, request: SessionEndRequest);

    /// Give queued fire-and-forget deliveries a bounded chance to finish
    async fn close(&self) {}
}

/// Backoff for in-place retries of transient upload failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Never retry in place; failures go straight back to the buffer
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Delivery contract for one session
#[derive(Debug)]
pub struct TransportLayer {
    transport: Arc<dyn Transport>,
    buffer: EventBuffer,
    session_id: String,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    stats: Arc<StatsRecorder>,
}

impl TransportLayer {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        buffer: EventBuffer,
        session_id: String,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            transport,
            buffer,
            session_id,
            clock,
            retry,
            stats,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Upload a batch, requeueing it at the buffer head on failure
    ///
    /// Returns true once the collector acknowledged the batch.
    pub async fn upload(&self, batch: EventBatch, unloading: bool) -> bool {
        if batch.is_empty() {
            return true;
        }

        let count = batch.len();
        let mut request = IngestRequest {
            session_id: self.session_id.clone(),
            events: batch,
            timestamp: self.clock.now_ms(),
        };
        let mut attempt = 0;
        let mut delay = self.retry.initial_delay;

        loop {
            match self.transport.upload(&request, unloading).await {
                Ok(()) => {
                    self.stats.upload_ok();
                    tracing::debug!(
                        session_id = %self.session_id,
                        events = count,
                        unloading,
                        "Uploaded batch"
                    );
                    return true;
                }
                Err(e) => {
                    self.stats.upload_failed();

                    if !unloading && e.is_transient() && attempt < self.retry.max_retries {
                        attempt += 1;
                        tracing::debug!(
                            "Retrying upload (attempt {}/{}), waiting {:?}: {}",
                            attempt + 1,
                            self.retry.max_retries + 1,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                        delay = std::cmp::min(delay * 2, self.retry.max_delay);
                        request.timestamp = self.clock.now_ms();
                        continue;
                    }

                    tracing::warn!(
                        session_id = %self.session_id,
                        events = count,
                        error = %e,
                        "Upload failed, requeueing batch"
                    );
                    self.stats.requeued(count);
                    self.buffer.prepend(request.events);
                    return false;
                }
            }
        }
    }

    /// Send session metadata; failures are logged and discarded
    pub async fn start_session(&self, request: SessionStartRequest) {
        match self.transport.start_session(&request).await {
            Ok(()) => tracing::debug!(session_id = %request.session_id, "Session metadata sent"),
            Err(e) => tracing::debug!(
                session_id = %request.session_id,
                error = %e,
                "Failed to send session metadata"
            ),
        }
    }

    /// Send a heartbeat; failures are logged and discarded
    pub async fn heartbeat(&self, event_count: u64) {
        let request = HeartbeatRequest {
            session_id: self.session_id.clone(),
            timestamp: self.clock.now_ms(),
            event_count,
        };
        match self.transport.heartbeat(&request).await {
            Ok(()) => {
                self.stats.heartbeat();
                tracing::trace!(session_id = %self.session_id, event_count, "Heartbeat sent");
            }
            Err(e) => tracing::debug!(session_id = %self.session_id, error = %e, "Heartbeat failed"),
        }
    }

    /// Hand the termination signal to the transport
    pub fn beacon(&self, request: SessionEndRequest) {
        self.transport.beacon(request);
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
