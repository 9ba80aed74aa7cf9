//! In-memory transport
//!
//! Records every request instead of sending it. Used for dry runs and for
//! exercising the delivery contract without a collector.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::Event;

use super::wire::{HeartbeatRequest, IngestRequest, SessionEndRequest, SessionStartRequest};
use super::Transport;

/// A request as the collector would have received it
#[derive(Debug, Clone, PartialEq)]
pub enum SentRequest {
    SessionStart(SessionStartRequest),
    Upload {
        request: IngestRequest,
        unloading: bool,
    },
    Heartbeat(HeartbeatRequest),
    Beacon(SessionEndRequest),
}

type FailureFactory = Box<dyn Fn() -> Error + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    sent: Vec<SentRequest>,
    upload_attempts: usize,
    upload_failures: VecDeque<FailureFactory>,
    offline: bool,
}

/// Transport that records requests in memory
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryTransport")
            .field("sent", &state.sent.len())
            .field("upload_attempts", &state.upload_attempts)
            .field("pending_failures", &state.upload_failures.len())
            .field("offline", &state.offline)
            .finish()
    }
}

fn unavailable() -> Error {
    Error::Status {
        status: 503,
        body: "collector unavailable".to_string(),
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `n` upload attempts with a 503
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_next_uploads_with(n, unavailable);
    }

    /// Fail the next `n` upload attempts with errors built by `make_error`
    pub fn fail_next_uploads_with<F>(&self, n: usize, make_error: F)
    where
        F: Fn() -> Error + Clone + Send + Sync + 'static,
    {
        let mut state = self.lock();
        for _ in 0..n {
            state.upload_failures.push_back(Box::new(make_error.clone()));
        }
    }

    /// While offline every call fails with a 503 and nothing is recorded
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Every request received, in order
    pub fn sent(&self) -> Vec<SentRequest> {
        self.lock().sent.clone()
    }

    /// Upload attempts, including failed ones
    pub fn upload_attempts(&self) -> usize {
        self.lock().upload_attempts
    }

    /// Successfully delivered ingest requests
    pub fn uploads(&self) -> Vec<IngestRequest> {
        self.lock()
            .sent
            .iter()
            .filter_map(|sent| match sent {
                SentRequest::Upload { request, .. } => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every delivered event, in delivery order
    pub fn uploaded_events(&self) -> Vec<Event> {
        self.uploads()
            .into_iter()
            .flat_map(|request| request.events)
            .collect()
    }

    pub fn session_starts(&self) -> Vec<SessionStartRequest> {
        self.lock()
            .sent
            .iter()
            .filter_map(|sent| match sent {
                SentRequest::SessionStart(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.lock()
            .sent
            .iter()
            .filter_map(|sent| match sent {
                SentRequest::Heartbeat(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn beacons(&self) -> Vec<SessionEndRequest> {
        self.lock()
            .sent
            .iter()
            .filter_map(|sent| match sent {
                SentRequest::Beacon(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start_session(&self, request: &SessionStartRequest) -> Result<()> {
        let mut state = self.lock();
        if state.offline {
            return Err(unavailable());
        }
        state.sent.push(SentRequest::SessionStart(request.clone()));
        Ok(())
    }

    async fn upload(&self, request: &IngestRequest, unloading: bool) -> Result<()> {
        let mut state = self.lock();
        state.upload_attempts += 1;
        if state.offline {
            return Err(unavailable());
        }
        if let Some(make_error) = state.upload_failures.pop_front() {
            return Err(make_error());
        }
        state.sent.push(SentRequest::Upload {
            request: request.clone(),
            unloading,
        });
        Ok(())
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<()> {
        let mut state = self.lock();
        if state.offline {
            return Err(unavailable());
        }
        state.sent.push(SentRequest::Heartbeat(request.clone()));
        Ok(())
    }

    fn beacon(&self, request: SessionEndRequest) {
        let mut state = self.lock();
        if !state.offline {
            state.sent.push(SentRequest::Beacon(request));
        }
    }
}
