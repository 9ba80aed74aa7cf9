//! Core domain types for sessionreel
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One recording lifetime, identified by a single session id |
//! | **Event** | An opaque record produced by the recording engine |
//! | **Batch** | An ordered group of events transmitted in one upload call |
//! | **Termination signal** | The one-shot notification that a session ended |
//! | **Lifecycle event** | A host page signal (visibility change, page hide, unload) |
//! | **Beacon** | Fire-and-forget delivery that survives page teardown |
//!
//! Events are never interpreted by this crate beyond counting and ordering
//! them; their shape belongs to the recording engine and the collector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// A captured event, opaque to the pipeline
pub type Event = serde_json::Value;

/// An ordered group of events. Order within a batch is capture order.
pub type EventBatch = Vec<Event>;

// ============================================
// Session
// ============================================

/// One recording lifetime.
///
/// Owned by a single [`CaptureAgent`](crate::agent::CaptureAgent) start/stop
/// cycle. The event count lives in the session's
/// [`EventBuffer`](crate::buffer::EventBuffer).
#[derive(Debug)]
pub struct Session {
    id: String,
    started_at: DateTime<Utc>,
    termination_signaled: AtomicBool,
}

impl Session {
    pub fn new(id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            termination_signaled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn termination_signaled(&self) -> bool {
        self.termination_signaled.load(Ordering::Acquire)
    }

    /// Close the termination latch.
    ///
    /// Returns true only for the first caller.
    pub fn latch_termination(&self) -> bool {
        self.termination_signaled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Point-in-time view of a session, for callers outside the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub total_event_count: u64,
    pub termination_signaled: bool,
}

/// Session identity record kept in durable storage
///
/// Survives reloads; logically expires once idle beyond the idle timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSessionRecord {
    pub session_id: String,
    /// Milliseconds since the UNIX epoch
    pub last_seen_at: i64,
}

// ============================================
// Host context
// ============================================

/// Width/height pair in CSS pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Description of the page being recorded, supplied by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub referrer: Option<String>,
    pub user_agent: String,
    pub screen: Dimensions,
    pub viewport: Dimensions,
}

impl Default for PageContext {
    fn default() -> Self {
        Self {
            url: String::new(),
            referrer: None,
            user_agent: concat!("sessionreel/", env!("CARGO_PKG_VERSION")).to_string(),
            screen: Dimensions::default(),
            viewport: Dimensions::default(),
        }
    }
}

/// Application user attached to a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: Option<String>,
    pub user_email: Option<String>,
}
