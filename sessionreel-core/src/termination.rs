//! One-shot "session ended" signal

use std::fmt;
use std::sync::Arc;

use crate::buffer::EventBuffer;
use crate::clock::Clock;
use crate::lifecycle::TerminationPolicy;
use crate::stats::StatsRecorder;
use crate::transport::wire::SessionEndRequest;
use crate::transport::TransportLayer;
use crate::types::Session;

/// Why a session ended, as reported to the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    VisibilityChange,
    PageHide,
    BeforeUnload,
    Unload,
    ManualStop,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::VisibilityChange => "visibilitychange",
            TerminationReason::PageHide => "pagehide",
            TerminationReason::BeforeUnload => "beforeunload",
            TerminationReason::Unload => "unload",
            TerminationReason::ManualStop => "manual_stop",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends the termination signal at most once per [`Session`]
///
/// Several unload-class events can fire for the same teardown; only the
/// first one that passes the policy gate reaches the transport.
#[derive(Debug)]
pub struct SessionTerminationSignaler {
    session: Arc<Session>,
    buffer: EventBuffer,
    layer: Arc<TransportLayer>,
    clock: Arc<dyn Clock>,
    policy: TerminationPolicy,
    stats: Arc<StatsRecorder>,
}

impl SessionTerminationSignaler {
    pub(crate) fn new(
        session: Arc<Session>,
        buffer: EventBuffer,
        layer: Arc<TransportLayer>,
        clock: Arc<dyn Clock>,
        policy: TerminationPolicy,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            session,
            buffer,
            layer,
            clock,
            policy,
            stats,
        }
    }

    /// Signal the end of the session
    ///
    /// Returns true if a signal was handed to the transport by this call.
    /// A session below the policy's minimum duration is not signaled and the
    /// latch stays open.
    pub fn signal(&self, reason: TerminationReason) -> bool {
        if let Some(min_duration) = self.policy.min_duration() {
            let elapsed = (self.clock.now() - self.session.started_at())
                .to_std()
                .unwrap_or_default();
            if elapsed < min_duration {
                tracing::debug!(
                    session_id = %self.session.id(),
                    reason = %reason,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Session below minimum duration, not signaling end"
                );
                return false;
            }
        }

        if !self.session.latch_termination() {
            tracing::trace!(session_id = %self.session.id(), reason = %reason, "End already signaled");
            return false;
        }

        let request = SessionEndRequest {
            session_id: self.session.id().to_string(),
            reason: reason.as_str().to_string(),
            timestamp: self.clock.now_ms(),
            final_event_count: self.buffer.total_accepted(),
            api_key: None,
        };
        self.layer.beacon(request);
        self.stats.termination_signal();

        tracing::info!(
            session_id = %self.session.id(),
            reason = %reason,
            final_event_count = self.buffer.total_accepted(),
            "Signaled session end"
        );
        true
    }

    pub fn is_signaled(&self) -> bool {
        self.session.termination_signaled()
    }
}
