//! Ordered, bounded buffer of events awaiting transmission
//!
//! The buffer is shared by the capture path (append), the flush path (drain)
//! and the failure path (prepend). Every operation takes the lock once and
//! never across an await, so a drain can't lose events appended while an
//! upload is in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::{Event, EventBatch};

/// Outcome of [`EventBuffer::append`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Event accepted; carries the buffered size after the append
    Accepted { buffered: usize },
    /// Per-session cap reached; event dropped
    CapReached,
}

#[derive(Debug)]
struct BufferState {
    events: Vec<Event>,
    total_accepted: u64,
    max_events: u64,
}

/// Cheaply cloneable handle to a session's event buffer
#[derive(Debug, Clone)]
pub struct EventBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl EventBuffer {
    /// Create an empty buffer accepting at most `max_events` over its lifetime
    pub fn new(max_events: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState {
                events: Vec::new(),
                total_accepted: 0,
                max_events,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock still guards valid data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event unless the session cap has been reached
    pub fn append(&self, event: Event) -> Appended {
        let mut state = self.lock();
        if state.total_accepted >= state.max_events {
            return Appended::CapReached;
        }
        state.events.push(event);
        state.total_accepted += 1;
        Appended::Accepted {
            buffered: state.events.len(),
        }
    }

    /// Take everything buffered, leaving the buffer empty
    pub fn drain_all(&self) -> EventBatch {
        std::mem::take(&mut self.lock().events)
    }

    /// Put a batch back in front of whatever is buffered, keeping its order
    pub fn prepend(&self, batch: EventBatch) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.lock();
        let newer = std::mem::replace(&mut state.events, batch);
        state.events.extend(newer);
    }

    /// Number of events currently buffered
    pub fn size(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Events accepted since the buffer was created (never decremented)
    pub fn total_accepted(&self) -> u64 {
        self.lock().total_accepted
    }
}
