//! # sessionreel-core
//!
//! Core library for sessionreel - client-side session capture with reliable
//! delivery to a recording collector.
//!
//! This library provides:
//! - Session identity with durable reuse and idle rotation
//! - A bounded, ordered event buffer with requeue-on-failure
//! - Size, timer and page-lifecycle flush triggers
//! - A one-shot session termination signal that survives page teardown
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! A [`CaptureAgent`] owns at most one session at a time. Events flow from
//! the recording engine into an [`EventBuffer`]; the
//! [`FlushScheduler`](scheduler::FlushScheduler) drains it into the
//! [`TransportLayer`](transport::TransportLayer), which hands failed batches
//! back to the buffer head. Delivery is at-least-once; the collector
//! tolerates duplicates.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sessionreel_core::{CaptureAgent, Config};
//!
//! # async fn run() -> sessionreel_core::Result<()> {
//! let config = Config::load()?;
//! let agent = CaptureAgent::builder(config.agent).build()?;
//!
//! agent.start().await;
//! agent.record(serde_json::json!({"type": 2, "data": {}})).await;
//! agent.stop().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use agent::{CaptureAgent, CaptureAgentBuilder, EventCallback, RecordingEngine, StopHandle};
pub use buffer::EventBuffer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, Config};
pub use error::{Error, Result};
pub use identity::{FileSessionStore, MemorySessionStore, SessionIdentity, SessionStore};
pub use lifecycle::{LifecycleEvent, LifecycleHandle, TerminationPolicy};
pub use stats::DeliveryStats;
pub use termination::TerminationReason;
pub use types::*;

// Public modules
pub mod agent;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod global;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod scheduler;
pub mod stats;
pub mod termination;
pub mod transport;
pub mod types;
