//! Optional process-wide agent slot
//!
//! Nothing in the crate reads this slot. Hosts that want a single
//! page-scoped agent reachable from anywhere install one here; everyone
//! else passes their [`CaptureAgent`] around explicitly.

use std::sync::{Arc, OnceLock};

use crate::agent::CaptureAgent;

static AGENT: OnceLock<Arc<CaptureAgent>> = OnceLock::new();

/// Install the process-wide agent
///
/// Only the first install wins. A rejected agent is handed back.
pub fn install(agent: Arc<CaptureAgent>) -> std::result::Result<(), Arc<CaptureAgent>> {
    AGENT.set(agent)
}

/// The installed agent, if any
pub fn get() -> Option<Arc<CaptureAgent>> {
    AGENT.get().cloned()
}
