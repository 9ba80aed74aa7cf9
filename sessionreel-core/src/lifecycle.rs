//! Page lifecycle handling
//!
//! The host forwards browser lifecycle signals through a [`LifecycleHandle`].
//! The [`LifecycleObserver`] turns each one into a flush and, depending on
//! the [`TerminationPolicy`], a termination attempt:
//!
//! | Event | Flush | Termination |
//! |-------|-------|-------------|
//! | `VisibilityHidden` | unloading | visibility-based policy only |
//! | `VisibilityVisible` | no | no |
//! | `PageHide { persisted: true }` | unloading | no (page kept for back/forward) |
//! | `PageHide { persisted: false }` | unloading | yes |
//! | `BeforeUnload` | unloading | yes |
//! | `Unload` | unloading | yes |
//!
//! Termination attempts still go through the signaler's duration gate and
//! one-shot latch.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::scheduler::FlushScheduler;
use crate::termination::{SessionTerminationSignaler, TerminationReason};

/// When the session-ended signal is sent
///
/// Neither variant is authoritative; integrators choose one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationPolicy {
    /// End on any discarding unload and whenever the tab becomes hidden
    VisibilityBased,
    /// End only on tab close, and only once the session lasted `min_duration_secs`
    DurationGated {
        #[serde(default = "default_min_duration_secs")]
        min_duration_secs: u64,
    },
}

fn default_min_duration_secs() -> u64 {
    30
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        TerminationPolicy::DurationGated {
            min_duration_secs: default_min_duration_secs(),
        }
    }
}

impl TerminationPolicy {
    /// Whether a hidden tab counts as the end of the session
    pub fn ends_on_hidden(&self) -> bool {
        matches!(self, TerminationPolicy::VisibilityBased)
    }

    /// Shortest session that may be signaled as ended
    pub fn min_duration(&self) -> Option<Duration> {
        match self {
            TerminationPolicy::VisibilityBased => None,
            TerminationPolicy::DurationGated { min_duration_secs } => {
                Some(Duration::from_secs(*min_duration_secs))
            }
        }
    }
}

/// Browser-driven page lifecycle signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    VisibilityHidden,
    VisibilityVisible,
    /// `persisted` is true when the page enters the back/forward cache
    PageHide { persisted: bool },
    BeforeUnload,
    Unload,
}

/// What the observer does in response to a [`LifecycleEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Ignore,
    Flush,
    FlushAndTerminate(TerminationReason),
}

impl LifecycleEvent {
    pub fn action(&self, policy: &TerminationPolicy) -> LifecycleAction {
        match self {
            LifecycleEvent::VisibilityVisible => LifecycleAction::Ignore,
            LifecycleEvent::VisibilityHidden if policy.ends_on_hidden() => {
                LifecycleAction::FlushAndTerminate(TerminationReason::VisibilityChange)
            }
            LifecycleEvent::VisibilityHidden => LifecycleAction::Flush,
            LifecycleEvent::PageHide { persisted: true } => LifecycleAction::Flush,
            LifecycleEvent::PageHide { persisted: false } => {
                LifecycleAction::FlushAndTerminate(TerminationReason::PageHide)
            }
            LifecycleEvent::BeforeUnload => {
                LifecycleAction::FlushAndTerminate(TerminationReason::BeforeUnload)
            }
            LifecycleEvent::Unload => LifecycleAction::FlushAndTerminate(TerminationReason::Unload),
        }
    }
}

/// Non-blocking entry point for host lifecycle signals
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleHandle {
    /// Forward a lifecycle signal. Returns false once the session stopped listening.
    pub fn notify(&self, event: LifecycleEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Drives flush and termination decisions from lifecycle signals
#[derive(Debug)]
pub struct LifecycleObserver {
    scheduler: Arc<FlushScheduler>,
    signaler: Arc<SessionTerminationSignaler>,
    policy: TerminationPolicy,
}

impl LifecycleObserver {
    pub(crate) fn new(
        scheduler: Arc<FlushScheduler>,
        signaler: Arc<SessionTerminationSignaler>,
        policy: TerminationPolicy,
    ) -> Self {
        Self {
            scheduler,
            signaler,
            policy,
        }
    }

    /// React to one lifecycle signal
    ///
    /// The flush is issued before the termination signal so the final
    /// events leave ahead of the session-ended notification.
    pub async fn handle(&self, event: LifecycleEvent) {
        let action = event.action(&self.policy);
        tracing::debug!(?event, ?action, "Lifecycle event");

        match action {
            LifecycleAction::Ignore => {}
            LifecycleAction::Flush => self.scheduler.flush(true).await,
            LifecycleAction::FlushAndTerminate(reason) => {
                self.scheduler.flush(true).await;
                self.signaler.signal(reason);
            }
        }
    }

    /// Start listening for lifecycle signals
    pub fn subscribe(self: Arc<Self>) -> (LifecycleHandle, Subscription) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    event = rx.recv() => match event {
                        Some(event) => self.handle(event).await,
                        None => break,
                    },
                }
            }
        });

        (
            LifecycleHandle { tx },
            Subscription {
                shutdown: shutdown_tx,
                task,
            },
        )
    }
}

/// Live lifecycle subscription
#[derive(Debug)]
pub struct Subscription {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop listening; waits for an event already being handled
    pub async fn cancel(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::debug!(error = %e, "Lifecycle task ended abnormally");
        }
    }
}
