//! Capture agent: wires the pipeline together for one session at a time
//!
//! ```text
//! RecordingEngine ──callback──▶ channel ──pump──▶ EventBuffer
//!                                                    │
//!                    size / timer / lifecycle ──▶ FlushScheduler ──▶ TransportLayer
//!                                                                        │
//!                    lifecycle / stop ──▶ SessionTerminationSignaler ──▶ beacon
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sessionreel_core::agent::CaptureAgent;
//! use sessionreel_core::config::AgentConfig;
//!
//! # async fn run() -> sessionreel_core::Result<()> {
//! let agent = CaptureAgent::builder(AgentConfig::new("https://collector.example")).build()?;
//! agent.start().await;
//! agent.record(serde_json::json!({"type": 4, "data": {"href": "/"}})).await;
//! agent.stop().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::{Appended, EventBuffer};
use crate::clock::{Clock, SystemClock};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::identity::{FileSessionStore, SessionIdentity, SessionStore};
use crate::lifecycle::{LifecycleHandle, LifecycleObserver, Subscription, TerminationPolicy};
use crate::scheduler::FlushScheduler;
use crate::stats::{DeliveryStats, StatsRecorder};
use crate::termination::{SessionTerminationSignaler, TerminationReason};
use crate::transport::wire::{SessionMetadata, SessionStartRequest};
use crate::transport::{BeaconSink, HttpTransport, RetryPolicy, Transport, TransportLayer};
use crate::types::{Event, PageContext, Session, SessionInfo, UserIdentity};

/// Callback the recording engine invokes once per captured event
pub type EventCallback = Box<dyn Fn(Event) + Send + Sync>;

/// Stops a running capture when consumed
pub struct StopHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl StopHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// A handle with nothing to stop
    pub fn noop() -> Self {
        Self { stop: None }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("armed", &self.stop.is_some())
            .finish()
    }
}

/// External interaction recorder
///
/// The callback may be invoked from any thread. It only enqueues.
pub trait RecordingEngine: Send + Sync {
    fn start_capture(&self, on_event: EventCallback) -> StopHandle;
}

enum StoreSelection {
    Default,
    Custom(Arc<dyn SessionStore>),
    Disabled,
}

/// Builder for [`CaptureAgent`]
pub struct CaptureAgentBuilder {
    config: AgentConfig,
    transport: Option<Arc<dyn Transport>>,
    store: StoreSelection,
    clock: Option<Arc<dyn Clock>>,
    page: PageContext,
    beacon_sink: Option<Arc<dyn BeaconSink>>,
    policy: Option<TerminationPolicy>,
    retry: Option<RetryPolicy>,
}

impl CaptureAgentBuilder {
    fn new(config: AgentConfig) -> Self {
        Self {
            config,
            transport: None,
            store: StoreSelection::Default,
            clock: None,
            page: PageContext::default(),
            beacon_sink: None,
            policy: None,
            retry: None,
        }
    }

    /// Deliver through `transport` instead of HTTP
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = StoreSelection::Custom(store);
        self
    }

    /// Run without durable storage; every start gets a fresh session id
    pub fn without_persistence(mut self) -> Self {
        self.store = StoreSelection::Disabled;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn page_context(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    /// Teardown-safe channel for the termination signal (HTTP transport only)
    pub fn beacon_sink(mut self, sink: Arc<dyn BeaconSink>) -> Self {
        self.beacon_sink = Some(sink);
        self
    }

    /// Override `agent.termination` from the configuration
    pub fn termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the in-place retry policy derived from `agent.max_retries`
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<CaptureAgent> {
        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => {
                if self.beacon_sink.is_some() {
                    tracing::warn!("Beacon sink ignored: a custom transport was supplied");
                }
                transport
            }
            None => {
                let mut http = HttpTransport::new(&self.config)?;
                if let Some(sink) = self.beacon_sink {
                    http = http.with_beacon_sink(sink);
                }
                Arc::new(http)
            }
        };

        let store = match self.store {
            StoreSelection::Default => {
                Some(Arc::new(FileSessionStore::default_location()) as Arc<dyn SessionStore>)
            }
            StoreSelection::Custom(store) => Some(store),
            StoreSelection::Disabled => None,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let identity = Arc::new(SessionIdentity::new(
            store,
            clock.clone(),
            self.config.idle_timeout(),
        ));

        Ok(CaptureAgent {
            user: Mutex::new(UserIdentity {
                user_id: self.config.user_id.clone(),
                user_email: self.config.user_email.clone(),
            }),
            policy: self.policy.unwrap_or(self.config.termination),
            retry: self
                .retry
                .unwrap_or_else(|| RetryPolicy::with_max_retries(self.config.max_retries)),
            config: self.config,
            transport,
            identity,
            clock,
            page: self.page,
            stats: Arc::new(StatsRecorder::default()),
            state: Mutex::new(None),
        })
    }
}

/// Pipeline pieces for the session being recorded
#[derive(Debug)]
struct ActiveSession {
    session: Arc<Session>,
    buffer: EventBuffer,
    layer: Arc<TransportLayer>,
    scheduler: Arc<FlushScheduler>,
    signaler: Arc<SessionTerminationSignaler>,
    stats: Arc<StatsRecorder>,
    overflow_noticed: AtomicBool,
}

impl ActiveSession {
    async fn record(&self, event: Event) {
        match self.buffer.append(event) {
            Appended::Accepted { buffered } => {
                self.stats.event_accepted();
                if self.scheduler.should_flush(buffered) {
                    self.scheduler.flush(false).await;
                }
            }
            Appended::CapReached => {
                self.stats.event_dropped();
                if !self.overflow_noticed.swap(true, Ordering::AcqRel) {
                    self.stats.overflow_notice();
                    tracing::warn!(
                        session_id = %self.session.id(),
                        accepted = self.buffer.total_accepted(),
                        "Event limit reached for session, dropping further events"
                    );
                }
            }
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session.id().to_string(),
            started_at: self.session.started_at(),
            total_event_count: self.buffer.total_accepted(),
            termination_signaled: self.session.termination_signaled(),
        }
    }
}

/// Moves engine events from the channel into the buffer
#[derive(Debug)]
struct Pump {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Pump {
    fn spawn(active: Arc<ActiveSession>, mut rx: mpsc::UnboundedReceiver<Event>) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    event = rx.recv() => match event {
                        Some(event) => active.record(event).await,
                        None => return,
                    },
                }
            }
            // Events the engine queued before it was stopped
            while let Ok(event) = rx.try_recv() {
                active.record(event).await;
            }
        });
        Self { shutdown, task }
    }

    async fn drain(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::debug!(error = %e, "Event pump ended abnormally");
        }
    }
}

#[derive(Debug)]
struct Running {
    active: Arc<ActiveSession>,
    lifecycle: LifecycleHandle,
    subscription: Subscription,
    engine: Option<StopHandle>,
    pump: Option<Pump>,
}

/// Session capture and delivery for one host page
pub struct CaptureAgent {
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    identity: Arc<SessionIdentity>,
    clock: Arc<dyn Clock>,
    page: PageContext,
    policy: TerminationPolicy,
    retry: RetryPolicy,
    stats: Arc<StatsRecorder>,
    user: Mutex<UserIdentity>,
    state: Mutex<Option<Running>>,
}

impl fmt::Debug for CaptureAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureAgent")
            .field("transport", &self.transport)
            .field("policy", &self.policy)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl CaptureAgent {
    pub fn builder(config: AgentConfig) -> CaptureAgentBuilder {
        CaptureAgentBuilder::new(config)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Start a session without a recording engine; feed it through [`record`](Self::record)
    pub async fn start(&self) {
        self.activate(None);
    }

    /// Start a session and connect `engine` to it
    ///
    /// The engine is connected after the session is in place, so it may query
    /// the agent from inside `start_capture`.
    pub async fn start_with_engine(&self, engine: &dyn RecordingEngine) {
        let (tx, rx) = mpsc::unbounded_channel();
        let Some(active) = self.activate(Some(rx)) else {
            return;
        };

        let stop = engine.start_capture(Box::new(move |event| {
            // The receiver is gone once the session stopped
            let _ = tx.send(event);
        }));

        let mut state = self.lock_state();
        match state.as_mut() {
            Some(running) if Arc::ptr_eq(&running.active, &active) => {
                running.engine = Some(stop);
            }
            _ => {
                drop(state);
                tracing::debug!("Session ended while the engine was starting");
                stop.stop();
            }
        }
    }

    /// Install a new session unless one is running
    ///
    /// `events` feeds the session from a recording engine connected by the caller.
    fn activate(
        &self,
        events: Option<mpsc::UnboundedReceiver<Event>>,
    ) -> Option<Arc<ActiveSession>> {
        let mut state = self.lock_state();
        if let Some(running) = state.as_ref() {
            tracing::warn!(
                session_id = %running.active.session.id(),
                "Capture already started, ignoring start"
            );
            return None;
        }

        let session_id = self.identity.get_or_create_session_id();
        let session = Arc::new(Session::new(session_id.clone(), self.clock.now()));
        let buffer = EventBuffer::new(self.config.max_events_per_session);
        let layer = Arc::new(TransportLayer::new(
            self.transport.clone(),
            buffer.clone(),
            session_id.clone(),
            self.clock.clone(),
            self.retry,
            self.stats.clone(),
        ));
        let scheduler = Arc::new(FlushScheduler::new(
            buffer.clone(),
            layer.clone(),
            Some(self.identity.clone()),
            self.config.flush_threshold,
            self.config.flush_interval(),
            self.config.heartbeat_interval(),
        ));
        let signaler = Arc::new(SessionTerminationSignaler::new(
            session.clone(),
            buffer.clone(),
            layer.clone(),
            self.clock.clone(),
            self.policy,
            self.stats.clone(),
        ));
        let active = Arc::new(ActiveSession {
            session,
            buffer,
            layer: layer.clone(),
            scheduler: scheduler.clone(),
            signaler: signaler.clone(),
            stats: self.stats.clone(),
            overflow_noticed: AtomicBool::new(false),
        });

        let metadata = self.start_request(&session_id);
        tokio::spawn(async move { layer.start_session(metadata).await });

        scheduler.start();
        let observer = Arc::new(LifecycleObserver::new(scheduler, signaler, self.policy));
        let (lifecycle, subscription) = observer.subscribe();

        let pump = events.map(|rx| Pump::spawn(active.clone(), rx));

        tracing::info!(
            session_id = %session_id,
            persistent = self.identity.is_persistent(),
            policy = ?self.policy,
            "Capture started"
        );

        *state = Some(Running {
            active: active.clone(),
            lifecycle,
            subscription,
            engine: None,
            pump,
        });
        Some(active)
    }

    fn start_request(&self, session_id: &str) -> SessionStartRequest {
        let user = self.lock_user().clone();
        SessionStartRequest {
            session_id: session_id.to_string(),
            user_id: user.user_id,
            user_email: user.user_email,
            metadata: SessionMetadata::from_page(&self.page, self.clock.now_ms()),
        }
    }

    /// Accept one event into the current session; ignored while inactive
    pub async fn record(&self, event: Event) {
        match self.active() {
            Some(active) => active.record(event).await,
            None => tracing::trace!("Capture not active, dropping event"),
        }
    }

    /// Attach a user to the session and re-send its metadata
    pub async fn identify(&self, user_id: Option<String>, user_email: Option<String>) {
        *self.lock_user() = UserIdentity {
            user_id,
            user_email,
        };

        if let Some(active) = self.active() {
            let request = self.start_request(active.session.id());
            active.layer.start_session(request).await;
        }
    }

    /// Upload everything buffered now
    pub async fn flush(&self) {
        if let Some(active) = self.active() {
            active.scheduler.flush(false).await;
        }
    }

    /// End the current session
    ///
    /// Stops the engine and delivers what it had queued, halts the timer
    /// (waiting out a timer flush still retrying), drops the lifecycle
    /// subscription, flushes, then attempts a `manual_stop` termination.
    /// Stopping an inactive agent does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.lock_state().take() else {
            tracing::debug!("Capture not active, nothing to stop");
            return;
        };
        let Running {
            active,
            lifecycle,
            subscription,
            engine,
            pump,
        } = running;
        drop(lifecycle);

        if let Some(engine) = engine {
            engine.stop();
        }
        if let Some(pump) = pump {
            pump.drain().await;
        }

        active.scheduler.stop().await;
        subscription.cancel().await;
        active.scheduler.flush(false).await;
        active.signaler.signal(TerminationReason::ManualStop);
        active.layer.close().await;

        tracing::info!(
            session_id = %active.session.id(),
            total_events = active.buffer.total_accepted(),
            unsent = active.buffer.size(),
            "Capture stopped"
        );
    }

    /// Handle for posting page lifecycle signals to the current session
    pub fn lifecycle_handle(&self) -> Option<LifecycleHandle> {
        self.lock_state()
            .as_ref()
            .map(|running| running.lifecycle.clone())
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.active().map(|active| active.info())
    }

    /// Counters accumulated across every session of this agent
    pub fn stats(&self) -> DeliveryStats {
        self.stats.snapshot()
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().is_some()
    }

    fn active(&self) -> Option<Arc<ActiveSession>> {
        self.lock_state()
            .as_ref()
            .map(|running| running.active.clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<Running>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_user(&self) -> MutexGuard<'_, UserIdentity> {
        self.user.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::MemorySessionStore;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn agent(transport: &Arc<MemoryTransport>, clock: &ManualClock) -> CaptureAgent {
        CaptureAgent::builder(AgentConfig::new("http://collector.test"))
            .transport(transport.clone())
            .session_store(Arc::new(MemorySessionStore::new()))
            .clock(Arc::new(clock.clone()))
            .termination_policy(TerminationPolicy::VisibilityBased)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = CaptureAgent::builder(AgentConfig::default()).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let agent = agent(&transport, &ManualClock::default());

        agent.start().await;
        let first = agent.session().unwrap().session_id;
        agent.start().await;

        assert_eq!(agent.session().unwrap().session_id, first);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_record_while_inactive_is_dropped() {
        let transport = Arc::new(MemoryTransport::new());
        let agent = agent(&transport, &ManualClock::default());

        agent.record(json!({"seq": 0})).await;

        assert_eq!(agent.stats().events_accepted, 0);
        assert!(agent.session().is_none());
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let transport = Arc::new(MemoryTransport::new());
        let agent = agent(&transport, &ManualClock::default());
        agent.start().await;
        agent.record(json!({"seq": 0})).await;

        agent.stop().await;
        agent.stop().await;

        assert!(!agent.is_active());
        assert_eq!(transport.uploads().len(), 1);
        assert_eq!(transport.beacons().len(), 1);
        assert_eq!(transport.beacons()[0].reason, "manual_stop");
    }

    #[test]
    fn test_stop_handle_runs_once() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        StopHandle::new(move || flag.store(true, Ordering::SeqCst)).stop();
        assert!(stopped.load(Ordering::SeqCst));

        StopHandle::noop().stop();
    }
}
