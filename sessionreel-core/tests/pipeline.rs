//! End-to-end tests for the capture and delivery pipeline
//!
//! Every test drives a real [`CaptureAgent`] against the in-memory transport
//! and a manual clock, so delivery and session timing are fully observable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use sessionreel_core::transport::{MemoryTransport, RetryPolicy, SentRequest};
use sessionreel_core::{
    AgentConfig, CaptureAgent, Clock, EventCallback, LifecycleEvent, ManualClock, MemorySessionStore,
    PageContext, RecordingEngine, SessionStore, StopHandle, TerminationPolicy,
};

const GATED: TerminationPolicy = TerminationPolicy::DurationGated {
    min_duration_secs: 30,
};

struct Harness {
    transport: Arc<MemoryTransport>,
    clock: ManualClock,
    store: Arc<MemorySessionStore>,
}

impl Harness {
    fn new() -> Self {
        sessionreel_core::logging::init_test();
        Self {
            transport: Arc::new(MemoryTransport::new()),
            clock: ManualClock::default(),
            store: Arc::new(MemorySessionStore::new()),
        }
    }

    fn clock_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn config(&self) -> AgentConfig {
        AgentConfig::new("http://collector.test")
    }

    fn agent(&self, policy: TerminationPolicy) -> CaptureAgent {
        self.agent_with(self.config(), policy)
    }

    fn agent_with(&self, config: AgentConfig, policy: TerminationPolicy) -> CaptureAgent {
        CaptureAgent::builder(config)
            .transport(self.transport.clone())
            .session_store(self.store.clone())
            .clock(Arc::new(self.clock.clone()))
            .termination_policy(policy)
            .retry(RetryPolicy::none())
            .build()
            .expect("valid agent configuration")
    }

    /// Agent that retries failed uploads in place with the default backoff
    fn retrying_agent(&self) -> CaptureAgent {
        CaptureAgent::builder(self.config())
            .transport(self.transport.clone())
            .session_store(self.store.clone())
            .clock(Arc::new(self.clock.clone()))
            .termination_policy(TerminationPolicy::VisibilityBased)
            .retry(RetryPolicy::default())
            .build()
            .expect("valid agent configuration")
    }

    /// Position of the first recorded request matching `predicate`
    fn sent_index(&self, predicate: impl Fn(&SentRequest) -> bool) -> usize {
        self.transport
            .sent()
            .iter()
            .position(predicate)
            .expect("request was recorded")
    }
}

fn event(seq: u64) -> Value {
    json!({"type": 3, "data": {"source": 1}, "seq": seq})
}

/// Poll until `condition` holds, yielding to background tasks in between
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Engine driven by the test through `emit`
#[derive(Default)]
struct ScriptedEngine {
    callback: Arc<Mutex<Option<EventCallback>>>,
    stopped: Arc<AtomicBool>,
}

impl ScriptedEngine {
    fn emit(&self, event: Value) {
        if let Some(callback) = self.callback.lock().unwrap().as_ref() {
            callback(event);
        }
    }
}

impl RecordingEngine for ScriptedEngine {
    fn start_capture(&self, on_event: EventCallback) -> StopHandle {
        *self.callback.lock().unwrap() = Some(on_event);
        let callback = self.callback.clone();
        let stopped = self.stopped.clone();
        StopHandle::new(move || {
            callback.lock().unwrap().take();
            stopped.store(true, Ordering::SeqCst);
        })
    }
}

/// Engine that looks at the agent from inside `start_capture`
struct InspectingEngine {
    agent: Arc<CaptureAgent>,
    seen_session: Mutex<Option<String>>,
    callback: Mutex<Option<EventCallback>>,
}

impl RecordingEngine for InspectingEngine {
    fn start_capture(&self, on_event: EventCallback) -> StopHandle {
        assert!(self.agent.is_active());
        *self.seen_session.lock().unwrap() = self.agent.session().map(|s| s.session_id);
        *self.callback.lock().unwrap() = Some(on_event);
        StopHandle::noop()
    }
}

// ============================================
// Delivery
// ============================================

#[tokio::test]
async fn test_events_delivered_in_order_in_threshold_batches() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;

    for seq in 0..250 {
        agent.record(event(seq)).await;
    }
    agent.stop().await;

    let uploads = h.transport.uploads();
    assert_eq!(uploads.len(), 3);
    assert_eq!(uploads[0].events.len(), 100);
    assert_eq!(uploads[1].events.len(), 100);
    assert_eq!(uploads[2].events.len(), 50);
    assert_eq!(
        h.transport.uploaded_events(),
        (0..250).map(event).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_failed_batch_is_retried_ahead_of_newer_events() {
    let h = Harness::new();
    h.transport.fail_next_uploads(1);
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;

    for seq in 0..150 {
        agent.record(event(seq)).await;
    }
    agent.stop().await;

    // The first batch failed, came back to the head and left with the next flush
    assert_eq!(h.transport.upload_attempts(), 3);
    assert_eq!(h.transport.uploads()[0].events.len(), 101);
    assert_eq!(
        h.transport.uploaded_events(),
        (0..150).map(event).collect::<Vec<_>>()
    );
    assert_eq!(agent.stats().events_requeued, 100);
}

#[tokio::test]
async fn test_unacknowledged_events_stay_buffered_while_offline() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;
    h.transport.set_offline(true);

    for seq in 0..3 {
        agent.record(event(seq)).await;
    }
    agent.flush().await;
    agent.flush().await;
    assert_eq!(agent.session().unwrap().total_event_count, 3);

    h.transport.set_offline(false);
    agent.flush().await;

    assert_eq!(
        h.transport.uploaded_events(),
        (0..3).map(event).collect::<Vec<_>>()
    );
    agent.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_small_batches() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;

    agent.record(event(0)).await;
    tokio::time::sleep(Duration::from_millis(10_500)).await;

    assert_eq!(h.transport.uploads().len(), 1);
    agent.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_timer_flush_in_backoff() {
    let h = Harness::new();
    let agent = h.retrying_agent();
    agent.start().await;
    h.transport.fail_next_uploads(1);

    agent.record(event(0)).await;
    // The timer flush has failed once and is sleeping before its retry
    tokio::time::sleep(Duration::from_millis(10_100)).await;
    assert_eq!(h.transport.upload_attempts(), 1);

    agent.stop().await;

    assert_eq!(h.transport.upload_attempts(), 2);
    assert_eq!(h.transport.uploaded_events(), vec![event(0)]);
    let upload = h.sent_index(|r| matches!(r, SentRequest::Upload { .. }));
    let beacon = h.sent_index(|r| matches!(r, SentRequest::Beacon(_)));
    assert!(upload < beacon, "batch must reach the collector before the end signal");
}

#[tokio::test(start_paused = true)]
async fn test_batch_requeued_by_timer_flush_is_sent_on_stop() {
    let h = Harness::new();
    let agent = h.retrying_agent();
    agent.start().await;
    h.transport.fail_next_uploads(3);

    agent.record(event(0)).await;
    tokio::time::sleep(Duration::from_millis(10_100)).await;
    agent.stop().await;

    // Three timer attempts exhaust the retries, the final flush delivers
    assert_eq!(h.transport.upload_attempts(), 4);
    assert_eq!(h.transport.uploaded_events(), vec![event(0)]);
    assert_eq!(agent.stats().events_requeued, 1);
    let upload = h.sent_index(|r| matches!(r, SentRequest::Upload { .. }));
    let beacon = h.sent_index(|r| matches!(r, SentRequest::Beacon(_)));
    assert!(upload < beacon);

    // Nothing is left to arrive after the session ended
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.upload_attempts(), 4);
}

#[tokio::test]
async fn test_cap_drops_overflow_with_single_notice() {
    let h = Harness::new();
    let mut config = h.config();
    config.max_events_per_session = 5;
    let agent = h.agent_with(config, TerminationPolicy::VisibilityBased);
    agent.start().await;

    for seq in 0..7 {
        agent.record(event(seq)).await;
    }
    agent.stop().await;

    assert_eq!(
        h.transport.uploaded_events(),
        (0..5).map(event).collect::<Vec<_>>()
    );
    let stats = agent.stats();
    assert_eq!(stats.events_accepted, 5);
    assert_eq!(stats.events_dropped, 2);
    assert_eq!(stats.overflow_notices, 1);
}

#[tokio::test]
async fn test_no_api_key_leaves_requests_untouched() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;
    agent.record(event(0)).await;
    agent.stop().await;

    let sent = h.transport.sent();
    assert!(!sent.is_empty());
    for request in sent {
        let body = match request {
            SentRequest::SessionStart(r) => serde_json::to_value(r),
            SentRequest::Upload { request, .. } => serde_json::to_value(request),
            SentRequest::Heartbeat(r) => serde_json::to_value(r),
            SentRequest::Beacon(r) => serde_json::to_value(r),
        }
        .unwrap();
        assert!(!body.to_string().contains("apiKey"), "unexpected key in {body}");
    }
}

// ============================================
// Session identity
// ============================================

#[tokio::test]
async fn test_session_reused_within_idle_timeout() {
    let h = Harness::new();

    let first = h.agent(GATED);
    first.start().await;
    let first_id = first.session().unwrap().session_id;
    first.stop().await;

    h.clock.advance(Duration::from_secs(29 * 60));
    let second = h.agent(GATED);
    second.start().await;

    assert_eq!(second.session().unwrap().session_id, first_id);
    second.stop().await;
}

#[tokio::test]
async fn test_session_rotated_after_idle_timeout() {
    let h = Harness::new();

    let first = h.agent(GATED);
    first.start().await;
    let first_id = first.session().unwrap().session_id;
    first.stop().await;

    h.clock.advance(Duration::from_secs(31 * 60));
    let second = h.agent(GATED);
    second.start().await;
    let second_id = second.session().unwrap().session_id;

    assert_ne!(second_id, first_id);
    assert_eq!(h.store.load().unwrap().unwrap().session_id, second_id);
    second.stop().await;
}

#[tokio::test]
async fn test_successful_upload_refreshes_last_seen() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;
    let started_ms = h.store.load().unwrap().unwrap().last_seen_at;

    h.clock.advance(Duration::from_secs(60));
    agent.record(event(0)).await;
    agent.flush().await;

    let record = h.store.load().unwrap().unwrap();
    assert_eq!(record.last_seen_at, started_ms + 60_000);
    agent.stop().await;
}

#[tokio::test]
async fn test_without_persistence_every_start_is_new() {
    let h = Harness::new();
    let agent = CaptureAgent::builder(h.config())
        .transport(h.transport.clone())
        .without_persistence()
        .clock(Arc::new(h.clock.clone()))
        .build()
        .unwrap();

    agent.start().await;
    let first = agent.session().unwrap().session_id;
    agent.stop().await;
    agent.start().await;
    let second = agent.session().unwrap().session_id;
    agent.stop().await;

    assert_ne!(first, second);
    assert!(!agent.identity().is_persistent());
}

// ============================================
// Termination
// ============================================

#[tokio::test]
async fn test_repeated_unload_signals_send_one_beacon() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;
    let lifecycle = agent.lifecycle_handle().unwrap();

    assert!(lifecycle.notify(LifecycleEvent::PageHide { persisted: false }));
    assert!(lifecycle.notify(LifecycleEvent::Unload));
    wait_until(|| !h.transport.beacons().is_empty()).await;
    agent.stop().await;

    let beacons = h.transport.beacons();
    assert_eq!(beacons.len(), 1);
    assert_eq!(beacons[0].reason, "pagehide");
    assert_eq!(agent.stats().termination_signals, 1);
}

#[tokio::test]
async fn test_unload_batch_precedes_end_signal() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;
    for seq in 0..3 {
        agent.record(event(seq)).await;
    }

    let lifecycle = agent.lifecycle_handle().unwrap();
    assert!(lifecycle.notify(LifecycleEvent::PageHide { persisted: false }));
    wait_until(|| !h.transport.beacons().is_empty()).await;

    let upload = h.sent_index(|r| matches!(r, SentRequest::Upload { unloading: true, .. }));
    let beacon = h.sent_index(|r| matches!(r, SentRequest::Beacon(_)));
    assert!(upload < beacon);
    assert_eq!(h.transport.beacons()[0].final_event_count, 3);
    agent.stop().await;
}

#[tokio::test]
async fn test_short_session_flushes_but_never_signals() {
    let h = Harness::new();
    let agent = h.agent(GATED);
    agent.start().await;
    agent.record(event(0)).await;

    h.clock.advance(Duration::from_secs(10));
    agent
        .lifecycle_handle()
        .unwrap()
        .notify(LifecycleEvent::BeforeUnload);
    wait_until(|| !h.transport.uploads().is_empty()).await;
    agent.stop().await;

    assert!(h.transport.beacons().is_empty());
    assert!(matches!(
        h.transport.sent().iter().find(|r| matches!(r, SentRequest::Upload { .. })),
        Some(SentRequest::Upload { unloading: true, .. })
    ));
}

#[tokio::test]
async fn test_long_session_signals_exactly_once() {
    let h = Harness::new();
    let agent = h.agent(GATED);
    agent.start().await;
    agent.record(event(0)).await;
    agent.record(event(1)).await;

    h.clock.advance(Duration::from_secs(45));
    agent
        .lifecycle_handle()
        .unwrap()
        .notify(LifecycleEvent::BeforeUnload);
    wait_until(|| !h.transport.beacons().is_empty()).await;
    agent.stop().await;

    let beacons = h.transport.beacons();
    assert_eq!(beacons.len(), 1);
    assert_eq!(beacons[0].reason, "beforeunload");
    assert_eq!(beacons[0].final_event_count, 2);
    assert!(beacons[0].api_key.is_none());
}

#[tokio::test]
async fn test_gated_signal_can_fire_later_in_same_session() {
    let h = Harness::new();
    let agent = h.agent(GATED);
    agent.start().await;
    agent.record(event(0)).await;

    h.clock.advance(Duration::from_secs(10));
    agent
        .lifecycle_handle()
        .unwrap()
        .notify(LifecycleEvent::BeforeUnload);
    wait_until(|| h.transport.uploads().len() == 1).await;
    assert!(h.transport.beacons().is_empty());
    assert!(!agent.session().unwrap().termination_signaled);

    h.clock.advance(Duration::from_secs(35));
    agent.stop().await;

    let beacons = h.transport.beacons();
    assert_eq!(beacons.len(), 1);
    assert_eq!(beacons[0].reason, "manual_stop");
}

#[tokio::test]
async fn test_hidden_tab_policies() {
    let h = Harness::new();
    let gated = h.agent(GATED);
    gated.start().await;
    gated.record(event(0)).await;
    h.clock.advance(Duration::from_secs(45));

    gated
        .lifecycle_handle()
        .unwrap()
        .notify(LifecycleEvent::VisibilityHidden);
    wait_until(|| h.transport.uploads().len() == 1).await;
    assert!(h.transport.beacons().is_empty());
    gated.stop().await;

    let h = Harness::new();
    let visibility = h.agent(TerminationPolicy::VisibilityBased);
    visibility.start().await;
    visibility
        .lifecycle_handle()
        .unwrap()
        .notify(LifecycleEvent::VisibilityHidden);
    wait_until(|| !h.transport.beacons().is_empty()).await;

    assert_eq!(h.transport.beacons()[0].reason, "visibilitychange");
    visibility.stop().await;
}

#[tokio::test]
async fn test_back_forward_cache_does_not_end_session() {
    let h = Harness::new();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start().await;
    agent.record(event(0)).await;

    let lifecycle = agent.lifecycle_handle().unwrap();
    lifecycle.notify(LifecycleEvent::PageHide { persisted: true });
    lifecycle.notify(LifecycleEvent::VisibilityVisible);
    wait_until(|| h.transport.uploads().len() == 1).await;

    assert!(h.transport.beacons().is_empty());
    assert!(!agent.session().unwrap().termination_signaled);
    agent.stop().await;
}

// ============================================
// Agent surface
// ============================================

#[tokio::test]
async fn test_engine_events_are_drained_on_stop() {
    let h = Harness::new();
    let engine = ScriptedEngine::default();
    let agent = h.agent(TerminationPolicy::VisibilityBased);
    agent.start_with_engine(&engine).await;

    for seq in 0..3 {
        engine.emit(event(seq));
    }
    agent.stop().await;

    assert!(engine.stopped.load(Ordering::SeqCst));
    assert_eq!(
        h.transport.uploaded_events(),
        (0..3).map(event).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_engine_may_query_agent_while_starting() {
    let h = Harness::new();
    let agent = Arc::new(h.agent(TerminationPolicy::VisibilityBased));
    let engine = InspectingEngine {
        agent: agent.clone(),
        seen_session: Mutex::new(None),
        callback: Mutex::new(None),
    };

    agent.start_with_engine(&engine).await;

    let seen = engine.seen_session.lock().unwrap().clone();
    assert!(seen.is_some());
    assert_eq!(seen, agent.session().map(|s| s.session_id));

    if let Some(callback) = engine.callback.lock().unwrap().as_ref() {
        callback(event(0));
    }
    agent.stop().await;
    assert_eq!(h.transport.uploaded_events(), vec![event(0)]);
}

#[tokio::test]
async fn test_session_start_metadata_and_identify() {
    let h = Harness::new();
    let agent = CaptureAgent::builder(h.config())
        .transport(h.transport.clone())
        .session_store(h.store.clone())
        .clock(Arc::new(h.clock.clone()))
        .page_context(PageContext {
            url: "https://shop.example/cart".to_string(),
            referrer: Some("https://search.example".to_string()),
            ..PageContext::default()
        })
        .build()
        .unwrap();
    agent.start().await;
    wait_until(|| h.transport.session_starts().len() == 1).await;

    let start = &h.transport.session_starts()[0];
    assert_eq!(start.metadata.url, "https://shop.example/cart");
    assert_eq!(start.metadata.timestamp, h.clock_ms());
    assert!(start.user_id.is_none());

    agent
        .identify(Some("user-42".to_string()), Some("ada@example.com".to_string()))
        .await;

    let starts = h.transport.session_starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[1].session_id, starts[0].session_id);
    assert_eq!(starts[1].user_id.as_deref(), Some("user-42"));
    assert_eq!(starts[1].user_email.as_deref(), Some("ada@example.com"));
    agent.stop().await;
}

#[tokio::test]
async fn test_lifecycle_handle_closes_after_stop() {
    let h = Harness::new();
    let agent = h.agent(GATED);
    agent.start().await;
    let lifecycle = agent.lifecycle_handle().unwrap();

    agent.stop().await;

    assert!(!lifecycle.notify(LifecycleEvent::Unload));
    assert!(agent.lifecycle_handle().is_none());
    assert!(!agent.is_active());
}

#[tokio::test]
async fn test_global_slot_keeps_first_agent() {
    let h = Harness::new();
    let first = Arc::new(h.agent(GATED));
    let second = Arc::new(h.agent(GATED));

    assert!(sessionreel_core::global::install(first.clone()).is_ok());
    assert!(sessionreel_core::global::install(second).is_err());
    assert!(Arc::ptr_eq(&sessionreel_core::global::get().unwrap(), &first));
}
