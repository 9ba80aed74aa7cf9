//! Decides when the buffer is drained
//!
//! Three triggers funnel into [`FlushScheduler::flush`]:
//! - size: after an append leaves `flush_threshold` or more events buffered
//! - timer: every `flush_interval` while the session is active
//! - lifecycle: page hide/unload, with `unloading = true`
//!
//! Overlapping flushes need no coordination: each drains whatever is
//! buffered at its own start.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::buffer::EventBuffer;
use crate::identity::SessionIdentity;
use crate::transport::TransportLayer;

/// Flush policy for one session
#[derive(Debug)]
pub struct FlushScheduler {
    buffer: EventBuffer,
    layer: Arc<TransportLayer>,
    identity: Option<Arc<SessionIdentity>>,
    flush_threshold: usize,
    flush_interval: Duration,
    heartbeat_interval: Option<Duration>,
    timer: Mutex<Option<TimerTask>>,
}

#[derive(Debug)]
struct TimerTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl FlushScheduler {
    pub(crate) fn new(
        buffer: EventBuffer,
        layer: Arc<TransportLayer>,
        identity: Option<Arc<SessionIdentity>>,
        flush_threshold: usize,
        flush_interval: Duration,
        heartbeat_interval: Option<Duration>,
    ) -> Self {
        Self {
            buffer,
            layer,
            identity,
            flush_threshold,
            flush_interval,
            heartbeat_interval,
            timer: Mutex::new(None),
        }
    }

    /// Whether an append that left `buffered` events should trigger a flush
    pub fn should_flush(&self, buffered: usize) -> bool {
        buffered >= self.flush_threshold
    }

    /// Drain the buffer and upload it; no-op when empty
    pub async fn flush(&self, unloading: bool) {
        let batch = self.buffer.drain_all();
        if batch.is_empty() {
            return;
        }

        tracing::debug!(
            session_id = %self.layer.session_id(),
            events = batch.len(),
            unloading,
            "Flushing buffer"
        );

        if self.layer.upload(batch, unloading).await {
            if let Some(identity) = &self.identity {
                identity.touch();
            }
        }
    }

    /// Start the periodic flush (and heartbeat) timer
    ///
    /// Calling `start` on a running scheduler restarts the timer.
    pub fn start(self: &Arc<Self>) {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let scheduler = Arc::downgrade(self);
        let flush_ticker = ticker(self.flush_interval);
        let heartbeat_ticker = self.heartbeat_interval.map(ticker);
        let task = tokio::spawn(run_timer(scheduler, flush_ticker, heartbeat_ticker, shutdown_rx));

        if let Some(previous) = self.lock_timer().replace(TimerTask { shutdown, task }) {
            let _ = previous.shutdown.send(());
        }
    }

    /// Stop the periodic timer
    ///
    /// Returns once the timer task has exited. A timer flush that was already
    /// uploading (retries included) finishes first, so anything it requeued is
    /// back in the buffer by the time this resolves.
    pub async fn stop(&self) {
        let Some(timer) = self.lock_timer().take() else {
            return;
        };
        let _ = timer.shutdown.send(());
        if let Err(e) = timer.task.await {
            tracing::debug!(error = %e, "Flush timer task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_timer().is_some()
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<TimerTask>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_timer(
    scheduler: Weak<FlushScheduler>,
    mut flush_ticker: Interval,
    mut heartbeat_ticker: Option<Interval>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = flush_ticker.tick() => {
                let Some(scheduler) = scheduler.upgrade() else { break };
                scheduler.flush(false).await;
            }
            _ = next_tick(&mut heartbeat_ticker) => {
                let Some(scheduler) = scheduler.upgrade() else { break };
                scheduler.layer.heartbeat(scheduler.buffer.total_accepted()).await;
            }
        }
    }
    tracing::trace!("Flush timer stopped");
}
