use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::graph::Target;

/// Millisecond wall clock. Injected so event aging is deterministic
/// under test.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests.
#[derive(Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Sink for rule lifecycle batches headed to whatever watches build
/// status: the gRPC event stream, a log, a recording test double.
pub trait BuildRulePublisher: Send + Sync {
    fn targets_started(&self, targets: &[Target]) -> Result<()>;
    fn targets_finished(&self, targets: &[Target]) -> Result<()>;
}

/// Publisher for runs with no external status consumer.
pub struct LogPublisher;

impl BuildRulePublisher for LogPublisher {
    fn targets_started(&self, targets: &[Target]) -> Result<()> {
        for target in targets {
            tracing::debug!(target = %target, "Target started");
        }
        Ok(())
    }

    fn targets_finished(&self, targets: &[Target]) -> Result<()> {
        for target in targets {
            tracing::debug!(target = %target, "Target finished");
        }
        Ok(())
    }
}

struct FinishedEvent {
    target: Target,
    recorded_at_ms: i64,
}

struct PendingEvents {
    events: VecDeque<FinishedEvent>,
    all_finished_recorded: bool,
}

/// Collects finish events and republishes them only once they have
/// aged past a settling margin.
///
/// Status consumers see a finish only after the margin, which keeps a
/// finish that is immediately contradicted (a re-dispatched target
/// failing on retry, clock skew between reporters) from leaking a
/// premature "done". Started events carry no such risk and pass
/// through immediately.
///
/// Pending events keep insertion order under one lock; a flush scans
/// from the front and stops at the first event still inside the
/// margin, so nothing is ever published out of order. Publishing
/// happens outside the lock, and a failed publish drops its batch
/// rather than retrying it.
pub struct EventManager {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn BuildRulePublisher>,
    publish_margin_ms: i64,
    pending: Mutex<PendingEvents>,
}

impl EventManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        sink: Arc<dyn BuildRulePublisher>,
        publish_margin_ms: u64,
    ) -> Self {
        Self {
            clock,
            sink,
            publish_margin_ms: publish_margin_ms as i64,
            pending: Mutex::new(PendingEvents {
                events: VecDeque::new(),
                all_finished_recorded: false,
            }),
        }
    }

    /// Publish started events right away.
    pub fn record_started(&self, targets: &[Target]) {
        if targets.is_empty() {
            return;
        }
        if let Err(e) = self.sink.targets_started(targets) {
            tracing::warn!(count = targets.len(), error = %e, "Dropping started events after publish failure");
        }
    }

    /// Queue finish events, stamped with the current clock.
    pub fn record_finished(&self, targets: &[Target]) {
        if targets.is_empty() {
            return;
        }
        let now = self.clock.now_ms();
        let mut pending = self.lock_pending();
        for target in targets {
            pending.events.push_back(FinishedEvent {
                target: target.clone(),
                recorded_at_ms: now,
            });
        }
    }

    /// Note that every target of the build has a finish event recorded.
    /// The final flush warns when this was never called.
    pub fn record_all_finished(&self) {
        self.lock_pending().all_finished_recorded = true;
    }

    /// Publish every pending event that has aged past the margin.
    pub fn flush_synchronized(&self) {
        let now = self.clock.now_ms();
        let batch: Vec<Target> = {
            let mut pending = self.lock_pending();
            let mut batch = Vec::new();
            while let Some(front) = pending.events.front() {
                if now - front.recorded_at_ms < self.publish_margin_ms {
                    break;
                }
                if let Some(event) = pending.events.pop_front() {
                    batch.push(event.target);
                }
            }
            batch
        };
        self.publish_finished(batch);
    }

    /// Publish everything left regardless of age. Called once when the
    /// build shuts down.
    pub fn flush_all(&self) {
        let batch: Vec<Target> = {
            let mut pending = self.lock_pending();
            if !pending.all_finished_recorded && !pending.events.is_empty() {
                tracing::warn!(
                    pending = pending.events.len(),
                    "Final event flush before all targets were reported finished"
                );
            }
            pending.events.drain(..).map(|e| e.target).collect()
        };
        self.publish_finished(batch);
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().events.len()
    }

    pub fn all_finished_recorded(&self) -> bool {
        self.lock_pending().all_finished_recorded
    }

    /// Periodic flush driver. Runs until cancelled, then flushes the
    /// remainder unconditionally.
    pub async fn run_flush_loop(&self, interval_ms: u64, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => self.flush_synchronized(),
                _ = token.cancelled() => {
                    self.flush_all();
                    break;
                }
            }
        }
        tracing::debug!("Event flush loop stopped");
    }

    fn publish_finished(&self, batch: Vec<Target>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.sink.targets_finished(&batch) {
            tracing::warn!(count = batch.len(), error = %e, "Dropping finished events after publish failure");
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingEvents> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The queue factory publishes synthesized events for pruned targets
/// through a plain publisher; routing that through the manager applies
/// the same delayed-finish discipline to them.
impl BuildRulePublisher for EventManager {
    fn targets_started(&self, targets: &[Target]) -> Result<()> {
        self.record_started(targets);
        Ok(())
    }

    fn targets_finished(&self, targets: &[Target]) -> Result<()> {
        self.record_finished(targets);
        Ok(())
    }
}
