//! Pending task processor: admission and match loops.
//!
//! `start()` spawns two background loops over a shared [`PendingTaskQueue`]:
//!
//! - the **lock-wait loop** keeps up to `parallel_lock_wait` request-lock
//!   acquisitions in flight, always claiming the queued task with the highest
//!   weighted priority;
//! - the **match loop** is a single task, so offer consumption is strictly
//!   serialized. It takes locked tasks in natural order and places them.
//!
//! `stop()` is cooperative: loops exit between iterations, a match in
//! progress runs to completion, and lock waits already in flight are left to
//! finish and release on their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use keel_core::{RequestLock, RequestLockGuard, SchedulerConfig, epoch_millis};
use keel_state::{PendingTaskId, StateStore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::leader::LeadershipOracle;
use crate::matcher::{MatchOutcome, OfferMatcher};
use crate::priority::{priority_level, weighted_priority};
use crate::queue::{PendingTaskQueue, Removal};

/// Lock name used for every admission lock.
pub const LOCK_NAME: &str = "pending-task-queue";

/// Upper bound on how long an idle loop sleeps before re-checking state.
const IDLE_POLL: Duration = Duration::from_millis(250);

struct ProcessorInner {
    config: SchedulerConfig,
    store: StateStore,
    lock: Arc<dyn RequestLock>,
    matcher: OfferMatcher,
    queue: PendingTaskQueue,
    running: AtomicBool,
}

pub struct PendingTaskProcessor {
    inner: Arc<ProcessorInner>,
    leadership: Arc<dyn LeadershipOracle>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PendingTaskProcessor {
    pub fn new(
        config: SchedulerConfig,
        store: StateStore,
        lock: Arc<dyn RequestLock>,
        matcher: OfferMatcher,
        leadership: Arc<dyn LeadershipOracle>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                config,
                store,
                lock,
                matcher,
                queue: PendingTaskQueue::new(),
                running: AtomicBool::new(false),
            }),
            leadership,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start both loops. Any previous run is replaced, starting from an
    /// empty queue.
    pub async fn start(&self) -> SchedulerResult<()> {
        if !self.leadership.has_leadership() {
            return Err(SchedulerError::NotLeader);
        }

        self.halt().await;
        self.inner.running.store(true, Ordering::SeqCst);

        let lock_wait = tokio::spawn(lock_wait_loop(self.inner.clone()));
        let matching = tokio::spawn(match_loop(self.inner.clone()));
        self.handles().extend([lock_wait, matching]);

        info!(
            parallel_lock_wait = self.inner.config.parallel_lock_wait,
            "pending task processor started"
        );
        Ok(())
    }

    /// Stop both loops and discard queued work.
    pub async fn stop(&self) {
        self.halt().await;
        info!("pending task processor stopped");
    }

    /// Stop if leadership was lost. Returns true if the processor stopped.
    pub async fn check_leadership(&self) -> bool {
        if self.is_running() && !self.leadership.has_leadership() {
            warn!("leadership lost, stopping pending task processor");
            self.stop().await;
            return true;
        }
        false
    }

    async fn halt(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.queue.wake_all();

        let handles: Vec<JoinHandle<()>> = self.handles().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "pending task loop ended abnormally");
            }
        }

        for guard in self.inner.queue.clear() {
            guard.release().await;
        }
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Submit a pending task for admission. Returns false if it is already
    /// handled.
    ///
    /// The request's priority level is read here, once, and kept with the
    /// queued task for every later admission decision.
    pub fn submit(&self, pending_task_id: PendingTaskId) -> bool {
        let inner = &self.inner;
        let level = priority_level(
            &inner.store,
            &pending_task_id.request_id,
            inner.config.default_task_priority_level,
        );
        inner.queue.submit(pending_task_id, level)
    }

    /// Remove a pending task from admission or matching.
    pub async fn remove(&self, pending_task_id: &PendingTaskId) -> bool {
        match self.inner.queue.remove(pending_task_id) {
            Removal::NotPresent | Removal::InFlight => false,
            Removal::Removed => true,
            Removal::RemovedLocked(guard) => {
                guard.release().await;
                true
            }
        }
    }

    /// Every task currently handled.
    pub fn snapshot(&self) -> Vec<PendingTaskId> {
        self.inner.queue.snapshot()
    }

    pub fn queue(&self) -> &PendingTaskQueue {
        &self.inner.queue
    }

    /// Wait until no task is handled, up to `timeout`. Returns true if the
    /// queue drained.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.inner.queue.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.inner.queue.is_empty()
    }
}

impl ProcessorInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn claim_next(&self) -> Option<PendingTaskId> {
        let now = epoch_millis();
        let weight_factor = self.config.scheduler_priority_weight_factor;
        self.queue
            .claim_next_for_locking(|id, level| weighted_priority(id, level, weight_factor, now))
    }

    async fn acquire_lock(&self, id: PendingTaskId) {
        match RequestLockGuard::acquire(self.lock.clone(), &id.request_id, LOCK_NAME).await {
            Ok(guard) => {
                if let Err(guard) = self.queue.lock_acquired(&id, guard) {
                    debug!(pending_task_id = %id, "task removed while waiting on its lock");
                    guard.release().await;
                }
            }
            Err(e) => {
                warn!(pending_task_id = %id, error = %e, "unable to acquire request lock, dropping task");
                self.queue.lock_failed(&id);
                // Clears any partial acquisition; a live holder is untouched.
                self.lock.unlock(&id.request_id, LOCK_NAME, epoch_millis()).await;
            }
        }
    }

    /// Run one match attempt. Returns true if no offer could take the task.
    async fn match_one(&self, id: PendingTaskId, guard: RequestLockGuard) -> bool {
        let started = epoch_millis();
        let outcome = self.matcher.match_task(&id).await;
        guard.release().await;

        let no_offer = matches!(outcome, Ok(MatchOutcome::NoOffer));
        match outcome {
            Ok(MatchOutcome::Matched { .. }) | Ok(MatchOutcome::PendingTaskNotFound) => {
                self.queue.finish(&id);
            }
            Ok(MatchOutcome::NoOffer) => {
                debug!(pending_task_id = %id, "no offer, returning task to admission");
                self.queue.requeue(&id);
            }
            Err(e) => {
                error!(pending_task_id = %id, error = %e, "error running task launch");
                self.queue.finish(&id);
            }
        }
        debug!(
            pending_task_id = %id,
            elapsed_ms = epoch_millis().saturating_sub(started),
            "offer loop iteration finished"
        );
        no_offer
    }
}

// ── Loops ──────────────────────────────────────────────────────────

async fn lock_wait_loop(inner: Arc<ProcessorInner>) {
    let parallel = inner.config.parallel_lock_wait.max(1);
    let mut in_flight = JoinSet::new();

    while inner.is_running() {
        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "lock wait task failed");
            }
        }

        if in_flight.len() < parallel {
            if let Some(id) = inner.claim_next() {
                let worker = inner.clone();
                in_flight.spawn(async move { worker.acquire_lock(id).await });
                continue;
            }
        }

        tokio::select! {
            _ = inner.queue.admission_notified() => {}
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "lock wait task failed");
                }
            }
            _ = tokio::time::sleep(IDLE_POLL) => {}
        }
    }

    // In-flight waits finish on their own and release what they get.
    in_flight.detach_all();
    debug!("lock wait loop exited");
}

async fn match_loop(inner: Arc<ProcessorInner>) {
    // Set when a pass left a task without an offer; the loop then pauses
    // instead of re-matching against the same offers right away.
    let mut starved = false;
    while inner.is_running() {
        match inner.queue.take_next_locked() {
            Some((id, guard)) => starved |= inner.match_one(id, guard).await,
            None if starved => {
                starved = false;
                tokio::time::sleep(IDLE_POLL).await;
            }
            None => {
                tokio::select! {
                    _ = inner.queue.matching_notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
    debug!("match loop exited");
}
