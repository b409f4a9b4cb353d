//! Admission queue for pending tasks.
//!
//! One map keyed by pending-task id holds every submitted task together with
//! its stage:
//!
//! ```text
//! submit ──► Queued ──claim──► Locking ──lock ok──► Locked ──take──► Matching
//!              ▲                  │                                   │
//!              │                  └─lock failed──► (dropped)          │
//!              └──────────────────── no offer ◄────────────────────────┤
//!                                          placed / error ──► (dropped)
//! ```
//!
//! Queued tasks are admitted by weighted priority; locked tasks are matched
//! in natural order (earliest scheduled run first). Because the stage lives
//! in one entry, a task can never sit in both queues at once.
//!
//! Each entry carries the request's priority level, resolved once at submit.
//! Claiming is then a single pass over the queue with no storage access.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use keel_core::RequestLockGuard;
use keel_state::PendingTaskId;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Stage of a submitted task, as visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Locking,
    Locked,
    Matching,
}

enum Stage {
    Queued,
    Locking,
    Locked(RequestLockGuard),
    Matching,
}

impl Stage {
    fn status(&self) -> QueueStatus {
        match self {
            Stage::Queued => QueueStatus::Queued,
            Stage::Locking => QueueStatus::Locking,
            Stage::Locked(_) => QueueStatus::Locked,
            Stage::Matching => QueueStatus::Matching,
        }
    }
}

struct Entry {
    stage: Stage,
    priority_level: f64,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<PendingTaskId, Entry>,
    locked: BTreeSet<PendingTaskId>,
}

/// Result of removing a task from the queue.
#[derive(Debug)]
pub enum Removal {
    NotPresent,
    Removed,
    /// The task held its request lock; the caller must release it.
    RemovedLocked(RequestLockGuard),
    /// The task is being matched right now and cannot be removed.
    InFlight,
}

#[derive(Default)]
pub struct PendingTaskQueue {
    state: Mutex<QueueState>,
    admission: Notify,
    matching: Notify,
}

impl PendingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a task at the given request priority level unless it is already
    /// handled. Returns true if added.
    pub fn submit(&self, id: PendingTaskId, priority_level: f64) -> bool {
        let added = {
            let mut state = self.state();
            if state.entries.contains_key(&id) {
                false
            } else {
                let entry = Entry {
                    stage: Stage::Queued,
                    priority_level,
                };
                state.entries.insert(id.clone(), entry);
                true
            }
        };
        if added {
            debug!(pending_task_id = %id, priority_level, "pending task submitted");
            self.admission.notify_one();
        }
        added
    }

    /// Remove a task from whichever stage holds it.
    ///
    /// A task that is still waiting on its lock is dropped here; the waiter
    /// releases the lock when it finds the entry gone.
    pub fn remove(&self, id: &PendingTaskId) -> Removal {
        let mut state = self.state();
        let Some(entry) = state.entries.remove(id) else {
            return Removal::NotPresent;
        };
        match entry.stage {
            Stage::Queued | Stage::Locking => Removal::Removed,
            Stage::Locked(guard) => {
                state.locked.remove(id);
                Removal::RemovedLocked(guard)
            }
            Stage::Matching => {
                state.entries.insert(id.clone(), entry);
                warn!(pending_task_id = %id, "unable to remove pending task while it is being matched");
                Removal::InFlight
            }
        }
    }

    /// Every task currently handled, in any stage.
    pub fn snapshot(&self) -> Vec<PendingTaskId> {
        self.state().entries.keys().cloned().collect()
    }

    pub fn status(&self, id: &PendingTaskId) -> Option<QueueStatus> {
        self.state().entries.get(id).map(|e| e.stage.status())
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Admission side ─────────────────────────────────────────────

    /// Claim the queued task with the highest `priority` for locking. The
    /// closure gets each task with its cached priority level and runs under
    /// the queue mutex, so it must not block. Ties go to the task that sorts
    /// first in natural order.
    pub fn claim_next_for_locking<F>(&self, mut priority: F) -> Option<PendingTaskId>
    where
        F: FnMut(&PendingTaskId, f64) -> f64,
    {
        let mut state = self.state();
        let mut best: Option<(f64, &PendingTaskId)> = None;
        for (id, entry) in &state.entries {
            if !matches!(entry.stage, Stage::Queued) {
                continue;
            }
            let score = priority(id, entry.priority_level);
            let better = match best {
                None => true,
                Some((top, top_id)) => score > top || (score == top && id < top_id),
            };
            if better {
                best = Some((score, id));
            }
        }

        let id = best.map(|(_, id)| id.clone())?;
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.stage = Stage::Locking;
        }
        Some(id)
    }

    /// Hand a freshly acquired lock to the task. If the task was removed
    /// while waiting, the guard comes back for the caller to release.
    pub fn lock_acquired(
        &self,
        id: &PendingTaskId,
        guard: RequestLockGuard,
    ) -> Result<(), RequestLockGuard> {
        {
            let mut state = self.state();
            match state.entries.get_mut(id) {
                Some(entry) if matches!(entry.stage, Stage::Locking) => {
                    entry.stage = Stage::Locked(guard);
                    state.locked.insert(id.clone());
                }
                _ => return Err(guard),
            }
        }
        self.matching.notify_one();
        Ok(())
    }

    /// The lock could not be taken; the task is dropped.
    pub fn lock_failed(&self, id: &PendingTaskId) {
        self.state().entries.remove(id);
    }

    /// Put a task back for admission at its original priority level; it
    /// must re-acquire its lock.
    pub fn requeue(&self, id: &PendingTaskId) {
        {
            let mut state = self.state();
            state.locked.remove(id);
            match state.entries.get_mut(id) {
                Some(entry) => entry.stage = Stage::Queued,
                None => return,
            }
        }
        self.admission.notify_one();
    }

    pub async fn admission_notified(&self) {
        self.admission.notified().await;
    }

    // ── Match side ─────────────────────────────────────────────────

    /// Take the earliest locked task for matching, with its lock.
    pub fn take_next_locked(&self) -> Option<(PendingTaskId, RequestLockGuard)> {
        let mut state = self.state();
        while let Some(id) = state.locked.pop_first() {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            // Anything not actually locked stays where it is.
            if matches!(entry.stage, Stage::Locked(_))
                && let Stage::Locked(guard) = std::mem::replace(&mut entry.stage, Stage::Matching)
            {
                return Some((id, guard));
            }
        }
        None
    }

    /// Forget a task after matching, whether placed or abandoned.
    pub fn finish(&self, id: &PendingTaskId) {
        self.state().entries.remove(id);
    }

    pub async fn matching_notified(&self) {
        self.matching.notified().await;
    }

    /// Wake both loops, e.g. so they observe a stop request.
    pub fn wake_all(&self) {
        self.admission.notify_one();
        self.matching.notify_one();
    }

    /// Drop every task except those being matched. Returns the locks held by
    /// dropped tasks so the caller can release them.
    pub fn clear(&self) -> Vec<RequestLockGuard> {
        let mut state = self.state();
        state.locked.clear();
        let entries = std::mem::take(&mut state.entries);
        let mut guards = Vec::new();
        for (id, entry) in entries {
            match entry.stage {
                Stage::Locked(guard) => guards.push(guard),
                Stage::Matching => {
                    state.entries.insert(id, entry);
                }
                Stage::Queued | Stage::Locking => {}
            }
        }
        guards
    }
}
