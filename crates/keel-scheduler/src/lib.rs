//! keel-scheduler: pending-task admission and offer matching.
//!
//! Pending tasks flow through two stages. Admission waits on each task's
//! request lock, several at a time, highest weighted priority first. Matching
//! is a single loop that scores the offer pool for each locked task, persists
//! and launches the task on the best offer, and releases the lock.
//!
//! # Architecture
//!
//! ```text
//! PendingTaskProcessor
//!   ├── PendingTaskQueue (one entry per task: Queued/Locking/Locked/Matching)
//!   ├── lock-wait loop ── RequestLock (≤ parallel_lock_wait in flight)
//!   └── match loop ────── OfferMatcher
//!                           ├── OfferPool (checkout, use, return)
//!                           ├── UsageOracle + score_offer (keel-placement)
//!                           ├── StateStore (task + pending task swap)
//!                           └── LaunchClient
//! ```

pub mod error;
pub mod leader;
pub mod matcher;
pub mod offers;
pub mod priority;
pub mod processor;
pub mod queue;
pub mod task_builder;

pub use error::{SchedulerError, SchedulerResult};
pub use leader::{LeadershipOracle, StaticLeadership};
pub use matcher::{MatchOutcome, OfferMatcher};
pub use offers::{InMemoryOfferPool, LaunchClient, OfferPool};
pub use priority::{priority_level, weighted_priority};
pub use processor::{LOCK_NAME, PendingTaskProcessor};
pub use queue::{PendingTaskQueue, QueueStatus, Removal};
pub use task_builder::{TaskRequest, TaskRequestHolder, resolve_task_request};
