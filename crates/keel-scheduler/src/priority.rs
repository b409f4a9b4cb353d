//! Weighted priority for admission ordering.
//!
//! `overdue_millis × priority_level ^ weight_factor`, where overdue time is
//! at least one millisecond. Higher values are admitted first, so a
//! low-priority task still gets served once it has waited long enough.

use keel_state::{PendingTaskId, StateStore};
use tracing::warn;

pub fn weighted_priority(
    pending_task_id: &PendingTaskId,
    priority_level: f64,
    weight_factor: f64,
    now: u64,
) -> f64 {
    let overdue_millis = now.saturating_sub(pending_task_id.next_run_at).max(1) as f64;
    overdue_millis * priority_level.powf(weight_factor)
}

/// A request's task priority level, or `default_level` when the request is
/// missing, sets none, or cannot be read.
pub fn priority_level(store: &StateStore, request_id: &str, default_level: f64) -> f64 {
    match store.get_request(request_id) {
        Ok(Some(r)) => r.request.task_priority_level.unwrap_or(default_level),
        Ok(None) => default_level,
        Err(e) => {
            warn!(%request_id, error = %e, "priority lookup failed, using default");
            default_level
        }
    }
}
