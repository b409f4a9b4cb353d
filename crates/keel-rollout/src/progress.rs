//! Canary step arithmetic.
//!
//! Pure helpers over [`DeployProgress`]: when a step may advance, what the
//! next target is, which old tasks a step retires, and when a deploy is
//! overdue.

use keel_core::DeployConfig;
use keel_state::{Deploy, DeployProgress, PendingDeploy, Request, TaskId, UpdatePendingDeployRequest};

/// Task retry budget of a deploy (0 when unset or the deploy is missing).
pub fn max_retries(deploy: Option<&Deploy>) -> u32 {
    deploy.and_then(|d| d.max_task_retries).unwrap_or(0)
}

/// Failed tasks can be retried while their count stays within the budget.
pub fn can_retry_tasks(deploy: Option<&Deploy>, inactive_count: usize) -> bool {
    let max = max_retries(deploy);
    max > 0 && inactive_count <= max as usize
}

/// Inactive deploy tasks not yet recorded as failed in the progress.
pub fn new_inactive_deploy_tasks(progress: &DeployProgress, inactive: &[TaskId]) -> Vec<TaskId> {
    inactive
        .iter()
        .filter(|t| !progress.failed_deploy_tasks.contains(*t))
        .cloned()
        .collect()
}

/// A completed step advances on its own once the step wait has elapsed.
pub fn can_move_to_next_step(progress: &DeployProgress, now: u64) -> bool {
    progress.auto_advance_deploy_steps
        && progress.timestamp.saturating_add(progress.deploy_step_wait_time_ms) < now
}

/// Target for the next step.
///
/// An operator update sets the target directly (capped at the request's
/// instance count). Otherwise the target grows by one step and never shrinks.
pub fn new_target_instances(
    progress: &DeployProgress,
    request: &Request,
    update: Option<&UpdatePendingDeployRequest>,
) -> u32 {
    let instances = request.instances_safe();
    if let Some(update) = update {
        return update.target_active_instances.min(instances);
    }
    let step = if progress.deploy_instance_count_per_step == 0 {
        instances
    } else {
        progress.deploy_instance_count_per_step
    };
    progress
        .target_active_instances
        .saturating_add(step)
        .min(instances)
        .max(progress.target_active_instances)
}

/// Old-deploy tasks the current step replaces, lowest instance number first.
pub fn tasks_to_shut_down(progress: &DeployProgress, other_active: &[TaskId], request: &Request) -> Vec<TaskId> {
    let keep = request
        .instances_safe()
        .saturating_sub(progress.target_active_instances) as usize;
    let count = other_active.len().saturating_sub(keep);

    let mut sorted = other_active.to_vec();
    sorted.sort_by(|a, b| a.instance_no.cmp(&b.instance_no).then_with(|| a.cmp(b)));
    sorted.truncate(count);
    sorted
}

/// How long a step may take to become healthy.
pub fn allowed_millis(deploy: &Deploy, config: &DeployConfig) -> u64 {
    deploy
        .deploy_health_timeout_secs
        .unwrap_or(config.default_deploy_healthy_by_secs)
        .saturating_mul(1000)
}

pub fn is_deploy_overdue(
    pending: &PendingDeploy,
    deploy: Option<&Deploy>,
    config: &DeployConfig,
    now: u64,
) -> bool {
    let Some(deploy) = deploy else {
        return true;
    };
    if pending.deploy_progress.as_ref().is_some_and(|p| p.step_complete) {
        return false;
    }
    let started = pending
        .deploy_progress
        .as_ref()
        .map_or(pending.deploy_marker.timestamp, |p| p.timestamp);
    now.saturating_sub(started) > allowed_millis(deploy, config)
}

/// Render a duration in millis the way deploy messages show it.
pub fn format_millis(millis: u64) -> String {
    let secs = millis / 1000;
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, m, s) => format!("{h}h {m}m {s}s"),
    }
}
