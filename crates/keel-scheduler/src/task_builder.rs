//! Resolve launch inputs for a pending task and build the placed task.

use keel_core::{Resources, SchedulerConfig};
use keel_placement::OfferHolder;
use keel_state::*;

use crate::error::{SchedulerError, SchedulerResult};

/// Request, deploy, and pending task backing one launch.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub request: Request,
    pub deploy: Deploy,
    pub pending_task: PendingTask,
}

/// A task request with its effective resources resolved.
#[derive(Debug, Clone)]
pub struct TaskRequestHolder {
    pub task_request: TaskRequest,
    pub task_resources: Resources,
    pub executor_resources: Resources,
}

impl TaskRequestHolder {
    pub fn new(task_request: TaskRequest, config: &SchedulerConfig) -> Self {
        let task_resources = task_request
            .pending_task
            .resources
            .or(task_request.deploy.resources)
            .unwrap_or(config.default_resources);
        let executor_resources = if task_request.deploy.custom_executor {
            config.custom_executor_resources
        } else {
            Resources::EMPTY
        };
        Self {
            task_request,
            task_resources,
            executor_resources,
        }
    }

    /// Everything an offer must hold for this task.
    pub fn total_resources(&self) -> Resources {
        self.task_resources.add(&self.executor_resources)
    }

    pub fn pending_task_id(&self) -> &PendingTaskId {
        &self.task_request.pending_task.pending_task_id
    }
}

/// Load the pending task, its request, and its deploy.
///
/// Returns `Ok(None)` when the pending task itself is gone (already placed
/// or deleted).
pub fn resolve_task_request(
    store: &StateStore,
    config: &SchedulerConfig,
    pending_task_id: &PendingTaskId,
) -> SchedulerResult<Option<TaskRequestHolder>> {
    let Some(pending_task) = store.get_pending_task(pending_task_id)? else {
        return Ok(None);
    };
    let request = store
        .get_request(&pending_task_id.request_id)?
        .ok_or_else(|| SchedulerError::RequestNotFound(pending_task_id.request_id.clone()))?
        .request;
    let deploy = store
        .get_deploy(&pending_task_id.request_id, &pending_task_id.deploy_id)?
        .ok_or_else(|| SchedulerError::DeployNotFound {
            request_id: pending_task_id.request_id.clone(),
            deploy_id: pending_task_id.deploy_id.clone(),
        })?;

    let task_request = TaskRequest {
        request,
        deploy,
        pending_task,
    };
    Ok(Some(TaskRequestHolder::new(task_request, config)))
}

/// Build the task placed on `offer` for `holder`.
pub fn build_task(offer: &OfferHolder, holder: &TaskRequestHolder, now: u64) -> Task {
    let pending = &holder.task_request.pending_task;
    let pending_task_id = pending.pending_task_id.clone();
    Task {
        task_id: TaskId {
            request_id: pending_task_id.request_id.clone(),
            deploy_id: pending_task_id.deploy_id.clone(),
            started_at: now,
            instance_no: pending_task_id.instance_no,
            host: offer.sanitized_host(),
            agent_id: offer.agent_id().to_string(),
        },
        pending_task_id,
        state: TaskState::Launched,
        health: TaskHealth::Unknown,
        healthchecks_finished: false,
        startup_healthchecks: 0,
        resources: holder.task_resources,
        executor_resources: holder.executor_resources,
        offer_ids: offer.offer_ids(),
        run_id: pending.run_id.clone(),
        command_line_args: pending.command_line_args.clone(),
    }
}

/// Drop fields that carry no information before the task is persisted.
pub fn optimize_size(mut task: Task) -> Task {
    if task.command_line_args.as_ref().is_some_and(|args| args.is_empty()) {
        task.command_line_args = None;
    }
    if task.run_id.as_ref().is_some_and(|id| id.is_empty()) {
        task.run_id = None;
    }
    task.offer_ids.sort();
    task.offer_ids.dedup();
    task
}
