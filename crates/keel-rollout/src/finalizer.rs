//! Deploy finalization.
//!
//! Once a deploy reaches a terminal state the finalizer moves the request's
//! deploy pointers, cleans up tasks of the losing side, re-enqueues whatever
//! pending requests the outcome calls for, and finally removes the pending
//! deploy. The pending-deploy delete is always the last write, so a crash
//! mid-finalization leaves a record the next check picks up again.

use keel_core::epoch_millis;
use keel_state::*;
use tracing::{debug, error, info, warn};

use crate::error::RolloutResult;

/// Cleanup type for tasks removed because of a deploy outcome.
///
/// Incremental deploys (fewer instances per step than the request runs)
/// report their own failure and cancel types.
pub fn cleanup_type(request: &Request, deploy: Option<&Deploy>, state: DeployState) -> TaskCleanupType {
    let incremental = deploy
        .and_then(|d| d.deploy_instance_count_per_step)
        .is_some_and(|per_step| per_step != request.instances_safe());
    match state {
        DeployState::Succeeded => TaskCleanupType::NewDeploySucceeded,
        DeployState::Canceled | DeployState::Canceling if incremental => {
            TaskCleanupType::IncrementalDeployCancelled
        }
        DeployState::Canceled | DeployState::Canceling => TaskCleanupType::DeployCanceled,
        DeployState::Overdue => TaskCleanupType::DeployOverdue,
        DeployState::Failed | DeployState::FailedInternalState | DeployState::Waiting if incremental => {
            TaskCleanupType::IncrementalDeployFailed
        }
        DeployState::Failed | DeployState::FailedInternalState | DeployState::Waiting => {
            TaskCleanupType::DeployFailed
        }
    }
}

/// Pending type for a deploy's run-immediately directive. `None` when a
/// one-off request is already at its instance cap.
pub fn run_now_pending_type(request: &Request, active_tasks: usize, pending_tasks: usize) -> Option<PendingType> {
    match request.request_type {
        RequestType::Scheduled if active_tasks == 0 => Some(PendingType::Immediate),
        RequestType::Scheduled => Some(PendingType::NewDeploy),
        RequestType::OnDemand | RequestType::RunOnce => match request.instances {
            Some(cap) if active_tasks + pending_tasks >= cap as usize => None,
            _ => Some(PendingType::Oneoff),
        },
        RequestType::Service | RequestType::Worker => Some(PendingType::NewDeploy),
    }
}

/// `DEPLOY_CANCELLED` for canceled deploys, `pending_type` otherwise.
pub fn canceled_or(state: DeployState, pending_type: PendingType) -> PendingType {
    if state == DeployState::Canceled {
        PendingType::DeployCancelled
    } else {
        pending_type
    }
}

#[derive(Clone)]
pub struct DeployFinalizer {
    store: StateStore,
}

impl DeployFinalizer {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Act on an evaluation result. Non-terminal results are returned
    /// untouched; terminal ones are finalized. The returned result is the
    /// one that was persisted.
    pub fn finalize(
        &self,
        request: &RequestWithState,
        effective_request: &Request,
        deploy: Option<&Deploy>,
        pending: &PendingDeploy,
        deploy_active_tasks: &[TaskId],
        other_active_tasks: &[TaskId],
        result: DeployResult,
    ) -> RolloutResult<DeployResult> {
        let marker = &pending.deploy_marker;

        let result = if result.deploy_state == DeployState::Succeeded {
            if self.save_new_deploy_state(marker, Some(marker))? {
                match effective_request.request_type {
                    RequestType::OnDemand => self.delete_or_recreate_pending_tasks(pending)?,
                    RequestType::RunOnce => {}
                    _ => self.delete_obsolete_pending_tasks(pending)?,
                }
                self.finish_deploy(request, deploy, pending, other_active_tasks, &result)?;
                return Ok(result);
            }
            warn!(deploy = %marker, "failing deploy because its deploy state could not be saved");
            DeployResult::new(DeployState::FailedInternalState, result.timestamp)
                .with_message(format!(
                    "Deploy had state {} but failed to persist it correctly",
                    result.deploy_state
                ))
                .with_lb_update(result.lb_update)
                .with_failures(DeployFailure::failed_to_save())
        } else if !result.deploy_state.is_deploy_finished() {
            return Ok(result);
        } else {
            result
        };

        self.save_new_deploy_state(marker, None)?;
        self.finish_deploy(request, deploy, pending, deploy_active_tasks, &result)?;
        Ok(result)
    }

    /// Fail a deploy whose request can no longer be deployed. A missing
    /// request only gets its result stored and the pending deploy removed.
    pub fn fail_due_to_state(
        &self,
        pending: &PendingDeploy,
        request: Option<&RequestWithState>,
        deploy: Option<&Deploy>,
    ) -> RolloutResult<DeployResult> {
        let state = request.map_or(RequestState::Deleted, |r| r.state);
        let result = DeployResult::new(DeployState::Failed, epoch_millis())
            .with_message(format!("Request in state {state} is not deployable"));

        let Some(request) = request else {
            self.store.put_deploy_result(&pending.deploy_marker, &result)?;
            self.store.delete_pending_deploy(&pending.deploy_marker.request_id)?;
            return Ok(result);
        };

        self.save_new_deploy_state(&pending.deploy_marker, None)?;
        self.finish_deploy(request, deploy, pending, &[], &result)?;
        Ok(result)
    }

    /// Move the active pointer to `new_active` (or keep it) and clear the
    /// pending pointer. False if the request has no deploy state.
    pub fn save_new_deploy_state(
        &self,
        marker: &DeployMarker,
        new_active: Option<&DeployMarker>,
    ) -> RolloutResult<bool> {
        let Some(current) = self.store.get_request_deploy_state(&marker.request_id)? else {
            error!(deploy = %marker, "expected a request deploy state but found none");
            return Ok(false);
        };
        self.store.put_request_deploy_state(&RequestDeployState {
            request_id: current.request_id,
            active_deploy: new_active.cloned().or(current.active_deploy),
            pending_deploy: None,
        })?;
        Ok(true)
    }

    /// Delete pending tasks of older deploys, re-submitting one-off runs
    /// under the new deploy.
    pub fn delete_or_recreate_pending_tasks(&self, pending: &PendingDeploy) -> RolloutResult<()> {
        let marker = &pending.deploy_marker;
        for id in self.store.list_pending_task_ids_for_request(&marker.request_id)? {
            if id.deploy_id == marker.deploy_id {
                continue;
            }
            if id.pending_type == PendingType::Oneoff
                && let Some(task) = self.store.get_pending_task(&id)?
            {
                let mut request = PendingRequest::new(
                    &marker.request_id,
                    &marker.deploy_id,
                    epoch_millis(),
                    task.user.clone(),
                    PendingType::Oneoff,
                );
                request.skip_healthchecks = task.skip_healthchecks;
                request.message = task.message.clone();
                request.run_id = task.run_id.clone();
                request.command_line_args = task.command_line_args.clone();
                request.resources = task.resources;
                info!(pending_task_id = %id, deploy = %marker, "rescheduling one-off task under new deploy");
                self.store.add_to_pending_queue(&request)?;
            }
            debug!(pending_task_id = %id, "deleting obsolete pending task");
            self.store.delete_pending_task(&id)?;
        }
        Ok(())
    }

    pub fn delete_obsolete_pending_tasks(&self, pending: &PendingDeploy) -> RolloutResult<()> {
        let marker = &pending.deploy_marker;
        for id in self.store.list_pending_task_ids_for_request(&marker.request_id)? {
            if id.deploy_id != marker.deploy_id {
                debug!(pending_task_id = %id, "deleting obsolete pending task");
                self.store.delete_pending_task(&id)?;
            }
        }
        Ok(())
    }

    fn cleanup_tasks(
        &self,
        pending: &PendingDeploy,
        request: &Request,
        deploy: Option<&Deploy>,
        result: &DeployResult,
        tasks: &[TaskId],
    ) -> RolloutResult<()> {
        let marker = &pending.deploy_marker;
        let cleanup_type = cleanup_type(request, deploy, result.deploy_state);
        for task_id in tasks {
            self.store.save_task_cleanup(&TaskCleanup {
                user: marker.user.clone(),
                cleanup_type,
                timestamp: result.timestamp,
                task_id: task_id.clone(),
                message: Some(format!("Deploy {} - {}", marker.deploy_id, result.deploy_state)),
            })?;
        }
        if !tasks.is_empty() {
            info!(deploy = %marker, count = tasks.len(), ?cleanup_type, "cleaning up tasks");
        }
        Ok(())
    }

    fn enqueue(
        &self,
        request: &Request,
        deploy_id: &str,
        pending: &PendingDeploy,
        result: &DeployResult,
        pending_type: PendingType,
        skip_healthchecks: Option<bool>,
    ) -> RolloutResult<()> {
        let marker = &pending.deploy_marker;
        let mut pending_request = PendingRequest::new(
            &request.id,
            deploy_id,
            result.timestamp,
            marker.user.clone(),
            pending_type,
        );
        pending_request.skip_healthchecks = skip_healthchecks;
        pending_request.message = marker.message.clone();
        self.store.add_to_pending_queue(&pending_request)?;
        Ok(())
    }

    fn enqueue_run_now(
        &self,
        request: &Request,
        deploy: &Deploy,
        run_now: &RunNowRequest,
        pending: &PendingDeploy,
        result: &DeployResult,
    ) -> RolloutResult<()> {
        let active = self.store.list_active_tasks_for_request(&deploy.request_id)?.len();
        let queued = self
            .store
            .list_pending_task_ids_for_request(&deploy.request_id)?
            .len();
        let Some(pending_type) = run_now_pending_type(request, active, queued) else {
            warn!(request_id = %request.id, deploy_id = %deploy.id, active, queued, "no pending type for run-immediately deploy, instance cap reached");
            return Ok(());
        };

        let mut pending_request = PendingRequest::new(
            &deploy.request_id,
            &deploy.id,
            result.timestamp,
            pending.deploy_marker.user.clone(),
            canceled_or(result.deploy_state, pending_type),
        );
        pending_request.skip_healthchecks = run_now.skip_healthchecks;
        pending_request.message = run_now
            .message
            .clone()
            .or_else(|| pending.deploy_marker.message.clone());
        pending_request.run_id = run_now.run_id.clone();
        pending_request.command_line_args = run_now.command_line_args.clone();
        pending_request.resources = run_now.resources;
        self.store.add_to_pending_queue(&pending_request)?;
        Ok(())
    }

    /// Everything that follows a terminal result. The pending-deploy record
    /// is deleted last.
    pub fn finish_deploy(
        &self,
        request_with_state: &RequestWithState,
        deploy: Option<&Deploy>,
        pending: &PendingDeploy,
        tasks_to_kill: &[TaskId],
        result: &DeployResult,
    ) -> RolloutResult<()> {
        let request = &request_with_state.request;
        let marker = &pending.deploy_marker;
        let succeeded = result.deploy_state == DeployState::Succeeded;

        if !request.is_one_off() && request.request_type != RequestType::RunOnce {
            self.cleanup_tasks(pending, request, deploy, result, tasks_to_kill)?;
        }

        if let Some(deploy) = deploy
            && let Some(run_now) = &deploy.run_immediately
        {
            self.enqueue_run_now(request, deploy, run_now, pending, result)?;
        } else if !request.is_deployable() && !request.is_one_off() {
            let pending_type = canceled_or(result.deploy_state, PendingType::NewDeploy);
            let skip = deploy.and_then(|d| d.skip_healthchecks_on_deploy);
            self.enqueue(request, &marker.deploy_id, pending, result, pending_type, skip)?;
        }

        let mut updated = request_with_state.clone();
        let mut request_changed = false;

        if succeeded {
            if request.is_deployable() && !request.is_one_off() {
                if updated.bouncing {
                    updated.bouncing = false;
                    request_changed = true;
                }
                self.store.delete_expiring(ExpiringActionType::Bounce, &request.id)?;
            }
            if request_with_state.state == RequestState::Finished {
                info!(request_id = %request.id, "reactivating finished request after deploy");
                updated.state = RequestState::Active;
                request_changed = true;
            }
            self.clear_utilization(&request.id);
        }

        if request.is_deployable()
            && matches!(
                result.deploy_state,
                DeployState::Canceled | DeployState::Failed | DeployState::Overdue
            )
            && !matches!(
                request_with_state.state,
                RequestState::Paused | RequestState::DeployingToUnpause
            )
            && let Some(active) = self
                .store
                .get_request_deploy_state(&request.id)?
                .and_then(|s| s.active_deploy)
        {
            let pending_type = if result.deploy_state == DeployState::Canceled {
                PendingType::DeployCancelled
            } else {
                PendingType::DeployFailed
            };
            self.enqueue(request, &active.deploy_id, pending, result, pending_type, request.skip_healthchecks)?;
        }

        if succeeded {
            let cleaning = self
                .store
                .list_cleanup_task_ids()?
                .into_iter()
                .any(|t| t.request_id == request.id && t.deploy_id == marker.deploy_id);
            if cleaning {
                self.enqueue(
                    request,
                    &marker.deploy_id,
                    pending,
                    result,
                    PendingType::DeployFinished,
                    request.skip_healthchecks,
                )?;
            }

            if request.is_deployable()
                && request_with_state.state != RequestState::Paused
                && let Some(progress) = &pending.deploy_progress
                && progress.target_active_instances != request.instances_safe()
            {
                self.enqueue(
                    request,
                    &marker.deploy_id,
                    pending,
                    result,
                    PendingType::UpdatedRequest,
                    request.skip_healthchecks,
                )?;
            }
        }

        if request_with_state.state == RequestState::DeployingToUnpause {
            if succeeded {
                updated.state = RequestState::Active;
                self.store.delete_expiring(ExpiringActionType::Pause, &request.id)?;
            } else {
                updated.state = RequestState::Paused;
            }
            request_changed = true;
        }

        if succeeded && let Some(new_request) = &pending.updated_request {
            updated.request = new_request.clone();
            request_changed = true;
            self.store.delete_expiring(ExpiringActionType::Scale, &request.id)?;
        }

        if request_changed {
            updated.timestamp = epoch_millis();
            self.store.put_request(&updated)?;
        }

        self.store.put_deploy_result(marker, result)?;
        self.store.delete_pending_deploy(&marker.request_id)?;
        info!(deploy = %marker, state = %result.deploy_state, "deploy finished");
        Ok(())
    }

    /// Drop cached utilization off the deploy path.
    fn clear_utilization(&self, request_id: &str) {
        let store = self.store.clone();
        let request_id = request_id.to_string();
        let clear = move || {
            if let Err(e) = store.delete_request_utilization(&request_id) {
                error!(%request_id, error = %e, "could not clear usage data after new deploy");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(clear);
            }
            Err(_) => clear(),
        }
    }
}
