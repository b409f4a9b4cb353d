//! Deploy progress engine: computes the next outcome of one pending deploy.
//!
//! Evaluation is split in two. [`decide`] is a pure classification of the
//! deploy's situation into a [`Transition`] (first applicable rule wins).
//! [`DeployProgressEngine::evaluate`] then performs that transition: it
//! writes progress to the pending deploy, queues follow-up pending requests,
//! talks to the load balancer, and returns a [`DeployResult`].
//!
//! ```text
//! not deployable by design ─► SUCCEEDED
//! deploy gone + stored result ─► stored result
//! no progress ─► FAILED
//! new inactive tasks ─► retry (WAITING) │ FAILED
//! cancel request ─► CANCELED
//! step complete ─► advance? ─► WAITING
//! CANCELING with LB update ─► poll LB
//! overdue + cancellable LB ─► cancel LB
//! active < target ─► OVERDUE │ WAITING
//! current LB request WAITING ─► poll LB
//! health ─► step finished │ LB enqueue │ FAILED │ WAITING
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use keel_core::{KeelConfig, epoch_millis};
use keel_state::*;
use tracing::{debug, error, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::health::{DeployHealth, DeployHealthChecker};
use crate::lb::{
    LoadBalancerClient, interpret_lb_state, is_waiting_for_current_lb_request, lb_request_id,
    should_cancel_load_balancer, should_check_lb_state,
};
use crate::progress::*;

/// Everything one evaluation looks at, gathered under the request lock.
#[derive(Debug, Clone)]
pub struct DeployContext {
    /// The updated request carried by the pending deploy, or the stored one.
    pub request: Request,
    pub request_state: RequestState,
    pub pending: PendingDeploy,
    pub deploy: Option<Deploy>,
    pub cancel_request: Option<DeployMarker>,
    pub update_request: Option<UpdatePendingDeployRequest>,
    pub deploy_active_tasks: Vec<TaskId>,
    pub other_active_tasks: Vec<TaskId>,
    pub inactive_deploy_tasks: Vec<TaskId>,
    /// Terminal result already stored for this deploy, looked up only when
    /// the deploy itself is missing.
    pub finished_result: Option<DeployResult>,
    pub now: u64,
}

/// The rule that applies to a pending deploy.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The request type has no deploys, or it is paused and paused deploys
    /// are allowed.
    SucceedNotDeployable,
    /// The deploy was finished earlier but its pending record survived.
    RecoverFinished(DeployResult),
    MissingProgress,
    RetryFailedTasks,
    FailTasks,
    Cancel(DeployMarker),
    AdvanceStep,
    PollCancel,
    CancelOverdueLoadBalancer,
    AwaitInstances { overdue: bool },
    PollLoadBalancer,
    CheckHealth { overdue: bool },
}

/// The request state blocks deploys entirely (missing, deleting, or paused
/// while paused deploys are disallowed).
pub fn is_not_in_deployable_state(request: Option<&RequestWithState>, config: &KeelConfig) -> bool {
    match request {
        None => true,
        Some(r) => match r.state {
            RequestState::Deleting | RequestState::Deleted => true,
            RequestState::Paused => !config.deploy.allow_deploy_of_paused_requests,
            _ => false,
        },
    }
}

/// Classify the deploy. Pure: no storage or network access.
pub fn decide(ctx: &DeployContext, config: &KeelConfig) -> Transition {
    if !ctx.request.is_deployable()
        || (config.deploy.allow_deploy_of_paused_requests && ctx.request_state == RequestState::Paused)
    {
        return Transition::SucceedNotDeployable;
    }

    if ctx.deploy.is_none()
        && let Some(result) = &ctx.finished_result
        && result.deploy_state.is_deploy_finished()
    {
        return Transition::RecoverFinished(result.clone());
    }

    let Some(progress) = &ctx.pending.deploy_progress else {
        return Transition::MissingProgress;
    };

    if !new_inactive_deploy_tasks(progress, &ctx.inactive_deploy_tasks).is_empty() {
        return if can_retry_tasks(ctx.deploy.as_ref(), ctx.inactive_deploy_tasks.len()) {
            Transition::RetryFailedTasks
        } else {
            Transition::FailTasks
        };
    }

    if let Some(cancel) = &ctx.cancel_request {
        return Transition::Cancel(cancel.clone());
    }

    if progress.step_complete {
        return Transition::AdvanceStep;
    }

    if should_check_lb_state(&ctx.pending) {
        return Transition::PollCancel;
    }

    let overdue = is_deploy_overdue(&ctx.pending, ctx.deploy.as_ref(), &config.deploy, ctx.now);
    if overdue && ctx.request.is_load_balanced() && should_cancel_load_balancer(&ctx.pending) {
        return Transition::CancelOverdueLoadBalancer;
    }

    if (ctx.deploy_active_tasks.len() as u64) < u64::from(progress.target_active_instances) {
        return Transition::AwaitInstances { overdue };
    }

    if is_waiting_for_current_lb_request(&ctx.pending) {
        return Transition::PollLoadBalancer;
    }

    Transition::CheckHealth { overdue }
}

// ── Engine ─────────────────────────────────────────────────────────

pub struct DeployProgressEngine {
    config: KeelConfig,
    store: StateStore,
    lb: Arc<dyn LoadBalancerClient>,
    health: Arc<dyn DeployHealthChecker>,
}

impl DeployProgressEngine {
    pub fn new(
        config: KeelConfig,
        store: StateStore,
        lb: Arc<dyn LoadBalancerClient>,
        health: Arc<dyn DeployHealthChecker>,
    ) -> Self {
        Self {
            config,
            store,
            lb,
            health,
        }
    }

    /// Evaluate, turning any error into a `FAILED_INTERNAL_STATE` result.
    pub async fn evaluate_safe(&self, ctx: &DeployContext) -> DeployResult {
        match self.evaluate(ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    deploy = %ctx.pending.deploy_marker,
                    error = %e,
                    "uncaught error evaluating deploy"
                );
                DeployResult::new(DeployState::FailedInternalState, epoch_millis())
                    .with_message(format!("Uncaught exception: {e}"))
            }
        }
    }

    pub async fn evaluate(&self, ctx: &DeployContext) -> RolloutResult<DeployResult> {
        let transition = decide(ctx, &self.config);
        debug!(deploy = %ctx.pending.deploy_marker, ?transition, "deploy transition");

        let mut run = Evaluation {
            engine: self,
            ctx,
            pending: ctx.pending.clone(),
        };

        match transition {
            Transition::SucceedNotDeployable => {
                info!(deploy = %ctx.pending.deploy_marker, request_type = ?ctx.request.request_type, "succeeding deploy of non-deployable request");
                Ok(run.result(DeployState::Succeeded).with_message("Request not deployable"))
            }
            Transition::RecoverFinished(result) => {
                info!(deploy = %ctx.pending.deploy_marker, "deploy already finished, cleaning up pending data");
                Ok(result)
            }
            Transition::MissingProgress => Ok(run
                .result(DeployState::Failed)
                .with_message("No deploy progress data present. Please reattempt your deploy")),
            Transition::RetryFailedTasks => run.retry_failed_tasks(),
            Transition::FailTasks => run.fail_tasks().await,
            Transition::Cancel(cancel) => Ok(run.cancel(&cancel)),
            Transition::AdvanceStep => run.advance_step(),
            Transition::PollCancel => {
                let update = self.lb.get_state(&lb_request_id(&run.pending)).await?;
                run.process_lb_state(update).await
            }
            Transition::CancelOverdueLoadBalancer => {
                let failures = run.failures_with_shortfall(&ctx.deploy_active_tasks)?;
                run.cancel_load_balancer(failures).await
            }
            Transition::AwaitInstances { overdue } => {
                run.maybe_update_target(None)?;
                run.check_overdue(overdue)
            }
            Transition::PollLoadBalancer => run.poll_load_balancer().await,
            Transition::CheckHealth { overdue } => run.check_health(overdue).await,
        }
    }

    /// Cancel the pending deploy's in-flight LB request and record the
    /// outcome on the pending deploy.
    pub async fn cancel_load_balancer(
        &self,
        pending: &PendingDeploy,
        failures: Vec<DeployFailure>,
    ) -> RolloutResult<DeployResult> {
        let update = self.lb.cancel(&lb_request_id(pending)).await?;
        let state = interpret_lb_state(&update, DeployState::Canceling);
        let mut record = pending.clone();
        record.last_load_balancer_update = Some(update.clone());
        record.current_deploy_state = state;
        self.store.put_pending_deploy(&record)?;
        Ok(DeployResult::new(state, epoch_millis())
            .with_lb_update(Some(update))
            .with_failures(failures))
    }
}

/// State of one evaluation. `pending` tracks every write made to the
/// pending deploy so later writes build on earlier ones.
struct Evaluation<'a> {
    engine: &'a DeployProgressEngine,
    ctx: &'a DeployContext,
    pending: PendingDeploy,
}

impl Evaluation<'_> {
    fn result(&self, state: DeployState) -> DeployResult {
        DeployResult::new(state, self.ctx.now)
    }

    fn store(&self) -> &StateStore {
        &self.engine.store
    }

    fn progress(&self) -> RolloutResult<DeployProgress> {
        self.pending
            .deploy_progress
            .clone()
            .ok_or_else(|| RolloutError::MissingProgress(self.pending.deploy_marker.to_string()))
    }

    fn save_pending(
        &mut self,
        lb_update: Option<LoadBalancerUpdate>,
        state: DeployState,
        progress: Option<DeployProgress>,
    ) -> RolloutResult<()> {
        self.pending.last_load_balancer_update = lb_update;
        self.pending.current_deploy_state = state;
        self.pending.deploy_progress = progress;
        self.store().put_pending_deploy(&self.pending)?;
        Ok(())
    }

    fn enqueue_next_step(&self) -> RolloutResult<()> {
        let marker = &self.pending.deploy_marker;
        let mut pending_request = PendingRequest::new(
            &self.ctx.request.id,
            &marker.deploy_id,
            epoch_millis(),
            marker.user.clone(),
            PendingType::NextDeployStep,
        );
        pending_request.skip_healthchecks = self
            .ctx
            .deploy
            .as_ref()
            .and_then(|d| d.skip_healthchecks_on_deploy);
        pending_request.message = marker.message.clone();
        self.store().add_to_pending_queue(&pending_request)?;
        Ok(())
    }

    fn failures(&self, tasks: &[TaskId]) -> RolloutResult<Vec<DeployFailure>> {
        self.engine
            .health
            .task_failures(&self.ctx.request, self.ctx.deploy.as_ref(), tasks)
    }

    /// Task failures plus one entry for instances that never launched.
    fn failures_with_shortfall(&self, tasks: &[TaskId]) -> RolloutResult<Vec<DeployFailure>> {
        let mut failures = self.failures(tasks)?;
        let target = self
            .pending
            .deploy_progress
            .as_ref()
            .map_or(0, |p| p.target_active_instances) as usize;
        if tasks.len() < target {
            failures.push(DeployFailure::new(
                DeployFailureReason::TaskCouldNotBeScheduled,
                None,
                Some(format!(
                    "{} of {} tasks could not be scheduled",
                    target - tasks.len(),
                    target
                )),
            ));
        }
        Ok(failures)
    }

    // ── Transitions ────────────────────────────────────────────────

    fn retry_failed_tasks(&mut self) -> RolloutResult<DeployResult> {
        let failed: BTreeSet<TaskId> = self.ctx.inactive_deploy_tasks.iter().cloned().collect();
        info!(
            deploy = %self.pending.deploy_marker,
            failed = failed.len(),
            "retrying failed deploy tasks"
        );
        let progress = self.progress()?.with_failed_tasks(failed);
        let lb = self.pending.last_load_balancer_update.clone();
        self.save_pending(lb, DeployState::Waiting, Some(progress))?;
        self.enqueue_next_step()?;
        Ok(self.result(DeployState::Waiting))
    }

    async fn fail_tasks(&mut self) -> RolloutResult<DeployResult> {
        if self.ctx.request.is_load_balanced() && should_cancel_load_balancer(&self.pending) {
            info!(deploy = %self.pending.deploy_marker, "canceling pending load balancer request, failing deploy regardless");
            if let Err(e) = self.engine.lb.cancel(&lb_request_id(&self.pending)).await {
                warn!(deploy = %self.pending.deploy_marker, error = %e, "load balancer cancel failed");
            }
        }

        let inactive = &self.ctx.inactive_deploy_tasks;
        let over_budget = inactive
            .len()
            .saturating_sub(max_retries(self.ctx.deploy.as_ref()) as usize);
        Ok(self
            .result(DeployState::Failed)
            .with_message(format!("{over_budget} task(s) for this deploy failed"))
            .with_failures(self.failures(inactive)?))
    }

    fn cancel(&self, cancel: &DeployMarker) -> DeployResult {
        info!(deploy = %self.pending.deploy_marker, user = ?cancel.user, "canceling deploy on request");
        let by = cancel
            .user
            .as_ref()
            .map(|u| format!(" by {u}"))
            .unwrap_or_default();
        DeployResult::new(DeployState::Canceled, epoch_millis())
            .with_message(format!("Canceled due to request{by} at {}", cancel.timestamp))
            .with_lb_update(self.pending.last_load_balancer_update.clone())
    }

    fn advance_step(&mut self) -> RolloutResult<DeployResult> {
        let progress = self.progress()?;
        if can_move_to_next_step(&progress, self.ctx.now) || self.ctx.update_request.is_some() {
            let target = new_target_instances(&progress, &self.ctx.request, self.ctx.update_request.as_ref());
            info!(
                deploy = %self.pending.deploy_marker,
                from = progress.target_active_instances,
                to = target,
                "advancing to next deploy step"
            );
            let lb = self.pending.last_load_balancer_update.clone();
            let next = progress.with_new_target_instances(target, self.ctx.now);
            self.save_pending(lb, DeployState::Waiting, Some(next))?;
            self.enqueue_next_step()?;
        }
        Ok(self.result(DeployState::Waiting))
    }

    async fn cancel_load_balancer(&mut self, failures: Vec<DeployFailure>) -> RolloutResult<DeployResult> {
        let result = self.engine.cancel_load_balancer(&self.pending, failures).await?;
        self.pending.last_load_balancer_update = result.lb_update.clone();
        self.pending.current_deploy_state = result.deploy_state;
        Ok(result)
    }

    /// Apply an operator target update, if one is pending.
    fn maybe_update_target(&mut self, lb_update: Option<LoadBalancerUpdate>) -> RolloutResult<()> {
        let (Some(update), Some(progress)) = (&self.ctx.update_request, self.pending.deploy_progress.clone()) else {
            return Ok(());
        };
        let target = update
            .target_active_instances
            .min(self.ctx.request.instances_safe());
        info!(deploy = %self.pending.deploy_marker, target, "applying target update");
        let lb = lb_update.or_else(|| self.pending.last_load_balancer_update.clone());
        let next = progress.with_new_target_instances(target, self.ctx.now);
        self.save_pending(lb, DeployState::Waiting, Some(next))?;
        self.enqueue_next_step()
    }

    fn check_overdue(&self, overdue: bool) -> RolloutResult<DeployResult> {
        if !overdue {
            return Ok(self.result(DeployState::Waiting));
        }
        let Some(deploy) = &self.ctx.deploy else {
            return Ok(self.result(DeployState::Overdue));
        };
        let tasks = &self.ctx.deploy_active_tasks;
        let message = format!(
            "Deploy was able to launch {} tasks, but not all of them became healthy within {}",
            tasks.len(),
            format_millis(allowed_millis(deploy, &self.engine.config.deploy))
        );
        Ok(self
            .result(DeployState::Overdue)
            .with_message(message)
            .with_failures(self.failures_with_shortfall(tasks)?))
    }

    async fn poll_load_balancer(&mut self) -> RolloutResult<DeployResult> {
        let update = self.engine.lb.get_state(&lb_request_id(&self.pending)).await?;
        if update.state.is_in_progress() {
            let state = self.pending.current_deploy_state;
            let progress = self.pending.deploy_progress.clone();
            self.save_pending(Some(update.clone()), state, progress)?;
            return Ok(self
                .result(DeployState::Waiting)
                .with_message("Waiting on load balancer API")
                .with_lb_update(Some(update)));
        }
        self.process_lb_state(update).await
    }

    async fn check_health(&mut self, overdue: bool) -> RolloutResult<DeployResult> {
        let ctx = self.ctx;
        let health = self
            .engine
            .health
            .deploy_health(&ctx.request, ctx.deploy.as_ref(), &ctx.deploy_active_tasks)?;
        debug!(deploy = %self.pending.deploy_marker, ?health, "deploy health");

        match health {
            DeployHealth::Waiting => {
                self.maybe_update_target(None)?;
                self.check_overdue(overdue)
            }
            DeployHealth::Healthy if !ctx.request.is_load_balanced() => self.mark_step_finished(),
            DeployHealth::Healthy => {
                let progress = self.progress()?;
                if let Some(update) = &ctx.update_request
                    && update.target_active_instances != progress.target_active_instances
                {
                    self.maybe_update_target(None)?;
                    return Ok(self.result(DeployState::Waiting));
                }
                if self.engine.config.load_balancer.uri.is_none() {
                    warn!(deploy = %self.pending.deploy_marker, "deploy requires a load balancer URI but none is configured");
                    return Ok(self
                        .result(DeployState::Failed)
                        .with_message("No valid load balancer URI was present"));
                }
                self.finish_healthchecks()?;
                self.enqueue_and_process_lb_request().await
            }
            DeployHealth::Unhealthy => {
                self.finish_healthchecks()?;
                Ok(self
                    .result(DeployState::Failed)
                    .with_message("Not all tasks for deploy were healthy")
                    .with_failures(self.failures(&ctx.deploy_active_tasks)?))
            }
        }
    }

    fn finish_healthchecks(&self) -> RolloutResult<()> {
        for task_id in &self.ctx.deploy_active_tasks {
            match self.store().mark_healthchecks_finished(task_id) {
                Ok(()) => {}
                Err(StateError::NotFound { .. }) => {
                    debug!(%task_id, "task record gone, skipping health-check bookkeeping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn mark_step_finished(&mut self) -> RolloutResult<DeployResult> {
        let ctx = self.ctx;
        let progress = self.progress()?;

        if let Some(update) = &ctx.update_request
            && new_target_instances(&progress, &ctx.request, Some(update)) != progress.target_active_instances
        {
            self.maybe_update_target(None)?;
            return Ok(self.result(DeployState::Waiting));
        }

        let next = progress
            .with_new_active_instances(ctx.deploy_active_tasks.len() as u32)
            .with_completed_step(ctx.now);
        let state = if next.step_complete && next.target_active_instances >= ctx.request.instances_safe() {
            DeployState::Succeeded
        } else {
            DeployState::Waiting
        };
        let message = if state == DeployState::Succeeded {
            "New deploy succeeded"
        } else {
            "New deploy is progressing, this task is being replaced"
        };
        info!(
            deploy = %self.pending.deploy_marker,
            target = next.target_active_instances,
            active = next.current_active_instances,
            %state,
            "deploy step finished"
        );

        let lb = self.pending.last_load_balancer_update.clone();
        self.save_pending(lb, state, Some(next))?;

        for task_id in tasks_to_shut_down(&progress, &ctx.other_active_tasks, &ctx.request) {
            self.store().create_task_cleanup(&TaskCleanup {
                user: None,
                cleanup_type: TaskCleanupType::DeployStepFinished,
                timestamp: epoch_millis(),
                task_id,
                message: Some(message.to_string()),
            })?;
        }
        Ok(self.result(state))
    }

    async fn enqueue_and_process_lb_request(&mut self) -> RolloutResult<DeployResult> {
        let ctx = self.ctx;
        let progress = self.progress()?;
        let Some(deploy) = &ctx.deploy else {
            return Err(RolloutError::DeployNotFound {
                request_id: ctx.request.id.clone(),
                deploy_id: self.pending.deploy_marker.deploy_id.clone(),
            });
        };
        let to_shut_down = tasks_to_shut_down(&progress, &ctx.other_active_tasks, &ctx.request);
        let lb_id = lb_request_id(&self.pending);

        // Only tasks that are (or are becoming) registered need removing.
        let mut to_remove = Vec::new();
        for task_id in &to_shut_down {
            let registered = self
                .store()
                .get_load_balancer_state(task_id, LoadBalancerRequestType::Add)?
                .is_some_and(|u| u.state == LoadBalancerState::Success || u.state.is_in_progress());
            if registered {
                to_remove.push(task_id.clone());
            }
        }

        let marker = LoadBalancerUpdate::pre_enqueue(lb_id.clone(), epoch_millis());
        self.save_lb_state(&ctx.deploy_active_tasks, LoadBalancerRequestType::Add, &marker)?;
        self.save_lb_state(&to_remove, LoadBalancerRequestType::Remove, &marker)?;

        let add_tasks = self.load_tasks(&ctx.deploy_active_tasks)?;
        let remove_tasks = self.load_tasks(&to_shut_down)?;
        info!(
            deploy = %self.pending.deploy_marker,
            lb_request_id = %lb_id.id,
            add = add_tasks.len(),
            remove = remove_tasks.len(),
            "enqueueing load balancer request"
        );
        let update = self
            .engine
            .lb
            .enqueue(&lb_id, &ctx.request, deploy, &add_tasks, &remove_tasks)
            .await?;
        self.process_lb_state(update).await
    }

    fn load_tasks(&self, ids: &[TaskId]) -> RolloutResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.store().get_task(id)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    fn save_lb_state(
        &self,
        tasks: &[TaskId],
        request_type: LoadBalancerRequestType,
        update: &LoadBalancerUpdate,
    ) -> RolloutResult<()> {
        for task_id in tasks {
            self.store().save_load_balancer_state(task_id, request_type, update)?;
        }
        Ok(())
    }

    async fn process_lb_state(&mut self, update: LoadBalancerUpdate) -> RolloutResult<DeployResult> {
        let ctx = self.ctx;
        let progress = self.progress()?;
        let to_shut_down = tasks_to_shut_down(&progress, &ctx.other_active_tasks, &ctx.request);

        let mut to_remove = Vec::new();
        for task_id in &to_shut_down {
            let same_request = self
                .store()
                .get_load_balancer_state(task_id, LoadBalancerRequestType::Remove)?
                .is_some_and(|u| u.load_balancer_request_id.id == update.load_balancer_request_id.id);
            if same_request {
                to_remove.push(task_id.clone());
            }
        }
        self.save_lb_state(&ctx.deploy_active_tasks, LoadBalancerRequestType::Add, &update)?;
        self.save_lb_state(&to_remove, LoadBalancerRequestType::Remove, &update)?;

        let state = interpret_lb_state(&update, self.pending.current_deploy_state);
        debug!(
            deploy = %self.pending.deploy_marker,
            lb_state = ?update.state,
            %state,
            "load balancer state processed"
        );
        match state {
            DeployState::Succeeded => {
                // The step is registered; mark_step_finished decides the outcome.
                self.save_pending(Some(update), DeployState::Waiting, Some(progress))?;
                self.mark_step_finished()
            }
            DeployState::Waiting => {
                self.save_pending(Some(update.clone()), state, Some(progress))?;
                self.maybe_update_target(Some(update.clone()))?;
                Ok(self.result(DeployState::Waiting).with_lb_update(Some(update)))
            }
            _ => {
                self.save_pending(Some(update.clone()), state, Some(progress))?;
                self.maybe_update_target(Some(update.clone()))?;
                Ok(self
                    .result(state)
                    .with_lb_update(Some(update))
                    .with_failures(DeployFailure::lb_update_failed()))
            }
        }
    }
}
