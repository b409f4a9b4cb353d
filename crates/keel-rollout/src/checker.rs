//! Deploy checker: periodic evaluation of every pending deploy.
//!
//! Each check loads all pending deploys, cancel requests and
//! update-pending-deploy requests in one batch, evaluates every pending
//! deploy under its request's lock on a bounded worker pool, then deletes the
//! cancel and update requests it consumed.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{KeelConfig, RequestLock, epoch_millis, run_with_request_lock};
use keel_state::{
    DeployFailure, DeployMarker, DeployResult, PendingDeploy, StateStore, TaskId,
    UpdatePendingDeployRequest,
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::{DeployContext, DeployProgressEngine, is_not_in_deployable_state};
use crate::error::{RolloutError, RolloutResult};
use crate::finalizer::DeployFinalizer;
use crate::health::DeployHealthChecker;
use crate::lb::{LoadBalancerClient, should_cancel_load_balancer};

/// Name under which the checker takes request locks.
pub const LOCK_NAME: &str = "deploy-checker";

#[derive(Clone)]
pub struct DeployChecker {
    config: KeelConfig,
    store: StateStore,
    lock: Arc<dyn RequestLock>,
    engine: Arc<DeployProgressEngine>,
    finalizer: DeployFinalizer,
}

impl DeployChecker {
    pub fn new(
        config: KeelConfig,
        store: StateStore,
        lock: Arc<dyn RequestLock>,
        lb: Arc<dyn LoadBalancerClient>,
        health: Arc<dyn DeployHealthChecker>,
    ) -> Self {
        let engine = DeployProgressEngine::new(config.clone(), store.clone(), lb, health);
        Self {
            finalizer: DeployFinalizer::new(store.clone()),
            engine: Arc::new(engine),
            config,
            store,
            lock,
        }
    }

    /// Evaluate every pending deploy once. Returns how many were evaluated.
    pub async fn check_deploys(&self) -> RolloutResult<usize> {
        let pending = self.store.list_pending_deploys()?;
        let cancels = self.store.list_cancel_deploys()?;
        let updates = self.store.list_update_pending_deploys()?;

        if pending.is_empty() && cancels.is_empty() {
            return Ok(0);
        }

        let count = pending.len();
        let started = epoch_millis();
        let cancels = Arc::new(cancels);
        let updates = Arc::new(updates);
        let permits = Arc::new(Semaphore::new(self.config.deploy.check_worker_pool_size.max(1)));
        let mut workers = JoinSet::new();

        for pending in pending {
            let checker = self.clone();
            let cancels = cancels.clone();
            let updates = updates.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| RolloutError::Join(e.to_string()))?;
                let marker = pending.deploy_marker.clone();
                let request_id = marker.request_id.clone();
                run_with_request_lock(&checker.lock, &request_id, LOCK_NAME, || {
                    checker.check_deploy(pending, &cancels, &updates)
                })
                .await?
                .map(|result| (marker, result))
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok((marker, result))) => {
                    debug!(deploy = %marker, state = %result.deploy_state, "deploy checked");
                }
                Ok(Err(e)) => error!(error = %e, "deploy check failed"),
                Err(e) => error!(error = %e, "deploy check task panicked"),
            }
        }

        for cancel in cancels.iter() {
            self.store.delete_cancel_deploy(cancel)?;
        }
        for update in updates.iter() {
            self.store.delete_update_pending_deploy(update)?;
        }

        info!(
            deploys = count,
            cancels = cancels.len(),
            updates = updates.len(),
            elapsed_ms = epoch_millis().saturating_sub(started),
            "checked pending deploys"
        );
        Ok(count)
    }

    /// Evaluate and, when terminal, finalize one pending deploy. The caller
    /// holds the request lock.
    pub async fn check_deploy(
        &self,
        pending: PendingDeploy,
        cancels: &[DeployMarker],
        updates: &[UpdatePendingDeployRequest],
    ) -> RolloutResult<DeployResult> {
        let marker = pending.deploy_marker.clone();
        let deploy = self.store.get_deploy(&marker.request_id, &marker.deploy_id)?;
        let stored = self.store.get_request(&marker.request_id)?;

        let request_with_state = match stored {
            Some(r) if !is_not_in_deployable_state(Some(&r), &self.config) => r,
            other => {
                let state = other.as_ref().map_or("DELETED", |r| r.state.as_str());
                warn!(deploy = %marker, request_state = state, "request not deployable, removing deploy");
                if should_cancel_load_balancer(&pending)
                    && let Err(e) = self
                        .engine
                        .cancel_load_balancer(&pending, DeployFailure::deploy_removed())
                        .await
                {
                    error!(deploy = %marker, error = %e, "load balancer cancel failed");
                }
                return self
                    .finalizer
                    .fail_due_to_state(&pending, other.as_ref(), deploy.as_ref());
            }
        };

        let cancel_request = cancels.iter().find(|c| c.matches(&marker)).cloned();
        let update_request = updates
            .iter()
            .find(|u| u.request_id == marker.request_id && u.deploy_id == marker.deploy_id)
            .cloned();
        let request = pending
            .updated_request
            .clone()
            .unwrap_or_else(|| request_with_state.request.clone());

        let mut deploy_active_tasks: Vec<TaskId> = Vec::new();
        let mut other_active_tasks: Vec<TaskId> = Vec::new();
        let mut inactive_deploy_tasks: Vec<TaskId> = Vec::new();
        for task in self.store.list_tasks_for_request(&request.id)? {
            let same_deploy = task.task_id.deploy_id == marker.deploy_id;
            match (task.is_active(), same_deploy) {
                (true, true) => deploy_active_tasks.push(task.task_id),
                (true, false) => other_active_tasks.push(task.task_id),
                (false, true) => inactive_deploy_tasks.push(task.task_id),
                (false, false) => {}
            }
        }

        let finished_result = match deploy {
            None => self.store.get_deploy_result(&marker.request_id, &marker.deploy_id)?,
            Some(_) => None,
        };

        let ctx = DeployContext {
            request: request.clone(),
            request_state: request_with_state.state,
            pending: pending.clone(),
            deploy: deploy.clone(),
            cancel_request,
            update_request,
            deploy_active_tasks: deploy_active_tasks.clone(),
            other_active_tasks: other_active_tasks.clone(),
            inactive_deploy_tasks,
            finished_result,
            now: epoch_millis(),
        };
        let result = self.engine.evaluate_safe(&ctx).await;

        info!(
            deploy = %marker,
            state = %result.deploy_state,
            message = result.message.as_deref().unwrap_or(""),
            elapsed_ms = ctx.now.saturating_sub(marker.timestamp),
            "deploy evaluated"
        );

        self.finalizer.finalize(
            &request_with_state,
            &request,
            deploy.as_ref(),
            &pending,
            &deploy_active_tasks,
            &other_active_tasks,
            result,
        )
    }

    /// Check deploys every `interval` until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "deploy checker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.check_deploys().await {
                        error!(error = %e, "deploy check failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("deploy checker shutting down");
                    break;
                }
            }
        }
    }
}
