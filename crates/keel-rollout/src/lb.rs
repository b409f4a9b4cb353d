//! Load-balancer contract and state interpretation.
//!
//! Every canary step of a load-balanced deploy registers its tasks through
//! one LB request, identified by `{request}-{deploy}-{target}`. The engine
//! polls that request until it leaves the in-progress states.

use async_trait::async_trait;
use keel_core::epoch_millis;
use keel_state::{
    Deploy, DeployState, LoadBalancerRequestId, LoadBalancerRequestType, LoadBalancerState,
    LoadBalancerUpdate, PendingDeploy, Request, Task,
};
use tracing::warn;

use crate::error::RolloutResult;

/// Client of the load-balancer API.
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// Register `add` and deregister `remove` for one deploy step.
    async fn enqueue(
        &self,
        lb_request_id: &LoadBalancerRequestId,
        request: &Request,
        deploy: &Deploy,
        add: &[Task],
        remove: &[Task],
    ) -> RolloutResult<LoadBalancerUpdate>;

    async fn get_state(&self, lb_request_id: &LoadBalancerRequestId) -> RolloutResult<LoadBalancerUpdate>;

    async fn cancel(&self, lb_request_id: &LoadBalancerRequestId) -> RolloutResult<LoadBalancerUpdate>;
}

/// Client used when no load-balancer URI is configured. Every call reports
/// a failed request.
#[derive(Debug, Default)]
pub struct DisabledLoadBalancer;

impl DisabledLoadBalancer {
    fn failed(lb_request_id: &LoadBalancerRequestId) -> LoadBalancerUpdate {
        warn!(lb_request_id = %lb_request_id.id, "load balancer call without a configured load balancer");
        LoadBalancerUpdate::new(
            LoadBalancerState::Failed,
            lb_request_id.clone(),
            Some("no load balancer configured".to_string()),
            epoch_millis(),
        )
    }
}

#[async_trait]
impl LoadBalancerClient for DisabledLoadBalancer {
    async fn enqueue(
        &self,
        lb_request_id: &LoadBalancerRequestId,
        _request: &Request,
        _deploy: &Deploy,
        _add: &[Task],
        _remove: &[Task],
    ) -> RolloutResult<LoadBalancerUpdate> {
        Ok(Self::failed(lb_request_id))
    }

    async fn get_state(&self, lb_request_id: &LoadBalancerRequestId) -> RolloutResult<LoadBalancerUpdate> {
        Ok(Self::failed(lb_request_id))
    }

    async fn cancel(&self, lb_request_id: &LoadBalancerRequestId) -> RolloutResult<LoadBalancerUpdate> {
        Ok(Self::failed(lb_request_id))
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// LB request id of the pending deploy's current step.
pub fn lb_request_id(pending: &PendingDeploy) -> LoadBalancerRequestId {
    let marker = &pending.deploy_marker;
    let target = pending
        .deploy_progress
        .as_ref()
        .map_or(0, |p| p.target_active_instances);
    LoadBalancerRequestId::new(
        format!("{}-{}-{}", marker.request_id, marker.deploy_id, target),
        LoadBalancerRequestType::Deploy,
    )
}

/// Deploy state implied by an LB update. `Unknown` keeps `fallback`.
pub fn interpret_lb_state(update: &LoadBalancerUpdate, fallback: DeployState) -> DeployState {
    match update.state {
        LoadBalancerState::Success => DeployState::Succeeded,
        LoadBalancerState::Waiting => DeployState::Waiting,
        LoadBalancerState::Canceling => DeployState::Canceling,
        LoadBalancerState::Canceled => DeployState::Canceled,
        LoadBalancerState::Failed | LoadBalancerState::InvalidRequestNoop => DeployState::Failed,
        LoadBalancerState::Unknown => fallback,
    }
}

/// An LB request is still running and can be canceled.
pub fn should_cancel_load_balancer(pending: &PendingDeploy) -> bool {
    pending
        .last_load_balancer_update
        .as_ref()
        .is_some_and(|u| u.state.is_in_progress())
}

/// A cancel was sent earlier and its outcome is still to be collected.
pub fn should_check_lb_state(pending: &PendingDeploy) -> bool {
    pending.current_deploy_state == DeployState::Canceling && pending.last_load_balancer_update.is_some()
}

/// The current step's LB request was accepted and is still being applied.
pub fn is_waiting_for_current_lb_request(pending: &PendingDeploy) -> bool {
    pending.last_load_balancer_update.as_ref().is_some_and(|u| {
        u.state == LoadBalancerState::Waiting && u.load_balancer_request_id.id == lb_request_id(pending).id
    })
}
