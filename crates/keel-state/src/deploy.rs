//! Deploy, rollout-progress, and load-balancer types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::*;

// ── Deploy ─────────────────────────────────────────────────────────

/// Immutable, versioned definition of how a request runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deploy {
    pub request_id: RequestId,
    pub id: DeployId,
    pub user: Option<String>,
    pub resources: Option<Resources>,
    /// Tasks run under a custom executor that reserves its own resources.
    pub custom_executor: bool,
    pub deploy_health_timeout_secs: Option<u64>,
    pub skip_healthchecks_on_deploy: Option<bool>,
    pub run_immediately: Option<RunNowRequest>,
    pub deploy_instance_count_per_step: Option<u32>,
    pub auto_advance_deploy_steps: Option<bool>,
    pub deploy_step_wait_time_ms: Option<u64>,
    pub max_task_retries: Option<u32>,
}

impl Deploy {
    pub fn new(request_id: &str, id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            id: id.to_string(),
            user: None,
            resources: None,
            custom_executor: false,
            deploy_health_timeout_secs: None,
            skip_healthchecks_on_deploy: None,
            run_immediately: None,
            deploy_instance_count_per_step: None,
            auto_advance_deploy_steps: None,
            deploy_step_wait_time_ms: None,
            max_task_retries: None,
        }
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.request_id, self.id)
    }
}

/// Identity plus user/timestamp of a deploy action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeployMarker {
    pub request_id: RequestId,
    pub deploy_id: DeployId,
    pub timestamp: u64,
    pub user: Option<String>,
    pub message: Option<String>,
}

impl DeployMarker {
    pub fn new(request_id: &str, deploy_id: &str, timestamp: u64, user: Option<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            deploy_id: deploy_id.to_string(),
            timestamp,
            user,
            message: None,
        }
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.request_id, self.deploy_id)
    }

    /// Same request and deploy, regardless of who or when.
    pub fn matches(&self, other: &DeployMarker) -> bool {
        self.request_id == other.request_id && self.deploy_id == other.deploy_id
    }
}

impl fmt::Display for DeployMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.request_id, self.deploy_id)
    }
}

// ── Progress ───────────────────────────────────────────────────────

/// Canary ramp bookkeeping for one deploy attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployProgress {
    pub target_active_instances: u32,
    pub current_active_instances: u32,
    pub deploy_instance_count_per_step: u32,
    pub deploy_step_wait_time_ms: u64,
    pub step_complete: bool,
    pub auto_advance_deploy_steps: bool,
    pub failed_deploy_tasks: BTreeSet<TaskId>,
    /// When the current step started (or completed).
    pub timestamp: u64,
}

impl DeployProgress {
    pub fn with_new_target_instances(&self, target: u32, now: u64) -> Self {
        Self {
            target_active_instances: target,
            step_complete: false,
            timestamp: now,
            ..self.clone()
        }
    }

    pub fn with_new_active_instances(&self, active: u32) -> Self {
        Self {
            current_active_instances: active,
            ..self.clone()
        }
    }

    pub fn with_completed_step(&self, now: u64) -> Self {
        Self {
            step_complete: true,
            timestamp: now,
            ..self.clone()
        }
    }

    pub fn with_failed_tasks(&self, failed: BTreeSet<TaskId>) -> Self {
        Self {
            failed_deploy_tasks: failed,
            ..self.clone()
        }
    }
}

// ── Pending deploy ─────────────────────────────────────────────────

/// State of a deploy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Waiting,
    Canceling,
    Succeeded,
    Failed,
    FailedInternalState,
    Canceled,
    Overdue,
}

impl DeployState {
    pub fn is_deploy_finished(self) -> bool {
        !matches!(self, DeployState::Waiting | DeployState::Canceling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeployState::Waiting => "WAITING",
            DeployState::Canceling => "CANCELING",
            DeployState::Succeeded => "SUCCEEDED",
            DeployState::Failed => "FAILED",
            DeployState::FailedInternalState => "FAILED_INTERNAL_STATE",
            DeployState::Canceled => "CANCELED",
            DeployState::Overdue => "OVERDUE",
        }
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable in-flight rollout record. At most one per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingDeploy {
    pub deploy_marker: DeployMarker,
    pub last_load_balancer_update: Option<LoadBalancerUpdate>,
    pub current_deploy_state: DeployState,
    pub deploy_progress: Option<DeployProgress>,
    /// Request definition to apply once the deploy succeeds.
    pub updated_request: Option<Request>,
}

impl PendingDeploy {
    pub fn table_key(&self) -> String {
        self.deploy_marker.request_id.clone()
    }
}

/// Active and pending deploy pointers of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestDeployState {
    pub request_id: RequestId,
    pub active_deploy: Option<DeployMarker>,
    pub pending_deploy: Option<DeployMarker>,
}

/// Operator request to change the target instance count of an in-flight deploy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatePendingDeployRequest {
    pub request_id: RequestId,
    pub deploy_id: DeployId,
    pub target_active_instances: u32,
}

impl UpdatePendingDeployRequest {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.request_id, self.deploy_id)
    }
}

// ── Results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployFailureReason {
    TaskFailedOnStartup,
    TaskFailedHealthChecks,
    TaskNeverEnteredRunning,
    TaskCouldNotBeScheduled,
    DeployOverdue,
    FailedToSaveDeployState,
    LoadBalancerUpdateFailed,
    PendingDeployRemoved,
}

/// One failure detail attached to a deploy result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployFailure {
    pub reason: DeployFailureReason,
    pub task_id: Option<TaskId>,
    pub message: Option<String>,
}

impl DeployFailure {
    pub fn new(reason: DeployFailureReason, task_id: Option<TaskId>, message: Option<String>) -> Self {
        Self {
            reason,
            task_id,
            message,
        }
    }

    pub fn lb_update_failed() -> Vec<DeployFailure> {
        vec![Self::new(DeployFailureReason::LoadBalancerUpdateFailed, None, None)]
    }

    pub fn failed_to_save() -> Vec<DeployFailure> {
        vec![Self::new(DeployFailureReason::FailedToSaveDeployState, None, None)]
    }

    pub fn deploy_removed() -> Vec<DeployFailure> {
        vec![Self::new(DeployFailureReason::PendingDeployRemoved, None, None)]
    }
}

/// Outcome of one deploy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployResult {
    pub deploy_state: DeployState,
    pub message: Option<String>,
    pub lb_update: Option<LoadBalancerUpdate>,
    pub deploy_failures: Vec<DeployFailure>,
    pub timestamp: u64,
}

impl DeployResult {
    pub fn new(deploy_state: DeployState, timestamp: u64) -> Self {
        Self {
            deploy_state,
            message: None,
            lb_update: None,
            deploy_failures: Vec::new(),
            timestamp,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_lb_update(mut self, lb_update: Option<LoadBalancerUpdate>) -> Self {
        self.lb_update = lb_update;
        self
    }

    pub fn with_failures(mut self, failures: Vec<DeployFailure>) -> Self {
        self.deploy_failures = failures;
        self
    }
}

// ── Load balancer ──────────────────────────────────────────────────

/// State of a load-balancer request as reported by the LB API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerState {
    Unknown,
    Failed,
    Waiting,
    Success,
    Canceling,
    Canceled,
    InvalidRequestNoop,
}

impl LoadBalancerState {
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            LoadBalancerState::Unknown | LoadBalancerState::Waiting | LoadBalancerState::Canceling
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerRequestType {
    Add,
    Remove,
    Deploy,
    Delete,
}

impl LoadBalancerRequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadBalancerRequestType::Add => "add",
            LoadBalancerRequestType::Remove => "remove",
            LoadBalancerRequestType::Deploy => "deploy",
            LoadBalancerRequestType::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadBalancerRequestId {
    pub id: String,
    pub request_type: LoadBalancerRequestType,
    pub attempt_number: u32,
}

impl LoadBalancerRequestId {
    pub fn new(id: impl Into<String>, request_type: LoadBalancerRequestType) -> Self {
        Self {
            id: id.into(),
            request_type,
            attempt_number: 0,
        }
    }
}

/// Last known state of a load-balancer request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerUpdate {
    pub state: LoadBalancerState,
    pub load_balancer_request_id: LoadBalancerRequestId,
    pub message: Option<String>,
    pub timestamp: u64,
}

impl LoadBalancerUpdate {
    pub fn new(
        state: LoadBalancerState,
        load_balancer_request_id: LoadBalancerRequestId,
        message: Option<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            state,
            load_balancer_request_id,
            message,
            timestamp,
        }
    }

    /// Marker written on tasks right before their LB request is sent.
    pub fn pre_enqueue(load_balancer_request_id: LoadBalancerRequestId, timestamp: u64) -> Self {
        Self::new(
            LoadBalancerState::Unknown,
            load_balancer_request_id,
            Some("pre-enqueue".to_string()),
            timestamp,
        )
    }
}
