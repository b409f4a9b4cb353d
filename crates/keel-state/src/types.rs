//! Domain types for requests, tasks, and pending work.
//!
//! All types are serializable to/from JSON for storage in redb tables.
//! Timestamps are epoch milliseconds.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

pub use keel_core::Resources;

/// Unique identifier for a request.
pub type RequestId = String;

/// Unique identifier for a deploy within a request.
pub type DeployId = String;

// ── Request ────────────────────────────────────────────────────────

/// Kind of workload a request declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Service,
    Worker,
    Scheduled,
    OnDemand,
    RunOnce,
}

impl RequestType {
    /// Long-running types that go through staged rollouts.
    pub fn is_deployable(self) -> bool {
        matches!(self, RequestType::Service | RequestType::Worker)
    }

    pub fn is_long_running(self) -> bool {
        self.is_deployable()
    }

    pub fn is_one_off(self) -> bool {
        matches!(self, RequestType::OnDemand)
    }
}

/// A user-declared service or job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub request_type: RequestType,
    pub instances: Option<u32>,
    pub load_balanced: bool,
    pub skip_healthchecks: Option<bool>,
    /// Relative scheduling priority in (0, 1].
    pub task_priority_level: Option<f64>,
}

impl Request {
    pub fn new(id: &str, request_type: RequestType) -> Self {
        Self {
            id: id.to_string(),
            request_type,
            instances: None,
            load_balanced: false,
            skip_healthchecks: None,
            task_priority_level: None,
        }
    }

    pub fn instances_safe(&self) -> u32 {
        self.instances.unwrap_or(1)
    }

    pub fn is_deployable(&self) -> bool {
        self.request_type.is_deployable()
    }

    pub fn is_one_off(&self) -> bool {
        self.request_type.is_one_off()
    }

    pub fn is_load_balanced(&self) -> bool {
        self.load_balanced && self.is_deployable()
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Active,
    Paused,
    DeployingToUnpause,
    Finished,
    SystemCooldown,
    Deleting,
    Deleted,
}

impl RequestState {
    /// States in which a request accepts deploys and runs tasks.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RequestState::Active
                | RequestState::DeployingToUnpause
                | RequestState::Finished
                | RequestState::SystemCooldown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Active => "ACTIVE",
            RequestState::Paused => "PAUSED",
            RequestState::DeployingToUnpause => "DEPLOYING_TO_UNPAUSE",
            RequestState::Finished => "FINISHED",
            RequestState::SystemCooldown => "SYSTEM_COOLDOWN",
            RequestState::Deleting => "DELETING",
            RequestState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request plus its lifecycle state, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestWithState {
    pub request: Request,
    pub state: RequestState,
    /// Set while a bounce is replacing every task of the request.
    pub bouncing: bool,
    pub timestamp: u64,
}

impl RequestWithState {
    pub fn new(request: Request, state: RequestState, timestamp: u64) -> Self {
        Self {
            request,
            state,
            bouncing: false,
            timestamp,
        }
    }
}

// ── Pending work ───────────────────────────────────────────────────

/// Why a pending request or pending task exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingType {
    Immediate,
    Oneoff,
    Bounce,
    NewDeploy,
    NextDeployStep,
    Unpaused,
    Retry,
    UpdatedRequest,
    TaskDone,
    Startup,
    DeployCancelled,
    DeployFailed,
    DeployFinished,
}

impl PendingType {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingType::Immediate => "IMMEDIATE",
            PendingType::Oneoff => "ONEOFF",
            PendingType::Bounce => "BOUNCE",
            PendingType::NewDeploy => "NEW_DEPLOY",
            PendingType::NextDeployStep => "NEXT_DEPLOY_STEP",
            PendingType::Unpaused => "UNPAUSED",
            PendingType::Retry => "RETRY",
            PendingType::UpdatedRequest => "UPDATED_REQUEST",
            PendingType::TaskDone => "TASK_DONE",
            PendingType::Startup => "STARTUP",
            PendingType::DeployCancelled => "DEPLOY_CANCELLED",
            PendingType::DeployFailed => "DEPLOY_FAILED",
            PendingType::DeployFinished => "DEPLOY_FINISHED",
        }
    }
}

impl fmt::Display for PendingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of an explicit "run now" action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunNowRequest {
    pub run_id: Option<String>,
    pub command_line_args: Option<Vec<String>>,
    pub message: Option<String>,
    pub skip_healthchecks: Option<bool>,
    pub resources: Option<Resources>,
}

/// An entry in the pending-request queue: "schedule more work for this
/// request". Produced by deploy reconciliation, consumed externally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub deploy_id: DeployId,
    pub timestamp: u64,
    pub user: Option<String>,
    pub pending_type: PendingType,
    pub skip_healthchecks: Option<bool>,
    pub message: Option<String>,
    pub run_id: Option<String>,
    pub command_line_args: Option<Vec<String>>,
    pub resources: Option<Resources>,
}

impl PendingRequest {
    pub fn new(
        request_id: &str,
        deploy_id: &str,
        timestamp: u64,
        user: Option<String>,
        pending_type: PendingType,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            deploy_id: deploy_id.to_string(),
            timestamp,
            user,
            pending_type,
            skip_healthchecks: None,
            message: None,
            run_id: None,
            command_line_args: None,
            resources: None,
        }
    }

    /// Composite key. Immediate and one-off entries keep one record per
    /// submission; every other type collapses to one entry per deploy.
    pub fn table_key(&self) -> String {
        match self.pending_type {
            PendingType::Immediate | PendingType::Oneoff => format!(
                "{}:{}:{}",
                self.request_id, self.deploy_id, self.timestamp
            ),
            _ => format!("{}:{}", self.request_id, self.deploy_id),
        }
    }
}

/// Identity and ordering key of a not-yet-placed unit of work.
///
/// The natural ordering serves the earliest scheduled run time first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingTaskId {
    pub request_id: RequestId,
    pub deploy_id: DeployId,
    pub next_run_at: u64,
    pub instance_no: u32,
    pub pending_type: PendingType,
    pub created_at: u64,
}

impl PendingTaskId {
    pub fn new(
        request_id: &str,
        deploy_id: &str,
        next_run_at: u64,
        instance_no: u32,
        pending_type: PendingType,
        created_at: u64,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            deploy_id: deploy_id.to_string(),
            next_run_at,
            instance_no,
            pending_type,
            created_at,
        }
    }

    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}",
            self.request_id,
            self.deploy_id,
            self.next_run_at,
            self.instance_no,
            self.pending_type,
            self.created_at
        )
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.request_id, self.id())
    }
}

impl Ord for PendingTaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_run_at
            .cmp(&other.next_run_at)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.request_id.cmp(&other.request_id))
            .then_with(|| self.deploy_id.cmp(&other.deploy_id))
            .then_with(|| self.instance_no.cmp(&other.instance_no))
            .then_with(|| self.pending_type.cmp(&other.pending_type))
    }
}

impl PartialOrd for PendingTaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PendingTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Launch details backing a [`PendingTaskId`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingTask {
    pub pending_task_id: PendingTaskId,
    /// Overrides the deploy's resources for this one task.
    pub resources: Option<Resources>,
    pub run_id: Option<String>,
    pub command_line_args: Option<Vec<String>>,
    pub user: Option<String>,
    pub message: Option<String>,
    pub skip_healthchecks: Option<bool>,
}

impl PendingTask {
    pub fn new(pending_task_id: PendingTaskId) -> Self {
        Self {
            pending_task_id,
            resources: None,
            run_id: None,
            command_line_args: None,
            user: None,
            message: None,
            skip_healthchecks: None,
        }
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Identity of a placed task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub request_id: RequestId,
    pub deploy_id: DeployId,
    pub started_at: u64,
    pub instance_no: u32,
    pub host: String,
    pub agent_id: String,
}

impl TaskId {
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.request_id, self.deploy_id, self.started_at, self.instance_no, self.host
        )
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.request_id, self.id())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Lifecycle state of a placed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Launched,
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskState::Launched | TaskState::Staging | TaskState::Starting | TaskState::Running
        )
    }

    /// Terminal states that count as a failure rather than a clean exit.
    pub fn is_failed(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Lost)
    }
}

/// Health as reported by the task's health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// A concrete, placed unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub pending_task_id: PendingTaskId,
    pub state: TaskState,
    pub health: TaskHealth,
    /// Set once a deploy stops waiting on this task's health checks.
    pub healthchecks_finished: bool,
    /// Startup health-check attempts recorded so far.
    pub startup_healthchecks: u32,
    pub resources: Resources,
    pub executor_resources: Resources,
    pub offer_ids: Vec<String>,
    pub run_id: Option<String>,
    pub command_line_args: Option<Vec<String>>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// Why a task is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCleanupType {
    NewDeploySucceeded,
    DeployFailed,
    DeployCanceled,
    DeployOverdue,
    DeployStepFinished,
    IncrementalDeployFailed,
    IncrementalDeployCancelled,
    Bouncing,
    Decommissioning,
}

/// A request to terminate a task; consumed outside the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCleanup {
    pub user: Option<String>,
    pub cleanup_type: TaskCleanupType,
    pub timestamp: u64,
    pub task_id: TaskId,
    pub message: Option<String>,
}

// ── Usage ──────────────────────────────────────────────────────────

/// Point-in-time resource usage of one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentUsage {
    pub agent_id: String,
    pub timestamp: u64,
    pub num_tasks: u32,
    pub cpus_used: f64,
    pub cpus_reserved: f64,
    pub cpus_total: Option<f64>,
    pub memory_mb_used: f64,
    pub memory_mb_reserved: f64,
    pub memory_mb_total: Option<f64>,
    pub disk_mb_used: f64,
    pub disk_mb_reserved: f64,
    pub disk_mb_total: Option<f64>,
    pub system_cpus_total: f64,
    pub system_load_1min: f64,
    pub system_load_5min: f64,
    pub system_load_15min: f64,
    pub system_memory_total_bytes: u64,
    pub system_memory_free_bytes: u64,
}

/// Rolling usage statistics for a request, invalidated by new deploys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestUtilization {
    pub request_id: RequestId,
    pub deploy_id: DeployId,
    pub avg_cpus_used: f64,
    pub avg_memory_mb_used: f64,
    pub timestamp: u64,
}

// ── Expiring actions ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiringActionType {
    Pause,
    Scale,
    Bounce,
}

impl ExpiringActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpiringActionType::Pause => "pause",
            ExpiringActionType::Scale => "scale",
            ExpiringActionType::Bounce => "bounce",
        }
    }
}

/// A time-boxed pause, scale, or bounce attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpiringAction {
    pub action_type: ExpiringActionType,
    pub request_id: RequestId,
    pub user: Option<String>,
    pub start_millis: u64,
    pub expire_after_millis: u64,
}

impl ExpiringAction {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.action_type.as_str(), self.request_id)
    }
}
