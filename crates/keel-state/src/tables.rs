//! redb table definitions for the Keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Child records are keyed `{request_id}:{child}` so a request's records can be
//! found with a prefix scan.

use redb::TableDefinition;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// `RequestWithState` keyed by `{request_id}`.
pub const REQUESTS: Table = TableDefinition::new("requests");

/// `Deploy` keyed by `{request_id}:{deploy_id}`.
pub const DEPLOYS: Table = TableDefinition::new("deploys");

/// `PendingDeploy` keyed by `{request_id}`.
pub const PENDING_DEPLOYS: Table = TableDefinition::new("pending_deploys");

/// Cancel requests (`DeployMarker`) keyed by `{request_id}:{deploy_id}`.
pub const CANCEL_DEPLOYS: Table = TableDefinition::new("cancel_deploys");

/// `UpdatePendingDeployRequest` keyed by `{request_id}:{deploy_id}`.
pub const UPDATE_PENDING_DEPLOYS: Table = TableDefinition::new("update_pending_deploys");

/// `DeployResult` keyed by `{request_id}:{deploy_id}`.
pub const DEPLOY_RESULTS: Table = TableDefinition::new("deploy_results");

/// `RequestDeployState` keyed by `{request_id}`.
pub const REQUEST_DEPLOY_STATES: Table = TableDefinition::new("request_deploy_states");

/// `PendingRequest` keyed by `PendingRequest::table_key`.
pub const PENDING_REQUESTS: Table = TableDefinition::new("pending_requests");

/// `PendingTask` keyed by `{request_id}:{pending_task_id}`.
pub const PENDING_TASKS: Table = TableDefinition::new("pending_tasks");

/// `Task` keyed by `{request_id}:{task_id}`.
pub const TASKS: Table = TableDefinition::new("tasks");

/// Per-task `LoadBalancerUpdate` keyed by `{task_id}:{add|remove}`.
pub const TASK_LB_UPDATES: Table = TableDefinition::new("task_lb_updates");

/// `TaskCleanup` keyed by `{task_id}`.
pub const TASK_CLEANUPS: Table = TableDefinition::new("task_cleanups");

/// `AgentUsage` keyed by `{agent_id}`.
pub const AGENT_USAGE: Table = TableDefinition::new("agent_usage");

/// `RequestUtilization` keyed by `{request_id}`.
pub const REQUEST_UTILIZATION: Table = TableDefinition::new("request_utilization");

/// `ExpiringAction` keyed by `{pause|scale|bounce}:{request_id}`.
pub const EXPIRING: Table = TableDefinition::new("expiring");

pub const ALL_TABLES: [Table; 15] = [
    REQUESTS,
    DEPLOYS,
    PENDING_DEPLOYS,
    CANCEL_DEPLOYS,
    UPDATE_PENDING_DEPLOYS,
    DEPLOY_RESULTS,
    REQUEST_DEPLOY_STATES,
    PENDING_REQUESTS,
    PENDING_TASKS,
    TASKS,
    TASK_LB_UPDATES,
    TASK_CLEANUPS,
    AGENT_USAGE,
    REQUEST_UTILIZATION,
    EXPIRING,
];
