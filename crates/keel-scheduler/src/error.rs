//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during admission and matching.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("deploy not found: {request_id}/{deploy_id}")]
    DeployNotFound { request_id: String, deploy_id: String },

    #[error("not the leader, refusing to start")]
    NotLeader,

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("state store error: {0}")]
    State(#[from] keel_state::StateError),

    #[error("lock error: {0}")]
    Lock(#[from] keel_core::LockError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
