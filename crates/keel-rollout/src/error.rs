//! Rollout error types.

use thiserror::Error;

/// Errors raised while evaluating or finalizing a deploy.
///
/// None of these cross the subsystem boundary: evaluation failures become a
/// `FAILED_INTERNAL_STATE` result and finalization failures are logged by the
/// deploy checker.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("deploy {request_id}/{deploy_id} not found")]
    DeployNotFound { request_id: String, deploy_id: String },

    #[error("pending deploy {0} has no progress")]
    MissingProgress(String),

    #[error("load balancer error: {0}")]
    LoadBalancer(String),

    #[error("deploy check task failed: {0}")]
    Join(String),

    #[error("state store error: {0}")]
    State(#[from] keel_state::StateError),

    #[error("lock error: {0}")]
    Lock(#[from] keel_core::LockError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
