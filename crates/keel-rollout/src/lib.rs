//! keel-rollout: staged deploys for Keel.
//!
//! Drives every pending deploy to a terminal outcome: canary steps that grow
//! the new deploy's target, health gating, optional load-balancer
//! registration, retries of failed tasks, cancellation, and overdue
//! detection.
//!
//! # Architecture
//!
//! ```text
//! DeployChecker (periodic, bounded worker pool)
//!   └─ per pending deploy, under the request lock:
//!        DeployContext ─► decide() ─► DeployProgressEngine ─► DeployResult
//!                                          │         │
//!                               LoadBalancerClient  DeployHealthChecker
//!                                                        │
//!                          terminal? ─► DeployFinalizer ─┘
//! ```
//!
//! Evaluation errors never leave the engine: they become a
//! `FAILED_INTERNAL_STATE` result that is finalized like any other.

pub mod checker;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod health;
pub mod lb;
pub mod progress;

pub use checker::{DeployChecker, LOCK_NAME};
pub use engine::{DeployContext, DeployProgressEngine, Transition, decide, is_not_in_deployable_state};
pub use error::{RolloutError, RolloutResult};
pub use finalizer::{DeployFinalizer, canceled_or, cleanup_type, run_now_pending_type};
pub use health::{DeployHealth, DeployHealthChecker, TaskHealthChecker};
pub use lb::{DisabledLoadBalancer, LoadBalancerClient, interpret_lb_state, lb_request_id};
