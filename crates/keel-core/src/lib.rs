//! keel-core: configuration, clock, and per-request locking for Keel.
//!
//! Keel is the scheduling core of a cluster framework: it admits pending
//! tasks, matches them to resource offers, and drives staged deploys to a
//! terminal outcome. This crate holds the pieces every other Keel crate
//! shares.
//!
//! # Components
//!
//! - **`config`**: `KeelConfig` parsed from keel.toml
//! - **`lock`**: `RequestLock` trait, in-process implementation, scoped guard
//! - **`types`**: shared value types (`Resources`)

pub mod clock;
pub mod config;
pub mod lock;
pub mod types;

pub use clock::epoch_millis;
pub use config::{DeployConfig, KeelConfig, LoadBalancerConfig, SchedulerConfig};
pub use lock::{
    LocalRequestLock, LockError, LockResult, RequestLock, RequestLockGuard, run_with_request_lock,
};
pub use types::Resources;
