//! keel-state: embedded state store for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for requests, deploys, pending work, tasks, cleanups, and agent
//! usage snapshots.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{request_id}:{deploy_id}`, `{request_id}:{task_id}`) enable
//! prefix scans for a request's records.
//!
//! Placing a task is a single write transaction that inserts the task and
//! deletes its pending-task record, so a task is never both pending and placed.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod deploy;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use deploy::*;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
