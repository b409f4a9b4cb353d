//! Keel offer scoring by resource fit and agent load.
//!
//! This crate decides how well a cluster resource offer suits a task. It
//! does NOT own the offers or the match loop (that's `keel-scheduler`).
//! Instead, it scores offer holders against a task's effective resources and
//! the agent's latest usage snapshot.
//!
//! # Components
//!
//! - **`offer`**: Offers and per-agent offer holders
//! - **`usage`**: Usage context, staleness predicate, `UsageOracle`
//! - **`scorer`**: Offer scoring (fit, overload, weighted headroom)

pub mod offer;
pub mod scorer;
pub mod usage;

pub use offer::{Offer, OfferHolder};
pub use scorer::{ScoringWeights, score_offer};
pub use usage::{AgentUsageWithScores, UsageOracle, is_usage_stale, max_probable_usage};
