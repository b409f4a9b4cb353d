//! Leadership contract.
//!
//! Only the leader admits and matches pending tasks. Leader election itself
//! lives outside the scheduler; this module only asks whether we hold it.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait LeadershipOracle: Send + Sync {
    fn has_leadership(&self) -> bool;
}

/// Leadership flag set by whoever runs the election (or fixed for a
/// single-node deployment).
#[derive(Debug, Default)]
pub struct StaticLeadership {
    leader: AtomicBool,
}

impl StaticLeadership {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }

    pub fn set(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl LeadershipOracle for StaticLeadership {
    fn has_leadership(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
