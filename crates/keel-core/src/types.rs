//! Shared value types used across the Keel crates.

use serde::{Deserialize, Serialize};

/// A bundle of schedulable resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Resources {
    pub cpus: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
}

impl Resources {
    pub const EMPTY: Resources = Resources {
        cpus: 0.0,
        memory_mb: 0.0,
        disk_mb: 0.0,
    };

    pub fn new(cpus: f64, memory_mb: f64, disk_mb: f64) -> Self {
        Self {
            cpus,
            memory_mb,
            disk_mb,
        }
    }

    /// Component-wise sum.
    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus + other.cpus,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
        }
    }

    /// Component-wise difference, clamped at zero.
    pub fn subtract(&self, other: &Resources) -> Resources {
        Resources {
            cpus: (self.cpus - other.cpus).max(0.0),
            memory_mb: (self.memory_mb - other.memory_mb).max(0.0),
            disk_mb: (self.disk_mb - other.disk_mb).max(0.0),
        }
    }

    /// True if every component of `other` fits within `self`.
    pub fn fits(&self, other: &Resources) -> bool {
        other.cpus <= self.cpus && other.memory_mb <= self.memory_mb && other.disk_mb <= self.disk_mb
    }
}
