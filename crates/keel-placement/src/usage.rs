//! Agent usage context for scoring.
//!
//! Usage snapshots are collected out of band and may lag behind placements.
//! The scorer only trusts a snapshot that is present and not stale.

use keel_core::{Resources, SchedulerConfig};
use keel_state::{AgentUsage, RequestUtilization, StateResult, StateStore, Task};
use tracing::debug;

/// Source of per-agent usage snapshots.
pub trait UsageOracle: Send + Sync {
    fn get_agent_usage(&self, agent_id: &str) -> StateResult<Option<AgentUsage>>;

    /// Ask the collector for a fresh snapshot. Fire-and-forget.
    fn request_refresh(&self, agent_id: &str) {
        debug!(%agent_id, "usage refresh requested");
    }
}

impl UsageOracle for StateStore {
    fn get_agent_usage(&self, agent_id: &str) -> StateResult<Option<AgentUsage>> {
        StateStore::get_agent_usage(self, agent_id)
    }
}

/// A usage snapshot with the derived fields the scorer needs.
#[derive(Debug, Clone)]
pub struct AgentUsageWithScores {
    pub usage: AgentUsage,
    pub score_using_system_load: bool,
    /// Resources existing tasks on the agent are expected to consume.
    pub max_probable_usage: Resources,
    pub load5_overloaded_threshold: f64,
    pub load1_overloaded_threshold: f64,
    pub timestamp: u64,
}

impl AgentUsageWithScores {
    pub fn new(usage: AgentUsage, max_probable_usage: Resources, config: &SchedulerConfig) -> Self {
        let timestamp = usage.timestamp;
        Self {
            usage,
            score_using_system_load: config.score_using_system_load,
            max_probable_usage,
            load5_overloaded_threshold: config.load5_overloaded_threshold,
            load1_overloaded_threshold: config.load1_overloaded_threshold,
            timestamp,
        }
    }

    fn system_cpus(&self) -> f64 {
        if self.usage.system_cpus_total > 0.0 {
            self.usage.system_cpus_total
        } else {
            self.usage.cpus_total.unwrap_or(0.0)
        }
    }

    /// Per-cpu 5 minute load, 0 when cpu count is unknown.
    pub fn load5_per_cpu(&self) -> f64 {
        let cpus = self.system_cpus();
        if cpus > 0.0 {
            self.usage.system_load_5min / cpus
        } else {
            0.0
        }
    }

    pub fn load1_per_cpu(&self) -> f64 {
        let cpus = self.system_cpus();
        if cpus > 0.0 {
            self.usage.system_load_1min / cpus
        } else {
            0.0
        }
    }

    /// True when system-load scoring is on and either load average is past
    /// its threshold.
    pub fn is_cpu_overloaded(&self) -> bool {
        self.score_using_system_load
            && (self.load5_per_cpu() > self.load5_overloaded_threshold
                || self.load1_per_cpu() > self.load1_overloaded_threshold)
    }
}

/// A snapshot is stale once the tasks started after it reach half of the
/// task count it recorded. With no new tasks the snapshot is current.
///
/// The `new_task_count > 0` guard matters for agents that recorded zero or
/// one task. Their half rounds down to zero, so a bare `>=` would call every
/// such snapshot stale and the agent would score zero on every offer.
pub fn is_usage_stale(usage: &AgentUsage, new_task_count: usize) -> bool {
    new_task_count > 0 && new_task_count >= (usage.num_tasks / 2) as usize
}

/// Expected consumption of the given active tasks: the request's observed
/// average when known, otherwise the task's reservation.
pub fn max_probable_usage<F>(active_tasks: &[&Task], utilization: F) -> Resources
where
    F: Fn(&str) -> Option<RequestUtilization>,
{
    active_tasks.iter().fold(Resources::EMPTY, |acc, task| {
        let reserved = task.resources.add(&task.executor_resources);
        let expected = match utilization(&task.task_id.request_id) {
            Some(u) => Resources::new(
                u.avg_cpus_used.max(reserved.cpus),
                u.avg_memory_mb_used.max(reserved.memory_mb),
                reserved.disk_mb,
            ),
            None => reserved,
        };
        acc.add(&expected)
    })
}
