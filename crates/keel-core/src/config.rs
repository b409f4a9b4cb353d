//! keel.toml configuration parser.
//!
//! Every table and field has a default, so an empty file yields the stock
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::Resources;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct KeelConfig {
    pub scheduler: SchedulerConfig,
    pub deploy: DeployConfig,
    pub load_balancer: LoadBalancerConfig,
}

/// Admission and offer-matching knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of concurrent request-lock acquisitions.
    pub parallel_lock_wait: usize,
    /// Offer scan stops once the best score reaches this value.
    pub good_enough_score_threshold: f64,
    /// Priority level used when a request has none (or cannot be found).
    pub default_task_priority_level: f64,
    pub scheduler_priority_weight_factor: f64,
    /// Treat a usage snapshot as stale when many tasks landed after it.
    pub recheck_metrics_for_large_new_task_count: bool,
    pub score_using_system_load: bool,
    pub load5_overloaded_threshold: f64,
    pub load1_overloaded_threshold: f64,
    pub default_resources: Resources,
    pub custom_executor_resources: Resources,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel_lock_wait: 15,
            good_enough_score_threshold: 0.75,
            default_task_priority_level: 0.3,
            scheduler_priority_weight_factor: 1.0,
            recheck_metrics_for_large_new_task_count: false,
            score_using_system_load: true,
            load5_overloaded_threshold: 1.0,
            load1_overloaded_threshold: 1.5,
            default_resources: Resources::new(1.0, 64.0, 0.0),
            custom_executor_resources: Resources::EMPTY,
        }
    }
}

/// Deploy reconciliation knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    /// Number of deploys evaluated concurrently per check.
    pub check_worker_pool_size: usize,
    pub allow_deploy_of_paused_requests: bool,
    /// Used when a deploy does not set its own health timeout.
    pub default_deploy_healthy_by_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            check_worker_pool_size: 10,
            allow_deploy_of_paused_requests: false,
            default_deploy_healthy_by_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Load balancer API endpoint. Load-balanced deploys fail without it.
    pub uri: Option<String>,
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
