//! Offer scoring for placement decisions.
//!
//! Evaluates an offer holder for one task using:
//! - **Fit**: reject offers that can't hold the task plus its executor
//! - **Load**: reject agents whose load averages are past the thresholds
//! - **Headroom**: prefer agents with the most free capacity after placement
//!
//! Scores are in `(0.0, 1.0]`; `0.0` means "do not place here".

use keel_core::Resources;

use crate::offer::OfferHolder;
use crate::usage::AgentUsageWithScores;

/// Weights for the headroom components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cpu: 0.4,
            memory: 0.4,
            disk: 0.2,
        }
    }
}

/// Score an offer holder for a task needing `required` (task + executor).
pub fn score_offer(
    required: &Resources,
    offer: &OfferHolder,
    usage: &AgentUsageWithScores,
    weights: &ScoringWeights,
) -> f64 {
    if !offer.current_resources().fits(required) {
        return 0.0;
    }
    if usage.is_cpu_overloaded() {
        return 0.0;
    }

    let available = offer.current_resources();
    let u = &usage.usage;
    let total = Resources::new(
        u.cpus_total.unwrap_or(available.cpus + u.cpus_reserved),
        u.memory_mb_total.unwrap_or(available.memory_mb + u.memory_mb_reserved),
        u.disk_mb_total.unwrap_or(available.disk_mb + u.disk_mb_reserved),
    );

    // Probable consumption never drops below what the agent reports now.
    let probable = Resources::new(
        usage.max_probable_usage.cpus.max(u.cpus_used),
        usage.max_probable_usage.memory_mb.max(u.memory_mb_used),
        usage.max_probable_usage.disk_mb.max(u.disk_mb_used),
    )
    .add(required);

    if !total.fits(&probable) {
        return 0.0;
    }

    let cpu_free = free_fraction(probable.cpus, total.cpus);
    let mem_free = free_fraction(probable.memory_mb, total.memory_mb);
    let disk_free = free_fraction(probable.disk_mb, total.disk_mb);

    let weight_sum = weights.cpu + weights.memory + weights.disk;
    let mut score = if weight_sum > 0.0 {
        (weights.cpu * cpu_free + weights.memory * mem_free + weights.disk * disk_free) / weight_sum
    } else {
        1.0
    };

    if usage.score_using_system_load {
        score *= (1.0 - usage.load5_per_cpu()).clamp(0.0, 1.0);
    }

    // A fitting offer is always placeable, even on a busy agent.
    score.clamp(f64::EPSILON, 1.0)
}

fn free_fraction(used: f64, total: f64) -> f64 {
    if total > 0.0 {
        (1.0 - used / total).clamp(0.0, 1.0)
    } else {
        // Nothing of this resource exists or is needed.
        1.0
    }
}
