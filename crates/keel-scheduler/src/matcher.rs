//! Offer matcher: places one admitted pending task.
//!
//! For each attempt the matcher checks out the whole offer pool, scores every
//! offer holder until one is good enough, persists and launches the task on
//! the best holder, and settles every checked-out offer as used or returned.

use std::sync::Arc;

use keel_core::{Resources, SchedulerConfig, epoch_millis};
use keel_placement::{
    AgentUsageWithScores, OfferHolder, ScoringWeights, UsageOracle, is_usage_stale,
    max_probable_usage, score_offer,
};
use keel_state::{PendingTaskId, StateStore, Task, TaskId};
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;
use crate::offers::{LaunchClient, OfferCheckout, OfferPool};
use crate::task_builder::{TaskRequestHolder, build_task, optimize_size, resolve_task_request};

/// What happened to one admitted task.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Placed, persisted, and launched.
    Matched { task_id: TaskId, score: f64 },
    /// No offer scored above zero; the task should be re-admitted.
    NoOffer,
    /// The pending task record no longer exists.
    PendingTaskNotFound,
}

pub struct OfferMatcher {
    config: SchedulerConfig,
    store: StateStore,
    offer_pool: Arc<dyn OfferPool>,
    launcher: Arc<dyn LaunchClient>,
    usage: Arc<dyn UsageOracle>,
    weights: ScoringWeights,
}

impl OfferMatcher {
    pub fn new(
        config: SchedulerConfig,
        store: StateStore,
        offer_pool: Arc<dyn OfferPool>,
        launcher: Arc<dyn LaunchClient>,
        usage: Arc<dyn UsageOracle>,
    ) -> Self {
        Self {
            config,
            store,
            offer_pool,
            launcher,
            usage,
            weights: ScoringWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Try to place one pending task. The caller holds the request lock.
    pub async fn match_task(&self, pending_task_id: &PendingTaskId) -> SchedulerResult<MatchOutcome> {
        let Some(holder) = resolve_task_request(&self.store, &self.config, pending_task_id)? else {
            warn!(%pending_task_id, "pending task not found, skipping");
            return Ok(MatchOutcome::PendingTaskNotFound);
        };

        let mut offers = self.offer_pool.checkout_offers();
        let mut checkout = OfferCheckout::new(self.offer_pool.as_ref(), &offers);

        let required = holder.total_resources();
        let active_tasks = self.store.list_active_tasks()?;

        let mut best: Option<(usize, f64)> = None;
        for (idx, offer) in offers.iter().enumerate() {
            let score = self.score(offer, &required, &active_tasks);
            if score > best.map_or(0.0, |(_, s)| s) {
                best = Some((idx, score));
            }
            if best.is_some_and(|(_, s)| s >= self.config.good_enough_score_threshold) {
                break;
            }
        }

        let Some((idx, score)) = best else {
            debug!(%pending_task_id, offers = offers.len(), "no offer qualified");
            checkout.return_all();
            return Ok(MatchOutcome::NoOffer);
        };

        let mut chosen = offers.swap_remove(idx);
        // Offers not chosen go straight back.
        for other in &offers {
            for id in other.offer_ids() {
                checkout.return_offer(&id);
            }
        }

        let task = self.accept_task(&mut chosen, &holder)?;
        let unused = self.launcher.launch_tasks_and_get_unused_offers(&chosen).await?;
        for offer in chosen.offers() {
            if unused.iter().any(|u| u.id == offer.id) {
                checkout.return_offer(&offer.id);
            } else {
                checkout.use_offer(&offer.id);
            }
        }

        info!(
            %pending_task_id,
            task_id = %task.task_id,
            agent_id = %chosen.agent_id(),
            score,
            "pending task matched"
        );
        Ok(MatchOutcome::Matched {
            task_id: task.task_id,
            score,
        })
    }

    /// Build the task, persist it in place of the pending task, and record it
    /// on the holder.
    fn accept_task(&self, offer: &mut OfferHolder, holder: &TaskRequestHolder) -> SchedulerResult<Task> {
        let task = optimize_size(build_task(offer, holder, epoch_millis()));
        self.store.create_task_and_delete_pending_task(&task)?;
        offer.add_matched_task(task.clone());
        Ok(task)
    }

    fn score(&self, offer: &OfferHolder, required: &Resources, active_tasks: &[Task]) -> f64 {
        let agent_id = offer.agent_id();
        let usage = match self.usage.get_agent_usage(agent_id) {
            Ok(Some(usage)) => usage,
            Ok(None) => {
                self.usage.request_refresh(agent_id);
                return 0.0;
            }
            Err(e) => {
                warn!(%agent_id, error = %e, "usage lookup failed");
                return 0.0;
            }
        };

        let host = offer.sanitized_host();
        let on_host: Vec<&Task> = active_tasks
            .iter()
            .filter(|t| t.task_id.host == host)
            .collect();

        if self.config.recheck_metrics_for_large_new_task_count {
            let new_tasks = on_host
                .iter()
                .filter(|t| t.task_id.started_at > usage.timestamp)
                .count();
            if is_usage_stale(&usage, new_tasks) {
                debug!(%agent_id, new_tasks, num_tasks = usage.num_tasks, "usage snapshot stale");
                self.usage.request_refresh(agent_id);
                return 0.0;
            }
        }

        let probable = max_probable_usage(&on_host, |request_id| {
            self.store.get_request_utilization(request_id).ok().flatten()
        });
        let context = AgentUsageWithScores::new(usage, probable, &self.config);
        score_offer(required, offer, &context, &self.weights)
    }
}
