//! Offer pool and launch contracts.
//!
//! The pool hands out every available offer at once; each checked-out offer
//! must end up either used (consumed by a launch) or returned, never both.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use keel_placement::{Offer, OfferHolder};
use tracing::{debug, warn};

use crate::error::SchedulerResult;

/// Holds available offers grouped by agent.
pub trait OfferPool: Send + Sync {
    /// Check out every available offer, grouped per agent.
    fn checkout_offers(&self) -> Vec<OfferHolder>;

    /// Mark a checked-out offer as consumed.
    fn use_offer(&self, offer_id: &str);

    /// Put a checked-out offer back into the pool.
    fn return_offer(&self, offer_id: &str);
}

/// Launches the tasks matched onto an offer holder.
#[async_trait]
pub trait LaunchClient: Send + Sync {
    /// Launch `holder.accepted_tasks()` and report which of the holder's
    /// offers were left unused.
    async fn launch_tasks_and_get_unused_offers(
        &self,
        holder: &OfferHolder,
    ) -> SchedulerResult<Vec<Offer>>;
}

// ── In-memory pool ─────────────────────────────────────────────────

#[derive(Default)]
struct PoolState {
    available: Vec<Offer>,
    checked_out: HashMap<String, Offer>,
    used: Vec<String>,
    returned: Vec<String>,
}

/// In-process [`OfferPool`] with used/returned accounting.
#[derive(Default)]
pub struct InMemoryOfferPool {
    state: Mutex<PoolState>,
}

impl InMemoryOfferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_offer(&self, offer: Offer) {
        self.state().available.push(offer);
    }

    pub fn available_count(&self) -> usize {
        self.state().available.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.state().checked_out.len()
    }

    pub fn used_offer_ids(&self) -> Vec<String> {
        self.state().used.clone()
    }

    pub fn returned_offer_ids(&self) -> Vec<String> {
        self.state().returned.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OfferPool for InMemoryOfferPool {
    fn checkout_offers(&self) -> Vec<OfferHolder> {
        let mut state = self.state();
        let offers: Vec<Offer> = state.available.drain(..).collect();

        // Group per agent, keeping first-seen agent order.
        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<Offer>> = HashMap::new();
        for offer in offers {
            state.checked_out.insert(offer.id.clone(), offer.clone());
            if !grouped.contains_key(&offer.agent_id) {
                order.push(offer.agent_id.clone());
            }
            grouped.entry(offer.agent_id.clone()).or_default().push(offer);
        }

        order
            .into_iter()
            .filter_map(|agent_id| {
                let offers = grouped.remove(&agent_id)?;
                let hostname = offers.first()?.hostname.clone();
                Some(OfferHolder::new(&agent_id, &hostname, offers))
            })
            .collect()
    }

    fn use_offer(&self, offer_id: &str) {
        let mut state = self.state();
        if state.checked_out.remove(offer_id).is_some() {
            state.used.push(offer_id.to_string());
        } else {
            warn!(%offer_id, "use of offer that is not checked out");
        }
    }

    fn return_offer(&self, offer_id: &str) {
        let mut state = self.state();
        match state.checked_out.remove(offer_id) {
            Some(offer) => {
                state.available.push(offer);
                state.returned.push(offer_id.to_string());
            }
            None => warn!(%offer_id, "return of offer that is not checked out"),
        }
    }
}

// ── Checkout guard ─────────────────────────────────────────────────

/// Tracks offers checked out for one match attempt. Each offer is settled
/// at most once; anything unsettled is returned on drop.
pub(crate) struct OfferCheckout<'a> {
    pool: &'a dyn OfferPool,
    outstanding: Vec<String>,
}

impl<'a> OfferCheckout<'a> {
    pub(crate) fn new(pool: &'a dyn OfferPool, holders: &[OfferHolder]) -> Self {
        let outstanding = holders.iter().flat_map(|h| h.offer_ids()).collect();
        Self { pool, outstanding }
    }

    fn settle(&mut self, offer_id: &str) -> bool {
        match self.outstanding.iter().position(|id| id == offer_id) {
            Some(pos) => {
                self.outstanding.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn use_offer(&mut self, offer_id: &str) {
        if self.settle(offer_id) {
            self.pool.use_offer(offer_id);
        }
    }

    pub(crate) fn return_offer(&mut self, offer_id: &str) {
        if self.settle(offer_id) {
            self.pool.return_offer(offer_id);
        }
    }

    pub(crate) fn return_all(&mut self) {
        let ids: Vec<String> = self.outstanding.drain(..).collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "returning unused offers");
        }
        for id in ids {
            self.pool.return_offer(&id);
        }
    }
}

impl Drop for OfferCheckout<'_> {
    fn drop(&mut self) {
        self.return_all();
    }
}
