//! Cluster resource offers, grouped per agent.

use keel_core::Resources;
use keel_state::Task;

/// A single resource offer from the cluster manager.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub resources: Resources,
}

/// All offers currently checked out for one agent, plus the tasks matched
/// onto them during this attempt.
#[derive(Debug, Clone)]
pub struct OfferHolder {
    agent_id: String,
    hostname: String,
    offers: Vec<Offer>,
    current_resources: Resources,
    accepted_tasks: Vec<Task>,
}

impl OfferHolder {
    /// Group offers from a single agent. The first offer decides the agent
    /// identity.
    pub fn new(agent_id: &str, hostname: &str, offers: Vec<Offer>) -> Self {
        let current_resources = offers
            .iter()
            .fold(Resources::EMPTY, |acc, o| acc.add(&o.resources));
        Self {
            agent_id: agent_id.to_string(),
            hostname: hostname.to_string(),
            offers,
            current_resources,
            accepted_tasks: Vec::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Host name normalized for comparisons against task hosts.
    pub fn sanitized_host(&self) -> String {
        sanitize_host(&self.hostname)
    }

    pub fn offers(&self) -> &[Offer] {
        &self.offers
    }

    pub fn offer_ids(&self) -> Vec<String> {
        self.offers.iter().map(|o| o.id.clone()).collect()
    }

    /// Resources still unclaimed after the tasks matched so far.
    pub fn current_resources(&self) -> Resources {
        self.current_resources
    }

    pub fn accepted_tasks(&self) -> &[Task] {
        &self.accepted_tasks
    }

    /// Record a task placed on this agent and deduct what it reserves.
    pub fn add_matched_task(&mut self, task: Task) {
        let reserved = task.resources.add(&task.executor_resources);
        self.current_resources = self.current_resources.subtract(&reserved);
        self.accepted_tasks.push(task);
    }
}

/// Lowercase and replace characters that are unsafe in ids.
pub fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| match c {
            '.' | ':' | '/' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}
