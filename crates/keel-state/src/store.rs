//! StateStore: redb-backed state persistence for Keel.
//!
//! Provides typed CRUD operations over requests, deploys, pending work,
//! tasks, cleanups, and usage. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::deploy::*;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
/// The two-argument form tags the error with the table it came from.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
    ($variant:ident, $table:expr) => {
        |e| StateError::$variant {
            table: $table.to_string(),
            reason: e.to_string(),
        }
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table, table.name()))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic table access ───────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let name = table.name();
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize, name))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table, name))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write, name))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let name = table.name();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table, name))?;
        match table.get(key).map_err(map_err!(Read, name))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize, name))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix` (all values for `""`).
    fn list<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let name = table.name();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table, name))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read, name))? {
            let (key, value) = entry.map_err(map_err!(Read, name))?;
            if key.value().starts_with(prefix) {
                let value: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize, name))?;
                results.push(value);
            }
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let name = table.name();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table, name))?;
            existed = table.remove(key).map_err(map_err!(Write, name))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Requests ───────────────────────────────────────────────────

    pub fn put_request(&self, request: &RequestWithState) -> StateResult<()> {
        self.put(REQUESTS, &request.request.id, request)?;
        debug!(request_id = %request.request.id, state = %request.state, "request stored");
        Ok(())
    }

    pub fn get_request(&self, request_id: &str) -> StateResult<Option<RequestWithState>> {
        self.get(REQUESTS, request_id)
    }

    pub fn list_requests(&self) -> StateResult<Vec<RequestWithState>> {
        self.list(REQUESTS, "")
    }

    pub fn delete_request(&self, request_id: &str) -> StateResult<bool> {
        self.delete(REQUESTS, request_id)
    }

    // ── Deploys ────────────────────────────────────────────────────

    pub fn put_deploy(&self, deploy: &Deploy) -> StateResult<()> {
        self.put(DEPLOYS, &deploy.table_key(), deploy)
    }

    pub fn get_deploy(&self, request_id: &str, deploy_id: &str) -> StateResult<Option<Deploy>> {
        self.get(DEPLOYS, &format!("{request_id}:{deploy_id}"))
    }

    // ── Pending deploys ────────────────────────────────────────────

    pub fn put_pending_deploy(&self, pending: &PendingDeploy) -> StateResult<()> {
        self.put(PENDING_DEPLOYS, &pending.table_key(), pending)?;
        debug!(
            deploy = %pending.deploy_marker,
            state = %pending.current_deploy_state,
            "pending deploy stored"
        );
        Ok(())
    }

    pub fn get_pending_deploy(&self, request_id: &str) -> StateResult<Option<PendingDeploy>> {
        self.get(PENDING_DEPLOYS, request_id)
    }

    pub fn list_pending_deploys(&self) -> StateResult<Vec<PendingDeploy>> {
        self.list(PENDING_DEPLOYS, "")
    }

    pub fn delete_pending_deploy(&self, request_id: &str) -> StateResult<bool> {
        let existed = self.delete(PENDING_DEPLOYS, request_id)?;
        debug!(%request_id, existed, "pending deploy deleted");
        Ok(existed)
    }

    // ── Cancel and update requests ─────────────────────────────────

    pub fn put_cancel_deploy(&self, marker: &DeployMarker) -> StateResult<()> {
        self.put(CANCEL_DEPLOYS, &marker.table_key(), marker)
    }

    pub fn list_cancel_deploys(&self) -> StateResult<Vec<DeployMarker>> {
        self.list(CANCEL_DEPLOYS, "")
    }

    pub fn delete_cancel_deploy(&self, marker: &DeployMarker) -> StateResult<bool> {
        self.delete(CANCEL_DEPLOYS, &marker.table_key())
    }

    pub fn put_update_pending_deploy(&self, update: &UpdatePendingDeployRequest) -> StateResult<()> {
        self.put(UPDATE_PENDING_DEPLOYS, &update.table_key(), update)
    }

    pub fn list_update_pending_deploys(&self) -> StateResult<Vec<UpdatePendingDeployRequest>> {
        self.list(UPDATE_PENDING_DEPLOYS, "")
    }

    pub fn delete_update_pending_deploy(
        &self,
        update: &UpdatePendingDeployRequest,
    ) -> StateResult<bool> {
        self.delete(UPDATE_PENDING_DEPLOYS, &update.table_key())
    }

    // ── Deploy results and pointers ────────────────────────────────

    pub fn put_deploy_result(&self, marker: &DeployMarker, result: &DeployResult) -> StateResult<()> {
        self.put(DEPLOY_RESULTS, &marker.table_key(), result)?;
        debug!(deploy = %marker, state = %result.deploy_state, "deploy result stored");
        Ok(())
    }

    pub fn get_deploy_result(
        &self,
        request_id: &str,
        deploy_id: &str,
    ) -> StateResult<Option<DeployResult>> {
        self.get(DEPLOY_RESULTS, &format!("{request_id}:{deploy_id}"))
    }

    pub fn put_request_deploy_state(&self, state: &RequestDeployState) -> StateResult<()> {
        self.put(REQUEST_DEPLOY_STATES, &state.request_id, state)
    }

    pub fn get_request_deploy_state(
        &self,
        request_id: &str,
    ) -> StateResult<Option<RequestDeployState>> {
        self.get(REQUEST_DEPLOY_STATES, request_id)
    }

    // ── Pending requests ───────────────────────────────────────────

    /// Append to the pending-request queue.
    pub fn add_to_pending_queue(&self, pending: &PendingRequest) -> StateResult<()> {
        self.put(PENDING_REQUESTS, &pending.table_key(), pending)?;
        debug!(
            request_id = %pending.request_id,
            deploy_id = %pending.deploy_id,
            pending_type = %pending.pending_type,
            "pending request queued"
        );
        Ok(())
    }

    pub fn list_pending_requests(&self) -> StateResult<Vec<PendingRequest>> {
        self.list(PENDING_REQUESTS, "")
    }

    pub fn list_pending_requests_for_request(
        &self,
        request_id: &str,
    ) -> StateResult<Vec<PendingRequest>> {
        self.list(PENDING_REQUESTS, &format!("{request_id}:"))
    }

    pub fn delete_pending_request(&self, pending: &PendingRequest) -> StateResult<bool> {
        self.delete(PENDING_REQUESTS, &pending.table_key())
    }

    // ── Pending tasks ──────────────────────────────────────────────

    pub fn put_pending_task(&self, task: &PendingTask) -> StateResult<()> {
        self.put(PENDING_TASKS, &task.pending_task_id.table_key(), task)
    }

    pub fn get_pending_task(&self, id: &PendingTaskId) -> StateResult<Option<PendingTask>> {
        self.get(PENDING_TASKS, &id.table_key())
    }

    pub fn list_pending_task_ids(&self) -> StateResult<Vec<PendingTaskId>> {
        let tasks: Vec<PendingTask> = self.list(PENDING_TASKS, "")?;
        Ok(tasks.into_iter().map(|t| t.pending_task_id).collect())
    }

    pub fn list_pending_task_ids_for_request(
        &self,
        request_id: &str,
    ) -> StateResult<Vec<PendingTaskId>> {
        let tasks: Vec<PendingTask> = self.list(PENDING_TASKS, &format!("{request_id}:"))?;
        Ok(tasks.into_iter().map(|t| t.pending_task_id).collect())
    }

    pub fn delete_pending_task(&self, id: &PendingTaskId) -> StateResult<bool> {
        let existed = self.delete(PENDING_TASKS, &id.table_key())?;
        debug!(pending_task_id = %id, existed, "pending task deleted");
        Ok(existed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        self.put(TASKS, &task.task_id.table_key(), task)
    }

    pub fn get_task(&self, task_id: &TaskId) -> StateResult<Option<Task>> {
        self.get(TASKS, &task_id.table_key())
    }

    /// All tasks of a request, active or not.
    pub fn list_tasks_for_request(&self, request_id: &str) -> StateResult<Vec<Task>> {
        self.list(TASKS, &format!("{request_id}:"))
    }

    pub fn list_active_tasks(&self) -> StateResult<Vec<Task>> {
        let tasks: Vec<Task> = self.list(TASKS, "")?;
        Ok(tasks.into_iter().filter(Task::is_active).collect())
    }

    pub fn list_active_tasks_for_request(&self, request_id: &str) -> StateResult<Vec<Task>> {
        let tasks = self.list_tasks_for_request(request_id)?;
        Ok(tasks.into_iter().filter(Task::is_active).collect())
    }

    /// Persist a newly placed task and drop its pending-task record in one
    /// write transaction.
    pub fn create_task_and_delete_pending_task(&self, task: &Task) -> StateResult<()> {
        let task_key = task.task_id.table_key();
        let pending_key = task.pending_task_id.table_key();
        let value = serde_json::to_vec(task).map_err(map_err!(Serialize, TASKS.name()))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tasks = txn
                .open_table(TASKS)
                .map_err(map_err!(Table, TASKS.name()))?;
            tasks
                .insert(task_key.as_str(), value.as_slice())
                .map_err(map_err!(Write, TASKS.name()))?;
            let mut pending = txn
                .open_table(PENDING_TASKS)
                .map_err(map_err!(Table, PENDING_TASKS.name()))?;
            pending
                .remove(pending_key.as_str())
                .map_err(map_err!(Write, PENDING_TASKS.name()))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = %task.task_id, "task created, pending task deleted");
        Ok(())
    }

    /// Stop deploy-time health checking for a task.
    pub fn mark_healthchecks_finished(&self, task_id: &TaskId) -> StateResult<()> {
        let mut task = self
            .get_task(task_id)?
            .ok_or_else(|| StateError::NotFound {
                table: TASKS.name().to_string(),
                key: task_id.id(),
            })?;
        task.healthchecks_finished = true;
        task.startup_healthchecks = 0;
        self.put_task(&task)
    }

    // ── Task load-balancer state ───────────────────────────────────

    pub fn save_load_balancer_state(
        &self,
        task_id: &TaskId,
        request_type: LoadBalancerRequestType,
        update: &LoadBalancerUpdate,
    ) -> StateResult<()> {
        let key = format!("{}:{}", task_id.id(), request_type.as_str());
        self.put(TASK_LB_UPDATES, &key, update)
    }

    pub fn get_load_balancer_state(
        &self,
        task_id: &TaskId,
        request_type: LoadBalancerRequestType,
    ) -> StateResult<Option<LoadBalancerUpdate>> {
        let key = format!("{}:{}", task_id.id(), request_type.as_str());
        self.get(TASK_LB_UPDATES, &key)
    }

    // ── Cleanups ───────────────────────────────────────────────────

    /// Store a cleanup unless one already exists for the task.
    /// Returns true if it was created.
    pub fn create_task_cleanup(&self, cleanup: &TaskCleanup) -> StateResult<bool> {
        let key = cleanup.task_id.id();
        let name = TASK_CLEANUPS.name();
        let value = serde_json::to_vec(cleanup).map_err(map_err!(Serialize, name))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let mut table = txn
                .open_table(TASK_CLEANUPS)
                .map_err(map_err!(Table, name))?;
            created = table
                .get(key.as_str())
                .map_err(map_err!(Read, name))?
                .is_none();
            if created {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write, name))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = %cleanup.task_id, created, "task cleanup requested");
        Ok(created)
    }

    /// Store a cleanup, replacing any existing one for the task.
    pub fn save_task_cleanup(&self, cleanup: &TaskCleanup) -> StateResult<()> {
        self.put(TASK_CLEANUPS, &cleanup.task_id.id(), cleanup)
    }

    pub fn list_task_cleanups(&self) -> StateResult<Vec<TaskCleanup>> {
        self.list(TASK_CLEANUPS, "")
    }

    pub fn list_cleanup_task_ids(&self) -> StateResult<Vec<TaskId>> {
        let cleanups = self.list_task_cleanups()?;
        Ok(cleanups.into_iter().map(|c| c.task_id).collect())
    }

    // ── Usage ──────────────────────────────────────────────────────

    pub fn put_agent_usage(&self, usage: &AgentUsage) -> StateResult<()> {
        self.put(AGENT_USAGE, &usage.agent_id, usage)
    }

    pub fn get_agent_usage(&self, agent_id: &str) -> StateResult<Option<AgentUsage>> {
        self.get(AGENT_USAGE, agent_id)
    }

    pub fn put_request_utilization(&self, utilization: &RequestUtilization) -> StateResult<()> {
        self.put(REQUEST_UTILIZATION, &utilization.request_id, utilization)
    }

    pub fn get_request_utilization(
        &self,
        request_id: &str,
    ) -> StateResult<Option<RequestUtilization>> {
        self.get(REQUEST_UTILIZATION, request_id)
    }

    pub fn delete_request_utilization(&self, request_id: &str) -> StateResult<bool> {
        self.delete(REQUEST_UTILIZATION, request_id)
    }

    // ── Expiring actions ───────────────────────────────────────────

    pub fn put_expiring(&self, action: &ExpiringAction) -> StateResult<()> {
        self.put(EXPIRING, &action.table_key(), action)
    }

    pub fn get_expiring(
        &self,
        action_type: ExpiringActionType,
        request_id: &str,
    ) -> StateResult<Option<ExpiringAction>> {
        self.get(EXPIRING, &format!("{}:{request_id}", action_type.as_str()))
    }

    pub fn delete_expiring(
        &self,
        action_type: ExpiringActionType,
        request_id: &str,
    ) -> StateResult<bool> {
        self.delete(EXPIRING, &format!("{}:{request_id}", action_type.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn test_pending_task_id(request_id: &str, instance_no: u32) -> PendingTaskId {
        PendingTaskId::new(request_id, "d1", 1000, instance_no, PendingType::NewDeploy, 900)
    }

    fn test_task(pending: &PendingTaskId, started_at: u64) -> Task {
        Task {
            task_id: TaskId {
                request_id: pending.request_id.clone(),
                deploy_id: pending.deploy_id.clone(),
                started_at,
                instance_no: pending.instance_no,
                host: "host-1".to_string(),
                agent_id: "agent-1".to_string(),
            },
            pending_task_id: pending.clone(),
            state: TaskState::Launched,
            health: TaskHealth::Unknown,
            healthchecks_finished: false,
            startup_healthchecks: 2,
            resources: Resources::new(1.0, 64.0, 0.0),
            executor_resources: Resources::EMPTY,
            offer_ids: vec!["offer-1".to_string()],
            run_id: None,
            command_line_args: None,
        }
    }

    #[test]
    fn test_create_task_deletes_pending_task() {
        let store = StateStore::open_in_memory().unwrap();
        let pending_id = test_pending_task_id("svc", 1);
        store.put_pending_task(&PendingTask::new(pending_id.clone())).unwrap();
        assert!(store.get_pending_task(&pending_id).unwrap().is_some());

        let task = test_task(&pending_id, 2000);
        store.create_task_and_delete_pending_task(&task).unwrap();

        assert!(store.get_pending_task(&pending_id).unwrap().is_none());
        assert_eq!(store.get_task(&task.task_id).unwrap(), Some(task));
        assert_eq!(store.list_active_tasks_for_request("svc").unwrap().len(), 1);
    }

    #[test]
    fn test_prefix_scan_does_not_cross_requests() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pending_task(&PendingTask::new(test_pending_task_id("svc", 1))).unwrap();
        store.put_pending_task(&PendingTask::new(test_pending_task_id("svc", 2))).unwrap();
        store.put_pending_task(&PendingTask::new(test_pending_task_id("svc-b", 1))).unwrap();

        assert_eq!(store.list_pending_task_ids_for_request("svc").unwrap().len(), 2);
        assert_eq!(store.list_pending_task_ids_for_request("svc-b").unwrap().len(), 1);
        assert_eq!(store.list_pending_task_ids().unwrap().len(), 3);
    }

    #[test]
    fn test_inactive_tasks_are_not_listed_as_active() {
        let store = StateStore::open_in_memory().unwrap();
        let mut running = test_task(&test_pending_task_id("svc", 1), 2000);
        running.state = TaskState::Running;
        let mut failed = test_task(&test_pending_task_id("svc", 2), 2001);
        failed.state = TaskState::Failed;
        store.put_task(&running).unwrap();
        store.put_task(&failed).unwrap();

        assert_eq!(store.list_tasks_for_request("svc").unwrap().len(), 2);
        let active = store.list_active_tasks().unwrap();
        assert_eq!(active, vec![running]);
    }

    #[test]
    fn test_create_task_cleanup_keeps_first() {
        let store = StateStore::open_in_memory().unwrap();
        let task = test_task(&test_pending_task_id("svc", 1), 2000);
        let first = TaskCleanup {
            user: None,
            cleanup_type: TaskCleanupType::Bouncing,
            timestamp: 1,
            task_id: task.task_id.clone(),
            message: None,
        };
        let second = TaskCleanup {
            cleanup_type: TaskCleanupType::DeployStepFinished,
            timestamp: 2,
            ..first.clone()
        };
        assert!(store.create_task_cleanup(&first).unwrap());
        assert!(!store.create_task_cleanup(&second).unwrap());
        assert_eq!(store.list_task_cleanups().unwrap(), vec![first]);
    }

    #[test]
    fn test_mark_healthchecks_finished() {
        let store = StateStore::open_in_memory().unwrap();
        let task = test_task(&test_pending_task_id("svc", 1), 2000);
        store.put_task(&task).unwrap();
        store.mark_healthchecks_finished(&task.task_id).unwrap();

        let stored = store.get_task(&task.task_id).unwrap().unwrap();
        assert!(stored.healthchecks_finished);
        assert_eq!(stored.startup_healthchecks, 0);

        let missing = test_task(&test_pending_task_id("other", 1), 1);
        match store.mark_healthchecks_finished(&missing.task_id) {
            Err(err @ StateError::NotFound { .. }) => {
                assert_eq!(err.table(), Some("tasks"));
                assert!(err.to_string().contains(&missing.task_id.id()));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_record_names_its_table() {
        let store = StateStore::open_in_memory().unwrap();
        let task = test_task(&test_pending_task_id("svc", 1), 2000);
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(TASKS).unwrap();
            table
                .insert(task.task_id.table_key().as_str(), b"not json".as_slice())
                .unwrap();
        }
        txn.commit().unwrap();

        let err = store.get_task(&task.task_id).unwrap_err();
        assert!(matches!(err, StateError::Deserialize { .. }));
        assert_eq!(err.table(), Some("tasks"));
        assert!(err.to_string().starts_with("corrupt record in table `tasks`"));

        let err = store.list_tasks_for_request("svc").unwrap_err();
        assert_eq!(err.table(), Some("tasks"));
    }

    #[test]
    fn test_pending_deploy_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let pending = PendingDeploy {
            deploy_marker: DeployMarker::new("svc", "d2", 100, Some("alice".to_string())),
            last_load_balancer_update: None,
            current_deploy_state: DeployState::Waiting,
            deploy_progress: Some(DeployProgress {
                target_active_instances: 1,
                current_active_instances: 0,
                deploy_instance_count_per_step: 1,
                deploy_step_wait_time_ms: 0,
                step_complete: false,
                auto_advance_deploy_steps: true,
                failed_deploy_tasks: BTreeSet::new(),
                timestamp: 100,
            }),
            updated_request: None,
        };
        store.put_pending_deploy(&pending).unwrap();
        assert_eq!(store.list_pending_deploys().unwrap(), vec![pending.clone()]);
        assert!(store.delete_pending_deploy("svc").unwrap());
        assert!(!store.delete_pending_deploy("svc").unwrap());
        assert!(store.get_pending_deploy("svc").unwrap().is_none());
    }

    #[test]
    fn test_task_lb_state_by_type() {
        let store = StateStore::open_in_memory().unwrap();
        let task = test_task(&test_pending_task_id("svc", 1), 2000);
        let lb_id = LoadBalancerRequestId::new("svc-d1-1", LoadBalancerRequestType::Deploy);
        let update = LoadBalancerUpdate::pre_enqueue(lb_id, 5);
        store
            .save_load_balancer_state(&task.task_id, LoadBalancerRequestType::Add, &update)
            .unwrap();

        assert_eq!(
            store
                .get_load_balancer_state(&task.task_id, LoadBalancerRequestType::Add)
                .unwrap(),
            Some(update)
        );
        assert!(store
            .get_load_balancer_state(&task.task_id, LoadBalancerRequestType::Remove)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.redb");
        {
            let store = StateStore::open(&path).unwrap();
            let request = RequestWithState::new(
                Request::new("svc", RequestType::Service),
                RequestState::Active,
                1,
            );
            store.put_request(&request).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let loaded = store.get_request("svc").unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Active);
    }
}
