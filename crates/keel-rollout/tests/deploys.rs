//! Deploy checker scenarios against the in-memory store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{KeelConfig, LocalRequestLock, Resources, epoch_millis};
use keel_rollout::*;
use keel_state::*;

/// LB fake answering every call with a fixed state.
struct ScriptedLb {
    state: Mutex<LoadBalancerState>,
    enqueued: Mutex<Vec<(String, usize, usize)>>,
}

impl ScriptedLb {
    fn new(state: LoadBalancerState) -> Self {
        Self {
            state: Mutex::new(state),
            enqueued: Mutex::new(Vec::new()),
        }
    }

    fn update(&self, id: &LoadBalancerRequestId) -> LoadBalancerUpdate {
        LoadBalancerUpdate::new(*self.state.lock().unwrap(), id.clone(), None, epoch_millis())
    }
}

#[async_trait]
impl LoadBalancerClient for ScriptedLb {
    async fn enqueue(
        &self,
        id: &LoadBalancerRequestId,
        _request: &Request,
        _deploy: &Deploy,
        add: &[Task],
        remove: &[Task],
    ) -> RolloutResult<LoadBalancerUpdate> {
        self.enqueued
            .lock()
            .unwrap()
            .push((id.id.clone(), add.len(), remove.len()));
        Ok(self.update(id))
    }

    async fn get_state(&self, id: &LoadBalancerRequestId) -> RolloutResult<LoadBalancerUpdate> {
        Ok(self.update(id))
    }

    async fn cancel(&self, id: &LoadBalancerRequestId) -> RolloutResult<LoadBalancerUpdate> {
        Ok(self.update(id))
    }
}

/// Health checker whose backing store is unreachable.
struct BrokenHealth;

impl DeployHealthChecker for BrokenHealth {
    fn deploy_health(&self, _: &Request, _: Option<&Deploy>, _: &[TaskId]) -> RolloutResult<DeployHealth> {
        Err(RolloutError::State(StateError::Read {
            table: "tasks".to_string(),
            reason: "disk gone".to_string(),
        }))
    }

    fn task_failures(&self, _: &Request, _: Option<&Deploy>, _: &[TaskId]) -> RolloutResult<Vec<DeployFailure>> {
        Ok(Vec::new())
    }
}

struct Fixture {
    store: StateStore,
    marker: DeployMarker,
}

/// Request "svc" with `instances` old tasks on deploy d0 and a pending
/// deploy d1 whose first step targets `per_step` instances.
fn fixture(instances: u32, per_step: u32, load_balanced: bool) -> Fixture {
    let store = StateStore::open_in_memory().unwrap();
    let now = epoch_millis();

    let mut request = Request::new("svc", RequestType::Service);
    request.instances = Some(instances);
    request.load_balanced = load_balanced;
    store
        .put_request(&RequestWithState::new(request, RequestState::Active, now))
        .unwrap();

    let mut deploy = Deploy::new("svc", "d1");
    deploy.deploy_instance_count_per_step = Some(per_step);
    deploy.deploy_step_wait_time_ms = Some(0);
    store.put_deploy(&deploy).unwrap();
    store.put_deploy(&Deploy::new("svc", "d0")).unwrap();

    let old = DeployMarker::new("svc", "d0", 0, None);
    let marker = DeployMarker::new("svc", "d1", now, Some("alice".to_string()));
    store
        .put_request_deploy_state(&RequestDeployState {
            request_id: "svc".to_string(),
            active_deploy: Some(old),
            pending_deploy: Some(marker.clone()),
        })
        .unwrap();
    store
        .put_pending_deploy(&PendingDeploy {
            deploy_marker: marker.clone(),
            last_load_balancer_update: None,
            current_deploy_state: DeployState::Waiting,
            deploy_progress: Some(DeployProgress {
                target_active_instances: per_step,
                current_active_instances: 0,
                deploy_instance_count_per_step: per_step,
                deploy_step_wait_time_ms: 0,
                step_complete: false,
                auto_advance_deploy_steps: true,
                failed_deploy_tasks: BTreeSet::new(),
                timestamp: now,
            }),
            updated_request: None,
        })
        .unwrap();

    for n in 1..=instances {
        put_task(&store, "d0", n, TaskState::Running, TaskHealth::Healthy);
    }
    Fixture { store, marker }
}

fn put_task(store: &StateStore, deploy_id: &str, instance_no: u32, state: TaskState, health: TaskHealth) -> TaskId {
    let task_id = TaskId {
        request_id: "svc".to_string(),
        deploy_id: deploy_id.to_string(),
        started_at: 100,
        instance_no,
        host: format!("node-{instance_no}.example"),
        agent_id: format!("agent-{instance_no}"),
    };
    store
        .put_task(&Task {
            task_id: task_id.clone(),
            pending_task_id: PendingTaskId::new("svc", deploy_id, 50, instance_no, PendingType::NewDeploy, 10),
            state,
            health,
            healthchecks_finished: false,
            startup_healthchecks: 0,
            resources: Resources::new(1.0, 64.0, 0.0),
            executor_resources: Resources::EMPTY,
            offer_ids: Vec::new(),
            run_id: None,
            command_line_args: None,
        })
        .unwrap();
    task_id
}

/// Give d1 a 60s health deadline and start its current step two minutes ago.
fn make_overdue(store: &StateStore) {
    let mut deploy = store.get_deploy("svc", "d1").unwrap().unwrap();
    deploy.deploy_health_timeout_secs = Some(60);
    store.put_deploy(&deploy).unwrap();

    let mut pending = store.get_pending_deploy("svc").unwrap().unwrap();
    if let Some(progress) = pending.deploy_progress.as_mut() {
        progress.timestamp = epoch_millis() - 120_000;
    }
    store.put_pending_deploy(&pending).unwrap();
}

fn checker_with(
    store: &StateStore,
    config: KeelConfig,
    lb: Arc<dyn LoadBalancerClient>,
    health: Arc<dyn DeployHealthChecker>,
) -> DeployChecker {
    DeployChecker::new(config, store.clone(), Arc::new(LocalRequestLock::new()), lb, health)
}

fn checker(store: &StateStore) -> DeployChecker {
    checker_with(
        store,
        KeelConfig::default(),
        Arc::new(DisabledLoadBalancer),
        Arc::new(TaskHealthChecker::new(store.clone())),
    )
}

fn pending_types(store: &StateStore, deploy_id: &str) -> Vec<PendingType> {
    store
        .list_pending_requests_for_request("svc")
        .unwrap()
        .into_iter()
        .filter(|p| p.deploy_id == deploy_id)
        .map(|p| p.pending_type)
        .collect()
}

#[tokio::test]
async fn single_step_healthy_deploy_succeeds() {
    let Fixture { store, marker } = fixture(3, 3, false);
    let new_tasks: Vec<TaskId> = (1..=3)
        .map(|n| put_task(&store, "d1", n, TaskState::Running, TaskHealth::Healthy))
        .collect();

    assert_eq!(checker(&store).check_deploys().await.unwrap(), 1);

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Succeeded);
    assert!(store.get_pending_deploy("svc").unwrap().is_none());

    let state = store.get_request_deploy_state("svc").unwrap().unwrap();
    assert_eq!(state.active_deploy.map(|m| m.deploy_id), Some(marker.deploy_id));
    assert!(state.pending_deploy.is_none());

    let cleanups = store.list_task_cleanups().unwrap();
    assert!(cleanups.iter().all(|c| !new_tasks.contains(&c.task_id)));
    assert_eq!(cleanups.len(), 3);
    assert!(
        cleanups
            .iter()
            .all(|c| c.task_id.deploy_id == "d0" && c.cleanup_type == TaskCleanupType::NewDeploySucceeded)
    );
    assert!(store.list_pending_requests().unwrap().is_empty());
}

#[tokio::test]
async fn failed_tasks_retry_within_budget_then_fail() {
    let Fixture { store, .. } = fixture(4, 4, false);
    let mut deploy = store.get_deploy("svc", "d1").unwrap().unwrap();
    deploy.max_task_retries = Some(1);
    store.put_deploy(&deploy).unwrap();

    let first = put_task(&store, "d1", 1, TaskState::Failed, TaskHealth::Unknown);
    put_task(&store, "d1", 2, TaskState::Running, TaskHealth::Unknown);
    put_task(&store, "d1", 3, TaskState::Running, TaskHealth::Unknown);
    put_task(&store, "d1", 4, TaskState::Running, TaskHealth::Unknown);

    let checker = checker(&store);
    checker.check_deploys().await.unwrap();

    let pending = store.get_pending_deploy("svc").unwrap().unwrap();
    assert_eq!(pending.current_deploy_state, DeployState::Waiting);
    let progress = pending.deploy_progress.unwrap();
    assert!(progress.failed_deploy_tasks.contains(&first));
    assert_eq!(pending_types(&store, "d1"), vec![PendingType::NextDeployStep]);
    assert!(store.get_deploy_result("svc", "d1").unwrap().is_none());

    // A second failure exceeds the budget of one retry.
    put_task(&store, "d1", 2, TaskState::Lost, TaskHealth::Unknown);
    checker.check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Failed);
    assert_eq!(result.message.as_deref(), Some("1 task(s) for this deploy failed"));
    assert_eq!(result.deploy_failures.len(), 2);
    assert!(
        result
            .deploy_failures
            .iter()
            .all(|f| f.reason == DeployFailureReason::TaskFailedOnStartup)
    );
    assert!(store.get_pending_deploy("svc").unwrap().is_none());

    // The previous deploy stays active and is asked to reconcile.
    let state = store.get_request_deploy_state("svc").unwrap().unwrap();
    assert_eq!(state.active_deploy.map(|m| m.deploy_id).as_deref(), Some("d0"));
    assert_eq!(pending_types(&store, "d0"), vec![PendingType::DeployFailed]);

    let cleanups = store.list_task_cleanups().unwrap();
    assert_eq!(cleanups.len(), 2);
    assert!(cleanups.iter().all(|c| c.cleanup_type == TaskCleanupType::DeployFailed));
}

#[tokio::test]
async fn cancel_request_cancels_rollout() {
    let Fixture { store, marker } = fixture(2, 2, false);
    put_task(&store, "d1", 1, TaskState::Starting, TaskHealth::Unknown);
    store
        .put_cancel_deploy(&DeployMarker::new("svc", "d1", 777, Some("bob".to_string())))
        .unwrap();

    checker(&store).check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Canceled);
    assert_eq!(result.message.as_deref(), Some("Canceled due to request by bob at 777"));

    assert!(store.list_cancel_deploys().unwrap().is_empty());
    assert!(store.get_pending_deploy(&marker.request_id).unwrap().is_none());
    assert!(pending_types(&store, "d1").is_empty());
    assert!(store.list_pending_task_ids_for_request("svc").unwrap().is_empty());
    assert_eq!(pending_types(&store, "d0"), vec![PendingType::DeployCancelled]);

    let cleanups = store.list_task_cleanups().unwrap();
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].cleanup_type, TaskCleanupType::DeployCanceled);
    assert_eq!(cleanups[0].task_id.deploy_id, "d1");
}

#[tokio::test]
async fn failed_load_balancer_update_fails_deploy() {
    let Fixture { store, .. } = fixture(2, 2, true);
    let new_tasks: Vec<TaskId> = (1..=2)
        .map(|n| put_task(&store, "d1", n, TaskState::Running, TaskHealth::Healthy))
        .collect();
    // Old tasks are currently registered with the load balancer.
    let old_tasks: Vec<TaskId> = store
        .list_active_tasks_for_request("svc")
        .unwrap()
        .into_iter()
        .map(|t| t.task_id)
        .filter(|t| t.deploy_id == "d0")
        .collect();
    let registered = LoadBalancerUpdate::new(
        LoadBalancerState::Success,
        LoadBalancerRequestId::new("svc-d0-2", LoadBalancerRequestType::Deploy),
        None,
        1,
    );
    for task_id in &old_tasks {
        store
            .save_load_balancer_state(task_id, LoadBalancerRequestType::Add, &registered)
            .unwrap();
    }

    let mut config = KeelConfig::default();
    config.load_balancer.uri = Some("http://lb.example/api".to_string());
    let lb = Arc::new(ScriptedLb::new(LoadBalancerState::Failed));
    let checker = checker_with(&store, config, lb.clone(), Arc::new(TaskHealthChecker::new(store.clone())));
    checker.check_deploys().await.unwrap();

    assert_eq!(*lb.enqueued.lock().unwrap(), vec![("svc-d1-2".to_string(), 2, 2)]);

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Failed);
    assert!(
        result
            .deploy_failures
            .iter()
            .any(|f| f.reason == DeployFailureReason::LoadBalancerUpdateFailed)
    );

    // No task is left with a pre-enqueue marker.
    for task_id in &new_tasks {
        let add = store
            .get_load_balancer_state(task_id, LoadBalancerRequestType::Add)
            .unwrap()
            .unwrap();
        assert_eq!(add.state, LoadBalancerState::Failed);
        assert!(store.get_task(task_id).unwrap().unwrap().healthchecks_finished);
    }
    for task_id in &old_tasks {
        let remove = store
            .get_load_balancer_state(task_id, LoadBalancerRequestType::Remove)
            .unwrap()
            .unwrap();
        assert_eq!(remove.state, LoadBalancerState::Failed);
    }
}

#[tokio::test]
async fn load_balanced_deploy_without_uri_fails() {
    let Fixture { store, .. } = fixture(1, 1, true);
    put_task(&store, "d1", 1, TaskState::Running, TaskHealth::Healthy);

    checker(&store).check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Failed);
    assert_eq!(result.message.as_deref(), Some("No valid load balancer URI was present"));
}

#[tokio::test]
async fn canary_target_only_grows() {
    let Fixture { store, .. } = fixture(3, 1, false);
    put_task(&store, "d1", 1, TaskState::Running, TaskHealth::Healthy);
    let checker = checker(&store);

    let target = |store: &StateStore| {
        let progress = store
            .get_pending_deploy("svc")
            .unwrap()
            .unwrap()
            .deploy_progress
            .unwrap();
        (progress.target_active_instances, progress.step_complete)
    };

    // Step 1 healthy: step completes, one old task is retired.
    checker.check_deploys().await.unwrap();
    assert_eq!(target(&store), (1, true));
    let cleanups = store.list_task_cleanups().unwrap();
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].cleanup_type, TaskCleanupType::DeployStepFinished);
    assert_eq!(cleanups[0].task_id.instance_no, 1);

    // Step wait is zero; the next check advances once the clock moves.
    tokio::time::sleep(Duration::from_millis(5)).await;
    checker.check_deploys().await.unwrap();
    assert_eq!(target(&store), (2, false));
    assert_eq!(pending_types(&store, "d1"), vec![PendingType::NextDeployStep]);

    // Short of instances: waits at the same target.
    checker.check_deploys().await.unwrap();
    assert_eq!(target(&store), (2, false));
    assert!(store.get_deploy_result("svc", "d1").unwrap().is_none());
}

#[tokio::test]
async fn missing_request_fails_and_removes_deploy() {
    let Fixture { store, .. } = fixture(1, 1, false);
    store.delete_request("svc").unwrap();

    checker(&store).check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Failed);
    assert_eq!(result.message.as_deref(), Some("Request in state DELETED is not deployable"));
    assert!(store.get_pending_deploy("svc").unwrap().is_none());
    // Nothing beyond the result is finalized.
    let state = store.get_request_deploy_state("svc").unwrap().unwrap();
    assert!(state.pending_deploy.is_some());
}

#[tokio::test]
async fn paused_request_fails_deploy() {
    let Fixture { store, .. } = fixture(1, 1, false);
    let mut request = store.get_request("svc").unwrap().unwrap();
    request.state = RequestState::Paused;
    store.put_request(&request).unwrap();

    checker(&store).check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.message.as_deref(), Some("Request in state PAUSED is not deployable"));
    let state = store.get_request_deploy_state("svc").unwrap().unwrap();
    assert!(state.pending_deploy.is_none());
    assert_eq!(state.active_deploy.map(|m| m.deploy_id).as_deref(), Some("d0"));
    // Paused requests are not asked to reconcile their old deploy.
    assert!(pending_types(&store, "d0").is_empty());
}

#[tokio::test]
async fn evaluation_error_becomes_internal_failure() {
    let Fixture { store, .. } = fixture(1, 1, false);
    put_task(&store, "d1", 1, TaskState::Running, TaskHealth::Healthy);

    let checker = checker_with(
        &store,
        KeelConfig::default(),
        Arc::new(DisabledLoadBalancer),
        Arc::new(BrokenHealth),
    );
    checker.check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::FailedInternalState);
    let message = result.message.unwrap();
    assert!(message.starts_with("Uncaught exception:"), "{message}");
    assert!(message.contains("disk gone"));
    assert!(store.get_pending_deploy("svc").unwrap().is_none());
}

#[tokio::test]
async fn nothing_pending_checks_nothing() {
    let store = StateStore::open_in_memory().unwrap();
    assert_eq!(checker(&store).check_deploys().await.unwrap(), 0);
}

#[tokio::test]
async fn overdue_deploy_reports_shortfall_and_cleans_up() {
    let Fixture { store, marker } = fixture(2, 2, false);
    let launched = put_task(&store, "d1", 1, TaskState::Running, TaskHealth::Healthy);
    make_overdue(&store);

    checker(&store).check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Overdue);
    assert_eq!(
        result.message.as_deref(),
        Some("Deploy was able to launch 1 tasks, but not all of them became healthy within 1m 0s")
    );
    assert!(result.deploy_failures.iter().any(|f| {
        f.reason == DeployFailureReason::TaskCouldNotBeScheduled
            && f.message.as_deref() == Some("1 of 2 tasks could not be scheduled")
    }));

    assert!(store.get_pending_deploy(&marker.request_id).unwrap().is_none());
    let state = store.get_request_deploy_state("svc").unwrap().unwrap();
    assert!(state.pending_deploy.is_none());
    assert_eq!(state.active_deploy.map(|m| m.deploy_id), Some("d0".to_string()));
    assert_eq!(pending_types(&store, "d0"), vec![PendingType::DeployFailed]);

    let cleanups = store.list_task_cleanups().unwrap();
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].task_id, launched);
    assert_eq!(cleanups[0].cleanup_type, TaskCleanupType::DeployOverdue);
}

#[tokio::test]
async fn overdue_load_balanced_deploy_cancels_then_collects_cancel() {
    let Fixture { store, .. } = fixture(2, 2, true);
    let launched = put_task(&store, "d1", 1, TaskState::Running, TaskHealth::Healthy);
    make_overdue(&store);

    let lb_id = LoadBalancerRequestId::new("svc-d1-2", LoadBalancerRequestType::Deploy);
    let mut pending = store.get_pending_deploy("svc").unwrap().unwrap();
    pending.last_load_balancer_update = Some(LoadBalancerUpdate::new(
        LoadBalancerState::Waiting,
        lb_id.clone(),
        None,
        epoch_millis(),
    ));
    store.put_pending_deploy(&pending).unwrap();

    let lb = Arc::new(ScriptedLb::new(LoadBalancerState::Canceling));
    let checker = checker_with(
        &store,
        KeelConfig::default(),
        lb.clone(),
        Arc::new(TaskHealthChecker::new(store.clone())),
    );

    // First pass: the in-flight LB request is canceled and the deploy parks.
    let result = checker.check_deploy(pending, &[], &[]).await.unwrap();
    assert_eq!(result.deploy_state, DeployState::Canceling);
    assert_eq!(result.lb_update.as_ref().map(|u| u.state), Some(LoadBalancerState::Canceling));
    assert!(
        result
            .deploy_failures
            .iter()
            .any(|f| f.reason == DeployFailureReason::TaskCouldNotBeScheduled)
    );
    assert!(lb.enqueued.lock().unwrap().is_empty());

    let parked = store.get_pending_deploy("svc").unwrap().unwrap();
    assert_eq!(parked.current_deploy_state, DeployState::Canceling);
    assert_eq!(
        parked.last_load_balancer_update.map(|u| u.load_balancer_request_id.id),
        Some(lb_id.id.clone())
    );
    assert!(store.get_deploy_result("svc", "d1").unwrap().is_none());
    assert!(store.list_task_cleanups().unwrap().is_empty());

    // Second pass: the LB reports the cancel done and the deploy finishes.
    *lb.state.lock().unwrap() = LoadBalancerState::Canceled;
    checker.check_deploys().await.unwrap();

    let result = store.get_deploy_result("svc", "d1").unwrap().unwrap();
    assert_eq!(result.deploy_state, DeployState::Canceled);
    assert!(
        result
            .deploy_failures
            .iter()
            .any(|f| f.reason == DeployFailureReason::LoadBalancerUpdateFailed)
    );
    assert!(store.get_pending_deploy("svc").unwrap().is_none());
    assert_eq!(pending_types(&store, "d0"), vec![PendingType::DeployCancelled]);

    let add = store
        .get_load_balancer_state(&launched, LoadBalancerRequestType::Add)
        .unwrap()
        .unwrap();
    assert_eq!(add.state, LoadBalancerState::Canceled);

    let cleanups = store.list_task_cleanups().unwrap();
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].task_id, launched);
    assert_eq!(cleanups[0].cleanup_type, TaskCleanupType::DeployCanceled);
}
