//! Deploy health contract and the store-backed checker.

use keel_state::{
    Deploy, DeployFailure, DeployFailureReason, Request, StateStore, TaskHealth, TaskId, TaskState,
};
use serde::{Deserialize, Serialize};

use crate::error::RolloutResult;

/// Aggregate health of a deploy's active tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployHealth {
    Waiting,
    Healthy,
    Unhealthy,
}

pub trait DeployHealthChecker: Send + Sync {
    fn deploy_health(
        &self,
        request: &Request,
        deploy: Option<&Deploy>,
        active_tasks: &[TaskId],
    ) -> RolloutResult<DeployHealth>;

    /// Per-task failure details for tasks that kept a deploy from finishing.
    fn task_failures(
        &self,
        request: &Request,
        deploy: Option<&Deploy>,
        tasks: &[TaskId],
    ) -> RolloutResult<Vec<DeployFailure>>;
}

/// Reads task state and health-check results from the state store.
#[derive(Clone)]
pub struct TaskHealthChecker {
    store: StateStore,
}

impl TaskHealthChecker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

fn skip_healthchecks(request: &Request, deploy: Option<&Deploy>) -> bool {
    deploy
        .and_then(|d| d.skip_healthchecks_on_deploy)
        .or(request.skip_healthchecks)
        .unwrap_or(false)
}

impl DeployHealthChecker for TaskHealthChecker {
    fn deploy_health(
        &self,
        request: &Request,
        deploy: Option<&Deploy>,
        active_tasks: &[TaskId],
    ) -> RolloutResult<DeployHealth> {
        let skip = skip_healthchecks(request, deploy);
        let mut waiting = false;

        for task_id in active_tasks {
            let Some(task) = self.store.get_task(task_id)? else {
                waiting = true;
                continue;
            };
            if !task.is_active() {
                return Ok(DeployHealth::Unhealthy);
            }
            if task.state != TaskState::Running {
                waiting = true;
                continue;
            }
            if skip {
                continue;
            }
            match task.health {
                TaskHealth::Healthy => {}
                TaskHealth::Unhealthy => return Ok(DeployHealth::Unhealthy),
                TaskHealth::Unknown => waiting = true,
            }
        }

        Ok(if waiting {
            DeployHealth::Waiting
        } else {
            DeployHealth::Healthy
        })
    }

    fn task_failures(
        &self,
        request: &Request,
        deploy: Option<&Deploy>,
        tasks: &[TaskId],
    ) -> RolloutResult<Vec<DeployFailure>> {
        let skip = skip_healthchecks(request, deploy);
        let mut failures = Vec::new();

        for task_id in tasks {
            let failure = match self.store.get_task(task_id)? {
                None => Some((DeployFailureReason::TaskNeverEnteredRunning, "task record missing".to_string())),
                Some(task) if !task.is_active() => Some((
                    DeployFailureReason::TaskFailedOnStartup,
                    format!("task ended in state {:?}", task.state),
                )),
                Some(task) if task.state != TaskState::Running => Some((
                    DeployFailureReason::TaskNeverEnteredRunning,
                    format!("task still {:?}", task.state),
                )),
                Some(task) if task.health == TaskHealth::Unhealthy => Some((
                    DeployFailureReason::TaskFailedHealthChecks,
                    "health checks failed".to_string(),
                )),
                Some(task) if task.health == TaskHealth::Unknown && !skip => Some((
                    DeployFailureReason::TaskFailedHealthChecks,
                    "health checks did not pass in time".to_string(),
                )),
                Some(_) => None,
            };
            if let Some((reason, message)) = failure {
                failures.push(DeployFailure::new(reason, Some(task_id.clone()), Some(message)));
            }
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Resources;
    use keel_state::{PendingTaskId, PendingType, RequestType, Task};

    fn put_task(store: &StateStore, instance_no: u32, state: TaskState, health: TaskHealth) -> TaskId {
        let pending = PendingTaskId::new("svc", "d1", 1, instance_no, PendingType::NewDeploy, 1);
        let task_id = TaskId {
            request_id: "svc".to_string(),
            deploy_id: "d1".to_string(),
            started_at: 5,
            instance_no,
            host: "h".to_string(),
            agent_id: "a".to_string(),
        };
        store
            .put_task(&Task {
                task_id: task_id.clone(),
                pending_task_id: pending,
                state,
                health,
                healthchecks_finished: false,
                startup_healthchecks: 0,
                resources: Resources::EMPTY,
                executor_resources: Resources::EMPTY,
                offer_ids: Vec::new(),
                run_id: None,
                command_line_args: None,
            })
            .unwrap();
        task_id
    }

    #[test]
    fn health_aggregation() {
        let store = StateStore::open_in_memory().unwrap();
        let checker = TaskHealthChecker::new(store.clone());
        let request = Request::new("svc", RequestType::Service);

        let healthy = put_task(&store, 1, TaskState::Running, TaskHealth::Healthy);
        let starting = put_task(&store, 2, TaskState::Starting, TaskHealth::Unknown);
        let sick = put_task(&store, 3, TaskState::Running, TaskHealth::Unhealthy);

        let health = |tasks: &[TaskId]| checker.deploy_health(&request, None, tasks).unwrap();
        assert_eq!(health(&[healthy.clone()]), DeployHealth::Healthy);
        assert_eq!(health(&[healthy.clone(), starting.clone()]), DeployHealth::Waiting);
        assert_eq!(health(&[starting.clone(), sick.clone()]), DeployHealth::Unhealthy);

        let failures = checker.task_failures(&request, None, &[healthy, starting, sick]).unwrap();
        let reasons: Vec<_> = failures.iter().map(|f| f.reason).collect();
        assert_eq!(
            reasons,
            vec![
                DeployFailureReason::TaskNeverEnteredRunning,
                DeployFailureReason::TaskFailedHealthChecks
            ]
        );
    }

    #[test]
    fn skipped_healthchecks_only_need_running() {
        let store = StateStore::open_in_memory().unwrap();
        let checker = TaskHealthChecker::new(store.clone());
        let mut deploy = Deploy::new("svc", "d1");
        deploy.skip_healthchecks_on_deploy = Some(true);
        let request = Request::new("svc", RequestType::Service);

        let running = put_task(&store, 1, TaskState::Running, TaskHealth::Unknown);
        assert_eq!(
            checker.deploy_health(&request, Some(&deploy), &[running.clone()]).unwrap(),
            DeployHealth::Healthy
        );
        assert_eq!(
            checker.deploy_health(&request, None, &[running]).unwrap(),
            DeployHealth::Waiting
        );
    }
}
