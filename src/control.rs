//! Request/response surface over the orchestration components.
//!
//! Requests are plain serde values so any transport (a socket, an admin API,
//! a test) can drive the core. One JSON object per line is the wire form
//! used by [`Controller::handle_line`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordination::{HeldLock, LockStats, RandomSelector, RateLimitEntry};
use crate::dispatcher::{CampaignTaskSpec, Dispatcher, Pacing, TaskId, TaskProgress};
use crate::distribution::{DistributionScheduler, ScheduleReport};
use crate::model::{IdentityId, PostId};
use crate::reconciler::{ReconcileMode, ReconcileReport, Reconciler};
use crate::runner::ActionRunner;

/// Request to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Check the controller is alive.
    Ping,
    /// Launch a campaign task.
    StartTask { spec: CampaignTaskSpec },
    /// Cancel a running task.
    CancelTask { id: String },
    /// Cancel every running task.
    CancelAllTasks,
    /// Progress of one task.
    TaskStatus { id: String },
    /// Progress of all running tasks.
    ListTasks,
    /// Run one reconciliation pass.
    Reconcile { mode: ReconcileMode },
    /// Hand a post to the distribution scheduler.
    SchedulePost { post: u64 },
    /// Currently held identity locks.
    LockStatus,
    /// Active rate-limit blocks.
    RateLimits,
    /// Lift every block on an identity.
    ClearRateLimit { identity: String },
}

/// Response from the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Pong,
    TaskStarted { id: TaskId },
    Task(TaskProgress),
    Tasks(Vec<TaskProgress>),
    Reconciled(ReconcileReport),
    Scheduled(ScheduleReport),
    Locks {
        held: Vec<LockInfo>,
        acquired_total: u64,
        contended_total: u64,
    },
    RateLimits(Vec<RateLimitEntry>),
    Cleared { identity: IdentityId, removed: usize },
    Error { message: String },
}

/// Serializable view of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub identity: IdentityId,
    pub purpose: String,
    pub held_ms: u64,
}

impl From<&HeldLock> for LockInfo {
    fn from(lock: &HeldLock) -> Self {
        Self {
            identity: lock.identity.clone(),
            purpose: lock.purpose.clone(),
            held_ms: lock.held_for().as_millis() as u64,
        }
    }
}

fn error(e: impl std::fmt::Display) -> ControlResponse {
    ControlResponse::Error { message: e.to_string() }
}

/// Maps control requests onto the components.
pub struct Controller {
    runner: ActionRunner,
    dispatcher: Dispatcher,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<DistributionScheduler>,
}

impl Controller {
    pub fn new(
        runner: ActionRunner,
        dispatcher: Dispatcher,
        reconciler: Arc<Reconciler>,
        scheduler: Arc<DistributionScheduler>,
    ) -> Self {
        Self {
            runner,
            dispatcher,
            reconciler,
            scheduler,
        }
    }

    /// Build every component around `runner` from the loaded configuration.
    pub fn from_config(config: &Config, runner: ActionRunner) -> Self {
        let selector = Arc::new(RandomSelector::from_seed(config.seed));
        let dispatcher = Dispatcher::with_pacing(runner.clone(), selector.clone(), Pacing::from(&config.pacing));
        let reconciler = Reconciler::new(runner.clone(), selector.clone(), config.reconciler.clone());
        let scheduler = DistributionScheduler::new(runner.clone(), selector, config.scheduler.clone());
        Self::new(runner, dispatcher, Arc::new(reconciler), Arc::new(scheduler))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Start periodic reconciliation at the reconciler's configured interval.
    pub fn spawn_sweeps(&self, mode: ReconcileMode) -> JoinHandle<()> {
        let interval = self.reconciler.settings().interval();
        log::info!("Reconciling ({:?}) every {:?}", mode, interval);
        Arc::clone(&self.reconciler).spawn_periodic(mode, interval)
    }

    /// Stop sweeps and waiting slots, cancel tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.reconciler.shutdown();
        self.scheduler.cancel();
        self.dispatcher.shutdown().await;
        self.scheduler.drain().await;
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Ping => ControlResponse::Pong,

            ControlRequest::StartTask { spec } => match self.dispatcher.start(spec) {
                Ok(id) => ControlResponse::TaskStarted { id },
                Err(e) => error(e),
            },

            ControlRequest::CancelTask { id } => {
                match id.parse::<TaskId>().and_then(|id| self.dispatcher.cancel(id)) {
                    Ok(progress) => ControlResponse::Task(progress),
                    Err(e) => error(e),
                }
            }

            ControlRequest::CancelAllTasks => ControlResponse::Tasks(self.dispatcher.cancel_all()),

            ControlRequest::TaskStatus { id } => {
                match id.parse::<TaskId>().and_then(|id| self.dispatcher.status(id)) {
                    Ok(progress) => ControlResponse::Task(progress),
                    Err(e) => error(e),
                }
            }

            ControlRequest::ListTasks => ControlResponse::Tasks(self.dispatcher.list()),

            ControlRequest::Reconcile { mode } => match self.reconciler.run(mode).await {
                Ok(report) => ControlResponse::Reconciled(report),
                Err(e) => error(e),
            },

            ControlRequest::SchedulePost { post } => match self.scheduler.schedule_post(PostId(post)).await {
                Ok(report) => ControlResponse::Scheduled(report),
                Err(e) => error(e),
            },

            ControlRequest::LockStatus => {
                let locks = self.runner.locks();
                let LockStats {
                    acquired_total,
                    contended_total,
                    ..
                } = locks.stats();
                ControlResponse::Locks {
                    held: locks.snapshot().iter().map(LockInfo::from).collect(),
                    acquired_total,
                    contended_total,
                }
            }

            ControlRequest::RateLimits => ControlResponse::RateLimits(self.runner.ledger().entries().await),

            ControlRequest::ClearRateLimit { identity } => {
                let identity = IdentityId::new(identity);
                match self.runner.ledger().clear(&identity).await {
                    Ok(removed) => ControlResponse::Cleared { identity, removed },
                    Err(e) => error(e),
                }
            }
        }
    }

    /// Handle one JSON-encoded request and return the JSON-encoded response.
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => error(format!("invalid request: {}", e)),
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|e| format!(r#"{{"Error":{{"message":"failed to encode response: {}"}}}}"#, e))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::config::{PacingSettings, ReconcilerSettings, SchedulerSettings};
    use crate::model::{Campaign, CampaignId};
    use crate::store::Store;
    use crate::coordination::{LimitKind, OrderedSelector};
    use crate::dispatcher::{Pacing, TaskPlan, TaskState};
    use crate::model::{ActionKind, ResourceRef};
    use crate::runner::testing::*;

    fn controller(h: &Harness) -> Controller {
        let selector = Arc::new(OrderedSelector);
        Controller::new(
            h.runner.clone(),
            Dispatcher::new(h.runner.clone(), selector.clone()),
            Arc::new(Reconciler::new(
                h.runner.clone(),
                selector.clone(),
                ReconcilerSettings::default(),
            )),
            Arc::new(DistributionScheduler::new(
                h.runner.clone(),
                selector,
                SchedulerSettings::default(),
            )),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_lifecycle_through_controller() {
        let h = harness(1);
        let controller = controller(&h);
        let spec = CampaignTaskSpec {
            name: "leave".to_string(),
            action: ActionKind::Leave,
            payload: None,
            pairs: TaskPlan::rotate(&[IdentityId::new("acc-0")], &[ResourceRef::new("a"), ResourceRef::new("b")]),
            pacing: Some(Pacing::fixed(Duration::from_secs(3600))),
        };

        let ControlResponse::TaskStarted { id } = controller.handle(ControlRequest::StartTask { spec }).await else {
            panic!("task did not start");
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        match controller.handle(ControlRequest::ListTasks).await {
            ControlResponse::Tasks(tasks) => assert_eq!(tasks.len(), 1),
            other => panic!("unexpected response: {:?}", other),
        }

        match controller
            .handle(ControlRequest::CancelTask { id: id.to_string() })
            .await
        {
            ControlResponse::Task(progress) => {
                assert_eq!(progress.processed, 1);
                assert_eq!(progress.state, TaskState::Cancelled);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        assert!(matches!(
            controller.handle(ControlRequest::TaskStatus { id: id.to_string() }).await,
            ControlResponse::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_requests() {
        let h = harness(1);
        let controller = controller(&h);
        let identity = IdentityId::new("acc-0");
        h.runner
            .ledger()
            .mark_blocked(&identity, LimitKind::FloodBan, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        match controller.handle(ControlRequest::RateLimits).await {
            ControlResponse::RateLimits(entries) => assert_eq!(entries.len(), 1),
            other => panic!("unexpected response: {:?}", other),
        }

        match controller
            .handle(ControlRequest::ClearRateLimit {
                identity: "acc-0".to_string(),
            })
            .await
        {
            ControlResponse::Cleared { removed, .. } => assert_eq!(removed, 1),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(h.runner.ledger().entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_status_reports_holders() {
        let h = harness(1);
        let controller = controller(&h);
        let _lease = h.runner.locks().acquire_for(&IdentityId::new("acc-0"), "join chan/1").unwrap();

        match controller.handle(ControlRequest::LockStatus).await {
            ControlResponse::Locks { held, acquired_total, .. } => {
                assert_eq!(held.len(), 1);
                assert_eq!(held[0].purpose, "join chan/1");
                assert_eq!(acquired_total, 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_line_round_trip() {
        let h = harness(1);
        let controller = controller(&h);

        let pong = controller.handle_line(r#""Ping""#).await;
        assert!(matches!(
            serde_json::from_str::<ControlResponse>(&pong).unwrap(),
            ControlResponse::Pong
        ));

        let bad = controller.handle_line("{not json").await;
        assert!(matches!(
            serde_json::from_str::<ControlResponse>(&bad).unwrap(),
            ControlResponse::Error { .. }
        ));

        let bogus = controller.handle_line(r#"{"TaskStatus":{"id":"task-x"}}"#).await;
        match serde_json::from_str::<ControlResponse>(&bogus).unwrap() {
            ControlResponse::Error { message } => assert_eq!(message, "invalid task id: task-x"),
            other => panic!("unexpected response: {:?}", other),
        }

        let missing = controller.handle_line(r#"{"SchedulePost":{"post":404}}"#).await;
        match serde_json::from_str::<ControlResponse>(&missing).unwrap() {
            ControlResponse::Error { message } => assert!(message.contains("post-404")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    fn configured(h: &Harness) -> Controller {
        let config = Config {
            seed: Some(5),
            pacing: PacingSettings {
                min_delay_secs: 40,
                max_delay_secs: 40,
            },
            reconciler: ReconcilerSettings {
                join_delay_min_ms: 0,
                join_delay_max_ms: 0,
                interval_secs: 300,
                ..Default::default()
            },
            ..Default::default()
        };
        Controller::from_config(&config, h.runner.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_pacing_is_task_default() {
        let h = harness(1);
        let controller = configured(&h);
        assert_eq!(controller.dispatcher().default_pacing(), Pacing::fixed(Duration::from_secs(40)));

        let spec = CampaignTaskSpec {
            name: "views".to_string(),
            action: ActionKind::View,
            payload: None,
            pairs: TaskPlan::rotate(&[IdentityId::new("acc-0")], &[ResourceRef::new("a"), ResourceRef::new("b")]),
            pacing: None,
        };
        let ControlResponse::TaskStarted { id } = controller.handle(ControlRequest::StartTask { spec }).await else {
            panic!("task did not start");
        };

        tokio::time::sleep(Duration::from_secs(39)).await;
        assert_eq!(h.executor.calls().len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.executor.calls().len(), 2);
        assert!(matches!(
            controller.handle(ControlRequest::TaskStatus { id: id.to_string() }).await,
            ControlResponse::Error { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_run_at_configured_interval() {
        let h = harness(6);
        let campaign = |target| Campaign {
            id: CampaignId(1),
            name: "sweeps".to_string(),
            resource: Some(ResourceRef::new("chan/1")),
            target_participants: target,
            active: true,
        };
        h.store.put_campaign(campaign(2));
        let controller = configured(&h);
        let sweeps = controller.spawn_sweeps(ReconcileMode::Activation);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.store.participation_count(CampaignId(1)).await.unwrap(), 2);

        h.store.put_campaign(campaign(4));
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(h.store.participation_count(CampaignId(1)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(h.store.participation_count(CampaignId(1)).await.unwrap(), 4);

        controller.shutdown().await;
        sweeps.await.unwrap();
    }
}
