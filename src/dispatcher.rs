//! Registry of long-running campaign tasks.
//!
//! A task walks a list of (identity, resource) pairs, performing one action
//! per pair through the shared action path and pausing between steps. Tasks
//! run independently, publish progress on a watch channel and stop at their
//! next pause once cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PacingSettings;
use crate::coordination::{Selector, sleep_cancellable};
use crate::error::{Error, Result};
use crate::model::{ActionKind, ActionSpec, IdentityId, ResourceRef};
use crate::runner::{ActionRunner, Attempt, FailureKind, SkipReason};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("task-").unwrap_or(s);
        digits
            .parse()
            .map(TaskId)
            .map_err(|_| Error::InvalidTaskId { id: s.to_string() })
    }
}

/// Bounds of the pause between consecutive steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pacing {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Pacing {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min_delay: delay,
            max_delay: delay,
        }
    }
}

impl From<&PacingSettings> for Pacing {
    fn from(settings: &PacingSettings) -> Self {
        Self {
            min_delay: settings.min_delay(),
            max_delay: settings.max_delay(),
        }
    }
}

/// One step of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPair {
    pub identity: IdentityId,
    pub resource: ResourceRef,
}

impl TaskPair {
    pub fn new(identity: IdentityId, resource: ResourceRef) -> Self {
        Self { identity, resource }
    }
}

/// Builds pair lists for tasks.
pub struct TaskPlan;

impl TaskPlan {
    /// Pair identities and resources round-robin until the longer list is exhausted.
    pub fn rotate(identities: &[IdentityId], resources: &[ResourceRef]) -> Vec<TaskPair> {
        if identities.is_empty() || resources.is_empty() {
            return Vec::new();
        }
        let steps = identities.len().max(resources.len());
        (0..steps)
            .map(|i| {
                TaskPair::new(
                    identities[i % identities.len()].clone(),
                    resources[i % resources.len()].clone(),
                )
            })
            .collect()
    }
}

/// What a task should do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignTaskSpec {
    pub name: String,
    pub action: ActionKind,
    /// Comment text, new link, reaction emoji.
    pub payload: Option<String>,
    pub pairs: Vec<TaskPair>,
    /// Pause between steps; the dispatcher's default when absent.
    #[serde(default)]
    pub pacing: Option<Pacing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Progress snapshot of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub id: TaskId,
    pub name: String,
    pub action: ActionKind,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub state: TaskState,
}

impl TaskProgress {
    fn new(id: TaskId, spec: &CampaignTaskSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            action: spec.action,
            total: spec.pairs.len(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            state: TaskState::Running,
        }
    }

    fn record(&mut self, attempt: &Attempt) {
        self.processed += 1;
        match attempt {
            Attempt::Succeeded(_) => self.succeeded += 1,
            Attempt::Failed(_) => self.failed += 1,
            Attempt::Skipped(_) => self.skipped += 1,
        }
    }
}

struct TaskEntry {
    token: CancellationToken,
    progress: watch::Receiver<TaskProgress>,
}

impl TaskEntry {
    fn cancel(self) -> TaskProgress {
        self.token.cancel();
        let mut snapshot = self.progress.borrow().clone();
        snapshot.state = TaskState::Cancelled;
        snapshot
    }
}

#[derive(Default)]
struct TaskTable {
    next_id: u64,
    tasks: HashMap<TaskId, TaskEntry>,
}

struct Registry {
    runner: ActionRunner,
    selector: Arc<dyn Selector>,
    default_pacing: Pacing,
    token: CancellationToken,
    tracker: TaskTracker,
    table: Mutex<TaskTable>,
}

impl Registry {
    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Starts, tracks and cancels campaign tasks.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(runner: ActionRunner, selector: Arc<dyn Selector>) -> Self {
        Self::with_pacing(runner, selector, Pacing::from(&PacingSettings::default()))
    }

    /// A dispatcher applying `default_pacing` to tasks that set none.
    pub fn with_pacing(runner: ActionRunner, selector: Arc<dyn Selector>, default_pacing: Pacing) -> Self {
        Self {
            inner: Arc::new(Registry {
                runner,
                selector,
                default_pacing,
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                table: Mutex::new(TaskTable::default()),
            }),
        }
    }

    pub fn default_pacing(&self) -> Pacing {
        self.inner.default_pacing
    }

    /// Launch a task and return its id without waiting for any step.
    pub fn start(&self, spec: CampaignTaskSpec) -> Result<TaskId> {
        if self.inner.token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if spec.pairs.is_empty() {
            return Err(Error::Config(format!("task '{}' has no identity/resource pairs", spec.name)));
        }
        let pacing = spec.pacing.unwrap_or(self.inner.default_pacing);
        if pacing.min_delay > pacing.max_delay {
            return Err(Error::Config(format!(
                "task '{}' pacing minimum exceeds maximum",
                spec.name
            )));
        }

        let token = self.inner.token.child_token();
        let (id, tx) = {
            let mut table = self.inner.table();
            table.next_id += 1;
            let id = TaskId(table.next_id);
            let (tx, rx) = watch::channel(TaskProgress::new(id, &spec));
            table.tasks.insert(
                id,
                TaskEntry {
                    token: token.clone(),
                    progress: rx,
                },
            );
            (id, tx)
        };

        log::info!(
            "Starting {} '{}': {} {} steps",
            id,
            spec.name,
            spec.pairs.len(),
            spec.action
        );
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(run_task(inner, id, spec, pacing, token, tx));
        Ok(id)
    }

    /// Cancel one task, returning its progress at the moment of cancellation.
    pub fn cancel(&self, id: TaskId) -> Result<TaskProgress> {
        let entry = self
            .inner
            .table()
            .tasks
            .remove(&id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        log::info!("Cancelling {}", id);
        Ok(entry.cancel())
    }

    /// Cancel every running task.
    pub fn cancel_all(&self) -> Vec<TaskProgress> {
        let entries: Vec<TaskEntry> = self.inner.table().tasks.drain().map(|(_, entry)| entry).collect();
        let mut snapshots: Vec<TaskProgress> = entries.into_iter().map(TaskEntry::cancel).collect();
        snapshots.sort_by_key(|p| p.id);
        if !snapshots.is_empty() {
            log::info!("Cancelled {} tasks", snapshots.len());
        }
        snapshots
    }

    pub fn status(&self, id: TaskId) -> Result<TaskProgress> {
        self.inner
            .table()
            .tasks
            .get(&id)
            .map(|entry| entry.progress.borrow().clone())
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })
    }

    /// Snapshots of live tasks, oldest first.
    pub fn list(&self) -> Vec<TaskProgress> {
        let mut snapshots: Vec<TaskProgress> = self
            .inner
            .table()
            .tasks
            .values()
            .map(|entry| entry.progress.borrow().clone())
            .collect();
        snapshots.sort_by_key(|p| p.id);
        snapshots
    }

    /// Subscribe to a live task's progress. The receiver keeps the final
    /// snapshot after the task finishes.
    pub fn watch(&self, id: TaskId) -> Option<watch::Receiver<TaskProgress>> {
        self.inner.table().tasks.get(&id).map(|entry| entry.progress.clone())
    }

    pub fn running(&self) -> usize {
        self.inner.table().tasks.len()
    }

    /// Cancel everything and wait for all tasks to exit.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();
        self.inner.table().tasks.clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        log::info!("Dispatcher stopped");
    }
}

async fn run_task(
    inner: Arc<Registry>,
    id: TaskId,
    spec: CampaignTaskSpec,
    pacing: Pacing,
    token: CancellationToken,
    progress: watch::Sender<TaskProgress>,
) {
    let mut cancelled = false;

    for (step, pair) in spec.pairs.iter().enumerate() {
        if step > 0 {
            let pause = inner.selector.jitter(pacing.min_delay, pacing.max_delay);
            if !sleep_cancellable(pause, &token).await {
                cancelled = true;
                break;
            }
        }
        if token.is_cancelled() {
            cancelled = true;
            break;
        }

        let mut action = ActionSpec::new(spec.action, pair.resource.clone());
        if let Some(payload) = &spec.payload {
            action = action.with_payload(payload.clone());
        }

        let attempt = match inner.runner.store().identity(&pair.identity).await {
            Ok(Some(identity)) => inner.runner.attempt(&identity, &action).await,
            Ok(None) => {
                log::warn!("{}: identity {} no longer exists", id, pair.identity);
                Attempt::Skipped(SkipReason::Unauthorized)
            }
            Err(e) => {
                log::warn!("{}: lookup of {} failed: {}", id, pair.identity, e);
                Attempt::Failed(FailureKind::Storage)
            }
        };
        progress.send_modify(|p| p.record(&attempt));
    }

    let state = if cancelled {
        TaskState::Cancelled
    } else {
        TaskState::Completed
    };
    progress.send_modify(|p| p.state = state);
    inner.table().tasks.remove(&id);

    let last = progress.borrow().clone();
    log::info!(
        "{} {}: {}/{} processed, {} succeeded, {} failed, {} skipped",
        id,
        state,
        last.processed,
        last.total,
        last.succeeded,
        last.failed,
        last.skipped
    );
}
