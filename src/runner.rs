//! The shared action path.
//!
//! Every component issues platform actions through [`ActionRunner::attempt`]:
//! lock the identity, consult the rate-limit ledger, execute, classify the
//! result, release. Nothing here retries or waits.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::{IdentityLocks, LimitKind, RateLimitLedger};
use crate::executor::{ActionError, ActionExecutor, ActionOutcome, SessionChecker};
use crate::model::{ActionSpec, ActivityRecord, Identity};
use crate::store::Store;

/// Why an attempt was not made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Another operation holds the identity.
    Locked,
    /// The identity is cooling down.
    RateLimited { kind: LimitKind, until: DateTime<Utc> },
    /// The identity has no live session.
    Unauthorized,
    /// The identity already performed this action on this object.
    AlreadyDone,
}

/// How an attempted action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Transient,
    Rejected,
    SubscriptionCap,
    SessionLost,
    FloodWait,
    Storage,
}

impl From<&ActionError> for FailureKind {
    fn from(err: &ActionError) -> Self {
        match err {
            ActionError::Transient(_) => FailureKind::Transient,
            ActionError::Rejected(_) => FailureKind::Rejected,
            ActionError::SubscriptionCap => FailureKind::SubscriptionCap,
            ActionError::SessionLost => FailureKind::SessionLost,
            ActionError::FloodWait { .. } => FailureKind::FloodWait,
        }
    }
}

/// Result of one pass through the action path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Succeeded(ActionOutcome),
    Skipped(SkipReason),
    Failed(FailureKind),
}

impl Attempt {
    pub fn is_success(&self) -> bool {
        matches!(self, Attempt::Succeeded(_))
    }
}

/// Runs single actions under the identity lock and ledger rules.
#[derive(Clone)]
pub struct ActionRunner {
    store: Arc<dyn Store>,
    locks: IdentityLocks,
    ledger: Arc<RateLimitLedger>,
    executor: Arc<dyn ActionExecutor>,
    session: Arc<dyn SessionChecker>,
}

impl ActionRunner {
    pub fn new(
        store: Arc<dyn Store>,
        locks: IdentityLocks,
        ledger: Arc<RateLimitLedger>,
        executor: Arc<dyn ActionExecutor>,
        session: Arc<dyn SessionChecker>,
    ) -> Self {
        Self {
            store,
            locks,
            ledger,
            executor,
            session,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    pub fn ledger(&self) -> &Arc<RateLimitLedger> {
        &self.ledger
    }

    pub fn session(&self) -> &Arc<dyn SessionChecker> {
        &self.session
    }

    /// Attempt one action for one identity.
    pub async fn attempt(&self, identity: &Identity, action: &ActionSpec) -> Attempt {
        self.attempt_then(identity, action, || std::future::ready(())).await
    }

    /// Attempt one action, running `on_success` after a successful execution
    /// and before the identity lock is released.
    pub async fn attempt_then<F, Fut>(&self, identity: &Identity, action: &ActionSpec, on_success: F) -> Attempt
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if !identity.authorized {
            return Attempt::Skipped(SkipReason::Unauthorized);
        }

        let _lease = match self
            .locks
            .acquire_for(&identity.id, format!("{} {}", action.kind, action.resource))
        {
            Ok(lease) => lease,
            Err(e) => {
                log::debug!("Skipping {} {} for {}: {}", action.kind, action.resource, identity.id, e);
                return Attempt::Skipped(SkipReason::Locked);
            }
        };

        let now = Utc::now();
        if let Some(block) = self.ledger.blocking_limit(&identity.id, action.kind, now).await {
            log::debug!(
                "Skipping {} {} for {}: {} until {}",
                action.kind,
                action.resource,
                identity.id,
                block.kind,
                block.until
            );
            return Attempt::Skipped(SkipReason::RateLimited {
                kind: block.kind,
                until: block.until,
            });
        }

        let once = action.kind.once_per_target();
        if once {
            match self.store.has_activity(&identity.id, &action.resource, action.kind).await {
                Ok(true) => return Attempt::Skipped(SkipReason::AlreadyDone),
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Activity lookup failed for {} on {}: {}", identity.id, action.resource, e);
                    return Attempt::Failed(FailureKind::Storage);
                }
            }
        }

        match self.executor.execute(identity, action).await {
            Ok(outcome) => {
                if once {
                    let record = ActivityRecord {
                        identity: identity.id.clone(),
                        resource: action.resource.clone(),
                        kind: action.kind,
                        at: Utc::now(),
                    };
                    if let Err(e) = self.store.record_activity(record).await {
                        log::warn!("Failed to record {} activity for {}: {}", action.kind, identity.id, e);
                    }
                }
                log::debug!("{} {} succeeded for {}", action.kind, action.resource, identity.id);
                on_success().await;
                Attempt::Succeeded(outcome)
            }
            Err(err) => {
                self.classify(identity, action, &err, now).await;
                Attempt::Failed(FailureKind::from(&err))
            }
        }
    }

    async fn classify(&self, identity: &Identity, action: &ActionSpec, err: &ActionError, now: DateTime<Utc>) {
        match err {
            ActionError::SubscriptionCap => {
                if let Err(e) = self.ledger.mark_subscription_cap(&identity.id, now).await {
                    log::error!("Failed to record subscription cap for {}: {}", identity.id, e);
                }
            }
            ActionError::FloodWait { retry_after } => {
                let until = chrono::Duration::from_std(*retry_after)
                    .ok()
                    .and_then(|wait| now.checked_add_signed(wait))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                if let Err(e) = self.ledger.mark_blocked(&identity.id, LimitKind::FloodBan, until).await {
                    log::error!("Failed to record flood ban for {}: {}", identity.id, e);
                }
            }
            ActionError::SessionLost => {
                self.session.session_lost(identity).await;
            }
            ActionError::Transient(_) | ActionError::Rejected(_) => {}
        }

        log::warn!(
            "{} {} failed for {}: {}",
            action.kind,
            action.resource,
            identity.id,
            err
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable collaborators shared by unit tests.

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::executor::StoreSessionChecker;
    use crate::model::IdentityId;
    use crate::store::MemoryStore;

    /// Executor that succeeds unless a failure was scripted for an identity.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        failures: Mutex<HashMap<IdentityId, ActionError>>,
        calls: Mutex<Vec<(IdentityId, ActionSpec)>>,
        delay: Option<Duration>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn fail(&self, identity: &str, err: ActionError) {
            self.failures.lock().unwrap().insert(IdentityId::new(identity), err);
        }

        pub fn calls(&self) -> Vec<(IdentityId, ActionSpec)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(&self, identity: &Identity, action: &ActionSpec) -> Result<ActionOutcome, ActionError> {
            self.calls.lock().unwrap().push((identity.id.clone(), action.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.failures.lock().unwrap().get(&identity.id) {
                Some(err) => Err(err.clone()),
                None => Ok(ActionOutcome::default()),
            }
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub executor: Arc<ScriptedExecutor>,
        pub runner: ActionRunner,
    }

    pub fn harness(identities: usize) -> Harness {
        harness_with(identities, ScriptedExecutor::new())
    }

    pub fn harness_with(identities: usize, executor: ScriptedExecutor) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for i in 0..identities {
            store.put_identity(Identity::new(format!("acc-{}", i)));
        }
        let executor = Arc::new(executor);
        let runner = ActionRunner::new(
            store.clone(),
            IdentityLocks::new(),
            Arc::new(RateLimitLedger::in_memory()),
            executor.clone(),
            Arc::new(StoreSessionChecker::new(store.clone())),
        );
        Harness {
            store,
            executor,
            runner,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::testing::*;
    use super::*;
    use crate::model::{ActionKind, IdentityId, ResourceRef};

    fn view() -> ActionSpec {
        ActionSpec::new(ActionKind::View, ResourceRef::new("chan/1/7"))
    }

    #[tokio::test]
    async fn test_success_records_activity_and_releases() {
        let h = harness(1);
        let identity = Identity::new("acc-0");

        assert!(h.runner.attempt(&identity, &view()).await.is_success());
        assert!(!h.runner.locks().is_locked(&identity.id));
        assert_eq!(h.store.activity_log().len(), 1);

        let again = h.runner.attempt(&identity, &view()).await;
        assert_eq!(again, Attempt::Skipped(SkipReason::AlreadyDone));
        assert_eq!(h.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_success_hook_runs_while_locked() {
        let h = harness(1);
        let identity = Identity::new("acc-0");
        let locked = Arc::new(AtomicBool::new(false));

        let seen = Arc::clone(&locked);
        let locks = h.runner.locks().clone();
        let id = identity.id.clone();
        let attempt = h
            .runner
            .attempt_then(&identity, &view(), move || async move {
                seen.store(locks.is_locked(&id), Ordering::SeqCst);
            })
            .await;

        assert!(attempt.is_success());
        assert!(locked.load(Ordering::SeqCst));
        assert!(!h.runner.locks().is_locked(&identity.id));
    }

    #[tokio::test]
    async fn test_success_hook_skipped_on_failure() {
        let h = harness(1);
        let identity = Identity::new("acc-0");
        h.executor.fail("acc-0", ActionError::Rejected("private".to_string()));
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let attempt = h
            .runner
            .attempt_then(&identity, &view(), move || async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await;

        assert_eq!(attempt, Attempt::Failed(FailureKind::Rejected));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_locked_identity_is_skipped() {
        let h = harness(1);
        let identity = Identity::new("acc-0");
        let _lease = h.runner.locks().acquire(&identity.id).unwrap();

        let attempt = h.runner.attempt(&identity, &view()).await;
        assert_eq!(attempt, Attempt::Skipped(SkipReason::Locked));
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_flood_wait_blocks_identity() {
        let h = harness(1);
        let identity = Identity::new("acc-0");
        h.executor.fail(
            "acc-0",
            ActionError::FloodWait {
                retry_after: Duration::from_secs(300),
            },
        );

        assert_eq!(
            h.runner.attempt(&identity, &view()).await,
            Attempt::Failed(FailureKind::FloodWait)
        );
        assert!(h.runner.ledger().is_blocked(&identity.id, LimitKind::FloodBan).await);

        let comment = ActionSpec::new(ActionKind::Comment, ResourceRef::new("chan/1/8"));
        assert!(matches!(
            h.runner.attempt(&identity, &comment).await,
            Attempt::Skipped(SkipReason::RateLimited {
                kind: LimitKind::FloodBan,
                ..
            })
        ));
        assert_eq!(h.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_cap_only_blocks_joins() {
        let h = harness(1);
        let identity = Identity::new("acc-0");
        h.executor.fail("acc-0", ActionError::SubscriptionCap);

        let join = ActionSpec::new(ActionKind::Join, ResourceRef::new("chan/1"));
        assert_eq!(
            h.runner.attempt(&identity, &join).await,
            Attempt::Failed(FailureKind::SubscriptionCap)
        );
        assert!(matches!(
            h.runner.attempt(&identity, &join).await,
            Attempt::Skipped(SkipReason::RateLimited { .. })
        ));

        // Views still go through to the executor.
        assert_eq!(
            h.runner.attempt(&identity, &view()).await,
            Attempt::Failed(FailureKind::SubscriptionCap)
        );
        assert_eq!(h.executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_session_loss_deauthorizes() {
        let h = harness(1);
        let identity = Identity::new("acc-0");
        h.executor.fail("acc-0", ActionError::SessionLost);

        assert_eq!(
            h.runner.attempt(&identity, &view()).await,
            Attempt::Failed(FailureKind::SessionLost)
        );
        let stored = h.store.identity(&IdentityId::new("acc-0")).await.unwrap().unwrap();
        assert!(!stored.authorized);
        assert_eq!(
            h.runner.attempt(&stored, &view()).await,
            Attempt::Skipped(SkipReason::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_not_retried() {
        let h = harness(1);
        let identity = Identity::new("acc-0");
        h.executor.fail("acc-0", ActionError::Transient("timeout".to_string()));

        assert_eq!(
            h.runner.attempt(&identity, &view()).await,
            Attempt::Failed(FailureKind::Transient)
        );
        assert_eq!(h.executor.calls().len(), 1);
        assert!(h.store.activity_log().is_empty());
        assert!(!h.runner.locks().is_locked(&identity.id));
    }
}
