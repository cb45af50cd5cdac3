//! Time-bucketed engagement distribution.
//!
//! A post's theory says how many actions each time bucket should receive.
//! The scheduler spreads those actions evenly across each bucket's window,
//! assigns each slot to a distinct eligible identity, and hands the slots to
//! a [`DelayTimer`]. Each completed action bumps the bucket's fact counter
//! through the store's conditional increment while the identity is still
//! locked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerSettings;
use crate::coordination::{DelayTimer, Selector};
use crate::error::{Error, Result};
use crate::model::{ActionSpec, Bucket, BucketCounts, EngagementPost, IdentityId, PostId};
use crate::runner::{ActionRunner, Attempt};

/// One slot of a post's engagement plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub bucket: Bucket,
    /// Step index within the bucket (`0..theory`).
    pub slot: u32,
    pub identity: IdentityId,
    pub at: DateTime<Utc>,
}

/// Summary of a scheduling pass for one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub post: PostId,
    /// Actions handed to the timer, per bucket.
    pub planned: BucketCounts,
    /// Planned actions whose slot time had already passed.
    pub immediate: u32,
    /// Remaining slots left empty for lack of distinct identities.
    pub unfilled: u32,
}

/// Time of step `slot` out of `steps` in a bucket's window.
fn slot_time(published_at: DateTime<Utc>, bucket: Bucket, slot: u32, steps: u32) -> DateTime<Utc> {
    let (start, end) = bucket.window();
    let step = (end - start) / steps.max(1);
    let offset = start + step * slot;
    chrono::Duration::from_std(offset)
        .ok()
        .and_then(|offset| published_at.checked_add_signed(offset))
        .unwrap_or(published_at)
}

/// Lay out the remaining slots of a post.
///
/// Each bucket with theory N is split into N equal steps; steps already
/// covered by fact are skipped, so at most `theory - fact` actions are
/// planned per bucket. Identities are drawn without replacement from `pool`.
/// Returns the plan and the number of slots that could not be filled.
pub fn plan_post(post: &EngagementPost, pool: &[IdentityId], selector: &dyn Selector) -> (Vec<PlannedAction>, u32) {
    let wanted: u32 = Bucket::ALL.iter().map(|b| post.remaining(*b)).sum();
    let mut picks = selector.pick(pool, wanted as usize).into_iter();
    let mut plan = Vec::new();
    let mut unfilled = 0;

    for bucket in Bucket::ALL {
        let steps = post.theory.get(bucket);
        let done = post.fact.get(bucket).min(steps);

        for slot in done..steps {
            match picks.next() {
                Some(identity) => plan.push(PlannedAction {
                    bucket,
                    slot,
                    identity,
                    at: slot_time(post.published_at, bucket, slot, steps),
                }),
                None => unfilled += 1,
            }
        }
    }

    (plan, unfilled)
}

/// Expands post theory into delayed, idempotent actions.
pub struct DistributionScheduler {
    runner: ActionRunner,
    selector: Arc<dyn Selector>,
    timer: DelayTimer,
    settings: SchedulerSettings,
    /// Outstanding slot claims per post. A post leaves the map when its last
    /// slot has fired or been dropped.
    scheduled: Arc<Mutex<HashMap<PostId, usize>>>,
}

/// Keeps a post marked as scheduled until dropped.
struct SlotClaim {
    post: PostId,
    scheduled: Arc<Mutex<HashMap<PostId, usize>>>,
}

impl SlotClaim {
    /// Another claim on the same post.
    fn split(&self) -> SlotClaim {
        let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        *scheduled.entry(self.post).or_insert(0) += 1;
        SlotClaim {
            post: self.post,
            scheduled: Arc::clone(&self.scheduled),
        }
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = scheduled.get_mut(&self.post) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                scheduled.remove(&self.post);
            }
        }
    }
}

impl DistributionScheduler {
    pub fn new(runner: ActionRunner, selector: Arc<dyn Selector>, settings: SchedulerSettings) -> Self {
        Self {
            runner,
            selector,
            timer: DelayTimer::new(),
            settings,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim a post for planning; `None` if it already has slots in flight.
    fn mark_scheduled(&self, post: PostId) -> Option<SlotClaim> {
        let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduled.contains_key(&post) {
            return None;
        }
        scheduled.insert(post, 1);
        Some(SlotClaim {
            post,
            scheduled: Arc::clone(&self.scheduled),
        })
    }

    /// Whether a post still has slots waiting or running.
    pub fn is_scheduled(&self, post: PostId) -> bool {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&post)
    }

    /// Eligible identities for a post: authorized, not excluded, not cooling
    /// down for this action, and without a prior action of this kind on the
    /// post's resource.
    async fn eligible_pool(&self, post: &EngagementPost) -> Result<Vec<IdentityId>> {
        let store = self.runner.store();
        let ledger = self.runner.ledger();
        let now = Utc::now();
        let mut pool = Vec::new();

        for identity in store.identities().await? {
            if !identity.is_eligible() {
                continue;
            }
            if let Some(block) = ledger.blocking_limit(&identity.id, post.action, now).await {
                log::debug!("{}: {} excluded, {} until {}", post.id, identity.id, block.kind, block.until);
                continue;
            }
            if post.action.once_per_target() && store.has_activity(&identity.id, &post.resource, post.action).await? {
                continue;
            }
            pool.push(identity.id);
        }

        Ok(pool)
    }

    /// Plan and submit all remaining actions for a post.
    ///
    /// A post can be scheduled again once every slot of its previous plan has
    /// fired or been dropped.
    pub async fn schedule_post(&self, post_id: PostId) -> Result<ScheduleReport> {
        if self.timer.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let post = self
            .runner
            .store()
            .post(post_id)
            .await?
            .ok_or(Error::PostNotFound { id: post_id })?;

        let claim = self
            .mark_scheduled(post_id)
            .ok_or(Error::AlreadyScheduled { id: post_id })?;
        self.submit(&post, &claim).await
    }

    async fn submit(&self, post: &EngagementPost, claim: &SlotClaim) -> Result<ScheduleReport> {
        let remaining: u32 = Bucket::ALL.iter().map(|b| post.remaining(*b)).sum();
        let mut report = ScheduleReport {
            post: post.id,
            planned: BucketCounts::default(),
            immediate: 0,
            unfilled: 0,
        };

        if remaining == 0 {
            log::debug!("{} has no remaining slots", post.id);
            return Ok(report);
        }

        let pool = self.eligible_pool(post).await?;
        if pool.is_empty() {
            return Err(Error::NoEligibleIdentities {
                context: format!("{} needs {} actions", post.id, remaining),
            });
        }

        let (plan, unfilled) = plan_post(post, &pool, self.selector.as_ref());
        if self.timer.pending() + plan.len() > self.settings.max_pending {
            return Err(Error::Config(format!(
                "scheduler at capacity: {} pending, {} more requested, limit {}",
                self.timer.pending(),
                plan.len(),
                self.settings.max_pending
            )));
        }

        if unfilled > 0 {
            log::warn!(
                "{}: only {} distinct identities for {} slots, {} left unfilled",
                post.id,
                pool.len(),
                remaining,
                unfilled
            );
        }
        report.unfilled = unfilled;

        let now = Utc::now();
        for action in plan {
            let delay = (action.at - now).to_std().unwrap_or(Duration::ZERO);
            if delay.is_zero() {
                report.immediate += 1;
            }
            let planned = report.planned.get(action.bucket);
            report.planned.set(action.bucket, planned + 1);

            let runner = self.runner.clone();
            let spec = ActionSpec::new(post.action, post.resource.clone());
            let post_id = post.id;
            let slot_claim = claim.split();
            self.timer.submit_after(delay, async move {
                execute_slot(runner, post_id, spec, action).await;
                drop(slot_claim);
            });
        }

        log::info!(
            "Scheduled {} actions for {} ({} immediate, {} unfilled)",
            report.planned.total(),
            post.id,
            report.immediate,
            report.unfilled
        );
        Ok(report)
    }

    /// Actions still waiting for their slot.
    pub fn pending(&self) -> usize {
        self.timer.pending()
    }

    /// Drop every waiting action.
    pub fn cancel(&self) {
        self.timer.cancel();
    }

    /// Wait until every submitted action has run or been dropped.
    pub async fn drain(&self) {
        self.timer.drain().await;
    }
}

async fn execute_slot(runner: ActionRunner, post: PostId, spec: ActionSpec, action: PlannedAction) {
    let identity = match runner.store().identity(&action.identity).await {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            log::warn!("{} {} slot {}: identity {} vanished", post, action.bucket, action.slot, action.identity);
            return;
        }
        Err(e) => {
            log::warn!("{} {} slot {}: identity lookup failed: {}", post, action.bucket, action.slot, e);
            return;
        }
    };

    let store = Arc::clone(runner.store());
    let bucket = action.bucket;
    let count_fact = move || async move {
        match store.increment_fact(post, bucket).await {
            Ok(Some(fact)) => log::debug!("{} {} fact now {}", post, bucket, fact),
            Ok(None) => log::warn!("{} {} already at theory, fact not incremented", post, bucket),
            Err(e) => log::error!("{} {} fact increment failed: {}", post, bucket, e),
        }
    };

    match runner.attempt_then(&identity, &spec, count_fact).await {
        Attempt::Succeeded(_) => {}
        other => {
            log::info!(
                "{} {} slot {} via {} not executed: {:?}",
                post,
                action.bucket,
                action.slot,
                identity.id,
                other
            );
        }
    }
}
