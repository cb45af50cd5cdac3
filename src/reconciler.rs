//! Convergence of campaign participation toward targets.
//!
//! Each pass compares a campaign's participation count with its target.
//! A deficit is filled by joining randomly chosen eligible identities; in
//! sync mode a surplus is trimmed. Every join goes through the shared action
//! path, so locked or throttled identities are simply skipped and picked up
//! by a later pass. A campaign is reconciled by at most one pass at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReconcilerSettings;
use crate::coordination::{Selector, sleep_cancellable};
use crate::error::{Error, Result};
use crate::model::{ActionKind, ActionSpec, Campaign, CampaignId, Identity, IdentityId, ResourceRef};
use crate::runner::{ActionRunner, Attempt};

/// Which direction a pass may move participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Only add participation up to target.
    Activation,
    /// Add up to target and trim anything above it.
    Sync,
}

impl std::str::FromStr for ReconcileMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "activation" => Ok(ReconcileMode::Activation),
            "sync" => Ok(ReconcileMode::Sync),
            other => Err(format!("unknown reconcile mode: {}", other)),
        }
    }
}

/// Aggregate counts for a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub campaigns_processed: usize,
    /// Campaigns skipped for configuration or storage errors.
    pub campaigns_skipped: usize,
    /// Campaigns left alone because another pass was reconciling them.
    pub campaigns_busy: usize,
    pub joins_attempted: usize,
    pub joins_succeeded: usize,
    pub joins_failed: usize,
    /// Joins not attempted because the identity was busy, throttled or unauthorized.
    pub joins_skipped: usize,
    pub trimmed: usize,
    pub trim_failed: usize,
    /// The pass stopped early on shutdown.
    pub interrupted: bool,
}

impl ReconcileReport {
    fn absorb(&mut self, other: ReconcileReport) {
        self.joins_attempted += other.joins_attempted;
        self.joins_succeeded += other.joins_succeeded;
        self.joins_failed += other.joins_failed;
        self.joins_skipped += other.joins_skipped;
        self.trimmed += other.trimmed;
        self.trim_failed += other.trim_failed;
        self.interrupted |= other.interrupted;
    }
}

/// Drives campaign participation toward target counts.
pub struct Reconciler {
    runner: ActionRunner,
    selector: Arc<dyn Selector>,
    settings: ReconcilerSettings,
    token: CancellationToken,
    in_flight: Mutex<HashSet<CampaignId>>,
}

/// Marks a campaign as being reconciled until dropped.
struct CampaignClaim<'a> {
    in_flight: &'a Mutex<HashSet<CampaignId>>,
    campaign: CampaignId,
}

impl Drop for CampaignClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.campaign);
    }
}

impl Reconciler {
    pub fn new(runner: ActionRunner, selector: Arc<dyn Selector>, settings: ReconcilerSettings) -> Self {
        Self::with_token(runner, selector, settings, CancellationToken::new())
    }

    /// Build a reconciler that stops when `token` is cancelled.
    pub fn with_token(
        runner: ActionRunner,
        selector: Arc<dyn Selector>,
        settings: ReconcilerSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            runner,
            selector,
            settings,
            token,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, campaign: CampaignId) -> Option<CampaignClaim<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(campaign);
        inserted.then_some(CampaignClaim {
            in_flight: &self.in_flight,
            campaign,
        })
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Stop in-flight passes at their next pause and end periodic sweeps.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Run one pass over every active campaign.
    ///
    /// Fails only when the fleet has no eligible identity at all; problems
    /// with individual campaigns or identities are logged and counted.
    pub async fn run(&self, mode: ReconcileMode) -> Result<ReconcileReport> {
        let fleet = self.runner.store().identities().await?;
        if !fleet.iter().any(Identity::is_eligible) {
            return Err(Error::NoEligibleIdentities {
                context: format!("{} identities, none authorized and included", fleet.len()),
            });
        }

        let campaigns = self.runner.store().active_campaigns().await?;
        let mut report = ReconcileReport::default();

        for campaign in campaigns {
            if self.token.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let Some(_claim) = self.claim(campaign.id) else {
                log::debug!("{} is being reconciled by another pass", campaign.id);
                report.campaigns_busy += 1;
                continue;
            };

            match self.reconcile_campaign(&campaign, mode, &fleet).await {
                Ok(outcome) => {
                    report.campaigns_processed += 1;
                    report.absorb(outcome);
                }
                Err(e) => {
                    log::warn!("Skipping {} ({}): {}", campaign.id, campaign.name, e);
                    report.campaigns_skipped += 1;
                }
            }
        }

        log::info!(
            "Reconcile ({:?}): {} campaigns, {}/{} joins succeeded, {} trimmed",
            mode,
            report.campaigns_processed,
            report.joins_succeeded,
            report.joins_attempted,
            report.trimmed
        );
        Ok(report)
    }

    async fn reconcile_campaign(
        &self,
        campaign: &Campaign,
        mode: ReconcileMode,
        fleet: &[Identity],
    ) -> Result<ReconcileReport> {
        let resource = campaign
            .resource
            .clone()
            .ok_or_else(|| Error::Config(format!("{} has no target resource", campaign.id)))?;

        let participants = self.runner.store().participants(campaign.id).await?;
        let current = participants.len();
        let target = campaign.target_participants as usize;

        if target > current {
            Ok(self.grow(campaign, &resource, &participants, target, fleet).await)
        } else if target < current && mode == ReconcileMode::Sync {
            Ok(self.trim(campaign, &resource, &participants, current - target).await)
        } else {
            Ok(ReconcileReport::default())
        }
    }

    async fn grow(
        &self,
        campaign: &Campaign,
        resource: &ResourceRef,
        participants: &[IdentityId],
        target: usize,
        fleet: &[Identity],
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let deficit = target.saturating_sub(participants.len());
        let participating: HashSet<&IdentityId> = participants.iter().collect();
        let pool: Vec<IdentityId> = fleet
            .iter()
            .filter(|identity| identity.is_eligible() && !participating.contains(&identity.id))
            .map(|identity| identity.id.clone())
            .collect();

        if pool.is_empty() {
            log::warn!("{}: {} joins needed but no eligible identities left", campaign.id, deficit);
            return report;
        }

        let join = ActionSpec::new(ActionKind::Join, resource.clone());
        let selected = self.selector.pick(&pool, deficit);

        for (i, id) in selected.iter().enumerate() {
            if i > 0 {
                let pause = self
                    .selector
                    .jitter(self.settings.join_delay_min(), self.settings.join_delay_max());
                if !sleep_cancellable(pause, &self.token).await {
                    report.interrupted = true;
                    break;
                }
            }

            match self.runner.store().participation_count(campaign.id).await {
                Ok(count) if count >= target => {
                    log::debug!("{}: reached {} participants, stopping joins", campaign.id, count);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("{}: participation recount failed: {}", campaign.id, e);
                    break;
                }
            }

            let identity = match self.runner.store().identity(id).await {
                Ok(Some(identity)) => identity,
                Ok(None) => {
                    report.joins_skipped += 1;
                    continue;
                }
                Err(e) => {
                    log::warn!("{}: lookup of {} failed: {}", campaign.id, id, e);
                    report.joins_skipped += 1;
                    continue;
                }
            };

            match self.runner.attempt(&identity, &join).await {
                Attempt::Succeeded(_) => {
                    report.joins_attempted += 1;
                    match self.runner.store().insert_participation(campaign.id, id).await {
                        Ok(inserted) => {
                            if !inserted {
                                log::debug!("{}: {} was already participating", campaign.id, id);
                            }
                            report.joins_succeeded += 1;
                        }
                        Err(e) => {
                            log::error!("{}: joined with {} but failed to record it: {}", campaign.id, id, e);
                            report.joins_failed += 1;
                        }
                    }
                }
                Attempt::Failed(kind) => {
                    report.joins_attempted += 1;
                    report.joins_failed += 1;
                    log::info!("{}: join via {} failed ({:?})", campaign.id, id, kind);
                }
                Attempt::Skipped(reason) => {
                    report.joins_skipped += 1;
                    log::debug!("{}: join via {} skipped ({:?})", campaign.id, id, reason);
                }
            }
        }

        report
    }

    async fn trim(
        &self,
        campaign: &Campaign,
        resource: &ResourceRef,
        participants: &[IdentityId],
        excess: usize,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let leave = ActionSpec::new(ActionKind::Leave, resource.clone());

        if !self.settings.unsubscribe_on_trim {
            log::warn!(
                "{}: trimming {} participation records without leaving {}; platform membership will diverge",
                campaign.id,
                excess,
                resource
            );
        }

        for id in self.selector.pick(participants, excess) {
            if self.settings.unsubscribe_on_trim {
                let left = match self.runner.store().identity(&id).await {
                    Ok(Some(identity)) => self.runner.attempt(&identity, &leave).await.is_success(),
                    Ok(None) => false,
                    Err(e) => {
                        log::warn!("{}: lookup of {} failed: {}", campaign.id, id, e);
                        false
                    }
                };
                if !left {
                    report.trim_failed += 1;
                    continue;
                }
            }

            match self.runner.store().remove_participation(campaign.id, &id).await {
                Ok(_) => report.trimmed += 1,
                Err(e) => {
                    log::warn!("{}: failed to remove participation of {}: {}", campaign.id, id, e);
                    report.trim_failed += 1;
                }
            }
        }

        report
    }

    /// Run passes every `interval` until [`shutdown`](Self::shutdown).
    pub fn spawn_periodic(self: Arc<Self>, mode: ReconcileMode, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.run(mode).await {
                    log::error!("Reconcile pass failed: {}", e);
                }
                if !sleep_cancellable(interval, &self.token).await {
                    log::info!("Periodic reconciliation stopped");
                    break;
                }
            }
        })
    }
}
