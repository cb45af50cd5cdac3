//! Persistence seam.
//!
//! The orchestration core never caches campaign counters: every mutation
//! goes through one of the atomic operations below.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{
    ActionKind, ActivityRecord, Bucket, Campaign, CampaignId, EngagementPost, Identity, IdentityId, PostId,
    ResourceRef,
};

/// Durable storage for identities, campaigns, participation, posts and activity.
#[async_trait]
pub trait Store: Send + Sync {
    /// All identities, ordered by id.
    async fn identities(&self) -> Result<Vec<Identity>>;

    async fn identity(&self, id: &IdentityId) -> Result<Option<Identity>>;

    /// Set an identity's authorization flag.
    async fn set_authorized(&self, id: &IdentityId, authorized: bool) -> Result<()>;

    /// Campaigns flagged active.
    async fn active_campaigns(&self) -> Result<Vec<Campaign>>;

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Identities participating in a campaign, ordered by id.
    async fn participants(&self, campaign: CampaignId) -> Result<Vec<IdentityId>>;

    async fn participation_count(&self, campaign: CampaignId) -> Result<usize>;

    /// Record participation. Returns `false` if the pair already existed.
    async fn insert_participation(&self, campaign: CampaignId, identity: &IdentityId) -> Result<bool>;

    /// Remove participation. Returns `false` if the pair did not exist.
    async fn remove_participation(&self, campaign: CampaignId, identity: &IdentityId) -> Result<bool>;

    async fn post(&self, id: PostId) -> Result<Option<EngagementPost>>;

    /// Atomically add one to a bucket's fact counter if it is below theory.
    ///
    /// Returns the new count, or `None` if the bucket is already full.
    async fn increment_fact(&self, post: PostId, bucket: Bucket) -> Result<Option<u32>>;

    /// Append an activity record. Returns `false` if the identity already
    /// performed this kind of action on this resource.
    async fn record_activity(&self, record: ActivityRecord) -> Result<bool>;

    async fn has_activity(&self, identity: &IdentityId, resource: &ResourceRef, kind: ActionKind) -> Result<bool>;
}

#[derive(Default)]
struct MemoryState {
    identities: BTreeMap<IdentityId, Identity>,
    campaigns: BTreeMap<CampaignId, Campaign>,
    participation: BTreeSet<(CampaignId, IdentityId)>,
    posts: BTreeMap<PostId, EngagementPost>,
    activity: Vec<ActivityRecord>,
    activity_index: HashSet<(IdentityId, ResourceRef, ActionKind)>,
}

/// In-process [`Store`]. Each operation runs under one lock, which gives the
/// same atomicity a database row update would.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace an identity.
    pub fn put_identity(&self, identity: Identity) {
        self.state().identities.insert(identity.id.clone(), identity);
    }

    /// Add or replace a campaign.
    pub fn put_campaign(&self, campaign: Campaign) {
        self.state().campaigns.insert(campaign.id, campaign);
    }

    /// Add or replace a post.
    pub fn put_post(&self, post: EngagementPost) {
        self.state().posts.insert(post.id, post);
    }

    /// Delete a campaign with its participation and posts. Identities stay.
    pub fn delete_campaign(&self, id: CampaignId) -> bool {
        let mut state = self.state();
        state.participation.retain(|(campaign, _)| *campaign != id);
        state.posts.retain(|_, post| post.campaign != id);
        state.campaigns.remove(&id).is_some()
    }

    /// The full activity log in insertion order.
    pub fn activity_log(&self) -> Vec<ActivityRecord> {
        self.state().activity.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.state().identities.values().cloned().collect())
    }

    async fn identity(&self, id: &IdentityId) -> Result<Option<Identity>> {
        Ok(self.state().identities.get(id).cloned())
    }

    async fn set_authorized(&self, id: &IdentityId, authorized: bool) -> Result<()> {
        let mut state = self.state();
        let identity = state
            .identities
            .get_mut(id)
            .ok_or_else(|| Error::IdentityNotFound { id: id.clone() })?;
        identity.authorized = authorized;
        Ok(())
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>> {
        Ok(self.state().campaigns.values().filter(|c| c.active).cloned().collect())
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state().campaigns.get(&id).cloned())
    }

    async fn participants(&self, campaign: CampaignId) -> Result<Vec<IdentityId>> {
        Ok(self
            .state()
            .participation
            .iter()
            .filter(|(c, _)| *c == campaign)
            .map(|(_, identity)| identity.clone())
            .collect())
    }

    async fn participation_count(&self, campaign: CampaignId) -> Result<usize> {
        Ok(self.state().participation.iter().filter(|(c, _)| *c == campaign).count())
    }

    async fn insert_participation(&self, campaign: CampaignId, identity: &IdentityId) -> Result<bool> {
        Ok(self.state().participation.insert((campaign, identity.clone())))
    }

    async fn remove_participation(&self, campaign: CampaignId, identity: &IdentityId) -> Result<bool> {
        Ok(self.state().participation.remove(&(campaign, identity.clone())))
    }

    async fn post(&self, id: PostId) -> Result<Option<EngagementPost>> {
        Ok(self.state().posts.get(&id).cloned())
    }

    async fn increment_fact(&self, post: PostId, bucket: Bucket) -> Result<Option<u32>> {
        let mut state = self.state();
        let entry = state.posts.get_mut(&post).ok_or(Error::PostNotFound { id: post })?;

        let fact = entry.fact.get(bucket);
        if fact >= entry.theory.get(bucket) {
            return Ok(None);
        }
        entry.fact.set(bucket, fact + 1);
        Ok(Some(fact + 1))
    }

    async fn record_activity(&self, record: ActivityRecord) -> Result<bool> {
        let mut state = self.state();
        let key = (record.identity.clone(), record.resource.clone(), record.kind);
        if !state.activity_index.insert(key) {
            return Ok(false);
        }
        state.activity.push(record);
        Ok(true)
    }

    async fn has_activity(&self, identity: &IdentityId, resource: &ResourceRef, kind: ActionKind) -> Result<bool> {
        Ok(self
            .state()
            .activity_index
            .contains(&(identity.clone(), resource.clone(), kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BucketCounts;
    use chrono::Utc;
    use std::sync::Arc;

    fn post(theory: BucketCounts) -> EngagementPost {
        EngagementPost {
            id: PostId(1),
            campaign: CampaignId(1),
            resource: ResourceRef::new("chan/1/7"),
            action: ActionKind::View,
            published_at: Utc::now(),
            theory,
            fact: BucketCounts::default(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_participation_is_noop() {
        let store = MemoryStore::new();
        let id = IdentityId::new("a");

        assert!(store.insert_participation(CampaignId(1), &id).await.unwrap());
        assert!(!store.insert_participation(CampaignId(1), &id).await.unwrap());
        assert_eq!(store.participation_count(CampaignId(1)).await.unwrap(), 1);
        assert_eq!(store.participation_count(CampaignId(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_fact_caps_at_theory() {
        let store = MemoryStore::new();
        store.put_post(post(BucketCounts::new(2, 0, 0, 0)));

        assert_eq!(store.increment_fact(PostId(1), Bucket::FirstHour).await.unwrap(), Some(1));
        assert_eq!(store.increment_fact(PostId(1), Bucket::FirstHour).await.unwrap(), Some(2));
        assert_eq!(store.increment_fact(PostId(1), Bucket::FirstHour).await.unwrap(), None);
        assert_eq!(store.increment_fact(PostId(1), Bucket::Hours2To3).await.unwrap(), None);
        assert!(matches!(
            store.increment_fact(PostId(9), Bucket::FirstHour).await,
            Err(Error::PostNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_overshoot() {
        let store = Arc::new(MemoryStore::new());
        store.put_post(post(BucketCounts::new(10, 0, 0, 0)));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.increment_fact(PostId(1), Bucket::FirstHour).await.unwrap() })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let applied = results.into_iter().filter(|r| matches!(r, Ok(Some(_)))).count();

        assert_eq!(applied, 10);
        let post = store.post(PostId(1)).await.unwrap().unwrap();
        assert_eq!(post.fact.get(Bucket::FirstHour), 10);
    }

    #[tokio::test]
    async fn test_activity_dedupe() {
        let store = MemoryStore::new();
        let record = ActivityRecord {
            identity: IdentityId::new("a"),
            resource: ResourceRef::new("chan/1/7"),
            kind: ActionKind::React,
            at: Utc::now(),
        };

        assert!(store.record_activity(record.clone()).await.unwrap());
        assert!(!store.record_activity(record.clone()).await.unwrap());
        assert!(
            store
                .has_activity(&record.identity, &record.resource, ActionKind::React)
                .await
                .unwrap()
        );
        assert!(
            !store
                .has_activity(&record.identity, &record.resource, ActionKind::View)
                .await
                .unwrap()
        );
        assert_eq!(store.activity_log().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_campaign_keeps_identities() {
        let store = MemoryStore::new();
        store.put_identity(Identity::new("a"));
        store.put_campaign(Campaign {
            id: CampaignId(1),
            name: "launch".to_string(),
            resource: Some(ResourceRef::new("chan/1")),
            target_participants: 1,
            active: true,
        });
        store.insert_participation(CampaignId(1), &IdentityId::new("a")).await.unwrap();

        assert!(store.delete_campaign(CampaignId(1)));
        assert_eq!(store.participation_count(CampaignId(1)).await.unwrap(), 0);
        assert_eq!(store.identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_authorized_unknown_identity() {
        let store = MemoryStore::new();
        let err = store.set_authorized(&IdentityId::new("ghost"), false).await.unwrap_err();
        assert!(matches!(err, Error::IdentityNotFound { .. }));
    }
}
