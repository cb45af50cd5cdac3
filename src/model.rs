//! Domain types for fleetpace.
//!
//! Identities are the accounts the fleet acts through; campaigns and posts
//! describe what the fleet should do with them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for an identity (account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for IdentityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CampaignId(pub u64);

impl std::fmt::Display for CampaignId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "campaign-{}", self.0)
    }
}

/// Unique identifier for an engagement post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId(pub u64);

impl std::fmt::Display for PostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "post-{}", self.0)
    }
}

/// Reference to a platform object (channel, group, message link).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef(pub String);

impl ResourceRef {
    pub fn new(resource: impl Into<String>) -> Self {
        Self(resource.into())
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An externally-authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Whether the identity currently holds a live session.
    pub authorized: bool,
    /// Excluded from participation sweeps (kept for monitoring only).
    pub monitoring_excluded: bool,
}

impl Identity {
    /// A freshly onboarded, authorized identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: IdentityId::new(id),
            authorized: true,
            monitoring_excluded: false,
        }
    }

    /// Whether the identity may be drawn for participation or engagement.
    pub fn is_eligible(&self) -> bool {
        self.authorized && !self.monitoring_excluded
    }
}

/// A resource-targeting unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    /// The resource identities join. `None` is a configuration error.
    pub resource: Option<ResourceRef>,
    /// Desired participation count.
    pub target_participants: u32,
    pub active: bool,
}

/// The kind of action an identity performs against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    View,
    React,
    Join,
    Leave,
    Forward,
    Comment,
    UpdateLink,
}

impl ActionKind {
    /// Actions an identity may perform only once per target object.
    pub fn once_per_target(&self) -> bool {
        matches!(
            self,
            ActionKind::View | ActionKind::React | ActionKind::Forward | ActionKind::Comment
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::View => "view",
            ActionKind::React => "react",
            ActionKind::Join => "join",
            ActionKind::Leave => "leave",
            ActionKind::Forward => "forward",
            ActionKind::Comment => "comment",
            ActionKind::UpdateLink => "update_link",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(ActionKind::View),
            "react" => Ok(ActionKind::React),
            "join" => Ok(ActionKind::Join),
            "leave" => Ok(ActionKind::Leave),
            "forward" => Ok(ActionKind::Forward),
            "comment" => Ok(ActionKind::Comment),
            "update_link" => Ok(ActionKind::UpdateLink),
            other => Err(format!("unknown action kind: {}", other)),
        }
    }
}

/// One action to perform: what, against which object, with what payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: ActionKind,
    pub resource: ResourceRef,
    /// Free-form payload (comment text, reaction emoji, new link).
    pub payload: Option<String>,
}

impl ActionSpec {
    pub fn new(kind: ActionKind, resource: ResourceRef) -> Self {
        Self {
            kind,
            resource,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Time bucket relative to a post's publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// `[0, 1h)`
    FirstHour,
    /// `[1h, 3h)`
    Hours2To3,
    /// `[3h, 6h)`
    Hours4To6,
    /// `[6h, 24h)`
    Hours7To24,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Bucket::FirstHour,
        Bucket::Hours2To3,
        Bucket::Hours4To6,
        Bucket::Hours7To24,
    ];

    /// Window offsets `(start, end)` from publish time.
    pub fn window(&self) -> (Duration, Duration) {
        const HOUR: u64 = 3600;
        let (start, end) = match self {
            Bucket::FirstHour => (0, HOUR),
            Bucket::Hours2To3 => (HOUR, 3 * HOUR),
            Bucket::Hours4To6 => (3 * HOUR, 6 * HOUR),
            Bucket::Hours7To24 => (6 * HOUR, 24 * HOUR),
        };
        (Duration::from_secs(start), Duration::from_secs(end))
    }

    fn index(&self) -> usize {
        match self {
            Bucket::FirstHour => 0,
            Bucket::Hours2To3 => 1,
            Bucket::Hours4To6 => 2,
            Bucket::Hours7To24 => 3,
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Bucket::FirstHour => "1h",
            Bucket::Hours2To3 => "2-3h",
            Bucket::Hours4To6 => "4-6h",
            Bucket::Hours7To24 => "7-24h",
        };
        f.write_str(label)
    }
}

/// Per-bucket counts (used for both theory and fact).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts([u32; 4]);

impl BucketCounts {
    pub fn new(first_hour: u32, hours_2_3: u32, hours_4_6: u32, hours_7_24: u32) -> Self {
        Self([first_hour, hours_2_3, hours_4_6, hours_7_24])
    }

    pub fn get(&self, bucket: Bucket) -> u32 {
        self.0[bucket.index()]
    }

    pub fn set(&mut self, bucket: Bucket, value: u32) {
        self.0[bucket.index()] = value;
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

/// A campaign post with a theoretical engagement shape and executed facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementPost {
    pub id: PostId,
    pub campaign: CampaignId,
    /// The object engaged with (message link).
    pub resource: ResourceRef,
    pub action: ActionKind,
    pub published_at: DateTime<Utc>,
    pub theory: BucketCounts,
    pub fact: BucketCounts,
}

impl EngagementPost {
    /// Slots still to execute in a bucket.
    pub fn remaining(&self, bucket: Bucket) -> u32 {
        self.theory.get(bucket).saturating_sub(self.fact.get(bucket))
    }
}

/// Append-only record of one executed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub identity: IdentityId,
    pub resource: ResourceRef,
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
}
