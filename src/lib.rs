//! fleetpace: coordination core for a fleet of platform identities.
//!
//! Identities perform paced actions (joins, views, reactions, comments)
//! against shared resources. Every action passes through one path that
//! enforces per-identity locking and rate-limit cooldowns; the distribution
//! scheduler, the convergence reconciler and the campaign task dispatcher are
//! built on top of it.

pub mod config;
pub mod control;
pub mod coordination;
pub mod dispatcher;
pub mod distribution;
pub mod error;
pub mod executor;
pub mod model;
pub mod reconciler;
pub mod runner;
pub mod store;

pub use config::Config;
pub use control::{ControlRequest, ControlResponse, Controller};
pub use coordination::{IdentityLease, IdentityLocks, RandomSelector, RateLimitLedger, Selector};
pub use dispatcher::{CampaignTaskSpec, Dispatcher, Pacing, TaskId, TaskPlan, TaskProgress, TaskState};
pub use distribution::{DistributionScheduler, ScheduleReport};
pub use error::{Error, Result};
pub use executor::{ActionError, ActionExecutor, ActionOutcome, SessionChecker, StoreSessionChecker};
pub use model::{
    ActionKind, ActionSpec, Bucket, BucketCounts, Campaign, CampaignId, EngagementPost, Identity, IdentityId, PostId,
    ResourceRef,
};
pub use reconciler::{ReconcileMode, ReconcileReport, Reconciler};
pub use runner::{ActionRunner, Attempt};
pub use store::{MemoryStore, Store};
