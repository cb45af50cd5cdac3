//! Fleet coordination primitives.
//!
//! Shared infrastructure every action-issuing component goes through:
//! - Locks: per-identity exclusivity with fail-fast acquisition
//! - Rate limits: durable per-identity cooldowns
//! - Selection: pluggable randomness over eligible-set snapshots
//! - Timer: cancellable waits and delayed job submission

pub mod locks;
pub mod ratelimit;
pub mod select;
pub mod timer;

pub use locks::{HeldLock, IdentityLease, IdentityLocks, LockStats};
pub use ratelimit::{LimitKind, RateLimitEntry, RateLimitLedger, next_local_midnight};
pub use select::{OrderedSelector, RandomSelector, Selector};
pub use timer::{DelayTimer, sleep_cancellable};
