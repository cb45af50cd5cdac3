//! Per-identity lock registry.
//!
//! Every operation against an identity holds that identity's lock for its
//! duration. Acquisition never waits: a busy identity is reported
//! immediately so callers can skip it and move on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::model::IdentityId;

/// Information about a held identity lock.
#[derive(Debug, Clone)]
pub struct HeldLock {
    /// The locked identity.
    pub identity: IdentityId,
    /// What the holder is doing (for diagnostics).
    pub purpose: String,
    /// When the lock was acquired.
    pub acquired_at: Instant,
}

impl HeldLock {
    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

struct LockEntry {
    generation: u64,
    purpose: String,
    acquired_at: Instant,
}

#[derive(Default)]
struct LockDirectory {
    /// Currently held identities. Entries are created on first acquire and
    /// dropped on release.
    held: HashMap<IdentityId, LockEntry>,
    next_generation: u64,
    acquired_total: u64,
    contended_total: u64,
}

/// Registry of identity locks shared by every action-issuing component.
#[derive(Clone, Default)]
pub struct IdentityLocks {
    directory: Arc<Mutex<LockDirectory>>,
}

impl IdentityLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn directory(&self) -> MutexGuard<'_, LockDirectory> {
        lock_directory(&self.directory)
    }

    /// Try to lock an identity.
    pub fn acquire(&self, identity: &IdentityId) -> Result<IdentityLease> {
        self.acquire_for(identity, "unspecified")
    }

    /// Try to lock an identity, recording what the lock is for.
    ///
    /// Fails with [`Error::LockContention`] if the identity is already held;
    /// the error carries the full set of held identities.
    pub fn acquire_for(&self, identity: &IdentityId, purpose: impl Into<String>) -> Result<IdentityLease> {
        let mut dir = self.directory();

        if dir.held.contains_key(identity) {
            dir.contended_total += 1;
            let mut held: Vec<IdentityId> = dir.held.keys().cloned().collect();
            held.sort();
            return Err(Error::LockContention {
                identity: identity.clone(),
                held,
            });
        }

        dir.next_generation += 1;
        dir.acquired_total += 1;
        let generation = dir.next_generation;
        dir.held.insert(
            identity.clone(),
            LockEntry {
                generation,
                purpose: purpose.into(),
                acquired_at: Instant::now(),
            },
        );

        Ok(IdentityLease {
            identity: identity.clone(),
            generation,
            directory: Arc::clone(&self.directory),
        })
    }

    /// Release an identity's lock. Releasing an unheld identity is a no-op.
    ///
    /// Returns whether a lock was actually released.
    pub fn release(&self, identity: &IdentityId) -> bool {
        self.directory().held.remove(identity).is_some()
    }

    /// Check whether an identity is locked.
    pub fn is_locked(&self, identity: &IdentityId) -> bool {
        self.directory().held.contains_key(identity)
    }

    /// All currently held identities, sorted.
    pub fn held(&self) -> Vec<IdentityId> {
        let mut held: Vec<IdentityId> = self.directory().held.keys().cloned().collect();
        held.sort();
        held
    }

    /// Details about the lock on an identity (if held).
    pub fn holder(&self, identity: &IdentityId) -> Option<HeldLock> {
        self.directory().held.get(identity).map(|entry| HeldLock {
            identity: identity.clone(),
            purpose: entry.purpose.clone(),
            acquired_at: entry.acquired_at,
        })
    }

    /// Snapshot of every held lock, sorted by identity.
    pub fn snapshot(&self) -> Vec<HeldLock> {
        let dir = self.directory();
        let mut locks: Vec<HeldLock> = dir
            .held
            .iter()
            .map(|(identity, entry)| HeldLock {
                identity: identity.clone(),
                purpose: entry.purpose.clone(),
                acquired_at: entry.acquired_at,
            })
            .collect();
        locks.sort_by(|a, b| a.identity.cmp(&b.identity));
        locks
    }

    /// Get statistics about the registry.
    pub fn stats(&self) -> LockStats {
        let dir = self.directory();
        LockStats {
            held: dir.held.len(),
            acquired_total: dir.acquired_total,
            contended_total: dir.contended_total,
        }
    }
}

fn lock_directory(directory: &Mutex<LockDirectory>) -> MutexGuard<'_, LockDirectory> {
    directory.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Guard for a held identity lock. Dropping it releases the lock.
///
/// A lease only releases the acquisition it was created for: if the lock was
/// explicitly released and re-acquired in the meantime, dropping the stale
/// lease leaves the new holder alone.
#[must_use = "dropping the lease releases the identity immediately"]
pub struct IdentityLease {
    identity: IdentityId,
    generation: u64,
    directory: Arc<Mutex<LockDirectory>>,
}

impl IdentityLease {
    /// The locked identity.
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }
}

impl std::fmt::Debug for IdentityLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityLease")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        let mut dir = lock_directory(&self.directory);
        if dir
            .held
            .get(&self.identity)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            dir.held.remove(&self.identity);
        }
    }
}

/// Statistics about identity locks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Number of identities currently locked.
    pub held: usize,
    /// Successful acquisitions since creation.
    pub acquired_total: u64,
    /// Acquisitions rejected because the identity was busy.
    pub contended_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> IdentityId {
        IdentityId::new(s)
    }

    #[test]
    fn test_acquire_and_release() {
        let locks = IdentityLocks::new();
        let lease = locks.acquire(&id("a")).unwrap();

        assert!(locks.is_locked(&id("a")));
        assert_eq!(lease.identity(), &id("a"));
        assert!(locks.release(&id("a")));
        assert!(!locks.is_locked(&id("a")));
    }

    #[test]
    fn test_second_acquire_fails_fast() {
        let locks = IdentityLocks::new();
        let _lease = locks.acquire(&id("a")).unwrap();

        let err = locks.acquire(&id("a")).unwrap_err();
        assert!(matches!(err, Error::LockContention { ref identity, .. } if *identity == id("a")));
    }

    #[test]
    fn test_contention_reports_all_held() {
        let locks = IdentityLocks::new();
        let _a = locks.acquire(&id("a")).unwrap();
        let _c = locks.acquire(&id("c")).unwrap();
        let _b = locks.acquire(&id("b")).unwrap();

        match locks.acquire(&id("b")) {
            Err(Error::LockContention { held, .. }) => {
                assert_eq!(held, vec![id("a"), id("b"), id("c")]);
            }
            other => panic!("expected contention, got {:?}", other),
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let locks = IdentityLocks::new();
        assert!(!locks.release(&id("a")));

        let lease = locks.acquire(&id("a")).unwrap();
        assert!(locks.release(&id("a")));
        assert!(!locks.release(&id("a")));
        drop(lease);

        assert!(locks.acquire(&id("a")).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let locks = IdentityLocks::new();
        {
            let _lease = locks.acquire(&id("a")).unwrap();
            assert!(locks.is_locked(&id("a")));
        }
        assert!(!locks.is_locked(&id("a")));
        assert!(locks.acquire(&id("a")).is_ok());
    }

    #[test]
    fn test_stale_lease_does_not_release_new_holder() {
        let locks = IdentityLocks::new();
        let stale = locks.acquire(&id("a")).unwrap();
        locks.release(&id("a"));

        let _fresh = locks.acquire_for(&id("a"), "fresh").unwrap();
        drop(stale);

        assert!(locks.is_locked(&id("a")));
        assert_eq!(locks.holder(&id("a")).unwrap().purpose, "fresh");
    }

    #[test]
    fn test_release_then_acquire_repeatedly() {
        let locks = IdentityLocks::new();
        for _ in 0..100 {
            let lease = locks.acquire(&id("a")).unwrap();
            drop(lease);
        }
        assert_eq!(locks.stats().held, 0);
        assert_eq!(locks.stats().acquired_total, 100);
    }

    #[test]
    fn test_stats_and_snapshot() {
        let locks = IdentityLocks::new();
        let _a = locks.acquire_for(&id("a"), "join chan/1").unwrap();
        let _ = locks.acquire(&id("a"));

        let stats = locks.stats();
        assert_eq!(stats.held, 1);
        assert_eq!(stats.contended_total, 1);

        let snapshot = locks.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].purpose, "join chan/1");
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let locks = IdentityLocks::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the lease alive past every other attempt.
                    let lease = locks.acquire(&IdentityId::new("shared")).ok();
                    std::thread::sleep(Duration::from_millis(50));
                    lease.is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(!locks.is_locked(&IdentityId::new("shared")));
    }
}
