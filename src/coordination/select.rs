//! Pluggable randomness for identity selection and pacing jitter.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::model::IdentityId;

/// Chooses identities from an eligible-set snapshot and samples delays.
pub trait Selector: Send + Sync {
    /// Pick up to `n` distinct identities from `pool`.
    fn pick(&self, pool: &[IdentityId], n: usize) -> Vec<IdentityId>;

    /// Sample a delay in `[min, max]`.
    fn jitter(&self, min: Duration, max: Duration) -> Duration;
}

/// Uniform random selection backed by a [`StdRng`].
pub struct RandomSelector {
    rng: Mutex<StdRng>,
}

impl RandomSelector {
    /// Seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic selector for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Seeded when a seed is given, entropy otherwise.
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map(Self::seeded).unwrap_or_else(Self::from_entropy)
    }
}

impl Selector for RandomSelector {
    fn pick(&self, pool: &[IdentityId], n: usize) -> Vec<IdentityId> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        pool.choose_multiple(&mut *rng, n.min(pool.len())).cloned().collect()
    }

    fn jitter(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let millis = rng.gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(millis as u64)
    }
}

/// Takes identities in pool order and always returns the minimum delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderedSelector;

impl Selector for OrderedSelector {
    fn pick(&self, pool: &[IdentityId], n: usize) -> Vec<IdentityId> {
        pool.iter().take(n).cloned().collect()
    }

    fn jitter(&self, min: Duration, _max: Duration) -> Duration {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(n: usize) -> Vec<IdentityId> {
        (0..n).map(|i| IdentityId::new(format!("acc-{}", i))).collect()
    }

    #[test]
    fn test_pick_is_distinct_and_bounded() {
        let selector = RandomSelector::seeded(7);
        let picked = selector.pick(&pool(10), 4);
        assert_eq!(picked.len(), 4);
        assert_eq!(picked.iter().collect::<HashSet<_>>().len(), 4);

        assert_eq!(selector.pick(&pool(3), 10).len(), 3);
        assert!(selector.pick(&[], 2).is_empty());
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let a = RandomSelector::seeded(42).pick(&pool(20), 5);
        let b = RandomSelector::seeded(42).pick(&pool(20), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_jitter_in_range() {
        let selector = RandomSelector::seeded(1);
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(200);
        for _ in 0..50 {
            let d = selector.jitter(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(selector.jitter(max, min), max);
    }

    #[test]
    fn test_ordered_selector() {
        let picked = OrderedSelector.pick(&pool(5), 2);
        assert_eq!(picked, vec![IdentityId::new("acc-0"), IdentityId::new("acc-1")]);
    }
}
