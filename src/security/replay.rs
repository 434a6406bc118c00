// Replay protection for authenticated IVs
// Remembers recent IV fingerprints in two rotating generations

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

/// Largest supported capacity.
///
/// The false positive rate is up to `2 * capacity / 2^32`, roughly
/// 1 / 100,000 at this bound. Larger capacities need a 64-bit fingerprint.
pub const MAX_CAPACITY: usize = 20_000;

/// Number of leading IV bytes that make up a fingerprint
pub const FINGERPRINT_LEN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayCacheError {
    #[error("Replay cache capacity {requested} exceeds the maximum of {max}; false positive rate would be too high")]
    CapacityTooLarge { requested: usize, max: usize },
}

/// Upper bound on the probability that a fresh IV is reported as a replay
pub fn false_positive_rate(capacity: usize) -> f64 {
    2.0 * capacity as f64 / 2f64.powi(32)
}

/// Compact stand-in for an IV, taken from its first four bytes (big-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u32);

impl Fingerprint {
    /// Derive the fingerprint of an IV.
    ///
    /// Callers must pass at least four bytes. Shorter input is padded with
    /// zeros so the function stays total.
    pub fn of(iv: &[u8]) -> Self {
        debug_assert!(
            iv.len() >= FINGERPRINT_LEN,
            "IV shorter than {} bytes",
            FINGERPRINT_LEN
        );

        let mut prefix = [0u8; FINGERPRINT_LEN];
        let n = iv.len().min(FINGERPRINT_LEN);
        prefix[..n].copy_from_slice(&iv[..n]);
        Self(u32::from_be_bytes(prefix))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Fingerprint {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Anything that can decide whether an authenticated IV is new.
///
/// Returns `true` for a new IV, `false` for a replay.
pub trait IvFilter {
    fn add(&self, iv: &[u8]) -> bool;
}

/// Two-generation set of recent IV fingerprints
struct Generations {
    active: HashSet<Fingerprint>,
    archive: HashSet<Fingerprint>,
}

/// Detects whether an IV was among the most recent `capacity` IVs.
///
/// Every fingerprint is remembered for at least `capacity` and at most
/// `2 * capacity` later distinct insertions. Both generations use std's
/// randomly keyed hasher, so a hostile client cannot cheaply precompute
/// colliding fingerprints that degrade lookups.
///
/// A cache with capacity 0 is disabled and reports every IV as new.
pub struct ReplayCache {
    capacity: usize,
    // `None` when disabled
    inner: Option<Mutex<Generations>>,
}

impl ReplayCache {
    /// Create a cache that remembers at least the last `capacity` IVs
    pub fn new(capacity: usize) -> Result<Self, ReplayCacheError> {
        if capacity > MAX_CAPACITY {
            return Err(ReplayCacheError::CapacityTooLarge {
                requested: capacity,
                max: MAX_CAPACITY,
            });
        }

        if capacity == 0 {
            return Ok(Self::disabled());
        }

        debug!(
            capacity,
            false_positive_rate = false_positive_rate(capacity),
            "replay cache created"
        );

        Ok(Self {
            capacity,
            inner: Some(Mutex::new(Generations {
                active: HashSet::with_capacity(capacity),
                archive: HashSet::new(),
            })),
        })
    }

    /// Create a disabled cache. Every IV is reported as new.
    pub fn disabled() -> Self {
        Self {
            capacity: 0,
            inner: None,
        }
    }

    /// Record an IV. Returns `false` if it was already present.
    ///
    /// Only IVs that passed authentication should be added; otherwise an
    /// unauthenticated client can force rotations and evict other users'
    /// entries.
    pub fn add(&self, iv: &[u8]) -> bool {
        let Some(inner) = &self.inner else {
            return true;
        };

        let fingerprint = Fingerprint::of(iv);

        // Nothing below can panic while the sets are half-updated, so a
        // poisoned lock still guards consistent state.
        let mut generations = inner.lock().unwrap_or_else(PoisonError::into_inner);

        if generations.active.contains(&fingerprint) {
            return false;
        }

        let in_archive = generations.archive.contains(&fingerprint);
        generations.active.insert(fingerprint);

        if generations.active.len() == self.capacity {
            let fresh = HashSet::with_capacity(self.capacity);
            generations.archive = std::mem::replace(&mut generations.active, fresh);
        }

        !in_archive
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Sizes of the (active, archive) generations
    #[cfg(test)]
    pub(crate) fn generation_sizes(&self) -> (usize, usize) {
        match &self.inner {
            Some(inner) => {
                let generations = inner.lock().unwrap_or_else(PoisonError::into_inner);
                (generations.active.len(), generations.archive.len())
            }
            None => (0, 0),
        }
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for ReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl IvFilter for ReplayCache {
    fn add(&self, iv: &[u8]) -> bool {
        ReplayCache::add(self, iv)
    }
}

impl<F: IvFilter + ?Sized> IvFilter for &F {
    fn add(&self, iv: &[u8]) -> bool {
        (**self).add(iv)
    }
}

impl<F: IvFilter + ?Sized> IvFilter for Arc<F> {
    fn add(&self, iv: &[u8]) -> bool {
        (**self).add(iv)
    }
}

// No cache at all behaves like a disabled one
impl<F: IvFilter> IvFilter for Option<F> {
    fn add(&self, iv: &[u8]) -> bool {
        match self {
            Some(filter) => filter.add(iv),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 16-byte IV whose fingerprint is `n`
    fn iv(n: u32) -> [u8; 16] {
        let mut iv = [0xAAu8; 16];
        iv[..4].copy_from_slice(&n.to_be_bytes());
        iv
    }

    #[test]
    fn test_fingerprint_is_big_endian_prefix() {
        let fp = Fingerprint::of(&[0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF]);
        assert_eq!(fp.as_u32(), 0x0102_0304);
    }

    #[test]
    fn test_fingerprint_ignores_tail() {
        let mut a = iv(7);
        let mut b = iv(7);
        a[15] = 1;
        b[15] = 2;
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_new_then_replay() {
        let cache = ReplayCache::new(10).unwrap();
        assert!(cache.add(&iv(1)));
        assert!(!cache.add(&iv(1)));
        assert!(!cache.add(&iv(1)));
    }

    #[test]
    fn test_capacity_one() {
        let cache = ReplayCache::new(1).unwrap();
        assert!(cache.add(&iv(1)));
        assert_eq!(cache.generation_sizes(), (0, 1));
        assert!(!cache.add(&iv(1)));
    }

    #[test]
    fn test_max_capacity_accepted() {
        let cache = ReplayCache::new(MAX_CAPACITY).unwrap();
        assert_eq!(cache.capacity(), MAX_CAPACITY);
        assert!(cache.is_enabled());
    }

    #[test]
    fn test_capacity_too_large() {
        let err = ReplayCache::new(MAX_CAPACITY + 1).unwrap_err();
        assert_eq!(
            err,
            ReplayCacheError::CapacityTooLarge {
                requested: MAX_CAPACITY + 1,
                max: MAX_CAPACITY,
            }
        );
    }

    #[test]
    fn test_disabled_cache() {
        for cache in [
            ReplayCache::new(0).unwrap(),
            ReplayCache::disabled(),
            ReplayCache::default(),
        ] {
            assert!(!cache.is_enabled());
            for _ in 0..3 {
                assert!(cache.add(&iv(42)));
            }
            assert_eq!(cache.generation_sizes(), (0, 0));
        }
    }

    #[test]
    fn test_missing_cache_is_disabled() {
        let cache: Option<ReplayCache> = None;
        assert!(cache.add(&iv(1)));
        assert!(cache.add(&iv(1)));

        let cache = Some(ReplayCache::new(4).unwrap());
        assert!(cache.add(&iv(1)));
        assert!(!cache.add(&iv(1)));
    }

    #[test]
    fn test_rotation_sequence() {
        let cache = ReplayCache::new(2).unwrap();
        let (a, b, c) = (iv(0xA), iv(0xB), iv(0xC));

        assert!(cache.add(&a));
        assert!(cache.add(&b)); // rotates: archive = {A, B}
        assert_eq!(cache.generation_sizes(), (0, 2));
        assert!(!cache.add(&a)); // found in archive
        assert!(cache.add(&c)); // rotates again: archive = {A, C}
        assert!(!cache.add(&a));
    }

    #[test]
    fn test_first_iv_survives_one_rotation() {
        let capacity = 100;
        let cache = ReplayCache::new(capacity).unwrap();

        for n in 0..capacity as u32 {
            assert!(cache.add(&iv(n)));
        }
        assert!(cache.add(&iv(capacity as u32)));
        assert!(!cache.add(&iv(0)));
    }

    #[test]
    fn test_forgotten_after_two_rotations() {
        let cache = ReplayCache::new(2).unwrap();

        assert!(cache.add(&iv(1)));
        assert!(cache.add(&iv(2))); // first rotation
        assert!(cache.add(&iv(3)));
        assert!(cache.add(&iv(4))); // second rotation drops {1, 2}

        assert!(cache.add(&iv(1)));
    }

    #[test]
    fn test_active_hit_does_not_mutate() {
        let cache = ReplayCache::new(3).unwrap();
        cache.add(&iv(1));
        cache.add(&iv(2));
        assert_eq!(cache.generation_sizes(), (2, 0));

        assert!(!cache.add(&iv(2)));
        assert_eq!(cache.generation_sizes(), (2, 0));
    }

    #[test]
    fn test_false_positive_rate() {
        assert_eq!(false_positive_rate(0), 0.0);
        let at_max = false_positive_rate(MAX_CAPACITY);
        assert!(at_max < 1.0 / 100_000.0);
        assert!(at_max > 1.0 / 110_000.0);
    }

    #[test]
    fn test_poisoned_lock_still_usable() {
        let cache = Arc::new(ReplayCache::new(8).unwrap());
        cache.add(&iv(5));

        let poisoner = Arc::clone(&cache);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.as_ref().unwrap().lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(!cache.add(&iv(5)));
        assert!(cache.add(&iv(6)));
    }

    proptest! {
        #[test]
        fn prop_memory_bounded(
            capacity in 1usize..64,
            fingerprints in proptest::collection::vec(any::<u32>(), 0..512),
        ) {
            let cache = ReplayCache::new(capacity).unwrap();
            for n in fingerprints {
                cache.add(&iv(n));
                let (active, archive) = cache.generation_sizes();
                prop_assert!(active < capacity);
                prop_assert!(archive <= capacity);
                prop_assert!(active + archive <= 2 * capacity);
            }
        }

        #[test]
        fn prop_immediate_repeat_is_replay(
            capacity in 1usize..=MAX_CAPACITY,
            fingerprints in proptest::collection::vec(any::<u32>(), 1..64),
        ) {
            let cache = ReplayCache::new(capacity).unwrap();
            for n in fingerprints {
                cache.add(&iv(n));
                prop_assert!(!cache.add(&iv(n)));
            }
        }
    }
}
