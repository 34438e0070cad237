//! Seeded randomness for simulation
//!
//! TigerStyle: One seed reproduces a whole run.
//!
//! [`DeterministicRng`] implements [`RngProvider`], so envelope ids minted by
//! shells, topologies built by tests and fault decisions all derive from the
//! same seed.

use arbor_core::io::RngProvider;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Mixes a fork index into the parent seed
const FORK_SEED_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

/// ChaCha20 stream shared by all clones
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    seed: u64,
    stream: Arc<Mutex<ChaCha20Rng>>,
    forks: Arc<AtomicU64>,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            stream: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            forks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Seed from `DST_SEED`, or pick one at random and log it
    pub fn from_env_or_random() -> Self {
        let seed = match std::env::var("DST_SEED").ok().and_then(|s| s.parse().ok()) {
            Some(seed) => seed,
            None => rand::random(),
        };
        tracing::info!(seed, "DST seed (set DST_SEED={} to replay)", seed);
        Self::new(seed)
    }

    /// Seed this stream was created from
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn stream(&self) -> MutexGuard<'_, ChaCha20Rng> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn next_u64(&self) -> u64 {
        self.stream().gen()
    }

    /// Uniform in [0, 1)
    pub fn next_f64(&self) -> f64 {
        self.stream().gen()
    }

    /// True with `probability`
    pub fn next_bool(&self, probability: f64) -> bool {
        debug_assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1]"
        );
        self.stream().gen_bool(probability.clamp(0.0, 1.0))
    }

    /// Uniform in [min, max)
    pub fn next_range(&self, min: u64, max: u64) -> u64 {
        assert!(min < max, "empty range {}..{}", min, max);
        self.stream().gen_range(min..max)
    }

    /// Uniform index into a collection of `len` items
    pub fn next_index(&self, len: usize) -> usize {
        assert!(len > 0, "cannot index an empty collection");
        self.stream().gen_range(0..len)
    }

    /// One element of `items`, or `None` if empty
    pub fn choose<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut *self.stream())
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.stream());
    }

    /// Independent stream for a sub-component
    ///
    /// The n-th fork of a given seed is always the same stream, regardless
    /// of how much the parent has been consumed.
    pub fn fork(&self) -> Self {
        let n = self.forks.fetch_add(1, Ordering::SeqCst);
        Self::new(self.seed.wrapping_add(n).wrapping_mul(FORK_SEED_MULTIPLIER))
    }
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RngProvider for DeterministicRng {
    fn next_u64(&self) -> u64 {
        DeterministicRng::next_u64(self)
    }

    fn next_f64(&self) -> f64 {
        DeterministicRng::next_f64(self)
    }

    fn gen_bool(&self, probability: f64) -> bool {
        self.next_bool(probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let a = DeterministicRng::new(12345);
        let b = DeterministicRng::new(12345);
        let xs: Vec<u64> = (0..50).map(|_| a.next_u64()).collect();
        let ys: Vec<u64> = (0..50).map(|_| b.next_u64()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_clones_share_stream() {
        let a = DeterministicRng::new(1);
        let b = a.clone();
        let first = a.next_u64();
        assert_ne!(b.next_u64(), first);
    }

    #[test]
    fn test_bool_extremes() {
        let rng = DeterministicRng::new(42);
        assert!((0..100).all(|_| !rng.next_bool(0.0)));
        assert!((0..100).all(|_| rng.next_bool(1.0)));
    }

    #[test]
    fn test_range_and_choose() {
        let rng = DeterministicRng::new(42);
        assert!((0..100).all(|_| (10..20).contains(&rng.next_range(10, 20))));
        assert_eq!(rng.choose::<u8>(&[]), None);
        assert_eq!(rng.choose(&[7]), Some(&7));
    }

    #[test]
    fn test_fork_ignores_parent_consumption() {
        let a = DeterministicRng::new(7);
        let b = DeterministicRng::new(7);
        b.next_u64();
        let (fa, fb) = (a.fork(), b.fork());
        assert_eq!(fa.seed(), fb.seed());
        assert_eq!(fa.next_u64(), fb.next_u64());
        assert_ne!(a.fork().seed(), fa.seed());
    }

    #[test]
    fn test_uuids_follow_seed() {
        let uuid = RngProvider::gen_uuid(&DeterministicRng::new(99));
        assert_eq!(uuid, RngProvider::gen_uuid(&DeterministicRng::new(99)));
        assert_eq!(uuid.len(), 36);
    }
}
