//! Time and randomness seams
//!
//! TigerStyle: All non-deterministic inputs go through a trait.
//!
//! Deduplication expiry, envelope timestamps, event timestamps and envelope
//! identities all read from these providers, so a simulation can swap in a
//! manually-advanced clock and a seeded generator and reproduce a run
//! exactly.
//!
//! ```text
//!        routing / dedup / event sourcing
//!                      │
//!          ┌───────────┴───────────┐
//!    TimeProvider             RngProvider
//!     │        │               │        │
//! WallClock  SimClock     StdRng   DeterministicRng
//!  (prod)     (dst)        (prod)       (dst)
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Time Provider
// ============================================================================

/// Source of the current time
///
/// Never call `SystemTime::now()` from routing or storage code; take a
/// `TimeProvider` instead.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch (or the simulation epoch)
    fn now_ms(&self) -> u64;

    /// Suspend for `ms` milliseconds of provider time
    async fn sleep_ms(&self, ms: u64);

    /// Monotonic timestamp for measuring durations
    fn monotonic_ms(&self) -> u64 {
        self.now_ms()
    }
}

/// Production time provider backed by the system clock
#[derive(Debug, Clone, Default)]
pub struct WallClockTime;

impl WallClockTime {
    /// Create a new wall clock time provider
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for WallClockTime {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

// ============================================================================
// RNG Provider
// ============================================================================

/// Source of randomness
///
/// Envelope identities are drawn from here rather than from a global
/// generator so simulations replay with identical ids.
pub trait RngProvider: Send + Sync + std::fmt::Debug {
    /// Next random 64-bit value
    fn next_u64(&self) -> u64;

    /// Random f64 in [0, 1)
    fn next_f64(&self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Random boolean that is true with the given probability
    fn gen_bool(&self, probability: f64) -> bool {
        assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1]"
        );
        self.next_f64() < probability
    }

    /// RFC 4122 version-4 UUID in canonical text form
    fn gen_uuid(&self) -> String {
        let raw = ((self.next_u64() as u128) << 64) | self.next_u64() as u128;
        // Set version (4) and variant (10xx) bits
        let raw = (raw & !(0xF << 76)) | (0x4 << 76);
        let raw = (raw & !(0x3 << 62)) | (0x2 << 62);
        let hex = format!("{:032x}", raw);
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

/// Production RNG provider
///
/// SplitMix64 over an atomic counter; lock-free and safe to share. Not
/// cryptographically secure.
#[derive(Debug)]
pub struct StdRngProvider {
    state: AtomicU64,
}

impl Default for StdRngProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StdRngProvider {
    /// Seed from the system clock
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    /// Seed explicitly (for testing)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }
}

impl RngProvider for StdRngProvider {
    fn next_u64(&self) -> u64 {
        let mut z = self
            .state
            .fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

// ============================================================================
// I/O Context
// ============================================================================

/// Bundle of the I/O providers handed to shells, stores and deduplicators
#[derive(Clone)]
pub struct IoContext {
    /// Time provider
    pub time: Arc<dyn TimeProvider>,
    /// RNG provider
    pub rng: Arc<dyn RngProvider>,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("time", &self.time)
            .field("rng", &self.rng)
            .finish()
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::production()
    }
}

impl IoContext {
    /// Wall clock and system-seeded RNG
    pub fn production() -> Self {
        Self {
            time: Arc::new(WallClockTime::new()),
            rng: Arc::new(StdRngProvider::new()),
        }
    }

    /// Custom providers (for DST)
    pub fn new(time: Arc<dyn TimeProvider>, rng: Arc<dyn RngProvider>) -> Self {
        Self { time, rng }
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    /// Fresh UUID string
    pub fn gen_uuid(&self) -> String {
        self.rng.gen_uuid()
    }
}
