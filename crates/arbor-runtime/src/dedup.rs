//! Envelope deduplication
//!
//! TigerStyle: Bounded memory, explicit TTL, lock per shard.
//!
//! A time- and capacity-bounded record of already-processed keys. Records
//! expire after `ttl_ms`; when a shard is full, expired records are purged
//! first and only then is the oldest live record evicted. Eviction can make
//! a later duplicate look new (a false negative) but can never make a new
//! key look like a duplicate.

use arbor_core::agent::AgentId;
use arbor_core::config::DedupConfig;
use arbor_core::envelope::EnvelopeId;
use arbor_core::error::Result;
use arbor_core::io::TimeProvider;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Deduplication key used by agent shells: (receiving agent, envelope)
pub type DeliveryKey = (AgentId, EnvelopeId);

#[derive(Debug)]
struct DedupShard<K> {
    /// Live records and their expiry
    expiries: HashMap<K, u64>,
    /// Insertion order, for expiry sweeps and capacity eviction
    ///
    /// May contain stale entries for keys re-recorded after expiring; those
    /// are recognized by a mismatched expiry and skipped.
    order: VecDeque<(K, u64)>,
}

impl<K: Hash + Eq + Clone> DedupShard<K> {
    fn new() -> Self {
        Self {
            expiries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Drop every record that has expired at `now_ms`
    fn purge_expired(&mut self, now_ms: u64) -> usize {
        let mut purged = 0;
        while let Some((_, expiry)) = self.order.front() {
            if *expiry > now_ms {
                break;
            }
            if let Some((key, expiry)) = self.order.pop_front() {
                if self.expiries.get(&key) == Some(&expiry) {
                    self.expiries.remove(&key);
                    purged += 1;
                }
            }
        }
        purged
    }

    /// Evict the oldest live record
    fn evict_oldest(&mut self) -> bool {
        while let Some((key, expiry)) = self.order.pop_front() {
            if self.expiries.get(&key) == Some(&expiry) {
                self.expiries.remove(&key);
                return true;
            }
        }
        false
    }
}

/// Thread-safe, sharded deduplicator
///
/// # TigerStyle
/// - Capacity split evenly across shards
/// - Expiry uses the injected `TimeProvider` (deterministic under DST)
pub struct Deduplicator<K> {
    shards: Vec<Mutex<DedupShard<K>>>,
    ttl_ms: u64,
    shard_capacity: usize,
    time: Arc<dyn TimeProvider>,
    evictions_count: AtomicU64,
}

impl<K> std::fmt::Debug for Deduplicator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("shards", &self.shards.len())
            .field("ttl_ms", &self.ttl_ms)
            .field("shard_capacity", &self.shard_capacity)
            .finish()
    }
}

impl<K: Hash + Eq + Clone> Deduplicator<K> {
    /// Create a deduplicator from configuration
    ///
    /// # Errors
    /// `InvalidConfiguration` if the TTL, capacity or shard count is out of
    /// bounds.
    pub fn new(config: &DedupConfig, time: Arc<dyn TimeProvider>) -> Result<Self> {
        config.validate()?;

        let shard_capacity = config.capacity / config.shard_count;
        debug_assert!(shard_capacity > 0);
        Ok(Self {
            shards: (0..config.shard_count)
                .map(|_| Mutex::new(DedupShard::new()))
                .collect(),
            ttl_ms: config.ttl_ms,
            shard_capacity,
            time,
            evictions_count: AtomicU64::new(0),
        })
    }

    fn shard(&self, key: &K) -> std::sync::MutexGuard<'_, DedupShard<K>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[index]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Record `key` if it has not been seen within the TTL
    ///
    /// Returns `true` if the key is new (and is now recorded), `false` if it
    /// is a duplicate.
    pub fn try_record(&self, key: K) -> bool {
        let now_ms = self.time.now_ms();
        let mut shard = self.shard(&key);

        if let Some(expiry) = shard.expiries.get(&key) {
            if *expiry > now_ms {
                return false;
            }
        }

        shard.purge_expired(now_ms);
        if shard.expiries.len() >= self.shard_capacity && shard.evict_oldest() {
            self.evictions_count.fetch_add(1, Ordering::Relaxed);
        }

        let expiry = now_ms.saturating_add(self.ttl_ms);
        shard.expiries.insert(key.clone(), expiry);
        shard.order.push_back((key, expiry));

        debug_assert!(shard.expiries.len() <= self.shard_capacity);
        true
    }

    /// Whether `key` is currently recorded and unexpired
    pub fn contains(&self, key: &K) -> bool {
        let now_ms = self.time.now_ms();
        let shard = self.shard(key);
        matches!(shard.expiries.get(key), Some(expiry) if *expiry > now_ms)
    }

    /// Number of records held (including expired ones not yet swept)
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).expiries.len())
            .sum()
    }

    /// Whether no records are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep expired records from every shard
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.time.now_ms();
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .purge_expired(now_ms)
            })
            .sum()
    }

    /// Live records evicted under capacity pressure
    pub fn evictions_count(&self) -> u64 {
        self.evictions_count.load(Ordering::Relaxed)
    }

    /// Configured time-to-live
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }
}
