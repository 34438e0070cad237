//! Configuration for Arbor
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for Arbor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArborConfig {
    /// Routing and shell configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Deduplication configuration
    #[serde(default)]
    pub dedup: DedupConfig,

    /// In-process stream configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// Event sourcing configuration
    #[serde(default)]
    pub event_sourcing: EventSourcingConfig,
}

impl ArborConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        self.dedup.validate()?;
        self.stream.validate()?;
        self.event_sourcing.validate()?;
        Ok(())
    }

    /// Parse and validate a TOML document
    ///
    /// Missing sections and fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::InvalidConfiguration {
            field: "toml".into(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

fn exceeds(field: &str, value: impl std::fmt::Display, limit: impl std::fmt::Display) -> Error {
    Error::InvalidConfiguration {
        field: field.into(),
        reason: format!("{} exceeds limit {}", value, limit),
    }
}

fn must_be_positive(field: &str) -> Error {
    Error::InvalidConfiguration {
        field: field.into(),
        reason: "must be greater than 0".into(),
    }
}

// =============================================================================
// Router
// =============================================================================

/// Routing and shell configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Hard ceiling on forwards, independent of per-envelope limits
    #[serde(default = "default_hop_count_ceiling")]
    pub hop_count_ceiling: u32,

    /// Re-emit handler faults as `Up` diagnostic events
    #[serde(default = "default_emit_handler_faults")]
    pub emit_handler_faults: bool,

    /// Depth of each shell's inbox
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_hop_count_ceiling() -> u32 {
    HOP_COUNT_CEILING_DEFAULT
}

fn default_emit_handler_faults() -> bool {
    true
}

fn default_inbox_capacity() -> usize {
    SHELL_INBOX_DEPTH_DEFAULT
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            hop_count_ceiling: default_hop_count_ceiling(),
            emit_handler_faults: default_emit_handler_faults(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl RouterConfig {
    /// Check every field against its limits
    pub fn validate(&self) -> Result<()> {
        if self.hop_count_ceiling == 0 {
            return Err(must_be_positive("router.hop_count_ceiling"));
        }
        if self.hop_count_ceiling > HOP_COUNT_CEILING_MAX {
            return Err(exceeds(
                "router.hop_count_ceiling",
                self.hop_count_ceiling,
                HOP_COUNT_CEILING_MAX,
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(must_be_positive("router.inbox_capacity"));
        }
        if self.inbox_capacity > SHELL_INBOX_DEPTH_MAX {
            return Err(exceeds(
                "router.inbox_capacity",
                self.inbox_capacity,
                SHELL_INBOX_DEPTH_MAX,
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Dedup
// =============================================================================

/// Deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long a record suppresses duplicates (milliseconds)
    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,

    /// Maximum number of records across all shards
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,

    /// Number of independently locked shards
    #[serde(default = "default_dedup_shard_count")]
    pub shard_count: usize,
}

fn default_dedup_ttl_ms() -> u64 {
    DEDUP_TTL_MS_DEFAULT
}

fn default_dedup_capacity() -> usize {
    DEDUP_ENTRIES_COUNT_DEFAULT
}

fn default_dedup_shard_count() -> usize {
    DEDUP_SHARDS_COUNT_DEFAULT
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_dedup_ttl_ms(),
            capacity: default_dedup_capacity(),
            shard_count: default_dedup_shard_count(),
        }
    }
}

impl DedupConfig {
    /// Check every field against its limits
    pub fn validate(&self) -> Result<()> {
        if self.ttl_ms == 0 {
            return Err(must_be_positive("dedup.ttl_ms"));
        }
        if self.ttl_ms > DEDUP_TTL_MS_MAX {
            return Err(exceeds("dedup.ttl_ms", self.ttl_ms, DEDUP_TTL_MS_MAX));
        }
        if self.capacity == 0 {
            return Err(must_be_positive("dedup.capacity"));
        }
        if self.capacity > DEDUP_ENTRIES_COUNT_MAX {
            return Err(exceeds(
                "dedup.capacity",
                self.capacity,
                DEDUP_ENTRIES_COUNT_MAX,
            ));
        }
        if self.shard_count == 0 {
            return Err(must_be_positive("dedup.shard_count"));
        }
        if self.shard_count > DEDUP_SHARDS_COUNT_MAX {
            return Err(exceeds(
                "dedup.shard_count",
                self.shard_count,
                DEDUP_SHARDS_COUNT_MAX,
            ));
        }
        if self.shard_count > self.capacity {
            return Err(Error::InvalidConfiguration {
                field: "dedup.shard_count".into(),
                reason: format!(
                    "{} shards cannot share a capacity of {}",
                    self.shard_count, self.capacity
                ),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Stream
// =============================================================================

/// What a producer experiences when a subscription queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits for space
    #[default]
    Block,
    /// Oldest queued envelope is evicted (counted and logged)
    DropOldest,
    /// Producer receives `Error::StreamFull`
    Reject,
}

/// In-process stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Depth of each subscription queue
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,

    /// Behavior when a subscription queue is full
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_subscription_capacity() -> usize {
    STREAM_SUBSCRIPTION_DEPTH_DEFAULT
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscription_capacity: default_subscription_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl StreamConfig {
    /// Check every field against its limits
    pub fn validate(&self) -> Result<()> {
        if self.subscription_capacity == 0 {
            return Err(must_be_positive("stream.subscription_capacity"));
        }
        if self.subscription_capacity > STREAM_SUBSCRIPTION_DEPTH_MAX {
            return Err(exceeds(
                "stream.subscription_capacity",
                self.subscription_capacity,
                STREAM_SUBSCRIPTION_DEPTH_MAX,
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Event Sourcing
// =============================================================================

/// Event sourcing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourcingConfig {
    /// Confirmed versions between snapshots (0 = never snapshot)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Timeout for a confirm round trip (milliseconds)
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    /// Events read per replay page
    #[serde(default = "default_replay_batch_size")]
    pub replay_batch_size: usize,
}

fn default_snapshot_interval() -> u64 {
    SNAPSHOT_INTERVAL_VERSIONS_DEFAULT
}

fn default_confirm_timeout_ms() -> u64 {
    CONFIRM_TIMEOUT_MS_DEFAULT
}

fn default_replay_batch_size() -> usize {
    REPLAY_BATCH_COUNT_DEFAULT
}

impl Default for EventSourcingConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: default_snapshot_interval(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            replay_batch_size: default_replay_batch_size(),
        }
    }
}

impl EventSourcingConfig {
    /// Check every field against its limits
    pub fn validate(&self) -> Result<()> {
        if self.confirm_timeout_ms == 0 {
            return Err(must_be_positive("event_sourcing.confirm_timeout_ms"));
        }
        if self.confirm_timeout_ms > CONFIRM_TIMEOUT_MS_MAX {
            return Err(exceeds(
                "event_sourcing.confirm_timeout_ms",
                self.confirm_timeout_ms,
                CONFIRM_TIMEOUT_MS_MAX,
            ));
        }
        if self.replay_batch_size == 0 {
            return Err(must_be_positive("event_sourcing.replay_batch_size"));
        }
        if self.replay_batch_size > REPLAY_BATCH_COUNT_MAX {
            return Err(exceeds(
                "event_sourcing.replay_batch_size",
                self.replay_batch_size,
                REPLAY_BATCH_COUNT_MAX,
            ));
        }
        Ok(())
    }
}
