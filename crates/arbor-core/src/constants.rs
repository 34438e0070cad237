//! TigerStyle constants for Arbor
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Agent Limits
// =============================================================================

/// Maximum length of an agent ID in bytes
pub const AGENT_ID_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of an agent namespace in bytes
pub const AGENT_NAMESPACE_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of an event type discriminator in bytes
pub const EVENT_TYPE_NAME_LENGTH_BYTES_MAX: usize = 256;

/// Maximum size of a serialized event payload in bytes (1 MB)
pub const EVENT_PAYLOAD_SIZE_BYTES_MAX: usize = 1024 * 1024;

/// Maximum number of children a single agent may hold
pub const AGENT_CHILDREN_COUNT_MAX: usize = 100_000;

/// Maximum depth walked when checking an ancestor chain for cycles
pub const HIERARCHY_DEPTH_MAX: usize = 1024;

/// Maximum duration for activation/deactivation hooks in milliseconds (30 sec)
pub const AGENT_LIFECYCLE_TIMEOUT_MS_MAX: u64 = 30 * 1000;

// =============================================================================
// Routing Limits
// =============================================================================

/// Hard ceiling on forwards for any envelope, independent of `max_hop_count`
///
/// Guarantees termination even under a misconfigured hierarchy.
pub const HOP_COUNT_CEILING_DEFAULT: u32 = 128;

/// Largest configurable hop ceiling
pub const HOP_COUNT_CEILING_MAX: u32 = 1024;

/// Default depth of the per-shell inbox
pub const SHELL_INBOX_DEPTH_DEFAULT: usize = 1024;

/// Maximum depth of the per-shell inbox
pub const SHELL_INBOX_DEPTH_MAX: usize = 100_000;

/// Maximum number of locally-published envelopes drained after one dispatch
pub const SHELL_OUTBOX_DRAIN_COUNT_MAX: usize = 10_000;

/// Envelopes a worker takes off its inbox while one routing step waits on a
/// full stream
pub const SHELL_BACKLOG_COUNT_MAX: usize = 100_000;

// =============================================================================
// Deduplication Limits
// =============================================================================

/// Default time-to-live of a deduplication record in milliseconds (5 min)
pub const DEDUP_TTL_MS_DEFAULT: u64 = 5 * 60 * 1000;

/// Maximum time-to-live of a deduplication record in milliseconds (24 hours)
pub const DEDUP_TTL_MS_MAX: u64 = 24 * 60 * 60 * 1000;

/// Default maximum number of deduplication records
pub const DEDUP_ENTRIES_COUNT_DEFAULT: usize = 100_000;

/// Maximum number of deduplication records
pub const DEDUP_ENTRIES_COUNT_MAX: usize = 10_000_000;

/// Default number of deduplicator shards
pub const DEDUP_SHARDS_COUNT_DEFAULT: usize = 16;

/// Maximum number of deduplicator shards
pub const DEDUP_SHARDS_COUNT_MAX: usize = 1024;

// =============================================================================
// Stream Limits
// =============================================================================

/// Default depth of a single stream subscription queue
pub const STREAM_SUBSCRIPTION_DEPTH_DEFAULT: usize = 10_000;

/// Maximum depth of a single stream subscription queue
pub const STREAM_SUBSCRIPTION_DEPTH_MAX: usize = 1_000_000;

/// Maximum number of subscriptions on one stream
pub const STREAM_SUBSCRIPTIONS_COUNT_MAX: usize = 100_000;

// =============================================================================
// Event Sourcing Limits
// =============================================================================

/// Default snapshot interval in confirmed versions
pub const SNAPSHOT_INTERVAL_VERSIONS_DEFAULT: u64 = 100;

/// Default timeout for a confirm round trip in milliseconds (5 sec)
pub const CONFIRM_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

/// Maximum timeout for a confirm round trip in milliseconds (2 min)
pub const CONFIRM_TIMEOUT_MS_MAX: u64 = 120 * 1000;

/// Maximum number of events in a single append batch
pub const EVENT_BATCH_COUNT_MAX: usize = 10_000;

/// Default number of events read per replay page
pub const REPLAY_BATCH_COUNT_DEFAULT: usize = 1000;

/// Maximum number of events read per replay page
pub const REPLAY_BATCH_COUNT_MAX: usize = 100_000;

// =============================================================================
// Observability - Metric Names (TigerStyle: explicit, with units)
// =============================================================================

/// Metric: Total number of agent activations (counter)
pub const METRIC_NAME_AGENTS_ACTIVATED_TOTAL: &str = "arbor_agents_activated_total";

/// Metric: Total number of agent deactivations (counter)
pub const METRIC_NAME_AGENTS_DEACTIVATED_TOTAL: &str = "arbor_agents_deactivated_total";

/// Metric: Total number of envelopes routed (counter, labels: origin)
pub const METRIC_NAME_ENVELOPES_ROUTED_TOTAL: &str = "arbor_envelopes_routed_total";

/// Metric: Total number of envelopes discarded (counter, labels: reason)
pub const METRIC_NAME_ENVELOPES_DISCARDED_TOTAL: &str = "arbor_envelopes_discarded_total";

/// Metric: Total number of handler faults (counter)
pub const METRIC_NAME_HANDLER_FAULTS_TOTAL: &str = "arbor_handler_faults_total";

/// Metric: Handler duration in seconds (histogram)
pub const METRIC_NAME_HANDLER_DURATION_SECONDS: &str = "arbor_handler_duration_seconds";

/// Metric: Total number of events confirmed to the event store (counter)
pub const METRIC_NAME_EVENTS_CONFIRMED_TOTAL: &str = "arbor_events_confirmed_total";

/// Metric: Total number of optimistic-concurrency conflicts (counter)
pub const METRIC_NAME_CONFIRM_CONFLICTS_TOTAL: &str = "arbor_confirm_conflicts_total";

/// Metric: Number of events applied during replay (histogram)
pub const METRIC_NAME_REPLAY_EVENTS_COUNT: &str = "arbor_replay_events_count";

// Compile-time assertions for constant validity
const _: () = {
    assert!(AGENT_ID_LENGTH_BYTES_MAX >= 64);
    assert!(HOP_COUNT_CEILING_DEFAULT <= HOP_COUNT_CEILING_MAX);
    assert!(DEDUP_TTL_MS_DEFAULT <= DEDUP_TTL_MS_MAX);
    assert!(DEDUP_ENTRIES_COUNT_DEFAULT <= DEDUP_ENTRIES_COUNT_MAX);
    assert!(DEDUP_SHARDS_COUNT_DEFAULT <= DEDUP_SHARDS_COUNT_MAX);
    assert!(STREAM_SUBSCRIPTION_DEPTH_DEFAULT <= STREAM_SUBSCRIPTION_DEPTH_MAX);
    assert!(CONFIRM_TIMEOUT_MS_DEFAULT <= CONFIRM_TIMEOUT_MS_MAX);
    assert!(REPLAY_BATCH_COUNT_DEFAULT <= REPLAY_BATCH_COUNT_MAX);
};
