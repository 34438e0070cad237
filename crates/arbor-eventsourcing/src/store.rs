//! Event store contract
//!
//! TigerStyle: Explicit versions, atomic batch append, typed conflicts.
//!
//! An event store keeps, per agent, a dense log of events numbered from 1
//! plus at most one "latest" snapshot. Appends carry the version the writer
//! last observed; a store whose log has moved on rejects the whole batch
//! with `Error::VersionConflict`.

use arbor_core::agent::AgentId;
use arbor_core::constants::{EVENT_PAYLOAD_SIZE_BYTES_MAX, EVENT_TYPE_NAME_LENGTH_BYTES_MAX};
use arbor_core::error::{Error, Result};
use arbor_core::occ::Version;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

// =============================================================================
// Records
// =============================================================================

/// An event to be appended (not yet versioned)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Type discriminator
    pub event_type: String,
    /// Serialized event
    pub payload: Bytes,
}

impl NewEvent {
    /// Create an event from an already-serialized payload
    ///
    /// # Errors
    /// Rejects empty or oversized type names and oversized payloads.
    pub fn new(event_type: impl Into<String>, payload: Bytes) -> Result<Self> {
        let event_type = event_type.into();
        if event_type.is_empty() || event_type.len() > EVENT_TYPE_NAME_LENGTH_BYTES_MAX {
            return Err(Error::InvalidConfiguration {
                field: "event.event_type".into(),
                reason: format!(
                    "length {} outside 1..={}",
                    event_type.len(),
                    EVENT_TYPE_NAME_LENGTH_BYTES_MAX
                ),
            });
        }
        if payload.len() > EVENT_PAYLOAD_SIZE_BYTES_MAX {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit: EVENT_PAYLOAD_SIZE_BYTES_MAX,
            });
        }
        Ok(Self {
            event_type,
            payload,
        })
    }

    /// Serialize `event` as JSON
    pub fn encode<E: Serialize>(event_type: impl Into<String>, event: &E) -> Result<Self> {
        let event_type = event_type.into();
        let payload = serde_json::to_vec(event).map_err(|e| Error::SerializationFailed {
            reason: format!("{}: {}", event_type, e),
        })?;
        Self::new(event_type, Bytes::from(payload))
    }
}

/// A stored event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Owning agent
    pub agent_id: AgentId,
    /// Position in the agent's log (from 1)
    pub version: Version,
    /// Type discriminator
    pub event_type: String,
    /// Serialized event
    pub payload: Bytes,
    /// When the store accepted it
    pub timestamp_ms: u64,
}

impl EventRecord {
    /// Deserialize the payload
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E> {
        serde_json::from_slice(&self.payload).map_err(|e| Error::DeserializationFailed {
            reason: format!(
                "event {} {} of {}: {}",
                self.event_type, self.version, self.agent_id, e
            ),
        })
    }
}

/// A stored snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Owning agent
    pub agent_id: AgentId,
    /// Version of the last event folded into `state`
    pub version: Version,
    /// Serialized state
    pub state: Bytes,
    /// When the store accepted it
    pub timestamp_ms: u64,
}

/// Range query over one agent's log
///
/// Bounds are inclusive. Results are always in ascending version order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQuery {
    /// First version to return
    pub from_version: Version,
    /// Last version to return
    pub to_version: Option<Version>,
    /// Maximum number of records
    pub max_count: Option<usize>,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self::all()
    }
}

impl EventQuery {
    /// Every event
    pub fn all() -> Self {
        Self {
            from_version: Version::new(1),
            to_version: None,
            max_count: None,
        }
    }

    /// Events strictly after `version`
    pub fn after(version: Version) -> Self {
        Self {
            from_version: version.increment(),
            ..Self::all()
        }
    }

    /// Stop at `version` (inclusive)
    pub fn with_to_version(mut self, version: Version) -> Self {
        self.to_version = Some(version);
        self
    }

    /// Return at most `count` records
    pub fn with_max_count(mut self, count: usize) -> Self {
        self.max_count = Some(count);
        self
    }

    /// Whether `version` falls within the bounds
    pub fn contains(&self, version: Version) -> bool {
        version >= self.from_version && self.to_version.map_or(true, |to| version <= to)
    }
}

// =============================================================================
// EventStore Trait
// =============================================================================

/// Storage backend for event-sourced agents
///
/// Implementations must make `append_events` atomic: either every event in
/// the batch is stored with consecutive versions, or none is.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch after checking the log is at `expected_version`
    ///
    /// Returns the version of the last appended event.
    ///
    /// # Errors
    /// `VersionConflict` if the log is not at `expected_version`.
    async fn append_events(
        &self,
        agent_id: &AgentId,
        events: Vec<NewEvent>,
        expected_version: Version,
    ) -> Result<Version>;

    /// Events matching `query`, ascending by version
    async fn get_events(&self, agent_id: &AgentId, query: EventQuery) -> Result<Vec<EventRecord>>;

    /// Version of the last stored event (`Version::INITIAL` if none)
    async fn get_latest_version(&self, agent_id: &AgentId) -> Result<Version>;

    /// Store `state` as the latest snapshot at `version`
    ///
    /// A snapshot older than the stored one is ignored.
    async fn save_snapshot(&self, agent_id: &AgentId, version: Version, state: Bytes)
        -> Result<()>;

    /// The latest snapshot, if any
    async fn get_latest_snapshot(&self, agent_id: &AgentId) -> Result<Option<SnapshotRecord>>;
}
