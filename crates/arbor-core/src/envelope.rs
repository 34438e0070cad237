//! Envelopes and event payloads
//!
//! TigerStyle: Envelopes are values. A forward produces a new envelope, the
//! original is never mutated mid-flight.

use crate::agent::AgentId;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::io::RngProvider;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Event
// =============================================================================

/// A strongly-typed business event that can travel inside an envelope
///
/// `TYPE_NAME` is the discriminator handlers are matched on. It must be
/// unique within an application.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Ping { seq: u64 }
///
/// impl Event for Ping {
///     const TYPE_NAME: &'static str = "example.ping";
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type discriminator
    const TYPE_NAME: &'static str;
}

/// Serialized event plus its type discriminator
///
/// The routing core never looks inside `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    type_name: String,
    data: Bytes,
}

impl EventPayload {
    /// Serialize an event into a payload
    pub fn pack<E: Event>(event: &E) -> Result<Self> {
        let data = serde_json::to_vec(event).map_err(|e| Error::SerializationFailed {
            reason: format!("{}: {}", E::TYPE_NAME, e),
        })?;
        Self::from_parts(E::TYPE_NAME, Bytes::from(data))
    }

    /// Build a payload from an already-serialized body
    pub fn from_parts(type_name: impl Into<String>, data: Bytes) -> Result<Self> {
        let type_name = type_name.into();
        if type_name.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "event.type_name".into(),
                reason: "must not be empty".into(),
            });
        }

        if type_name.len() > EVENT_TYPE_NAME_LENGTH_BYTES_MAX {
            return Err(Error::InvalidConfiguration {
                field: "event.type_name".into(),
                reason: format!(
                    "length {} exceeds limit {}",
                    type_name.len(),
                    EVENT_TYPE_NAME_LENGTH_BYTES_MAX
                ),
            });
        }
        if data.len() > EVENT_PAYLOAD_SIZE_BYTES_MAX {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                limit: EVENT_PAYLOAD_SIZE_BYTES_MAX,
            });
        }

        Ok(Self { type_name, data })
    }

    /// Deserialize the payload as `E`
    ///
    /// # Errors
    /// `PayloadTypeMismatch` if the discriminator is not `E::TYPE_NAME`.
    pub fn unpack<E: Event>(&self) -> Result<E> {
        if !self.is::<E>() {
            return Err(Error::PayloadTypeMismatch {
                expected: E::TYPE_NAME.to_string(),
                actual: self.type_name.clone(),
            });
        }
        serde_json::from_slice(&self.data).map_err(|e| Error::DeserializationFailed {
            reason: format!("{}: {}", E::TYPE_NAME, e),
        })
    }

    /// Whether the payload carries an `E`
    pub fn is<E: Event>(&self) -> bool {
        self.type_name == E::TYPE_NAME
    }

    /// Type discriminator
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Raw serialized body
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

// =============================================================================
// Direction
// =============================================================================

/// Routing intent of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Toward ancestors (reaches the parent and its other children)
    Up,
    /// Toward descendants
    Down,
    /// Both ways
    Both,
}

impl Direction {
    /// Whether this direction travels toward the parent
    pub fn includes_up(&self) -> bool {
        matches!(self, Direction::Up | Direction::Both)
    }

    /// Whether this direction travels toward the children
    pub fn includes_down(&self) -> bool {
        matches!(self, Direction::Down | Direction::Both)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
            Direction::Both => write!(f, "both"),
        }
    }
}

// =============================================================================
// EnvelopeId
// =============================================================================

/// Globally unique envelope identity, used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Draw a fresh id from the given RNG
    pub fn generate(rng: &dyn RngProvider) -> Self {
        Self(rng.gen_uuid())
    }

    /// Wrap an existing id (e.g. one received from another backend)
    pub fn from_string(id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "envelope id must not be empty");
        Self(id)
    }

    /// Borrow the id text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// PublishOptions
// =============================================================================

/// Optional routing limits chosen by the publisher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Hops after which the envelope stops travelling (`None` = unlimited)
    pub max_hop_count: Option<u32>,
    /// Hops before which receivers do not dispatch locally (`None` = none)
    pub min_hop_count: Option<u32>,
    /// Tracing correlation id, propagated unchanged
    pub correlation_id: Option<String>,
}

impl PublishOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of hops
    pub fn with_max_hop_count(mut self, hops: u32) -> Self {
        self.max_hop_count = Some(hops);
        self
    }

    /// Skip local dispatch on the first `hops` hops
    pub fn with_min_hop_count(mut self, hops: u32) -> Self {
        self.min_hop_count = Some(hops);
        self
    }

    /// Attach a correlation id
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// The routed unit: payload plus routing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity used for deduplication
    pub id: EnvelopeId,
    /// Opaque typed event
    pub payload: EventPayload,
    /// Routing intent
    pub direction: Direction,
    /// Agent that published the envelope
    pub sender_id: AgentId,
    /// Number of forwards so far
    pub current_hop_count: u32,
    /// Upper hop bound (`None` = unlimited)
    pub max_hop_count: Option<u32>,
    /// Lower dispatch bound (`None` = none)
    pub min_hop_count: Option<u32>,
    /// Agents that have already forwarded this envelope, in order
    pub publishers: Vec<AgentId>,
    /// Propagated unchanged
    pub correlation_id: Option<String>,
    /// Publish time in milliseconds
    pub timestamp_ms: u64,
}

impl Envelope {
    /// Wrap a payload in a fresh envelope published by `sender`
    ///
    /// The hop count starts at zero and the sender is the only publisher.
    pub fn new(
        id: EnvelopeId,
        sender: AgentId,
        payload: EventPayload,
        direction: Direction,
        options: PublishOptions,
        timestamp_ms: u64,
    ) -> Self {
        if let (Some(min), Some(max)) = (options.min_hop_count, options.max_hop_count) {
            debug_assert!(min <= max, "min_hop_count must not exceed max_hop_count");
        }

        Self {
            id,
            payload,
            direction,
            sender_id: sender.clone(),
            current_hop_count: 0,
            max_hop_count: options.max_hop_count,
            min_hop_count: options.min_hop_count,
            publishers: vec![sender],
            correlation_id: options.correlation_id,
            timestamp_ms,
        }
    }

    /// Copy for the next hop, forwarded by `forwarder` with `direction`
    pub fn forwarded_by(&self, forwarder: &AgentId, direction: Direction) -> Self {
        let mut next = self.clone();
        next.current_hop_count = self.current_hop_count.saturating_add(1);
        next.direction = direction;
        if !next.publishers.contains(forwarder) {
            next.publishers.push(forwarder.clone());
        }

        debug_assert_eq!(next.current_hop_count, self.current_hop_count + 1);
        debug_assert_eq!(next.id, self.id);
        next
    }

    /// Whether `agent` already forwarded this envelope
    pub fn was_published_by(&self, agent: &AgentId) -> bool {
        self.publishers.contains(agent)
    }

    /// Whether the publisher's lower bound allows dispatch at the current hop
    pub fn dispatchable(&self) -> bool {
        match self.min_hop_count {
            Some(min) => self.current_hop_count >= min,
            None => true,
        }
    }

    /// Payload type discriminator
    pub fn event_type(&self) -> &str {
        self.payload.type_name()
    }
}
