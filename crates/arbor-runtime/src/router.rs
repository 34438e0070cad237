//! Directional routing
//!
//! TigerStyle: Pure decision function, no I/O.
//!
//! Topology: every agent owns one stream. An agent's shell subscribes to
//! its own stream and to its parent's stream, so producing to a stream
//! reaches the owner and all of the owner's children.
//!
//! ```text
//!   arrival        direction  dispatch  forward to
//!   ------------   ---------  --------  ---------------------------------
//!   local          Up         yes       parent stream
//!   local          Down       yes       own stream
//!   local          Both       yes       own stream + parent stream
//!   own stream     Both       yes       parent stream (Both)
//!   own stream     Up/Down    yes       -
//!   parent stream  Down       yes       own stream (Down)
//!   parent stream  Both       yes       own stream, rewritten to Down
//!   parent stream  Up         yes       -
//! ```
//!
//! A `Both` envelope arriving from the parent stream is never sent back up:
//! the parent's stream already reached every sibling, so re-forwarding
//! would oscillate between the two levels.

use arbor_core::agent::AgentId;
use arbor_core::config::RouterConfig;
use arbor_core::constants::HOP_COUNT_CEILING_MAX;
use arbor_core::envelope::{Direction, Envelope};
use std::fmt;

/// Where an envelope came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Published by the local agent
    Local,
    /// Received on the agent's own stream (from itself or a child)
    OwnStream,
    /// Received on the parent's stream
    ParentStream,
}

impl Arrival {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Arrival::Local => "local",
            Arrival::OwnStream => "own_stream",
            Arrival::ParentStream => "parent_stream",
        }
    }
}

/// Stream that receives a forwarded copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// The agent's own stream (fan-out to children)
    Own,
    /// The parent's stream (parent plus siblings)
    Parent(AgentId),
}

/// One forwarded copy
#[derive(Debug, Clone)]
pub struct Forward {
    /// Destination stream
    pub target: StreamTarget,
    /// Envelope for the next hop
    pub envelope: Envelope,
}

/// Why an envelope was dropped
///
/// Discards are expected protocol behavior, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Already processed by this agent
    Duplicate,
    /// Past the publisher's `max_hop_count`
    HopLimit,
    /// Past the router's hard ceiling
    HopCeiling,
    /// This agent already forwarded it
    Loop,
    /// Arrived from a stream the agent no longer follows
    StaleSource,
    /// Agent is not active
    Inactive,
}

impl DiscardReason {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Duplicate => "duplicate",
            DiscardReason::HopLimit => "hop_limit",
            DiscardReason::HopCeiling => "hop_ceiling",
            DiscardReason::Loop => "loop",
            DiscardReason::StaleSource => "stale_source",
            DiscardReason::Inactive => "inactive",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the router needs about one arrival
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    /// The envelope as received
    pub envelope: &'a Envelope,
    /// Where it came from
    pub arrival: Arrival,
    /// The receiving agent
    pub self_id: &'a AgentId,
    /// The receiving agent's current parent
    pub parent: Option<&'a AgentId>,
}

/// Outcome of routing one envelope
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Drop without dispatching or forwarding
    Discard(DiscardReason),
    /// Process locally and/or forward
    Deliver {
        /// Invoke local handlers
        dispatch: bool,
        /// The envelope was published by the receiving agent
        is_self_origin: bool,
        /// Copies for the next hop
        forwards: Vec<Forward>,
    },
}

/// Stateless router
#[derive(Debug, Clone, Copy)]
pub struct Router {
    hop_count_ceiling: u32,
}

impl Router {
    /// Create a router from configuration
    pub fn new(config: &RouterConfig) -> Self {
        Self::with_ceiling(config.hop_count_ceiling)
    }

    /// Create a router with an explicit hop ceiling
    pub fn with_ceiling(hop_count_ceiling: u32) -> Self {
        assert!(hop_count_ceiling > 0, "hop ceiling must be positive");
        assert!(
            hop_count_ceiling <= HOP_COUNT_CEILING_MAX,
            "hop ceiling exceeds HOP_COUNT_CEILING_MAX"
        );
        Self { hop_count_ceiling }
    }

    /// Hard hop ceiling
    pub fn hop_count_ceiling(&self) -> u32 {
        self.hop_count_ceiling
    }

    /// Decide dispatch and forwarding for one arrival
    ///
    /// Deduplication happens before this call.
    pub fn route(&self, input: &RouteInput<'_>) -> RouteDecision {
        let envelope = input.envelope;
        let hops = envelope.current_hop_count;

        // Hop gate: past the limit means discard; at the limit means
        // dispatch but stop travelling.
        if hops > self.hop_count_ceiling {
            return RouteDecision::Discard(DiscardReason::HopCeiling);
        }
        if let Some(max) = envelope.max_hop_count {
            if hops > max {
                return RouteDecision::Discard(DiscardReason::HopLimit);
            }
        }

        if input.arrival != Arrival::Local && envelope.was_published_by(input.self_id) {
            return RouteDecision::Discard(DiscardReason::Loop);
        }

        let can_forward =
            hops < self.hop_count_ceiling && envelope.max_hop_count.map_or(true, |max| hops < max);

        let mut forwards = Vec::new();
        if can_forward {
            for (target, direction) in Self::next_hops(input) {
                forwards.push(Forward {
                    target,
                    envelope: envelope.forwarded_by(input.self_id, direction),
                });
            }
        }

        debug_assert!(forwards.len() <= 2);
        debug_assert!(forwards
            .iter()
            .all(|f| f.envelope.current_hop_count == hops + 1));

        RouteDecision::Deliver {
            dispatch: envelope.dispatchable(),
            is_self_origin: &envelope.sender_id == input.self_id,
            forwards,
        }
    }

    /// Forwarding table (see module docs)
    fn next_hops(input: &RouteInput<'_>) -> Vec<(StreamTarget, Direction)> {
        let parent = || input.parent.map(|p| StreamTarget::Parent(p.clone()));
        let mut hops = Vec::with_capacity(2);

        match (input.arrival, input.envelope.direction) {
            (Arrival::Local, Direction::Up) => {
                hops.extend(parent().map(|t| (t, Direction::Up)));
            }
            (Arrival::Local, Direction::Down) => {
                hops.push((StreamTarget::Own, Direction::Down));
            }
            (Arrival::Local, Direction::Both) => {
                hops.push((StreamTarget::Own, Direction::Both));
                hops.extend(parent().map(|t| (t, Direction::Both)));
            }
            (Arrival::OwnStream, Direction::Both) => {
                hops.extend(parent().map(|t| (t, Direction::Both)));
            }
            (Arrival::OwnStream, Direction::Up | Direction::Down) => {}
            (Arrival::ParentStream, Direction::Down | Direction::Both) => {
                hops.push((StreamTarget::Own, Direction::Down));
            }
            (Arrival::ParentStream, Direction::Up) => {}
        }

        hops
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(&RouterConfig::default())
    }
}
