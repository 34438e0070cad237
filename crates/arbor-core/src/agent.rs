//! Agent abstractions for Arbor
//!
//! TigerStyle: Explicit types, assertions, bounded operations.

use crate::constants::*;
use crate::envelope::{Direction, Event, EventPayload, PublishOptions};
use crate::error::{Error, Result};
use crate::handlers::HandlerTable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// AgentId
// =============================================================================

/// Unique identifier for an agent
///
/// An agent ID is a namespace plus an id. It also addresses the agent's
/// message stream.
///
/// # TigerStyle
/// - Explicit validation on construction
/// - Immutable after creation
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    namespace: String,
    id: String,
}

impl AgentId {
    /// Create a new AgentId with validation
    ///
    /// # Errors
    /// Returns error if either part is empty, too long, or contains characters
    /// other than alphanumerics, dash, underscore and dot.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let id = id.into();
        let qualified = || format!("{}:{}", namespace, id);

        if namespace.is_empty() || id.is_empty() {
            return Err(Error::InvalidAgentId {
                id: qualified(),
                reason: "namespace and id must not be empty".into(),
            });
        }

        if namespace.len() > AGENT_NAMESPACE_LENGTH_BYTES_MAX {
            return Err(Error::InvalidAgentId {
                id: qualified(),
                reason: format!(
                    "namespace length {} exceeds limit {}",
                    namespace.len(),
                    AGENT_NAMESPACE_LENGTH_BYTES_MAX
                ),
            });
        }

        if id.len() > AGENT_ID_LENGTH_BYTES_MAX {
            return Err(Error::AgentIdTooLong {
                length: id.len(),
                limit: AGENT_ID_LENGTH_BYTES_MAX,
            });
        }

        let valid_chars = |s: &str| {
            s.chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        };

        if !valid_chars(&namespace) || !valid_chars(&id) {
            return Err(Error::InvalidAgentId {
                id: qualified(),
                reason: "contains invalid characters".into(),
            });
        }

        Ok(Self { namespace, id })
    }

    /// Get the namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the full qualified name (namespace:id)
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

impl FromStr for AgentId {
    type Err = Error;

    /// Parse `namespace:id`
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((namespace, id)) => Self::new(namespace, id),
            None => Err(Error::InvalidAgentId {
                id: s.to_string(),
                reason: "expected namespace:id".into(),
            }),
        }
    }
}

// =============================================================================
// Agent Trait
// =============================================================================

/// Agent trait - implement to create hierarchical, event-driven agents
///
/// # TigerStyle
/// - Sequential execution guarantee (one envelope at a time per agent)
/// - Explicit lifecycle hooks (on_activate, on_deactivate)
/// - Handlers registered once, in an explicit table
#[async_trait]
pub trait Agent: Send + Sync + Sized + 'static {
    /// The agent's private state
    type State: Default + Send + Sync + 'static;

    /// Build the handler table
    ///
    /// Called once, when the agent is bound to its shell.
    fn handlers(&self) -> HandlerTable<Self>;

    /// Called when the agent is activated
    ///
    /// Events published here are routed once the hook returns.
    async fn on_activate(&self, _ctx: &mut AgentContext<Self::State>) -> Result<()> {
        Ok(())
    }

    /// Called before the agent is deactivated
    async fn on_deactivate(&self, _ctx: &mut AgentContext<Self::State>) -> Result<()> {
        Ok(())
    }

    /// Human-readable description, used in logs
    fn description(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

// =============================================================================
// AgentContext
// =============================================================================

/// An event queued by a handler for publication
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    /// Serialized event
    pub payload: EventPayload,
    /// Routing intent
    pub direction: Direction,
    /// Publisher limits
    pub options: PublishOptions,
}

/// Context provided to an agent during dispatch
///
/// Publishing from a handler only queues the event. The shell routes queued
/// events in order after the handler returns and before it takes the next
/// inbound envelope.
pub struct AgentContext<S> {
    /// The agent's unique identifier
    pub id: AgentId,

    /// The agent's in-memory state
    pub state: S,

    parent: Option<AgentId>,
    children: Vec<AgentId>,
    outbox: Vec<OutboundEvent>,
}

impl<S: Default> AgentContext<S> {
    /// Create a new context with default state
    pub fn with_default_state(id: AgentId) -> Self {
        Self::new(id, S::default())
    }
}

impl<S> AgentContext<S> {
    /// Create a new context
    pub fn new(id: AgentId, state: S) -> Self {
        Self {
            id,
            state,
            parent: None,
            children: Vec::new(),
            outbox: Vec::new(),
        }
    }

    /// Parent at dispatch time
    pub fn parent(&self) -> Option<&AgentId> {
        self.parent.as_ref()
    }

    /// Children at dispatch time
    pub fn children(&self) -> &[AgentId] {
        &self.children
    }

    /// Queue an event for publication
    pub fn publish<E: Event>(&mut self, event: &E, direction: Direction) -> Result<()> {
        self.publish_with(event, direction, PublishOptions::default())
    }

    /// Queue an event for publication with explicit limits
    pub fn publish_with<E: Event>(
        &mut self,
        event: &E,
        direction: Direction,
        options: PublishOptions,
    ) -> Result<()> {
        if self.outbox.len() >= SHELL_OUTBOX_DRAIN_COUNT_MAX {
            return Err(Error::Internal {
                message: format!(
                    "agent {} queued more than {} events in one dispatch",
                    self.id, SHELL_OUTBOX_DRAIN_COUNT_MAX
                ),
            });
        }

        let payload = EventPayload::pack(event)?;
        self.outbox.push(OutboundEvent {
            payload,
            direction,
            options,
        });
        Ok(())
    }

    /// Number of events waiting to be routed
    pub fn pending_publish_count(&self) -> usize {
        self.outbox.len()
    }

    /// Refresh the hierarchy view before a dispatch
    pub fn set_topology(&mut self, parent: Option<AgentId>, children: Vec<AgentId>) {
        self.parent = parent;
        self.children = children;
    }

    /// Take every queued event, leaving the outbox empty
    pub fn take_outbox(&mut self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.outbox)
    }
}
