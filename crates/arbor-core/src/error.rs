//! Error types for Arbor
//!
//! TigerStyle: Explicit error types with context, using thiserror.

use thiserror::Error;

/// Result type alias for Arbor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Arbor error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Agent Errors
    // =========================================================================
    #[error("Invalid agent ID: {id}, reason: {reason}")]
    InvalidAgentId { id: String, reason: String },

    #[error("Agent ID too long: {length} bytes exceeds limit of {limit} bytes")]
    AgentIdTooLong { length: usize, limit: usize },

    #[error("Agent activation failed: {id}, reason: {reason}")]
    AgentActivationFailed { id: String, reason: String },

    #[error("Agent not active: {id}, state: {state}")]
    AgentNotActive { id: String, state: String },

    #[error("Handler failed: agent {agent_id}, event type {event_type}, reason: {reason}")]
    HandlerFailed {
        agent_id: String,
        event_type: String,
        reason: String,
    },

    #[error("Operation timed out: {operation} after {timeout_ms}ms")]
    OperationTimedOut { operation: String, timeout_ms: u64 },

    #[error("Operation cancelled: {operation}")]
    OperationCancelled { operation: String },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    #[error("Payload type mismatch: expected {expected}, found {actual}")]
    PayloadTypeMismatch { expected: String, actual: String },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    // =========================================================================
    // Hierarchy Errors
    // =========================================================================
    #[error("Hierarchy cycle: setting parent of {child} to {parent} would form a cycle")]
    HierarchyCycle { child: String, parent: String },

    #[error("Hierarchy too deep: ancestor chain of {id} exceeds {limit} levels")]
    HierarchyTooDeep { id: String, limit: usize },

    #[error("Too many children: {id} has {count} children (limit: {limit})")]
    TooManyChildren {
        id: String,
        count: usize,
        limit: usize,
    },

    // =========================================================================
    // Stream Errors
    // =========================================================================
    #[error("Stream full: {stream}, depth: {depth}, max: {max}")]
    StreamFull {
        stream: String,
        depth: usize,
        max: usize,
    },

    #[error("Stream unavailable: {stream}, reason: {reason}")]
    StreamUnavailable { stream: String, reason: String },

    #[error("Subscription not found: {subscription} on stream {stream}")]
    SubscriptionNotFound { stream: String, subscription: String },

    // =========================================================================
    // Event Store Errors
    // =========================================================================
    #[error("Version conflict: agent {agent_id}, expected version {expected}, actual version {actual}")]
    VersionConflict {
        agent_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Event store unavailable: {operation}, reason: {reason}")]
    StorageUnavailable { operation: String, reason: String },

    #[error("Event log corrupted: agent {agent_id}, reason: {reason}")]
    EventLogCorrupted { agent_id: String, reason: String },

    #[error("Event batch too large: {count} events exceeds limit of {limit}")]
    EventBatchTooLarge { count: usize, limit: usize },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("Deserialization failed: {reason}")]
    DeserializationFailed { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a handler failed error
    pub fn handler_failed(
        agent_id: impl Into<String>,
        event_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::HandlerFailed {
            agent_id: agent_id.into(),
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage unavailable error
    pub fn storage_unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is retriable
    ///
    /// Conflicts, full or unreachable streams and timeouts are transient;
    /// everything else is fatal for the operation that produced it.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::StreamFull { .. }
                | Self::StreamUnavailable { .. }
                | Self::OperationTimedOut { .. }
        )
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Self::DeserializationFailed {
                reason: e.to_string(),
            }
        } else {
            Self::SerializationFailed {
                reason: e.to_string(),
            }
        }
    }
}
