//! Arbor Core
//!
//! Core types, errors, and constants for the Arbor hierarchical agent
//! framework.
//!
//! # Overview
//!
//! Arbor agents form a tree. Each agent owns one message stream; events
//! published `Up` reach the parent and its other children, events published
//! `Down` fan out through the subtree, and `Both` does both. This crate holds
//! the backend-independent vocabulary: identities, envelopes, the agent
//! trait and its handler table, optimistic-concurrency versions,
//! configuration, and the time/randomness seams used for deterministic
//! testing.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `AGENT_ID_LENGTH_BYTES_MAX`)
//! - Assertions on invariants
//! - No recursion (bounded iteration only)

pub mod agent;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod io;
pub mod metrics;
pub mod occ;
pub mod telemetry;

pub use agent::{Agent, AgentContext, AgentId, OutboundEvent};
pub use config::{
    ArborConfig, DedupConfig, EventSourcingConfig, OverflowPolicy, RouterConfig, StreamConfig,
};
pub use constants::*;
pub use envelope::{Direction, Envelope, EnvelopeId, Event, EventPayload, PublishOptions};
pub use error::{Error, Result};
pub use handlers::{EnvelopeHandlerFn, HandlerOptions, HandlerTable, HandlerTableBuilder};
pub use io::{IoContext, RngProvider, StdRngProvider, TimeProvider, WallClockTime};
pub use occ::Version;
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
