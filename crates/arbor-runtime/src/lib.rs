//! Arbor Runtime
//!
//! Event propagation engine for hierarchical agents.
//!
//! # Overview
//!
//! The runtime provides:
//! - A message stream contract with an in-process adapter
//! - Directional routing (`Up`, `Down`, `Both`) over parent/child streams
//! - Deduplication and hop limits that bound every propagation
//! - Agent shells: lifecycle, hierarchy, sequential dispatch
//!
//! # TigerStyle
//! - Bounded queues and bounded dedup memory
//! - Explicit lifecycle states
//! - Handler faults are contained and reported, never propagated

pub mod dedup;
pub mod hierarchy;
pub mod queue;
pub mod router;
pub mod shell;
pub mod stream;
pub mod system;

pub use dedup::{DeliveryKey, Deduplicator};
pub use hierarchy::{Hierarchy, HierarchyDirectory};
pub use queue::{QueueStats, SubscriptionQueue};
pub use router::{Arrival, DiscardReason, Forward, RouteDecision, RouteInput, Router, StreamTarget};
pub use shell::{AgentShell, HandlerFaulted, ShellDeps, ShellState, ShellStats};
pub use stream::{
    EnvelopeHandler, LocalStream, LocalStreamProvider, LocalSubscription, MessageStream,
    StreamProvider, StreamSubscription, SubscriptionId,
};
pub use system::AgentSystem;
