//! Arbor Event Sourcing
//!
//! Persistence of agent state as an ordered, replayable log of domain events.
//!
//! # Overview
//!
//! - [`EventStore`]: backend contract (append with optimistic concurrency,
//!   range reads, latest snapshot)
//! - [`MemoryEventStore`]: in-process backend for tests and simulation
//! - [`EventSourcedCore`]: stage, confirm, replay and snapshot for one agent
//!
//! # TigerStyle
//! - Dense versions from 1; `Version::INITIAL` means an empty log
//! - A rejected confirm leaves state and staged events untouched
//! - Bounded batch sizes on append and replay

pub mod agent;
pub mod memory;
pub mod snapshot;
pub mod store;

pub use agent::{DomainEvent, EventSourced, EventSourcedCore};
pub use memory::MemoryEventStore;
pub use snapshot::{EveryNVersions, NeverSnapshot, SnapshotPolicy};
pub use store::{EventQuery, EventRecord, EventStore, NewEvent, SnapshotRecord};
