//! Arbor DST - Deterministic Simulation Testing
//!
//! TigerBeetle/FoundationDB-style deterministic simulation testing for the
//! Arbor runtime and event store.
//!
//! # Overview
//!
//! DST enables testing hierarchical propagation and event sourcing with:
//! - Deterministic time control (SimClock)
//! - Reproducible random numbers and envelope ids (DeterministicRng)
//! - Fault injection (FaultInjector)
//! - A simulated event store (SimEventStore)
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor_dst::{FaultConfig, FaultType, SimConfig, Simulation};
//!
//! #[test]
//! fn test_with_faults() {
//!     let config = SimConfig::from_env_or_random();
//!     Simulation::new(config)
//!         .with_fault(FaultConfig::new(FaultType::StorageWriteFail, 0.1))
//!         .run(|env| async move {
//!             // Test code using env.clock, env.rng, env.store
//!             Ok(())
//!         })
//!         .unwrap();
//! }
//! ```
//!
//! # TigerStyle
//!
//! - All operations are deterministic given the same seed
//! - Always log the seed for reproducibility
//! - Explicit fault types and probabilities

pub mod clock;
pub mod fault;
pub mod rng;
pub mod simulation;
pub mod storage;

pub use clock::SimClock;
pub use fault::{
    FaultConfig, FaultInjector, FaultInjectorBuilder, FaultStats, FaultType, StoreOperation,
};
pub use rng::DeterministicRng;
pub use simulation::{SimConfig, SimEnvironment, Simulation, SimulationError};
pub use storage::SimEventStore;
