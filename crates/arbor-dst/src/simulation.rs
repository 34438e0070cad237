//! Simulation harness for deterministic testing
//!
//! TigerStyle: Reproducible test execution with explicit configuration.
//!
//! Every simulation runs on a fresh single-threaded tokio runtime. Envelope
//! ids, deduplication timestamps and event store timestamps are all derived
//! from the seed and the simulated clock, so a failing run can be replayed
//! with `DST_SEED=<seed>`.

use crate::clock::SimClock;
use crate::fault::{FaultConfig, FaultInjector, FaultInjectorBuilder};
use crate::rng::DeterministicRng;
use crate::storage::SimEventStore;
use arbor_core::config::ArborConfig;
use arbor_core::io::{IoContext, RngProvider, TimeProvider};
use arbor_eventsourcing::EventStore;
use arbor_runtime::AgentSystem;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Configuration for a simulation
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Simulated start time in milliseconds since epoch (None = clock default)
    pub start_time_ms: Option<u64>,
}

impl SimConfig {
    /// Create a config with the given seed
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start_time_ms: None,
        }
    }

    /// Create config from DST_SEED environment variable or random
    pub fn from_env_or_random() -> Self {
        let seed = std::env::var("DST_SEED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(rand::random);

        tracing::info!(seed = seed, "DST seed (set DST_SEED={} to replay)", seed);

        Self::new(seed)
    }

    /// Start the simulated clock at `ms`
    pub fn with_start_time_ms(mut self, ms: u64) -> Self {
        self.start_time_ms = Some(ms);
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Environment provided to simulation tests
pub struct SimEnvironment {
    /// Deterministic clock
    pub clock: SimClock,
    /// Deterministic RNG
    pub rng: DeterministicRng,
    /// I/O context wired to the clock and RNG above
    pub io_context: IoContext,
    /// Event store with fault injection
    pub store: Arc<SimEventStore>,
    /// Fault injector (shared across all components)
    pub faults: Arc<FaultInjector>,
}

impl SimEnvironment {
    /// Independent RNG stream for a test component
    pub fn fork_rng(&self) -> DeterministicRng {
        self.rng.fork()
    }

    /// Advance simulated time
    pub fn advance_time_ms(&self, ms: u64) {
        self.clock.advance_ms(ms);
    }

    /// Current simulated time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Time provider for components that take one
    pub fn time(&self) -> Arc<dyn TimeProvider> {
        self.io_context.time.clone()
    }

    /// RNG provider for components that take one
    pub fn rng_provider(&self) -> Arc<dyn RngProvider> {
        self.io_context.rng.clone()
    }

    /// The simulated store as a trait object
    pub fn event_store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    /// Agent system driven by simulated time and randomness
    pub fn agent_system(&self, config: ArborConfig) -> arbor_core::Result<AgentSystem> {
        AgentSystem::with_io(config, self.io_context.clone())
    }
}

/// Deterministic simulation harness
pub struct Simulation {
    config: SimConfig,
    fault_configs: Vec<FaultConfig>,
}

impl Simulation {
    /// Create a simulation
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            fault_configs: Vec::new(),
        }
    }

    /// Add a fault to inject
    pub fn with_fault(mut self, fault: FaultConfig) -> Self {
        self.fault_configs.push(fault);
        self
    }

    /// Add several faults
    pub fn with_faults(mut self, faults: impl IntoIterator<Item = FaultConfig>) -> Self {
        self.fault_configs.extend(faults);
        self
    }

    /// Seed of this simulation
    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    fn build_environment(self) -> SimEnvironment {
        let rng = DeterministicRng::new(self.config.seed);
        let clock = match self.config.start_time_ms {
            Some(ms) => SimClock::from_millis(ms),
            None => SimClock::default(),
        };

        let mut fault_builder = FaultInjectorBuilder::new(rng.fork());
        for fault in self.fault_configs {
            fault_builder = fault_builder.with_fault(fault);
        }
        let faults = Arc::new(fault_builder.build());

        let io_context = IoContext::new(
            Arc::new(clock.clone()) as Arc<dyn TimeProvider>,
            Arc::new(rng.clone()) as Arc<dyn RngProvider>,
        );

        let store = Arc::new(SimEventStore::new(
            clock.clone(),
            rng.fork(),
            faults.clone(),
        ));

        SimEnvironment {
            clock,
            rng,
            io_context,
            store,
            faults,
        }
    }

    /// Run a test on a fresh single-threaded runtime
    pub fn run<F, Fut, T>(self, test: F) -> Result<T, SimulationError>
    where
        F: FnOnce(SimEnvironment) -> Fut,
        Fut: Future<Output = arbor_core::Result<T>>,
    {
        let seed = self.config.seed;
        let env = self.build_environment();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SimulationError::RuntimeError(e.to_string()))?;

        let result = runtime.block_on(test(env));
        if let Err(e) = &result {
            tracing::error!(seed = seed, error = %e, "Simulation failed");
        }
        result.map_err(SimulationError::TestFailed)
    }

    /// Run a test on the caller's runtime
    pub async fn run_async<F, Fut, T>(self, test: F) -> Result<T, SimulationError>
    where
        F: FnOnce(SimEnvironment) -> Fut,
        Fut: Future<Output = arbor_core::Result<T>>,
    {
        let env = self.build_environment();
        test(env).await.map_err(SimulationError::TestFailed)
    }
}

/// Errors that can occur during simulation
#[derive(Error, Debug)]
pub enum SimulationError {
    /// Test function returned an error
    #[error("Test failed: {0}")]
    TestFailed(arbor_core::Error),
    /// Runtime initialization failed
    #[error("Runtime error: {0}")]
    RuntimeError(String),
}
