//! Agent system: shared collaborators and wiring helpers
//!
//! TigerStyle: Single entry point, explicit configuration.
//!
//! An [`AgentSystem`] owns what every shell in one process shares: the
//! stream provider, the deduplicator and the hierarchy directory. Shells are
//! created through it so they all see the same instances.

use crate::dedup::{DeliveryKey, Deduplicator};
use crate::hierarchy::HierarchyDirectory;
use crate::shell::{AgentShell, ShellDeps};
use crate::stream::{LocalStreamProvider, StreamProvider};
use arbor_core::agent::{Agent, AgentId};
use arbor_core::config::ArborConfig;
use arbor_core::error::Result;
use arbor_core::io::IoContext;
use std::sync::Arc;
use tracing::info;

/// Process-wide agent system
pub struct AgentSystem {
    config: ArborConfig,
    deps: ShellDeps,
}

impl std::fmt::Debug for AgentSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSystem")
            .field("config", &self.config)
            .field("dedup", &self.deps.dedup)
            .field("hierarchy_edges", &self.deps.directory.len())
            .finish()
    }
}

impl AgentSystem {
    /// Create a system with in-process streams and production I/O
    pub fn new(config: ArborConfig) -> Result<Self> {
        Self::with_io(config, IoContext::production())
    }

    /// Create a system with custom I/O providers (for DST)
    pub fn with_io(config: ArborConfig, io: IoContext) -> Result<Self> {
        let streams = Arc::new(LocalStreamProvider::new(config.stream.clone())?);
        Self::with_streams(config, io, streams)
    }

    /// Create a system over an external stream provider
    pub fn with_streams(
        config: ArborConfig,
        io: IoContext,
        streams: Arc<dyn StreamProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let dedup = Arc::new(Deduplicator::new(&config.dedup, io.time.clone())?);
        info!(
            hop_count_ceiling = config.router.hop_count_ceiling,
            dedup_ttl_ms = config.dedup.ttl_ms,
            dedup_capacity = config.dedup.capacity,
            "Agent system created"
        );

        Ok(Self {
            deps: ShellDeps {
                streams,
                dedup,
                directory: Arc::new(HierarchyDirectory::new()),
                io,
            },
            config,
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    /// I/O providers shared by every shell
    pub fn io(&self) -> &IoContext {
        &self.deps.io
    }

    /// Shared duplicate filter
    pub fn deduplicator(&self) -> &Arc<Deduplicator<DeliveryKey>> {
        &self.deps.dedup
    }

    /// Shared hierarchy directory
    pub fn directory(&self) -> &Arc<HierarchyDirectory> {
        &self.deps.directory
    }

    /// Stream provider
    pub fn streams(&self) -> &Arc<dyn StreamProvider> {
        &self.deps.streams
    }

    /// Bind an agent to a new, inactive shell
    pub fn spawn<A: Agent>(&self, id: AgentId, agent: A) -> Arc<AgentShell<A>> {
        AgentShell::with_checked_config(id, agent, self.config.router.clone(), self.deps.clone())
    }

    /// Make `child` a child of `parent` (both sides of the relationship)
    ///
    /// # Errors
    /// `HierarchyCycle` if `parent` descends from `child`; `TooManyChildren`
    /// if `parent` is full (the child's parent link is rolled back).
    pub async fn link<P: Agent, C: Agent>(
        &self,
        parent: &AgentShell<P>,
        child: &AgentShell<C>,
    ) -> Result<()> {
        let previous = child.parent();
        child.set_parent(parent.id().clone()).await?;
        if let Err(e) = parent.add_child(child.id().clone()) {
            match previous {
                Some(p) => child.set_parent(p).await?,
                None => {
                    child.clear_parent().await?;
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Undo [`AgentSystem::link`]
    pub async fn unlink<P: Agent, C: Agent>(
        &self,
        parent: &AgentShell<P>,
        child: &AgentShell<C>,
    ) -> Result<()> {
        parent.remove_child(child.id());
        if child.parent().as_ref() == Some(parent.id()) {
            child.clear_parent().await?;
        }
        Ok(())
    }
}
