//! Agent shell: lifecycle, hierarchy and routing for one agent
//!
//! TigerStyle: Explicit lifecycle states, sequential dispatch per agent.
//!
//! A shell binds one agent instance to its stream subscriptions. Envelopes
//! from the agent's own stream and from its parent's stream land in one
//! bounded inbox and are processed by a single worker task, one at a time:
//! deduplicate, route, dispatch to handlers, forward, then route whatever the
//! handlers published. Only then is the next envelope taken.
//!
//! ```text
//!                   +------------+
//!                   |  Inactive  | <-----+
//!                   +------------+       |
//!                         |              |
//!                         v              |
//!                   +------------+       |
//!                   | Activating | ------+  (hook failed)
//!                   +------------+       |
//!                         |              |
//!                         v              |
//!                   +------------+       |
//!                   |   Active   |       |
//!                   +------------+       |
//!                         |              |
//!                         v              |
//!                   +-------------+      |
//!                   | Deactivating| -----+
//!                   +-------------+
//! ```

use crate::dedup::{DeliveryKey, Deduplicator};
use crate::hierarchy::{Hierarchy, HierarchyDirectory};
use crate::router::{Arrival, DiscardReason, RouteDecision, RouteInput, Router, StreamTarget};
use crate::stream::{EnvelopeHandler, StreamProvider, StreamSubscription};
use arbor_core::agent::{Agent, AgentContext, AgentId, OutboundEvent};
use arbor_core::config::RouterConfig;
use arbor_core::constants::{
    AGENT_LIFECYCLE_TIMEOUT_MS_MAX, SHELL_BACKLOG_COUNT_MAX, SHELL_OUTBOX_DRAIN_COUNT_MAX,
};
use arbor_core::envelope::{
    Direction, Envelope, EnvelopeId, Event, EventPayload, PublishOptions,
};
use arbor_core::error::{Error, Result};
use arbor_core::handlers::HandlerTable;
use arbor_core::io::IoContext;
use arbor_core::metrics;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Lifecycle State
// =============================================================================

/// Shell lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellState {
    /// Not subscribed, not dispatching
    #[default]
    Inactive,
    /// Subscribing and running `on_activate`
    Activating,
    /// Dispatching envelopes
    Active,
    /// Unsubscribed, finishing in-flight work, running `on_deactivate`
    Deactivating,
}

impl ShellState {
    /// Whether stream envelopes are accepted
    pub fn accepts_envelopes(&self) -> bool {
        matches!(self, ShellState::Active)
    }

    /// Check if valid transition per the lifecycle state machine
    pub fn can_transition_to(&self, next: ShellState) -> bool {
        match (self, next) {
            (ShellState::Inactive, ShellState::Activating) => true,
            (ShellState::Activating, ShellState::Active) => true,
            (ShellState::Activating, ShellState::Inactive) => true,
            (ShellState::Active, ShellState::Deactivating) => true,
            (ShellState::Deactivating, ShellState::Inactive) => true,
            _ if *self == next => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ShellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellState::Inactive => write!(f, "inactive"),
            ShellState::Activating => write!(f, "activating"),
            ShellState::Active => write!(f, "active"),
            ShellState::Deactivating => write!(f, "deactivating"),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of a shell's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShellStats {
    /// Envelopes that reached at least one handler
    pub dispatched_count: u64,
    /// Envelopes dropped by the protocol (duplicate, hop limit, loop, ...)
    pub discarded_count: u64,
    /// Of which duplicates
    pub duplicate_count: u64,
    /// Handler invocations that returned an error or panicked
    pub fault_count: u64,
    /// Copies produced to streams
    pub forwarded_count: u64,
    /// Inbox envelopes dropped at deactivation
    pub dropped_count: u64,
    /// When the shell last became active
    pub activated_at_ms: Option<u64>,
    /// When the shell last dispatched an envelope
    pub last_activity_at_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct ShellCounters {
    dispatched: AtomicU64,
    discarded: AtomicU64,
    duplicates: AtomicU64,
    faults: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    /// 0 = never
    activated_at_ms: AtomicU64,
    /// 0 = never
    last_activity_at_ms: AtomicU64,
}

impl ShellCounters {
    fn snapshot(&self) -> ShellStats {
        let optional = |v: u64| if v == 0 { None } else { Some(v) };
        ShellStats {
            dispatched_count: self.dispatched.load(Ordering::Relaxed),
            discarded_count: self.discarded.load(Ordering::Relaxed),
            duplicate_count: self.duplicates.load(Ordering::Relaxed),
            fault_count: self.faults.load(Ordering::Relaxed),
            forwarded_count: self.forwarded.load(Ordering::Relaxed),
            dropped_count: self.dropped.load(Ordering::Relaxed),
            activated_at_ms: optional(self.activated_at_ms.load(Ordering::Relaxed)),
            last_activity_at_ms: optional(self.last_activity_at_ms.load(Ordering::Relaxed)),
        }
    }
}

// =============================================================================
// Diagnostic Event
// =============================================================================

/// Published `Up` when a handler fails, so ancestors can observe it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFaulted {
    /// Agent whose handler failed
    pub agent_id: AgentId,
    /// Type of the envelope being handled
    pub event_type: String,
    /// Envelope being handled
    pub envelope_id: EnvelopeId,
    /// Error message or panic payload
    pub reason: String,
}

impl Event for HandlerFaulted {
    const TYPE_NAME: &'static str = "arbor.handler_faulted";
}

// =============================================================================
// Shell Dependencies
// =============================================================================

/// Collaborators shared by every shell in a system
#[derive(Clone)]
pub struct ShellDeps {
    /// Resolves agent ids to streams
    pub streams: Arc<dyn StreamProvider>,
    /// Shared duplicate filter
    pub dedup: Arc<Deduplicator<DeliveryKey>>,
    /// Shared parent index for cycle checks
    pub directory: Arc<HierarchyDirectory>,
    /// Time and randomness
    pub io: IoContext,
}

/// An envelope waiting in a shell's inbox
#[derive(Debug)]
struct Inbound {
    /// Owner of the stream it arrived on
    source: AgentId,
    envelope: Envelope,
}

/// Subscription handler that feeds a shell's inbox
///
/// Copies the owner already forwarded are dropped here rather than queued:
/// the worker may be blocked producing them, and queueing the echo behind
/// it would wait on that same worker.
struct ShellInlet {
    source: AgentId,
    owner: AgentId,
    tx: mpsc::Sender<Inbound>,
    counters: Arc<ShellCounters>,
}

#[async_trait]
impl EnvelopeHandler for ShellInlet {
    async fn on_envelope(&self, envelope: Envelope) -> Result<()> {
        if envelope.was_published_by(&self.owner) {
            // Already recorded by the deduplicator when the owner routed it
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            metrics::record_envelope_discarded(DiscardReason::Duplicate.as_str());
            debug!(
                agent_id = %self.owner,
                stream = %self.source,
                envelope_id = %envelope.id,
                "Dropped echo of own forward"
            );
            return Ok(());
        }

        self.tx
            .send(Inbound {
                source: self.source.clone(),
                envelope,
            })
            .await
            .map_err(|_| Error::AgentNotActive {
                id: self.owner.to_string(),
                state: "inbox closed".into(),
            })
    }
}

struct ShellCore<A: Agent> {
    agent: A,
    ctx: AgentContext<A::State>,
    handlers: HandlerTable<A>,
}

struct Worker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ShellLinks {
    own: Option<Box<dyn StreamSubscription>>,
    parent: Option<Box<dyn StreamSubscription>>,
    inbox: Option<mpsc::Sender<Inbound>>,
    worker: Option<Worker>,
}

// =============================================================================
// AgentShell
// =============================================================================

/// Runtime wrapper around one agent
///
/// # TigerStyle
/// - One worker per active shell; handlers never run concurrently
/// - The hierarchy is mutated only through this API
/// - Handler faults are contained; routing continues
pub struct AgentShell<A: Agent> {
    id: AgentId,
    core: tokio::sync::Mutex<ShellCore<A>>,
    hierarchy: Mutex<Hierarchy>,
    state: Mutex<ShellState>,
    links: tokio::sync::Mutex<ShellLinks>,
    router: Router,
    config: RouterConfig,
    deps: ShellDeps,
    counters: Arc<ShellCounters>,
}

impl<A: Agent> std::fmt::Debug for AgentShell<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentShell")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("parent", &self.parent())
            .finish()
    }
}

impl<A: Agent> AgentShell<A> {
    /// Wrap an agent; the shell starts `Inactive`
    ///
    /// # Errors
    /// `InvalidConfiguration` if the hop ceiling or inbox capacity is out of
    /// bounds.
    pub fn new(id: AgentId, agent: A, config: RouterConfig, deps: ShellDeps) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::with_checked_config(id, agent, config, deps))
    }

    pub(crate) fn with_checked_config(
        id: AgentId,
        agent: A,
        config: RouterConfig,
        deps: ShellDeps,
    ) -> Arc<Self> {
        let handlers = agent.handlers();
        debug!(
            agent_id = %id,
            agent = %agent.description(),
            handlers = handlers.len(),
            "Creating shell"
        );

        Arc::new(Self {
            core: tokio::sync::Mutex::new(ShellCore {
                agent,
                ctx: AgentContext::with_default_state(id.clone()),
                handlers,
            }),
            id,
            hierarchy: Mutex::new(Hierarchy::new()),
            state: Mutex::new(ShellState::Inactive),
            links: tokio::sync::Mutex::new(ShellLinks::default()),
            router: Router::new(&config),
            config,
            deps,
            counters: Arc::new(ShellCounters::default()),
        })
    }

    /// The agent's id
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShellState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the shell is dispatching
    pub fn is_active(&self) -> bool {
        self.state() == ShellState::Active
    }

    fn set_state(&self, next: ShellState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(
            state.can_transition_to(next),
            "invalid shell transition {} -> {}",
            *state,
            next
        );
        *state = next;
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_envelopes() {
            Ok(())
        } else {
            Err(Error::AgentNotActive {
                id: self.id.to_string(),
                state: state.to_string(),
            })
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> ShellStats {
        self.counters.snapshot()
    }

    /// Read the agent's state
    pub async fn with_state<R>(&self, f: impl FnOnce(&A::State) -> R) -> R {
        let core = self.core.lock().await;
        f(&core.ctx.state)
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// Current parent
    pub fn parent(&self) -> Option<AgentId> {
        self.hierarchy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .parent()
            .cloned()
    }

    /// Current children
    pub fn children(&self) -> Vec<AgentId> {
        self.hierarchy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .children()
    }

    /// Attach to a parent and follow its stream
    ///
    /// # Errors
    /// `HierarchyCycle` if `parent` descends from this agent; stream errors
    /// if the parent's stream cannot be subscribed (the change is rolled back).
    #[instrument(skip(self), fields(agent_id = %self.id), level = "debug")]
    pub async fn set_parent(&self, parent: AgentId) -> Result<()> {
        let previous_edge = self.deps.directory.link(&self.id, &parent)?;
        let previous = {
            let mut hierarchy = self.hierarchy.lock().unwrap_or_else(|e| e.into_inner());
            hierarchy.set_parent(parent.clone())
        };
        if previous.as_ref() == Some(&parent) {
            return Ok(());
        }

        let mut links = self.links.lock().await;
        if let Some(old) = links.parent.take() {
            if let Err(e) = old.unsubscribe().await {
                warn!(agent_id = %self.id, error = %e, "Failed to leave previous parent stream");
            }
        }

        if let Some(tx) = links.inbox.clone() {
            match self.subscribe_to(&parent, &tx).await {
                Ok(subscription) => links.parent = Some(subscription),
                Err(e) => {
                    error!(agent_id = %self.id, parent = %parent, error = %e, "Failed to follow parent stream");
                    self.restore_parent(previous.clone(), previous_edge);
                    if let Some(old_parent) = previous {
                        match self.subscribe_to(&old_parent, &tx).await {
                            Ok(subscription) => links.parent = Some(subscription),
                            Err(e) => warn!(agent_id = %self.id, error = %e, "Failed to rejoin previous parent stream"),
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(agent_id = %self.id, parent = %parent, previous = ?previous, "Parent set");
        Ok(())
    }

    fn restore_parent(&self, previous: Option<AgentId>, previous_edge: Option<AgentId>) {
        {
            let mut hierarchy = self.hierarchy.lock().unwrap_or_else(|e| e.into_inner());
            match previous {
                Some(p) => {
                    hierarchy.set_parent(p);
                }
                None => {
                    hierarchy.clear_parent();
                }
            }
        }
        match previous_edge {
            Some(p) => {
                if let Err(e) = self.deps.directory.link(&self.id, &p) {
                    warn!(agent_id = %self.id, parent = %p, error = %e, "Failed to restore parent edge");
                }
            }
            None => {
                self.deps.directory.unlink(&self.id);
            }
        }
    }

    /// Detach from the parent and stop following its stream
    #[instrument(skip(self), fields(agent_id = %self.id), level = "debug")]
    pub async fn clear_parent(&self) -> Result<Option<AgentId>> {
        self.deps.directory.unlink(&self.id);
        let previous = {
            let mut hierarchy = self.hierarchy.lock().unwrap_or_else(|e| e.into_inner());
            hierarchy.clear_parent()
        };

        let subscription = self.links.lock().await.parent.take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await?;
        }

        info!(agent_id = %self.id, previous = ?previous, "Parent cleared");
        Ok(previous)
    }

    /// Record a child; the child must set this agent as its parent
    pub fn add_child(&self, child: AgentId) -> Result<bool> {
        let added = self
            .hierarchy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_child(&self.id, child.clone())?;
        if added {
            debug!(agent_id = %self.id, child = %child, "Child added");
        }
        Ok(added)
    }

    /// Forget a child
    pub fn remove_child(&self, child: &AgentId) -> bool {
        let removed = self
            .hierarchy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove_child(child);
        if removed {
            debug!(agent_id = %self.id, child = %child, "Child removed");
        }
        removed
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribe to the own and parent streams, run `on_activate`, start the
    /// worker
    ///
    /// Calling it on an active shell is a no-op.
    #[instrument(skip(self, cancel), fields(agent_id = %self.id), level = "info")]
    pub async fn activate(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ShellState::Active | ShellState::Activating => {
                    debug!(agent_id = %self.id, "Already active");
                    return Ok(());
                }
                ShellState::Deactivating => {
                    return Err(Error::AgentNotActive {
                        id: self.id.to_string(),
                        state: state.to_string(),
                    });
                }
                ShellState::Inactive => *state = ShellState::Activating,
            }
        }

        if let Err(e) = self.start(cancel).await {
            error!(agent_id = %self.id, error = %e, "Activation failed");
            let mut links = self.links.lock().await;
            self.release_subscriptions(&mut links).await;
            links.inbox = None;
            drop(links);
            self.set_state(ShellState::Inactive);
            return Err(Error::AgentActivationFailed {
                id: self.id.to_string(),
                reason: e.to_string(),
            });
        }

        self.set_state(ShellState::Active);
        self.counters
            .activated_at_ms
            .store(self.deps.io.now_ms().max(1), Ordering::Relaxed);
        metrics::record_agent_activated();
        info!(agent_id = %self.id, parent = ?self.parent(), "Agent activated");

        // Route whatever on_activate published
        if let Err(e) = self.flush_outbox().await {
            warn!(agent_id = %self.id, error = %e, "Failed to route events published during activation");
        }
        Ok(())
    }

    async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity);
        let mut links = self.links.lock().await;
        links.inbox = Some(tx.clone());
        links.own = Some(self.subscribe_to(&self.id, &tx).await?);
        if let Some(parent) = self.parent() {
            links.parent = Some(self.subscribe_to(&parent, &tx).await?);
        }

        {
            let mut core = self.core.lock().await;
            let ShellCore { agent, ctx, .. } = &mut *core;
            ctx.set_topology(self.parent(), self.children());
            self.run_hook("on_activate", cancel, agent.on_activate(ctx))
                .await?;
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(Self::run_worker(Arc::clone(self), rx, stop.clone()));
        links.worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Unsubscribe, let in-flight dispatch finish, drop queued envelopes,
    /// run `on_deactivate`
    ///
    /// Calling it on an inactive shell is a no-op. If `cancel` fires while
    /// waiting for in-flight dispatch, that dispatch is aborted.
    #[instrument(skip(self, cancel), fields(agent_id = %self.id), level = "info")]
    pub async fn deactivate(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ShellState::Inactive | ShellState::Deactivating => {
                    debug!(agent_id = %self.id, "Already inactive");
                    return Ok(());
                }
                ShellState::Activating => {
                    return Err(Error::AgentNotActive {
                        id: self.id.to_string(),
                        state: state.to_string(),
                    });
                }
                ShellState::Active => *state = ShellState::Deactivating,
            }
        }

        let worker = {
            let mut links = self.links.lock().await;
            self.release_subscriptions(&mut links).await;
            links.inbox = None;
            links.worker.take()
        };

        if let Some(Worker { stop, mut handle }) = worker {
            stop.cancel();
            tokio::select! {
                joined = &mut handle => {
                    if let Err(e) = joined {
                        error!(agent_id = %self.id, error = %e, "Worker task failed");
                    }
                }
                _ = cancel.cancelled() => {
                    handle.abort();
                    warn!(agent_id = %self.id, "Deactivation cancelled, aborted in-flight dispatch");
                }
            }
        }

        let hook_result = {
            let mut core = self.core.lock().await;
            let ShellCore { agent, ctx, .. } = &mut *core;
            ctx.set_topology(self.parent(), self.children());
            self.run_hook("on_deactivate", cancel, agent.on_deactivate(ctx))
                .await
        };
        if let Err(e) = &hook_result {
            warn!(agent_id = %self.id, error = %e, "on_deactivate failed");
        }

        let flush_result = self.flush_outbox().await;

        self.set_state(ShellState::Inactive);
        metrics::record_agent_deactivated();
        info!(agent_id = %self.id, "Agent deactivated");

        hook_result.and(flush_result)
    }

    async fn run_hook<F>(&self, name: &str, cancel: &CancellationToken, hook: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let timeout = Duration::from_millis(AGENT_LIFECYCLE_TIMEOUT_MS_MAX);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::OperationCancelled {
                operation: format!("{} {}", name, self.id),
            }),
            outcome = tokio::time::timeout(timeout, hook) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::OperationTimedOut {
                    operation: format!("{} {}", name, self.id),
                    timeout_ms: AGENT_LIFECYCLE_TIMEOUT_MS_MAX,
                }),
            },
        }
    }

    async fn subscribe_to(
        &self,
        owner: &AgentId,
        tx: &mpsc::Sender<Inbound>,
    ) -> Result<Box<dyn StreamSubscription>> {
        let inlet = Arc::new(ShellInlet {
            source: owner.clone(),
            owner: self.id.clone(),
            tx: tx.clone(),
            counters: Arc::clone(&self.counters),
        });
        self.deps.streams.stream(owner).subscribe(inlet).await
    }

    async fn release_subscriptions(&self, links: &mut ShellLinks) {
        for subscription in [links.own.take(), links.parent.take()].into_iter().flatten() {
            if let Err(e) = subscription.unsubscribe().await {
                warn!(
                    agent_id = %self.id,
                    stream = %subscription.stream(),
                    error = %e,
                    "Failed to unsubscribe"
                );
            }
        }
    }

    /// Drain the inbox one envelope at a time
    ///
    /// While a routing step waits on a full stream, the worker keeps moving
    /// arrivals from the inbox into a local backlog (in order, processed
    /// after the step). A shell blocked on a peer's stream therefore never
    /// stops that peer's deliveries into this shell.
    async fn run_worker(shell: Arc<Self>, mut rx: mpsc::Receiver<Inbound>, stop: CancellationToken) {
        debug!(agent_id = %shell.id, "Worker started");
        let mut backlog: VecDeque<Inbound> = VecDeque::new();
        let mut inbox_open = true;
        loop {
            if stop.is_cancelled() {
                break;
            }
            let inbound = match backlog.pop_front() {
                Some(item) => item,
                None if !inbox_open => break,
                None => tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                },
            };

            let step = shell.process(Some(inbound.source), inbound.envelope);
            tokio::pin!(step);
            let outcome = loop {
                tokio::select! {
                    biased;
                    outcome = &mut step => break outcome,
                    item = rx.recv(), if inbox_open && backlog.len() < SHELL_BACKLOG_COUNT_MAX => {
                        match item {
                            Some(item) => backlog.push_back(item),
                            None => inbox_open = false,
                        }
                    }
                }
            };
            if let Err(e) = outcome {
                debug!(agent_id = %shell.id, error = %e, "Routing error on stream envelope");
            }
        }

        // Queued but undelivered envelopes are dropped
        rx.close();
        let mut dropped = backlog.len() as u64;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            shell.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(agent_id = %shell.id, dropped, "Dropped queued envelopes");
        }
        debug!(agent_id = %shell.id, "Worker stopped");
    }

    // =========================================================================
    // Publishing and Routing
    // =========================================================================

    /// Publish an event from this agent
    pub async fn publish<E: Event>(&self, event: &E, direction: Direction) -> Result<EnvelopeId> {
        self.publish_with(event, direction, PublishOptions::default())
            .await
    }

    /// Publish an event from this agent with explicit limits
    ///
    /// The envelope is routed (and any events the handlers publish in
    /// response) before this returns.
    pub async fn publish_with<E: Event>(
        &self,
        event: &E,
        direction: Direction,
        options: PublishOptions,
    ) -> Result<EnvelopeId> {
        self.ensure_active()?;
        let envelope = self.wrap(OutboundEvent {
            payload: EventPayload::pack(event)?,
            direction,
            options,
        });
        let id = envelope.id.clone();
        self.process(None, envelope).await?;
        Ok(id)
    }

    /// Routing entry point for an externally delivered envelope
    ///
    /// `source` is the owner of the stream it arrived on, or `None` if the
    /// local agent originated it.
    pub async fn handle_envelope(&self, source: Option<&AgentId>, envelope: Envelope) -> Result<()> {
        self.ensure_active()?;
        self.process(source.cloned(), envelope).await
    }

    fn wrap(&self, outbound: OutboundEvent) -> Envelope {
        Envelope::new(
            EnvelopeId::generate(self.deps.io.rng.as_ref()),
            self.id.clone(),
            outbound.payload,
            outbound.direction,
            outbound.options,
            self.deps.io.now_ms(),
        )
    }

    async fn flush_outbox(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        self.drain(&mut core, VecDeque::new()).await
    }

    async fn process(&self, source: Option<AgentId>, envelope: Envelope) -> Result<()> {
        let mut core = self.core.lock().await;
        let mut work = VecDeque::new();
        work.push_back((source, envelope));
        self.drain(&mut core, work).await
    }

    /// Route queued work until both the queue and the agent's outbox are
    /// empty (iteration, not recursion)
    async fn drain(
        &self,
        core: &mut ShellCore<A>,
        mut work: VecDeque<(Option<AgentId>, Envelope)>,
    ) -> Result<()> {
        let mut first_error = None;
        let mut routed = 0usize;
        loop {
            for outbound in core.ctx.take_outbox() {
                work.push_back((None, self.wrap(outbound)));
            }
            let Some((source, envelope)) = work.pop_front() else {
                break;
            };

            routed += 1;
            if routed > SHELL_OUTBOX_DRAIN_COUNT_MAX {
                warn!(
                    agent_id = %self.id,
                    remaining = work.len() + 1,
                    limit = SHELL_OUTBOX_DRAIN_COUNT_MAX,
                    "Publish cascade exceeded limit, dropping remainder"
                );
                break;
            }

            if let Err(e) = self.route_one(core, source.as_ref(), envelope).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn route_one(
        &self,
        core: &mut ShellCore<A>,
        source: Option<&AgentId>,
        envelope: Envelope,
    ) -> Result<()> {
        let parent = self.parent();
        let arrival = match source {
            None => Arrival::Local,
            Some(s) if s == &self.id => Arrival::OwnStream,
            Some(s) if Some(s) == parent.as_ref() => Arrival::ParentStream,
            Some(_) => {
                self.discard(&envelope, DiscardReason::StaleSource);
                return Ok(());
            }
        };

        if arrival != Arrival::Local && !self.state().accepts_envelopes() {
            self.discard(&envelope, DiscardReason::Inactive);
            return Ok(());
        }

        if !self
            .deps
            .dedup
            .try_record((self.id.clone(), envelope.id.clone()))
        {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            self.discard(&envelope, DiscardReason::Duplicate);
            return Ok(());
        }

        let decision = self.router.route(&RouteInput {
            envelope: &envelope,
            arrival,
            self_id: &self.id,
            parent: parent.as_ref(),
        });

        let (dispatch, is_self_origin, forwards) = match decision {
            RouteDecision::Discard(reason) => {
                self.discard(&envelope, reason);
                return Ok(());
            }
            RouteDecision::Deliver {
                dispatch,
                is_self_origin,
                forwards,
            } => (dispatch, is_self_origin, forwards),
        };

        metrics::record_envelope_routed(arrival.as_str());
        debug!(
            agent_id = %self.id,
            envelope_id = %envelope.id,
            event_type = %envelope.event_type(),
            arrival = arrival.as_str(),
            direction = %envelope.direction,
            hops = envelope.current_hop_count,
            forwards = forwards.len(),
            "Routing envelope"
        );

        if dispatch {
            self.dispatch(core, &envelope, is_self_origin).await;
        }

        // Forwarding runs even if a handler faulted
        let mut first_error = None;
        for forward in forwards {
            let owner = match &forward.target {
                StreamTarget::Own => &self.id,
                StreamTarget::Parent(parent) => parent,
            };
            let stream = self.deps.streams.stream(owner);
            match stream.produce(forward.envelope).await {
                Ok(()) => {
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        agent_id = %self.id,
                        envelope_id = %envelope.id,
                        stream = %owner,
                        error = %e,
                        "Failed to forward envelope"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn dispatch(&self, core: &mut ShellCore<A>, envelope: &Envelope, is_self_origin: bool) {
        let ShellCore {
            agent,
            ctx,
            handlers,
        } = core;

        let matched = handlers.matching(envelope.event_type(), is_self_origin);
        if matched.is_empty() {
            return;
        }
        ctx.set_topology(self.parent(), self.children());

        for handler in matched {
            let start_ms = self.deps.io.time.monotonic_ms();
            let outcome = AssertUnwindSafe(async { handler(agent, ctx, envelope).await })
                .catch_unwind()
                .await;
            let elapsed_ms = self.deps.io.time.monotonic_ms().saturating_sub(start_ms);
            metrics::record_handler_duration(envelope.event_type(), elapsed_ms as f64 / 1000.0);

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(reason) = failure {
                self.on_handler_fault(ctx, envelope, reason);
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_activity_at_ms
            .store(self.deps.io.now_ms().max(1), Ordering::Relaxed);
    }

    fn on_handler_fault(&self, ctx: &mut AgentContext<A::State>, envelope: &Envelope, reason: String) {
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        metrics::record_handler_fault(envelope.event_type());
        warn!(
            agent_id = %self.id,
            envelope_id = %envelope.id,
            event_type = %envelope.event_type(),
            reason = %reason,
            "Handler faulted"
        );

        if self.config.emit_handler_faults {
            let fault = HandlerFaulted {
                agent_id: self.id.clone(),
                event_type: envelope.event_type().to_string(),
                envelope_id: envelope.id.clone(),
                reason,
            };
            if let Err(e) = ctx.publish(&fault, Direction::Up) {
                warn!(agent_id = %self.id, error = %e, "Failed to queue fault event");
            }
        }
    }

    fn discard(&self, envelope: &Envelope, reason: DiscardReason) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        metrics::record_envelope_discarded(reason.as_str());
        debug!(
            agent_id = %self.id,
            envelope_id = %envelope.id,
            hops = envelope.current_hop_count,
            reason = %reason,
            "Discarded envelope"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: <non-string payload>".to_string()
    }
}
