//! Message stream contract and in-process adapter
//!
//! TigerStyle: Narrow contracts at the backend seam.
//!
//! A stream is an ordered, subscribable channel owned by exactly one agent
//! and addressed by that agent's id. The routing core needs only three
//! operations from it: produce, subscribe and unsubscribe. Backends
//! (clustered pub/sub, remote transports) implement [`MessageStream`] and
//! [`StreamProvider`]; [`LocalStreamProvider`] is the in-process adapter.

use crate::queue::{QueueStats, SubscriptionQueue};
use arbor_core::agent::AgentId;
use arbor_core::config::StreamConfig;
use arbor_core::constants::STREAM_SUBSCRIPTIONS_COUNT_MAX;
use arbor_core::envelope::Envelope;
use arbor_core::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// =============================================================================
// Contracts
// =============================================================================

/// Identifier of one subscription on one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Raw id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiver side of a subscription
///
/// Called sequentially per subscription, in produce order.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Accept one envelope
    async fn on_envelope(&self, envelope: Envelope) -> Result<()>;
}

/// Handle to a live subscription
#[async_trait]
pub trait StreamSubscription: Send + Sync {
    /// Subscription id
    fn id(&self) -> SubscriptionId;

    /// Owner of the stream this subscription reads
    fn stream(&self) -> &AgentId;

    /// Whether envelopes are currently being delivered
    fn is_active(&self) -> bool;

    /// Stop delivery; envelopes still queued are discarded
    async fn unsubscribe(&self) -> Result<()>;

    /// Re-attach after a transient loss, keeping the same handler
    async fn resume(&self) -> Result<()>;
}

/// A per-agent ordered channel
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Agent owning this stream
    fn owner(&self) -> &AgentId;

    /// Deliver an envelope to every active subscription
    ///
    /// Envelopes from one producer are delivered in produce order.
    async fn produce(&self, envelope: Envelope) -> Result<()>;

    /// Attach a handler
    async fn subscribe(
        &self,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Box<dyn StreamSubscription>>;

    /// Detach a subscription by id
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

/// Resolves an agent id to its stream
pub trait StreamProvider: Send + Sync {
    /// Stream owned by `owner`, created on first use
    fn stream(&self, owner: &AgentId) -> Arc<dyn MessageStream>;
}

// =============================================================================
// LocalStream
// =============================================================================

/// One subscriber slot on a local stream
struct Slot {
    id: SubscriptionId,
    handler: Arc<dyn EnvelopeHandler>,
    active: AtomicBool,
    queue: Mutex<Arc<SubscriptionQueue>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl Slot {
    fn current_queue(&self) -> Arc<SubscriptionQueue> {
        let guard = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }
}

struct LocalStreamInner {
    owner: AgentId,
    config: StreamConfig,
    slots: RwLock<HashMap<SubscriptionId, Arc<Slot>>>,
    next_subscription_id: AtomicU64,
}

impl LocalStreamInner {
    fn queue_label(&self, id: SubscriptionId) -> String {
        format!("{}/{}", self.owner, id)
    }

    /// Start (or restart) delivery for a slot with a fresh queue
    fn attach(&self, slot: &Arc<Slot>) {
        let queue = Arc::new(SubscriptionQueue::new(
            self.queue_label(slot.id),
            self.config.subscription_capacity,
            self.config.overflow,
        ));
        {
            let mut guard = slot.queue.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Arc::clone(&queue);
        }

        let handler = Arc::clone(&slot.handler);
        let owner = self.owner.clone();
        let id = slot.id;
        let task = tokio::spawn(async move {
            while let Some(envelope) = queue.pop().await {
                let envelope_id = envelope.id.clone();
                match handler.on_envelope(envelope).await {
                    Ok(()) => {}
                    Err(e) if is_shutdown_rejection(&e) => debug!(
                        stream = %owner,
                        subscription = %id,
                        envelope_id = %envelope_id,
                        error = %e,
                        "Subscriber stopped, envelope discarded"
                    ),
                    Err(e) => warn!(
                        stream = %owner,
                        subscription = %id,
                        envelope_id = %envelope_id,
                        error = %e,
                        "Subscriber rejected envelope"
                    ),
                }
            }
            debug!(stream = %owner, subscription = %id, "Delivery task stopped");
        });

        {
            let mut guard = slot.delivery.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = guard.replace(task) {
                previous.abort();
            }
        }
        slot.active.store(true, Ordering::Release);
    }

    /// Stop delivery for a slot, discarding queued envelopes
    fn detach(&self, slot: &Slot) -> usize {
        slot.active.store(false, Ordering::Release);
        let discarded = slot.current_queue().close();
        if discarded > 0 {
            debug!(
                stream = %self.owner,
                subscription = %slot.id,
                discarded,
                "Discarded queued envelopes on unsubscribe"
            );
        }
        discarded
    }

    fn slot(&self, id: SubscriptionId) -> Option<Arc<Slot>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(&id).cloned()
    }
}

/// In-process stream: one bounded queue and delivery task per subscription
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<LocalStreamInner>,
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("owner", &self.inner.owner)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl LocalStream {
    /// Create a stream owned by `owner`
    ///
    /// # Errors
    /// `InvalidConfiguration` if the subscription capacity is out of bounds.
    pub fn new(owner: AgentId, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_checked_config(owner, config))
    }

    fn with_checked_config(owner: AgentId, config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(LocalStreamInner {
                owner,
                config,
                slots: RwLock::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of attached subscriptions (active or paused)
    pub fn subscription_count(&self) -> usize {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Queue counters for one subscription
    pub fn queue_stats(&self, id: SubscriptionId) -> Option<QueueStats> {
        self.inner.slot(id).map(|slot| slot.current_queue().stats())
    }

    /// Simulate a transient transport loss for every subscription
    ///
    /// Subscriptions stay registered but inactive until resumed.
    pub fn interrupt(&self) -> usize {
        let slots: Vec<Arc<Slot>> = {
            let slots = self.inner.slots.read().unwrap_or_else(|e| e.into_inner());
            slots.values().cloned().collect()
        };
        slots.iter().map(|slot| self.inner.detach(slot)).sum()
    }
}

#[async_trait]
impl MessageStream for LocalStream {
    fn owner(&self) -> &AgentId {
        &self.inner.owner
    }

    async fn produce(&self, envelope: Envelope) -> Result<()> {
        let targets: Vec<Arc<SubscriptionQueue>> = {
            let slots = self.inner.slots.read().unwrap_or_else(|e| e.into_inner());
            let mut active: Vec<&Arc<Slot>> = slots
                .values()
                .filter(|s| s.active.load(Ordering::Acquire))
                .collect();
            // Deterministic fan-out order
            active.sort_by_key(|s| s.id);
            active.iter().map(|s| s.current_queue()).collect()
        };

        let mut first_error = None;
        for queue in targets {
            match queue.push(envelope.clone()).await {
                Ok(()) => {}
                // Raced with unsubscribe
                Err(Error::StreamUnavailable { .. }) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Box<dyn StreamSubscription>> {
        let id = SubscriptionId(
            self.inner
                .next_subscription_id
                .fetch_add(1, Ordering::Relaxed),
        );
        let slot = Arc::new(Slot {
            id,
            handler,
            active: AtomicBool::new(false),
            queue: Mutex::new(Arc::new(SubscriptionQueue::new(
                self.inner.queue_label(id),
                1,
                self.inner.config.overflow,
            ))),
            delivery: Mutex::new(None),
        });

        {
            let mut slots = self.inner.slots.write().unwrap_or_else(|e| e.into_inner());
            if slots.len() >= STREAM_SUBSCRIPTIONS_COUNT_MAX {
                return Err(Error::StreamUnavailable {
                    stream: self.inner.owner.to_string(),
                    reason: format!(
                        "subscription limit {} reached",
                        STREAM_SUBSCRIPTIONS_COUNT_MAX
                    ),
                });
            }
            slots.insert(id, Arc::clone(&slot));
        }
        self.inner.attach(&slot);

        debug!(stream = %self.inner.owner, subscription = %id, "Subscribed");
        Ok(Box::new(LocalSubscription {
            stream: Arc::clone(&self.inner),
            slot,
        }))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let slot = {
            let mut slots = self.inner.slots.write().unwrap_or_else(|e| e.into_inner());
            slots.remove(&id)
        };
        match slot {
            Some(slot) => {
                self.inner.detach(&slot);
                debug!(stream = %self.inner.owner, subscription = %id, "Unsubscribed");
                Ok(())
            }
            None => Err(Error::SubscriptionNotFound {
                stream: self.inner.owner.to_string(),
                subscription: id.to_string(),
            }),
        }
    }
}

/// Handle returned by [`LocalStream::subscribe`]
pub struct LocalSubscription {
    stream: Arc<LocalStreamInner>,
    slot: Arc<Slot>,
}

#[async_trait]
impl StreamSubscription for LocalSubscription {
    fn id(&self) -> SubscriptionId {
        self.slot.id
    }

    fn stream(&self) -> &AgentId {
        &self.stream.owner
    }

    fn is_active(&self) -> bool {
        self.slot.active.load(Ordering::Acquire)
    }

    async fn unsubscribe(&self) -> Result<()> {
        {
            let mut slots = self.stream.slots.write().unwrap_or_else(|e| e.into_inner());
            slots.remove(&self.slot.id);
        }
        self.stream.detach(&self.slot);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        {
            let mut slots = self.stream.slots.write().unwrap_or_else(|e| e.into_inner());
            if !slots.contains_key(&self.slot.id)
                && slots.len() >= STREAM_SUBSCRIPTIONS_COUNT_MAX
            {
                return Err(Error::StreamUnavailable {
                    stream: self.stream.owner.to_string(),
                    reason: "subscription limit reached".into(),
                });
            }
            slots.insert(self.slot.id, Arc::clone(&self.slot));
        }
        self.stream.attach(&self.slot);

        debug!(stream = %self.stream.owner, subscription = %self.slot.id, "Resumed");
        Ok(())
    }
}

/// A subscriber going inactive mid-delivery is a normal discard
fn is_shutdown_rejection(error: &Error) -> bool {
    matches!(error, Error::AgentNotActive { .. })
}

// =============================================================================
// LocalStreamProvider
// =============================================================================

/// In-process stream registry
pub struct LocalStreamProvider {
    config: StreamConfig,
    streams: Mutex<HashMap<AgentId, LocalStream>>,
}

impl LocalStreamProvider {
    /// Create a provider; every stream uses `config`
    ///
    /// # Errors
    /// `InvalidConfiguration` if the subscription capacity is out of bounds.
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Concrete handle to a local stream
    pub fn local_stream(&self, owner: &AgentId) -> LocalStream {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .entry(owner.clone())
            .or_insert_with(|| LocalStream::with_checked_config(owner.clone(), self.config.clone()))
            .clone()
    }

    /// Number of streams created so far
    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for LocalStreamProvider {
    fn default() -> Self {
        Self {
            config: StreamConfig::default(),
            streams: Mutex::new(HashMap::new()),
        }
    }
}

impl StreamProvider for LocalStreamProvider {
    fn stream(&self, owner: &AgentId) -> Arc<dyn MessageStream> {
        Arc::new(self.local_stream(owner))
    }
}
