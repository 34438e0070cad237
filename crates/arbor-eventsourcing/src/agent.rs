//! Event-sourced agent core
//!
//! TigerStyle: Pure transitions, atomic confirm, state unchanged on failure.
//!
//! An [`EventSourcedCore`] holds an agent's state as the fold of its
//! confirmed events. Events are staged in memory, then confirmed as one
//! batch with the last known version as the expected version. Only after the
//! store accepts the batch is each event applied, in order, through the
//! agent's pure `transition` function.
//!
//! ```rust,ignore
//! let mut core = EventSourcedCore::<Account>::new(id, store, &config)?;
//! core.replay().await?;
//! core.stage(AccountEvent::Deposited { amount: 100 })?;
//! core.stage(AccountEvent::Withdrawn { amount: 30 })?;
//! core.confirm().await?;
//! assert_eq!(core.state().balance, 70);
//! ```

use crate::snapshot::{EveryNVersions, NeverSnapshot, SnapshotPolicy};
use crate::store::{EventQuery, EventStore, NewEvent};
use arbor_core::agent::AgentId;
use arbor_core::config::EventSourcingConfig;
use arbor_core::constants::EVENT_BATCH_COUNT_MAX;
use arbor_core::error::{Error, Result};
use arbor_core::metrics;
use arbor_core::occ::Version;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Traits
// =============================================================================

/// A domain event with a stable type discriminator
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Discriminator stored alongside the payload
    fn event_type(&self) -> &'static str;
}

/// An agent whose state is the fold of its events
pub trait EventSourced: Send + Sync + 'static {
    /// Agent state
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Domain event
    type Event: DomainEvent;

    /// Apply one event
    ///
    /// Must be pure: no I/O, no clock, no randomness. Replay relies on it
    /// producing the same state from the same events.
    fn transition(state: &Self::State, event: &Self::Event) -> Self::State;
}

enum ConfirmLimit<'a> {
    Timeout(u64),
    Cancel(&'a CancellationToken),
}

// =============================================================================
// EventSourcedCore
// =============================================================================

/// State, version and pending events of one event-sourced agent
pub struct EventSourcedCore<T: EventSourced> {
    agent_id: AgentId,
    store: Arc<dyn EventStore>,
    state: T::State,
    version: Version,
    /// Version of the last snapshot written or loaded
    snapshot_version: Version,
    pending: Vec<T::Event>,
    policy: Box<dyn SnapshotPolicy>,
    config: EventSourcingConfig,
}

impl<T: EventSourced> std::fmt::Debug for EventSourcedCore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourcedCore")
            .field("agent_id", &self.agent_id)
            .field("version", &self.version)
            .field("snapshot_version", &self.snapshot_version)
            .field("pending", &self.pending.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T: EventSourced> EventSourcedCore<T> {
    /// Create a core at the initial version with default state
    ///
    /// Call [`replay`](Self::replay) before use to load the stored history.
    ///
    /// # Errors
    /// `InvalidConfiguration` if the confirm timeout or replay batch size is
    /// out of bounds.
    pub fn new(
        agent_id: AgentId,
        store: Arc<dyn EventStore>,
        config: &EventSourcingConfig,
    ) -> Result<Self> {
        config.validate()?;

        let policy: Box<dyn SnapshotPolicy> = if config.snapshot_interval == 0 {
            Box::new(NeverSnapshot)
        } else {
            Box::new(EveryNVersions(config.snapshot_interval))
        };

        Ok(Self {
            agent_id,
            store,
            state: T::State::default(),
            version: Version::INITIAL,
            snapshot_version: Version::INITIAL,
            pending: Vec::new(),
            policy,
            config: config.clone(),
        })
    }

    /// Replace the snapshot policy
    pub fn with_snapshot_policy(mut self, policy: impl SnapshotPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Owning agent
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Current state (confirmed events only)
    pub fn state(&self) -> &T::State {
        &self.state
    }

    /// Version of the last confirmed event
    pub fn version(&self) -> Version {
        self.version
    }

    /// Version of the last snapshot written or loaded
    pub fn snapshot_version(&self) -> Version {
        self.snapshot_version
    }

    /// Staged, unconfirmed events
    pub fn pending(&self) -> &[T::Event] {
        &self.pending
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Buffer an event for the next confirm
    ///
    /// Neither storage nor state is touched.
    pub fn stage(&mut self, event: T::Event) -> Result<()> {
        if self.pending.len() >= EVENT_BATCH_COUNT_MAX {
            return Err(Error::EventBatchTooLarge {
                count: self.pending.len() + 1,
                limit: EVENT_BATCH_COUNT_MAX,
            });
        }
        self.pending.push(event);
        Ok(())
    }

    /// Drop every staged event, returning them
    pub fn discard_pending(&mut self) -> Vec<T::Event> {
        std::mem::take(&mut self.pending)
    }

    // =========================================================================
    // Confirm
    // =========================================================================

    /// Append the staged events with the configured timeout
    pub async fn confirm(&mut self) -> Result<Version> {
        self.confirm_with_timeout(self.config.confirm_timeout_ms)
            .await
    }

    /// Append the staged events, giving up after `timeout_ms`
    ///
    /// On timeout the state and the staged events are untouched. The store
    /// may still have committed the batch; the next confirm then conflicts
    /// and the caller reconciles with [`reload`](Self::reload).
    pub async fn confirm_with_timeout(&mut self, timeout_ms: u64) -> Result<Version> {
        self.confirm_limited(ConfirmLimit::Timeout(timeout_ms))
            .await
    }

    /// Append the staged events unless `cancel` fires first
    pub async fn confirm_until(&mut self, cancel: &CancellationToken) -> Result<Version> {
        self.confirm_limited(ConfirmLimit::Cancel(cancel)).await
    }

    #[instrument(skip(self, limit), fields(agent_id = %self.agent_id, expected = %self.version, count = self.pending.len()), level = "debug")]
    async fn confirm_limited(&mut self, limit: ConfirmLimit<'_>) -> Result<Version> {
        if self.pending.is_empty() {
            return Ok(self.version);
        }

        let batch = self
            .pending
            .iter()
            .map(|event| NewEvent::encode(event.event_type(), event))
            .collect::<Result<Vec<_>>>()?;
        let count = batch.len() as u64;
        let expected = self.version;

        let store = Arc::clone(&self.store);
        let append = store.append_events(&self.agent_id, batch, expected);
        let appended = match limit {
            ConfirmLimit::Timeout(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), append).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::OperationTimedOut {
                        operation: format!("confirm {}", self.agent_id),
                        timeout_ms,
                    }),
                }
            }
            ConfirmLimit::Cancel(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::OperationCancelled {
                        operation: format!("confirm {}", self.agent_id),
                    }),
                    result = append => result,
                }
            }
        };

        let new_version = match appended {
            Ok(version) => version,
            Err(e) if e.is_conflict() => {
                metrics::record_confirm_conflict();
                warn!(agent_id = %self.agent_id, error = %e, "Confirm conflicted, staged events kept");
                return Err(e);
            }
            Err(e) => {
                error!(agent_id = %self.agent_id, error = %e, "Confirm failed");
                return Err(e);
            }
        };

        if new_version != expected.advance(count) {
            error!(
                agent_id = %self.agent_id,
                expected = %expected.advance(count),
                actual = %new_version,
                "Store returned unexpected version"
            );
            return Err(Error::EventLogCorrupted {
                agent_id: self.agent_id.to_string(),
                reason: format!(
                    "append of {} events at {} returned {}",
                    count, expected, new_version
                ),
            });
        }

        let mut state = self.state.clone();
        for event in &self.pending {
            state = T::transition(&state, event);
        }
        self.state = state;
        self.version = new_version;
        self.pending.clear();

        metrics::record_events_confirmed(count);
        debug!(agent_id = %self.agent_id, version = %new_version, count, "Events confirmed");

        self.maybe_snapshot(expected).await;
        Ok(new_version)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn maybe_snapshot(&mut self, previous: Version) {
        if !self
            .policy
            .should_snapshot(previous, self.version, self.snapshot_version)
        {
            return;
        }
        // Events are the source of truth; a failed snapshot only costs replay time
        if let Err(e) = self.snapshot_now().await {
            warn!(agent_id = %self.agent_id, version = %self.version, error = %e, "Snapshot write failed");
        }
    }

    /// Write the current state as the latest snapshot
    pub async fn snapshot_now(&mut self) -> Result<()> {
        let state = serde_json::to_vec(&self.state).map_err(|e| Error::SerializationFailed {
            reason: format!("state of {}: {}", self.agent_id, e),
        })?;
        self.store
            .save_snapshot(&self.agent_id, self.version, Bytes::from(state))
            .await?;
        self.snapshot_version = self.version;
        debug!(agent_id = %self.agent_id, version = %self.version, "Snapshot written");
        Ok(())
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Rebuild state from the latest snapshot plus the events after it
    ///
    /// On failure the in-memory state and version are left as they were.
    /// Staged events are kept.
    #[instrument(skip(self), fields(agent_id = %self.agent_id), level = "info")]
    pub async fn replay(&mut self) -> Result<Version> {
        let snapshot = self.store.get_latest_snapshot(&self.agent_id).await?;
        let from_snapshot = snapshot.is_some();
        let (mut state, mut version) = match snapshot {
            Some(snapshot) => {
                let state: T::State = serde_json::from_slice(&snapshot.state).map_err(|e| {
                    Error::DeserializationFailed {
                        reason: format!("snapshot {} of {}: {}", snapshot.version, self.agent_id, e),
                    }
                })?;
                (state, snapshot.version)
            }
            None => (T::State::default(), Version::INITIAL),
        };
        let snapshot_version = version;

        let batch_size = self.config.replay_batch_size;
        debug_assert!(batch_size > 0, "validated at construction");
        let mut applied = 0u64;
        loop {
            let records = self
                .store
                .get_events(&self.agent_id, EventQuery::after(version).with_max_count(batch_size))
                .await?;
            let page_len = records.len();

            for record in records {
                let expected = version.increment();
                if record.version != expected {
                    error!(
                        agent_id = %self.agent_id,
                        expected = %expected,
                        actual = %record.version,
                        "Gap in event log"
                    );
                    return Err(Error::EventLogCorrupted {
                        agent_id: self.agent_id.to_string(),
                        reason: format!("expected {} but read {}", expected, record.version),
                    });
                }
                let event: T::Event = record.decode()?;
                state = T::transition(&state, &event);
                version = expected;
                applied += 1;
            }

            if page_len < batch_size {
                break;
            }
        }

        self.state = state;
        self.version = version;
        self.snapshot_version = snapshot_version;

        metrics::record_replay(applied, from_snapshot);
        info!(
            agent_id = %self.agent_id,
            version = %version,
            snapshot = %snapshot_version,
            applied,
            "Replay complete"
        );
        Ok(version)
    }

    /// Drop staged events and in-memory state, then replay
    ///
    /// The usual reaction to a confirm conflict.
    pub async fn reload(&mut self) -> Result<Version> {
        let dropped = self.discard_pending();
        if !dropped.is_empty() {
            debug!(agent_id = %self.agent_id, dropped = dropped.len(), "Discarded staged events");
        }
        self.replay().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEventStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum CounterEvent {
        Added(i64),
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            "counter.added"
        }
    }

    struct Counter;

    impl EventSourced for Counter {
        type State = i64;
        type Event = CounterEvent;

        fn transition(state: &i64, event: &CounterEvent) -> i64 {
            match event {
                CounterEvent::Added(n) => state + n,
            }
        }
    }

    fn core(store: &Arc<MemoryEventStore>) -> EventSourcedCore<Counter> {
        let store: Arc<dyn EventStore> = store.clone();
        EventSourcedCore::new(
            AgentId::new("counters", "c").unwrap(),
            store,
            &EventSourcingConfig::default(),
        )
        .unwrap()
        .with_snapshot_policy(NeverSnapshot)
    }

    #[tokio::test]
    async fn test_stage_does_not_touch_state() {
        let store = Arc::new(MemoryEventStore::new());
        let mut c = core(&store);
        c.stage(CounterEvent::Added(5)).unwrap();

        assert_eq!(*c.state(), 0);
        assert_eq!(c.pending().len(), 1);
        assert_eq!(store.event_count(c.agent_id()).await, 0);

        assert_eq!(c.discard_pending(), vec![CounterEvent::Added(5)]);
        assert!(c.pending().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_applies_in_order() {
        let store = Arc::new(MemoryEventStore::new());
        let mut c = core(&store);
        c.stage(CounterEvent::Added(5)).unwrap();
        c.stage(CounterEvent::Added(-2)).unwrap();

        assert_eq!(c.confirm().await.unwrap(), Version::new(2));
        assert_eq!(*c.state(), 3);
        assert!(c.pending().is_empty());
    }

    #[tokio::test]
    async fn test_empty_confirm_is_noop() {
        let store = Arc::new(MemoryEventStore::new());
        let mut c = core(&store);
        assert_eq!(c.confirm().await.unwrap(), Version::INITIAL);
    }

    #[tokio::test]
    async fn test_conflict_keeps_pending_and_reload_recovers() {
        let store = Arc::new(MemoryEventStore::new());
        let mut a = core(&store);
        let mut b = core(&store);

        a.stage(CounterEvent::Added(1)).unwrap();
        a.confirm().await.unwrap();

        b.stage(CounterEvent::Added(10)).unwrap();
        let err = b.confirm().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(*b.state(), 0);
        assert_eq!(b.pending().len(), 1);

        b.reload().await.unwrap();
        assert_eq!(*b.state(), 1);
        assert_eq!(b.version(), Version::new(1));
        assert!(b.pending().is_empty());
    }

    #[tokio::test]
    async fn test_replay_in_small_batches() {
        let store = Arc::new(MemoryEventStore::new());
        let mut writer = core(&store);
        for n in 1..=25 {
            writer.stage(CounterEvent::Added(n)).unwrap();
        }
        writer.confirm().await.unwrap();

        let config = EventSourcingConfig {
            replay_batch_size: 4,
            ..EventSourcingConfig::default()
        };
        let dyn_store: Arc<dyn EventStore> = store.clone();
        let mut reader =
            EventSourcedCore::<Counter>::new(writer.agent_id().clone(), dyn_store, &config).unwrap();
        assert_eq!(reader.replay().await.unwrap(), Version::new(25));
        assert_eq!(*reader.state(), (1..=25).sum::<i64>());
    }

    #[tokio::test]
    async fn test_snapshot_policy_writes_snapshot() {
        let store = Arc::new(MemoryEventStore::new());
        let mut c = core(&store).with_snapshot_policy(EveryNVersions(2));

        c.stage(CounterEvent::Added(4)).unwrap();
        c.confirm().await.unwrap();
        assert!(store.get_latest_snapshot(c.agent_id()).await.unwrap().is_none());

        c.stage(CounterEvent::Added(6)).unwrap();
        c.confirm().await.unwrap();
        let snapshot = store.get_latest_snapshot(c.agent_id()).await.unwrap().unwrap();
        assert_eq!(snapshot.version, Version::new(2));
        assert_eq!(c.snapshot_version(), Version::new(2));
    }

    #[tokio::test]
    async fn test_confirm_until_cancelled() {
        let store = Arc::new(MemoryEventStore::new());
        let mut c = core(&store);
        c.stage(CounterEvent::Added(1)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = c.confirm_until(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::OperationCancelled { .. }));
        assert_eq!(c.pending().len(), 1);
        assert_eq!(store.event_count(c.agent_id()).await, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let defaults = EventSourcingConfig::default();
        for config in [
            EventSourcingConfig {
                replay_batch_size: 0,
                ..defaults.clone()
            },
            EventSourcingConfig {
                confirm_timeout_ms: 0,
                ..defaults
            },
        ] {
            let err = EventSourcedCore::<Counter>::new(
                AgentId::new("counters", "c").unwrap(),
                store.clone(),
                &config,
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidConfiguration { .. }));
        }
    }
}
