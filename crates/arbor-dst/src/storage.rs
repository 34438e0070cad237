//! Simulated event store for deterministic testing
//!
//! TigerStyle: In-memory storage with fault injection.

use crate::clock::SimClock;
use crate::fault::{FaultInjector, FaultType, StoreOperation};
use crate::rng::DeterministicRng;
use arbor_core::agent::AgentId;
use arbor_core::error::{Error, Result};
use arbor_core::occ::Version;
use arbor_eventsourcing::{EventQuery, EventRecord, EventStore, MemoryEventStore, NewEvent, SnapshotRecord};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Event store with injectable faults
///
/// Wraps a [`MemoryEventStore`] stamped with simulated time. Every
/// operation consults the fault injector first.
#[derive(Debug)]
pub struct SimEventStore {
    inner: MemoryEventStore,
    fault_injector: Arc<FaultInjector>,
    rng: DeterministicRng,
    /// Number of append round trips attempted
    append_calls: AtomicU64,
}

impl SimEventStore {
    /// Create a simulated store
    pub fn new(clock: SimClock, rng: DeterministicRng, fault_injector: Arc<FaultInjector>) -> Self {
        Self {
            inner: MemoryEventStore::with_time(Arc::new(clock)),
            fault_injector,
            rng,
            append_calls: AtomicU64::new(0),
        }
    }

    /// The fault-free store underneath
    pub fn inner(&self) -> &MemoryEventStore {
        &self.inner
    }

    /// Fault injector in use
    pub fn fault_injector(&self) -> &Arc<FaultInjector> {
        &self.fault_injector
    }

    /// Append round trips attempted so far
    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Apply any injected fault for `operation`
    ///
    /// Returns `Ok(true)` if the write should be performed but its
    /// acknowledgement lost.
    async fn gate(&self, operation: StoreOperation) -> Result<bool> {
        let Some(fault) = self.fault_injector.should_inject(operation) else {
            return Ok(false);
        };

        match fault {
            FaultType::StorageLatency { min_ms, max_ms } => {
                let delay_ms = if max_ms > min_ms {
                    self.rng.next_range(min_ms, max_ms + 1)
                } else {
                    min_ms
                };
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(false)
            }
            FaultType::StorageHang => {
                std::future::pending::<()>().await;
                Ok(false)
            }
            FaultType::StorageWriteFail => Err(Error::storage_unavailable(
                operation.as_str(),
                "injected write failure",
            )),
            FaultType::StorageReadFail => Err(Error::storage_unavailable(
                operation.as_str(),
                "injected read failure",
            )),
            FaultType::CrashAfterWrite => Ok(true),
        }
    }
}

#[async_trait]
impl EventStore for SimEventStore {
    async fn append_events(
        &self,
        agent_id: &AgentId,
        events: Vec<NewEvent>,
        expected_version: Version,
    ) -> Result<Version> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let lose_ack = self.gate(StoreOperation::Append).await?;
        let version = self
            .inner
            .append_events(agent_id, events, expected_version)
            .await?;
        if lose_ack {
            return Err(Error::storage_unavailable(
                StoreOperation::Append.as_str(),
                format!("acknowledgement lost after commit at {}", version),
            ));
        }
        Ok(version)
    }

    async fn get_events(&self, agent_id: &AgentId, query: EventQuery) -> Result<Vec<EventRecord>> {
        self.gate(StoreOperation::ReadEvents).await?;
        self.inner.get_events(agent_id, query).await
    }

    async fn get_latest_version(&self, agent_id: &AgentId) -> Result<Version> {
        self.gate(StoreOperation::ReadVersion).await?;
        self.inner.get_latest_version(agent_id).await
    }

    async fn save_snapshot(&self, agent_id: &AgentId, version: Version, state: Bytes) -> Result<()> {
        let lose_ack = self.gate(StoreOperation::SaveSnapshot).await?;
        self.inner.save_snapshot(agent_id, version, state).await?;
        if lose_ack {
            return Err(Error::storage_unavailable(
                StoreOperation::SaveSnapshot.as_str(),
                "acknowledgement lost after commit",
            ));
        }
        Ok(())
    }

    async fn get_latest_snapshot(&self, agent_id: &AgentId) -> Result<Option<SnapshotRecord>> {
        self.gate(StoreOperation::ReadSnapshot).await?;
        self.inner.get_latest_snapshot(agent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultConfig;

    fn agent() -> AgentId {
        AgentId::new("sim", "a").unwrap()
    }

    fn store(faults: Vec<FaultConfig>) -> SimEventStore {
        let rng = DeterministicRng::new(42);
        let mut injector = FaultInjector::new(rng.fork());
        for fault in faults {
            injector.register(fault);
        }
        SimEventStore::new(SimClock::from_millis(1_000), rng, Arc::new(injector))
    }

    fn batch() -> Vec<NewEvent> {
        vec![NewEvent::encode("sim.tick", &1u32).unwrap()]
    }

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let store = store(vec![]);
        let v = store.append_events(&agent(), batch(), Version::INITIAL).await.unwrap();
        assert_eq!(v, Version::new(1));

        let events = store.get_events(&agent(), EventQuery::all()).await.unwrap();
        assert_eq!(events[0].timestamp_ms, 1_000);
        assert_eq!(store.append_calls(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_stores_nothing() {
        let store = store(vec![FaultConfig::new(FaultType::StorageWriteFail, 1.0)]);
        let err = store
            .append_events(&agent(), batch(), Version::INITIAL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
        assert_eq!(store.inner().event_count(&agent()).await, 0);

        // Reads are unaffected by write faults
        assert!(store.get_latest_version(&agent()).await.is_ok());
    }

    #[tokio::test]
    async fn test_lost_ack_still_commits() {
        let store = store(vec![
            FaultConfig::new(FaultType::CrashAfterWrite, 1.0).max_triggers(1)
        ]);
        assert!(store
            .append_events(&agent(), batch(), Version::INITIAL)
            .await
            .is_err());
        assert_eq!(
            store.get_latest_version(&agent()).await.unwrap(),
            Version::new(1)
        );
    }
}
