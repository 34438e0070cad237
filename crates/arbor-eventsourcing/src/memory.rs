//! In-memory event store
//!
//! For testing and DST simulations.
//!
//! TigerStyle: Version check and append under one write lock.

use crate::store::{EventQuery, EventRecord, EventStore, NewEvent, SnapshotRecord};
use arbor_core::agent::AgentId;
use arbor_core::constants::EVENT_BATCH_COUNT_MAX;
use arbor_core::error::{Error, Result};
use arbor_core::io::{TimeProvider, WallClockTime};
use arbor_core::occ::Version;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

/// One agent's log and latest snapshot
#[derive(Debug, Default)]
struct AgentLog {
    /// events[i] has version i + 1
    events: Vec<EventRecord>,
    snapshot: Option<SnapshotRecord>,
}

impl AgentLog {
    fn version(&self) -> Version {
        Version::new(self.events.len() as u64)
    }
}

/// In-memory event store
#[derive(Clone)]
pub struct MemoryEventStore {
    /// agent qualified name -> log
    logs: Arc<RwLock<HashMap<String, AgentLog>>>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for MemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventStore").finish_non_exhaustive()
    }
}

impl MemoryEventStore {
    /// Create an empty store stamped with wall-clock time
    pub fn new() -> Self {
        Self::with_time(Arc::new(WallClockTime::new()))
    }

    /// Create an empty store with a custom clock
    pub fn with_time(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            time,
        }
    }

    fn log_key(agent_id: &AgentId) -> String {
        agent_id.qualified_name()
    }

    /// Number of events stored for `agent_id`
    pub async fn event_count(&self, agent_id: &AgentId) -> usize {
        self.logs
            .read()
            .await
            .get(&Self::log_key(agent_id))
            .map_or(0, |log| log.events.len())
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    #[instrument(skip(self, events), fields(agent_id = %agent_id, count = events.len(), expected = %expected_version))]
    async fn append_events(
        &self,
        agent_id: &AgentId,
        events: Vec<NewEvent>,
        expected_version: Version,
    ) -> Result<Version> {
        if events.len() > EVENT_BATCH_COUNT_MAX {
            return Err(Error::EventBatchTooLarge {
                count: events.len(),
                limit: EVENT_BATCH_COUNT_MAX,
            });
        }

        let mut logs = self.logs.write().await;
        let log = logs.entry(Self::log_key(agent_id)).or_default();

        let current = log.version();
        if current != expected_version {
            return Err(Error::VersionConflict {
                agent_id: agent_id.to_string(),
                expected: expected_version.value(),
                actual: current.value(),
            });
        }

        let timestamp_ms = self.time.now_ms();
        let mut version = current;
        for event in events {
            version = version.increment();
            log.events.push(EventRecord {
                agent_id: agent_id.clone(),
                version,
                event_type: event.event_type,
                payload: event.payload,
                timestamp_ms,
            });
        }

        debug_assert_eq!(log.version(), version);
        Ok(version)
    }

    #[instrument(skip(self), fields(agent_id = %agent_id))]
    async fn get_events(&self, agent_id: &AgentId, query: EventQuery) -> Result<Vec<EventRecord>> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(&Self::log_key(agent_id)) else {
            return Ok(Vec::new());
        };

        // Versions are dense from 1, so the start index is direct
        let start = query.from_version.value().saturating_sub(1) as usize;
        let limit = query.max_count.unwrap_or(usize::MAX);
        Ok(log
            .events
            .iter()
            .skip(start)
            .take_while(|record| query.contains(record.version))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_latest_version(&self, agent_id: &AgentId) -> Result<Version> {
        Ok(self
            .logs
            .read()
            .await
            .get(&Self::log_key(agent_id))
            .map_or(Version::INITIAL, AgentLog::version))
    }

    #[instrument(skip(self, state), fields(agent_id = %agent_id, version = %version, state_len = state.len()))]
    async fn save_snapshot(&self, agent_id: &AgentId, version: Version, state: Bytes) -> Result<()> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(Self::log_key(agent_id)).or_default();

        if version > log.version() {
            return Err(Error::EventLogCorrupted {
                agent_id: agent_id.to_string(),
                reason: format!("snapshot {} is ahead of log {}", version, log.version()),
            });
        }
        if matches!(&log.snapshot, Some(existing) if existing.version > version) {
            return Ok(());
        }

        log.snapshot = Some(SnapshotRecord {
            agent_id: agent_id.clone(),
            version,
            state,
            timestamp_ms: self.time.now_ms(),
        });
        Ok(())
    }

    async fn get_latest_snapshot(&self, agent_id: &AgentId) -> Result<Option<SnapshotRecord>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&Self::log_key(agent_id))
            .and_then(|log| log.snapshot.clone()))
    }
}
