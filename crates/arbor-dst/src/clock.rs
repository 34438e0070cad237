//! Deterministic clock for simulation
//!
//! TigerStyle: Explicit time control, no system time dependencies.
//!
//! [`SimClock`] implements [`TimeProvider`], so deduplication TTLs, envelope
//! timestamps and event store timestamps all follow simulated time.

use arbor_core::io::TimeProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// 2024-01-01T00:00:00Z
const SIM_CLOCK_START_MS_DEFAULT: u64 = 1_704_067_200_000;

/// Deterministic simulation clock
///
/// Time only advances when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct SimClock {
    current_time_ms: Arc<AtomicU64>,
    /// Wakes sleepers when time advances
    notify: Arc<Notify>,
}

impl SimClock {
    /// Create a clock starting at `start_time`
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self::from_millis(start_time.timestamp_millis().max(0) as u64)
    }

    /// Create a clock starting at a millisecond timestamp
    pub fn from_millis(ms: u64) -> Self {
        Self {
            current_time_ms: Arc::new(AtomicU64::new(ms)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Current time
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms() as i64).unwrap_or_default()
    }

    /// Current time in milliseconds since epoch
    pub fn now_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }

    /// Advance time and wake sleepers
    pub fn advance_ms(&self, ms: u64) {
        self.current_time_ms.fetch_add(ms, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until simulated time reaches now + `ms`
    pub async fn sleep_ms(&self, ms: u64) {
        let target_ms = self.now_ms().saturating_add(ms);
        loop {
            // Register before checking so an advance in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.now_ms() >= target_ms {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::from_millis(SIM_CLOCK_START_MS_DEFAULT)
    }
}

#[async_trait]
impl TimeProvider for SimClock {
    fn now_ms(&self) -> u64 {
        SimClock::now_ms(self)
    }

    async fn sleep_ms(&self, ms: u64) {
        SimClock::sleep_ms(self, ms).await
    }
}
