//! Bounded subscription queue
//!
//! TigerStyle: Bounded queues with explicit limits, no silent drops.
//!
//! One queue sits between a stream and each of its subscribers. The producer
//! side honors the configured [`OverflowPolicy`]; the consumer side is a
//! single delivery task. The newest envelope is never dropped silently: a
//! full queue either blocks the producer, evicts (and counts) the oldest
//! entry, or returns `StreamFull`.

use arbor_core::config::OverflowPolicy;
use arbor_core::constants::STREAM_SUBSCRIPTION_DEPTH_MAX;
use arbor_core::envelope::Envelope;
use arbor_core::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Counters for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Envelopes accepted
    pub enqueued_count: u64,
    /// Envelopes handed to the consumer
    pub delivered_count: u64,
    /// Envelopes evicted under `DropOldest`
    pub evicted_count: u64,
    /// Pushes refused under `Reject`
    pub rejected_count: u64,
}

#[derive(Debug)]
struct QueueInner {
    queue: VecDeque<Envelope>,
    closed: bool,
    stats: QueueStats,
}

/// Bounded FIFO between one stream and one subscriber
#[derive(Debug)]
pub struct SubscriptionQueue {
    /// Name used in errors and logs
    label: String,
    capacity: usize,
    overflow: OverflowPolicy,
    inner: Mutex<QueueInner>,
    items_available: Notify,
    space_available: Notify,
}

impl SubscriptionQueue {
    /// Create a queue
    pub fn new(label: impl Into<String>, capacity: usize, overflow: OverflowPolicy) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        assert!(
            capacity <= STREAM_SUBSCRIPTION_DEPTH_MAX,
            "capacity exceeds STREAM_SUBSCRIPTION_DEPTH_MAX"
        );

        Self {
            label: label.into(),
            capacity,
            overflow,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::with_capacity(capacity.min(1024)), // Pre-allocate reasonably
                closed: false,
                stats: QueueStats::default(),
            }),
            items_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue an envelope according to the overflow policy
    ///
    /// # Errors
    /// `StreamFull` under `Reject` when full; `StreamUnavailable` once closed.
    pub async fn push(&self, envelope: Envelope) -> Result<()> {
        let mut envelope = Some(envelope);
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(Error::StreamUnavailable {
                        stream: self.label.clone(),
                        reason: "subscription closed".into(),
                    });
                }

                if inner.queue.len() >= self.capacity {
                    match self.overflow {
                        OverflowPolicy::Block => {}
                        OverflowPolicy::DropOldest => {
                            if let Some(evicted) = inner.queue.pop_front() {
                                inner.stats.evicted_count = inner.stats.evicted_count.wrapping_add(1);
                                warn!(
                                    queue = %self.label,
                                    envelope_id = %evicted.id,
                                    capacity = self.capacity,
                                    "Queue full, evicted oldest envelope"
                                );
                            }
                        }
                        OverflowPolicy::Reject => {
                            inner.stats.rejected_count = inner.stats.rejected_count.wrapping_add(1);
                            return Err(Error::StreamFull {
                                stream: self.label.clone(),
                                depth: inner.queue.len(),
                                max: self.capacity,
                            });
                        }
                    }
                }

                if inner.queue.len() < self.capacity {
                    if let Some(envelope) = envelope.take() {
                        inner.queue.push_back(envelope);
                        inner.stats.enqueued_count = inner.stats.enqueued_count.wrapping_add(1);
                    }
                    debug_assert!(inner.queue.len() <= self.capacity);
                    drop(inner);
                    self.items_available.notify_one();
                    return Ok(());
                }
            }

            // Block: wait for the consumer to make room
            notified.await;
        }
    }

    /// Dequeue the next envelope, waiting if empty
    ///
    /// Returns `None` once the queue is closed. Envelopes still queued at
    /// close are discarded, not delivered.
    pub async fn pop(&self) -> Option<Envelope> {
        loop {
            let notified = self.items_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(envelope) = inner.queue.pop_front() {
                    inner.stats.delivered_count = inner.stats.delivered_count.wrapping_add(1);
                    drop(inner);
                    self.space_available.notify_one();
                    return Some(envelope);
                }
            }

            notified.await;
        }
    }

    /// Close the queue, discarding anything still queued
    ///
    /// Returns the number of discarded envelopes.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.lock();
            inner.closed = true;
            let n = inner.queue.len();
            inner.queue.clear();
            n
        };
        self.items_available.notify_waiters();
        self.space_available.notify_waiters();
        discarded
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued envelopes
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }
}
