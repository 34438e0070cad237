//! Snapshot policies
//!
//! A policy is consulted after every successful confirm and decides whether
//! the current state should be written as the agent's latest snapshot.

use arbor_core::occ::Version;

/// Decides when to snapshot
pub trait SnapshotPolicy: Send + Sync + std::fmt::Debug {
    /// Called after a confirm moved the log from `previous` to `current`;
    /// `last_snapshot` is the version of the last snapshot taken (or loaded)
    fn should_snapshot(&self, previous: Version, current: Version, last_snapshot: Version) -> bool;
}

/// Snapshot once at least `n` versions have been confirmed since the last one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EveryNVersions(pub u64);

impl SnapshotPolicy for EveryNVersions {
    fn should_snapshot(&self, _previous: Version, current: Version, last_snapshot: Version) -> bool {
        self.0 > 0 && current.since(last_snapshot) >= self.0
    }
}

/// Never snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeverSnapshot;

impl SnapshotPolicy for NeverSnapshot {
    fn should_snapshot(&self, _previous: Version, _current: Version, _last_snapshot: Version) -> bool {
        false
    }
}
