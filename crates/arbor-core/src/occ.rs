//! Optimistic concurrency control primitives
//!
//! TigerStyle: Explicit version type for event logs.
//!
//! Every agent's event log is versioned densely from 1. `Version::INITIAL`
//! (0) denotes "no events yet" and is the expected version for the first
//! append. A writer that read version `v` appends with `expected = v`; the
//! store rejects the append if the log has moved past `v` in the meantime.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Version
// =============================================================================

/// Version number of an agent's event log
///
/// Monotonically increasing on each appended event.
///
/// # TigerStyle
/// - Explicit type (not raw u64) for type safety
/// - `Version::INITIAL = 0` means the log is empty
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    /// Version of an empty log
    pub const INITIAL: Self = Version(0);

    /// Create a new version
    pub const fn new(v: u64) -> Self {
        Version(v)
    }

    /// Get the raw version number
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The version following this one
    pub fn increment(&self) -> Self {
        Version(self.0.saturating_add(1))
    }

    /// Advance by `count` versions
    pub fn advance(&self, count: u64) -> Self {
        Version(self.0.saturating_add(count))
    }

    /// Number of versions between `earlier` and this version
    pub fn since(&self, earlier: Version) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_initial() {
        assert_eq!(Version::INITIAL.value(), 0);
        assert_eq!(Version::default(), Version::INITIAL);
    }

    #[test]
    fn test_version_increment_and_advance() {
        let v0 = Version::INITIAL;
        let v1 = v0.increment();
        assert_eq!(v1.value(), 1);
        assert_eq!(v1.advance(2), Version::new(3));
        assert_eq!(Version::new(7).since(Version::new(3)), 4);
        assert_eq!(Version::new(3).since(Version::new(7)), 0);
    }

    #[test]
    fn test_version_ordering_and_display() {
        assert!(Version::new(1) < Version::new(2));
        assert_eq!(Version::new(5).to_string(), "v5");
    }
}
