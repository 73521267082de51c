//! Snapshot versions.
//!
//! Every commit produces a new version. Versions are totally ordered and
//! strictly increasing for the lifetime of a store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, monotonically increasing snapshot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of a freshly created, empty store.
    pub const INITIAL: Version = Version(0);

    /// Create a version from its raw counter.
    pub fn new(counter: u64) -> Self {
        Self(counter)
    }

    /// The raw counter.
    pub fn counter(&self) -> u64 {
        self.0
    }

    /// The version produced by the next commit.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
