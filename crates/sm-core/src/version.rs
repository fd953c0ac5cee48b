//! Chunk versions and collection epochs

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Collection incarnation identifier
///
/// A new epoch is assigned when a collection is dropped and recreated.
/// Chunk versions from different epochs are incomparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(Uuid);

impl Epoch {
    /// Create a fresh epoch
    pub fn new() -> Self {
        Epoch(Uuid::new_v4())
    }

    /// The nil epoch, used by the unsharded version sentinel
    pub fn nil() -> Self {
        Epoch(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a chunk map in the collection's routing history
///
/// `major` advances on chunk ownership changes (migrations), `minor` on
/// boundary changes (splits and merges) within an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u64,
    pub minor: u64,
    pub epoch: Epoch,
}

impl ChunkVersion {
    pub fn new(major: u64, minor: u64, epoch: Epoch) -> Self {
        Self { major, minor, epoch }
    }

    /// Sentinel version of a collection that is not sharded
    pub fn unsharded() -> Self {
        Self::new(0, 0, Epoch::nil())
    }

    pub fn is_sharded(&self) -> bool {
        *self != Self::unsharded()
    }
}

impl PartialOrd for ChunkVersion {
    /// Versions are ordered only within a single epoch.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}
