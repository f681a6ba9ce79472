//! Concurrent primitives the runtime is built on: a bounded lock-free ring
//! queue, a segmented concurrent map and set, and an atomic reference cell
//! with a CAS-loop updater.

mod atomic;
mod map;
mod ring;
mod set;

pub use self::atomic::AtomicRef;
pub use self::map::{MapStats, SegmentedMap};
pub use self::ring::{OverflowHook, RingMetrics, RingOptions, RingQueue};
pub use self::set::SegmentedSet;

use std::hash::{Hash, Hasher};

/// Lifecycle state shared by the queue and the map.
///
/// `Closing` is sticky: writes are rejected while draining is still allowed.
/// A structure that drains to empty while `Closing` becomes `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Open,
    Closing,
    Closed,
}

impl SyncState {
    pub(crate) fn from_u8(v: u8) -> SyncState {
        match v {
            0 => SyncState::Open,
            1 => SyncState::Closing,
            _ => SyncState::Closed,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SyncState::Open => 0,
            SyncState::Closing => 1,
            SyncState::Closed => 2,
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a. Deterministic across processes, which the consistent-hash router
/// relies on; `std`'s default hasher is randomly seeded.
pub struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        FnvHasher(FNV_OFFSET)
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Hashes any `Hash` value with FNV-1a.
pub fn fnv_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FnvHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hashes raw bytes with FNV-1a, without `Hash`-derived framing.
pub fn fnv_hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}
