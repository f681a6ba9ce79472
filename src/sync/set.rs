use std::hash::Hash;

use crate::sync::SegmentedMap;

/// Concurrent set over [`SegmentedMap`] with unit values. Backs the
/// per-actor children sets and the spawn-path uniqueness index.
pub struct SegmentedSet<T> {
    map: SegmentedMap<T, ()>,
}

impl<T> SegmentedSet<T>
where
    T: Hash + Eq,
{
    pub fn new() -> SegmentedSet<T> {
        SegmentedSet {
            map: SegmentedMap::new(),
        }
    }

    /// Returns `true` when the value was not already present.
    pub fn insert(&self, value: T) -> bool {
        self.map.insert(value, ())
    }

    pub fn remove(&self, value: &T) -> bool {
        self.map.remove(value).is_some()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.map.contains_key(value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear()
    }
}

impl<T> Default for SegmentedSet<T>
where
    T: Hash + Eq,
{
    fn default() -> Self {
        SegmentedSet::new()
    }
}

impl<T> SegmentedSet<T>
where
    T: Hash + Eq + Clone,
{
    /// Snapshot of the members at the time of the call.
    pub fn iter(&self) -> Vec<T> {
        self.map.keys()
    }
}
