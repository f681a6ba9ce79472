use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::sync::{fnv_hash, SyncState};

const DEFAULT_SEGMENTS: usize = 16;
const INITIAL_BUCKETS: usize = 16;
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

pub type HashFn<K> = Arc<dyn Fn(&K) -> u64 + Send + Sync>;

/// Aggregate statistics across all segments.
#[derive(Clone, Debug)]
pub struct MapStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub resizes: u64,
    pub segment_fill: Vec<usize>,
}

struct SegmentInner<K, V> {
    buckets: Vec<Vec<(K, V)>>,
    len: usize,
}

struct Segment<K, V> {
    inner: RwLock<SegmentInner<K, V>>,
}

impl<K, V> Segment<K, V> {
    fn new() -> Segment<K, V> {
        Segment {
            inner: RwLock::new(SegmentInner {
                buckets: (0..INITIAL_BUCKETS).map(|_| Vec::new()).collect(),
                len: 0,
            }),
        }
    }
}

/// Concurrent map segmented into `2^k` independently locked regions.
///
/// One hash per operation: the top bits select the segment, the low bits the
/// bucket within it, so contention scales with the segment count. Each
/// segment is a separate-chaining table that doubles in place past a 3/4
/// load factor.
pub struct SegmentedMap<K, V> {
    segments: Box<[Segment<K, V>]>,
    shift: u32,
    hasher: HashFn<K>,
    state: AtomicU8,
    hits: AtomicU64,
    misses: AtomicU64,
    resizes: AtomicU64,
}

impl<K, V> SegmentedMap<K, V>
where
    K: Hash + Eq,
{
    pub fn new() -> SegmentedMap<K, V> {
        SegmentedMap::with_hasher(DEFAULT_SEGMENTS, Arc::new(|k: &K| fnv_hash(k)))
    }

    pub fn with_segments(segments: usize) -> SegmentedMap<K, V> {
        SegmentedMap::with_hasher(segments, Arc::new(|k: &K| fnv_hash(k)))
    }

    /// Builds a map with a caller-supplied hash function. `segments` must be
    /// a power of two.
    pub fn with_hasher(segments: usize, hasher: HashFn<K>) -> SegmentedMap<K, V> {
        let segments = segments.next_power_of_two().max(1);
        SegmentedMap {
            segments: (0..segments).map(|_| Segment::new()).collect(),
            shift: 64 - segments.trailing_zeros(),
            hasher,
            state: AtomicU8::new(SyncState::Open.as_u8()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
        }
    }
}

impl<K, V> Default for SegmentedMap<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        SegmentedMap::new()
    }
}

impl<K, V> SegmentedMap<K, V>
where
    K: Hash + Eq,
{
    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Marks the map closing: inserts are rejected, reads and removals still
    /// work. Removing the last entry while `Closing` moves to `Closed`.
    pub fn close(&self) {
        let _ = self.state.compare_exchange(
            SyncState::Open.as_u8(),
            SyncState::Closing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.is_empty() {
            self.finalize_close();
        }
    }

    fn finalize_close(&self) {
        let _ = self.state.compare_exchange(
            SyncState::Closing.as_u8(),
            SyncState::Closed.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn segment(&self, hash: u64) -> &Segment<K, V> {
        let idx = if self.segments.len() == 1 {
            0
        } else {
            (hash >> self.shift) as usize
        };
        &self.segments[idx]
    }

    fn bucket_index(hash: u64, buckets: usize) -> usize {
        (hash as usize) & (buckets - 1)
    }

    /// Inserts or replaces. Returns `true` when `key` was absent, `false`
    /// on update. No-op returning `false` once the map is closing.
    pub fn insert(&self, key: K, value: V) -> bool {
        if self.state() != SyncState::Open {
            return false;
        }
        let hash = (self.hasher)(&key);
        let segment = self.segment(hash);
        let mut inner = segment.inner.write().unwrap();

        let idx = Self::bucket_index(hash, inner.buckets.len());
        if let Some(entry) = inner.buckets[idx].iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return false;
        }
        inner.buckets[idx].push((key, value));
        inner.len += 1;

        if inner.len * MAX_LOAD_DEN > inner.buckets.len() * MAX_LOAD_NUM {
            Self::rehash(&mut inner, &self.hasher);
            self.resizes.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    // Doubles the bucket array and redistributes every chain.
    fn rehash(inner: &mut SegmentInner<K, V>, hasher: &HashFn<K>) {
        let new_size = inner.buckets.len() * 2;
        let mut new_buckets: Vec<Vec<(K, V)>> = (0..new_size).map(|_| Vec::new()).collect();
        for bucket in inner.buckets.drain(..) {
            for (k, v) in bucket {
                let idx = Self::bucket_index(hasher(&k), new_size);
                new_buckets[idx].push((k, v));
            }
        }
        inner.buckets = new_buckets;
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = (self.hasher)(key);
        let inner = self.segment(hash).inner.read().unwrap();
        let idx = Self::bucket_index(hash, inner.buckets.len());
        inner.buckets[idx].iter().any(|(k, _)| k == key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.remove_if(key, |_| true)
    }

    /// Removes `key` only when `pred` holds for its value.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let hash = (self.hasher)(key);
        let removed = {
            let segment = self.segment(hash);
            let mut inner = segment.inner.write().unwrap();
            let idx = Self::bucket_index(hash, inner.buckets.len());
            let pos = inner.buckets[idx].iter().position(|(k, _)| k == key)?;
            if !pred(&inner.buckets[idx][pos].1) {
                return None;
            }
            inner.len -= 1;
            Some(inner.buckets[idx].swap_remove(pos).1)
        };
        if self.state() == SyncState::Closing && self.is_empty() {
            self.finalize_close();
        }
        removed
    }

    pub fn clear(&self) {
        for segment in self.segments.iter() {
            let mut inner = segment.inner.write().unwrap();
            for bucket in inner.buckets.iter_mut() {
                bucket.clear();
            }
            inner.len = 0;
        }
        if self.state() == SyncState::Closing {
            self.finalize_close();
        }
    }

    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.inner.read().unwrap().len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.inner.read().unwrap().len == 0)
    }

    pub fn stats(&self) -> MapStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        MapStats {
            size: self.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            resizes: self.resizes.load(Ordering::Relaxed),
            segment_fill: self
                .segments
                .iter()
                .map(|s| s.inner.read().unwrap().len)
                .collect(),
        }
    }
}

impl<K, V> SegmentedMap<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        let hash = (self.hasher)(key);
        let inner = self.segment(hash).inner.read().unwrap();
        let idx = Self::bucket_index(hash, inner.buckets.len());
        match inner.buckets[idx].iter().find(|(k, _)| k == key) {
            Some((_, v)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

impl<K, V> SegmentedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        for segment in self.segments.iter() {
            let inner = segment.inner.read().unwrap();
            for bucket in inner.buckets.iter() {
                keys.extend(bucket.iter().map(|(k, _)| k.clone()));
            }
        }
        keys
    }
}

impl<K, V> SegmentedMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Point-in-time snapshot of every entry. Segments are visited one at a
    /// time, so the snapshot is consistent per segment, not globally.
    pub fn entries(&self) -> Vec<(K, V)> {
        let mut entries = Vec::new();
        for segment in self.segments.iter() {
            let inner = segment.inner.read().unwrap();
            for bucket in inner.buckets.iter() {
                entries.extend(bucket.iter().cloned());
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_update() {
        let map: SegmentedMap<String, u32> = SegmentedMap::new();
        assert!(map.insert("a".into(), 1));
        assert!(!map.insert("a".into(), 2));
        assert_eq!(map.get(&"a".into()), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn has_iff_get_is_some() {
        let map: SegmentedMap<u64, u64> = SegmentedMap::new();
        for i in 0..100 {
            map.insert(i, i * 2);
        }
        map.remove(&7);
        for i in 0..100 {
            assert_eq!(map.contains_key(&i), map.get(&i).is_some());
        }
    }

    #[test]
    fn size_equals_sum_of_segments() {
        let map: SegmentedMap<u64, u64> = SegmentedMap::with_segments(8);
        for i in 0..500 {
            map.insert(i, i);
        }
        let stats = map.stats();
        assert_eq!(stats.size, 500);
        assert_eq!(stats.segment_fill.iter().sum::<usize>(), 500);
    }

    #[test]
    fn colliding_hasher_keeps_chains_correct() {
        // Every key lands in segment 0, bucket 0.
        let map: SegmentedMap<&str, u32> = SegmentedMap::with_hasher(4, Arc::new(|_| 0));
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        map.insert("d", 4);
        assert_eq!(map.remove(&"b"), Some(2));
        assert_eq!(map.get(&"a"), Some(1));
        assert_eq!(map.get(&"b"), None);
        assert_eq!(map.get(&"c"), Some(3));
        assert_eq!(map.get(&"d"), Some(4));
    }

    #[test]
    fn rehash_preserves_entries() {
        let map: SegmentedMap<u64, u64> = SegmentedMap::with_segments(1);
        for i in 0..1000 {
            map.insert(i, i + 1);
        }
        assert!(map.stats().resizes > 0);
        for i in 0..1000 {
            assert_eq!(map.get(&i), Some(i + 1));
        }
    }

    #[test]
    fn closing_rejects_inserts_allows_drain() {
        let map: SegmentedMap<u64, u64> = SegmentedMap::new();
        map.insert(1, 1);
        map.close();
        assert_eq!(map.state(), SyncState::Closing);
        assert!(!map.insert(2, 2));
        assert_eq!(map.get(&1), Some(1));
        assert_eq!(map.remove(&1), Some(1));
        assert_eq!(map.state(), SyncState::Closed);
    }

    #[test]
    fn concurrent_inserts_across_segments() {
        let map = Arc::new(SegmentedMap::<u64, u64>::new());
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    map.insert(t * 1_000 + i, i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 4000);
    }
}
