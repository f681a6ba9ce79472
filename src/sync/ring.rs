use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::sync::SyncState;

// The slot protocol is the classic sequence-numbered ring: a slot whose
// sequence equals the tail index is free for the producer that wins the tail
// CAS; a slot whose sequence equals head + 1 holds a value for the consumer
// that wins the head CAS. Indices are unbounded usizes, so lap wrap-around is
// unreachable on 64-bit targets. The slot array itself sits behind an RwLock
// that every operation takes shared; only a capacity change takes it
// exclusively, so the hot path never blocks on another enqueue or dequeue.

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

fn fresh_slots<T>(capacity: usize) -> Box<[Slot<T>]> {
    let mut slots = Vec::with_capacity(capacity);
    for i in 0..capacity {
        slots.push(Slot {
            seq: AtomicUsize::new(i),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        });
    }
    slots.into_boxed_slice()
}

/// Overflow hook, invoked with the rejected item when a bounded queue is
/// full and cannot resize.
pub type OverflowHook<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct RingOptions<T> {
    pub auto_resize: bool,
    pub max_capacity: usize,
    pub overflow: Option<OverflowHook<T>>,
}

impl<T> Default for RingOptions<T> {
    fn default() -> Self {
        RingOptions {
            auto_resize: false,
            max_capacity: usize::MAX,
            overflow: None,
        }
    }
}

/// Counter snapshot for the accounting invariant
/// `enqueued - dequeued - len == 0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RingMetrics {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub resizes: u64,
}

/// Bounded FIFO queue with lock-free enqueue/dequeue and optional capacity
/// doubling up to `max_capacity`.
pub struct RingQueue<T> {
    slots: RwLock<Box<[Slot<T>]>>,
    head: AtomicUsize,
    tail: AtomicUsize,
    len: AtomicUsize,
    state: AtomicU8,
    auto_resize: bool,
    max_capacity: usize,
    overflow: Option<OverflowHook<T>>,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    resizes: AtomicU64,
}

unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    pub fn new(capacity: usize) -> RingQueue<T> {
        RingQueue::with_options(capacity, RingOptions::default())
    }

    pub fn with_options(capacity: usize, options: RingOptions<T>) -> RingQueue<T> {
        let capacity = capacity.max(1);
        RingQueue {
            slots: RwLock::new(fresh_slots(capacity)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            state: AtomicU8::new(SyncState::Open.as_u8()),
            auto_resize: options.auto_resize,
            max_capacity: options.max_capacity.max(capacity),
            overflow: options.overflow,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn metrics(&self) -> RingMetrics {
        RingMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
        }
    }

    /// Appends an item. Returns `false` when the queue is closing, closed, or
    /// full without room to resize; the rejected item is handed to the
    /// overflow hook if one is installed.
    pub fn enqueue(&self, item: T) -> bool {
        match self.offer(item) {
            Ok(()) => true,
            Err(rejected) => {
                self.reject(rejected);
                false
            }
        }
    }

    /// Like [`enqueue`](Self::enqueue), but hands a rejected item back to the
    /// caller instead of the overflow hook and leaves the rejection counter
    /// untouched.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            if self.state() != SyncState::Open {
                return Err(item);
            }

            {
                let slots = self.slots.read().unwrap();
                match self.try_push(&slots, item) {
                    Ok(()) => {
                        self.enqueued.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(back) => item = back,
                }
            }

            let cap = self.capacity();
            if !self.auto_resize || cap >= self.max_capacity {
                return Err(item);
            }
            self.grow();
        }
    }

    /// Removes the oldest item, if any. Draining an empty queue while
    /// `Closing` finalizes the transition to `Closed`.
    pub fn dequeue(&self) -> Option<T> {
        let popped = {
            let slots = self.slots.read().unwrap();
            self.try_pop(&slots)
        };

        match popped {
            Some(value) => {
                self.dequeued.fetch_add(1, Ordering::Relaxed);
                if self.is_empty() {
                    self.finalize_close();
                }
                Some(value)
            }
            None => {
                self.finalize_close();
                None
            }
        }
    }

    /// Marks the queue closing: further enqueues are rejected while queued
    /// items remain drainable. Sticky.
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

    fn reject(&self, item: T) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = &self.overflow {
            hook(item);
        }
    }

    fn try_push(&self, slots: &[Slot<T>], item: T) -> Result<(), T> {
        let cap = slots.len();
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &slots[tail % cap];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(item) };
                        slot.seq.store(tail + 1, Ordering::Release);
                        self.len.fetch_add(1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => tail = current,
                }
            } else if seq < tail {
                // One full lap behind: no free slot.
                return Err(item);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    fn try_pop(&self, slots: &[Slot<T>]) -> Option<T> {
        let cap = slots.len();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &slots[head % cap];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == head + 1 {
                match self.head.compare_exchange_weak(
                    head,
                    head + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq.store(head + cap, Ordering::Release);
                        self.len.fetch_sub(1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => head = current,
                }
            } else if seq <= head {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    // Doubles capacity, copying queued items FIFO into slot 0..len of the new
    // buffer. Exclusive access through the write lock; indices are rebased.
    fn grow(&self) {
        let mut slots = self.slots.write().unwrap();
        let cap = slots.len();
        if self.len.load(Ordering::Acquire) < cap {
            // Another thread resized or a consumer made room.
            return;
        }
        let new_cap = (cap * 2).min(self.max_capacity);
        if new_cap == cap {
            return;
        }

        let head = self.head.load(Ordering::Acquire);
        let count = self.len.load(Ordering::Acquire);
        let new_slots = fresh_slots::<T>(new_cap);
        for i in 0..count {
            let slot = &slots[(head + i) % cap];
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            unsafe { (*new_slots[i].value.get()).write(value) };
            new_slots[i].seq.store(i + 1, Ordering::Release);
        }

        *slots = new_slots;
        self.head.store(0, Ordering::Release);
        self.tail.store(count, Ordering::Release);
        self.resizes.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T: Clone> RingQueue<T> {
    /// Copies the oldest item without removing it. Takes the slot buffer
    /// exclusively, so it never observes a half-written slot.
    pub fn peek(&self) -> Option<T> {
        let slots = self.slots.write().unwrap();
        let cap = slots.len();
        let head = self.head.load(Ordering::Acquire);
        let slot = &slots[head % cap];
        if slot.seq.load(Ordering::Acquire) == head + 1 {
            Some(unsafe { (*slot.value.get()).assume_init_ref() }.clone())
        } else {
            None
        }
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn fifo_order() {
        let q = RingQueue::new(16);
        for i in 0..10 {
            assert!(q.enqueue(i));
        }
        for i in 0..10 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn fifo_preserved_across_resize() {
        let q = RingQueue::with_options(
            2,
            RingOptions {
                auto_resize: true,
                max_capacity: 64,
                overflow: None,
            },
        );
        for i in 0..40 {
            assert!(q.enqueue(i));
        }
        assert!(q.metrics().resizes > 0);
        for i in 0..40 {
            assert_eq!(q.dequeue(), Some(i));
        }
    }

    #[test]
    fn bounded_queue_rejects_and_fires_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let q = RingQueue::with_options(
            2,
            RingOptions {
                auto_resize: false,
                max_capacity: 2,
                overflow: Some(Arc::new(move |v: u32| hook_seen.lock().unwrap().push(v))),
            },
        );
        assert!(q.enqueue(1));
        assert!(q.enqueue(2));
        assert!(!q.enqueue(3));
        assert_eq!(q.metrics().rejected, 1);
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn accounting_invariant_holds() {
        let q = RingQueue::new(8);
        for i in 0..6 {
            q.enqueue(i);
        }
        q.dequeue();
        q.dequeue();
        let m = q.metrics();
        assert_eq!(m.enqueued - m.dequeued - q.len() as u64, 0);
    }

    #[test]
    fn closing_rejects_enqueue_and_drains_to_closed() {
        let q = RingQueue::new(4);
        q.enqueue(1);
        q.enqueue(2);
        q.close();
        assert_eq!(q.state(), SyncState::Closing);
        assert!(!q.enqueue(3));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.state(), SyncState::Closed);
    }

    #[test]
    fn ten_thousand_in_order() {
        let q = RingQueue::with_options(
            128,
            RingOptions {
                auto_resize: true,
                max_capacity: 16_384,
                overflow: None,
            },
        );
        for i in 0..10_000 {
            assert!(q.enqueue(i));
        }
        for i in 0..10_000 {
            assert_eq!(q.dequeue(), Some(i));
        }
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let q = Arc::new(RingQueue::new(4096));
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    assert!(q.enqueue(t * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let drained = AtomicUsize::new(0);
        while q.dequeue().is_some() {
            drained.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(drained.load(Ordering::Relaxed), 4000);
    }
}
