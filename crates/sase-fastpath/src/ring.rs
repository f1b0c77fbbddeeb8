//! Lock-free SPSC Ring
//!
//! Bounded single-producer/single-consumer queue for handing packet buffers
//! between pinned cores.
//!
//! # Design
//!
//! - One slot is always kept empty: storage of size S holds S-1 items
//! - `tail` is written only by the producer, `head` only by the consumer
//! - Producer writes the slot, then publishes `tail` with Release;
//!   consumer loads `tail` with Acquire before reading the slot
//!   (symmetrically for `head`)
//! - Never blocks: a full push hands the item back, an empty pop fails
//!
//! The single-producer/single-consumer contract is carried by the types:
//! [`RingBuffer::new`] returns one [`Producer`] and one [`Consumer`], neither
//! of which is `Clone`, and both mutate through `&mut self`.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::error::{DataplaneError, Result};

/// Shared ring storage
pub struct RingBuffer<T> {
    /// Next slot to read (consumer-written)
    head: CachePadded<AtomicUsize>,
    /// Next slot to write (producer-written)
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is only touched by the producer before it publishes `tail`
// past it, and only by the consumer after it observed that publication.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Allocate a ring with `capacity` slots (`capacity - 1` usable).
    ///
    /// Fails for capacities below 2, which could never hold an item.
    pub fn new(capacity: usize) -> Result<(Producer<T>, Consumer<T>)> {
        if capacity < 2 {
            return Err(DataplaneError::InvalidCapacity {
                what: "ring buffer",
                requested: capacity,
            });
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let ring = Arc::new(Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
        });

        Ok((
            Producer { ring: ring.clone() },
            Consumer { ring },
        ))
    }

    #[inline(always)]
    fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    fn next(&self, idx: usize) -> usize {
        let n = idx + 1;
        if n == self.size() { 0 } else { n }
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.size() - head) % self.size()
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // Both handles are gone; whatever is still queued is dropped here.
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            // SAFETY: slots in [head, tail) were written and never read.
            unsafe { self.slots[head].get_mut().assume_init_drop() };
            head = self.next(head);
        }
    }
}

/// Push rejected because the ring is full; carries the item back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ring buffer is full")
    }
}

impl<T> std::error::Error for Full<T> {}

/// Pop failed because the ring is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ring buffer is empty")]
pub struct Empty;

/// Producer half (exactly one per ring)
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Producer<T> {
    /// Push an item, or hand it back if the ring is full.
    #[inline]
    pub fn push(&mut self, item: T) -> std::result::Result<(), Full<T>> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let next = self.ring.next(tail);
        if next == self.ring.head.load(Ordering::Acquire) {
            return Err(Full(item));
        }

        // SAFETY: `tail` is not visible to the consumer until the store below.
        unsafe { (*self.ring.slots[tail].get()).write(item) };
        self.ring.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable capacity (storage size minus the reserved slot)
    pub fn capacity(&self) -> usize {
        self.ring.size() - 1
    }

    /// Check if full
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

/// Consumer half (exactly one per ring)
pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Consumer<T> {
    /// Pop the oldest item.
    #[inline]
    pub fn pop(&mut self) -> std::result::Result<T, Empty> {
        let head = self.ring.head.load(Ordering::Relaxed);
        if head == self.ring.tail.load(Ordering::Acquire) {
            return Err(Empty);
        }

        // SAFETY: the Acquire load of `tail` made the producer's write visible,
        // and the producer will not reuse the slot until `head` moves past it.
        let item = unsafe { (*self.ring.slots[head].get()).assume_init_read() };
        self.ring.head.store(self.ring.next(head), Ordering::Release);
        Ok(item)
    }

    /// Pop up to `max` items into `out`, returning how many were moved.
    pub fn pop_burst(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.pop() {
                Ok(item) => out.push(item),
                Err(Empty) => break,
            }
            n += 1;
        }
        n
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable capacity (storage size minus the reserved slot)
    pub fn capacity(&self) -> usize {
        self.ring.size() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_full_after_capacity_minus_one() {
        let (mut tx, mut rx) = RingBuffer::new(8).unwrap();
        assert_eq!(tx.capacity(), 7);

        for i in 0..7 {
            tx.push(i).unwrap();
        }
        assert!(tx.is_full());
        assert_eq!(tx.push(7).unwrap_err().into_inner(), 7);

        // Wrap-around
        assert_eq!(rx.pop(), Ok(0));
        tx.push(7).unwrap();
        assert_eq!(rx.len(), 7);
    }

    #[test]
    fn test_empty() {
        let (mut tx, mut rx) = RingBuffer::<u32>::new(4).unwrap();
        assert_eq!(rx.pop(), Err(Empty));
        tx.push(1).unwrap();
        assert_eq!(rx.pop(), Ok(1));
        assert_eq!(rx.pop(), Err(Empty));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_many_wraps() {
        let (mut tx, mut rx) = RingBuffer::new(3).unwrap();
        for i in 0..1000u32 {
            tx.push(i).unwrap();
            tx.push(i + 1).unwrap();
            assert!(tx.push(0).is_err());
            assert_eq!(rx.pop(), Ok(i));
            assert_eq!(rx.pop(), Ok(i + 1));
        }
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            RingBuffer::<u8>::new(1),
            Err(DataplaneError::InvalidCapacity { requested: 1, .. })
        ));
        assert!(RingBuffer::<u8>::new(0).is_err());
    }

    #[test]
    fn test_pop_burst() {
        let (mut tx, mut rx) = RingBuffer::new(16).unwrap();
        for i in 0..10 {
            tx.push(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.pop_burst(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(rx.pop_burst(&mut out, 32), 6);
        assert_eq!(out.len(), 10);
        assert_eq!(rx.pop_burst(&mut out, 32), 0);
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_queued_items_dropped_with_ring() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, mut rx) = RingBuffer::new(8).unwrap();
        for _ in 0..5 {
            assert!(tx.push(Tracked(drops.clone())).is_ok());
        }
        drop(rx.pop().unwrap());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(tx);
        drop(rx);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_concurrent_spsc_order() {
        const COUNT: u64 = 200_000;
        let (mut tx, mut rx) = RingBuffer::new(64).unwrap();

        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let mut item = i;
                loop {
                    match tx.push(item) {
                        Ok(()) => break,
                        Err(Full(back)) => {
                            item = back;
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match rx.pop() {
                Ok(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                Err(Empty) => std::hint::spin_loop(),
            }
        }

        producer.join().unwrap();
        assert_eq!(rx.pop(), Err(Empty));
    }

    proptest! {
        #[test]
        fn prop_matches_fifo_model(ops in proptest::collection::vec(any::<Option<u16>>(), 0..512), size in 2usize..32) {
            let (mut tx, mut rx) = RingBuffer::new(size).unwrap();
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Some(v) => {
                        let pushed = tx.push(v).is_ok();
                        prop_assert_eq!(pushed, model.len() < size - 1);
                        if pushed {
                            model.push_back(v);
                        }
                    }
                    None => {
                        prop_assert_eq!(rx.pop().ok(), model.pop_front());
                    }
                }
                prop_assert_eq!(rx.len(), model.len());
            }
        }
    }
}
