//! Zero-Copy Buffer Pool
//!
//! Preallocated packet buffers handed out as move-only handles.
//!
//! # Design
//!
//! - Pre-allocated frame arena (no runtime allocation on the hot path)
//! - Lock-free free list of frame indices
//! - One owner per handle; [`PacketBuffer::retain`] bumps a per-frame
//!   reference count for zero-copy duplication
//! - Dropping (or releasing) the last handle returns the frame to the pool
//!
//! Exhaustion is backpressure: [`BufferPool::acquire`] returns `None` and the
//! receive path simply delivers a shorter burst.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::error::{DataplaneError, Result};

/// Buffer size (matches the default mbuf data room)
pub const BUFFER_SIZE: usize = 2048;

/// Headroom reserved in front of the packet data
pub const DEFAULT_HEADROOM: u16 = 128;

/// Mbufs per port in the default pool sizing
pub const NUM_MBUFS: usize = 8191;

/// Per-core mbuf cache in the default pool sizing
pub const MBUF_CACHE_SIZE: usize = 250;

/// Pool capacity for `ports` ports with `descriptors` RX descriptors each,
/// scaled by `cache_factor` to cover buffers parked in TX queues and core
/// caches.
pub fn pool_capacity(descriptors: usize, cache_factor: usize, ports: usize) -> usize {
    descriptors
        .saturating_mul(cache_factor)
        .saturating_mul(ports)
}

struct Frame {
    data_len: u16,
    headroom: u16,
    data: [u8; BUFFER_SIZE],
}

impl Frame {
    fn new() -> Self {
        Self {
            data_len: 0,
            headroom: DEFAULT_HEADROOM,
            data: [0; BUFFER_SIZE],
        }
    }

    #[inline(always)]
    fn reset(&mut self) {
        self.data_len = 0;
        self.headroom = DEFAULT_HEADROOM;
    }
}

struct Slot {
    refcount: AtomicU32,
    frame: UnsafeCell<Frame>,
}

struct PoolInner {
    slots: Box<[Slot]>,
    free: ArrayQueue<u32>,
}

// SAFETY: a frame is written only through a handle holding the sole
// reference (refcount == 1, `&mut PacketBuffer`); shared handles only read.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

/// Buffer pool (pre-allocated, lock-free)
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(DataplaneError::InvalidCapacity {
                what: "buffer pool",
                requested: capacity,
            });
        }

        let slots = (0..capacity)
            .map(|_| Slot {
                refcount: AtomicU32::new(0),
                frame: UnsafeCell::new(Frame::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let free = ArrayQueue::new(capacity);
        for idx in 0..capacity as u32 {
            // Cannot fail: the queue holds exactly `capacity` entries.
            let _ = free.push(idx);
        }

        tracing::debug!(capacity, buffer_size = BUFFER_SIZE, "Buffer pool created");

        Ok(Self {
            inner: Arc::new(PoolInner { slots, free }),
        })
    }

    /// Take a buffer from the pool; `None` when exhausted.
    #[inline]
    pub fn acquire(&self) -> Option<PacketBuffer> {
        let index = self.inner.free.pop()?;
        let slot = &self.inner.slots[index as usize];
        slot.refcount.store(1, Ordering::Release);
        Some(PacketBuffer {
            pool: self.inner.clone(),
            index,
        })
    }

    /// Return a buffer to the pool.
    ///
    /// Equivalent to dropping the handle; spelled out on the hot path so
    /// every disposal is visible at the call site.
    #[inline]
    pub fn release(&self, buf: PacketBuffer) {
        drop(buf);
    }

    /// Buffers currently in the free list
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Buffers currently owned by queues or workers
    pub fn borrowed(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Pool size
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Packet buffer handle (zero-copy, move-only)
pub struct PacketBuffer {
    pool: Arc<PoolInner>,
    index: u32,
}

impl PacketBuffer {
    #[inline(always)]
    fn slot(&self) -> &Slot {
        &self.pool.slots[self.index as usize]
    }

    #[inline(always)]
    fn frame(&self) -> &Frame {
        // SAFETY: shared reads never overlap a write, see `frame_mut`.
        unsafe { &*self.slot().frame.get() }
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> Option<&mut Frame> {
        if !self.is_unique() {
            return None;
        }
        // SAFETY: refcount 1 and `&mut self` mean no other handle exists.
        Some(unsafe { &mut *self.slot().frame.get() })
    }

    /// Get packet data slice
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        let frame = self.frame();
        let start = frame.headroom as usize;
        &frame.data[start..start + frame.data_len as usize]
    }

    /// Mutable packet data; `None` while the buffer is shared.
    #[inline(always)]
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let frame = self.frame_mut()?;
        let start = frame.headroom as usize;
        let end = start + frame.data_len as usize;
        Some(&mut frame.data[start..end])
    }

    /// Get data length
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.frame().data_len as usize
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get tailroom
    #[inline(always)]
    pub fn tailroom(&self) -> usize {
        let frame = self.frame();
        BUFFER_SIZE - frame.headroom as usize - frame.data_len as usize
    }

    /// Append `len` bytes at the tail; `None` if shared or out of room.
    #[inline]
    pub fn append(&mut self, len: usize) -> Option<&mut [u8]> {
        if self.tailroom() < len {
            return None;
        }
        let frame = self.frame_mut()?;
        let start = frame.headroom as usize + frame.data_len as usize;
        frame.data_len += len as u16;
        Some(&mut frame.data[start..start + len])
    }

    /// Replace the packet contents with `bytes`.
    pub fn fill(&mut self, bytes: &[u8]) -> bool {
        let Some(frame) = self.frame_mut() else {
            return false;
        };
        frame.reset();
        match self.append(bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Duplicate the handle without copying (reference count + 1)
    pub fn retain(&self) -> PacketBuffer {
        self.slot().refcount.fetch_add(1, Ordering::Relaxed);
        PacketBuffer {
            pool: self.pool.clone(),
            index: self.index,
        }
    }

    /// Get reference count
    pub fn refcount(&self) -> u32 {
        self.slot().refcount.load(Ordering::Acquire)
    }

    /// True when this handle is the only reference to the frame
    #[inline(always)]
    pub fn is_unique(&self) -> bool {
        self.refcount() == 1
    }

    /// Get index in pool
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let slot = self.slot();
        if slot.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return; // Still referenced
        }

        // SAFETY: last reference; nobody else can reach the frame.
        unsafe { (*slot.frame.get()).reset() };
        // Cannot fail: each index is in the free list at most once.
        let _ = self.pool.free.push(self.index);
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("index", &self.index)
            .field("len", &self.len())
            .field("refcount", &self.refcount())
            .finish()
    }
}
