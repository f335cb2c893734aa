// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Fixed-capacity pool of image buffers.
//!
//! The pool is an arena of slots, each tagged FREE or IN_USE and carrying a
//! generation counter. Acquiring a slot moves its memory out into a
//! [`Buffer`]; releasing moves it back. Because a [`Buffer`] is neither `Clone`
//! nor `Copy`, ownership between stages is a plain move and exactly one stage
//! can touch the memory at a time. The generation is bumped on every release
//! so any handle that outlives its slot is rejected as
//! [`PoolError::InvalidHandle`].

use crate::{error::PoolError, format::FrameLayout};
use core::fmt;
use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tracing::{debug, trace, warn};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Memory region backing a buffer, usually DMA-capable.
pub trait BufferMemory: Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of buffer memory for a [`BufferPool`].
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> io::Result<Box<dyn BufferMemory>>;
}

/// Allocates buffers from the process heap.
///
/// Used where no DMA heap is available, and by the synthetic backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

struct HeapMemory(Box<[u8]>);

impl BufferMemory for HeapMemory {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> io::Result<Box<dyn BufferMemory>> {
        Ok(Box::new(HeapMemory(vec![0u8; size].into_boxed_slice())))
    }
}

/// Identity of a buffer: owning pool, slot and slot generation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferId {
    pool: u32,
    index: u32,
    generation: u32,
}

impl BufferId {
    pub fn pool(&self) -> u32 {
        self.pool
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}#{}", self.pool, self.index, self.generation)
    }
}

/// Where a buffer is in its trip through the pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FillState {
    /// Freshly acquired, contents undefined
    Empty,
    /// Handed to the capture device
    Filling,
    /// Holds a complete frame
    Full,
    /// Owned by the encoder session
    InFlight,
    /// Holds a compressed bitstream
    Encoded,
}

/// Sensor metadata carried with a captured frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame counter reported by the sensor
    pub number: u64,
    /// Capture time reported by the driver
    pub timestamp: Duration,
}

/// Exclusive handle to a pool buffer.
///
/// Dropping a `Buffer` instead of releasing it leaves its slot IN_USE; the
/// pool reports such leaks when it is dropped.
pub struct Buffer {
    id: BufferId,
    state: FillState,
    layout: Option<FrameLayout>,
    bytes_used: usize,
    frame: FrameInfo,
    memory: Box<dyn BufferMemory>,
}

impl Buffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn state(&self) -> FillState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: FillState) {
        trace!(buffer = %self.id, ?state, "buffer state");
        self.state = state;
    }

    /// Image geometry, `None` until a stage writes an image into the buffer.
    pub fn layout(&self) -> Option<FrameLayout> {
        self.layout
    }

    pub(crate) fn set_layout(&mut self, layout: FrameLayout) {
        self.layout = Some(layout);
    }

    pub fn frame(&self) -> FrameInfo {
        self.frame
    }

    pub(crate) fn set_frame(&mut self, frame: FrameInfo) {
        self.frame = frame;
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.bytes_used
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0
    }

    /// Size of the underlying memory region.
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// The valid bytes of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.memory.as_slice()[..self.bytes_used]
    }

    /// The whole memory region, for stages that fill the buffer.
    pub(crate) fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.bytes_used = len.min(self.capacity());
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("layout", &self.layout)
            .field("bytes_used", &self.bytes_used)
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct Slot {
    generation: u32,
    in_use: bool,
    memory: Option<Box<dyn BufferMemory>>,
}

struct Partition {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Fixed set of equally sized buffers shared by every pipeline stage.
///
/// `acquire` never waits: an empty FREE set is reported as
/// [`PoolError::Exhausted`] so the caller can drop the frame instead of
/// stalling the camera. Both operations take one short mutex and are safe to
/// call from the pipeline worker and a control thread at the same time.
pub struct BufferPool {
    id: u32,
    buffer_size: usize,
    partition: Mutex<Partition>,
}

impl BufferPool {
    /// Allocates `capacity` buffers of `buffer_size` bytes each.
    pub fn new(
        allocator: &dyn BufferAllocator,
        capacity: usize,
        buffer_size: usize,
    ) -> io::Result<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid pool capacity {capacity}"),
            ));
        }

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                generation: 0,
                in_use: false,
                memory: Some(allocator.allocate(buffer_size)?),
            });
        }
        // Reversed so buffers are handed out starting from slot 0.
        let free = (0..capacity as u32).rev().collect();
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(pool = id, capacity, buffer_size, "buffer pool allocated");

        Ok(Self {
            id,
            buffer_size,
            partition: Mutex::new(Partition { slots, free }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Partition> {
        self.partition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        let partition = self.lock();
        partition.slots.len() - partition.free.len()
    }

    /// Takes a FREE buffer without blocking.
    pub fn acquire(&self) -> Result<Buffer, PoolError> {
        let mut partition = self.lock();
        let Some(index) = partition.free.pop() else {
            return Err(PoolError::Exhausted {
                capacity: partition.slots.len(),
            });
        };

        let slot = &mut partition.slots[index as usize];
        let Some(memory) = slot.memory.take() else {
            // FREE slots always hold their memory; put the index back.
            partition.free.push(index);
            return Err(PoolError::InvalidHandle(BufferId {
                pool: self.id,
                index,
                generation: partition.slots[index as usize].generation,
            }));
        };
        slot.in_use = true;

        let id = BufferId {
            pool: self.id,
            index,
            generation: slot.generation,
        };
        trace!(buffer = %id, "acquired");

        Ok(Buffer {
            id,
            state: FillState::Empty,
            layout: None,
            bytes_used: 0,
            frame: FrameInfo::default(),
            memory,
        })
    }

    /// Returns a buffer to the FREE set.
    ///
    /// Fails with [`PoolError::InvalidHandle`] if the buffer belongs to
    /// another pool or its slot is not IN_USE under the same generation.
    pub fn release(&self, buffer: Buffer) -> Result<(), PoolError> {
        let Buffer { id, memory, .. } = buffer;
        if id.pool != self.id {
            warn!(buffer = %id, pool = self.id, "release into foreign pool");
            return Err(PoolError::InvalidHandle(id));
        }

        let mut partition = self.lock();
        let Some(slot) = partition.slots.get_mut(id.index as usize) else {
            return Err(PoolError::InvalidHandle(id));
        };
        if !slot.in_use || slot.generation != id.generation {
            warn!(buffer = %id, "release of a buffer that is not in use");
            return Err(PoolError::InvalidHandle(id));
        }

        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.memory = Some(memory);
        partition.free.push(id.index);
        trace!(buffer = %id, "released");
        Ok(())
    }

    /// Releases a buffer, logging instead of failing.
    ///
    /// Used on error paths where the original error is what the caller needs
    /// to see.
    pub(crate) fn recycle(&self, buffer: Buffer) {
        if let Err(e) = self.release(buffer) {
            warn!("failed to recycle buffer: {e}");
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let in_use = self.in_use_count();
        if in_use > 0 {
            warn!(pool = self.id, in_use, "buffer pool dropped with buffers in use");
        } else {
            debug!(pool = self.id, "buffer pool freed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool(capacity: usize) -> BufferPool {
        BufferPool::new(&HeapAllocator, capacity, 64).unwrap()
    }

    #[test]
    fn acquire_until_exhausted() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), FillState::Empty);
        assert_eq!(a.capacity(), 64);
        assert!(matches!(
            pool.acquire(),
            Err(PoolError::Exhausted { capacity: 2 })
        ));

        pool.release(a).unwrap();
        assert_eq!(pool.free_count(), 1);
        let c = pool.acquire().unwrap();
        pool.release(b).unwrap();
        pool.release(c).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn double_release_is_detected() {
        let pool = pool(2);
        let buf = pool.acquire().unwrap();
        let forged = Buffer {
            id: buf.id(),
            state: FillState::Full,
            layout: None,
            bytes_used: 0,
            frame: FrameInfo::default(),
            memory: HeapAllocator.allocate(64).unwrap(),
        };
        pool.release(buf).unwrap();
        assert!(matches!(
            pool.release(forged),
            Err(PoolError::InvalidHandle(_))
        ));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn stale_handle_after_reacquire_is_rejected() {
        let pool = pool(1);
        let first = pool.acquire().unwrap();
        let stale_id = first.id();
        pool.release(first).unwrap();

        let second = pool.acquire().unwrap();
        assert_eq!(second.id().index(), stale_id.index());
        assert_ne!(second.id(), stale_id);

        let stale = Buffer {
            id: stale_id,
            state: FillState::Full,
            layout: None,
            bytes_used: 0,
            frame: FrameInfo::default(),
            memory: HeapAllocator.allocate(64).unwrap(),
        };
        assert!(matches!(
            pool.release(stale),
            Err(PoolError::InvalidHandle(id)) if id == stale_id
        ));
        assert_eq!(pool.in_use_count(), 1);
        pool.release(second).unwrap();
    }

    #[test]
    fn foreign_buffer_is_rejected() {
        let a = pool(1);
        let b = pool(1);
        let buf = a.acquire().unwrap();
        assert!(matches!(b.release(buf), Err(PoolError::InvalidHandle(_))));
        assert_eq!(b.free_count(), 1);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(BufferPool::new(&HeapAllocator, 0, 64).is_err());
    }

    proptest! {
        /// Property: IN_USE never exceeds capacity and every release of a
        /// held buffer succeeds exactly once.
        #[test]
        fn prop_in_use_bounded(
            capacity in 1usize..8,
            ops in prop::collection::vec((any::<bool>(), any::<usize>()), 0..200),
        ) {
            let pool = pool(capacity);
            let mut held: Vec<Buffer> = Vec::new();

            for (acquire, pick) in ops {
                if acquire {
                    match pool.acquire() {
                        Ok(buf) => held.push(buf),
                        Err(PoolError::Exhausted { .. }) => {
                            prop_assert_eq!(held.len(), capacity)
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                } else if !held.is_empty() {
                    let buf = held.swap_remove(pick % held.len());
                    prop_assert!(pool.release(buf).is_ok());
                }
                prop_assert!(pool.in_use_count() <= capacity);
                prop_assert_eq!(pool.in_use_count(), held.len());
            }

            for buf in held {
                prop_assert!(pool.release(buf).is_ok());
            }
            prop_assert_eq!(pool.free_count(), capacity);
        }
    }
}
