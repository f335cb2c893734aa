// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::buffer::{BufferAllocator, BufferMemory};
use dma_heap::{Heap, HeapKind};
use libc::{mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::{
    ffi::c_void,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::null_mut,
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{trace, warn};

/// Which DMA heap to allocate from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmaHeap {
    /// Physically contiguous memory, required by most camera and codec IP
    Cma,
    /// Scatter-gather system memory
    System,
}

/// Allocates pool buffers from a Linux DMA heap.
///
/// Each buffer is a dmabuf file descriptor mapped once into the process, so
/// stages hand the same physical pages from the camera to the encoder without
/// copying.
///
/// # Example
///
/// ```no_run
/// use edgefirst_capture::{buffer::BufferPool, dma::{DmaHeap, DmaHeapAllocator}};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let allocator = DmaHeapAllocator::new(DmaHeap::Cma)?;
/// let pool = BufferPool::new(&allocator, 4, 1920 * 1080 * 2)?;
/// assert_eq!(pool.free_count(), 4);
/// # Ok(())
/// # }
/// ```
pub struct DmaHeapAllocator {
    heap: Heap,
}

impl DmaHeapAllocator {
    /// Opens the DMA heap device.
    ///
    /// # Errors
    ///
    /// Returns an error if the heap device (`/dev/dma_heap/linux,cma` or
    /// `/dev/dma_heap/system`) does not exist or cannot be opened.
    pub fn new(kind: DmaHeap) -> io::Result<Self> {
        let kind = match kind {
            DmaHeap::Cma => HeapKind::Cma,
            DmaHeap::System => HeapKind::System,
        };
        let heap = Heap::new(kind).map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Self { heap })
    }
}

impl BufferAllocator for DmaHeapAllocator {
    fn allocate(&self, size: usize) -> io::Result<Box<dyn BufferMemory>> {
        let fd = self
            .heap
            .allocate(size)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Box::new(DmaMemory::map(fd, size)?))
    }
}

/// DMA buffer mapped into the process address space.
///
/// The mapping lives as long as the buffer and is unmapped on drop.
pub struct DmaMemory {
    fd: OwnedFd,
    mmap: *mut u8,
    len: usize,
}

// The mapping is exclusively owned; pool ownership rules prevent concurrent
// access from two stages.
unsafe impl Send for DmaMemory {}

impl DmaMemory {
    /// Maps `len` bytes of the dmabuf `fd` read/write.
    pub fn map(fd: OwnedFd, len: usize) -> io::Result<Self> {
        let mmap = unsafe {
            mmap(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if mmap == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        trace!(fd = fd.as_raw_fd(), len, "DMA buffer mapped");
        Ok(Self {
            fd,
            mmap: mmap.cast::<u8>(),
            len,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl BufferMemory for DmaMemory {
    fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.mmap, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.mmap, self.len) }
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        if unsafe { munmap(self.mmap.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        }
    }
}
