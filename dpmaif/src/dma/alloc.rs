//! Receive buffer allocators.
//!
//! Allocation failure is an expected event under memory pressure, so the
//! allocators return `None` instead of aborting.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Source of receive buffer memory.
pub trait BufferAllocator: Send + Sync {
    /// Allocate a zeroed buffer of exactly `size` bytes.
    fn alloc(&self, size: usize) -> Option<Vec<u8>>;
}

/// Global heap, fallible.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some(buf)
    }
}

/// Heap allocator with a fixed allocation budget.
///
/// Hands out at most `limit` buffers over its lifetime, then fails. Used to
/// cap the memory one device may pin and to model memory pressure.
#[derive(Debug)]
pub struct CappedAllocator {
    remaining: AtomicUsize,
}

impl CappedAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Grant `n` more allocations.
    pub fn grant(&self, n: usize) {
        self.remaining.fetch_add(n, Ordering::AcqRel);
    }
}

impl BufferAllocator for CappedAllocator {
    fn alloc(&self, size: usize) -> Option<Vec<u8>> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        HeapAllocator.alloc(size)
    }
}
