//! DMA buffer management module.
//!
//! Provides ownership-tracked DMA buffers and the allocators that back
//! receive buffer pools.

pub mod alloc;
pub mod buffer;
pub mod ownership;

pub use self::alloc::{BufferAllocator, CappedAllocator, HeapAllocator};
pub use buffer::DmaBuffer;
pub use ownership::BufferOwnership;
