//! Register and DMA access capability.
//!
//! The engine never touches registers directly. Everything hardware
//! specific sits behind [`DpmaifHw`], one implementation per hardware
//! generation. [`loopback::LoopbackHw`] models the device in memory for
//! host-side bring-up and tests.

pub mod loopback;

use std::sync::Arc;

use thiserror::Error;

use crate::ring::CoherentRing;
use crate::types::{BusAddr, DmaDirection, IndexSide, RingId};

pub use loopback::LoopbackHw;

/// Hardware access failures. All of them are fatal to the data path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("register access timed out: {0}")]
    RegisterTimeout(&'static str),
    #[error("DMA mapping failed")]
    DmaMapFailed,
    #[error("coherent memory allocation failed for {0}")]
    RingAllocFailed(RingId),
    #[error("ring {0} is not configured")]
    UnknownRing(RingId),
}

/// Capability set the engine consumes.
///
/// Implementations must be callable from several tasks at once: the
/// downlink poll context, uplink service workers and the doorbell task all
/// share one instance.
pub trait DpmaifHw: Send + Sync {
    /// Allocate coherent memory for a ring and program its base address.
    fn alloc_ring(
        &self,
        ring: RingId,
        entries: u32,
        entry_words: usize,
    ) -> Result<Arc<CoherentRing>, HwError>;

    /// Release a ring allocated with [`alloc_ring`](Self::alloc_ring).
    fn free_ring(&self, ring: RingId);

    /// Map host memory for device access.
    ///
    /// # Safety
    /// - `cpu` must point to `len` bytes that stay allocated and are not
    ///   moved until the matching [`unmap`](Self::unmap)
    /// - for `FromDevice` the host must not read the memory before unmap
    unsafe fn map(&self, cpu: *mut u8, len: usize, dir: DmaDirection)
        -> Result<BusAddr, HwError>;

    /// Tear down a mapping created by [`map`](Self::map).
    fn unmap(&self, addr: BusAddr, len: usize, dir: DmaDirection);

    /// Read the hardware's view of a ring cursor.
    fn ring_index(&self, ring: RingId, side: IndexSide) -> Result<u32, HwError>;

    /// Announce `count` new (BAT, DRB) or released (PIT) entries.
    fn doorbell(&self, ring: RingId, count: u32) -> Result<(), HwError>;

    /// Enable uplink and downlink queues.
    fn start_queues(&self) -> Result<(), HwError>;

    /// Disable queues and wait for the device to go idle.
    fn stop_queues(&self) -> Result<(), HwError>;

    /// Reset all hardware ring cursors to zero.
    fn reset_rings(&self) -> Result<(), HwError>;

    /// Acknowledge handled interrupt sources.
    fn ack_interrupts(&self, _bits: u32) {}
}
