//! Virtual queues.
//!
//! Bounded FIFOs of pending uplink packets. Any thread may push; only the
//! owning service worker pops.

use std::collections::VecDeque;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use thiserror::Error;

use crate::error::DpmaifError;
use crate::types::TxPacket;

/// Rejected enqueue. The packet goes back to the caller.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct EnqueueError {
    pub packet: TxPacket,
    #[source]
    pub error: DpmaifError,
}

impl EnqueueError {
    pub fn new(packet: TxPacket, error: DpmaifError) -> Self {
        Self { packet, error }
    }
}

#[derive(Debug)]
pub struct VirtualQueue {
    id: usize,
    ring: u8,
    depth: usize,
    packets: Mutex<VecDeque<TxPacket>>,
    congested: AtomicBool,
}

impl VirtualQueue {
    pub fn new(id: usize, ring: u8, depth: usize) -> Self {
        Self {
            id,
            ring,
            depth,
            packets: Mutex::new(VecDeque::with_capacity(depth)),
            congested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// DRB ring this queue feeds.
    pub fn ring(&self) -> u8 {
        self.ring
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    /// Append a packet.
    ///
    /// # Errors
    /// Returns the packet when the queue is at depth.
    pub fn push(&self, pkt: TxPacket) -> Result<(), TxPacket> {
        let mut q = self.packets.lock();
        if q.len() >= self.depth {
            return Err(pkt);
        }
        q.push_back(pkt);
        Ok(())
    }

    /// Descriptor slots the head packet needs.
    pub fn head_descriptors(&self) -> Option<u32> {
        self.packets.lock().front().map(|p| p.descriptors_needed())
    }

    pub fn pop(&self) -> Option<TxPacket> {
        self.packets.lock().pop_front()
    }

    /// Put a packet back at the head after a failed fill.
    pub fn requeue(&self, pkt: TxPacket) {
        self.packets.lock().push_front(pkt);
    }

    pub fn is_congested(&self) -> bool {
        self.congested.load(Ordering::Acquire)
    }

    /// Mark congested. Returns whether it was already congested.
    pub fn set_congested(&self) -> bool {
        self.congested.swap(true, Ordering::AcqRel)
    }

    /// Clear congestion once the queue drained to half depth.
    ///
    /// Returns true on the transition.
    pub fn try_uncongest(&self) -> bool {
        if !self.is_congested() || self.len() > self.depth / 2 {
            return false;
        }
        self.congested.swap(false, Ordering::AcqRel)
    }

    /// Remove every queued packet.
    pub fn drain(&self) -> Vec<TxPacket> {
        self.congested.store(false, Ordering::Release);
        self.packets.lock().drain(..).collect()
    }
}
