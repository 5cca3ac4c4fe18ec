//! Shared data types.
//!
//! Ring identifiers used to key hardware index queries and doorbells,
//! plus the packet types exchanged with the network stack.

pub mod packet;

pub use packet::{ChecksumOffload, RxPacket, TxPacket};

/// Device-visible bus address.
pub type BusAddr = u64;

/// The four ring kinds of the data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RingKind {
    /// Buffer address table (normal receive buffers).
    Bat,
    /// Fragment buffer address table.
    Frag,
    /// Packet information table (downlink completions).
    Pit,
    /// Descriptor ring buffer (uplink).
    Drb,
}

impl RingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RingKind::Bat => "bat",
            RingKind::Frag => "frg",
            RingKind::Pit => "pit",
            RingKind::Drb => "drb",
        }
    }
}

/// A ring instance: kind plus owning queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingId {
    pub kind: RingKind,
    pub queue: u8,
}

impl RingId {
    pub const fn bat(queue: u8) -> Self {
        Self { kind: RingKind::Bat, queue }
    }

    pub const fn frag(queue: u8) -> Self {
        Self { kind: RingKind::Frag, queue }
    }

    pub const fn pit(queue: u8) -> Self {
        Self { kind: RingKind::Pit, queue }
    }

    pub const fn drb(queue: u8) -> Self {
        Self { kind: RingKind::Drb, queue }
    }
}

impl core::fmt::Display for RingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.kind.as_str(), self.queue)
    }
}

/// Which hardware cursor of a ring to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexSide {
    Read,
    Write,
}

/// DMA transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Host to device (uplink payload).
    ToDevice,
    /// Device to host (receive buffers).
    FromDevice,
}
