//! Packets exchanged with the network stack.

use bitflags::bitflags;

bitflags! {
    /// Checksum work requested from the modem on uplink.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChecksumOffload: u8 {
        const IP = 0b01;
        const L4 = 0b10;
    }
}

/// A fully reassembled downlink packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Downlink queue it arrived on.
    pub queue: u8,
    /// Modem channel (PDN session) id.
    pub channel_id: u8,
    /// Packet bytes, all segments concatenated in ring order.
    pub data: Vec<u8>,
    /// Number of payload entries folded into `data`.
    pub segments: u16,
    /// Hardware verified the IP and L4 checksums.
    pub checksum_valid: bool,
    /// Flow hash computed by the modem.
    pub hash: u32,
    /// Number of extra packets coalesced into this one.
    pub coalesced: u16,
}

impl RxPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An uplink packet as a scatter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPacket {
    /// Modem channel (PDN session) id.
    pub channel_id: u8,
    /// Scatter list; each fragment becomes one payload descriptor.
    pub frags: Vec<Vec<u8>>,
    /// Offload request carried in the message descriptor.
    pub offload: ChecksumOffload,
}

impl TxPacket {
    /// Single-fragment packet.
    pub fn new(channel_id: u8, data: Vec<u8>) -> Self {
        Self {
            channel_id,
            frags: vec![data],
            offload: ChecksumOffload::empty(),
        }
    }

    /// Packet built from a scatter list.
    pub fn from_frags(channel_id: u8, frags: Vec<Vec<u8>>) -> Self {
        Self {
            channel_id,
            frags,
            offload: ChecksumOffload::empty(),
        }
    }

    pub fn with_offload(mut self, offload: ChecksumOffload) -> Self {
        self.offload = offload;
        self
    }

    /// Total byte length.
    pub fn len(&self) -> usize {
        self.frags.iter().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptor slots needed: one message plus one per fragment.
    pub fn descriptors_needed(&self) -> u32 {
        self.frags.len() as u32 + 1
    }
}
