//! PIT entry: one downlink completion written by the device.
//!
//! # Layout
//! ```text
//! word0  [0] packet type (1 = message)   [1] cont   [2] buffer type (1 = frag)
//!        payload: [3..16) bid low   [16..32) data length
//!        message: [16..24) channel  [31] drop
//! word1  payload: bus address low   message: [0..2) checksum [2..4) net type
//! word2  payload: bus address high  message: flow hash
//! word3  [0..16) sequence (mod 251)
//!        payload: [16..19) bid high [19..24) header offset
//! ```
//!
//! The buffer id is split 13 low bits / 3 high bits so pools of up to
//! 65536 buffers can be addressed.

use static_assertions::const_assert_eq;

use super::{join_addr, split_addr, Field};
use crate::types::BusAddr;

/// Words per PIT entry.
pub const PIT_ENTRY_WORDS: usize = 4;

const_assert_eq!(core::mem::size_of::<[u32; PIT_ENTRY_WORDS]>(), 16);

/// PIT sequence numbers run modulo this value. Fixed by firmware.
pub const PIT_SEQ_MODULUS: u16 = 251;

/// Checksum field value meaning both IP and L4 checksums verified.
pub const CHECKSUM_VERIFIED: u8 = 0b11;

const PACKET_TYPE: Field = Field::new(0, 1);
const CONT: Field = Field::new(1, 1);
const BUFFER_TYPE: Field = Field::new(2, 1);
const PD_BID_LOW: Field = Field::new(3, 13);
const PD_DATA_LEN: Field = Field::new(16, 16);
const MSG_CHANNEL_ID: Field = Field::new(16, 8);
const MSG_DROP: Field = Field::new(31, 1);
const MSG_CHECKSUM: Field = Field::new(0, 2);
const MSG_NET_TYPE: Field = Field::new(2, 2);
const SEQ: Field = Field::new(0, 16);
const PD_BID_HIGH: Field = Field::new(16, 3);
const PD_HEADER_OFFSET: Field = Field::new(19, 5);

const BID_LOW_BITS: u32 = 13;

/// Largest buffer id representable in the split field.
pub const MAX_BUFFER_ID: u32 = (PD_BID_HIGH.max() << BID_LOW_BITS) | PD_BID_LOW.max();

/// Per-packet metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PitMessage {
    pub cont: bool,
    pub channel_id: u8,
    pub drop: bool,
    pub checksum: u8,
    pub net_type: u8,
    pub hash: u32,
    pub seq: u16,
}

impl PitMessage {
    pub fn checksum_valid(&self) -> bool {
        self.checksum == CHECKSUM_VERIFIED
    }
}

/// Payload record pointing into a buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PitPayload {
    /// More entries follow for the same packet.
    pub cont: bool,
    /// Buffer comes from the fragment pool.
    pub frag: bool,
    pub buffer_id: u16,
    pub data_len: u16,
    pub data_addr: BusAddr,
    pub header_offset: u8,
    pub seq: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitEntry {
    Message(PitMessage),
    Payload(PitPayload),
}

impl PitEntry {
    /// Sequence number without a full decode.
    #[inline]
    pub fn seq_of(words: &[u32; PIT_ENTRY_WORDS]) -> u16 {
        SEQ.get(words[3]) as u16
    }

    pub fn seq(&self) -> u16 {
        match self {
            PitEntry::Message(m) => m.seq,
            PitEntry::Payload(p) => p.seq,
        }
    }

    pub fn decode(words: [u32; PIT_ENTRY_WORDS]) -> Self {
        let w0 = words[0];
        if PACKET_TYPE.flag(w0) {
            PitEntry::Message(PitMessage {
                cont: CONT.flag(w0),
                channel_id: MSG_CHANNEL_ID.get(w0) as u8,
                drop: MSG_DROP.flag(w0),
                checksum: MSG_CHECKSUM.get(words[1]) as u8,
                net_type: MSG_NET_TYPE.get(words[1]) as u8,
                hash: words[2],
                seq: SEQ.get(words[3]) as u16,
            })
        } else {
            let bid = (PD_BID_HIGH.get(words[3]) << BID_LOW_BITS) | PD_BID_LOW.get(w0);
            PitEntry::Payload(PitPayload {
                cont: CONT.flag(w0),
                frag: BUFFER_TYPE.flag(w0),
                buffer_id: bid as u16,
                data_len: PD_DATA_LEN.get(w0) as u16,
                data_addr: join_addr(words[1], words[2]),
                header_offset: PD_HEADER_OFFSET.get(words[3]) as u8,
                seq: SEQ.get(words[3]) as u16,
            })
        }
    }

    pub fn encode(&self) -> [u32; PIT_ENTRY_WORDS] {
        match self {
            PitEntry::Message(m) => {
                let mut w0 = PACKET_TYPE.put(0, 1);
                w0 = CONT.put(w0, m.cont as u32);
                w0 = MSG_CHANNEL_ID.put(w0, m.channel_id as u32);
                w0 = MSG_DROP.put(w0, m.drop as u32);
                let mut w1 = MSG_CHECKSUM.put(0, m.checksum as u32);
                w1 = MSG_NET_TYPE.put(w1, m.net_type as u32);
                [w0, w1, m.hash, SEQ.put(0, m.seq as u32)]
            }
            PitEntry::Payload(p) => {
                let bid = p.buffer_id as u32;
                let mut w0 = PACKET_TYPE.put(0, 0);
                w0 = CONT.put(w0, p.cont as u32);
                w0 = BUFFER_TYPE.put(w0, p.frag as u32);
                w0 = PD_BID_LOW.put(w0, bid);
                w0 = PD_DATA_LEN.put(w0, p.data_len as u32);
                let (lo, hi) = split_addr(p.data_addr);
                let mut w3 = SEQ.put(0, p.seq as u32);
                w3 = PD_BID_HIGH.put(w3, bid >> BID_LOW_BITS);
                w3 = PD_HEADER_OFFSET.put(w3, p.header_offset as u32);
                [w0, lo, hi, w3]
            }
        }
    }
}

/// Next expected sequence number.
#[inline]
pub const fn next_seq(seq: u16) -> u16 {
    (seq + 1) % PIT_SEQ_MODULUS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_bit_layout() {
        let pd = PitEntry::Payload(PitPayload {
            cont: true,
            frag: false,
            buffer_id: 0x1abc,
            data_len: 1500,
            data_addr: 0x1_2000_0000,
            header_offset: 0,
            seq: 250,
        });
        let w = pd.encode();
        assert_eq!(w[0] & 0b111, 0b010);
        assert_eq!(w[0] >> 16, 1500);
        assert_eq!((w[0] >> 3) & 0x1fff, 0x1abc);
        assert_eq!(w[1], 0x2000_0000);
        assert_eq!(w[2], 0x1);
        assert_eq!(w[3] & 0xffff, 250);
        assert_eq!(PitEntry::decode(w), pd);
    }

    #[test]
    fn test_buffer_id_high_split() {
        // ids above the 13-bit low field spill into word3
        let pd = PitEntry::Payload(PitPayload {
            buffer_id: 0xe001,
            data_len: 64,
            ..Default::default()
        });
        let w = pd.encode();
        assert_eq!((w[0] >> 3) & 0x1fff, 0x0001);
        assert_eq!((w[3] >> 16) & 0b111, 0b111);
        assert_eq!(PitEntry::decode(w), pd);
        assert_eq!(MAX_BUFFER_ID, 0xffff);
    }

    #[test]
    fn test_message_layout() {
        let msg = PitEntry::Message(PitMessage {
            cont: true,
            channel_id: 7,
            drop: true,
            checksum: CHECKSUM_VERIFIED,
            net_type: 1,
            hash: 0xdead_beef,
            seq: 17,
        });
        let w = msg.encode();
        assert_eq!(w[0] & 1, 1);
        assert_eq!((w[0] >> 16) & 0xff, 7);
        assert_eq!(w[0] >> 31, 1);
        assert_eq!(w[2], 0xdead_beef);
        assert_eq!(PitEntry::seq_of(&w), 17);
        assert_eq!(PitEntry::decode(w), msg);
    }

    #[test]
    fn test_seq_wraps_at_251() {
        assert_eq!(next_seq(249), 250);
        assert_eq!(next_seq(250), 0);
    }
}
