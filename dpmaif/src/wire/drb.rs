//! DRB entry: one uplink descriptor written by the host.
//!
//! # Layout
//! ```text
//! word0  [0..2) dtype (1 = payload, 2 = message)  [2] cont  [16..32) length
//! word1  message: [0..16) count_l [16..24) channel [24] ip csum [25] l4 csum
//!        payload: bus address low
//! word2  payload: bus address high
//! word3  reserved
//! ```
//!
//! A packet is one message descriptor followed by its payload descriptors;
//! `cont` is set on every descriptor except the packet's last payload.

use static_assertions::const_assert_eq;

use super::{join_addr, split_addr, Field};
use crate::types::{BusAddr, ChecksumOffload};

/// Words per DRB entry.
pub const DRB_ENTRY_WORDS: usize = 4;

const_assert_eq!(core::mem::size_of::<[u32; DRB_ENTRY_WORDS]>(), 16);

const DTYPE: Field = Field::new(0, 2);
const CONT: Field = Field::new(2, 1);
const LENGTH: Field = Field::new(16, 16);
const MSG_COUNT_L: Field = Field::new(0, 16);
const MSG_CHANNEL_ID: Field = Field::new(16, 8);
const MSG_IP_CSUM: Field = Field::new(24, 1);
const MSG_L4_CSUM: Field = Field::new(25, 1);

const DTYPE_PAYLOAD: u32 = 1;
const DTYPE_MESSAGE: u32 = 2;

/// Largest packet or segment length a descriptor can carry.
pub const MAX_DRB_LEN: usize = LENGTH.max() as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrbMessage {
    pub cont: bool,
    pub packet_len: u16,
    pub count_l: u16,
    pub channel_id: u8,
    pub offload: ChecksumOffload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrbPayload {
    pub cont: bool,
    pub data_len: u16,
    pub data_addr: BusAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrbEntry {
    Message(DrbMessage),
    Payload(DrbPayload),
    /// Unknown descriptor type; never produced by the host.
    Invalid(u32),
}

impl DrbEntry {
    pub fn is_last(&self) -> bool {
        match self {
            DrbEntry::Message(m) => !m.cont,
            DrbEntry::Payload(p) => !p.cont,
            DrbEntry::Invalid(_) => true,
        }
    }

    pub fn encode(&self) -> [u32; DRB_ENTRY_WORDS] {
        match self {
            DrbEntry::Message(m) => {
                let mut w0 = DTYPE.put(0, DTYPE_MESSAGE);
                w0 = CONT.put(w0, m.cont as u32);
                w0 = LENGTH.put(w0, m.packet_len as u32);
                let mut w1 = MSG_COUNT_L.put(0, m.count_l as u32);
                w1 = MSG_CHANNEL_ID.put(w1, m.channel_id as u32);
                w1 = MSG_IP_CSUM.put(w1, m.offload.contains(ChecksumOffload::IP) as u32);
                w1 = MSG_L4_CSUM.put(w1, m.offload.contains(ChecksumOffload::L4) as u32);
                [w0, w1, 0, 0]
            }
            DrbEntry::Payload(p) => {
                let mut w0 = DTYPE.put(0, DTYPE_PAYLOAD);
                w0 = CONT.put(w0, p.cont as u32);
                w0 = LENGTH.put(w0, p.data_len as u32);
                let (lo, hi) = split_addr(p.data_addr);
                [w0, lo, hi, 0]
            }
            DrbEntry::Invalid(w0) => [*w0, 0, 0, 0],
        }
    }

    pub fn decode(words: [u32; DRB_ENTRY_WORDS]) -> Self {
        let w0 = words[0];
        match DTYPE.get(w0) {
            DTYPE_MESSAGE => {
                let mut offload = ChecksumOffload::empty();
                offload.set(ChecksumOffload::IP, MSG_IP_CSUM.flag(words[1]));
                offload.set(ChecksumOffload::L4, MSG_L4_CSUM.flag(words[1]));
                DrbEntry::Message(DrbMessage {
                    cont: CONT.flag(w0),
                    packet_len: LENGTH.get(w0) as u16,
                    count_l: MSG_COUNT_L.get(words[1]) as u16,
                    channel_id: MSG_CHANNEL_ID.get(words[1]) as u8,
                    offload,
                })
            }
            DTYPE_PAYLOAD => DrbEntry::Payload(DrbPayload {
                cont: CONT.flag(w0),
                data_len: LENGTH.get(w0) as u16,
                data_addr: join_addr(words[1], words[2]),
            }),
            _ => DrbEntry::Invalid(w0),
        }
    }
}
