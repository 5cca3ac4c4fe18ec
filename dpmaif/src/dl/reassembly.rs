//! Per-queue packet reassembly.
//!
//! # State Machine
//! ```text
//!             message                  payload/frag (cont)
//!   IDLE ─────────────────> IN_MESSAGE ◄──────────────┐
//!    ▲                          │  └──────────────────┘
//!    │                          │ payload/frag (last)
//!    │                          ▼
//!    └──────── finalize ─── COMPLETE
//! ```
//!
//! A payload or fragment seen in `IDLE` has no metadata to attach to. It
//! is discarded together with every following entry up to the next last
//! flag. A message seen in `IN_MESSAGE` is a protocol violation; the
//! collected data is dropped and the error surfaces as fatal.

use crate::error::{DpmaifError, Result};
use crate::types::RxPacket;
use crate::wire::pit::PitMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    InMessage,
    Complete,
}

/// Result of feeding one entry.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// More entries needed.
    Pending,
    /// A packet is ready for handoff.
    Packet(RxPacket),
    /// Hardware set the drop bit; the packet was discarded.
    Dropped { bytes: usize },
    /// The packet was malformed and discarded.
    Discarded,
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    channel_id: u8,
    checksum_valid: bool,
    hash: u32,
    drop: bool,
}

/// Reassembly record of one downlink queue.
#[derive(Debug)]
pub struct Reassembly {
    queue: u8,
    phase: Phase,
    meta: Option<Meta>,
    data: Vec<u8>,
    segments: u16,
    /// Discard entries until the next last flag.
    error: bool,
}

impl Reassembly {
    pub fn new(queue: u8) -> Self {
        Self {
            queue,
            phase: Phase::Idle,
            meta: None,
            data: Vec::new(),
            segments: 0,
            error: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle && !self.error
    }

    /// Consume a message entry.
    pub fn on_message(&mut self, msg: &PitMessage) -> Result<()> {
        if self.phase == Phase::InMessage {
            log::error!(
                target: "dpmaif::dl",
                "q{}: message entry inside open packet ({} bytes, {} segments collected)",
                self.queue, self.data.len(), self.segments
            );
            self.reset();
            return Err(DpmaifError::UnexpectedMessage { queue: self.queue });
        }
        if self.error {
            log::debug!(target: "dpmaif::dl", "q{}: message ends discard run", self.queue);
        }
        self.reset();
        self.meta = Some(Meta {
            channel_id: msg.channel_id,
            checksum_valid: msg.checksum_valid(),
            hash: msg.hash,
            drop: msg.drop,
        });
        self.phase = Phase::InMessage;
        Ok(())
    }

    /// Consume a normal-buffer payload. `bytes` becomes a new segment.
    pub fn on_payload(&mut self, bytes: Vec<u8>, last: bool) -> Outcome {
        if !self.accepting() {
            return self.discard(last);
        }
        if self.data.is_empty() {
            self.data = bytes;
        } else {
            self.data.extend_from_slice(&bytes);
        }
        self.segments += 1;
        self.finish_if(last)
    }

    /// Consume a fragment-buffer payload. `bytes` extends the last segment.
    pub fn on_fragment(&mut self, bytes: &[u8], last: bool) -> Outcome {
        if !self.accepting() {
            return self.discard(last);
        }
        self.data.extend_from_slice(bytes);
        if self.segments == 0 {
            self.segments = 1;
        }
        self.finish_if(last)
    }

    /// Mark the open packet malformed. Its remaining entries are discarded.
    pub fn poison(&mut self, last: bool) -> Outcome {
        self.error = true;
        self.phase = Phase::Idle;
        self.discard(last)
    }

    /// Drop any partial packet.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.meta = None;
        self.data = Vec::new();
        self.segments = 0;
        self.error = false;
    }

    fn accepting(&self) -> bool {
        self.phase == Phase::InMessage && !self.error
    }

    fn discard(&mut self, last: bool) -> Outcome {
        if !self.error {
            log::warn!(target: "dpmaif::dl", "q{}: payload entry without message", self.queue);
            self.error = true;
        }
        if last {
            self.reset();
            Outcome::Discarded
        } else {
            Outcome::Pending
        }
    }

    fn finish_if(&mut self, last: bool) -> Outcome {
        if !last {
            return Outcome::Pending;
        }
        self.phase = Phase::Complete;
        let outcome = match self.meta {
            Some(meta) if meta.drop => Outcome::Dropped {
                bytes: self.data.len(),
            },
            Some(meta) => Outcome::Packet(RxPacket {
                queue: self.queue,
                channel_id: meta.channel_id,
                data: core::mem::take(&mut self.data),
                segments: self.segments,
                checksum_valid: meta.checksum_valid,
                hash: meta.hash,
                coalesced: 0,
            }),
            None => Outcome::Discarded,
        };
        self.reset();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::pit::CHECKSUM_VERIFIED;

    fn msg(channel_id: u8) -> PitMessage {
        PitMessage {
            cont: true,
            channel_id,
            drop: false,
            checksum: CHECKSUM_VERIFIED,
            net_type: 0,
            hash: 0xfeed,
            seq: 0,
        }
    }

    #[test]
    fn test_two_payloads_concatenate() {
        let mut r = Reassembly::new(0);
        r.on_message(&msg(3)).unwrap();
        assert_eq!(r.phase(), Phase::InMessage);
        assert_eq!(r.on_payload(vec![1, 2, 3], false), Outcome::Pending);
        let out = r.on_payload(vec![4, 5], true);
        let Outcome::Packet(pkt) = out else {
            panic!("expected packet, got {:?}", out);
        };
        assert_eq!(pkt.data, vec![1, 2, 3, 4, 5]);
        assert_eq!(pkt.segments, 2);
        assert_eq!(pkt.channel_id, 3);
        assert_eq!(pkt.hash, 0xfeed);
        assert!(pkt.checksum_valid);
        assert!(r.is_idle());
    }

    #[test]
    fn test_fragment_extends_last_segment() {
        let mut r = Reassembly::new(1);
        r.on_message(&msg(0)).unwrap();
        r.on_payload(vec![0xaa; 4], false);
        let Outcome::Packet(pkt) = r.on_fragment(&[0xbb; 2], true) else {
            panic!("expected packet");
        };
        assert_eq!(pkt.data, vec![0xaa, 0xaa, 0xaa, 0xaa, 0xbb, 0xbb]);
        assert_eq!(pkt.segments, 1);
        assert_eq!(pkt.queue, 1);
    }

    #[test]
    fn test_drop_bit_discards() {
        let mut r = Reassembly::new(0);
        r.on_message(&PitMessage { drop: true, ..msg(0) }).unwrap();
        assert_eq!(r.on_payload(vec![0; 100], true), Outcome::Dropped { bytes: 100 });
        assert!(r.is_idle());
    }

    #[test]
    fn test_message_inside_packet_is_fatal() {
        let mut r = Reassembly::new(2);
        r.on_message(&msg(0)).unwrap();
        r.on_payload(vec![1], false);
        let err = r.on_message(&msg(0)).unwrap_err();
        assert_eq!(err, DpmaifError::UnexpectedMessage { queue: 2 });
        assert!(err.is_fatal());
        assert!(r.is_idle());
    }

    #[test]
    fn test_orphan_payload_discarded_until_last() {
        let mut r = Reassembly::new(0);
        assert_eq!(r.on_payload(vec![1], false), Outcome::Pending);
        assert_eq!(r.on_fragment(&[2], false), Outcome::Pending);
        assert_eq!(r.on_payload(vec![3], true), Outcome::Discarded);
        assert!(r.is_idle());

        // next packet is unaffected
        r.on_message(&msg(0)).unwrap();
        assert!(matches!(r.on_payload(vec![9], true), Outcome::Packet(_)));
    }

    #[test]
    fn test_poison_discards_rest_of_packet() {
        let mut r = Reassembly::new(0);
        r.on_message(&msg(0)).unwrap();
        assert_eq!(r.poison(false), Outcome::Pending);
        assert_eq!(r.on_payload(vec![1], true), Outcome::Discarded);
        assert!(r.is_idle());
    }
}
