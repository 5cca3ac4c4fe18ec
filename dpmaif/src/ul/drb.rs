//! DRB ring producer.
//!
//! One packet occupies one message descriptor followed by one payload
//! descriptor per fragment. Fragments are mapped at fill time and
//! unmapped when the device reports the slots read.
//!
//! # Credits
//! ```text
//!   budget (free)  +  in flight  +  done, unreleased  ==  capacity - 1
//!        fill: budget -= n     complete: budget += n
//! ```
//! Fill runs on the owning worker only; completion may run concurrently
//! from interrupt context and is serialized by its own lock.

use std::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::dma::DmaBuffer;
use crate::error::{DpmaifError, Result};
use crate::hal::DpmaifHw;
use crate::ring::{self, CoherentRing, RingCursors};
use crate::stack::NetStack;
use crate::stats::{bump, DpmaifStats};
use crate::types::{ChecksumOffload, DmaDirection, IndexSide, RingId, TxPacket};
use crate::wire::drb::{DrbEntry, DrbMessage, DrbPayload, DRB_ENTRY_WORDS};

/// Host-side record of one DRB slot.
#[derive(Debug)]
enum DrbSlot {
    /// Message descriptor; rebuilds the packet on completion.
    Message {
        channel_id: u8,
        offload: ChecksumOffload,
        frags: usize,
    },
    /// Payload descriptor; owns the mapped fragment.
    Payload(DmaBuffer),
}

/// Result of one completion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub packets: u32,
    pub released: u32,
    /// The ring left the lack state during this pass.
    pub resumed: bool,
}

/// Credit accounting view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credits {
    pub free: u32,
    pub in_flight: u32,
    pub unreleased: u32,
}

impl Credits {
    pub fn total(&self) -> u32 {
        self.free + self.in_flight + self.unreleased
    }
}

pub struct DrbRing {
    id: RingId,
    mem: Arc<CoherentRing>,
    cursors: RingCursors,
    slots: Box<[Mutex<Option<DrbSlot>>]>,
    budget: AtomicU32,
    lack: AtomicBool,
    count_l: AtomicU32,
    resume_threshold: u32,
    completing: Mutex<()>,
    hw: Arc<dyn DpmaifHw>,
    stack: Arc<dyn NetStack>,
    stats: Arc<DpmaifStats>,
}

impl DrbRing {
    pub fn new(
        ring: u8,
        entries: u32,
        resume_threshold: u32,
        hw: Arc<dyn DpmaifHw>,
        stack: Arc<dyn NetStack>,
        stats: Arc<DpmaifStats>,
    ) -> Result<Self> {
        let id = RingId::drb(ring);
        let mem = hw.alloc_ring(id, entries, DRB_ENTRY_WORDS)?;
        Ok(Self {
            id,
            mem,
            cursors: RingCursors::new(entries),
            slots: (0..entries).map(|_| Mutex::new(None)).collect(),
            budget: AtomicU32::new(entries - 1),
            lack: AtomicBool::new(false),
            count_l: AtomicU32::new(0),
            resume_threshold,
            completing: Mutex::new(()),
            hw,
            stack,
            stats,
        })
    }

    pub fn id(&self) -> RingId {
        self.id
    }

    pub fn cursors(&self) -> &RingCursors {
        &self.cursors
    }

    /// Free descriptor slots.
    pub fn budget(&self) -> u32 {
        self.budget.load(Ordering::Acquire)
    }

    pub fn is_lacking(&self) -> bool {
        self.lack.load(Ordering::Acquire)
    }

    /// Enter the lack state. Returns true on the transition.
    pub fn set_lack(&self) -> bool {
        !self.lack.swap(true, Ordering::AcqRel)
    }

    /// Leave the lack state if completions freed enough slots meanwhile.
    ///
    /// Returns true on the transition.
    pub fn try_resume(&self) -> bool {
        self.budget() >= self.resume_threshold && self.lack.swap(false, Ordering::AcqRel)
    }

    pub fn credits(&self) -> Credits {
        Credits {
            free: self.budget(),
            in_flight: self.cursors.readable(),
            unreleased: self.cursors.releasable(),
        }
    }

    /// Write descriptors for `pkt`.
    ///
    /// # Returns
    /// Descriptor slots used. The caller owes a doorbell for them.
    ///
    /// # Errors
    /// Gives the packet back with `RingFull` when the budget is short, or
    /// with `Hardware` when a fragment could not be mapped. No mapping
    /// outlives a failed fill.
    pub fn fill(&self, mut pkt: TxPacket) -> core::result::Result<u32, (TxPacket, DpmaifError)> {
        let need = pkt.descriptors_needed();
        if self.budget() < need {
            return Err((pkt, DpmaifError::RingFull));
        }

        let mut bufs: Vec<DmaBuffer> = Vec::with_capacity(pkt.frags.len());
        for i in 0..pkt.frags.len() {
            let mut buf = DmaBuffer::new(core::mem::take(&mut pkt.frags[i]), DmaDirection::ToDevice);
            if let Err(e) = buf.map(&*self.hw) {
                pkt.frags[i] = buf.into_vec(usize::MAX);
                for (j, mut b) in bufs.into_iter().enumerate() {
                    b.unmap(&*self.hw);
                    pkt.frags[j] = b.into_vec(usize::MAX);
                }
                log::error!(target: "dpmaif::ul", "{}: fragment map failed: {}", self.id, e);
                return Err((pkt, e.into()));
            }
            bufs.push(buf);
        }

        let cap = self.cursors.capacity();
        let mut idx = self.cursors.write();
        let count_l = self.count_l.fetch_add(1, Ordering::Relaxed) as u16;
        let msg = DrbEntry::Message(DrbMessage {
            cont: true,
            packet_len: pkt.len() as u16,
            count_l,
            channel_id: pkt.channel_id,
            offload: pkt.offload,
        });
        self.mem.write(idx, msg.encode());
        *self.slots[idx as usize].lock() = Some(DrbSlot::Message {
            channel_id: pkt.channel_id,
            offload: pkt.offload,
            frags: bufs.len(),
        });
        idx = ring::advance(idx, 1, cap);

        let last = bufs.len() - 1;
        for (i, buf) in bufs.into_iter().enumerate() {
            let pd = DrbEntry::Payload(DrbPayload {
                cont: i != last,
                data_len: buf.capacity() as u16,
                data_addr: buf.bus_addr(),
            });
            self.mem.write(idx, pd.encode());
            *self.slots[idx as usize].lock() = Some(DrbSlot::Payload(buf));
            idx = ring::advance(idx, 1, cap);
        }

        self.budget.fetch_sub(need, Ordering::AcqRel);
        self.cursors.set_write(idx);
        Ok(need)
    }

    /// Reclaim descriptors the device has read.
    ///
    /// Only whole packets are released: a read cursor inside a packet
    /// leaves that packet for the next pass. A device read cursor beyond
    /// the posted descriptors is a `RingIndex` fault.
    pub fn complete(&self) -> Result<Completion> {
        let Some(_guard) = self.completing.try_lock() else {
            return Ok(Completion::default());
        };
        let hw_read = self.hw.ring_index(self.id, IndexSide::Read)?;
        if !self.cursors.sync_read(hw_read) {
            log::error!(
                target: "dpmaif::ul",
                "{}: device read {} outside [{}, {}]",
                self.id, hw_read, self.cursors.read(), self.cursors.write()
            );
            return Err(DpmaifError::RingIndex {
                ring: self.id,
                side: IndexSide::Read,
                index: hw_read,
            });
        }

        let cap = self.cursors.capacity();
        let start = self.cursors.release();
        let done = self.cursors.releasable();

        // Find the last packet boundary inside the done span.
        let mut boundary = 0;
        for off in 0..done {
            let idx = ring::advance(start, off, cap);
            if DrbEntry::decode(self.mem.read::<DRB_ENTRY_WORDS>(idx)).is_last() {
                boundary = off + 1;
            }
        }

        let mut out = Completion::default();
        let mut pending: Option<(u8, ChecksumOffload, usize)> = None;
        let mut frags = Vec::new();
        for off in 0..boundary {
            let idx = ring::advance(start, off, cap);
            match self.slots[idx as usize].lock().take() {
                Some(DrbSlot::Message {
                    channel_id,
                    offload,
                    frags: n,
                }) => {
                    pending = Some((channel_id, offload, n));
                    frags = Vec::with_capacity(n);
                }
                Some(DrbSlot::Payload(mut buf)) => {
                    buf.unmap(&*self.hw);
                    frags.push(buf.into_vec(usize::MAX));
                }
                None => {
                    log::warn!(target: "dpmaif::ul", "{}: slot {} empty on completion", self.id, idx);
                }
            }
            if let Some((channel_id, offload, n)) = pending {
                if frags.len() == n {
                    let pkt = TxPacket::from_frags(channel_id, core::mem::take(&mut frags))
                        .with_offload(offload);
                    bump(&self.stats.tx_packets, 1);
                    bump(&self.stats.tx_bytes, pkt.len() as u64);
                    self.stack.tx_complete(pkt);
                    pending = None;
                    out.packets += 1;
                }
            }
        }

        if boundary == 0 {
            return Ok(out);
        }
        self.cursors.set_release(ring::advance(start, boundary, cap));
        self.budget.fetch_add(boundary, Ordering::AcqRel);
        out.released = boundary;

        if self.try_resume() {
            log::debug!(target: "dpmaif::ul", "{}: resumed with {} free slots", self.id, self.budget());
            out.resumed = true;
        }
        Ok(out)
    }

    /// Unmap and drop everything still in the ring.
    ///
    /// # Returns
    /// Packets discarded.
    pub fn drain(&self) -> u32 {
        let mut dropped = 0;
        for slot in self.slots.iter() {
            match slot.lock().take() {
                Some(DrbSlot::Payload(mut buf)) => {
                    if buf.is_device_owned() {
                        buf.unmap(&*self.hw);
                    }
                }
                Some(DrbSlot::Message { .. }) => dropped += 1,
                None => {}
            }
        }
        bump(&self.stats.tx_dropped, dropped as u64);
        self.cursors.reset();
        self.budget.store(self.cursors.capacity() - 1, Ordering::Release);
        self.lack.store(false, Ordering::Release);
        self.mem.clear();
        dropped
    }
}

impl Drop for DrbRing {
    fn drop(&mut self) {
        self.drain();
        self.hw.free_ring(self.id);
    }
}

impl core::fmt::Debug for DrbRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DrbRing")
            .field("id", &self.id)
            .field("cursors", &self.cursors)
            .field("budget", &self.budget())
            .field("lack", &self.is_lacking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DOORBELL_DELAYS;
    use crate::doorbell::DoorbellBatcher;
    use crate::hal::LoopbackHw;
    use crate::stack::testing::RecordingStack;
    use proptest::prelude::*;

    struct Fixture {
        hw: Arc<LoopbackHw>,
        stack: Arc<RecordingStack>,
        doorbell: DoorbellBatcher,
        ring: DrbRing,
    }

    fn fixture(entries: u32) -> Fixture {
        let hw = Arc::new(LoopbackHw::new());
        let stack = Arc::new(RecordingStack::default());
        let stats = Arc::new(DpmaifStats::new());
        let ring = DrbRing::new(0, entries, 4, hw.clone(), stack.clone(), stats.clone()).unwrap();
        let doorbell = DoorbellBatcher::new(hw.clone(), stats, [RingId::drb(0)], DEFAULT_DOORBELL_DELAYS.to_vec());
        Fixture {
            hw,
            stack,
            doorbell,
            ring,
        }
    }

    fn post(f: &Fixture, n: u32) {
        f.doorbell.add(RingId::drb(0), n);
        f.doorbell.flush().unwrap();
    }

    #[test]
    fn test_fill_transmit_complete() {
        let f = fixture(16);
        let pkt = TxPacket::from_frags(3, vec![vec![1; 20], vec![2; 30]]).with_offload(ChecksumOffload::L4);
        assert_eq!(f.ring.fill(pkt.clone()).unwrap(), 3);
        assert_eq!(f.hw.live_mappings(), 2);
        assert_eq!(f.ring.budget(), 12);

        post(&f, 3);
        let sent = f.hw.transmit(0, 8).unwrap();
        assert_eq!(sent, vec![[vec![1u8; 20], vec![2u8; 30]].concat()]);

        let c = f.ring.complete().unwrap();
        assert_eq!(c.packets, 1);
        assert_eq!(c.released, 3);
        assert_eq!(f.ring.budget(), 15);
        assert_eq!(f.hw.live_mappings(), 0);
        assert_eq!(f.stack.tx_done.lock().as_slice(), &[pkt]);
    }

    #[test]
    fn test_ring_full_returns_packet() {
        let f = fixture(8);
        f.ring.fill(TxPacket::from_frags(0, vec![vec![0; 8]; 3])).unwrap();
        f.ring.fill(TxPacket::new(0, vec![0; 8])).unwrap();
        let (back, err) = f.ring.fill(TxPacket::new(0, vec![9; 8])).unwrap_err();
        assert_eq!(err, DpmaifError::RingFull);
        assert_eq!(back.frags[0], vec![9; 8]);
        assert_eq!(f.ring.budget(), 1);
    }

    #[test]
    fn test_map_failure_unwinds() {
        let f = fixture(8);
        f.ring.fill(TxPacket::new(0, vec![0; 4])).unwrap();
        let pkt = TxPacket::from_frags(0, vec![vec![1; 4], vec![2; 4], vec![3; 4]]);
        // second fragment fails after the first was mapped
        f.hw.fail_maps_after(1, 1);
        let (back, err) = f.ring.fill(pkt.clone()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(back, pkt);
        assert_eq!(f.hw.live_mappings(), 1);
        assert_eq!(f.ring.budget(), 5);
        assert_eq!(f.ring.cursors().write(), 2);
    }

    #[test]
    fn test_partial_packet_not_released() {
        let f = fixture(16);
        f.ring.fill(TxPacket::from_frags(0, vec![vec![1; 4], vec![2; 4]])).unwrap();
        // device has read only message + first payload
        post(&f, 2);
        f.hw.transmit(0, 8).unwrap();
        let c = f.ring.complete().unwrap();
        assert_eq!(c.packets, 0);
        assert_eq!(c.released, 0);
        post(&f, 1);
        f.hw.transmit(0, 8).unwrap();
        assert_eq!(f.ring.complete().unwrap().packets, 1);
    }

    #[test]
    fn test_lack_clears_above_threshold() {
        let f = fixture(8);
        f.ring.fill(TxPacket::from_frags(0, vec![vec![0; 8]; 5])).unwrap();
        assert!(f.ring.set_lack());
        assert!(!f.ring.set_lack());
        post(&f, 6);
        f.hw.transmit(0, 8).unwrap();
        let c = f.ring.complete().unwrap();
        assert!(c.resumed);
        assert!(!f.ring.is_lacking());
    }

    #[test]
    fn test_read_index_past_write_is_fatal() {
        let f = fixture(16);
        f.ring.fill(TxPacket::new(0, vec![1; 8])).unwrap();
        f.hw.force_index(RingId::drb(0), IndexSide::Read, Some(5));
        let err = f.ring.complete().unwrap_err();
        assert_eq!(
            err,
            DpmaifError::RingIndex {
                ring: RingId::drb(0),
                side: IndexSide::Read,
                index: 5
            }
        );
        assert!(err.is_fatal());
        assert_eq!(f.ring.cursors().read(), 0);
        assert_eq!(f.hw.live_mappings(), 1);
        assert!(f.stack.tx_done.lock().is_empty());
    }

    #[test]
    fn test_drain_unmaps_in_flight() {
        let f = fixture(16);
        f.ring.fill(TxPacket::from_frags(0, vec![vec![0; 8]; 2])).unwrap();
        f.ring.fill(TxPacket::new(0, vec![0; 8])).unwrap();
        assert_eq!(f.ring.drain(), 2);
        assert_eq!(f.hw.live_mappings(), 0);
        assert_eq!(f.ring.budget(), 15);
    }

    proptest! {
        #[test]
        fn prop_credits_conserved(ops in proptest::collection::vec((0u8..3, 1usize..4), 1..60)) {
            let f = fixture(16);
            let mut unposted = 0;
            for (op, n) in ops {
                match op {
                    0 => {
                        if let Ok(used) = f.ring.fill(TxPacket::from_frags(0, vec![vec![7; 16]; n])) {
                            unposted += used;
                        }
                    }
                    1 => {
                        post(&f, unposted);
                        unposted = 0;
                        f.hw.transmit(0, n).unwrap();
                    }
                    _ => {
                        f.ring.complete().unwrap();
                    }
                }
                prop_assert_eq!(f.ring.credits().total(), 15);
                prop_assert!(f.ring.cursors().is_ordered());
            }
        }
    }
}
