//! In-memory device model.
//!
//! Implements [`DpmaifHw`] without hardware: coherent ring memory lives on
//! the heap, DMA mappings are tracked in a table (so leaks are visible),
//! and the device side of every ring is driven explicitly:
//!
//! - [`LoopbackHw::receive`] consumes BAT buffers, writes packet bytes into
//!   them and produces PIT entries with sequence numbers
//! - [`LoopbackHw::transmit`] consumes posted DRB entries, gathers the
//!   payload through the mapping table and advances the DRB read cursor
//!
//! Faults (map failures, register timeouts) can be injected at runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;
use thiserror::Error;

use super::{DpmaifHw, HwError};
use crate::irq::IntStatus;
use crate::ring::{self, CoherentRing};
use crate::types::{BusAddr, DmaDirection, IndexSide, RingId, RingKind};
use crate::wire::bat::{BatEntry, BAT_ENTRY_WORDS};
use crate::wire::drb::{DrbEntry, DRB_ENTRY_WORDS};
use crate::wire::pit::{
    next_seq, PitEntry, PitMessage, PitPayload, CHECKSUM_VERIFIED, PIT_ENTRY_WORDS,
};

/// First bus address handed out; above 4 GiB so address splits are exercised.
const BUS_BASE: BusAddr = 0x1_0000_0000;
const BUS_ALIGN: u64 = 64;

/// Device-side failures of the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopbackError {
    #[error("ring {0} not allocated")]
    NoRing(RingId),
    #[error("no posted buffer on {0}")]
    NoBuffer(RingId),
    #[error("PIT {0} has no free entries")]
    PitFull(u8),
    #[error("bus address {0:#x} is not mapped")]
    Unmapped(BusAddr),
    #[error("segment of {len} bytes exceeds buffer of {cap} bytes")]
    BufferTooSmall { len: usize, cap: usize },
}

/// One downlink segment as the device places it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Lands in a normal BAT buffer.
    Normal(Vec<u8>),
    /// Lands in a fragment BAT buffer.
    Frag(Vec<u8>),
}

/// A downlink packet as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePacket {
    pub channel_id: u8,
    pub hash: u32,
    pub checksum_ok: bool,
    pub drop: bool,
    /// Bytes the device leaves unused at the start of every buffer.
    pub headroom: u8,
    pub segments: Vec<Segment>,
}

impl DevicePacket {
    pub fn new(channel_id: u8, data: Vec<u8>) -> Self {
        Self::segmented(channel_id, vec![data])
    }

    pub fn segmented(channel_id: u8, segments: Vec<Vec<u8>>) -> Self {
        Self {
            channel_id,
            hash: 0,
            checksum_ok: true,
            drop: false,
            headroom: 0,
            segments: segments.into_iter().map(Segment::Normal).collect(),
        }
    }

    pub fn with_hash(mut self, hash: u32) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_frag(mut self, data: Vec<u8>) -> Self {
        self.segments.push(Segment::Frag(data));
        self
    }

    pub fn with_headroom(mut self, headroom: u8) -> Self {
        self.headroom = headroom;
        self
    }

    pub fn dropped(mut self) -> Self {
        self.drop = true;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    cpu: usize,
    len: usize,
    dir: DmaDirection,
}

#[derive(Debug)]
struct RingState {
    mem: Arc<CoherentRing>,
    /// Device consumer cursor (BAT, FRG, DRB).
    read: u32,
    /// Device producer cursor (PIT).
    write: u32,
    /// BAT/FRG/DRB: posted entries not yet consumed.
    /// PIT: free entries the device may still write.
    credits: u32,
    /// DRB: bytes of a packet whose last descriptor is not posted yet.
    tx_partial: Option<Vec<u8>>,
}

impl RingState {
    fn new(kind: RingKind, mem: Arc<CoherentRing>) -> Self {
        let credits = match kind {
            RingKind::Pit => mem.entries() - 1,
            _ => 0,
        };
        Self {
            mem,
            read: 0,
            write: 0,
            credits,
            tx_partial: None,
        }
    }

    fn capacity(&self) -> u32 {
        self.mem.entries()
    }
}

#[derive(Debug, Default)]
struct State {
    rings: BTreeMap<RingId, RingState>,
    mappings: BTreeMap<BusAddr, Mapping>,
    next_bus: BusAddr,
    doorbells: Vec<(RingId, u32)>,
    pit_seq: BTreeMap<u8, u16>,
    forced_index: BTreeMap<(RingId, IndexSide), u32>,
    bad_unmaps: u32,
    started: bool,
}

/// Loopback implementation of [`DpmaifHw`].
#[derive(Debug)]
pub struct LoopbackHw {
    state: Mutex<State>,
    map_skip: AtomicU32,
    fail_maps: AtomicU32,
    register_timeout: AtomicBool,
    pending_irq: AtomicU32,
}

impl Default for LoopbackHw {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHw {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_bus: BUS_BASE,
                ..State::default()
            }),
            map_skip: AtomicU32::new(0),
            fail_maps: AtomicU32::new(0),
            register_timeout: AtomicBool::new(false),
            pending_irq: AtomicU32::new(0),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // FAULT INJECTION
    // ═══════════════════════════════════════════════════════════════════

    /// Fail the next `n` map calls.
    pub fn fail_next_maps(&self, n: u32) {
        self.fail_maps_after(0, n);
    }

    /// Let `skip` map calls succeed, then fail the following `n`.
    pub fn fail_maps_after(&self, skip: u32, n: u32) {
        self.map_skip.store(skip, Ordering::Release);
        self.fail_maps.store(n, Ordering::Release);
    }

    /// Make every register access time out.
    pub fn set_register_timeout(&self, on: bool) {
        self.register_timeout.store(on, Ordering::Release);
    }

    /// Force the sequence number of the next PIT entry on `queue`.
    pub fn set_pit_seq(&self, queue: u8, seq: u16) {
        self.state.lock().pit_seq.insert(queue, seq);
    }

    /// Report `index` for `side` of `ring` regardless of the model's
    /// cursors, until cleared with `None` or a ring reset.
    pub fn force_index(&self, ring: RingId, side: IndexSide, index: Option<u32>) {
        let mut st = self.state.lock();
        match index {
            Some(i) => st.forced_index.insert((ring, side), i),
            None => st.forced_index.remove(&(ring, side)),
        };
    }

    /// Write raw words as the next PIT entry, bypassing sequencing.
    pub fn write_raw_pit(
        &self,
        queue: u8,
        words: [u32; PIT_ENTRY_WORDS],
    ) -> Result<(), LoopbackError> {
        let mut st = self.state.lock();
        let pit = st
            .rings
            .get_mut(&RingId::pit(queue))
            .ok_or(LoopbackError::NoRing(RingId::pit(queue)))?;
        if pit.credits == 0 {
            return Err(LoopbackError::PitFull(queue));
        }
        pit.mem.write(pit.write, words);
        pit.write = ring::advance(pit.write, 1, pit.capacity());
        pit.credits -= 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // OBSERVATION
    // ═══════════════════════════════════════════════════════════════════

    /// Mappings created and not yet torn down.
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Unmap calls for addresses that were not mapped.
    pub fn bad_unmaps(&self) -> u32 {
        self.state.lock().bad_unmaps
    }

    /// Every doorbell written so far, in order.
    pub fn doorbells(&self) -> Vec<(RingId, u32)> {
        self.state.lock().doorbells.clone()
    }

    /// Drain the doorbell log.
    pub fn take_doorbells(&self) -> Vec<(RingId, u32)> {
        core::mem::take(&mut self.state.lock().doorbells)
    }

    /// Entries posted to the device and not yet consumed (BAT, FRG, DRB),
    /// or free PIT entries.
    pub fn credits(&self, ring: RingId) -> Option<u32> {
        self.state.lock().rings.get(&ring).map(|r| r.credits)
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn ring_count(&self) -> usize {
        self.state.lock().rings.len()
    }

    /// Interrupt status raised by device-side activity since the last call.
    pub fn take_interrupts(&self) -> u32 {
        self.pending_irq.swap(0, Ordering::AcqRel)
    }

    // ═══════════════════════════════════════════════════════════════════
    // DEVICE SIDE
    // ═══════════════════════════════════════════════════════════════════

    /// Deliver one downlink packet into the rings of `queue`.
    ///
    /// Nothing is written unless the whole packet fits.
    pub fn receive(&self, queue: u8, pkt: &DevicePacket) -> Result<(), LoopbackError> {
        let mut st = self.state.lock();
        let st = &mut *st;

        let pit_id = RingId::pit(queue);
        let entries = pkt.segments.len() as u32 + 1;
        let normal = pkt
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Normal(_)))
            .count() as u32;
        let frags = pkt.segments.len() as u32 - normal;

        let pit_credits = st.rings.get(&pit_id).ok_or(LoopbackError::NoRing(pit_id))?.credits;
        if pit_credits < entries {
            return Err(LoopbackError::PitFull(queue));
        }
        for (id, need) in [(RingId::bat(queue), normal), (RingId::frag(queue), frags)] {
            if need == 0 {
                continue;
            }
            let have = st.rings.get(&id).ok_or(LoopbackError::NoRing(id))?.credits;
            if have < need {
                return Err(LoopbackError::NoBuffer(id));
            }
        }

        let mut seq = st.pit_seq.get(&queue).copied().unwrap_or(0);
        let mut pit_words = Vec::with_capacity(entries as usize);
        pit_words.push(
            PitEntry::Message(PitMessage {
                cont: true,
                channel_id: pkt.channel_id,
                drop: pkt.drop,
                checksum: if pkt.checksum_ok { CHECKSUM_VERIFIED } else { 0 },
                net_type: 0,
                hash: pkt.hash,
                seq,
            })
            .encode(),
        );
        seq = next_seq(seq);

        let last = pkt.segments.len() - 1;
        for (i, seg) in pkt.segments.iter().enumerate() {
            let (id, data, frag) = match seg {
                Segment::Normal(d) => (RingId::bat(queue), d, false),
                Segment::Frag(d) => (RingId::frag(queue), d, true),
            };
            let bat = st.rings.get_mut(&id).ok_or(LoopbackError::NoRing(id))?;
            let bid = bat.read;
            let entry = BatEntry::decode(bat.mem.read::<BAT_ENTRY_WORDS>(bid));
            let map = st
                .mappings
                .get(&entry.buffer_addr)
                .copied()
                .ok_or(LoopbackError::Unmapped(entry.buffer_addr))?;
            let offset = pkt.headroom as usize;
            if offset + data.len() > map.len || map.dir != DmaDirection::FromDevice {
                return Err(LoopbackError::BufferTooSmall {
                    len: offset + data.len(),
                    cap: map.len,
                });
            }
            // SAFETY: the mapping is live, so the host keeps `map.len`
            // bytes at `map.cpu` allocated and untouched until unmap, and
            // `offset + data.len()` stays inside it.
            unsafe {
                let dst = (map.cpu as *mut u8).add(offset);
                core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            }
            bat.read = ring::advance(bat.read, 1, bat.capacity());
            bat.credits -= 1;

            pit_words.push(
                PitEntry::Payload(PitPayload {
                    cont: i != last,
                    frag,
                    buffer_id: bid as u16,
                    data_len: data.len() as u16,
                    data_addr: entry.buffer_addr,
                    header_offset: pkt.headroom,
                    seq,
                })
                .encode(),
            );
            seq = next_seq(seq);
        }

        let pit = st.rings.get_mut(&pit_id).ok_or(LoopbackError::NoRing(pit_id))?;
        for words in pit_words {
            pit.mem.write(pit.write, words);
            pit.write = ring::advance(pit.write, 1, pit.capacity());
            pit.credits -= 1;
        }
        st.pit_seq.insert(queue, seq);
        self.pending_irq
            .fetch_or(IntStatus::dl_done(queue).bits(), Ordering::AcqRel);
        Ok(())
    }

    /// Send up to `max_packets` posted packets from DRB ring `ring_q`.
    ///
    /// Returns the packets' bytes as the modem would put them on air.
    pub fn transmit(&self, ring_q: u8, max_packets: usize) -> Result<Vec<Vec<u8>>, LoopbackError> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let id = RingId::drb(ring_q);
        let drb = st.rings.get_mut(&id).ok_or(LoopbackError::NoRing(id))?;

        let mut out = Vec::new();
        let mut current = drb.tx_partial.take();
        while drb.credits > 0 {
            if current.is_none() && out.len() >= max_packets {
                break;
            }
            let entry = DrbEntry::decode(drb.mem.read::<DRB_ENTRY_WORDS>(drb.read));
            match entry {
                DrbEntry::Message(m) => {
                    current = Some(Vec::with_capacity(m.packet_len as usize));
                }
                DrbEntry::Payload(p) => {
                    let map = st
                        .mappings
                        .get(&p.data_addr)
                        .copied()
                        .ok_or(LoopbackError::Unmapped(p.data_addr))?;
                    let len = (p.data_len as usize).min(map.len);
                    // SAFETY: live ToDevice mapping; the host keeps the
                    // bytes alive and unmodified until completion.
                    let bytes = unsafe { core::slice::from_raw_parts(map.cpu as *const u8, len) };
                    current.get_or_insert_with(Vec::new).extend_from_slice(bytes);
                }
                DrbEntry::Invalid(_) => {}
            }
            drb.read = ring::advance(drb.read, 1, drb.capacity());
            drb.credits -= 1;
            if entry.is_last() {
                if let Some(pkt) = current.take() {
                    out.push(pkt);
                }
            }
        }
        drb.tx_partial = current;
        if drb.credits == 0 || !out.is_empty() {
            self.pending_irq
                .fetch_or(IntStatus::ul_done(ring_q).bits(), Ordering::AcqRel);
        }
        Ok(out)
    }

    fn check_registers(&self, what: &'static str) -> Result<(), HwError> {
        if self.register_timeout.load(Ordering::Acquire) {
            return Err(HwError::RegisterTimeout(what));
        }
        Ok(())
    }
}

impl DpmaifHw for LoopbackHw {
    fn alloc_ring(
        &self,
        ring: RingId,
        entries: u32,
        entry_words: usize,
    ) -> Result<Arc<CoherentRing>, HwError> {
        let mut st = self.state.lock();
        let bytes = entries as u64 * entry_words as u64 * 4;
        let bus = st.next_bus;
        st.next_bus += (bytes + BUS_ALIGN - 1) & !(BUS_ALIGN - 1);
        let mem = Arc::new(CoherentRing::new(entries, entry_words, bus));
        st.rings.insert(ring, RingState::new(ring.kind, mem.clone()));
        Ok(mem)
    }

    fn free_ring(&self, ring: RingId) {
        self.state.lock().rings.remove(&ring);
    }

    unsafe fn map(&self, cpu: *mut u8, len: usize, dir: DmaDirection) -> Result<BusAddr, HwError> {
        let skipped = self
            .map_skip
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let failed = !skipped
            && self
                .fail_maps
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
        if failed {
            return Err(HwError::DmaMapFailed);
        }
        let mut st = self.state.lock();
        let addr = st.next_bus;
        st.next_bus += (len as u64 + BUS_ALIGN - 1) & !(BUS_ALIGN - 1);
        st.mappings.insert(
            addr,
            Mapping {
                cpu: cpu as usize,
                len,
                dir,
            },
        );
        Ok(addr)
    }

    fn unmap(&self, addr: BusAddr, len: usize, dir: DmaDirection) {
        let mut st = self.state.lock();
        match st.mappings.remove(&addr) {
            Some(m) if m.len == len && m.dir == dir => {}
            Some(m) => {
                log::warn!(
                    target: "dpmaif::loopback",
                    "unmap {:#x}: mapped {} bytes {:?}, unmapped {} bytes {:?}",
                    addr, m.len, m.dir, len, dir
                );
                st.bad_unmaps += 1;
            }
            None => {
                log::warn!(target: "dpmaif::loopback", "unmap of unknown address {:#x}", addr);
                st.bad_unmaps += 1;
            }
        }
    }

    fn ring_index(&self, ring: RingId, side: IndexSide) -> Result<u32, HwError> {
        self.check_registers("ring index")?;
        let st = self.state.lock();
        let r = st.rings.get(&ring).ok_or(HwError::UnknownRing(ring))?;
        if let Some(&forced) = st.forced_index.get(&(ring, side)) {
            return Ok(forced);
        }
        let cap = r.capacity();
        let idx = match (ring.kind, side) {
            (RingKind::Pit, IndexSide::Write) => r.write,
            // Host release position: everything not free and not unread.
            (RingKind::Pit, IndexSide::Read) => {
                let outstanding = cap - 1 - r.credits;
                (r.write + cap - outstanding) % cap
            }
            (_, IndexSide::Read) => r.read,
            (_, IndexSide::Write) => ring::advance(r.read, r.credits, cap),
        };
        Ok(idx)
    }

    fn doorbell(&self, ring: RingId, count: u32) -> Result<(), HwError> {
        self.check_registers("doorbell")?;
        let mut st = self.state.lock();
        let r = st.rings.get_mut(&ring).ok_or(HwError::UnknownRing(ring))?;
        r.credits += count;
        debug_assert!(r.credits < r.capacity(), "doorbell overflows {}", ring);
        st.doorbells.push((ring, count));
        Ok(())
    }

    fn start_queues(&self) -> Result<(), HwError> {
        self.check_registers("queue start")?;
        self.state.lock().started = true;
        Ok(())
    }

    fn stop_queues(&self) -> Result<(), HwError> {
        self.check_registers("queue stop")?;
        self.state.lock().started = false;
        Ok(())
    }

    fn reset_rings(&self) -> Result<(), HwError> {
        self.check_registers("ring reset")?;
        let mut st = self.state.lock();
        for (id, r) in st.rings.iter_mut() {
            r.mem.clear();
            r.read = 0;
            r.write = 0;
            r.credits = if id.kind == RingKind::Pit { r.capacity() - 1 } else { 0 };
            r.tx_partial = None;
        }
        st.pit_seq.clear();
        st.forced_index.clear();
        self.pending_irq.store(0, Ordering::Release);
        Ok(())
    }

    fn ack_interrupts(&self, bits: u32) {
        self.pending_irq.fetch_and(!bits, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_table_tracks_leaks() {
        let hw = LoopbackHw::new();
        let mut a = vec![0u8; 100];
        let mut b = vec![0u8; 100];
        let pa = unsafe { hw.map(a.as_mut_ptr(), 100, DmaDirection::FromDevice) }.unwrap();
        let pb = unsafe { hw.map(b.as_mut_ptr(), 100, DmaDirection::ToDevice) }.unwrap();
        assert!(pa >= BUS_BASE);
        assert_ne!(pa, pb);
        assert_eq!(hw.live_mappings(), 2);
        hw.unmap(pa, 100, DmaDirection::FromDevice);
        hw.unmap(pa, 100, DmaDirection::FromDevice);
        assert_eq!(hw.live_mappings(), 1);
        assert_eq!(hw.bad_unmaps(), 1);
    }

    #[test]
    fn test_injected_map_failure() {
        let hw = LoopbackHw::new();
        let mut a = vec![0u8; 8];
        hw.fail_next_maps(1);
        assert_eq!(
            unsafe { hw.map(a.as_mut_ptr(), 8, DmaDirection::ToDevice) },
            Err(HwError::DmaMapFailed)
        );
        assert!(unsafe { hw.map(a.as_mut_ptr(), 8, DmaDirection::ToDevice) }.is_ok());
    }

    #[test]
    fn test_register_timeout() {
        let hw = LoopbackHw::new();
        hw.alloc_ring(RingId::drb(0), 8, DRB_ENTRY_WORDS).unwrap();
        hw.set_register_timeout(true);
        assert!(matches!(
            hw.doorbell(RingId::drb(0), 1),
            Err(HwError::RegisterTimeout(_))
        ));
    }

    #[test]
    fn test_pit_credits_start_full() {
        let hw = LoopbackHw::new();
        hw.alloc_ring(RingId::pit(0), 16, PIT_ENTRY_WORDS).unwrap();
        assert_eq!(hw.credits(RingId::pit(0)), Some(15));
        assert_eq!(hw.ring_index(RingId::pit(0), IndexSide::Read).unwrap(), 0);
    }

    #[test]
    fn test_receive_needs_posted_buffers() {
        let hw = LoopbackHw::new();
        hw.alloc_ring(RingId::pit(0), 16, PIT_ENTRY_WORDS).unwrap();
        hw.alloc_ring(RingId::bat(0), 8, BAT_ENTRY_WORDS).unwrap();
        let pkt = DevicePacket::new(0, vec![1, 2, 3]);
        assert_eq!(
            hw.receive(0, &pkt),
            Err(LoopbackError::NoBuffer(RingId::bat(0)))
        );
        // nothing written on failure
        assert_eq!(hw.ring_index(RingId::pit(0), IndexSide::Write).unwrap(), 0);
    }
}
