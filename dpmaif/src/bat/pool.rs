//! Receive buffer pool backing one BAT (or fragment BAT) ring.
//!
//! # Slot lifecycle
//! ```text
//!   FREE ──refill()──> DEVICE_OWNED ──take()──> CONSUMED ──recycle()──> FREE
//!                      (mapped, BAT       (unmapped, data   (mask flag
//!                       entry written)     handed to dl)     cleared)
//! ```
//!
//! # Cursors
//! - `write`: next slot refill fills (host)
//! - `read`: last device consumer position seen (synced from hardware)
//! - `release`: next slot recycle reclaims (host)
//!
//! A slot is only reclaimed when every slot before it, back to `release`,
//! has been consumed. A gap stops recycling.

use std::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::dma::{BufferAllocator, BufferOwnership, DmaBuffer};
use crate::doorbell::DoorbellBatcher;
use crate::error::{DpmaifError, Result};
use crate::hal::DpmaifHw;
use crate::ring::{self, CoherentRing, RingCursors};
use crate::task::{TaskContext, TaskWaker};
use crate::types::{DmaDirection, IndexSide, RingId};
use crate::wire::bat::{BatEntry, BAT_ENTRY_WORDS};

/// Pool geometry.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub entries: u32,
    pub buffer_size: usize,
    /// Consumed slots that wake the recycle task.
    pub recycle_threshold: u32,
}

/// DMA receive buffers lent to the device through one BAT ring.
pub struct BatPool {
    ring: RingId,
    mem: Arc<CoherentRing>,
    cursors: RingCursors,
    /// Buffer bound to each slot. `None` once taken or never filled.
    slots: Box<[Mutex<Option<DmaBuffer>>]>,
    /// Held for a whole refill; the write cursor has one producer at a time.
    filling: Mutex<()>,
    /// Mask table: set by `take`, cleared by `recycle`.
    consumed: Box<[AtomicBool]>,
    buffer_size: usize,
    recycle_threshold: u32,
    /// Slots consumed since the recycle task was last woken.
    pending: AtomicU32,
    hw: Arc<dyn DpmaifHw>,
    alloc: Arc<dyn BufferAllocator>,
    doorbell: Arc<DoorbellBatcher>,
    waker: TaskWaker,
}

impl BatPool {
    /// Allocate the ring and an empty pool. Call [`replenish`](Self::replenish)
    /// to lend the first buffers.
    pub fn new(
        ring: RingId,
        cfg: PoolConfig,
        hw: Arc<dyn DpmaifHw>,
        alloc: Arc<dyn BufferAllocator>,
        doorbell: Arc<DoorbellBatcher>,
    ) -> Result<Self> {
        let mem = hw.alloc_ring(ring, cfg.entries, BAT_ENTRY_WORDS)?;
        let slots = (0..cfg.entries).map(|_| Mutex::new(None)).collect();
        let consumed = (0..cfg.entries).map(|_| AtomicBool::new(false)).collect();
        log::debug!(
            target: "dpmaif::bat",
            "{}: {} slots of {} bytes at {:#x}",
            ring, cfg.entries, cfg.buffer_size, mem.bus_addr()
        );
        Ok(Self {
            ring,
            mem,
            cursors: RingCursors::new(cfg.entries),
            slots,
            filling: Mutex::new(()),
            consumed,
            buffer_size: cfg.buffer_size,
            recycle_threshold: cfg.recycle_threshold,
            pending: AtomicU32::new(0),
            hw,
            alloc,
            doorbell,
            waker: TaskWaker::new(),
        })
    }

    pub fn ring(&self) -> RingId {
        self.ring
    }

    pub fn cursors(&self) -> &RingCursors {
        &self.cursors
    }

    pub fn waker(&self) -> &TaskWaker {
        &self.waker
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Ownership of the buffer bound to slot `idx`.
    pub fn slot_state(&self, idx: u32) -> BufferOwnership {
        self.slots
            .get(idx as usize)
            .and_then(|s| s.lock().as_ref().map(|b| b.ownership()))
            .unwrap_or(BufferOwnership::Free)
    }

    pub fn is_consumed(&self, idx: u32) -> bool {
        self.consumed
            .get(idx as usize)
            .map_or(false, |f| f.load(Ordering::Acquire))
    }

    // ═══════════════════════════════════════════════════════════════════
    // REFILL
    // ═══════════════════════════════════════════════════════════════════

    /// Lend up to `count` fresh buffers to the device.
    ///
    /// Fills free slots from the write cursor: allocate, map, write the
    /// BAT entry, advance. One doorbell request covers the whole batch.
    /// Concurrent callers are serialized.
    ///
    /// # Returns
    /// Slots filled. Fewer than `count` when the ring has less room or
    /// allocation ran dry part way.
    ///
    /// # Errors
    /// - `LowMemory`: no free slot (ring full)
    /// - `OutOfMemory`: not even one buffer could be allocated
    /// - `Hardware`: mapping failed; slots filled before it are published
    pub fn refill(&self, count: u32) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        let _filling = self.filling.lock();
        let want = count.min(self.cursors.writable());
        if want == 0 {
            return Err(DpmaifError::LowMemory);
        }

        let cap = self.cursors.capacity();
        let mut write = self.cursors.write();
        let mut filled = 0;
        let mut failure = None;
        while filled < want {
            let Some(data) = self.alloc.alloc(self.buffer_size) else {
                failure = Some(DpmaifError::OutOfMemory);
                break;
            };
            let mut buf = DmaBuffer::new(data, DmaDirection::FromDevice);
            let addr = match buf.map(&*self.hw) {
                Ok(addr) => addr,
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            };
            self.mem.write(write, BatEntry { buffer_addr: addr }.encode());
            *self.slots[write as usize].lock() = Some(buf);
            write = ring::advance(write, 1, cap);
            filled += 1;
        }

        if filled > 0 {
            self.cursors.set_write(write);
            self.doorbell.add(self.ring, filled);
        }

        match failure {
            None => Ok(filled),
            Some(DpmaifError::OutOfMemory) if filled > 0 => {
                log::debug!(
                    target: "dpmaif::bat",
                    "{}: partial refill {}/{}",
                    self.ring, filled, want
                );
                Ok(filled)
            }
            Some(e) => {
                log::warn!(target: "dpmaif::bat", "{}: refill stopped after {}: {}", self.ring, filled, e);
                Err(e)
            }
        }
    }

    /// Fill every free slot. A full ring is not an error here.
    pub fn replenish(&self) -> Result<u32> {
        match self.refill(self.cursors.writable()) {
            Err(DpmaifError::LowMemory) => Ok(0),
            other => other,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // CONSUME / RECYCLE
    // ═══════════════════════════════════════════════════════════════════

    /// Reclaim the buffer the device filled in slot `bid`.
    ///
    /// Unmaps the buffer and sets the slot's mask flag. Wakes the recycle
    /// task once enough slots are waiting.
    pub fn take(&self, bid: u16) -> Result<DmaBuffer> {
        let idx = bid as u32;
        let invalid = || DpmaifError::InvalidBufferId {
            queue: self.ring.queue,
            frag: self.ring.kind == crate::types::RingKind::Frag,
            bid,
        };
        if idx >= self.cursors.capacity() || !self.cursors.in_flight(idx) {
            return Err(invalid());
        }
        if self.consumed[idx as usize].load(Ordering::Acquire) {
            return Err(invalid());
        }
        let mut buf = self.slots[idx as usize].lock().take().ok_or_else(invalid)?;
        buf.unmap(&*self.hw);
        self.consumed[idx as usize].store(true, Ordering::Release);

        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.recycle_threshold {
            self.waker.wake();
        }
        Ok(buf)
    }

    /// Reclaim up to `count` consumed slots from the release cursor, then
    /// refill the freed capacity.
    ///
    /// Stops at the first slot that is not consumed. Refill shortfalls
    /// under memory pressure are left for [`replenish`](Self::replenish).
    ///
    /// # Returns
    /// Slots released.
    ///
    /// # Errors
    /// `RingIndex` when the device read cursor lies outside the lent
    /// span; mapping failures from the refill.
    pub fn recycle(&self, count: u32) -> Result<u32> {
        let hw_read = self.hw.ring_index(self.ring, IndexSide::Read)?;
        if !self.cursors.sync_read(hw_read) {
            log::error!(
                target: "dpmaif::bat",
                "{}: device read {} outside [{}, {}]",
                self.ring, hw_read, self.cursors.read(), self.cursors.write()
            );
            return Err(DpmaifError::RingIndex {
                ring: self.ring,
                side: IndexSide::Read,
                index: hw_read,
            });
        }

        let cap = self.cursors.capacity();
        let limit = count.min(self.cursors.releasable());
        let mut release = self.cursors.release();
        let mut released = 0;
        while released < limit {
            let flag = &self.consumed[release as usize];
            if !flag.load(Ordering::Acquire) {
                break;
            }
            flag.store(false, Ordering::Release);
            release = ring::advance(release, 1, cap);
            released += 1;
        }
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(released)));
        if released == 0 {
            return Ok(0);
        }
        self.cursors.set_release(release);
        log::trace!(target: "dpmaif::bat", "{}: released {} up to {}", self.ring, released, release);

        match self.refill(released) {
            Ok(_) => {}
            Err(e) if !e.is_fatal() => {
                log::debug!(target: "dpmaif::bat", "{}: refill after recycle: {}", self.ring, e);
            }
            Err(e) => return Err(e),
        }
        Ok(released)
    }

    /// One pass of the recycle task.
    pub fn service(&self) -> Result<u32> {
        let released = self.recycle(u32::MAX)?;
        if self.cursors.writable() > 0 {
            match self.replenish() {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => {
                    log::debug!(target: "dpmaif::bat", "{}: replenish: {}", self.ring, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Recycle task body: sleep until woken, then service the pool.
    pub fn run(&self, ctx: &TaskContext, idle: core::time::Duration) -> Result<()> {
        while !ctx.should_stop() {
            ctx.park_timeout(idle);
            self.service()?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // TEARDOWN
    // ═══════════════════════════════════════════════════════════════════

    /// Unmap and free every buffer, zero the cursors.
    ///
    /// # Returns
    /// Buffers released.
    pub fn drain(&self) -> u32 {
        let mut freed = 0;
        for slot in self.slots.iter() {
            if let Some(mut buf) = slot.lock().take() {
                if buf.is_device_owned() {
                    buf.unmap(&*self.hw);
                }
                freed += 1;
            }
        }
        for flag in self.consumed.iter() {
            flag.store(false, Ordering::Release);
        }
        self.cursors.reset();
        self.pending.store(0, Ordering::Release);
        self.mem.clear();
        log::debug!(target: "dpmaif::bat", "{}: drained {} buffers", self.ring, freed);
        freed
    }
}

impl Drop for BatPool {
    fn drop(&mut self) {
        self.drain();
        self.hw.free_ring(self.ring);
    }
}

impl core::fmt::Debug for BatPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatPool")
            .field("ring", &self.ring)
            .field("cursors", &self.cursors)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DOORBELL_DELAYS;
    use crate::dma::{CappedAllocator, HeapAllocator};
    use crate::hal::loopback::DevicePacket;
    use crate::hal::LoopbackHw;
    use crate::stats::DpmaifStats;
    use crate::wire::pit::PIT_ENTRY_WORDS;
    use proptest::prelude::*;

    struct Fixture {
        hw: Arc<LoopbackHw>,
        doorbell: Arc<DoorbellBatcher>,
        pool: BatPool,
    }

    fn fixture(entries: u32, alloc: Arc<dyn BufferAllocator>) -> Fixture {
        let hw = Arc::new(LoopbackHw::new());
        hw.alloc_ring(RingId::pit(0), 2048, PIT_ENTRY_WORDS).unwrap();
        let doorbell = Arc::new(DoorbellBatcher::new(
            hw.clone(),
            Arc::new(DpmaifStats::new()),
            [RingId::bat(0)],
            DEFAULT_DOORBELL_DELAYS.to_vec(),
        ));
        let cfg = PoolConfig {
            entries,
            buffer_size: 256,
            recycle_threshold: 2,
        };
        let pool = BatPool::new(RingId::bat(0), cfg, hw.clone(), alloc, doorbell.clone()).unwrap();
        Fixture { hw, doorbell, pool }
    }

    /// Device consumes `n` buffers; returns how many it managed.
    fn consume(f: &Fixture, n: u32) -> u32 {
        f.doorbell.flush().unwrap();
        (0..n)
            .take_while(|_| f.hw.receive(0, &DevicePacket::new(0, vec![0xab; 64])).is_ok())
            .count() as u32
    }

    #[test]
    fn test_refill_recycle_scenario() {
        let f = fixture(8, Arc::new(HeapAllocator));
        assert_eq!(f.pool.refill(7).unwrap(), 7);
        assert_eq!(f.pool.cursors().write(), 7);
        assert_eq!(f.hw.live_mappings(), 7);

        assert_eq!(consume(&f, 3), 3);
        for bid in 0..3 {
            let buf = f.pool.take(bid).unwrap();
            assert_eq!(&buf.as_slice()[..64], &[0xab; 64][..]);
        }
        assert_eq!(f.pool.recycle(3).unwrap(), 3);
        assert_eq!(f.pool.cursors().release(), 3);
        assert_eq!(f.pool.cursors().write(), 2);
        assert_eq!(f.pool.cursors().outstanding(), 7);
        assert_eq!(f.hw.live_mappings(), 7);

        f.doorbell.flush().unwrap();
        assert_eq!(f.hw.doorbells(), vec![(RingId::bat(0), 7), (RingId::bat(0), 3)]);
    }

    #[test]
    fn test_refill_full_ring_is_low_memory() {
        let f = fixture(8, Arc::new(HeapAllocator));
        assert_eq!(f.pool.refill(0).unwrap(), 0);
        assert_eq!(f.pool.refill(100).unwrap(), 7);
        assert_eq!(f.pool.refill(1), Err(DpmaifError::LowMemory));
        assert_eq!(f.pool.replenish().unwrap(), 0);
    }

    #[test]
    fn test_refill_out_of_memory() {
        let alloc = Arc::new(CappedAllocator::new(3));
        let f = fixture(8, alloc.clone());
        assert_eq!(f.pool.refill(5).unwrap(), 3);
        assert_eq!(f.pool.refill(1), Err(DpmaifError::OutOfMemory));
        alloc.grant(1);
        assert_eq!(f.pool.refill(4).unwrap(), 1);
    }

    #[test]
    fn test_map_failure_publishes_partial_fill() {
        let f = fixture(8, Arc::new(HeapAllocator));
        assert_eq!(f.pool.refill(2).unwrap(), 2);
        f.hw.fail_next_maps(1);
        let err = f.pool.refill(3).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(f.pool.cursors().write(), 2);
        assert_eq!(f.hw.live_mappings(), 2);
    }

    #[test]
    fn test_recycle_stops_at_gap() {
        let f = fixture(8, Arc::new(HeapAllocator));
        f.pool.refill(7).unwrap();
        assert_eq!(consume(&f, 3), 3);
        f.pool.take(0).unwrap();
        f.pool.take(2).unwrap();
        assert_eq!(f.pool.recycle(3).unwrap(), 1);
        assert_eq!(f.pool.cursors().release(), 1);
        assert!(f.pool.is_consumed(2));
        f.pool.take(1).unwrap();
        assert_eq!(f.pool.recycle(8).unwrap(), 2);
        assert_eq!(f.pool.cursors().release(), 3);
    }

    #[test]
    fn test_gap_keeps_unrecycled_slots_pending() {
        let f = fixture(8, Arc::new(HeapAllocator));
        f.pool.refill(7).unwrap();
        assert_eq!(consume(&f, 3), 3);
        f.pool.take(0).unwrap();
        f.pool.take(2).unwrap();
        assert_eq!(f.pool.pending.load(Ordering::Acquire), 2);
        assert_eq!(f.pool.recycle(8).unwrap(), 1);
        // slot 2 is still waiting behind the gap
        assert_eq!(f.pool.pending.load(Ordering::Acquire), 1);
        f.pool.take(1).unwrap();
        assert_eq!(f.pool.pending.load(Ordering::Acquire), 2);
        assert_eq!(f.pool.recycle(8).unwrap(), 2);
        assert_eq!(f.pool.pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_concurrent_refills_share_the_ring() {
        for _ in 0..50 {
            let f = fixture(1024, Arc::new(HeapAllocator));
            std::thread::scope(|s| {
                s.spawn(|| f.pool.service().unwrap());
                s.spawn(|| f.pool.replenish().unwrap());
            });
            assert_eq!(f.pool.cursors().write(), 1023);
            assert_eq!(f.pool.cursors().outstanding(), 1023);
            assert_eq!(f.hw.live_mappings(), 1023);
            assert_eq!(f.doorbell.pending(RingId::bat(0)), 1023);
            f.doorbell.flush().unwrap();
            assert_eq!(f.hw.credits(RingId::bat(0)), Some(1023));
        }
    }

    #[test]
    fn test_device_read_outside_lent_span_is_fatal() {
        let f = fixture(8, Arc::new(HeapAllocator));
        f.pool.refill(3).unwrap();
        f.hw.force_index(RingId::bat(0), IndexSide::Read, Some(6));
        let err = f.pool.recycle(8).unwrap_err();
        assert_eq!(
            err,
            DpmaifError::RingIndex {
                ring: RingId::bat(0),
                side: IndexSide::Read,
                index: 6
            }
        );
        assert!(err.is_fatal());
        assert_eq!(f.pool.cursors().read(), 0);
        assert!(f.pool.service().is_err());
    }

    #[test]
    fn test_take_rejects_bad_ids() {
        let f = fixture(8, Arc::new(HeapAllocator));
        f.pool.refill(3).unwrap();
        consume(&f, 1);
        assert!(matches!(f.pool.take(5), Err(DpmaifError::InvalidBufferId { bid: 5, .. })));
        assert!(matches!(f.pool.take(100), Err(DpmaifError::InvalidBufferId { .. })));
        f.pool.take(0).unwrap();
        assert!(matches!(f.pool.take(0), Err(DpmaifError::InvalidBufferId { bid: 0, frag: false, .. })));
    }

    #[test]
    fn test_drain_releases_everything() {
        let f = fixture(8, Arc::new(HeapAllocator));
        f.pool.refill(7).unwrap();
        consume(&f, 2);
        f.pool.take(0).unwrap();
        assert_eq!(f.pool.drain(), 6);
        assert_eq!(f.hw.live_mappings(), 0);
        assert_eq!(f.pool.cursors().write(), 0);
        assert_eq!(f.pool.slot_state(3), BufferOwnership::Free);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Refill(u32),
        Consume(u32),
        Recycle(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..10).prop_map(Op::Refill),
            (0u32..6).prop_map(Op::Consume),
            (0u32..10).prop_map(Op::Recycle),
        ]
    }

    proptest! {
        #[test]
        fn prop_refill_recycle_keeps_cursors_ordered(ops in proptest::collection::vec(op(), 1..40)) {
            let f = fixture(8, Arc::new(HeapAllocator));
            let cap = 8;
            let mut next_bid = 0u32;
            let mut taken = 0u32;
            for op in ops {
                match op {
                    Op::Refill(n) => { let _ = f.pool.refill(n); }
                    Op::Consume(n) => {
                        let got = consume(&f, n);
                        for _ in 0..got {
                            f.pool.take(next_bid as u16).unwrap();
                            next_bid = (next_bid + 1) % cap;
                            taken += 1;
                        }
                    }
                    Op::Recycle(n) => {
                        taken -= f.pool.recycle(n).unwrap();
                    }
                }
                let c = f.pool.cursors();
                prop_assert!(c.is_ordered());
                prop_assert_eq!(c.writable() + c.outstanding(), cap - 1);
                prop_assert_eq!(f.hw.live_mappings() as u32, c.outstanding() - taken);
            }
        }
    }
}
