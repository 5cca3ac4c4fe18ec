//! Uplink service worker.
//!
//! Each worker owns a disjoint set of DRB rings and every virtual queue
//! mapped onto them, so queue pops and ring fills never race another
//! worker. One pass:
//!
//! 1. Visit owned queues round-robin, starting one past last pass's start
//! 2. Skip queues whose ring is in the lack state
//! 3. Move up to the per-queue budget of packets into the ring
//! 4. Add the filled descriptor counts to the doorbell batcher, once per
//!    ring, and request a flush
//!
//! A worker sleeps only between passes, never with a packet half written.

use std::sync::Arc;
use std::time::Duration;

use core::sync::atomic::{AtomicUsize, Ordering};

use super::drb::DrbRing;
use super::vq::VirtualQueue;
use crate::doorbell::DoorbellBatcher;
use crate::error::{DpmaifError, Result};
use crate::stack::NetStack;
use crate::stats::{bump, DpmaifStats};
use crate::task::{TaskContext, TaskWaker};

/// Summary of one service pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pass {
    /// Packets written to rings.
    pub sent: u32,
    /// Descriptor slots handed to the doorbell batcher.
    pub descriptors: u32,
    /// Non-empty queues skipped because their ring lacks space.
    pub blocked: u32,
}

pub struct TxWorker {
    id: usize,
    queues: Vec<Arc<VirtualQueue>>,
    rings: Vec<Arc<DrbRing>>,
    budget: usize,
    idle_sleep: Duration,
    next: AtomicUsize,
    doorbell: Arc<DoorbellBatcher>,
    stack: Arc<dyn NetStack>,
    stats: Arc<DpmaifStats>,
    waker: TaskWaker,
}

impl TxWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queues: Vec<Arc<VirtualQueue>>,
        rings: Vec<Arc<DrbRing>>,
        budget: usize,
        idle_sleep: Duration,
        doorbell: Arc<DoorbellBatcher>,
        stack: Arc<dyn NetStack>,
        stats: Arc<DpmaifStats>,
    ) -> Self {
        Self {
            id,
            queues,
            rings,
            budget,
            idle_sleep,
            next: AtomicUsize::new(0),
            doorbell,
            stack,
            stats,
            waker: TaskWaker::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn waker(&self) -> &TaskWaker {
        &self.waker
    }

    pub fn owns_ring(&self, ring: u8) -> bool {
        self.rings.iter().any(|r| r.id().queue == ring)
    }

    fn ring_slot(&self, ring: u8) -> Option<usize> {
        self.rings.iter().position(|r| r.id().queue == ring)
    }

    /// Run one service pass.
    ///
    /// # Errors
    /// A fatal fill error. The packet is back at the head of its queue and
    /// descriptors already written this pass are still announced.
    pub fn run_once(&self) -> Result<Pass> {
        let mut pass = Pass::default();
        let n = self.queues.len();
        if n == 0 {
            return Ok(pass);
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let mut filled = vec![0u32; self.rings.len()];

        let mut result = Ok(());
        for k in 0..n {
            let vq = &self.queues[(start + k) % n];
            let Some(slot) = self.ring_slot(vq.ring()) else {
                log::warn!(target: "dpmaif::ul", "worker {}: vq{} maps to foreign ring", self.id, vq.id());
                continue;
            };
            let ring = &self.rings[slot];
            if ring.is_lacking() && !self.resume_ring(slot) {
                if !vq.is_empty() {
                    pass.blocked += 1;
                }
                continue;
            }

            if let Err(e) = self.drain_queue(vq, ring, &mut filled[slot], &mut pass) {
                result = Err(e);
                break;
            }
            if vq.try_uncongest() {
                log::debug!(target: "dpmaif::ul", "vq{}: accepting again", vq.id());
                self.stack.tx_resumed(vq.id());
            }
        }

        for (ring, count) in self.rings.iter().zip(filled) {
            if count > 0 {
                self.doorbell.add(ring.id(), count);
                pass.descriptors += count;
            }
        }
        if pass.descriptors > 0 {
            self.doorbell.request();
        }
        result.map(|()| pass)
    }

    fn drain_queue(
        &self,
        vq: &VirtualQueue,
        ring: &DrbRing,
        filled: &mut u32,
        pass: &mut Pass,
    ) -> Result<()> {
        for _ in 0..self.budget {
            let Some(need) = vq.head_descriptors() else {
                return Ok(());
            };
            if ring.budget() < need {
                self.enter_lack(ring, need);
                return Ok(());
            }
            let Some(pkt) = vq.pop() else {
                return Ok(());
            };
            match ring.fill(pkt) {
                Ok(used) => {
                    *filled += used;
                    pass.sent += 1;
                }
                Err((pkt, DpmaifError::RingFull)) => {
                    vq.requeue(pkt);
                    self.enter_lack(ring, need);
                    return Ok(());
                }
                Err((pkt, e)) => {
                    vq.requeue(pkt);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn enter_lack(&self, ring: &DrbRing, need: u32) {
        if ring.set_lack() {
            bump(&self.stats.tx_busy, 1);
            log::debug!(
                target: "dpmaif::ul",
                "{}: lack, {} free, {} needed",
                ring.id(), ring.budget(), need
            );
        }
    }

    /// Lift a lack that completions already cleared the way for.
    fn resume_ring(&self, slot: usize) -> bool {
        let ring = &self.rings[slot];
        if !ring.try_resume() {
            return false;
        }
        log::trace!(target: "dpmaif::ul", "{}: resumed by worker {}", ring.id(), self.id);
        true
    }

    /// Worker task body.
    pub fn run(&self, ctx: &TaskContext) -> Result<()> {
        while !ctx.should_stop() {
            let pass = self.run_once()?;
            if pass.sent > 0 {
                continue;
            }
            if pass.blocked > 0 {
                log::trace!(
                    target: "dpmaif::ul",
                    "worker {}: {} queues blocked on ring space",
                    self.id, pass.blocked
                );
            }
            ctx.park_timeout(self.idle_sleep);
        }
        Ok(())
    }
}

impl core::fmt::Debug for TxWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TxWorker")
            .field("id", &self.id)
            .field("queues", &self.queues.iter().map(|q| q.id()).collect::<Vec<_>>())
            .field("rings", &self.rings.iter().map(|r| r.id()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DOORBELL_DELAYS;
    use crate::hal::LoopbackHw;
    use crate::stack::testing::RecordingStack;
    use crate::types::{RingId, TxPacket};

    struct Fixture {
        hw: Arc<LoopbackHw>,
        stack: Arc<RecordingStack>,
        stats: Arc<DpmaifStats>,
        doorbell: Arc<DoorbellBatcher>,
        queues: Vec<Arc<VirtualQueue>>,
        rings: Vec<Arc<DrbRing>>,
        worker: TxWorker,
    }

    /// Two rings, queues 0/2 on ring 0 and 1/3 on ring 1.
    fn fixture(entries: u32, budget: usize) -> Fixture {
        let hw = Arc::new(LoopbackHw::new());
        let stack = Arc::new(RecordingStack::default());
        let stats = Arc::new(DpmaifStats::new());
        let doorbell = Arc::new(DoorbellBatcher::new(
            hw.clone(),
            stats.clone(),
            [RingId::drb(0), RingId::drb(1)],
            DEFAULT_DOORBELL_DELAYS.to_vec(),
        ));
        let rings: Vec<_> = (0..2)
            .map(|r| Arc::new(DrbRing::new(r, entries, 4, hw.clone(), stack.clone(), stats.clone()).unwrap()))
            .collect();
        let queues: Vec<_> = (0..4).map(|q| Arc::new(VirtualQueue::new(q, (q % 2) as u8, 8))).collect();
        let worker = TxWorker::new(
            0,
            queues.clone(),
            rings.clone(),
            budget,
            Duration::from_millis(1),
            doorbell.clone(),
            stack.clone(),
            stats.clone(),
        );
        Fixture {
            hw,
            stack,
            stats,
            doorbell,
            queues,
            rings,
            worker,
        }
    }

    #[test]
    fn test_one_doorbell_per_ring_per_pass() {
        let f = fixture(32, 8);
        for i in 0..3 {
            f.queues[0].push(TxPacket::new(0, vec![i; 10])).unwrap();
            f.queues[2].push(TxPacket::new(0, vec![i; 10])).unwrap();
        }
        f.queues[1].push(TxPacket::new(1, vec![9; 10])).unwrap();

        let pass = f.worker.run_once().unwrap();
        assert_eq!(pass.sent, 7);
        assert_eq!(pass.descriptors, 14);
        assert_eq!(f.doorbell.pending(RingId::drb(0)), 12);
        assert_eq!(f.doorbell.pending(RingId::drb(1)), 2);

        f.doorbell.flush().unwrap();
        assert_eq!(f.hw.take_doorbells(), vec![(RingId::drb(0), 12), (RingId::drb(1), 2)]);
    }

    #[test]
    fn test_budget_limits_each_queue() {
        let f = fixture(64, 2);
        for i in 0..5 {
            f.queues[0].push(TxPacket::new(0, vec![i; 4])).unwrap();
        }
        assert_eq!(f.worker.run_once().unwrap().sent, 2);
        assert_eq!(f.queues[0].len(), 3);
    }

    #[test]
    fn test_round_robin_start_rotates() {
        let f = fixture(8, 1);
        // ring 0 fits three single-fragment packets
        for q in [0, 2] {
            for i in 0..4 {
                f.queues[q].push(TxPacket::new(0, vec![i; 4])).unwrap();
            }
        }
        f.worker.run_once().unwrap();
        f.worker.run_once().unwrap();
        f.worker.run_once().unwrap();
        // both queues got served even though ring 0 filled up
        assert!(f.queues[0].len() < 4);
        assert!(f.queues[2].len() < 4);
    }

    #[test]
    fn test_lack_blocks_then_resumes() {
        let f = fixture(8, 8);
        for i in 0..5 {
            f.queues[0].push(TxPacket::new(0, vec![i; 4])).unwrap();
        }
        let pass = f.worker.run_once().unwrap();
        assert_eq!(pass.sent, 3);
        assert!(f.rings[0].is_lacking());
        assert_eq!(f.stats.snapshot().tx_busy, 1);

        let pass = f.worker.run_once().unwrap();
        assert_eq!(pass.sent, 0);
        assert_eq!(pass.blocked, 1);

        f.doorbell.flush().unwrap();
        assert_eq!(f.hw.transmit(0, 8).unwrap().len(), 3);
        let done = f.rings[0].complete().unwrap();
        assert!(done.resumed);

        let pass = f.worker.run_once().unwrap();
        assert_eq!(pass.sent, 2);
        assert_eq!(f.stack.tx_done.lock().len(), 3);
    }

    #[test]
    fn test_fatal_fill_requeues_packet() {
        let f = fixture(16, 8);
        f.queues[1].push(TxPacket::new(1, vec![1; 4])).unwrap();
        f.hw.fail_next_maps(1);
        let err = f.worker.run_once().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(f.queues[1].len(), 1);
        assert_eq!(f.hw.live_mappings(), 0);
    }

    #[test]
    fn test_uncongest_notifies_stack() {
        let f = fixture(64, 8);
        for i in 0..8 {
            f.queues[3].push(TxPacket::new(0, vec![i; 4])).unwrap();
        }
        assert!(!f.queues[3].set_congested());
        f.worker.run_once().unwrap();
        assert_eq!(f.stack.resumed.lock().as_slice(), &[3]);
        assert!(!f.queues[3].is_congested());
    }
}
