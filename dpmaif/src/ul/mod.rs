//! Uplink pipeline.
//!
//! ```text
//!   enqueue(pkt, class) ──> VirtualQueue[class] ──(worker)──> DrbRing[vq % rings]
//!                                                                │
//!   tx_complete(pkt) <──── complete(ring) <── UL done interrupt ─┘
//! ```
//!
//! Queue `vq` feeds ring `vq % ul_rings`; ring `r` belongs to worker
//! `r % tx_workers`.

pub mod drb;
pub mod vq;
pub mod worker;

pub use drb::{Completion, Credits, DrbRing};
pub use vq::{EnqueueError, VirtualQueue};
pub use worker::{Pass, TxWorker};

use std::sync::Arc;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::DpmaifConfig;
use crate::control::LinkState;
use crate::doorbell::DoorbellBatcher;
use crate::error::{DpmaifError, Result};
use crate::hal::DpmaifHw;
use crate::stack::NetStack;
use crate::stats::{bump, DpmaifStats};
use crate::types::TxPacket;
use crate::wire::drb::MAX_DRB_LEN;

pub struct Uplink {
    queues: Vec<Arc<VirtualQueue>>,
    rings: Vec<Arc<DrbRing>>,
    workers: Vec<Arc<TxWorker>>,
    accepting: AtomicBool,
    stack: Arc<dyn NetStack>,
    stats: Arc<DpmaifStats>,
}

impl Uplink {
    /// Allocate the DRB rings and wire queues to rings and workers.
    pub fn new(
        cfg: &DpmaifConfig,
        hw: Arc<dyn DpmaifHw>,
        doorbell: Arc<DoorbellBatcher>,
        stack: Arc<dyn NetStack>,
        stats: Arc<DpmaifStats>,
    ) -> Result<Self> {
        let rings = (0..cfg.ul_rings)
            .map(|r| {
                DrbRing::new(
                    r,
                    cfg.drb_entries,
                    cfg.tx_resume_threshold,
                    hw.clone(),
                    stack.clone(),
                    stats.clone(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        let queues: Vec<_> = (0..cfg.virtual_queues)
            .map(|vq| Arc::new(VirtualQueue::new(vq, cfg.vq_ring(vq), cfg.vq_depth)))
            .collect();

        let workers = (0..cfg.tx_workers)
            .map(|w| {
                let owned_rings: Vec<_> = rings
                    .iter()
                    .filter(|r| cfg.ring_worker(r.id().queue) == w)
                    .cloned()
                    .collect();
                let owned_queues: Vec<_> = queues
                    .iter()
                    .filter(|q| cfg.vq_worker(q.id()) == w)
                    .cloned()
                    .collect();
                log::debug!(
                    target: "dpmaif::ul",
                    "worker {}: {} rings, {} queues",
                    w, owned_rings.len(), owned_queues.len()
                );
                Arc::new(TxWorker::new(
                    w,
                    owned_queues,
                    owned_rings,
                    cfg.tx_budget_per_iter,
                    cfg.worker_idle_sleep,
                    doorbell.clone(),
                    stack.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        Ok(Self {
            queues,
            rings,
            workers,
            accepting: AtomicBool::new(false),
            stack,
            stats,
        })
    }

    pub fn queues(&self) -> &[Arc<VirtualQueue>] {
        &self.queues
    }

    pub fn rings(&self) -> &[Arc<DrbRing>] {
        &self.rings
    }

    pub fn workers(&self) -> &[Arc<TxWorker>] {
        &self.workers
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn set_accepting(&self, on: bool) {
        self.accepting.store(on, Ordering::Release);
    }

    fn check_packet(&self, pkt: &TxPacket) -> Result<()> {
        if pkt.frags.is_empty() {
            return Err(DpmaifError::BadPacket("no fragments"));
        }
        if pkt.frags.iter().any(|f| f.is_empty()) {
            return Err(DpmaifError::BadPacket("empty fragment"));
        }
        if pkt.len() > MAX_DRB_LEN {
            return Err(DpmaifError::BadPacket("packet exceeds descriptor length"));
        }
        let max_slots = self.rings.first().map_or(0, |r| r.cursors().capacity() - 1);
        if pkt.descriptors_needed() > max_slots {
            return Err(DpmaifError::BadPacket("more fragments than ring slots"));
        }
        Ok(())
    }

    /// Queue `pkt` on virtual queue `vq`.
    ///
    /// # Errors
    /// - `NotReady` while the data path is disabled
    /// - `InvalidQueue` for an out of range queue
    /// - `BadPacket` for packets no ring can carry
    /// - `QueueFull` when the queue is at depth; the stack is told to stop
    ///   feeding that queue until `tx_resumed`
    ///
    /// The packet is handed back inside the error in every case.
    pub fn enqueue(&self, pkt: TxPacket, vq: usize) -> core::result::Result<(), EnqueueError> {
        if !self.is_accepting() {
            return Err(EnqueueError::new(pkt, DpmaifError::NotReady(LinkState::Off)));
        }
        let Some(queue) = self.queues.get(vq) else {
            return Err(EnqueueError::new(pkt, DpmaifError::InvalidQueue(vq)));
        };
        if let Err(e) = self.check_packet(&pkt) {
            bump(&self.stats.tx_dropped, 1);
            return Err(EnqueueError::new(pkt, e));
        }
        if let Err(pkt) = queue.push(pkt) {
            bump(&self.stats.tx_busy, 1);
            if !queue.set_congested() {
                log::debug!(target: "dpmaif::ul", "vq{}: full, congested", vq);
                self.stack.tx_congested(vq);
            }
            self.wake_owner(queue.ring());
            return Err(EnqueueError::new(pkt, DpmaifError::QueueFull { vq }));
        }
        self.wake_owner(queue.ring());
        Ok(())
    }

    fn wake_owner(&self, ring: u8) {
        if let Some(w) = self.workers.iter().find(|w| w.owns_ring(ring)) {
            w.waker().wake();
        }
    }

    /// Reclaim completed descriptors of DRB ring `ring`.
    ///
    /// When the ring leaves the lack state the stack is told every queue
    /// waiting on it may resume, and the owning worker is woken.
    pub fn complete(&self, ring: u8) -> Result<Completion> {
        let drb = self
            .rings
            .get(ring as usize)
            .ok_or(DpmaifError::InvalidQueue(ring as usize))?;
        let done = drb.complete()?;
        if done.resumed {
            for q in self.queues.iter().filter(|q| q.ring() == ring && !q.is_empty()) {
                self.stack.tx_resumed(q.id());
            }
            self.wake_owner(ring);
        }
        Ok(done)
    }

    /// Drop every queued and in-flight packet.
    ///
    /// # Returns
    /// Packets discarded.
    pub fn drain(&self) -> u32 {
        self.set_accepting(false);
        let queued: u32 = self.queues.iter().map(|q| q.drain().len() as u32).sum();
        bump(&self.stats.tx_dropped, queued as u64);
        let in_flight: u32 = self.rings.iter().map(|r| r.drain()).sum();
        if queued + in_flight > 0 {
            log::info!(
                target: "dpmaif::ul",
                "dropped {} queued and {} in-flight packets",
                queued, in_flight
            );
        }
        queued + in_flight
    }
}

impl core::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Uplink")
            .field("rings", &self.rings)
            .field("workers", &self.workers)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
