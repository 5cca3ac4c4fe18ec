//! PIT consumer of one downlink queue.
//!
//! # Poll pass
//! 1. Sync the PIT write cursor from hardware
//! 2. For each entry up to the budget: validate (sequence, buffer id,
//!    length) with bounded re-reads, decode, feed reassembly
//! 3. Hand finished packets to aggregation, then to the stack
//! 4. Release consumed PIT entries to the device in batches
//!
//! Only one context polls a queue at a time; a second caller returns
//! immediately with nothing done.

use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;

use super::reassembly::{Outcome, Reassembly};
use crate::bat::BatPool;
use crate::doorbell::DoorbellBatcher;
use crate::error::{DpmaifError, Result};
use crate::hal::DpmaifHw;
use crate::ring::{self, CoherentRing, RingCursors};
use crate::stack::NetStack;
use crate::stats::{bump, DpmaifStats};
use crate::types::{IndexSide, RingId, RxPacket};
use crate::wire::pit::{next_seq, PitEntry, PitPayload, PIT_ENTRY_WORDS};

#[cfg(feature = "aggregation")]
use super::aggregate::Aggregator;

/// Tunables of one downlink queue.
#[derive(Debug, Clone)]
pub struct DlConfig {
    pub pit_entries: u32,
    pub release_threshold: u32,
    pub seq_retry_limit: u32,
    pub seq_retry_delay: Duration,
    pub aggregation: bool,
    pub max_aggregate_size: usize,
}

/// Poll-owned state. Locked for the whole poll pass.
struct RxState {
    expected_seq: u16,
    reassembly: Reassembly,
    #[cfg(feature = "aggregation")]
    aggregator: Option<Aggregator>,
    ready: Vec<RxPacket>,
}

/// One downlink queue: a PIT ring and the two buffer pools it references.
pub struct DlQueue {
    queue: u8,
    pit_id: RingId,
    pit: Arc<CoherentRing>,
    cursors: RingCursors,
    bat: Arc<BatPool>,
    frag: Arc<BatPool>,
    rx: Mutex<RxState>,
    cfg: DlConfig,
    hw: Arc<dyn DpmaifHw>,
    doorbell: Arc<DoorbellBatcher>,
    stack: Arc<dyn NetStack>,
    stats: Arc<DpmaifStats>,
}

impl DlQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: u8,
        cfg: DlConfig,
        bat: Arc<BatPool>,
        frag: Arc<BatPool>,
        hw: Arc<dyn DpmaifHw>,
        doorbell: Arc<DoorbellBatcher>,
        stack: Arc<dyn NetStack>,
        stats: Arc<DpmaifStats>,
    ) -> Result<Self> {
        let pit_id = RingId::pit(queue);
        let pit = hw.alloc_ring(pit_id, cfg.pit_entries, PIT_ENTRY_WORDS)?;
        Ok(Self {
            queue,
            pit_id,
            pit,
            cursors: RingCursors::new(cfg.pit_entries),
            bat,
            frag,
            rx: Mutex::new(RxState::new(queue, &cfg)),
            cfg,
            hw,
            doorbell,
            stack,
            stats,
        })
    }

    pub fn queue(&self) -> u8 {
        self.queue
    }

    pub fn bat(&self) -> &Arc<BatPool> {
        &self.bat
    }

    pub fn frag(&self) -> &Arc<BatPool> {
        &self.frag
    }

    pub fn cursors(&self) -> &RingCursors {
        &self.cursors
    }

    /// Process up to `budget` PIT entries.
    ///
    /// # Returns
    /// Entries consumed. Zero when another context is already polling.
    ///
    /// # Errors
    /// Sequence faults and malformed entries that survive their re-reads,
    /// unexpected message entries, a device write cursor that laps the
    /// release cursor and hardware failures. All are fatal.
    pub fn poll(&self, budget: u32) -> Result<u32> {
        let Some(mut rx) = self.rx.try_lock() else {
            log::trace!(target: "dpmaif::dl", "q{}: poll already running", self.queue);
            return Ok(0);
        };
        let rx = &mut *rx;

        let hw_write = self.hw.ring_index(self.pit_id, IndexSide::Write)?;
        if !self.cursors.sync_write(hw_write) {
            log::error!(
                target: "dpmaif::dl",
                "q{}: PIT write {} laps release {}",
                self.queue, hw_write, self.cursors.release()
            );
            return Err(DpmaifError::RingIndex {
                ring: self.pit_id,
                side: IndexSide::Write,
                index: hw_write,
            });
        }

        let cap = self.cursors.capacity();
        let mut consumed = 0;
        let result = loop {
            if consumed >= budget || self.cursors.readable() == 0 {
                break Ok(());
            }
            let idx = self.cursors.read();
            let words = match self.read_valid(idx, rx.expected_seq) {
                Ok(words) => words,
                Err(e) => break Err(e),
            };
            rx.expected_seq = next_seq(rx.expected_seq);
            self.cursors.set_read(ring::advance(idx, 1, cap));
            consumed += 1;

            if let Err(e) = self.handle_entry(rx, PitEntry::decode(words)) {
                break Err(e);
            }
            self.release_pit(false);
        };

        self.handoff(rx);
        result?;
        if self.cursors.readable() == 0 {
            self.release_pit(true);
        }
        Ok(consumed)
    }

    fn handle_entry(&self, rx: &mut RxState, entry: PitEntry) -> Result<()> {
        let outcome = match entry {
            PitEntry::Message(m) => {
                rx.reassembly.on_message(&m)?;
                return Ok(());
            }
            PitEntry::Payload(p) => {
                let pool = if p.frag { &self.frag } else { &self.bat };
                let buf = pool.take(p.buffer_id)?;
                let start = p.header_offset as usize;
                let end = start + p.data_len as usize;
                if end > buf.capacity() {
                    log::warn!(
                        target: "dpmaif::dl",
                        "q{}: segment {}..{} overruns {} byte buffer",
                        self.queue, start, end, buf.capacity()
                    );
                    rx.reassembly.poison(!p.cont)
                } else if p.frag {
                    rx.reassembly.on_fragment(&buf.as_slice()[start..end], !p.cont)
                } else {
                    let mut data = buf.into_vec(end);
                    if start > 0 {
                        data.drain(..start);
                    }
                    rx.reassembly.on_payload(data, !p.cont)
                }
            }
        };

        match outcome {
            Outcome::Pending => {}
            Outcome::Packet(pkt) => {
                bump(&self.stats.rx_packets, 1);
                bump(&self.stats.rx_bytes, pkt.len() as u64);
                self.aggregate(rx, pkt);
            }
            Outcome::Dropped { bytes } => {
                log::trace!(target: "dpmaif::dl", "q{}: device dropped {} bytes", self.queue, bytes);
                bump(&self.stats.rx_dropped, 1);
            }
            Outcome::Discarded => bump(&self.stats.rx_errors, 1),
        }
        Ok(())
    }

    #[cfg(feature = "aggregation")]
    fn aggregate(&self, rx: &mut RxState, pkt: RxPacket) {
        match rx.aggregator.as_mut() {
            Some(agg) => {
                if agg.push(pkt, &mut rx.ready) {
                    bump(&self.stats.rx_aggregated, 1);
                }
            }
            None => rx.ready.push(pkt),
        }
    }

    #[cfg(not(feature = "aggregation"))]
    fn aggregate(&self, rx: &mut RxState, pkt: RxPacket) {
        rx.ready.push(pkt);
    }

    /// Flush aggregation and deliver everything ready.
    fn handoff(&self, rx: &mut RxState) {
        #[cfg(feature = "aggregation")]
        if let Some(agg) = rx.aggregator.as_mut() {
            agg.flush(&mut rx.ready);
        }
        for pkt in rx.ready.drain(..) {
            self.stack.deliver(pkt);
        }
    }

    /// Read entry `idx`, re-reading while it fails validation.
    fn read_valid(&self, idx: u32, expected: u16) -> Result<[u32; PIT_ENTRY_WORDS]> {
        let mut attempt = 0;
        loop {
            let words = self.pit.read::<PIT_ENTRY_WORDS>(idx);
            let err = match self.validate(&words, expected) {
                Ok(()) => return Ok(words),
                Err(e) => e,
            };
            if attempt >= self.cfg.seq_retry_limit {
                log::warn!(target: "dpmaif::dl", "q{}: entry {} invalid after {} re-reads: {}", self.queue, idx, attempt, err);
                if matches!(err, DpmaifError::PitSequence { .. }) {
                    bump(&self.stats.seq_faults, 1);
                } else {
                    bump(&self.stats.rx_errors, 1);
                }
                return Err(err);
            }
            attempt += 1;
            spin_wait(self.cfg.seq_retry_delay);
        }
    }

    fn validate(&self, words: &[u32; PIT_ENTRY_WORDS], expected: u16) -> Result<()> {
        let found = PitEntry::seq_of(words);
        if found != expected {
            return Err(DpmaifError::PitSequence {
                queue: self.queue,
                expected,
                found,
            });
        }
        if let PitEntry::Payload(p) = PitEntry::decode(*words) {
            self.validate_payload(&p)?;
        }
        Ok(())
    }

    fn validate_payload(&self, p: &PitPayload) -> Result<()> {
        if p.data_len == 0 {
            return Err(DpmaifError::ZeroLength { queue: self.queue });
        }
        let pool = if p.frag { &self.frag } else { &self.bat };
        let bid = p.buffer_id as u32;
        if bid >= pool.cursors().capacity() || !pool.cursors().in_flight(bid) || pool.is_consumed(bid) {
            return Err(DpmaifError::InvalidBufferId {
                queue: self.queue,
                frag: p.frag,
                bid: p.buffer_id,
            });
        }
        Ok(())
    }

    /// Hand consumed PIT entries back to the device.
    ///
    /// Batches until `release_threshold` entries are waiting unless `all`.
    fn release_pit(&self, all: bool) {
        let n = self.cursors.releasable();
        if n == 0 || (!all && n < self.cfg.release_threshold) {
            return;
        }
        self.cursors
            .set_release(ring::advance(self.cursors.release(), n, self.cursors.capacity()));
        self.doorbell.add(self.pit_id, n);
    }

    /// Drop partial reassembly and zero the cursors.
    pub fn reset(&self) {
        let mut rx = self.rx.lock();
        *rx = RxState::new(self.queue, &self.cfg);
        self.cursors.reset();
        self.pit.clear();
    }
}

impl RxState {
    fn new(queue: u8, cfg: &DlConfig) -> Self {
        #[cfg(not(feature = "aggregation"))]
        let _ = cfg;
        Self {
            expected_seq: 0,
            reassembly: Reassembly::new(queue),
            #[cfg(feature = "aggregation")]
            aggregator: cfg.aggregation.then(|| Aggregator::new(cfg.max_aggregate_size)),
            ready: Vec::new(),
        }
    }
}

impl Drop for DlQueue {
    fn drop(&mut self) {
        self.hw.free_ring(self.pit_id);
    }
}

impl core::fmt::Debug for DlQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DlQueue")
            .field("queue", &self.queue)
            .field("cursors", &self.cursors)
            .finish()
    }
}

fn spin_wait(delay: Duration) {
    let start = Instant::now();
    while start.elapsed() < delay {
        core::hint::spin_loop();
    }
}
