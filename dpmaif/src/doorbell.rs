//! Doorbell batching.
//!
//! Producers (BAT refill, DRB fill, PIT release) never write the doorbell
//! register themselves. They add to a per-ring pending counter; one task
//! per device flushes all rings in a single pass, either on request or
//! after a delay picked from the throughput table.
//!
//! # Counter protocol
//! ```text
//!   producer:  pending.fetch_add(n)        (AcqRel)
//!   flusher:   n = pending.swap(0)          (AcqRel)
//!              hw.doorbell(ring, n)
//!              on error: pending.fetch_add(n)
//! ```
//! An add that races the swap lands either in this flush or the next one,
//! never in neither.

use std::sync::Arc;
use std::time::{Duration, Instant};

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::DoorbellDelay;
use crate::error::Result;
use crate::hal::{DpmaifHw, HwError};
use crate::stats::{bump, DpmaifStats};
use crate::task::{TaskContext, TaskWaker};
use crate::types::RingId;

/// Window over which the flush rate is measured.
const RATE_WINDOW: Duration = Duration::from_millis(1);

/// Pick the delay for an observed rate.
///
/// Rows are checked in order; the last row is the fallback.
pub fn select_delay(table: &[DoorbellDelay], rate_per_ms: u64) -> Duration {
    table
        .iter()
        .find(|row| rate_per_ms >= row.min_rate_per_ms as u64)
        .or(table.last())
        .map_or(RATE_WINDOW, |row| row.delay)
}

/// Flushed units per millisecond over a sliding window.
#[derive(Debug)]
struct RateMeter {
    window_start: Instant,
    units: u64,
    rate_per_ms: u64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            units: 0,
            rate_per_ms: 0,
        }
    }

    fn record(&mut self, units: u32, now: Instant) -> u64 {
        self.units += units as u64;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= RATE_WINDOW {
            let micros = elapsed.as_micros().max(1) as u64;
            self.rate_per_ms = self.units * 1000 / micros;
            self.units = 0;
            self.window_start = now;
        }
        self.rate_per_ms
    }
}

/// Per-device doorbell coalescer.
pub struct DoorbellBatcher {
    hw: Arc<dyn DpmaifHw>,
    stats: Arc<DpmaifStats>,
    rings: Vec<(RingId, AtomicU32)>,
    delays: Vec<DoorbellDelay>,
    urgent: AtomicBool,
    waker: TaskWaker,
}

impl DoorbellBatcher {
    pub fn new(
        hw: Arc<dyn DpmaifHw>,
        stats: Arc<DpmaifStats>,
        rings: impl IntoIterator<Item = RingId>,
        delays: Vec<DoorbellDelay>,
    ) -> Self {
        Self {
            hw,
            stats,
            rings: rings.into_iter().map(|r| (r, AtomicU32::new(0))).collect(),
            delays,
            urgent: AtomicBool::new(false),
            waker: TaskWaker::new(),
        }
    }

    fn counter(&self, ring: RingId) -> Option<&AtomicU32> {
        self.rings.iter().find(|(id, _)| *id == ring).map(|(_, c)| c)
    }

    /// Queue `count` units for `ring`.
    pub fn add(&self, ring: RingId, count: u32) {
        if count == 0 {
            return;
        }
        match self.counter(ring) {
            Some(c) => {
                c.fetch_add(count, Ordering::AcqRel);
            }
            None => log::warn!(target: "dpmaif::doorbell", "doorbell for unknown ring {}", ring),
        }
    }

    /// Units queued for `ring` and not yet flushed.
    pub fn pending(&self, ring: RingId) -> u32 {
        self.counter(ring).map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Ask the flush task to run now instead of waiting out its delay.
    pub fn request(&self) {
        self.urgent.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn waker(&self) -> &TaskWaker {
        &self.waker
    }

    /// Write one doorbell per ring with pending units.
    ///
    /// # Returns
    /// Total units announced to the device.
    ///
    /// # Errors
    /// The first register failure. Units of that ring are put back so a
    /// later flush can retry them; rings after it are left pending.
    pub fn flush(&self) -> core::result::Result<u32, HwError> {
        let mut total = 0;
        for (ring, counter) in &self.rings {
            let n = counter.swap(0, Ordering::AcqRel);
            if n == 0 {
                continue;
            }
            if let Err(e) = self.hw.doorbell(*ring, n) {
                counter.fetch_add(n, Ordering::AcqRel);
                log::error!(target: "dpmaif::doorbell", "doorbell {} (+{}) failed: {}", ring, n, e);
                return Err(e);
            }
            log::trace!(target: "dpmaif::doorbell", "{} +{}", ring, n);
            bump(&self.stats.doorbells, 1);
            total += n;
        }
        Ok(total)
    }

    /// Flush loop. Runs until stopped, then flushes once more.
    pub fn run(&self, ctx: &TaskContext) -> Result<()> {
        let mut meter = RateMeter::new(Instant::now());
        let mut delay = select_delay(&self.delays, 0);
        while !ctx.should_stop() {
            if !self.urgent.swap(false, Ordering::AcqRel) {
                ctx.park_timeout(delay);
                self.urgent.store(false, Ordering::Release);
            }
            let flushed = self.flush()?;
            let rate = meter.record(flushed, Instant::now());
            let next = select_delay(&self.delays, rate);
            if next != delay {
                log::trace!(target: "dpmaif::doorbell", "rate {}/ms, delay {:?}", rate, next);
                delay = next;
            }
        }
        self.flush()?;
        Ok(())
    }
}

impl core::fmt::Debug for DoorbellBatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DoorbellBatcher")
            .field("rings", &self.rings.len())
            .field("urgent", &self.urgent.load(Ordering::Relaxed))
            .finish()
    }
}
