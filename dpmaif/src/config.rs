//! Data path configuration.

use core::time::Duration;

use crate::error::{DpmaifError, Result};
use crate::irq::{MAX_DL_QUEUES, MAX_UL_RINGS};
use crate::wire::drb::MAX_DRB_LEN;
use crate::wire::pit::MAX_BUFFER_ID;

/// One row of the doorbell delay table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellDelay {
    /// Applies when the observed rate is at least this many units per ms.
    pub min_rate_per_ms: u32,
    /// Wait this long before the next flush.
    pub delay: Duration,
}

impl DoorbellDelay {
    pub const fn new(min_rate_per_ms: u32, delay: Duration) -> Self {
        Self {
            min_rate_per_ms,
            delay,
        }
    }
}

/// Default delay table: busier rings flush sooner.
pub const DEFAULT_DOORBELL_DELAYS: [DoorbellDelay; 4] = [
    DoorbellDelay::new(200, Duration::from_micros(20)),
    DoorbellDelay::new(50, Duration::from_micros(100)),
    DoorbellDelay::new(10, Duration::from_micros(250)),
    DoorbellDelay::new(0, Duration::from_millis(1)),
];

/// Ring geometry, budgets and thresholds.
#[derive(Debug, Clone)]
pub struct DpmaifConfig {
    /// Downlink queues; each owns a PIT, a BAT and a fragment BAT.
    pub dl_queues: u8,
    /// Hardware uplink (DRB) rings.
    pub ul_rings: u8,
    /// Software virtual queues multiplexed onto the DRB rings.
    pub virtual_queues: usize,
    /// Uplink service workers.
    pub tx_workers: usize,
    pub pit_entries: u32,
    pub bat_entries: u32,
    pub frag_entries: u32,
    pub drb_entries: u32,
    /// Packets each virtual queue holds before `QueueFull`.
    pub vq_depth: usize,
    pub rx_buffer_size: usize,
    pub frag_buffer_size: usize,
    /// Packets a worker drains from one queue per iteration.
    pub tx_budget_per_iter: usize,
    /// PIT entries one downlink poll may consume.
    pub dl_poll_budget: u32,
    /// Consumed BAT slots that wake the recycle task.
    pub recycle_threshold: u32,
    /// Consumed PIT entries released to the device in one batch.
    pub pit_release_threshold: u32,
    /// Free DRB slots needed to unblock a ring after a lack.
    pub tx_resume_threshold: u32,
    /// Re-reads of a PIT entry before a sequence fault is fatal.
    pub seq_retry_limit: u32,
    /// Busy-wait between PIT re-reads.
    pub seq_retry_delay: Duration,
    /// Worker sleep when every owned queue is empty or blocked.
    pub worker_idle_sleep: Duration,
    /// Throughput to flush delay table, highest rate first.
    pub doorbell_delays: Vec<DoorbellDelay>,
    /// Coalesce same-flow TCP segments before handoff.
    pub aggregation: bool,
    pub max_aggregate_size: usize,
}

impl Default for DpmaifConfig {
    fn default() -> Self {
        Self {
            dl_queues: 2,
            ul_rings: 5,
            virtual_queues: 8,
            tx_workers: 2,
            pit_entries: 2048,
            bat_entries: 1024,
            frag_entries: 256,
            drb_entries: 512,
            vq_depth: 1024,
            rx_buffer_size: 2048,
            frag_buffer_size: 4096,
            tx_budget_per_iter: 64,
            dl_poll_budget: 256,
            recycle_threshold: 32,
            pit_release_threshold: 32,
            tx_resume_threshold: 512 / 8,
            seq_retry_limit: 10,
            seq_retry_delay: Duration::from_micros(2),
            worker_idle_sleep: Duration::from_millis(1),
            doorbell_delays: DEFAULT_DOORBELL_DELAYS.to_vec(),
            aggregation: true,
            max_aggregate_size: 65535,
        }
    }
}

impl DpmaifConfig {
    /// Small rings for bring-up and tests.
    pub fn compact() -> Self {
        Self {
            dl_queues: 1,
            ul_rings: 2,
            virtual_queues: 4,
            tx_workers: 1,
            pit_entries: 64,
            bat_entries: 32,
            frag_entries: 16,
            drb_entries: 32,
            vq_depth: 16,
            rx_buffer_size: 2048,
            frag_buffer_size: 4096,
            tx_budget_per_iter: 8,
            dl_poll_budget: 64,
            recycle_threshold: 4,
            pit_release_threshold: 4,
            tx_resume_threshold: 4,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dl_queues == 0 || self.dl_queues as usize > MAX_DL_QUEUES {
            return Err(DpmaifError::Config("dl_queues out of range"));
        }
        if self.ul_rings == 0 || self.ul_rings as usize > MAX_UL_RINGS {
            return Err(DpmaifError::Config("ul_rings out of range"));
        }
        if self.tx_workers == 0
            || self.tx_workers >= self.virtual_queues
            || self.tx_workers > self.ul_rings as usize
        {
            return Err(DpmaifError::Config(
                "tx_workers must be non-zero, below virtual_queues and at most ul_rings",
            ));
        }
        for entries in [self.pit_entries, self.bat_entries, self.frag_entries, self.drb_entries] {
            if entries < 4 {
                return Err(DpmaifError::Config("rings need at least 4 entries"));
            }
        }
        if self.bat_entries > MAX_BUFFER_ID + 1 || self.frag_entries > MAX_BUFFER_ID + 1 {
            return Err(DpmaifError::Config("buffer pool exceeds the buffer id space"));
        }
        if self.rx_buffer_size == 0
            || self.rx_buffer_size > MAX_DRB_LEN
            || self.frag_buffer_size == 0
            || self.frag_buffer_size > MAX_DRB_LEN
        {
            return Err(DpmaifError::Config("buffer sizes must fit a 16-bit length"));
        }
        if self.vq_depth == 0 || self.tx_budget_per_iter == 0 || self.dl_poll_budget == 0 {
            return Err(DpmaifError::Config("queue depth and budgets must be non-zero"));
        }
        if self.recycle_threshold == 0
            || self.recycle_threshold >= self.bat_entries.min(self.frag_entries)
        {
            return Err(DpmaifError::Config("recycle_threshold must be below pool size"));
        }
        if self.pit_release_threshold == 0 || self.pit_release_threshold >= self.pit_entries {
            return Err(DpmaifError::Config("pit_release_threshold must be below PIT size"));
        }
        if self.tx_resume_threshold == 0 || self.tx_resume_threshold >= self.drb_entries {
            return Err(DpmaifError::Config("tx_resume_threshold must be below DRB size"));
        }
        if self.doorbell_delays.is_empty() {
            return Err(DpmaifError::Config("doorbell delay table is empty"));
        }
        Ok(())
    }

    /// DRB ring serving a virtual queue.
    pub fn vq_ring(&self, vq: usize) -> u8 {
        (vq % self.ul_rings as usize) as u8
    }

    /// Worker owning a DRB ring, and with it every queue mapped there.
    pub fn ring_worker(&self, ring: u8) -> usize {
        ring as usize % self.tx_workers
    }

    pub fn vq_worker(&self, vq: usize) -> usize {
        self.ring_worker(self.vq_ring(vq))
    }
}
