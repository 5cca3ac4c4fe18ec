//! Device context.
//!
//! One [`Dpmaif`] per modem. It owns the ring set, the background tasks
//! and the link state, and is the only place errors are escalated.
//!
//! # Data path lifecycle
//! ```text
//!   PowerOn ──> ring set built (rings allocated, pools empty)
//!   enable  ──> pools filled, tasks spawned, queues started, link up
//!   disable ──> enqueue closed ─> workers joined ─> doorbell flushed and
//!               joined ─> recycle tasks joined ─> queues stopped
//!   reset   ──> disable, drain every buffer, reset hardware cursors,
//!               free rings, state OFF
//! ```
//!
//! Tasks never reset the device themselves. A fatal error inside a task
//! is latched; the next call into the context picks it up and runs the
//! recovery path.

use std::sync::Arc;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::state::{LinkEvent, LinkFsm, LinkState};
use crate::bat::{BatPool, PoolConfig};
use crate::config::DpmaifConfig;
use crate::dl::{DlConfig, DlQueue};
use crate::dma::{BufferAllocator, HeapAllocator};
use crate::doorbell::DoorbellBatcher;
use crate::error::{DpmaifError, Result};
use crate::hal::{DpmaifHw, HwError};
use crate::irq::{self, IrqEvent};
use crate::stack::NetStack;
use crate::stats::{bump, DpmaifStats, StatsSnapshot};
use crate::task::{FaultLatch, TaskHandle};
use crate::types::{RingId, TxPacket};
use crate::ul::{EnqueueError, Uplink};

// ═══════════════════════════════════════════════════════════════════════════
// RING SET
// ═══════════════════════════════════════════════════════════════════════════

/// Every ring of the device and the pipelines built on them.
struct RingSet {
    doorbell: Arc<DoorbellBatcher>,
    /// BAT and fragment pool of each downlink queue, in queue order.
    pools: Vec<Arc<BatPool>>,
    dl: Vec<Arc<DlQueue>>,
    ul: Arc<Uplink>,
}

impl RingSet {
    fn build(
        cfg: &DpmaifConfig,
        hw: &Arc<dyn DpmaifHw>,
        alloc: &Arc<dyn BufferAllocator>,
        stack: &Arc<dyn NetStack>,
        stats: &Arc<DpmaifStats>,
    ) -> Result<Self> {
        let ring_ids: Vec<RingId> = (0..cfg.dl_queues)
            .flat_map(|q| [RingId::bat(q), RingId::frag(q), RingId::pit(q)])
            .chain((0..cfg.ul_rings).map(RingId::drb))
            .collect();
        let doorbell = Arc::new(DoorbellBatcher::new(
            hw.clone(),
            stats.clone(),
            ring_ids,
            cfg.doorbell_delays.clone(),
        ));

        let dl_cfg = DlConfig {
            pit_entries: cfg.pit_entries,
            release_threshold: cfg.pit_release_threshold,
            seq_retry_limit: cfg.seq_retry_limit,
            seq_retry_delay: cfg.seq_retry_delay,
            aggregation: cfg.aggregation,
            max_aggregate_size: cfg.max_aggregate_size,
        };

        let mut pools = Vec::with_capacity(cfg.dl_queues as usize * 2);
        let mut dl = Vec::with_capacity(cfg.dl_queues as usize);
        for q in 0..cfg.dl_queues {
            let bat = Arc::new(BatPool::new(
                RingId::bat(q),
                PoolConfig {
                    entries: cfg.bat_entries,
                    buffer_size: cfg.rx_buffer_size,
                    recycle_threshold: cfg.recycle_threshold,
                },
                hw.clone(),
                alloc.clone(),
                doorbell.clone(),
            )?);
            let frag = Arc::new(BatPool::new(
                RingId::frag(q),
                PoolConfig {
                    entries: cfg.frag_entries,
                    buffer_size: cfg.frag_buffer_size,
                    recycle_threshold: cfg.recycle_threshold,
                },
                hw.clone(),
                alloc.clone(),
                doorbell.clone(),
            )?);
            dl.push(Arc::new(DlQueue::new(
                q,
                dl_cfg.clone(),
                bat.clone(),
                frag.clone(),
                hw.clone(),
                doorbell.clone(),
                stack.clone(),
                stats.clone(),
            )?));
            pools.push(bat);
            pools.push(frag);
        }

        let ul = Arc::new(Uplink::new(cfg, hw.clone(), doorbell.clone(), stack.clone(), stats.clone())?);
        Ok(Self {
            doorbell,
            pools,
            dl,
            ul,
        })
    }

    /// Release every buffer and packet the rings hold.
    ///
    /// # Returns
    /// (receive buffers freed, uplink packets dropped)
    fn teardown(&self) -> (u32, u32) {
        self.ul.set_accepting(false);
        for q in &self.dl {
            q.reset();
        }
        let buffers = self.pools.iter().map(|p| p.drain()).sum();
        let packets = self.ul.drain();
        (buffers, packets)
    }
}

#[derive(Debug, Default)]
struct Tasks {
    workers: Vec<TaskHandle>,
    doorbell: Option<TaskHandle>,
    recycle: Vec<TaskHandle>,
}

impl Tasks {
    fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.doorbell.is_none() && self.recycle.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE
// ═══════════════════════════════════════════════════════════════════════════

pub struct Dpmaif {
    hw: Arc<dyn DpmaifHw>,
    stack: Arc<dyn NetStack>,
    alloc: Arc<dyn BufferAllocator>,
    cfg: DpmaifConfig,
    stats: Arc<DpmaifStats>,
    latch: Arc<FaultLatch>,
    fsm: Mutex<LinkFsm>,
    rings: Mutex<Option<Arc<RingSet>>>,
    tasks: Mutex<Tasks>,
    link_up: AtomicBool,
}

impl Dpmaif {
    /// Create a device context backed by the global heap.
    ///
    /// # Errors
    /// `Config` when `config` fails validation.
    pub fn new(hw: Arc<dyn DpmaifHw>, stack: Arc<dyn NetStack>, config: DpmaifConfig) -> Result<Self> {
        Self::with_allocator(hw, stack, config, Arc::new(HeapAllocator))
    }

    /// Create a device context drawing receive buffers from `alloc`.
    pub fn with_allocator(
        hw: Arc<dyn DpmaifHw>,
        stack: Arc<dyn NetStack>,
        config: DpmaifConfig,
        alloc: Arc<dyn BufferAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hw,
            stack,
            alloc,
            cfg: config,
            stats: Arc::new(DpmaifStats::new()),
            latch: Arc::new(FaultLatch::new()),
            fsm: Mutex::new(LinkFsm::new()),
            rings: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            link_up: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DpmaifConfig {
        &self.cfg
    }

    pub fn state(&self) -> LinkState {
        self.fsm.lock().state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the data path is enabled.
    pub fn is_enabled(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    fn ring_set(&self) -> Result<Arc<RingSet>> {
        let set = self.rings.lock().clone();
        set.ok_or_else(|| DpmaifError::NotReady(self.state()))
    }

    fn set_link(&self, up: bool) {
        if self.link_up.swap(up, Ordering::AcqRel) != up {
            log::info!(target: "dpmaif::control", "data path {}", if up { "up" } else { "down" });
            self.stack.link_changed(up);
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════

    /// Feed a link lifecycle event.
    ///
    /// `PowerOn` allocates the rings, `StackDown` disables the data path,
    /// `Teardown` releases everything, `Fatal` runs the recovery path.
    ///
    /// # Returns
    /// The resulting link state.
    pub fn event(&self, event: LinkEvent) -> Result<LinkState> {
        match event {
            LinkEvent::PowerOn => {
                let mut fsm = self.fsm.lock();
                fsm.next(event)?;
                let set = RingSet::build(&self.cfg, &self.hw, &self.alloc, &self.stack, &self.stats)?;
                *self.rings.lock() = Some(Arc::new(set));
                fsm.apply(event)
            }
            LinkEvent::StackDown => {
                let state = self.fsm.lock().apply(event)?;
                self.disable()?;
                Ok(state)
            }
            LinkEvent::Teardown => {
                self.fsm.lock().next(event)?;
                let res = self.shutdown();
                let state = self.fsm.lock().apply(event)?;
                res.map(|()| state)
            }
            LinkEvent::Fatal => {
                self.fsm.lock().apply(event)?;
                bump(&self.stats.fatal_resets, 1);
                self.reset()?;
                Ok(self.state())
            }
            LinkEvent::BootComplete | LinkEvent::StackReady => self.fsm.lock().apply(event),
        }
    }

    /// Start moving packets.
    ///
    /// Requires state `RUNNING`, modem powered and stack ready. Idempotent.
    ///
    /// # Errors
    /// `NotReady` when the preconditions do not hold; fatal errors from
    /// bring-up after the recovery path has run.
    pub fn enable(&self) -> Result<()> {
        self.check_faults()?;
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        {
            let fsm = self.fsm.lock();
            if !fsm.can_enable() {
                return Err(DpmaifError::NotReady(fsm.state()));
            }
        }
        let rings = self.ring_set()?;
        if let Err(e) = self.start(&rings, &mut tasks) {
            log::error!(target: "dpmaif::control", "enable failed: {}", e);
            if let Err(stop) = self.stop_data_path(Some(&rings), &mut tasks) {
                log::warn!(target: "dpmaif::control", "cleanup after failed enable: {}", stop);
            }
            drop(tasks);
            return Err(if e.is_fatal() { self.escalate(e) } else { e });
        }
        drop(tasks);
        self.set_link(true);
        Ok(())
    }

    fn start(&self, rings: &RingSet, tasks: &mut Tasks) -> Result<()> {
        for pool in &rings.pools {
            match pool.replenish() {
                Ok(n) => log::debug!(target: "dpmaif::control", "{}: {} buffers lent", pool.ring(), n),
                Err(e) if !e.is_fatal() => {
                    log::warn!(target: "dpmaif::control", "{}: initial fill: {}", pool.ring(), e)
                }
                Err(e) => return Err(e),
            }
        }
        rings.doorbell.flush()?;

        let db = rings.doorbell.clone();
        let handle = TaskHandle::spawn("dpmaif-doorbell", self.latch.clone(), move |ctx| db.run(ctx))?;
        if let Some(t) = handle.thread() {
            rings.doorbell.waker().attach(t.clone());
        }
        tasks.doorbell = Some(handle);

        let idle = self.cfg.worker_idle_sleep;
        for pool in &rings.pools {
            let p = pool.clone();
            let handle = TaskHandle::spawn(format!("dpmaif-{}", pool.ring()), self.latch.clone(), move |ctx| {
                p.run(ctx, idle)
            })?;
            if let Some(t) = handle.thread() {
                pool.waker().attach(t.clone());
            }
            tasks.recycle.push(handle);
        }

        for worker in rings.ul.workers() {
            let w = worker.clone();
            let handle = TaskHandle::spawn(format!("dpmaif-tx{}", worker.id()), self.latch.clone(), move |ctx| {
                w.run(ctx)
            })?;
            if let Some(t) = handle.thread() {
                worker.waker().attach(t.clone());
            }
            tasks.workers.push(handle);
        }

        self.hw.start_queues()?;
        rings.ul.set_accepting(true);
        log::info!(
            target: "dpmaif::control",
            "enabled: {} dl queues, {} ul rings, {} workers",
            rings.dl.len(), rings.ul.rings().len(), rings.ul.workers().len()
        );
        Ok(())
    }

    /// Stop moving packets. Returns once every task has exited.
    pub fn disable(&self) -> Result<()> {
        let rings = self.rings.lock().clone();
        let mut tasks = self.tasks.lock();
        let res = self.stop_data_path(rings.as_deref(), &mut tasks);
        drop(tasks);
        self.set_link(false);
        res
    }

    /// Teardown in dependency order: enqueue, workers, doorbell, recycle,
    /// then the hardware queues.
    fn stop_data_path(&self, rings: Option<&RingSet>, tasks: &mut Tasks) -> Result<()> {
        let was_running = !tasks.is_empty();
        if let Some(r) = rings {
            r.ul.set_accepting(false);
        }
        let mut first_err = None;
        let mut stop = |h: &mut TaskHandle| {
            if let Err(e) = h.stop() {
                first_err.get_or_insert(e);
            }
        };

        for h in tasks.workers.iter_mut() {
            stop(h);
        }
        tasks.workers.clear();
        if let Some(mut h) = tasks.doorbell.take() {
            stop(&mut h);
        }
        for h in tasks.recycle.iter_mut() {
            stop(h);
        }
        tasks.recycle.clear();

        if let Some(r) = rings {
            for w in r.ul.workers() {
                w.waker().detach();
            }
            r.doorbell.waker().detach();
            for p in &r.pools {
                p.waker().detach();
            }
        }

        if was_running {
            if let Err(e) = self.hw.stop_queues() {
                log::error!(target: "dpmaif::control", "queue stop failed: {}", e);
                first_err.get_or_insert(e.into());
            }
            log::info!(target: "dpmaif::control", "disabled");
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Stop the data path and release every ring.
    fn shutdown(&self) -> Result<()> {
        let set = self.rings.lock().take();
        let mut tasks = self.tasks.lock();
        let stopped = self.stop_data_path(set.as_deref(), &mut tasks);
        drop(tasks);
        self.set_link(false);

        if let Some(set) = &set {
            let (buffers, packets) = set.teardown();
            log::info!(
                target: "dpmaif::control",
                "released {} receive buffers, dropped {} uplink packets",
                buffers, packets
            );
        }
        let hw = self.hw.reset_rings();
        // last reference: rings are freed here
        drop(set);

        if let Err(e) = &stopped {
            log::warn!(target: "dpmaif::control", "shutdown: {}", e);
        }
        hw.map_err(DpmaifError::from)
    }

    /// Recovery path: release everything and return to `OFF`.
    ///
    /// Boot can be retried with `PowerOn` afterwards.
    pub fn reset(&self) -> Result<()> {
        let res = self.shutdown();
        self.fsm.lock().force_off();
        if let Some(e) = self.latch.take() {
            log::debug!(target: "dpmaif::control", "clearing fault latched during reset: {}", e);
        }
        res
    }

    // ═══════════════════════════════════════════════════════════════════
    // ERROR ESCALATION
    // ═══════════════════════════════════════════════════════════════════

    /// Run recovery for a fault latched by a background task.
    pub fn check_faults(&self) -> Result<()> {
        match self.latch.take() {
            Some(e) => Err(self.escalate(e)),
            None => Ok(()),
        }
    }

    fn escalate(&self, err: DpmaifError) -> DpmaifError {
        log::error!(target: "dpmaif::control", "fatal: {}; resetting data path", err);
        if let Err(e) = self.fsm.lock().apply(LinkEvent::Fatal) {
            log::warn!(target: "dpmaif::control", "{}", e);
        }
        bump(&self.stats.fatal_resets, 1);
        if let Err(e) = self.reset() {
            log::error!(target: "dpmaif::control", "reset after fault: {}", e);
        }
        err
    }

    fn escalate_if_fatal<T>(&self, res: Result<T>) -> Result<T> {
        match res {
            Err(e) if e.is_fatal() => Err(self.escalate(e)),
            other => other,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // DATA PATH ENTRY POINTS
    // ═══════════════════════════════════════════════════════════════════

    /// Queue an uplink packet on the virtual queue for `class`.
    ///
    /// # Errors
    /// The packet comes back with `NotReady`, `InvalidQueue`, `BadPacket`
    /// or `QueueFull`.
    pub fn enqueue(&self, pkt: TxPacket, class: usize) -> core::result::Result<(), EnqueueError> {
        if let Err(e) = self.check_faults() {
            return Err(EnqueueError::new(pkt, e));
        }
        let rings = match self.ring_set() {
            Ok(r) => r,
            Err(e) => return Err(EnqueueError::new(pkt, e)),
        };
        if !rings.ul.is_accepting() {
            return Err(EnqueueError::new(pkt, DpmaifError::NotReady(self.state())));
        }
        rings.ul.enqueue(pkt, class)
    }

    /// Process up to `budget` PIT entries of downlink queue `queue`.
    pub fn poll_rx(&self, queue: u8, budget: u32) -> Result<u32> {
        self.check_faults()?;
        let rings = self.ring_set()?;
        let res = match rings.dl.get(queue as usize) {
            Some(dl) => dl.poll(budget),
            None => Err(DpmaifError::InvalidQueue(queue as usize)),
        };
        drop(rings);
        self.escalate_if_fatal(res)
    }

    /// Handle a raw interrupt status word.
    ///
    /// # Returns
    /// The classified events, in handling order.
    ///
    /// # Errors
    /// The first fatal error, after the recovery path has run. Transient
    /// errors are logged and handling continues.
    pub fn handle_interrupt(&self, raw: u32) -> Result<Vec<IrqEvent>> {
        self.check_faults()?;
        let rings = self.ring_set()?;
        self.hw.ack_interrupts(raw);
        let events = irq::classify(raw);
        for event in &events {
            match self.dispatch(&rings, *event) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    drop(rings);
                    return Err(self.escalate(e));
                }
                Err(e) => log::debug!(target: "dpmaif::control", "{:?}: {}", event, e),
            }
        }
        Ok(events)
    }

    /// Recycle and refill `pools`.
    ///
    /// Each pool has one refiller: its recycle task while the data path
    /// runs, otherwise this call. The tasks lock keeps `enable` from
    /// spawning a recycle task part way through.
    fn reload<'a>(&self, pools: impl Iterator<Item = &'a Arc<BatPool>>) -> Result<()> {
        let tasks = self.tasks.lock();
        for pool in pools {
            if tasks.is_empty() {
                pool.service()?;
            } else {
                pool.waker().wake();
            }
        }
        Ok(())
    }

    fn dispatch(&self, rings: &RingSet, event: IrqEvent) -> Result<()> {
        match event {
            IrqEvent::UlDone(ring) => {
                rings.ul.complete(ring)?;
            }
            IrqEvent::UlDrbEmpty(ring) => {
                log::trace!(target: "dpmaif::control", "drb{}: empty", ring);
            }
            IrqEvent::UlNotReady(ring) => {
                log::warn!(target: "dpmaif::control", "drb{}: modem not ready", ring);
            }
            IrqEvent::DlDone(queue) => {
                let dl = rings
                    .dl
                    .get(queue as usize)
                    .ok_or(DpmaifError::InvalidQueue(queue as usize))?;
                dl.poll(self.cfg.dl_poll_budget)?;
            }
            IrqEvent::DlPacketLength => {
                bump(&self.stats.rx_errors, 1);
                log::warn!(target: "dpmaif::control", "downlink packet length error");
            }
            IrqEvent::BatLengthMismatch => {
                log::warn!(target: "dpmaif::control", "BAT length mismatch, reloading");
                self.reload(rings.dl.iter().map(|dl| dl.bat()))?;
            }
            IrqEvent::FragLengthMismatch => {
                log::warn!(target: "dpmaif::control", "fragment BAT length mismatch, reloading");
                self.reload(rings.dl.iter().map(|dl| dl.frag()))?;
            }
            IrqEvent::PitLengthMismatch => {
                log::warn!(target: "dpmaif::control", "PIT length mismatch, polling");
                for dl in &rings.dl {
                    dl.poll(self.cfg.dl_poll_budget)?;
                }
            }
            IrqEvent::RegisterTimeout => {
                return Err(HwError::RegisterTimeout("AP/MD interface").into());
            }
        }
        Ok(())
    }
}

impl Drop for Dpmaif {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            log::warn!(target: "dpmaif::control", "disable on drop: {}", e);
        }
    }
}

impl core::fmt::Debug for Dpmaif {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let fsm = *self.fsm.lock();
        let enabled = self.is_enabled();
        f.debug_struct("Dpmaif")
            .field("fsm", &fsm)
            .field("enabled", &enabled)
            .field("link_up", &self.link_up.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loopback::DevicePacket;
    use crate::hal::LoopbackHw;
    use crate::irq::IntStatus;
    use crate::stack::testing::RecordingStack;

    struct Fixture {
        hw: Arc<LoopbackHw>,
        stack: Arc<RecordingStack>,
        dev: Dpmaif,
    }

    fn fixture() -> Fixture {
        let hw = Arc::new(LoopbackHw::new());
        let stack = Arc::new(RecordingStack::default());
        let dev = Dpmaif::new(hw.clone(), stack.clone(), DpmaifConfig::compact()).unwrap();
        Fixture { hw, stack, dev }
    }

    fn bring_up(dev: &Dpmaif) {
        dev.event(LinkEvent::PowerOn).unwrap();
        dev.event(LinkEvent::BootComplete).unwrap();
        dev.event(LinkEvent::StackReady).unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let hw = Arc::new(LoopbackHw::new());
        let stack = Arc::new(RecordingStack::default());
        let cfg = DpmaifConfig {
            dl_queues: 0,
            ..DpmaifConfig::compact()
        };
        assert!(matches!(Dpmaif::new(hw, stack, cfg), Err(DpmaifError::Config(_))));
    }

    #[test]
    fn test_power_on_allocates_rings() {
        let f = fixture();
        assert_eq!(f.hw.ring_count(), 0);
        f.dev.event(LinkEvent::PowerOn).unwrap();
        // 1 dl queue (bat, frg, pit) + 2 drb
        assert_eq!(f.hw.ring_count(), 5);
        assert_eq!(f.dev.state(), LinkState::Booting);
    }

    #[test]
    fn test_enable_requires_running_and_stack() {
        let f = fixture();
        assert_eq!(f.dev.enable(), Err(DpmaifError::NotReady(LinkState::Off)));
        f.dev.event(LinkEvent::PowerOn).unwrap();
        f.dev.event(LinkEvent::BootComplete).unwrap();
        assert_eq!(f.dev.enable(), Err(DpmaifError::NotReady(LinkState::Running)));
        f.dev.event(LinkEvent::StackReady).unwrap();
        f.dev.enable().unwrap();
        assert!(f.dev.is_enabled());
        assert!(f.hw.is_started());
        assert_eq!(f.stack.link.lock().as_slice(), &[true]);

        f.dev.disable().unwrap();
        assert!(!f.dev.is_enabled());
        assert!(!f.hw.is_started());
        assert_eq!(f.stack.link.lock().as_slice(), &[true, false]);
    }

    #[test]
    fn test_enqueue_rejected_while_disabled() {
        let f = fixture();
        bring_up(&f.dev);
        let err = f.dev.enqueue(TxPacket::new(0, vec![1]), 0).unwrap_err();
        assert_eq!(err.error, DpmaifError::NotReady(LinkState::Running));
    }

    #[test]
    fn test_interrupt_drives_downlink() {
        let f = fixture();
        bring_up(&f.dev);
        f.dev.enable().unwrap();
        f.dev.disable().unwrap();

        f.hw.receive(0, &DevicePacket::new(4, vec![0xab; 300])).unwrap();
        let events = f.dev.handle_interrupt(f.hw.take_interrupts()).unwrap();
        assert_eq!(events, vec![IrqEvent::DlDone(0)]);
        let rx = f.stack.rx.lock();
        assert_eq!(rx.len(), 1);
        assert_eq!(rx[0].data, vec![0xab; 300]);
        assert_eq!(rx[0].channel_id, 4);
    }

    #[test]
    fn test_register_timeout_resets_to_off() {
        let f = fixture();
        bring_up(&f.dev);
        f.dev.enable().unwrap();
        let err = f.dev.handle_interrupt(IntStatus::REG_TIMEOUT.bits()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(f.dev.state(), LinkState::Off);
        assert!(!f.dev.is_enabled());
        assert_eq!(f.hw.live_mappings(), 0);
        assert_eq!(f.hw.ring_count(), 0);
        assert_eq!(f.dev.stats().fatal_resets, 1);
        assert_eq!(f.stack.link.lock().last(), Some(&false));

        // boot can be retried
        bring_up(&f.dev);
        f.dev.enable().unwrap();
    }

    #[test]
    fn test_teardown_releases_everything() {
        let f = fixture();
        bring_up(&f.dev);
        f.dev.enable().unwrap();
        assert!(f.hw.live_mappings() > 0);
        assert_eq!(f.dev.event(LinkEvent::Teardown).unwrap(), LinkState::Off);
        assert_eq!(f.hw.live_mappings(), 0);
        assert_eq!(f.hw.ring_count(), 0);
        assert_eq!(f.hw.bad_unmaps(), 0);
    }

    #[test]
    fn test_bat_mismatch_reloads_inline_while_disabled() {
        let f = fixture();
        bring_up(&f.dev);
        f.dev.enable().unwrap();
        f.dev.disable().unwrap();
        for _ in 0..3 {
            f.hw.receive(0, &DevicePacket::new(0, vec![1; 64])).unwrap();
        }
        f.dev.handle_interrupt(f.hw.take_interrupts()).unwrap();
        assert_eq!(f.hw.credits(RingId::bat(0)), Some(28));

        let events = f.dev.handle_interrupt(IntStatus::DL_BAT_LEN_ERR.bits()).unwrap();
        assert_eq!(events, vec![IrqEvent::BatLengthMismatch]);
        let rings = f.dev.ring_set().unwrap();
        let bat = rings.dl[0].bat();
        assert_eq!(bat.cursors().release(), 3);
        assert_eq!(bat.cursors().outstanding(), 31);
        rings.doorbell.flush().unwrap();
        assert_eq!(f.hw.credits(RingId::bat(0)), Some(31));
        assert_eq!(f.hw.bad_unmaps(), 0);
    }

    #[test]
    fn test_bat_mismatch_left_to_recycle_task_while_enabled() {
        let f = fixture();
        bring_up(&f.dev);
        f.dev.enable().unwrap();
        for _ in 0..3 {
            f.hw.receive(0, &DevicePacket::new(0, vec![1; 64])).unwrap();
        }
        f.dev.handle_interrupt(f.hw.take_interrupts()).unwrap();
        f.dev.handle_interrupt(IntStatus::DL_BAT_LEN_ERR.bits()).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while f.hw.credits(RingId::bat(0)) != Some(31) {
            assert!(std::time::Instant::now() < deadline, "pool not reloaded");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let rings = f.dev.ring_set().unwrap();
        assert_eq!(rings.dl[0].bat().cursors().outstanding(), 31);
        assert!(f.dev.check_faults().is_ok());
    }

    #[test]
    fn test_device_cursor_disagreement_resets() {
        let f = fixture();
        bring_up(&f.dev);
        f.dev.enable().unwrap();
        f.hw.force_index(RingId::drb(0), crate::types::IndexSide::Read, Some(5));
        let err = f.dev.handle_interrupt(IntStatus::UL_DONE_0.bits()).unwrap_err();
        assert!(matches!(err, DpmaifError::RingIndex { index: 5, .. }));
        assert_eq!(f.dev.state(), LinkState::Off);
        assert!(!f.dev.is_enabled());
        assert_eq!(f.dev.stats().fatal_resets, 1);
        assert_eq!(f.hw.live_mappings(), 0);
    }

    #[test]
    fn test_stack_down_disables() {
        let f = fixture();
        bring_up(&f.dev);
        f.dev.enable().unwrap();
        assert_eq!(f.dev.event(LinkEvent::StackDown).unwrap(), LinkState::Running);
        assert!(!f.dev.is_enabled());
    }
}
