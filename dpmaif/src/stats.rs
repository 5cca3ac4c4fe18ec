//! Data path counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared by every task of one device.
///
/// All updates are `Relaxed`: counters carry no ordering obligations,
/// [`snapshot`](Self::snapshot) is a best-effort copy.
#[derive(Debug, Default)]
pub struct DpmaifStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub rx_errors: AtomicU64,
    pub rx_aggregated: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_busy: AtomicU64,
    pub tx_dropped: AtomicU64,
    pub seq_faults: AtomicU64,
    pub doorbells: AtomicU64,
    pub fatal_resets: AtomicU64,
}

/// Plain copy of [`DpmaifStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub rx_aggregated: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_busy: u64,
    pub tx_dropped: u64,
    pub seq_faults: u64,
    pub doorbells: u64,
    pub fatal_resets: u64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl DpmaifStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            rx_packets: get(&self.rx_packets),
            rx_bytes: get(&self.rx_bytes),
            rx_dropped: get(&self.rx_dropped),
            rx_errors: get(&self.rx_errors),
            rx_aggregated: get(&self.rx_aggregated),
            tx_packets: get(&self.tx_packets),
            tx_bytes: get(&self.tx_bytes),
            tx_busy: get(&self.tx_busy),
            tx_dropped: get(&self.tx_dropped),
            seq_faults: get(&self.seq_faults),
            doorbells: get(&self.doorbells),
            fatal_resets: get(&self.fatal_resets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = DpmaifStats::new();
        bump(&stats.rx_packets, 3);
        bump(&stats.rx_bytes, 1500);
        bump(&stats.fatal_resets, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.rx_packets, 3);
        assert_eq!(snap.rx_bytes, 1500);
        assert_eq!(snap.fatal_resets, 1);
        assert_eq!(snap.tx_packets, 0);
    }
}
