//! Circular index math shared by all four ring kinds.
//!
//! # Cursors
//! ```text
//!   release ──► read ──► write
//!      │          │        │
//!      │          │        └─ producer cursor
//!      │          └────────── consumer cursor (mirrors hardware)
//!      └───────────────────── how far slots were handed back
//! ```
//!
//! INVARIANT: `release ≤ read ≤ write` modulo capacity. One slot always
//! stays empty so a full ring is distinguishable from an empty one.
//! Capacity does not have to be a power of two.

pub mod memory;

pub use memory::CoherentRing;

use core::sync::atomic::{AtomicU32, Ordering};

/// Entries available to the consumer.
#[inline]
pub const fn readable(write: u32, read: u32, capacity: u32) -> u32 {
    (write + capacity - read) % capacity
}

/// Slots the producer may still fill.
#[inline]
pub const fn writable(write: u32, release: u32, capacity: u32) -> u32 {
    capacity - (write + capacity - release) % capacity - 1
}

/// Entries consumed but not yet handed back.
#[inline]
pub const fn releasable(read: u32, release: u32, capacity: u32) -> u32 {
    (read + capacity - release) % capacity
}

/// Move `idx` forward by `n` slots.
#[inline]
pub const fn advance(idx: u32, n: u32, capacity: u32) -> u32 {
    ((idx as u64 + n as u64) % capacity as u64) as u32
}

/// The three cursors of one ring.
///
/// Each cursor has exactly one writer: the producer owns `write`, the
/// consumer owns `read` and `release`. Stores use `Release` and loads use
/// `Acquire` so entry contents written before a cursor moves are visible to
/// whoever observes the new cursor.
#[derive(Debug)]
pub struct RingCursors {
    capacity: u32,
    write: AtomicU32,
    read: AtomicU32,
    release: AtomicU32,
}

impl RingCursors {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity >= 2, "ring needs at least two slots");
        Self {
            capacity,
            write: AtomicU32::new(0),
            read: AtomicU32::new(0),
            release: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn write(&self) -> u32 {
        self.write.load(Ordering::Acquire)
    }

    #[inline]
    pub fn read(&self) -> u32 {
        self.read.load(Ordering::Acquire)
    }

    #[inline]
    pub fn release(&self) -> u32 {
        self.release.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_write(&self, idx: u32) {
        debug_assert!(idx < self.capacity);
        self.write.store(idx, Ordering::Release);
    }

    #[inline]
    pub fn set_read(&self, idx: u32) {
        debug_assert!(idx < self.capacity);
        self.read.store(idx, Ordering::Release);
    }

    #[inline]
    pub fn set_release(&self, idx: u32) {
        debug_assert!(idx < self.capacity);
        self.release.store(idx, Ordering::Release);
    }

    pub fn readable(&self) -> u32 {
        readable(self.write(), self.read(), self.capacity)
    }

    pub fn writable(&self) -> u32 {
        writable(self.write(), self.release(), self.capacity)
    }

    pub fn releasable(&self) -> u32 {
        releasable(self.read(), self.release(), self.capacity)
    }

    /// Occupied slots between `release` and `write`.
    pub fn outstanding(&self) -> u32 {
        readable(self.write(), self.release(), self.capacity)
    }

    /// Whether `idx` lies in the half-open span `[release, write)`.
    pub fn in_flight(&self, idx: u32) -> bool {
        releasable(idx, self.release(), self.capacity) < self.outstanding()
    }

    /// Check `release ≤ read ≤ write` in modular order.
    pub fn is_ordered(&self) -> bool {
        let release = self.release();
        let read = self.read();
        let write = self.write();
        releasable(read, release, self.capacity) <= readable(write, release, self.capacity)
    }

    /// Accept a consumer cursor reported by hardware.
    ///
    /// Values that would move `read` outside `[read, write]` are rejected;
    /// they mean the device and the driver disagree about ring occupancy.
    pub fn sync_read(&self, hw_read: u32) -> bool {
        if hw_read >= self.capacity {
            return false;
        }
        let read = self.read();
        let write = self.write();
        if readable(hw_read, read, self.capacity) > readable(write, read, self.capacity) {
            return false;
        }
        self.set_read(hw_read);
        true
    }

    /// Accept a producer cursor reported by hardware (PIT).
    ///
    /// The new value may not lap `release`.
    pub fn sync_write(&self, hw_write: u32) -> bool {
        if hw_write >= self.capacity {
            return false;
        }
        let release = self.release();
        let write = self.write();
        let grown = readable(hw_write, write, self.capacity);
        if grown > writable(write, release, self.capacity) {
            return false;
        }
        self.set_write(hw_write);
        true
    }

    /// Zero all cursors.
    pub fn reset(&self) {
        self.write.store(0, Ordering::Release);
        self.read.store(0, Ordering::Release);
        self.release.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_ring() {
        assert_eq!(readable(0, 0, 8), 0);
        assert_eq!(writable(0, 0, 8), 7);
        assert_eq!(releasable(0, 0, 8), 0);
    }

    #[test]
    fn test_wraparound() {
        // write wrapped past zero, release behind
        assert_eq!(readable(2, 6, 8), 4);
        assert_eq!(writable(2, 5, 8), 2);
        assert_eq!(releasable(1, 6, 8), 3);
        assert_eq!(advance(7, 3, 8), 2);
    }

    #[test]
    fn test_non_power_of_two_capacity() {
        assert_eq!(readable(1, 9, 10), 2);
        assert_eq!(writable(1, 9, 10), 7);
        assert_eq!(advance(9, 11, 10), 0);
    }

    #[test]
    fn test_full_ring_reserves_one_slot() {
        let c = RingCursors::new(8);
        c.set_write(7);
        assert_eq!(c.writable(), 0);
        assert_eq!(c.outstanding(), 7);
    }

    #[test]
    fn test_sync_read_rejects_overrun() {
        let c = RingCursors::new(8);
        c.set_write(3);
        assert!(c.sync_read(2));
        assert!(!c.sync_read(5));
        assert!(!c.sync_read(9));
        assert_eq!(c.read(), 2);
    }

    #[test]
    fn test_sync_write_cannot_lap_release() {
        let c = RingCursors::new(8);
        assert!(c.sync_write(7));
        c.set_read(7);
        // one slot reserved: moving to 0 would make write == release
        assert!(!c.sync_write(0));
        c.set_release(2);
        assert!(c.sync_write(1));
        assert!(c.is_ordered());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Produce(u32),
        Consume(u32),
        Release(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..20).prop_map(Op::Produce),
            (0u32..20).prop_map(Op::Consume),
            (0u32..20).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_cursors_stay_ordered(capacity in 2u32..64, ops in proptest::collection::vec(op(), 0..200)) {
            let c = RingCursors::new(capacity);
            for op in ops {
                match op {
                    Op::Produce(n) => {
                        let n = n.min(c.writable());
                        c.set_write(advance(c.write(), n, capacity));
                    }
                    Op::Consume(n) => {
                        let n = n.min(c.readable());
                        c.set_read(advance(c.read(), n, capacity));
                    }
                    Op::Release(n) => {
                        let n = n.min(c.releasable());
                        c.set_release(advance(c.release(), n, capacity));
                    }
                }
                prop_assert!(c.is_ordered());
                prop_assert_eq!(c.readable() + c.releasable() + c.writable(), capacity - 1);
            }
        }
    }
}
