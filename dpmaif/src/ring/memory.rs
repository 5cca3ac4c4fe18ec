//! Ring memory shared between host and device.
//!
//! Entries are stored as little-endian 32-bit words. Each word is an
//! `AtomicU32` so host and device may touch the same ring concurrently
//! without aliasing `&mut` memory; ordering of whole entries is carried by
//! the ring cursors, not by the words themselves.

use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::types::BusAddr;

/// Coherent DMA memory holding one ring.
#[derive(Debug)]
pub struct CoherentRing {
    words: Box<[AtomicU32]>,
    entry_words: usize,
    entries: u32,
    bus_addr: BusAddr,
}

impl CoherentRing {
    /// Allocate zeroed ring memory.
    pub fn new(entries: u32, entry_words: usize, bus_addr: BusAddr) -> Self {
        let words = (0..entries as usize * entry_words)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            words,
            entry_words,
            entries,
            bus_addr,
        }
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn entry_words(&self) -> usize {
        self.entry_words
    }

    /// Bus address of entry 0.
    pub fn bus_addr(&self) -> BusAddr {
        self.bus_addr
    }

    /// Read one entry.
    ///
    /// # Panics
    /// Panics if `idx` is out of range or `N` differs from the entry size.
    pub fn read<const N: usize>(&self, idx: u32) -> [u32; N] {
        assert_eq!(N, self.entry_words, "entry size mismatch");
        assert!(idx < self.entries, "ring index out of range");
        // Pairs with the producer's release of its cursor.
        fence(Ordering::Acquire);
        let base = idx as usize * N;
        let mut out = [0u32; N];
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.words[base + i].load(Ordering::Relaxed);
        }
        out
    }

    /// Write one entry.
    ///
    /// # Panics
    /// Panics if `idx` is out of range or `N` differs from the entry size.
    pub fn write<const N: usize>(&self, idx: u32, entry: [u32; N]) {
        assert_eq!(N, self.entry_words, "entry size mismatch");
        assert!(idx < self.entries, "ring index out of range");
        let base = idx as usize * N;
        for (i, w) in entry.iter().enumerate() {
            self.words[base + i].store(*w, Ordering::Relaxed);
        }
        // Entry contents must land before any cursor publication.
        fence(Ordering::Release);
    }

    /// Zero the whole ring.
    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }
}
