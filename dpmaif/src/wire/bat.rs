//! BAT entry: one receive buffer lent to the device.

use static_assertions::const_assert_eq;

use super::{join_addr, split_addr};
use crate::types::BusAddr;

/// Words per BAT entry.
pub const BAT_ENTRY_WORDS: usize = 2;

const_assert_eq!(core::mem::size_of::<[u32; BAT_ENTRY_WORDS]>(), 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatEntry {
    pub buffer_addr: BusAddr,
}

impl BatEntry {
    pub fn encode(&self) -> [u32; BAT_ENTRY_WORDS] {
        let (lo, hi) = split_addr(self.buffer_addr);
        [lo, hi]
    }

    pub fn decode(words: [u32; BAT_ENTRY_WORDS]) -> Self {
        Self {
            buffer_addr: join_addr(words[0], words[1]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let e = BatEntry { buffer_addr: 0x0000_0001_8000_1000 };
        assert_eq!(e.encode(), [0x8000_1000, 0x1]);
        assert_eq!(BatEntry::decode(e.encode()), e);
    }
}
