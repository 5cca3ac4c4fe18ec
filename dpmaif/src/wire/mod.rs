//! Bit-exact ring entry codecs.
//!
//! Firmware-visible entries are sequences of little-endian 32-bit words
//! with packed bitfields. Everything outside this module works with the
//! plain structs decoded here.
//!
//! | Entry | Size | Producer |
//! |-------|------|----------|
//! | BAT   | 8 B  | host     |
//! | PIT   | 16 B | device   |
//! | DRB   | 16 B | host     |

pub mod bat;
pub mod drb;
pub mod pit;

pub use bat::BatEntry;
pub use drb::{DrbEntry, DrbMessage, DrbPayload};
pub use pit::{PitEntry, PitMessage, PitPayload, PIT_SEQ_MODULUS};

/// A bitfield inside one 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    shift: u32,
    width: u32,
}

impl Field {
    pub const fn new(shift: u32, width: u32) -> Self {
        assert!(width > 0 && shift + width <= 32);
        Self { shift, width }
    }

    #[inline]
    pub const fn mask(&self) -> u32 {
        if self.width == 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// Largest value the field can hold.
    #[inline]
    pub const fn max(&self) -> u32 {
        self.mask()
    }

    #[inline]
    pub const fn get(&self, word: u32) -> u32 {
        (word >> self.shift) & self.mask()
    }

    /// Return `word` with this field replaced by `value` (truncated).
    #[inline]
    pub const fn put(&self, word: u32, value: u32) -> u32 {
        (word & !(self.mask() << self.shift)) | ((value & self.mask()) << self.shift)
    }

    #[inline]
    pub const fn flag(&self, word: u32) -> bool {
        self.get(word) != 0
    }
}

/// Split a bus address into (low, high) words.
#[inline]
pub const fn split_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

#[inline]
pub const fn join_addr(low: u32, high: u32) -> u64 {
    (high as u64) << 32 | low as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_put_get() {
        let f = Field::new(16, 16);
        let w = f.put(0x0000_abcd, 0x1234);
        assert_eq!(w, 0x1234_abcd);
        assert_eq!(f.get(w), 0x1234);
        // value is truncated to the field
        assert_eq!(Field::new(0, 3).put(0, 0xff), 0b111);
    }

    #[test]
    fn test_full_width_field() {
        let f = Field::new(0, 32);
        assert_eq!(f.get(0xdead_beef), 0xdead_beef);
        assert_eq!(f.put(0, 0xdead_beef), 0xdead_beef);
    }

    #[test]
    fn test_addr_split() {
        let (lo, hi) = split_addr(0x0000_0012_3456_7890);
        assert_eq!(lo, 0x3456_7890);
        assert_eq!(hi, 0x12);
        assert_eq!(join_addr(lo, hi), 0x0000_0012_3456_7890);
    }
}
