//! Interrupt classification.
//!
//! Turns the raw 32-bit status word into a list of [`IrqEvent`]s. The
//! control layer decides what to do with each one.

use bitflags::bitflags;

/// Hardware uplink (DRB) rings.
pub const MAX_UL_RINGS: usize = 5;
/// Hardware downlink queues (PIT + BAT + FRG sets).
pub const MAX_DL_QUEUES: usize = 2;

const UL_DONE_SHIFT: u32 = 0;
const UL_EMPTY_SHIFT: u32 = 5;
const UL_NOT_READY_SHIFT: u32 = 10;
const DL_DONE_SHIFT: u32 = 20;

bitflags! {
    /// Raw interrupt status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntStatus: u32 {
        const UL_DONE_0 = 1 << 0;
        const UL_DONE_1 = 1 << 1;
        const UL_DONE_2 = 1 << 2;
        const UL_DONE_3 = 1 << 3;
        const UL_DONE_4 = 1 << 4;
        const UL_DRB_EMPTY_0 = 1 << 5;
        const UL_DRB_EMPTY_1 = 1 << 6;
        const UL_DRB_EMPTY_2 = 1 << 7;
        const UL_DRB_EMPTY_3 = 1 << 8;
        const UL_DRB_EMPTY_4 = 1 << 9;
        const UL_MD_NOT_READY_0 = 1 << 10;
        const UL_MD_NOT_READY_1 = 1 << 11;
        const UL_MD_NOT_READY_2 = 1 << 12;
        const UL_MD_NOT_READY_3 = 1 << 13;
        const UL_MD_NOT_READY_4 = 1 << 14;
        const DL_PKT_LEN_ERR = 1 << 16;
        const DL_BAT_LEN_ERR = 1 << 17;
        const DL_PIT_LEN_ERR = 1 << 18;
        const DL_FRG_LEN_ERR = 1 << 19;
        const DL_DONE_0 = 1 << 20;
        const DL_DONE_1 = 1 << 21;
        const REG_TIMEOUT = 1 << 24;

        const UL_DONE = 0x1f << UL_DONE_SHIFT;
        const UL_DRB_EMPTY = 0x1f << UL_EMPTY_SHIFT;
        const UL_MD_NOT_READY = 0x1f << UL_NOT_READY_SHIFT;
        const DL_DONE = 0x3 << DL_DONE_SHIFT;
    }
}

impl IntStatus {
    /// Uplink completion bit of `ring`.
    pub fn ul_done(ring: u8) -> Self {
        Self::from_bits_truncate(1u32.checked_shl(UL_DONE_SHIFT + ring as u32).unwrap_or(0)) & Self::UL_DONE
    }

    /// Downlink completion bit of `queue`.
    pub fn dl_done(queue: u8) -> Self {
        Self::from_bits_truncate(1u32.checked_shl(DL_DONE_SHIFT + queue as u32).unwrap_or(0)) & Self::DL_DONE
    }
}

/// One classified interrupt source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    /// DRB entries of a ring were transmitted.
    UlDone(u8),
    /// A DRB ring ran empty. Informational.
    UlDrbEmpty(u8),
    /// Modem refused uplink on a ring.
    UlNotReady(u8),
    /// PIT entries are waiting on a downlink queue.
    DlDone(u8),
    /// Device saw a packet longer than its buffer.
    DlPacketLength,
    /// Device ran short of normal buffers.
    BatLengthMismatch,
    /// Device ran short of PIT space.
    PitLengthMismatch,
    /// Device ran short of fragment buffers.
    FragLengthMismatch,
    /// AP/modem register access timed out.
    RegisterTimeout,
}

impl IrqEvent {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IrqEvent::RegisterTimeout)
    }
}

fn ring_bits(status: IntStatus, group: IntStatus, shift: u32, count: usize) -> impl Iterator<Item = u8> {
    let bits = (status & group).bits() >> shift;
    (0..count as u8).filter(move |i| bits & (1 << i) != 0)
}

/// Decode a raw status word.
///
/// Events come out in a fixed order: fatal first, then errors, then
/// downlink and uplink work. Unknown bits are ignored.
pub fn classify(raw: u32) -> Vec<IrqEvent> {
    let status = IntStatus::from_bits_truncate(raw);
    let mut events = Vec::new();

    if status.contains(IntStatus::REG_TIMEOUT) {
        events.push(IrqEvent::RegisterTimeout);
    }
    if status.contains(IntStatus::DL_PKT_LEN_ERR) {
        events.push(IrqEvent::DlPacketLength);
    }
    if status.contains(IntStatus::DL_BAT_LEN_ERR) {
        events.push(IrqEvent::BatLengthMismatch);
    }
    if status.contains(IntStatus::DL_FRG_LEN_ERR) {
        events.push(IrqEvent::FragLengthMismatch);
    }
    if status.contains(IntStatus::DL_PIT_LEN_ERR) {
        events.push(IrqEvent::PitLengthMismatch);
    }
    events.extend(ring_bits(status, IntStatus::DL_DONE, DL_DONE_SHIFT, MAX_DL_QUEUES).map(IrqEvent::DlDone));
    events.extend(ring_bits(status, IntStatus::UL_DONE, UL_DONE_SHIFT, MAX_UL_RINGS).map(IrqEvent::UlDone));
    events.extend(
        ring_bits(status, IntStatus::UL_MD_NOT_READY, UL_NOT_READY_SHIFT, MAX_UL_RINGS)
            .map(IrqEvent::UlNotReady),
    );
    events.extend(
        ring_bits(status, IntStatus::UL_DRB_EMPTY, UL_EMPTY_SHIFT, MAX_UL_RINGS)
            .map(IrqEvent::UlDrbEmpty),
    );

    if raw & !IntStatus::all().bits() != 0 {
        log::trace!(target: "dpmaif::irq", "ignoring unknown status bits {:#x}", raw & !IntStatus::all().bits());
    }
    events
}
