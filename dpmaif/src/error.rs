//! Data path error types.
//!
//! Every error carries a [`Severity`] so the control layer can decide
//! between backpressure, local retry and a full device reset.

use thiserror::Error;

use crate::control::{LinkEvent, LinkState};
use crate::hal::HwError;
use crate::types::{IndexSide, RingId};

pub type Result<T> = core::result::Result<T, DpmaifError>;

/// How an error propagates through the data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Queue full, ring space or memory pressure. Reported to the caller.
    Transient,
    /// Malformed ring content. Retried locally before escalation.
    Protocol,
    /// Register or DMA failure. Escalated immediately.
    Hardware,
    /// Requires the recovery path.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DpmaifError {
    #[error("virtual queue {vq} is full")]
    QueueFull { vq: usize },
    #[error("no such queue: {0}")]
    InvalidQueue(usize),
    #[error("descriptor ring has no room")]
    RingFull,
    #[error("malformed uplink packet: {0}")]
    BadPacket(&'static str),
    #[error("receive buffer allocation failed")]
    OutOfMemory,
    #[error("buffer ring has no free slot to refill")]
    LowMemory,
    #[error("PIT sequence fault on queue {queue}: expected {expected}, found {found}")]
    PitSequence { queue: u8, expected: u16, found: u16 },
    #[error("message entry inside an open packet on queue {queue}")]
    UnexpectedMessage { queue: u8 },
    #[error("illegal buffer id {bid} (frag: {frag}) on queue {queue}")]
    InvalidBufferId { queue: u8, frag: bool, bid: u16 },
    #[error("zero-length payload entry on queue {queue}")]
    ZeroLength { queue: u8 },
    #[error("data path not ready (link {0:?})")]
    NotReady(LinkState),
    #[error("event {event:?} not valid in state {from:?}")]
    InvalidState { from: LinkState, event: LinkEvent },
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("hardware: {0}")]
    Hardware(#[from] HwError),
    #[error("{ring} {side:?} index {index} disagrees with host cursors")]
    RingIndex { ring: RingId, side: IndexSide, index: u32 },
    #[error("failed to spawn data path task")]
    TaskSpawn,
    #[error("data path task {0} panicked")]
    TaskPanicked(String),
}

impl DpmaifError {
    /// Classify this error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::QueueFull { .. }
            | Self::RingFull
            | Self::BadPacket(_)
            | Self::OutOfMemory
            | Self::LowMemory
            | Self::NotReady(_) => Severity::Transient,
            Self::InvalidQueue(_) | Self::InvalidState { .. } | Self::Config(_) => {
                Severity::Transient
            }
            Self::PitSequence { .. }
            | Self::InvalidBufferId { .. }
            | Self::ZeroLength { .. } => Severity::Protocol,
            Self::Hardware(_) | Self::RingIndex { .. } => Severity::Hardware,
            // Kept as hard fault; the packet boundary cannot be trusted afterwards.
            Self::UnexpectedMessage { .. } | Self::TaskSpawn | Self::TaskPanicked(_) => {
                Severity::Fatal
            }
        }
    }

    /// Whether this error must go through device reset.
    ///
    /// Protocol faults only surface here after their local retries are
    /// exhausted, so they are fatal too.
    pub fn is_fatal(&self) -> bool {
        self.severity() >= Severity::Protocol
    }
}
