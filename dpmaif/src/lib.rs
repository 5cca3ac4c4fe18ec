//! DPMAIF data path engine
//!
//! Moves IP packets between the host and a cellular modem over hardware
//! descriptor rings: BAT/fragment-BAT receive buffer pools, the PIT
//! downlink ring, DRB uplink rings fed from virtual queues, a doorbell
//! batcher and the control/recovery layer that ties them together.
//!
//! Hardware access goes through [`hal::DpmaifHw`]; finished packets go to
//! a [`stack::NetStack`]. [`hal::LoopbackHw`] models the device in memory.

pub mod bat;
pub mod config;
pub mod control;
pub mod dl;
pub mod dma;
pub mod doorbell;
pub mod error;
pub mod hal;
pub mod irq;
pub mod ring;
pub mod stack;
pub mod stats;
pub mod task;
pub mod types;
pub mod ul;
pub mod wire;

pub use config::{DoorbellDelay, DpmaifConfig};
pub use control::{Dpmaif, LinkEvent, LinkState};
pub use error::{DpmaifError, Result, Severity};
pub use hal::{DpmaifHw, HwError};
pub use irq::{classify, IntStatus, IrqEvent};
pub use stack::NetStack;
pub use stats::StatsSnapshot;
pub use types::{ChecksumOffload, RingId, RingKind, RxPacket, TxPacket};
pub use ul::EnqueueError;
