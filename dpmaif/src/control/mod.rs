//! Control and recovery.
//!
//! Link lifecycle, data path enable/disable, interrupt dispatch and the
//! reset path.

pub mod device;
pub mod state;

pub use device::Dpmaif;
pub use state::{LinkEvent, LinkFsm, LinkState};
