//! Buffer ownership state machine.
//!
//! # State Machine
//! ```text
//!     FREE ──alloc()──> DRIVER_OWNED ──map()──> DEVICE_OWNED
//!       ▲                     │                      │
//!       └──── into_vec() ─────┴────── unmap() ───────┘
//! ```
//!
//! INVARIANT: host code never reads a DEVICE_OWNED buffer.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwnership {
    /// No buffer bound (empty pool slot).
    Free,
    /// Host may read and write.
    DriverOwned,
    /// Mapped and lent to the device.
    DeviceOwned,
}

impl BufferOwnership {
    pub fn is_free(&self) -> bool {
        matches!(self, BufferOwnership::Free)
    }

    /// Host may touch the memory.
    pub fn can_access(&self) -> bool {
        matches!(self, BufferOwnership::DriverOwned)
    }

    pub fn is_device_owned(&self) -> bool {
        matches!(self, BufferOwnership::DeviceOwned)
    }
}
