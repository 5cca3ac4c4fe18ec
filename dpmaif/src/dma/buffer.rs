//! DMA buffer with ownership tracking.

use super::ownership::BufferOwnership;
use crate::hal::{DpmaifHw, HwError};
use crate::types::{BusAddr, DmaDirection};

/// Host memory that may be lent to the device.
///
/// Tracks the bus address while mapped, plus ownership state.
pub struct DmaBuffer {
    /// Backing memory. Its heap allocation never moves while mapped.
    data: Vec<u8>,
    /// Bus address while device-owned.
    bus_addr: BusAddr,
    /// Transfer direction used for map/unmap.
    dir: DmaDirection,
    /// Current ownership state.
    ownership: BufferOwnership,
}

impl DmaBuffer {
    /// Wrap freshly allocated memory. The buffer starts driver-owned.
    pub fn new(data: Vec<u8>, dir: DmaDirection) -> Self {
        Self {
            data,
            bus_addr: 0,
            dir,
            ownership: BufferOwnership::DriverOwned,
        }
    }

    /// Get buffer data as slice.
    ///
    /// # Panics
    /// Panics if buffer is not DriverOwned.
    pub fn as_slice(&self) -> &[u8] {
        assert!(
            self.ownership.can_access(),
            "BUG: Cannot access buffer not owned by driver (state: {:?})",
            self.ownership
        );
        &self.data
    }

    /// Get the device-visible bus address (valid while mapped).
    pub fn bus_addr(&self) -> BusAddr {
        self.bus_addr
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn ownership(&self) -> BufferOwnership {
        self.ownership
    }

    pub fn is_device_owned(&self) -> bool {
        self.ownership.is_device_owned()
    }

    /// Map for device access (DriverOwned -> DeviceOwned).
    pub fn map(&mut self, hw: &dyn DpmaifHw) -> Result<BusAddr, HwError> {
        debug_assert!(
            self.ownership.can_access(),
            "Buffer must be driver-owned before device transfer"
        );
        // SAFETY: `data` is owned by self and is neither dropped nor
        // reallocated until `unmap` runs; Drop reports a leak otherwise.
        let addr = unsafe { hw.map(self.data.as_mut_ptr(), self.data.len(), self.dir)? };
        self.bus_addr = addr;
        self.ownership = BufferOwnership::DeviceOwned;
        Ok(addr)
    }

    /// Reclaim from the device (DeviceOwned -> DriverOwned).
    pub fn unmap(&mut self, hw: &dyn DpmaifHw) {
        debug_assert!(
            self.ownership.is_device_owned(),
            "Buffer must be device-owned before reclaim"
        );
        hw.unmap(self.bus_addr, self.data.len(), self.dir);
        self.bus_addr = 0;
        self.ownership = BufferOwnership::DriverOwned;
    }

    /// Take the memory out, truncated to `len` bytes.
    ///
    /// # Panics
    /// Panics if the buffer is still device-owned.
    pub fn into_vec(mut self, len: usize) -> Vec<u8> {
        assert!(
            self.ownership.can_access(),
            "BUG: Cannot take buffer owned by device"
        );
        let mut data = core::mem::take(&mut self.data);
        data.truncate(len);
        self.ownership = BufferOwnership::Free;
        data
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if self.ownership.is_device_owned() {
            log::error!(
                target: "dpmaif::dma",
                "dropping device-owned buffer at {:#x} ({} bytes)",
                self.bus_addr,
                self.data.len()
            );
        }
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("capacity", &self.data.len())
            .field("ownership", &self.ownership)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::LoopbackHw;

    #[test]
    fn test_map_unmap_cycle() {
        let hw = LoopbackHw::new();
        let mut buf = DmaBuffer::new(vec![0u8; 256], DmaDirection::FromDevice);
        let addr = buf.map(&hw).unwrap();
        assert_ne!(addr, 0);
        assert!(buf.is_device_owned());
        assert_eq!(hw.live_mappings(), 1);

        buf.unmap(&hw);
        assert_eq!(hw.live_mappings(), 0);
        assert_eq!(buf.into_vec(10).len(), 10);
    }

    #[test]
    #[should_panic(expected = "not owned by driver")]
    fn test_device_owned_access_panics() {
        let hw = LoopbackHw::new();
        let mut buf = DmaBuffer::new(vec![0u8; 64], DmaDirection::FromDevice);
        buf.map(&hw).unwrap();
        let _ = buf.as_slice();
    }
}
