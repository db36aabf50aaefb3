//! Device backend contracts
//!
//! The block and framebuffer drivers talk to hardware through these two
//! traits. The RAM-backed implementations exist for hosting the fabric
//! without hardware and for tests; the SATA controller in
//! [`crate::block::sata`] is the hardware-facing [`StorageBackend`].

use parking_lot::{Mutex, RwLock};

use crate::error::{DriverError, DriverResult};

/// Sector-addressed storage, one backend per controller.
///
/// `device` is the controller-local index; `buf` length must equal the
/// device's sector size for both transfers.
pub trait StorageBackend: Send + Sync {
    fn init(&self) -> DriverResult<()>;

    /// Number of devices behind this backend.
    fn device_count(&self) -> usize;

    /// Capacity of a device in sectors.
    fn capacity(&self, device: usize) -> DriverResult<u64>;

    fn sector_size(&self, device: usize) -> u32;

    fn read_sector(&self, device: usize, lba: u64, buf: &mut [u8]) -> DriverResult<()>;

    fn write_sector(&self, device: usize, lba: u64, buf: &[u8]) -> DriverResult<()>;

    /// Flush the device write cache.
    fn flush(&self, device: usize) -> DriverResult<()>;

    fn model(&self, device: usize) -> String;

    fn serial(&self, device: usize) -> String;
}

/// Byte-addressed display memory: the hardware half of a screen.
pub trait DisplayBackend: Send + Sync {
    fn read_region(&self, offset: u64, buf: &mut [u8]) -> DriverResult<()>;

    fn write_region(&self, offset: u64, data: &[u8]) -> DriverResult<()>;
}

// ============================================================================
// RAM-backed implementations
// ============================================================================

/// In-memory disk array: `count` devices of `sectors` sectors each.
pub struct MemoryDisk {
    devices: Vec<Mutex<Vec<u8>>>,
    sectors: u64,
    sector_size: u32,
}

impl MemoryDisk {
    pub fn new(count: usize, sectors: u64) -> Self {
        Self::with_sector_size(count, sectors, 512)
    }

    pub fn with_sector_size(count: usize, sectors: u64, sector_size: u32) -> Self {
        let devices = (0..count)
            .map(|_| Mutex::new(vec![0u8; (sectors * sector_size as u64) as usize]))
            .collect();
        Self { devices, sectors, sector_size }
    }

    fn check(&self, device: usize, lba: u64, len: usize) -> DriverResult<()> {
        if device >= self.devices.len() {
            return Err(DriverError::NotFound(format!("device {}", device)));
        }
        if len != self.sector_size as usize {
            return Err(DriverError::Internal(format!(
                "sector buffer is {} bytes, expected {}",
                len, self.sector_size
            )));
        }
        if lba >= self.sectors {
            return Err(DriverError::OutOfRange { offset: lba, limit: self.sectors });
        }
        Ok(())
    }
}

impl StorageBackend for MemoryDisk {
    fn init(&self) -> DriverResult<()> {
        Ok(())
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn capacity(&self, device: usize) -> DriverResult<u64> {
        if device >= self.devices.len() {
            return Err(DriverError::NotFound(format!("device {}", device)));
        }
        Ok(self.sectors)
    }

    fn sector_size(&self, _device: usize) -> u32 {
        self.sector_size
    }

    fn read_sector(&self, device: usize, lba: u64, buf: &mut [u8]) -> DriverResult<()> {
        self.check(device, lba, buf.len())?;
        let image = self.devices[device].lock();
        let start = (lba * self.sector_size as u64) as usize;
        buf.copy_from_slice(&image[start..start + self.sector_size as usize]);
        Ok(())
    }

    fn write_sector(&self, device: usize, lba: u64, buf: &[u8]) -> DriverResult<()> {
        self.check(device, lba, buf.len())?;
        let mut image = self.devices[device].lock();
        let start = (lba * self.sector_size as u64) as usize;
        image[start..start + self.sector_size as usize].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self, _device: usize) -> DriverResult<()> {
        Ok(())
    }

    fn model(&self, device: usize) -> String {
        format!("ram-disk-{}", device)
    }

    fn serial(&self, device: usize) -> String {
        format!("RAM{:06}", device)
    }
}

/// In-memory display region of a fixed size.
pub struct MemoryDisplay {
    region: RwLock<Vec<u8>>,
}

impl MemoryDisplay {
    pub fn new(size: usize) -> Self {
        Self { region: RwLock::new(vec![0u8; size]) }
    }

    /// Snapshot of the whole region, for tests and the flush-consistency
    /// check.
    pub fn contents(&self) -> Vec<u8> {
        self.region.read().clone()
    }
}

impl DisplayBackend for MemoryDisplay {
    fn read_region(&self, offset: u64, buf: &mut [u8]) -> DriverResult<()> {
        let region = self.region.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > region.len() {
            return Err(DriverError::OutOfRange {
                offset: end as u64,
                limit: region.len() as u64,
            });
        }
        buf.copy_from_slice(&region[start..end]);
        Ok(())
    }

    fn write_region(&self, offset: u64, data: &[u8]) -> DriverResult<()> {
        let mut region = self.region.write();
        let start = offset as usize;
        let end = start + data.len();
        if end > region.len() {
            return Err(DriverError::OutOfRange {
                offset: end as u64,
                limit: region.len() as u64,
            });
        }
        region[start..end].copy_from_slice(data);
        Ok(())
    }
}
