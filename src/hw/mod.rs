//! Hardware surfaces
//!
//! The three collaborator contracts a hardware driver builds on:
//!
//! - an MMIO region, a seekable byte file at the device's physical base
//!   supporting aligned 32-bit reads and writes;
//! - an interrupt event file whose blocking read returns one byte per
//!   delivered IRQ, registered through a text control file;
//! - DMA-capable buffers with a stable physical address, carved from an
//!   arena the platform provides.
//!
//! Register reads and writes are not atomic against each other, so every
//! access goes through the controller-wide lock in [`Mmio`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DriverError, DriverResult};

// ============================================================================
// MMIO
// ============================================================================

/// Aligned 32-bit register access at offsets from the device base.
pub trait MmioRegion: Send {
    fn read32(&mut self, offset: u64) -> DriverResult<u32>;
    fn write32(&mut self, offset: u64, value: u32) -> DriverResult<()>;
}

/// MMIO over a seekable byte file (`/dev/mem` style) at a physical base.
pub struct FileMmio {
    file: File,
    base: u64,
}

impl FileMmio {
    pub fn new(file: File, base: u64) -> Self {
        Self { file, base }
    }
}

impl MmioRegion for FileMmio {
    fn read32(&mut self, offset: u64) -> DriverResult<u32> {
        self.file.seek(SeekFrom::Start(self.base + offset))?;
        let mut bytes = [0u8; 4];
        self.file.read_exact(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn write32(&mut self, offset: u64, value: u32) -> DriverResult<()> {
        self.file.seek(SeekFrom::Start(self.base + offset))?;
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}

/// Shared handle serializing all register access on one controller.
pub struct Mmio {
    region: Mutex<Box<dyn MmioRegion>>,
}

impl Mmio {
    pub fn new(region: Box<dyn MmioRegion>) -> Arc<Self> {
        Arc::new(Self { region: Mutex::new(region) })
    }

    pub fn read32(&self, offset: u64) -> DriverResult<u32> {
        self.region.lock().read32(offset)
    }

    pub fn write32(&self, offset: u64, value: u32) -> DriverResult<()> {
        self.region.lock().write32(offset, value)
    }
}

// ============================================================================
// Interrupts
// ============================================================================

/// Blocking source of interrupt events for one registered IRQ.
pub trait IrqEvents: Send {
    /// Block until the IRQ fires. `Ok(false)` means the event source is
    /// gone and the handler loop should exit.
    fn wait(&mut self) -> DriverResult<bool>;
}

/// Interrupt events read from an event file: one byte of payload per event.
pub struct IrqFile {
    file: File,
}

impl IrqFile {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl IrqEvents for IrqFile {
    fn wait(&mut self) -> DriverResult<bool> {
        let mut buf = [0u8; 32];
        let n = self.file.read(&mut buf)?;
        Ok(n > 0)
    }
}

/// Register interest in an IRQ by writing the text command the interrupt
/// controller's control file expects.
pub fn register_irq(ctl: &mut impl Write, irq: u32, name: &str) -> io::Result<()> {
    ctl.write_all(format!("register {} {}\n", irq, name).as_bytes())
}

// ============================================================================
// DMA
// ============================================================================

/// A DMA-capable buffer: bytes the driver can touch plus the physical
/// address hardware sees.
#[derive(Clone)]
pub struct DmaBuffer {
    arena: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
    phys: u64,
}

impl DmaBuffer {
    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> DriverResult<()> {
        if offset + data.len() > self.len {
            return Err(DriverError::OutOfRange {
                offset: (offset + data.len()) as u64,
                limit: self.len as u64,
            });
        }
        let mut arena = self.arena.lock();
        arena[self.offset + offset..self.offset + offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> DriverResult<()> {
        if offset + buf.len() > self.len {
            return Err(DriverError::OutOfRange {
                offset: (offset + buf.len()) as u64,
                limit: self.len as u64,
            });
        }
        let arena = self.arena.lock();
        buf.copy_from_slice(&arena[self.offset + offset..self.offset + offset + buf.len()]);
        Ok(())
    }

    pub fn zero(&self) {
        let mut arena = self.arena.lock();
        arena[self.offset..self.offset + self.len].fill(0);
    }
}

/// Allocator handing out [`DmaBuffer`]s.
pub trait DmaAllocator: Send + Sync {
    fn alloc(&self, len: usize, align: usize) -> DriverResult<DmaBuffer>;
}

/// Bump allocator over one physically-contiguous arena. The platform
/// provides the arena and its physical base; this crate only carves it.
pub struct ArenaAllocator {
    arena: Arc<Mutex<Vec<u8>>>,
    base_phys: u64,
    next: Mutex<usize>,
}

impl ArenaAllocator {
    pub fn new(size: usize, base_phys: u64) -> Self {
        Self {
            arena: Arc::new(Mutex::new(vec![0u8; size])),
            base_phys,
            next: Mutex::new(0),
        }
    }

    /// Shared view of the arena bytes. The mock HBA in tests uses this to
    /// play the hardware side of a transfer.
    pub fn arena(&self) -> Arc<Mutex<Vec<u8>>> {
        self.arena.clone()
    }

    pub fn base_phys(&self) -> u64 {
        self.base_phys
    }
}

impl DmaAllocator for ArenaAllocator {
    fn alloc(&self, len: usize, align: usize) -> DriverResult<DmaBuffer> {
        let align = align.max(1);
        let mut next = self.next.lock();
        let start = (*next + align - 1) / align * align;
        let arena_len = self.arena.lock().len();
        if start + len > arena_len {
            return Err(DriverError::Backend("dma arena exhausted".into()));
        }
        *next = start + len;
        Ok(DmaBuffer {
            arena: self.arena.clone(),
            offset: start,
            len,
            phys: self.base_phys + start as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_alloc_alignment_and_phys() {
        let arena = ArenaAllocator::new(4096, 0x1000_0000);
        let a = arena.alloc(100, 1024).unwrap();
        let b = arena.alloc(100, 1024).unwrap();
        assert_eq!(a.phys(), 0x1000_0000);
        assert_eq!(b.phys(), 0x1000_0400);
    }

    #[test]
    fn test_arena_exhaustion() {
        let arena = ArenaAllocator::new(256, 0);
        arena.alloc(200, 1).unwrap();
        assert!(matches!(
            arena.alloc(100, 1),
            Err(DriverError::Backend(_))
        ));
    }

    #[test]
    fn test_dma_buffer_read_write() {
        let arena = ArenaAllocator::new(1024, 0x8000);
        let buf = arena.alloc(16, 16).unwrap();
        buf.write(4, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        buf.read(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        assert!(buf.write(14, &[0; 4]).is_err());
    }

    #[test]
    fn test_register_irq_command_format() {
        let mut ctl = Vec::new();
        register_irq(&mut ctl, 11, "sata0").unwrap();
        assert_eq!(ctl, b"register 11 sata0\n");
    }
}
