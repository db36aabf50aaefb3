//! SATA controller storage backend
//!
//! An AHCI-style host bus adapter driven through the hardware surfaces in
//! [`crate::hw`]: registers over a locked MMIO region, completion through a
//! dedicated interrupt-handler thread, transfers through DMA buffers.
//!
//! Locking order: the port lock covers command-slot use and the completion
//! wait; every register access takes the controller-wide MMIO lock for its
//! duration only. The interrupt thread never takes a port lock, it only
//! signals the port's completion channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::device::StorageBackend;
use crate::error::{DriverError, DriverResult};
use crate::fabric::CancelToken;
use crate::hw::{DmaAllocator, DmaBuffer, IrqEvents, Mmio};

// ============================================================================
// Register map (generic host control, offsets from the controller base)
// ============================================================================

pub const HBA_CAP: u64 = 0x00;
pub const HBA_GHC: u64 = 0x04;
pub const HBA_IS: u64 = 0x08;
pub const HBA_PI: u64 = 0x0C;
pub const HBA_VS: u64 = 0x10;

pub const GHC_AE: u32 = 1 << 31; // AHCI Enable
pub const GHC_IE: u32 = 1 << 1; // Interrupt Enable

// Port registers, offsets from the port base
pub const PORT_CLB: u64 = 0x00; // Command List Base
pub const PORT_CLBU: u64 = 0x04;
pub const PORT_FB: u64 = 0x08; // FIS Base
pub const PORT_FBU: u64 = 0x0C;
pub const PORT_IS: u64 = 0x10; // Interrupt Status
pub const PORT_IE: u64 = 0x14; // Interrupt Enable
pub const PORT_CMD: u64 = 0x18; // Command and Status
pub const PORT_TFD: u64 = 0x20; // Task File Data
pub const PORT_SIG: u64 = 0x24; // Signature
pub const PORT_SSTS: u64 = 0x28; // SATA Status
pub const PORT_SERR: u64 = 0x30; // SATA Error
pub const PORT_CI: u64 = 0x38; // Command Issue

pub const PORT_CMD_ST: u32 = 1 << 0; // Start
pub const PORT_CMD_FRE: u32 = 1 << 4; // FIS Receive Enable

pub const PORT_TFD_ERR: u32 = 1 << 0;

pub const SATA_SIG_ATA: u32 = 0x0000_0101;

pub const SSTS_DET_MASK: u32 = 0x0F;
pub const SSTS_DET_PRESENT: u32 = 0x03;

pub const ATA_CMD_IDENTIFY: u8 = 0xEC;
pub const ATA_CMD_READ_DMA_EX: u8 = 0x25;
pub const ATA_CMD_WRITE_DMA_EX: u8 = 0x35;
pub const ATA_CMD_FLUSH_EX: u8 = 0xEA;

pub const SECTOR_SIZE: u32 = 512;

/// Offset of the first port register block and the per-port stride.
fn port_base(port: u32) -> u64 {
    0x100 + port as u64 * 0x80
}

/// How long a command may stay in flight before the port is declared dead.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Port
// ============================================================================

struct SataPort {
    /// Hardware port number (bit index in HBA_PI / HBA_IS)
    hw_port: u32,
    base: u64,
    mmio: Arc<Mmio>,
    completion_tx: Sender<()>,
    completion_rx: Receiver<()>,
    state: Mutex<PortState>,
}

struct PortState {
    sectors: u64,
    model: String,
    serial: String,
    cmd_list: DmaBuffer,
    table: DmaBuffer,
    data: DmaBuffer,
}

impl SataPort {
    fn bring_up(
        mmio: Arc<Mmio>,
        dma: &dyn DmaAllocator,
        hw_port: u32,
    ) -> DriverResult<SataPort> {
        let base = port_base(hw_port);

        let ssts = mmio.read32(base + PORT_SSTS)?;
        if ssts & SSTS_DET_MASK != SSTS_DET_PRESENT {
            return Err(DriverError::NotFound(format!(
                "port {}: no device (DET={})",
                hw_port,
                ssts & SSTS_DET_MASK
            )));
        }
        let sig = mmio.read32(base + PORT_SIG)?;
        if sig != SATA_SIG_ATA {
            return Err(DriverError::NotFound(format!(
                "port {}: unsupported signature {:#x}",
                hw_port, sig
            )));
        }

        // Command list 1K/1K-aligned, received-FIS 256/256, one command
        // table 256/128, one sector-sized bounce buffer.
        let cmd_list = dma.alloc(1024, 1024)?;
        let fis = dma.alloc(256, 256)?;
        let table = dma.alloc(256, 128)?;
        let data = dma.alloc(4096, 128)?;

        mmio.write32(base + PORT_CLB, cmd_list.phys() as u32)?;
        mmio.write32(base + PORT_CLBU, (cmd_list.phys() >> 32) as u32)?;
        mmio.write32(base + PORT_FB, fis.phys() as u32)?;
        mmio.write32(base + PORT_FBU, (fis.phys() >> 32) as u32)?;

        // Clear stale status, enable FIS receive, start the engine, unmask.
        mmio.write32(base + PORT_IS, 0xFFFF_FFFF)?;
        mmio.write32(base + PORT_SERR, 0xFFFF_FFFF)?;
        let cmd = mmio.read32(base + PORT_CMD)?;
        mmio.write32(base + PORT_CMD, cmd | PORT_CMD_FRE)?;
        let cmd = mmio.read32(base + PORT_CMD)?;
        mmio.write32(base + PORT_CMD, cmd | PORT_CMD_ST)?;
        mmio.write32(base + PORT_IE, 0xFFFF_FFFF)?;

        let (completion_tx, completion_rx) = bounded(1);
        Ok(SataPort {
            hw_port,
            base,
            mmio,
            completion_tx,
            completion_rx,
            state: Mutex::new(PortState {
                sectors: 0,
                model: String::new(),
                serial: String::new(),
                cmd_list,
                table,
                data,
            }),
        })
    }

    /// Program slot 0 with one command and issue it. Caller holds the port
    /// lock through the completion wait.
    fn issue(&self, state: &PortState, command: u8, lba: u64, count: u16, write: bool,
             byte_count: u32) -> DriverResult<()> {
        let ci = self.mmio.read32(self.base + PORT_CI)?;
        if ci & 1 != 0 {
            return Err(DriverError::Backend(format!(
                "port {}: command slot busy",
                self.hw_port
            )));
        }

        // Register host-to-device FIS.
        let mut fis = [0u8; 20];
        fis[0] = 0x27; // FIS type: register H2D
        fis[1] = 0x80; // command bit
        fis[2] = command;
        fis[4] = lba as u8;
        fis[5] = (lba >> 8) as u8;
        fis[6] = (lba >> 16) as u8;
        fis[7] = 0x40; // LBA mode
        fis[8] = (lba >> 24) as u8;
        fis[9] = (lba >> 32) as u8;
        fis[10] = (lba >> 40) as u8;
        fis[12] = count as u8;
        fis[13] = (count >> 8) as u8;
        state.table.zero();
        state.table.write(0, &fis)?;

        // One PRDT entry at table offset 0x80.
        if byte_count > 0 {
            let mut prdt = [0u8; 16];
            prdt[0..4].copy_from_slice(&(state.data.phys() as u32).to_le_bytes());
            prdt[4..8].copy_from_slice(&((state.data.phys() >> 32) as u32).to_le_bytes());
            prdt[12..16].copy_from_slice(&(byte_count - 1).to_le_bytes());
            state.table.write(0x80, &prdt)?;
        }

        // Command header 0: FIS length 5 dwords, write direction bit,
        // PRDT entry count, then the table address.
        let prdtl: u32 = if byte_count > 0 { 1 } else { 0 };
        let dword0 = 5 | (u32::from(write) << 6) | (prdtl << 16);
        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&dword0.to_le_bytes());
        header[8..12].copy_from_slice(&(state.table.phys() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&((state.table.phys() >> 32) as u32).to_le_bytes());
        state.cmd_list.write(0, &header)?;

        self.mmio.write32(self.base + PORT_CI, 1)?;
        Ok(())
    }

    /// Wait for the interrupt handler to signal completion, then check the
    /// task file. An in-flight command is never abandoned early.
    fn wait_complete(&self) -> DriverResult<()> {
        self.completion_rx
            .recv_timeout(COMMAND_TIMEOUT)
            .map_err(|_| {
                DriverError::Backend(format!("port {}: command timeout", self.hw_port))
            })?;
        let tfd = self.mmio.read32(self.base + PORT_TFD)?;
        if tfd & PORT_TFD_ERR != 0 {
            return Err(DriverError::Backend(format!(
                "port {}: device error (TFD={:#x})",
                self.hw_port, tfd
            )));
        }
        Ok(())
    }

    fn identify(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.issue(&state, ATA_CMD_IDENTIFY, 0, 0, false, 512)?;
        self.wait_complete()?;

        let mut raw = [0u8; 512];
        state.data.read(0, &mut raw)?;
        let word = |i: usize| u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);

        // LBA48 count in words 100..104, LBA28 fallback in 60..62.
        let mut sectors = (word(100) as u64)
            | (word(101) as u64) << 16
            | (word(102) as u64) << 32
            | (word(103) as u64) << 48;
        if sectors == 0 {
            sectors = (word(60) as u64) | (word(61) as u64) << 16;
        }
        state.sectors = sectors;
        state.serial = ata_string(&raw, 10, 10);
        state.model = ata_string(&raw, 27, 20);
        Ok(())
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> DriverResult<()> {
        let state = self.state.lock();
        self.issue(&state, ATA_CMD_READ_DMA_EX, lba, 1, false, buf.len() as u32)?;
        self.wait_complete()?;
        state.data.read(0, buf)
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> DriverResult<()> {
        let state = self.state.lock();
        state.data.write(0, buf)?;
        self.issue(&state, ATA_CMD_WRITE_DMA_EX, lba, 1, true, buf.len() as u32)?;
        self.wait_complete()
    }

    fn flush(&self) -> DriverResult<()> {
        let state = self.state.lock();
        self.issue(&state, ATA_CMD_FLUSH_EX, 0, 0, false, 0)?;
        self.wait_complete()
    }
}

/// ATA identify strings are byte-swapped 16-bit words, space padded.
fn ata_string(raw: &[u8], word_start: usize, word_len: usize) -> String {
    let mut out = String::with_capacity(word_len * 2);
    for i in 0..word_len {
        let off = (word_start + i) * 2;
        out.push(raw[off + 1] as char);
        out.push(raw[off] as char);
    }
    out.trim().to_string()
}

// ============================================================================
// Controller
// ============================================================================

pub struct SataController {
    mmio: Arc<Mmio>,
    ports: Vec<Arc<SataPort>>,
    cancel: CancelToken,
    irq_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SataController {
    /// Bring up the HBA: enable AHCI mode and interrupts, initialize every
    /// implemented port with a present ATA device, start the interrupt
    /// thread, then identify each device.
    pub fn new(
        mmio: Arc<Mmio>,
        irq: Box<dyn IrqEvents>,
        dma: Arc<dyn DmaAllocator>,
        cancel: CancelToken,
    ) -> DriverResult<SataController> {
        let ghc = mmio.read32(HBA_GHC)?;
        mmio.write32(HBA_GHC, ghc | GHC_AE)?;
        let ghc = mmio.read32(HBA_GHC)?;
        mmio.write32(HBA_GHC, ghc | GHC_IE)?;

        let implemented = mmio.read32(HBA_PI)?;
        let mut ports = Vec::new();
        for bit in 0..32 {
            if implemented & (1 << bit) == 0 {
                continue;
            }
            match SataPort::bring_up(mmio.clone(), dma.as_ref(), bit) {
                Ok(port) => ports.push(Arc::new(port)),
                Err(err) => warn!("sata: skipping port {}: {}", bit, err),
            }
        }

        let controller = SataController {
            mmio: mmio.clone(),
            ports,
            cancel: cancel.clone(),
            irq_thread: Mutex::new(None),
        };
        controller.spawn_irq_thread(irq)?;

        for port in &controller.ports {
            port.identify()?;
            let state = port.state.lock();
            info!(
                "sata: port {}: {} ({} sectors)",
                port.hw_port, state.model, state.sectors
            );
        }
        Ok(controller)
    }

    /// The interrupt handler is a dedicated long-lived thread: block on the
    /// event file, read status under the controller lock, signal port
    /// waiters. A signal nobody consumed is dropped; the in-flight command
    /// observes completion when it next reads status.
    fn spawn_irq_thread(&self, mut irq: Box<dyn IrqEvents>) -> DriverResult<()> {
        let ports = self.ports.clone();
        let mmio = self.mmio.clone();
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name("sata-irq".into())
            .spawn(move || loop {
                if cancel.is_cancelled() {
                    return;
                }
                match irq.wait() {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(err) => {
                        error!("sata: irq wait failed: {}", err);
                        return;
                    }
                }

                let is = match mmio.read32(HBA_IS) {
                    Ok(is) => is,
                    Err(err) => {
                        error!("sata: interrupt status read failed: {}", err);
                        return;
                    }
                };
                for port in &ports {
                    if is & (1 << port.hw_port) == 0 {
                        continue;
                    }
                    if let Ok(pis) = mmio.read32(port.base + PORT_IS) {
                        let _ = mmio.write32(port.base + PORT_IS, pis);
                    }
                    let _ = port.completion_tx.try_send(());
                }
                let _ = mmio.write32(HBA_IS, is);
            })
            .map_err(|err| DriverError::Internal(format!("irq thread spawn failed: {}", err)))?;
        *self.irq_thread.lock() = Some(handle);
        Ok(())
    }

    fn port(&self, device: usize) -> DriverResult<&Arc<SataPort>> {
        self.ports
            .get(device)
            .ok_or_else(|| DriverError::NotFound(format!("sata device {}", device)))
    }

    fn check_buf(&self, buf: &[u8]) -> DriverResult<()> {
        if buf.len() != SECTOR_SIZE as usize {
            return Err(DriverError::Internal(format!(
                "sector buffer is {} bytes, expected {}",
                buf.len(),
                SECTOR_SIZE
            )));
        }
        Ok(())
    }
}

impl StorageBackend for SataController {
    fn init(&self) -> DriverResult<()> {
        Ok(())
    }

    fn device_count(&self) -> usize {
        self.ports.len()
    }

    fn capacity(&self, device: usize) -> DriverResult<u64> {
        Ok(self.port(device)?.state.lock().sectors)
    }

    fn sector_size(&self, _device: usize) -> u32 {
        SECTOR_SIZE
    }

    fn read_sector(&self, device: usize, lba: u64, buf: &mut [u8]) -> DriverResult<()> {
        self.check_buf(buf)?;
        self.cancel.check()?;
        self.port(device)?.read_sectors(lba, buf)
    }

    fn write_sector(&self, device: usize, lba: u64, buf: &[u8]) -> DriverResult<()> {
        self.check_buf(buf)?;
        self.cancel.check()?;
        self.port(device)?.write_sectors(lba, buf)
    }

    fn flush(&self, device: usize) -> DriverResult<()> {
        self.cancel.check()?;
        self.port(device)?.flush()
    }

    fn model(&self, device: usize) -> String {
        self.port(device)
            .map(|p| p.state.lock().model.clone())
            .unwrap_or_default()
    }

    fn serial(&self, device: usize) -> String {
        self.port(device)
            .map(|p| p.state.lock().serial.clone())
            .unwrap_or_default()
    }
}

impl Drop for SataController {
    fn drop(&mut self) {
        self.cancel.cancel();
        // The irq thread exits on the next event or source close; do not
        // join here, the event source may be blocked indefinitely.
        let _ = self.irq_thread.lock().take();
    }
}
