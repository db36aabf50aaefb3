//! Block device driver
//!
//! Exports sector-addressed storage as a 9P file tree:
//!
//! ```text
//! disk/                 directory
//! disk/N/               one directory per device
//! disk/N/data           raw device, length = capacity x sector_size
//! disk/N/ctl            key/value status; accepts "flush" and "rescan"
//! disk/N/geometry       legacy CHS geometry, read-only
//! disk/N/part/M         one file per discovered partition
//! ```
//!
//! Byte offsets are translated to sector spans; sub-sector writes go
//! through read-modify-write. Partition tables are discovered on start and
//! on a ctl "rescan".

pub mod crc32;
pub mod partition;
pub mod sata;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use parking_lot::RwLock;

use crate::device::StorageBackend;
use crate::error::{DriverError, DriverResult};
use crate::fabric::{
    Capability, CancelToken, Driver, DriverConfig, Health, HealthState, HealthStatus,
};
use crate::proto::{Qid, Stat, DMDIR, OTRUNC, QTDIR, QTFILE};
use crate::server::{FileServer, QidRegistry};

pub use partition::Partition;

/// Reported length of the small control files.
const CTL_FILE_SIZE: u64 = 128;

/// One exported block device.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub name: String,
    pub sector_size: u32,
    pub sectors: u64,
    pub model: String,
    pub serial: String,
    pub partitions: Vec<Partition>,
}

impl BlockDevice {
    fn capacity_bytes(&self) -> u64 {
        self.sectors * self.sector_size as u64
    }
}

/// Parsed form of the strict path grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPath {
    Root,
    DiskDir,
    DeviceDir(usize),
    Data(usize),
    Ctl(usize),
    Geometry(usize),
    PartDir(usize),
    Part(usize, usize),
}

fn parse_index(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_path(path: &str) -> DriverResult<BlockPath> {
    if path.is_empty() {
        return Ok(BlockPath::Root);
    }
    let invalid = || DriverError::InvalidPath(path.to_string());

    let mut segs = path.split('/');
    if segs.next() != Some("disk") {
        return Err(invalid());
    }
    let Some(dev_seg) = segs.next() else {
        return Ok(BlockPath::DiskDir);
    };
    let dev = parse_index(dev_seg).ok_or_else(invalid)?;

    let Some(file) = segs.next() else {
        return Ok(BlockPath::DeviceDir(dev));
    };
    match file {
        "data" => {
            if segs.next().is_some() {
                return Err(invalid());
            }
            Ok(BlockPath::Data(dev))
        }
        "ctl" => {
            if segs.next().is_some() {
                return Err(invalid());
            }
            Ok(BlockPath::Ctl(dev))
        }
        "geometry" => {
            if segs.next().is_some() {
                return Err(invalid());
            }
            Ok(BlockPath::Geometry(dev))
        }
        "part" => {
            let Some(part_seg) = segs.next() else {
                return Ok(BlockPath::PartDir(dev));
            };
            if segs.next().is_some() {
                return Err(invalid());
            }
            let part = parse_index(part_seg).ok_or_else(invalid)?;
            Ok(BlockPath::Part(dev, part))
        }
        _ => Err(invalid()),
    }
}

/// Block device driver: lifecycle facet plus the 9P file-server facet.
pub struct BlockDriver {
    name: String,
    config: RwLock<DriverConfig>,
    backend: Arc<dyn StorageBackend>,
    devices: RwLock<Vec<BlockDevice>>,
    health: HealthState,
    cancel: CancelToken,
    qids: QidRegistry,
    boot_time: u32,
}

impl BlockDriver {
    /// Capabilities a block driver refuses to run without.
    pub const REQUIRED_CAPS: Capability = Capability(
        Capability::DEVICE_ACCESS.0 | Capability::INTERRUPT.0 | Capability::DMA.0,
    );

    pub fn new(name: &str, backend: Arc<dyn StorageBackend>) -> Self {
        let boot_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            name: name.to_string(),
            config: RwLock::new(DriverConfig::default()),
            backend,
            devices: RwLock::new(Vec::new()),
            health: HealthState::new(),
            cancel: CancelToken::new(),
            qids: QidRegistry::new(),
            boot_time,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Refuse work once the root context is gone.
    fn check_running(&self) -> DriverResult<()> {
        if self.cancel.is_cancelled() {
            if self.health.status() == HealthStatus::Stopped {
                return Err(DriverError::Stopped);
            }
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    /// Record an operation failure on the health counters before
    /// surfacing it.
    fn fail_op(&self, err: DriverError) -> DriverError {
        match &err {
            DriverError::Backend(_) => self.health.record_error(&err),
            DriverError::Internal(_) => self.health.fail(&err),
            _ => {}
        }
        err
    }

    fn device(&self, index: usize) -> DriverResult<BlockDevice> {
        self.devices
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("disk/{}", index)))
    }

    fn partition(&self, dev: &BlockDevice, number: usize) -> DriverResult<Partition> {
        dev.partitions
            .iter()
            .find(|p| p.number == number)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("{}/part/{}", dev.name, number)))
    }

    // ------------------------------------------------------------------
    // Raw device I/O
    // ------------------------------------------------------------------

    /// Read `count` bytes at a byte offset, crossing sector boundaries as
    /// needed. Crossing the device end yields a short read.
    fn read_device(&self, index: usize, offset: u64, count: u32) -> DriverResult<Vec<u8>> {
        let dev = self.device(index)?;
        let ss = dev.sector_size as u64;
        if count == 0 || offset >= dev.capacity_bytes() {
            return Ok(Vec::new());
        }

        let start = offset / ss;
        let byte_off = (offset % ss) as usize;
        let mut nsec = (count as u64 + byte_off as u64).div_ceil(ss).max(1);
        nsec = nsec.min(dev.sectors - start);

        let mut buf = vec![0u8; (nsec * ss) as usize];
        for i in 0..nsec {
            self.check_running()?;
            let span = (i * ss) as usize..((i + 1) * ss) as usize;
            self.backend
                .read_sector(index, start + i, &mut buf[span])
                .map_err(|e| self.fail_op(backend_err("read", start + i, e)))?;
        }

        let end = (byte_off + count as usize).min(buf.len());
        Ok(buf[byte_off..end].to_vec())
    }

    /// Write at a byte offset. Sub-sector ends read the whole span first
    /// (read-modify-write); a failed backing read fails the write rather
    /// than zero-filling. Any sector write failure fails the whole
    /// operation; sectors already written stay written and the count that
    /// reached the device goes to the log.
    fn write_device(&self, index: usize, offset: u64, data: &[u8]) -> DriverResult<u32> {
        let dev = self.device(index)?;
        let ss = dev.sector_size as u64;
        if data.is_empty() {
            return Ok(0);
        }
        let end_offset = offset + data.len() as u64;
        if end_offset > dev.capacity_bytes() {
            return Err(DriverError::OutOfRange {
                offset: end_offset,
                limit: dev.capacity_bytes(),
            });
        }

        let start = offset / ss;
        let byte_off = (offset % ss) as usize;
        let nsec = (data.len() as u64 + byte_off as u64).div_ceil(ss).max(1);
        let partial = byte_off != 0 || (byte_off + data.len()) % ss as usize != 0;

        let mut buf = vec![0u8; (nsec * ss) as usize];
        if partial {
            for i in 0..nsec {
                self.check_running()?;
                let span = (i * ss) as usize..((i + 1) * ss) as usize;
                self.backend
                    .read_sector(index, start + i, &mut buf[span])
                    .map_err(|e| self.fail_op(backend_err("rmw read", start + i, e)))?;
            }
        }
        buf[byte_off..byte_off + data.len()].copy_from_slice(data);

        for i in 0..nsec {
            self.check_running()?;
            let span = (i * ss) as usize..((i + 1) * ss) as usize;
            if let Err(err) = self.backend.write_sector(index, start + i, &buf[span]) {
                let err = self.fail_op(backend_err("write", start + i, err));
                let written = (i * ss).saturating_sub(byte_off as u64).min(data.len() as u64);
                warn!(
                    "{}: write on disk/{} at offset {} failed after {} bytes: {}",
                    self.name, index, offset, written, err
                );
                return Err(err);
            }
        }

        self.qids.bump(&format!("disk/{}/data", index));
        Ok(data.len() as u32)
    }

    // ------------------------------------------------------------------
    // Partition I/O
    // ------------------------------------------------------------------

    fn read_partition(
        &self,
        index: usize,
        number: usize,
        offset: u64,
        count: u32,
    ) -> DriverResult<Vec<u8>> {
        let dev = self.device(index)?;
        let part = self.partition(&dev, number)?;
        let ss = dev.sector_size as u64;
        let span_bytes = (part.end_lba - part.start_lba + 1) * ss;
        if offset >= span_bytes {
            return Ok(Vec::new());
        }
        let count = (count as u64).min(span_bytes - offset) as u32;
        self.read_device(index, part.start_lba * ss + offset, count)
    }

    fn write_partition(
        &self,
        index: usize,
        number: usize,
        offset: u64,
        data: &[u8],
    ) -> DriverResult<u32> {
        let dev = self.device(index)?;
        let part = self.partition(&dev, number)?;
        let ss = dev.sector_size as u64;
        let span_bytes = (part.end_lba - part.start_lba + 1) * ss;
        if offset + data.len() as u64 > span_bytes {
            return Err(DriverError::OutOfRange {
                offset: offset + data.len() as u64,
                limit: span_bytes,
            });
        }
        self.write_device(index, part.start_lba * ss + offset, data)
    }

    // ------------------------------------------------------------------
    // Control files
    // ------------------------------------------------------------------

    fn ctl_text(&self, index: usize) -> DriverResult<String> {
        let dev = self.device(index)?;
        Ok(format!(
            "device {}\nmodel {}\nserial {}\ncapacity {}\nsector_size {}\n",
            dev.name, dev.model, dev.serial, dev.sectors, dev.sector_size
        ))
    }

    fn geometry_text(&self, index: usize) -> DriverResult<String> {
        let dev = self.device(index)?;
        let cylinders = (dev.sectors / (255 * 63)).max(1);
        Ok(format!(
            "sectors {}\nsecsize {}\ncylinders {}\nheads 255\nsectors/track 63\n",
            dev.sectors, dev.sector_size, cylinders
        ))
    }

    fn ctl_write(&self, index: usize, data: &[u8]) -> DriverResult<u32> {
        let text = std::str::from_utf8(data)
            .map_err(|_| DriverError::InvalidPath("ctl command is not text".into()))?;
        let cmd = text.trim_end();
        match cmd {
            "flush" => {
                self.backend
                    .flush(index)
                    .map_err(|e| self.fail_op(e))?;
            }
            "rescan" => self.rescan(index)?,
            _ => {
                return Err(DriverError::Readonly(format!(
                    "unknown control command: {}",
                    cmd
                )))
            }
        }
        Ok(data.len() as u32)
    }

    /// Re-read the partition table: sector 0 decides MBR vs GPT (GPT when
    /// sector 1 carries the "EFI PART" signature).
    pub fn rescan(&self, index: usize) -> DriverResult<()> {
        let dev = self.device(index)?;
        let ss = dev.sector_size as usize;

        let mut sector0 = vec![0u8; ss];
        self.backend
            .read_sector(index, 0, &mut sector0)
            .map_err(|e| self.fail_op(backend_err("read", 0, e)))?;
        if !partition::has_boot_signature(&sector0) {
            return Err(DriverError::NotFound("no valid partition table".into()));
        }

        let mut sector1 = vec![0u8; ss];
        self.backend
            .read_sector(index, 1, &mut sector1)
            .map_err(|e| self.fail_op(backend_err("read", 1, e)))?;

        let parts = if partition::has_gpt_signature(&sector1) {
            let backend = &self.backend;
            let mut read = |lba: u64, buf: &mut [u8]| backend.read_sector(index, lba, buf);
            partition::parse_gpt(&mut read, dev.sector_size, dev.sectors)?
        } else if partition::has_protective_entry(&sector0) {
            // A protective MBR with no valid GPT behind it is damage, not
            // a one-partition disk.
            return Err(DriverError::NotFound(
                "protective MBR without valid GPT".into(),
            ));
        } else {
            partition::parse_mbr(&sector0)?
        };

        let mut devices = self.devices.write();
        let slot = devices
            .get_mut(index)
            .ok_or_else(|| DriverError::NotFound(format!("disk/{}", index)))?;
        slot.partitions = parts;
        self.qids.bump(&format!("disk/{}/part", index));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    fn make_stat(&self, path: &str, name: &str, qtype: u8, mode: u32, length: u64) -> Stat {
        Stat {
            stype: 0,
            dev: 0,
            qid: self.qids.qid(path, qtype),
            mode,
            atime: self.boot_time,
            mtime: self.boot_time,
            length,
            name: name.to_string(),
            uid: "sys".into(),
            gid: "sys".into(),
            muid: "sys".into(),
        }
    }

    fn stat_path(&self, path: &str) -> DriverResult<Stat> {
        match parse_path(path)? {
            BlockPath::Root => Ok(self.make_stat("", &self.name, QTDIR, DMDIR | 0o755, 0)),
            BlockPath::DiskDir => Ok(self.make_stat("disk", "disk", QTDIR, DMDIR | 0o755, 0)),
            BlockPath::DeviceDir(i) => {
                self.device(i)?;
                Ok(self.make_stat(path, &i.to_string(), QTDIR, DMDIR | 0o755, 0))
            }
            BlockPath::Data(i) => {
                let dev = self.device(i)?;
                Ok(self.make_stat(path, "data", QTFILE, 0o666, dev.capacity_bytes()))
            }
            BlockPath::Ctl(i) => {
                self.device(i)?;
                Ok(self.make_stat(path, "ctl", QTFILE, 0o664, CTL_FILE_SIZE))
            }
            BlockPath::Geometry(i) => {
                self.device(i)?;
                Ok(self.make_stat(path, "geometry", QTFILE, 0o444, CTL_FILE_SIZE))
            }
            BlockPath::PartDir(i) => {
                self.device(i)?;
                Ok(self.make_stat(path, "part", QTDIR, DMDIR | 0o755, 0))
            }
            BlockPath::Part(i, m) => {
                let dev = self.device(i)?;
                let part = self.partition(&dev, m)?;
                let span = (part.end_lba - part.start_lba + 1) * dev.sector_size as u64;
                Ok(self.make_stat(path, &m.to_string(), QTFILE, 0o666, span))
            }
        }
    }
}

fn backend_err(op: &str, lba: u64, err: DriverError) -> DriverError {
    match err {
        DriverError::Backend(msg) => {
            DriverError::Backend(format!("{} sector {}: {}", op, lba, msg))
        }
        other => other,
    }
}

// ============================================================================
// Lifecycle facet
// ============================================================================

impl Driver for BlockDriver {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn initialize(&self, config: &DriverConfig) -> DriverResult<()> {
        if !config.capabilities.contains(Self::REQUIRED_CAPS) {
            return Err(DriverError::Config(
                "block driver requires DeviceAccess, Interrupt and DMA capabilities".into(),
            ));
        }
        self.health.set_status(HealthStatus::Starting, "initializing");
        *self.config.write() = config.clone();

        self.backend.init()?;

        let mut devices = Vec::new();
        for i in 0..self.backend.device_count() {
            let sectors = match self.backend.capacity(i) {
                Ok(sectors) => sectors,
                Err(err) => {
                    warn!("{}: no capacity for device {}: {}", self.name, i, err);
                    0
                }
            };
            devices.push(BlockDevice {
                name: format!("sd{}", i),
                sector_size: self.backend.sector_size(i),
                sectors,
                model: self.backend.model(i),
                serial: self.backend.serial(i),
                partitions: Vec::new(),
            });
        }
        *self.devices.write() = devices;
        Ok(())
    }

    fn start(&self) -> DriverResult<()> {
        let count = self.devices.read().len();
        for i in 0..count {
            // Raw access still works on an unpartitioned or damaged disk.
            if let Err(err) = self.rescan(i) {
                warn!("{}: partition scan of disk/{} failed: {}", self.name, i, err);
            }
        }
        self.health.set_status(HealthStatus::Healthy, "serving");
        Ok(())
    }

    fn stop(&self) -> DriverResult<()> {
        self.cancel.cancel();
        self.health.set_status(HealthStatus::Stopped, "stopped");
        Ok(())
    }

    fn health(&self) -> Health {
        self.health.snapshot()
    }

    fn config(&self) -> DriverConfig {
        self.config.read().clone()
    }
}

// ============================================================================
// Device facet
// ============================================================================

impl crate::fabric::DeviceOps for BlockDriver {
    fn probe(&self, ctx: &CancelToken) -> DriverResult<Vec<String>> {
        ctx.check()?;
        Ok(self.devices.read().iter().map(|d| d.name.clone()).collect())
    }

    fn attach_device(&self, ctx: &CancelToken, device: &str) -> DriverResult<()> {
        ctx.check()?;
        let index = self
            .devices
            .read()
            .iter()
            .position(|d| d.name == device)
            .ok_or_else(|| DriverError::NotFound(format!("device {}", device)))?;
        if let Err(err) = self.rescan(index) {
            // Raw access still works without a partition table.
            warn!("{}: partition scan of {} failed: {}", self.name, device, err);
        }
        Ok(())
    }

    fn detach_device(&self, _ctx: &CancelToken, device: &str) -> DriverResult<()> {
        Err(DriverError::Config(format!(
            "device {} is fixed and cannot be detached",
            device
        )))
    }

    fn handle_interrupt(&self, ctx: &CancelToken, _irq: u32) -> DriverResult<()> {
        ctx.check()?;
        // Completion interrupts are consumed by the backend's handler
        // thread; this entry point only keeps the counters honest.
        self.health.record_request();
        Ok(())
    }
}

// ============================================================================
// File-server facet
// ============================================================================

impl FileServer for BlockDriver {
    fn attach(&self, _uname: &str, _aname: &str) -> DriverResult<Qid> {
        self.check_running()?;
        Ok(self.qids.qid("", QTDIR))
    }

    fn walk(&self, path: &str, name: &str) -> DriverResult<(String, Qid)> {
        self.check_running()?;
        let candidate = if path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", path, name)
        };
        let stat = self.stat_path(&candidate)?;
        Ok((candidate, stat.qid))
    }

    fn open(&self, path: &str, mode: u8) -> DriverResult<(Qid, u32)> {
        self.check_running()?;
        let stat = self.stat_path(path)?;
        if stat.qid.is_dir() && (mode & 3 != 0 || mode & OTRUNC != 0) {
            return Err(DriverError::Readonly("cannot open directory for writing".into()));
        }
        Ok((stat.qid, 0))
    }

    fn create(&self, _path: &str, _name: &str, _perm: u32, _mode: u8)
        -> DriverResult<(String, Qid, u32)> {
        Err(DriverError::Readonly("cannot create device files".into()))
    }

    fn read(&self, path: &str, offset: u64, count: u32) -> DriverResult<Vec<u8>> {
        self.health.record_request();
        self.check_running()?;
        match parse_path(path)? {
            BlockPath::Data(i) => self.read_device(i, offset, count),
            BlockPath::Ctl(i) => Ok(slice_text(&self.ctl_text(i)?, offset, count)),
            BlockPath::Geometry(i) => Ok(slice_text(&self.geometry_text(i)?, offset, count)),
            BlockPath::Part(i, m) => self.read_partition(i, m, offset, count),
            _ => Err(DriverError::InvalidPath(format!("cannot read from {}", path))),
        }
    }

    fn write(&self, path: &str, offset: u64, data: &[u8]) -> DriverResult<u32> {
        self.health.record_request();
        self.check_running()?;
        match parse_path(path)? {
            BlockPath::Data(i) => self.write_device(i, offset, data),
            BlockPath::Ctl(i) => self.ctl_write(i, data),
            BlockPath::Part(i, m) => self.write_partition(i, m, offset, data),
            BlockPath::Geometry(_) => {
                Err(DriverError::Readonly("geometry is read-only".into()))
            }
            _ => Err(DriverError::InvalidPath(format!("cannot write to {}", path))),
        }
    }

    fn readdir(&self, path: &str) -> DriverResult<Vec<Stat>> {
        self.check_running()?;
        match parse_path(path)? {
            BlockPath::Root => Ok(vec![self.stat_path("disk")?]),
            BlockPath::DiskDir => {
                let count = self.devices.read().len();
                (0..count).map(|i| self.stat_path(&format!("disk/{}", i))).collect()
            }
            BlockPath::DeviceDir(i) => {
                self.device(i)?;
                ["data", "ctl", "geometry", "part"]
                    .iter()
                    .map(|f| self.stat_path(&format!("disk/{}/{}", i, f)))
                    .collect()
            }
            BlockPath::PartDir(i) => {
                let dev = self.device(i)?;
                dev.partitions
                    .iter()
                    .map(|p| self.stat_path(&format!("disk/{}/part/{}", i, p.number)))
                    .collect()
            }
            _ => Err(DriverError::InvalidPath(format!("{} is not a directory", path))),
        }
    }

    fn stat(&self, path: &str) -> DriverResult<Stat> {
        self.check_running()?;
        self.stat_path(path)
    }

    fn wstat(&self, _path: &str, _stat: &Stat) -> DriverResult<()> {
        Err(DriverError::Readonly("cannot modify device file metadata".into()))
    }

    fn remove(&self, _path: &str) -> DriverResult<()> {
        Err(DriverError::Readonly("cannot remove device files".into()))
    }
}

fn slice_text(text: &str, offset: u64, count: u32) -> Vec<u8> {
    let bytes = text.as_bytes();
    let start = (offset as usize).min(bytes.len());
    let end = (start + count as usize).min(bytes.len());
    bytes[start..end].to_vec()
}
