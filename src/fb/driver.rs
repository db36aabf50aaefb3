//! Framebuffer driver
//!
//! Exports screens as a 9P file tree:
//!
//! ```text
//! draw/                       directory
//! draw/screenN/               one directory per screen
//! draw/screenN/info           R   key/value description
//! draw/screenN/data           R/W shadow bytes; text form "x y r g b"
//! draw/screenN/text           W   render at the cursor, auto-flush
//! draw/screenN/rect           W   "x y w h r g b", auto-flush
//! draw/screenN/line           W   "x1 y1 x2 y2 r g b", auto-flush
//! draw/screenN/cursor         R/W "x y"
//! draw/screenN/ctl            R/W clear | flush | fgcolor | bgcolor
//! draw/screenN/refresh        W   any write forces a flush
//! draw/screenN/font           R   "WxH"
//! ```
//!
//! Screens are probed from the kernel boot-info block: whitespace-separated
//! `key=value` pairs with fb_addr (hex), fb_width, fb_height, fb_pitch and
//! fb_depth; a missing key invalidates the block.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::device::DisplayBackend;
use crate::error::{DriverError, DriverResult};
use crate::fabric::{
    Capability, CancelToken, DeviceOps, Driver, DriverConfig, Health, HealthState, HealthStatus,
};
use crate::proto::{Qid, Stat, DMDIR, OTRUNC, QTDIR, QTFILE};
use crate::server::{FileServer, QidRegistry};

use super::{Color, PixelFormat, Screen};

// ============================================================================
// Boot-info probe
// ============================================================================

/// Framebuffer parameters as published by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    pub addr: u64,
    pub width: usize,
    pub height: usize,
    pub pitch: usize,
    pub depth: usize,
}

/// Parse a boot-info block. Every framebuffer key must be present and
/// non-zero; `fb_addr` is hex with a 0x prefix, the rest are decimal.
pub fn parse_boot_info(block: &str) -> DriverResult<BootInfo> {
    let invalid = || DriverError::InvalidPath("invalid boot info".into());

    let mut addr = None;
    let mut width = None;
    let mut height = None;
    let mut pitch = None;
    let mut depth = None;

    for pair in block.split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "fb_addr" => {
                let hex = value.strip_prefix("0x").ok_or_else(invalid)?;
                addr = Some(u64::from_str_radix(hex, 16).map_err(|_| invalid())?);
            }
            "fb_width" => width = Some(value.parse().map_err(|_| invalid())?),
            "fb_height" => height = Some(value.parse().map_err(|_| invalid())?),
            "fb_pitch" => pitch = Some(value.parse().map_err(|_| invalid())?),
            "fb_depth" => depth = Some(value.parse().map_err(|_| invalid())?),
            _ => {}
        }
    }

    let info = BootInfo {
        addr: addr.ok_or_else(invalid)?,
        width: width.ok_or_else(invalid)?,
        height: height.ok_or_else(invalid)?,
        pitch: pitch.ok_or_else(invalid)?,
        depth: depth.ok_or_else(invalid)?,
    };
    if info.addr == 0 || info.width == 0 || info.height == 0 || info.pitch == 0 {
        return Err(invalid());
    }
    Ok(info)
}

/// Build a screen from probed parameters. The pixel format follows the
/// published depth; 32-bit framebuffers default to RGB32.
pub fn screen_from_boot_info(
    name: &str,
    info: &BootInfo,
    backend: Arc<dyn DisplayBackend>,
) -> DriverResult<Screen> {
    let format = match info.depth {
        32 => PixelFormat::Rgb32,
        24 => PixelFormat::Rgb24,
        16 => PixelFormat::Rgb565,
        other => {
            return Err(DriverError::Config(format!(
                "unsupported framebuffer depth {}",
                other
            )))
        }
    };
    Screen::new(
        name,
        info.width,
        info.height,
        info.depth,
        info.pitch,
        info.addr,
        info.pitch * info.height,
        format,
        backend,
    )
}

// ============================================================================
// Path grammar
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum FbPath {
    Root,
    DrawDir,
    ScreenDir(String),
    File(String, FbFile),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FbFile {
    Info,
    Data,
    Text,
    Rect,
    Line,
    Cursor,
    Ctl,
    Refresh,
    Font,
}

impl FbFile {
    const ALL: [(&'static str, FbFile); 9] = [
        ("info", FbFile::Info),
        ("data", FbFile::Data),
        ("text", FbFile::Text),
        ("rect", FbFile::Rect),
        ("line", FbFile::Line),
        ("cursor", FbFile::Cursor),
        ("ctl", FbFile::Ctl),
        ("refresh", FbFile::Refresh),
        ("font", FbFile::Font),
    ];

    fn from_name(name: &str) -> Option<FbFile> {
        Self::ALL.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
    }

    fn name(self) -> &'static str {
        match self {
            FbFile::Info => "info",
            FbFile::Data => "data",
            FbFile::Text => "text",
            FbFile::Rect => "rect",
            FbFile::Line => "line",
            FbFile::Cursor => "cursor",
            FbFile::Ctl => "ctl",
            FbFile::Refresh => "refresh",
            FbFile::Font => "font",
        }
    }

    fn mode(self) -> u32 {
        match self {
            FbFile::Info | FbFile::Font => 0o444,
            FbFile::Text | FbFile::Rect | FbFile::Line | FbFile::Refresh => 0o222,
            FbFile::Data => 0o666,
            FbFile::Cursor | FbFile::Ctl => 0o664,
        }
    }
}

fn parse_path(path: &str) -> DriverResult<FbPath> {
    if path.is_empty() {
        return Ok(FbPath::Root);
    }
    let invalid = || DriverError::InvalidPath(path.to_string());

    let mut segs = path.split('/');
    if segs.next() != Some("draw") {
        return Err(invalid());
    }
    let Some(screen) = segs.next() else {
        return Ok(FbPath::DrawDir);
    };
    if screen.is_empty() {
        return Err(invalid());
    }
    let Some(file) = segs.next() else {
        return Ok(FbPath::ScreenDir(screen.to_string()));
    };
    if segs.next().is_some() {
        return Err(invalid());
    }
    let file = FbFile::from_name(file).ok_or_else(invalid)?;
    Ok(FbPath::File(screen.to_string(), file))
}

/// Exact-arity whitespace-separated decimal integers.
fn parse_ints(text: &str, arity: usize, what: &str) -> DriverResult<Vec<i64>> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != arity {
        return Err(DriverError::InvalidPath(format!(
            "invalid {} format, expected {} fields",
            what, arity
        )));
    }
    fields
        .iter()
        .map(|f| {
            f.parse::<i64>().map_err(|_| {
                DriverError::InvalidPath(format!("invalid {} format: bad number {}", what, f))
            })
        })
        .collect()
}

// ============================================================================
// Driver
// ============================================================================

pub struct FramebufferDriver {
    name: String,
    config: RwLock<DriverConfig>,
    screens: RwLock<Vec<Arc<Screen>>>,
    health: HealthState,
    cancel: CancelToken,
    qids: QidRegistry,
    boot_time: u32,
}

impl FramebufferDriver {
    /// A framebuffer driver only needs to map device memory.
    pub const REQUIRED_CAPS: Capability = Capability::DEVICE_ACCESS;

    pub fn new(name: &str) -> Self {
        let boot_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            name: name.to_string(),
            config: RwLock::new(DriverConfig::default()),
            screens: RwLock::new(Vec::new()),
            health: HealthState::new(),
            cancel: CancelToken::new(),
            qids: QidRegistry::new(),
            boot_time,
        }
    }

    /// Register a screen for export. Names are unique.
    pub fn add_screen(&self, screen: Arc<Screen>) -> DriverResult<()> {
        let mut screens = self.screens.write();
        if screens.iter().any(|s| s.name() == screen.name()) {
            return Err(DriverError::Config(format!(
                "screen {} already exists",
                screen.name()
            )));
        }
        screens.push(screen);
        Ok(())
    }

    pub fn remove_screen(&self, name: &str) -> DriverResult<()> {
        let mut screens = self.screens.write();
        let before = screens.len();
        screens.retain(|s| s.name() != name);
        if screens.len() == before {
            return Err(DriverError::NotFound(format!("screen {}", name)));
        }
        Ok(())
    }

    fn screen(&self, name: &str) -> DriverResult<Arc<Screen>> {
        self.screens
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("screen {}", name)))
    }

    fn check_running(&self) -> DriverResult<()> {
        if self.cancel.is_cancelled() {
            if self.health.status() == HealthStatus::Stopped {
                return Err(DriverError::Stopped);
            }
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    fn fail_op(&self, err: DriverError) -> DriverError {
        match &err {
            DriverError::Backend(_) => self.health.record_error(&err),
            DriverError::Internal(_) => self.health.fail(&err),
            _ => {}
        }
        err
    }

    fn bump_data(&self, screen: &str) {
        self.qids.bump(&format!("draw/{}/data", screen));
    }

    // ------------------------------------------------------------------
    // Per-file writes
    // ------------------------------------------------------------------

    fn write_data(&self, screen: &Arc<Screen>, offset: u64, data: &[u8]) -> DriverResult<u32> {
        // Text form sets one pixel; anything else is a raw byte write.
        if let Ok(text) = std::str::from_utf8(data) {
            if text.contains(' ') {
                let v = parse_ints(text, 5, "pixel")?;
                let (x, y) = coords(v[0], v[1])?;
                screen.put_pixel(x, y, Color::rgb(v[2] as u8, v[3] as u8, v[4] as u8))?;
                screen.flush().map_err(|e| self.fail_op(e))?;
                self.bump_data(screen.name());
                return Ok(data.len() as u32);
            }
        }
        let n = screen.write_shadow(offset, data)?;
        self.bump_data(screen.name());
        Ok(n)
    }

    fn write_ctl(&self, screen: &Arc<Screen>, data: &[u8]) -> DriverResult<u32> {
        let text = std::str::from_utf8(data)
            .map_err(|_| DriverError::InvalidPath("ctl command is not text".into()))?;
        let cmd = text.trim();
        match cmd {
            "clear" => {
                screen.clear(screen.bg_color())?;
                screen.flush().map_err(|e| self.fail_op(e))?;
            }
            "flush" => screen.flush().map_err(|e| self.fail_op(e))?,
            _ if cmd.starts_with("fgcolor ") => {
                let v = parse_ints(cmd.trim_start_matches("fgcolor "), 3, "fgcolor")?;
                screen.set_fg_color(Color::rgb(v[0] as u8, v[1] as u8, v[2] as u8));
            }
            _ if cmd.starts_with("bgcolor ") => {
                let v = parse_ints(cmd.trim_start_matches("bgcolor "), 3, "bgcolor")?;
                screen.set_bg_color(Color::rgb(v[0] as u8, v[1] as u8, v[2] as u8));
            }
            _ if cmd.starts_with("mode ") => {
                return Err(DriverError::Readonly("mode switching not supported".into()));
            }
            _ => {
                return Err(DriverError::Readonly(format!(
                    "unknown control command: {}",
                    cmd
                )));
            }
        }
        Ok(data.len() as u32)
    }

    fn write_file(
        &self,
        screen: &Arc<Screen>,
        file: FbFile,
        offset: u64,
        data: &[u8],
    ) -> DriverResult<u32> {
        match file {
            FbFile::Text => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| DriverError::InvalidPath("text is not utf-8".into()))?;
                screen.render_text(text)?;
                screen.flush().map_err(|e| self.fail_op(e))?;
                self.bump_data(screen.name());
                Ok(data.len() as u32)
            }
            FbFile::Data => self.write_data(screen, offset, data),
            FbFile::Rect => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| DriverError::InvalidPath("rect is not text".into()))?;
                let v = parse_ints(text, 7, "rect")?;
                let (w, h) = sizes(v[2], v[3])?;
                screen.draw_rect(v[0], v[1], w, h, Color::rgb(v[4] as u8, v[5] as u8, v[6] as u8))?;
                screen.flush().map_err(|e| self.fail_op(e))?;
                self.bump_data(screen.name());
                Ok(data.len() as u32)
            }
            FbFile::Line => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| DriverError::InvalidPath("line is not text".into()))?;
                let v = parse_ints(text, 7, "line")?;
                screen.draw_line(v[0], v[1], v[2], v[3], Color::rgb(v[4] as u8, v[5] as u8, v[6] as u8))?;
                screen.flush().map_err(|e| self.fail_op(e))?;
                self.bump_data(screen.name());
                Ok(data.len() as u32)
            }
            FbFile::Cursor => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| DriverError::InvalidPath("cursor is not text".into()))?;
                let v = parse_ints(text, 2, "cursor")?;
                let (x, y) = coords(v[0], v[1])?;
                screen.set_cursor(x, y);
                Ok(data.len() as u32)
            }
            FbFile::Ctl => self.write_ctl(screen, data),
            FbFile::Refresh => {
                screen.flush().map_err(|e| self.fail_op(e))?;
                Ok(data.len() as u32)
            }
            FbFile::Info | FbFile::Font => {
                Err(DriverError::Readonly(format!("{} is read-only", file.name())))
            }
        }
    }

    fn read_file(
        &self,
        screen: &Arc<Screen>,
        file: FbFile,
        offset: u64,
        count: u32,
    ) -> DriverResult<Vec<u8>> {
        match file {
            FbFile::Info => Ok(slice_text(&screen.info_text(), offset, count)),
            FbFile::Cursor => {
                let (x, y) = screen.cursor();
                Ok(slice_text(&format!("{} {}\n", x, y), offset, count))
            }
            FbFile::Font => {
                let (w, h) = screen.font_size();
                Ok(slice_text(&format!("{}x{}\n", w, h), offset, count))
            }
            FbFile::Data => Ok(screen.read_shadow(offset, count)),
            FbFile::Ctl => Ok(slice_text("ready\n", offset, count)),
            _ => Err(DriverError::InvalidPath(format!(
                "cannot read from {}",
                file.name()
            ))),
        }
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
            FbPath::Root => Ok(self.make_stat("", &self.name, QTDIR, DMDIR | 0o755, 0)),
            FbPath::DrawDir => Ok(self.make_stat("draw", "draw", QTDIR, DMDIR | 0o755, 0)),
            FbPath::ScreenDir(name) => {
                self.screen(&name)?;
                Ok(self.make_stat(path, &name, QTDIR, DMDIR | 0o755, 0))
            }
            FbPath::File(name, file) => {
                let screen = self.screen(&name)?;
                let length = match file {
                    FbFile::Data => screen.fb_size() as u64,
                    FbFile::Info => screen.info_text().len() as u64,
                    FbFile::Ctl => "ready\n".len() as u64,
                    _ => 0,
                };
                Ok(self.make_stat(path, file.name(), QTFILE, file.mode(), length))
            }
        }
    }
}

fn coords(x: i64, y: i64) -> DriverResult<(usize, usize)> {
    if x < 0 || y < 0 {
        return Err(DriverError::OutOfRange {
            offset: x.min(y).unsigned_abs(),
            limit: 0,
        });
    }
    Ok((x as usize, y as usize))
}

fn sizes(w: i64, h: i64) -> DriverResult<(u64, u64)> {
    if w < 0 || h < 0 {
        return Err(DriverError::InvalidPath("negative extent".into()));
    }
    Ok((w as u64, h as u64))
}

fn slice_text(text: &str, offset: u64, count: u32) -> Vec<u8> {
    let bytes = text.as_bytes();
    let start = (offset as usize).min(bytes.len());
    let end = (start + count as usize).min(bytes.len());
    bytes[start..end].to_vec()
}

// ============================================================================
// Lifecycle facet
// ============================================================================

impl Driver for FramebufferDriver {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn initialize(&self, config: &DriverConfig) -> DriverResult<()> {
        if !config.capabilities.contains(Self::REQUIRED_CAPS) {
            return Err(DriverError::Config(
                "framebuffer driver requires the DeviceAccess capability".into(),
            ));
        }
        self.health.set_status(HealthStatus::Starting, "initializing");
        *self.config.write() = config.clone();
        Ok(())
    }

    fn start(&self) -> DriverResult<()> {
        let screens: Vec<Arc<Screen>> = self.screens.read().clone();
        for screen in screens {
            screen.clear(screen.bg_color())?;
            screen.flush()?;
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

impl DeviceOps for FramebufferDriver {
    fn probe(&self, ctx: &CancelToken) -> DriverResult<Vec<String>> {
        ctx.check()?;
        Ok(self.screens.read().iter().map(|s| s.name().to_string()).collect())
    }

    fn attach_device(&self, ctx: &CancelToken, device: &str) -> DriverResult<()> {
        ctx.check()?;
        let screen = self.screen(device)?;
        screen.clear(screen.bg_color())?;
        screen.flush()
    }

    fn detach_device(&self, ctx: &CancelToken, device: &str) -> DriverResult<()> {
        ctx.check()?;
        self.remove_screen(device)
    }

    fn handle_interrupt(&self, _ctx: &CancelToken, _irq: u32) -> DriverResult<()> {
        // Framebuffers do not interrupt.
        Ok(())
    }
}

// ============================================================================
// File-server facet
// ============================================================================

impl FileServer for FramebufferDriver {
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
        Err(DriverError::Readonly("cannot create display files".into()))
    }

    fn read(&self, path: &str, offset: u64, count: u32) -> DriverResult<Vec<u8>> {
        self.health.record_request();
        self.check_running()?;
        match parse_path(path)? {
            FbPath::File(name, file) => {
                let screen = self.screen(&name)?;
                self.read_file(&screen, file, offset, count)
            }
            _ => Err(DriverError::InvalidPath(format!("cannot read from {}", path))),
        }
    }

    fn write(&self, path: &str, offset: u64, data: &[u8]) -> DriverResult<u32> {
        self.health.record_request();
        self.check_running()?;
        match parse_path(path)? {
            FbPath::File(name, file) => {
                let screen = self.screen(&name)?;
                self.write_file(&screen, file, offset, data)
            }
            _ => Err(DriverError::InvalidPath(format!("cannot write to {}", path))),
        }
    }

    fn readdir(&self, path: &str) -> DriverResult<Vec<Stat>> {
        self.check_running()?;
        match parse_path(path)? {
            FbPath::Root => Ok(vec![self.stat_path("draw")?]),
            FbPath::DrawDir => {
                let names: Vec<String> =
                    self.screens.read().iter().map(|s| s.name().to_string()).collect();
                names
                    .iter()
                    .map(|n| self.stat_path(&format!("draw/{}", n)))
                    .collect()
            }
            FbPath::ScreenDir(name) => {
                self.screen(&name)?;
                FbFile::ALL
                    .iter()
                    .map(|(f, _)| self.stat_path(&format!("draw/{}/{}", name, f)))
                    .collect()
            }
            FbPath::File(..) => {
                Err(DriverError::InvalidPath(format!("{} is not a directory", path)))
            }
        }
    }

    fn stat(&self, path: &str) -> DriverResult<Stat> {
        self.check_running()?;
        self.stat_path(path)
    }

    fn wstat(&self, _path: &str, _stat: &Stat) -> DriverResult<()> {
        Err(DriverError::Readonly("cannot modify display file metadata".into()))
    }

    fn remove(&self, _path: &str) -> DriverResult<()> {
        Err(DriverError::Readonly("cannot remove display files".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDisplay;

    fn driver() -> (FramebufferDriver, Arc<MemoryDisplay>) {
        let info = BootInfo { addr: 0xE000_0000, width: 64, height: 48, pitch: 256, depth: 32 };
        let display = Arc::new(MemoryDisplay::new(info.pitch * info.height));
        let screen = screen_from_boot_info("screen0", &info, display.clone()).unwrap();

        let fb = FramebufferDriver::new("fb0");
        fb.add_screen(Arc::new(screen)).unwrap();
        let config = DriverConfig::new("fb0", FramebufferDriver::REQUIRED_CAPS, "/dev/draw");
        fb.initialize(&config).unwrap();
        fb.start().unwrap();
        (fb, display)
    }

    #[test]
    fn test_boot_info_parsing() {
        let info = parse_boot_info(
            "fb_addr=0xE0000000 fb_width=1024 fb_height=768 fb_pitch=4096 fb_depth=32",
        )
        .unwrap();
        assert_eq!(info.addr, 0xE000_0000);
        assert_eq!(info.width, 1024);
        assert_eq!(info.height, 768);
        assert_eq!(info.pitch, 4096);
        assert_eq!(info.depth, 32);

        // Any missing key invalidates the block.
        assert!(parse_boot_info("fb_addr=0xE0000000 fb_width=1024").is_err());
        // Hex prefix is mandatory.
        assert!(parse_boot_info(
            "fb_addr=E0000000 fb_width=1 fb_height=1 fb_pitch=4 fb_depth=32"
        )
        .is_err());
        // Unknown keys are ignored.
        assert!(parse_boot_info(
            "cmdline=quiet fb_addr=0x1000 fb_width=16 fb_height=16 fb_pitch=64 fb_depth=32"
        )
        .is_ok());
    }

    #[test]
    fn test_pixel_write_via_data_file() {
        // Text-form pixel write on an RGB32 screen, with auto-flush.
        let (fb, display) = driver();
        let n = fb.write("draw/screen0/data", 0, b"10 20 255 128 0").unwrap();
        assert_eq!(n, 15);

        let screen = fb.screen("screen0").unwrap();
        let off = 20 * 256 + 10 * 4;
        assert_eq!(screen.read_shadow(off as u64, 4), vec![255, 128, 0, 255]);
        assert_eq!(&display.contents()[off..off + 4], &[255, 128, 0, 255]);
        // Auto-flush leaves the screen clean.
        assert_eq!(screen.dirty_rect(), None);
    }

    #[test]
    fn test_binary_data_write_skips_flush() {
        let (fb, display) = driver();
        let payload = vec![0xABu8; 16];
        let n = fb.write("draw/screen0/data", 256, &payload).unwrap();
        assert_eq!(n, 16);

        let screen = fb.screen("screen0").unwrap();
        assert_eq!(screen.read_shadow(256, 16), payload);
        // No auto-flush for binary writes: hardware still clean.
        assert_ne!(&display.contents()[256..272], &payload[..]);
        assert!(screen.dirty_rect().is_some());
    }

    #[test]
    fn test_text_rect_line_refresh() {
        let (fb, display) = driver();
        fb.write("draw/screen0/text", 0, b"hi").unwrap();
        fb.write("draw/screen0/rect", 0, b"1 1 4 4 0 255 0").unwrap();
        fb.write("draw/screen0/line", 0, b"0 40 63 40 0 0 255").unwrap();

        let screen = fb.screen("screen0").unwrap();
        assert_eq!(screen.dirty_rect(), None); // every write auto-flushed
        assert_eq!(display.contents(), screen.read_shadow(0, screen.fb_size() as u32));

        // refresh forces a flush even when nothing changed.
        fb.write("draw/screen0/refresh", 0, b"1").unwrap();

        let err = fb.write("draw/screen0/rect", 0, b"1 2 3").unwrap_err();
        assert!(matches!(err, DriverError::InvalidPath(_)));
    }

    #[test]
    fn test_cursor_read_write() {
        let (fb, _) = driver();
        fb.write("draw/screen0/cursor", 0, b"12 24").unwrap();
        assert_eq!(fb.read("draw/screen0/cursor", 0, 64).unwrap(), b"12 24\n");
        assert!(fb.write("draw/screen0/cursor", 0, b"-1 0").is_err());
    }

    #[test]
    fn test_ctl_commands() {
        let (fb, display) = driver();
        fb.write("draw/screen0/ctl", 0, b"fgcolor 255 0 0\n").unwrap();
        fb.write("draw/screen0/ctl", 0, b"bgcolor 0 0 255").unwrap();
        let screen = fb.screen("screen0").unwrap();
        assert_eq!(screen.fg_color(), Color::RED);
        assert_eq!(screen.bg_color(), Color::BLUE);

        fb.write("draw/screen0/ctl", 0, b"clear").unwrap();
        assert_eq!(&display.contents()[0..4], &[0, 0, 255, 255]);

        assert_eq!(fb.read("draw/screen0/ctl", 0, 64).unwrap(), b"ready\n");
        assert!(matches!(
            fb.write("draw/screen0/ctl", 0, b"mode 1920x1080x32"),
            Err(DriverError::Readonly(_))
        ));
        assert!(matches!(
            fb.write("draw/screen0/ctl", 0, b"blink"),
            Err(DriverError::Readonly(_))
        ));
    }

    #[test]
    fn test_info_and_font_files() {
        let (fb, _) = driver();
        let info = String::from_utf8(fb.read("draw/screen0/info", 0, 512).unwrap()).unwrap();
        assert!(info.contains("width 64"));
        assert!(info.contains("format RGB32"));
        assert!(info.contains("framebuffer 0xe0000000"));

        assert_eq!(fb.read("draw/screen0/font", 0, 16).unwrap(), b"8x8\n");
        assert!(matches!(
            fb.write("draw/screen0/font", 0, b"x"),
            Err(DriverError::Readonly(_))
        ));
    }

    #[test]
    fn test_path_grammar() {
        assert_eq!(parse_path("").unwrap(), FbPath::Root);
        assert_eq!(parse_path("draw").unwrap(), FbPath::DrawDir);
        assert_eq!(
            parse_path("draw/screen0").unwrap(),
            FbPath::ScreenDir("screen0".into())
        );
        assert_eq!(
            parse_path("draw/screen0/text").unwrap(),
            FbPath::File("screen0".into(), FbFile::Text)
        );
        for bad in ["disk", "draw/screen0/blit", "draw/screen0/text/x", "draw//text"] {
            assert!(parse_path(bad).is_err(), "{} should be invalid", bad);
        }
    }

    #[test]
    fn test_readdir_and_stats() {
        let (fb, _) = driver();
        let root = fb.readdir("").unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "draw");
        assert_eq!(root[0].length, 0);

        let files = fb.readdir("draw/screen0").unwrap();
        assert_eq!(files.len(), 9);

        let data = fb.stat("draw/screen0/data").unwrap();
        assert_eq!(data.length, 256 * 48);
        let again = fb.stat("draw/screen0/data").unwrap();
        assert_eq!(data.qid.path, again.qid.path);
    }

    #[test]
    fn test_device_ops_detach() {
        let (fb, _) = driver();
        let ctx = CancelToken::new();
        assert_eq!(fb.probe(&ctx).unwrap(), vec!["screen0".to_string()]);
        fb.detach_device(&ctx, "screen0").unwrap();
        assert!(fb.probe(&ctx).unwrap().is_empty());
        assert!(matches!(
            fb.read("draw/screen0/info", 0, 16),
            Err(DriverError::NotFound(_))
        ));
    }

    #[test]
    fn test_stopped_driver_refuses_io() {
        let (fb, _) = driver();
        fb.stop().unwrap();
        assert_eq!(
            fb.read("draw/screen0/info", 0, 16).unwrap_err(),
            DriverError::Stopped
        );
    }
}
