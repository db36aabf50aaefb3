//! Framebuffer screens
//!
//! A [`Screen`] is a double-buffered pixel surface: every mutation lands in
//! the shadow buffer and widens the dirty rectangle; `flush` copies the
//! shadow to the hardware region and clears the flag. When the dirty flag
//! is clear, shadow and hardware are byte-identical.
//!
//! All mutations take the per-screen lock exclusively; `data`/`info` reads
//! take it shared.

pub mod driver;
pub mod font;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::DisplayBackend;
use crate::error::{DriverError, DriverResult};

pub use font::Font;

// ============================================================================
// Colors and pixel formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Color {
        Color { r, g, b, a: 255 }
    }
}

/// How pixels are laid out in screen memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb32,
    Bgr32,
    Rgb24,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb32 | PixelFormat::Bgr32 => 4,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgb32 => "RGB32",
            PixelFormat::Bgr32 => "BGR32",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Rgb565 => "RGB565",
        }
    }

    /// Store one pixel at the start of `buf` (`buf.len() >= bytes_per_pixel`).
    fn store(self, buf: &mut [u8], color: Color) {
        match self {
            PixelFormat::Rgb32 => {
                buf[0] = color.r;
                buf[1] = color.g;
                buf[2] = color.b;
                buf[3] = color.a;
            }
            PixelFormat::Bgr32 => {
                buf[0] = color.b;
                buf[1] = color.g;
                buf[2] = color.r;
                buf[3] = color.a;
            }
            PixelFormat::Rgb24 => {
                buf[0] = color.r;
                buf[1] = color.g;
                buf[2] = color.b;
            }
            PixelFormat::Rgb565 => {
                let packed = ((color.r as u16 >> 3) << 11)
                    | ((color.g as u16 >> 2) << 5)
                    | (color.b as u16 >> 3);
                buf[0..2].copy_from_slice(&packed.to_le_bytes());
            }
        }
    }

    /// Load one pixel from the start of `buf`.
    fn load(self, buf: &[u8]) -> Color {
        match self {
            PixelFormat::Rgb32 => Color { r: buf[0], g: buf[1], b: buf[2], a: buf[3] },
            PixelFormat::Bgr32 => Color { r: buf[2], g: buf[1], b: buf[0], a: buf[3] },
            PixelFormat::Rgb24 => Color::rgb(buf[0], buf[1], buf[2]),
            PixelFormat::Rgb565 => {
                let packed = u16::from_le_bytes([buf[0], buf[1]]);
                Color::rgb(
                    ((packed >> 11) as u8) << 3,
                    (((packed >> 5) & 0x3F) as u8) << 2,
                    ((packed & 0x1F) as u8) << 3,
                )
            }
        }
    }
}

/// Inclusive bounding box of shadow-buffer changes since the last flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

// ============================================================================
// Screen
// ============================================================================

pub struct Screen {
    name: String,
    width: usize,
    height: usize,
    depth: usize,
    pitch: usize,
    fb_addr: u64,
    fb_size: usize,
    format: PixelFormat,
    backend: Arc<dyn DisplayBackend>,
    state: RwLock<ScreenState>,
}

struct ScreenState {
    shadow: Vec<u8>,
    cursor_x: usize,
    cursor_y: usize,
    font: Font,
    fg: Color,
    bg: Color,
    dirty: Option<DirtyRect>,
}

impl Screen {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        width: usize,
        height: usize,
        depth: usize,
        pitch: usize,
        fb_addr: u64,
        fb_size: usize,
        format: PixelFormat,
        backend: Arc<dyn DisplayBackend>,
    ) -> DriverResult<Screen> {
        let font = Font::vga8x8();
        if width == 0 || height == 0 {
            return Err(DriverError::Config("screen has zero dimension".into()));
        }
        if pitch < width * format.bytes_per_pixel() {
            return Err(DriverError::Config(format!(
                "pitch {} too small for {} pixels of {}",
                pitch,
                width,
                format.name()
            )));
        }
        if fb_size < pitch * height {
            return Err(DriverError::Config(format!(
                "framebuffer size {} below {} scanlines of {}",
                fb_size, height, pitch
            )));
        }
        if width < font.width() || height < font.height() {
            return Err(DriverError::Config("screen smaller than one glyph".into()));
        }
        Ok(Screen {
            name: name.to_string(),
            width,
            height,
            depth,
            pitch,
            fb_addr,
            fb_size,
            format,
            backend,
            state: RwLock::new(ScreenState {
                shadow: vec![0u8; fb_size],
                cursor_x: 0,
                cursor_y: 0,
                font,
                fg: Color::WHITE,
                bg: Color::BLACK,
                dirty: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn fb_size(&self) -> usize {
        self.fb_size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Screen description in the ctl key/value form.
    pub fn info_text(&self) -> String {
        format!(
            "width {}\nheight {}\ndepth {}\npitch {}\nformat {}\nframebuffer 0x{:x}\n",
            self.width,
            self.height,
            self.depth,
            self.pitch,
            self.format.name(),
            self.fb_addr
        )
    }

    fn offset_of(&self, x: usize, y: usize) -> usize {
        y * self.pitch + x * self.format.bytes_per_pixel()
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    pub fn put_pixel(&self, x: usize, y: usize, color: Color) -> DriverResult<()> {
        if x >= self.width || y >= self.height {
            return Err(DriverError::OutOfRange {
                offset: (x.max(y)) as u64,
                limit: self.width.max(self.height) as u64,
            });
        }
        let mut state = self.state.write();
        self.store_pixel(&mut state, x, y, color);
        mark_dirty(&mut state.dirty, x, y, x, y);
        Ok(())
    }

    pub fn get_pixel(&self, x: usize, y: usize) -> DriverResult<Color> {
        if x >= self.width || y >= self.height {
            return Err(DriverError::OutOfRange {
                offset: (x.max(y)) as u64,
                limit: self.width.max(self.height) as u64,
            });
        }
        let state = self.state.read();
        let off = self.offset_of(x, y);
        Ok(self.format.load(&state.shadow[off..]))
    }

    /// Filled rectangle, clipped to the screen.
    pub fn draw_rect(&self, x: i64, y: i64, w: u64, h: u64, color: Color) -> DriverResult<()> {
        let x1 = x.max(0) as usize;
        let y1 = y.max(0) as usize;
        let x2 = (x.saturating_add(w as i64)).clamp(0, self.width as i64) as usize;
        let y2 = (y.saturating_add(h as i64)).clamp(0, self.height as i64) as usize;
        if x1 >= x2 || y1 >= y2 {
            return Ok(());
        }

        let mut state = self.state.write();
        for py in y1..y2 {
            for px in x1..x2 {
                self.store_pixel(&mut state, px, py, color);
            }
        }
        mark_dirty(&mut state.dirty, x1, y1, x2 - 1, y2 - 1);
        Ok(())
    }

    /// Bresenham line, all octants; pixels off screen are skipped.
    pub fn draw_line(&self, x1: i64, y1: i64, x2: i64, y2: i64, color: Color) -> DriverResult<()> {
        let dx = (x2 - x1).abs();
        let dy = (y2 - y1).abs();
        let sx = if x1 > x2 { -1 } else { 1 };
        let sy = if y1 > y2 { -1 } else { 1 };

        let mut state = self.state.write();
        let mut err = dx - dy;
        let (mut x, mut y) = (x1, y1);
        let mut plotted: Option<DirtyRect> = None;
        loop {
            if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
                self.store_pixel(&mut state, x as usize, y as usize, color);
                mark_dirty(&mut plotted, x as usize, y as usize, x as usize, y as usize);
            }
            if x == x2 && y == y2 {
                break;
            }
            let e2 = 2 * err;
            if e2 > -dy {
                err -= dy;
                x += sx;
            }
            if e2 < dx {
                err += dx;
                y += sy;
            }
        }
        if let Some(rect) = plotted {
            mark_dirty(&mut state.dirty, rect.x1, rect.y1, rect.x2, rect.y2);
        }
        Ok(())
    }

    pub fn clear(&self, color: Color) -> DriverResult<()> {
        self.draw_rect(0, 0, self.width as u64, self.height as u64, color)
    }

    fn store_pixel(&self, state: &mut ScreenState, x: usize, y: usize, color: Color) {
        let off = self.offset_of(x, y);
        self.format.store(&mut state.shadow[off..], color);
    }

    // ------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------

    pub fn cursor(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.cursor_x, state.cursor_y)
    }

    pub fn set_cursor(&self, x: usize, y: usize) {
        let mut state = self.state.write();
        state.cursor_x = x;
        state.cursor_y = y;
    }

    pub fn fg_color(&self) -> Color {
        self.state.read().fg
    }

    pub fn bg_color(&self) -> Color {
        self.state.read().bg
    }

    pub fn set_fg_color(&self, color: Color) {
        self.state.write().fg = color;
    }

    pub fn set_bg_color(&self, color: Color) {
        self.state.write().bg = color;
    }

    pub fn font_size(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.font.width(), state.font.height())
    }

    /// Render text at the cursor. Newline drops a row, carriage return
    /// rewinds the column, tab advances to the next glyph-width multiple
    /// (wrapping at the right edge); everything else draws a glyph and
    /// advances. Running off the bottom scrolls by one glyph height.
    pub fn render_text(&self, text: &str) -> DriverResult<()> {
        let mut state = self.state.write();
        let font = state.font;
        let (gw, gh) = (font.width(), font.height());

        for ch in text.chars() {
            match ch {
                '\n' => {
                    state.cursor_x = 0;
                    state.cursor_y += gh;
                    self.maybe_scroll(&mut state, gh);
                }
                '\r' => state.cursor_x = 0,
                '\t' => {
                    state.cursor_x = (state.cursor_x / gw + 1) * gw;
                    if state.cursor_x >= self.width {
                        state.cursor_x = 0;
                        state.cursor_y += gh;
                        self.maybe_scroll(&mut state, gh);
                    }
                }
                _ => {
                    let glyph = font.glyph(ch);
                    let (cx, cy) = (state.cursor_x, state.cursor_y);
                    self.draw_glyph(&mut state, cx, cy, &glyph, gw, gh);
                    state.cursor_x += gw;
                    if state.cursor_x + gw > self.width {
                        state.cursor_x = 0;
                        state.cursor_y += gh;
                        self.maybe_scroll(&mut state, gh);
                    }
                }
            }
        }
        Ok(())
    }

    fn maybe_scroll(&self, state: &mut ScreenState, gh: usize) {
        if state.cursor_y + gh > self.height {
            self.scroll(state, gh);
            state.cursor_y = self.height - gh;
        }
    }

    fn draw_glyph(
        &self,
        state: &mut ScreenState,
        x: usize,
        y: usize,
        glyph: &[u8],
        gw: usize,
        gh: usize,
    ) {
        let (fg, bg) = (state.fg, state.bg);
        let mut drew = false;
        for (row, bits) in glyph.iter().enumerate().take(gh) {
            if y + row >= self.height {
                break;
            }
            for col in 0..gw {
                if x + col >= self.width {
                    break;
                }
                let color = if bits & (0x80 >> col) != 0 { fg } else { bg };
                self.store_pixel(state, x + col, y + row, color);
                drew = true;
            }
        }
        if drew {
            let x2 = (x + gw).min(self.width) - 1;
            let y2 = (y + gh).min(self.height) - 1;
            mark_dirty(&mut state.dirty, x, y, x2, y2);
        }
    }

    /// Move everything up by `gh` scanlines and clear the bottom rows to
    /// the background color. Marks the whole screen dirty.
    fn scroll(&self, state: &mut ScreenState, gh: usize) {
        let row_bytes = gh * self.pitch;
        let visible = self.height * self.pitch;
        state.shadow.copy_within(row_bytes..visible, 0);

        let bg = state.bg;
        for y in self.height - gh..self.height {
            for x in 0..self.width {
                self.store_pixel(state, x, y, bg);
            }
        }
        mark_dirty(&mut state.dirty, 0, 0, self.width - 1, self.height - 1);
    }

    // ------------------------------------------------------------------
    // Shadow access and flushing
    // ------------------------------------------------------------------

    /// Raw shadow bytes at a byte offset; reads past the end are empty.
    pub fn read_shadow(&self, offset: u64, count: u32) -> Vec<u8> {
        let state = self.state.read();
        let start = (offset as usize).min(state.shadow.len());
        let end = (start + count as usize).min(state.shadow.len());
        state.shadow[start..end].to_vec()
    }

    /// Raw byte write into the shadow at `offset`, clamped to the buffer.
    /// Marks every scanline the span touches dirty; does not flush.
    pub fn write_shadow(&self, offset: u64, data: &[u8]) -> DriverResult<u32> {
        let mut state = self.state.write();
        let len = state.shadow.len();
        if offset as usize >= len {
            return Err(DriverError::OutOfRange { offset, limit: len as u64 });
        }
        let start = offset as usize;
        let n = data.len().min(len - start);
        state.shadow[start..start + n].copy_from_slice(&data[..n]);

        let y1 = start / self.pitch;
        let y2 = ((start + n) / self.pitch).min(self.height - 1);
        mark_dirty(&mut state.dirty, 0, y1.min(self.height - 1), self.width - 1, y2);
        Ok(n as u32)
    }

    pub fn dirty_rect(&self) -> Option<DirtyRect> {
        self.state.read().dirty
    }

    /// Write the whole shadow to the hardware region and clear the dirty
    /// flag. A clean screen is a no-op.
    pub fn flush(&self) -> DriverResult<()> {
        let mut state = self.state.write();
        if state.dirty.is_none() {
            return Ok(());
        }
        self.backend.write_region(0, &state.shadow)?;
        state.dirty = None;
        Ok(())
    }

    /// Write one clipped region per scanline without touching the dirty
    /// flag. For callers who know exactly what changed.
    pub fn flush_region(&self, x: usize, y: usize, w: usize, h: usize) -> DriverResult<()> {
        let state = self.state.read();
        let x = x.min(self.width);
        let y = y.min(self.height);
        let w = w.min(self.width - x);
        let h = h.min(self.height - y);
        let bpp = self.format.bytes_per_pixel();
        for row in 0..h {
            let off = self.offset_of(x, y + row);
            self.backend
                .write_region(off as u64, &state.shadow[off..off + w * bpp])?;
        }
        Ok(())
    }
}

fn mark_dirty(dirty: &mut Option<DirtyRect>, x1: usize, y1: usize, x2: usize, y2: usize) {
    match dirty {
        None => *dirty = Some(DirtyRect { x1, y1, x2, y2 }),
        Some(rect) => {
            rect.x1 = rect.x1.min(x1);
            rect.y1 = rect.y1.min(y1);
            rect.x2 = rect.x2.max(x2);
            rect.y2 = rect.y2.max(y2);
        }
    }
}
