//! Scaled presentation of decoded frames onto a fixed-size surface

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::RenderError;
use crate::frame::{Release, VideoFrame};
use crate::types::{PresenterConfig, ScaleMode};

/// Destination rectangle in surface pixels. May extend past the surface in
/// `Fill` mode, hence the signed origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Placement of a `src_w`x`src_h` frame on a `dst_w`x`dst_h` surface.
pub fn compute_rect(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32, mode: ScaleMode) -> DrawRect {
    let full = DrawRect {
        x: 0,
        y: 0,
        width: dst_w,
        height: dst_h,
    };
    if src_w == 0 || src_h == 0 || mode == ScaleMode::Stretch {
        return full;
    }

    // source wider than the surface (cross-multiplied to stay in integers)
    let wider = src_w as u64 * dst_h as u64 > src_h as u64 * dst_w as u64;
    let match_width = match mode {
        ScaleMode::Fit => wider,
        _ => !wider,
    };
    let (width, height) = if match_width {
        (dst_w, scale(src_h, dst_w, src_w))
    } else {
        (scale(src_w, dst_h, src_h), dst_h)
    };

    DrawRect {
        x: centered(dst_w, width),
        y: centered(dst_h, height),
        width,
        height,
    }
}

fn scale(value: u32, num: u32, den: u32) -> u32 {
    u32::try_from(value as u64 * num as u64 / den as u64).unwrap_or(u32::MAX)
}

fn centered(outer: u32, inner: u32) -> i32 {
    (outer as i64 - inner as i64)
        .div_euclid(2)
        .clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Something frames can be drawn on
pub trait Surface {
    /// Sets the internal resolution; previous contents are discarded.
    fn set_resolution(&mut self, width: u32, height: u32);

    fn draw(&mut self, frame: &VideoFrame, rect: DrawRect) -> Result<(), RenderError>;
}

/// RGBA software surface with nearest-neighbour scaling
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels.get(at..at + 4).and_then(|p| p.try_into().ok())
    }
}

impl Surface for Canvas {
    fn set_resolution(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width as usize * height as usize * 4, 0);
    }

    fn draw(&mut self, frame: &VideoFrame, rect: DrawRect) -> Result<(), RenderError> {
        let (src_w, src_h) = (frame.width as usize, frame.height as usize);
        if src_w == 0 || src_h == 0 || frame.data.len() != src_w * src_h * 4 {
            return Err(RenderError::PixelsUnavailable {
                width: frame.width,
                height: frame.height,
                len: frame.data.len(),
            });
        }
        if rect.width == 0 || rect.height == 0 {
            return Ok(());
        }

        let x0 = rect.x.max(0) as i64;
        let y0 = rect.y.max(0) as i64;
        let x1 = (rect.x as i64 + rect.width as i64).min(self.width as i64);
        let y1 = (rect.y as i64 + rect.height as i64).min(self.height as i64);
        let stride = self.width as usize * 4;

        for y in y0..y1 {
            let sy = ((y - rect.y as i64) as usize * src_h / rect.height as usize).min(src_h - 1);
            let src_row = &frame.data[sy * src_w * 4..(sy + 1) * src_w * 4];
            let dst_row = &mut self.pixels[y as usize * stride..(y as usize + 1) * stride];
            for x in x0..x1 {
                let sx = ((x - rect.x as i64) as usize * src_w / rect.width as usize).min(src_w - 1);
                let d = x as usize * 4;
                dst_row[d..d + 4].copy_from_slice(&src_row[sx * 4..sx * 4 + 4]);
            }
        }
        Ok(())
    }
}

/// Frames per second over a rolling one-second window
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    count: u32,
    fps: f64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            fps: 0.0,
        }
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub(crate) fn tick_at(&mut self, now: Instant) {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            self.fps = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.window_start = now;
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Presenter<S: Surface> {
    surface: S,
    config: PresenterConfig,
    source: Option<(u32, u32)>,
    rect: DrawRect,
    fps: FpsCounter,
    pub frames_drawn: u64,
    pub draw_errors: u64,
}

impl<S: Surface> Presenter<S> {
    pub fn new(mut surface: S, config: PresenterConfig) -> Self {
        surface.set_resolution(config.width, config.height);
        Self {
            surface,
            config,
            source: None,
            rect: compute_rect(0, 0, config.width, config.height, config.scale_mode),
            fps: FpsCounter::new(),
            frames_drawn: 0,
            draw_errors: 0,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn rect(&self) -> DrawRect {
        self.rect
    }

    pub fn fps(&self) -> f64 {
        self.fps.fps()
    }

    pub fn set_scale_mode(&mut self, mode: ScaleMode) {
        self.config.scale_mode = mode;
        self.source = None;
    }

    /// Draws `frame` and hands it back to its owner, whether or not drawing succeeded.
    pub fn present(&mut self, frame: VideoFrame) -> Result<(), RenderError> {
        let dims = (frame.width, frame.height);
        if self.source != Some(dims) {
            self.rect = compute_rect(dims.0, dims.1, self.config.width, self.config.height, self.config.scale_mode);
            self.surface.set_resolution(self.config.width, self.config.height);
            self.source = Some(dims);
            debug!(width = dims.0, height = dims.1, rect = ?self.rect, "presentation geometry updated");
        }

        let result = self.surface.draw(&frame, self.rect);
        frame.release();
        self.fps.tick();
        match &result {
            Ok(()) => self.frames_drawn += 1,
            Err(e) => {
                self.draw_errors += 1;
                warn!(error = %e, "frame not drawn");
            }
        }
        result
    }
}
