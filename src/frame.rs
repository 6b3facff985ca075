//! Decoded outputs and the explicit release discipline.
//!
//! Decoded video frames are engine-owned resources. Whoever holds one last must
//! call [`Release::release`]; dropping a frame that still owns its resource logs
//! a warning before giving it back.

use std::fmt;

use bytes::Bytes;
use tracing::warn;

/// Explicit hand-back of an engine-owned resource
pub trait Release {
    fn release(self);
}

type Releaser = Box<dyn FnOnce() + Send>;

/// A decoded picture. `data` is tightly packed RGBA when the engine exposes
/// pixels, empty for opaque hardware surfaces.
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp_us: i64,
    pub is_key: bool,
    pub data: Bytes,
    releaser: Option<Releaser>,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, timestamp_us: i64, data: Bytes) -> Self {
        Self {
            width,
            height,
            timestamp_us,
            is_key: false,
            data,
            releaser: None,
        }
    }

    /// Attaches the callback that returns the underlying surface to its owner
    pub fn with_releaser(mut self, releaser: impl FnOnce() + Send + 'static) -> Self {
        self.releaser = Some(Box::new(releaser));
        self
    }

    pub fn is_released(&self) -> bool {
        self.releaser.is_none()
    }
}

impl Release for VideoFrame {
    fn release(mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser();
        }
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            warn!(
                pts_us = self.timestamp_us,
                "video frame dropped without release"
            );
            releaser();
        }
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_us", &self.timestamp_us)
            .field("is_key", &self.is_key)
            .field("bytes", &self.data.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Interleaved PCM produced for one audio sync frame
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u8,
    /// acmod the samples were laid out for
    pub channel_mode: u8,
    pub lfe: bool,
    pub pts_us: i64,
}

impl AudioBlock {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

impl Release for AudioBlock {
    fn release(self) {}
}
