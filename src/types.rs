use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::constants::{DRC_DEFAULT_RATIO, QUEUE_NOMINAL_CAPACITY, QUEUE_TIMEOUT};

/// Parsed PES packet header. PTS/DTS are 33-bit values on the 90 kHz clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PesHeader {
    pub stream_id: u8,
    pub packet_length: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub header_data_length: u8,
}

/// A reassembled PES unit: parsed header plus the elementary stream bytes it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesPacket {
    pub header: PesHeader,
    pub payload: Bytes,
}

/// AC-3 sync frame header (syncinfo + leading bsi fields)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFrameHeader {
    pub sync_word: u16,
    pub crc1: u16,
    /// fscod
    pub sample_rate_code: u8,
    /// frmsizecod
    pub frame_size_code: u8,
    pub bitstream_id: u8,
    pub bitstream_mode: u8,
    /// acmod
    pub channel_mode: u8,
    pub lfe: bool,
    pub sample_rate: u32,
    /// Whole sync frame in bytes, header included
    pub frame_size: usize,
    pub num_channels: u8,
    pub bitrate_kbps: u32,
}

/// Codec families handled by the video orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum VideoCodec {
    H264,
    Hevc,
    Mpeg2,
}

impl VideoCodec {
    pub fn default_codec_string(self) -> &'static str {
        match self {
            VideoCodec::H264 => "avc1",
            VideoCodec::Hevc => "hvc1",
            VideoCodec::Mpeg2 => "mp2v",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelerationPreference {
    #[default]
    NoPreference,
    PreferHardware,
    PreferSoftware,
}

/// Configuration handed to the video Decode Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodecConfig {
    pub codec: VideoCodec,
    /// e.g. `avc1.64001f`
    pub codec_string: String,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Out-of-band configuration record (avcC for H.264, Annex-B parameter sets
    /// for HEVC, sequence header for MPEG-2)
    pub description: Option<Bytes>,
    pub acceleration: AccelerationPreference,
}

impl VideoCodecConfig {
    pub fn initial(codec: VideoCodec, width: u32, height: u32, acceleration: AccelerationPreference) -> Self {
        Self {
            codec,
            codec_string: codec.default_codec_string().to_string(),
            coded_width: width,
            coded_height: height,
            description: None,
            acceleration,
        }
    }
}

/// Configuration handed to the audio Decode Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodecConfig {
    pub codec_string: String,
    pub sample_rate: u32,
    /// Total channels, LFE included
    pub channels: u8,
    /// acmod of the coded stream
    pub channel_mode: u8,
    pub lfe: bool,
    pub acceleration: AccelerationPreference,
}

impl AudioCodecConfig {
    pub fn from_header(header: &AudioFrameHeader, acceleration: AccelerationPreference) -> Self {
        Self {
            codec_string: "ac-3".to_string(),
            sample_rate: header.sample_rate,
            channels: header.num_channels,
            channel_mode: header.channel_mode,
            lfe: header.lfe,
            acceleration,
        }
    }

    /// True when frames described by `header` can be fed without reconfiguring
    pub fn matches(&self, header: &AudioFrameHeader) -> bool {
        self.sample_rate == header.sample_rate
            && self.channels == header.num_channels
            && self.channel_mode == header.channel_mode
            && self.lfe == header.lfe
    }
}

impl Default for AudioCodecConfig {
    fn default() -> Self {
        Self {
            codec_string: "ac-3".to_string(),
            sample_rate: 48_000,
            channels: 2,
            channel_mode: 2,
            lfe: false,
            acceleration: AccelerationPreference::NoPreference,
        }
    }
}

/// Lifecycle of one orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecoderState {
    Unconfigured,
    Configured,
    Decoding,
    Flushing,
    Closed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
    /// Letterbox, whole frame visible
    #[default]
    Fit,
    /// Crop to cover the surface
    Fill,
    /// Ignore source aspect
    Stretch,
}

impl std::str::FromStr for ScaleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fit" => Ok(ScaleMode::Fit),
            "fill" => Ok(ScaleMode::Fill),
            "stretch" => Ok(ScaleMode::Stretch),
            other => Err(format!("unknown scale mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownmixPolicy {
    #[default]
    Passthrough,
    Stereo,
}

/// Pipeline-wide knobs shared by both orchestrators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_timeout_ms: u64,
    pub queue_capacity: usize,
    pub acceleration: AccelerationPreference,
    pub verify_crc: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: QUEUE_TIMEOUT.as_millis() as u64,
            queue_capacity: QUEUE_NOMINAL_CAPACITY,
            acceleration: AccelerationPreference::NoPreference,
            verify_crc: false,
        }
    }
}

/// Runtime audio controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioControls {
    pub drc_enabled: bool,
    pub drc_ratio: f32,
    pub downmix: DownmixPolicy,
    /// Selected language track; no effect while input carries a single track
    pub language: Option<String>,
    /// Positive delays audio, negative advances it
    pub lip_sync_ms: i32,
}

impl Default for AudioControls {
    fn default() -> Self {
        Self {
            drc_enabled: false,
            drc_ratio: DRC_DEFAULT_RATIO,
            downmix: DownmixPolicy::Passthrough,
            language: None,
            lip_sync_ms: 0,
        }
    }
}

/// Presentation surface size and scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenterConfig {
    pub width: u32,
    pub height: u32,
    pub scale_mode: ScaleMode,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            scale_mode: ScaleMode::Fit,
        }
    }
}
