//! Constants for PES reassembly, AC-3 framing and presentation timing

use std::time::Duration;

/// PES packet constants
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
/// start code (3) + stream_id (1) + packet_length (2) + flags (2) + header_data_length (1)
pub const PES_FIXED_HEADER_LEN: usize = 9;

/// PTS constants
pub const PTS_CLOCK_HZ: u64 = 90_000; // 90 kHz
pub const PTS_WRAP_THRESHOLD: u64 = 1u64 << 33; // 33-bit PTS counter
pub const PTS_MASK: u64 = PTS_WRAP_THRESHOLD - 1;
pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const TICKS_PER_MS: i64 = 90;

/// MPEG-TS packet constants (harness only)
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// AC-3 sync frame constants
pub const AC3_SYNC_WORD: [u8; 2] = [0x0B, 0x77];
pub const AC3_HEADER_LEN: usize = 7;
pub const AC3_SAMPLES_PER_FRAME: u64 = 1536;
pub const AC3_FRAME_SIZE_CODES: usize = 38;

/// Presentation timing queue
pub const QUEUE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const QUEUE_NOMINAL_CAPACITY: usize = 32;

/// Dynamic range compression: normalized magnitude above which gain is reduced
pub const DRC_THRESHOLD: f32 = 0.5;
pub const DRC_DEFAULT_RATIO: f32 = 2.0;

/// -3 dB, used for centre and surround downmix coefficients
pub const DOWNMIX_MIX_LEVEL: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// H.264 NAL unit types
pub const H264_NAL_IDR: u8 = 5;
pub const H264_NAL_SPS: u8 = 7;
pub const H264_NAL_PPS: u8 = 8;

/// HEVC NAL unit types
pub const HEVC_NAL_IDR_W_RADL: u8 = 19;
pub const HEVC_NAL_IDR_N_LP: u8 = 20;
pub const HEVC_NAL_VPS: u8 = 32;
pub const HEVC_NAL_SPS: u8 = 33;
pub const HEVC_NAL_PPS: u8 = 34;

/// MPEG-2 video start codes (byte following 00 00 01)
pub const MPEG2_PICTURE_START: u8 = 0x00;
pub const MPEG2_SEQUENCE_HEADER: u8 = 0xB3;
pub const MPEG2_EXTENSION_START: u8 = 0xB5;
pub const MPEG2_PICTURE_TYPE_I: u8 = 1;
