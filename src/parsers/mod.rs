//! Codec-level parsers for elementary stream data
//!
//! `audio` frames AC-3 sync frames; `video` extracts parameter sets or sequence
//! headers and classifies access units as key or delta.

pub mod audio;
pub mod utils;
pub mod video;

pub use audio::{frame_duration_ticks, parse_ac3_header, verify_frame_crc};
pub use video::{ExtractedConfig, extract_config, is_keyframe};
