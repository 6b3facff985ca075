//! PES decode orchestration: reassembly, framing, engine-driven decode and
//! ordered presentation for one audio and one video elementary stream.

pub mod audio;
pub mod constants;
pub mod core;
pub mod engine;
pub mod error;
pub mod frame;
pub mod network;
pub mod parsers;
pub mod pes;
pub mod pipeline;
pub mod queue;
pub mod render;
pub mod report;
pub mod stats;
pub mod ts;
pub mod types;
pub mod video;

pub use audio::AudioDecoder;
pub use engine::{DecodeEngine, DecodeUnit, EngineKind, EngineSink, SoftwareFallback};
pub use error::{EngineError, PipelineError, RenderError};
pub use frame::{AudioBlock, Release, VideoFrame};
pub use pes::PesReassembler;
pub use queue::PresentationQueue;
pub use render::{Canvas, DrawRect, Presenter, Surface};
pub use stats::MetricsSnapshot;
pub use types::{
    AccelerationPreference, AudioCodecConfig, AudioControls, DecoderState, PipelineConfig, PresenterConfig,
    ScaleMode, VideoCodec, VideoCodecConfig,
};
pub use video::VideoDecoder;
