//! Audio orchestrator: PES reassembly, AC-3 framing, engine submission and
//! ordered presentation of decoded blocks.

pub mod dsp;
pub mod framer;

use std::time::Instant;

use tracing::{debug, info};

use crate::constants::TICKS_PER_MS;
use crate::engine::{BoxedEngine, DecodeUnit, SilentAudioCodec, SoftwareFallback};
use crate::error::PipelineError;
use crate::frame::AudioBlock;
use crate::pes::{PesReassembler, PtsUnwrapper, ticks_to_micros};
use crate::pipeline::DecodePipeline;
use crate::stats::MetricsSnapshot;
use crate::types::{
    AccelerationPreference, AudioCodecConfig, AudioControls, DecoderState, DownmixPolicy, PesPacket,
    PipelineConfig,
};

pub use framer::{AudioFrame, AudioFramer};

pub type AudioOutput = Box<dyn FnMut(AudioBlock) + Send + 'static>;
pub type ErrorCallback = Box<dyn FnMut(&PipelineError) + Send + 'static>;

pub struct AudioDecoder {
    reassembler: PesReassembler,
    framer: AudioFramer,
    timeline: PtsUnwrapper,
    pipeline: DecodePipeline<AudioCodecConfig, AudioBlock>,
    controls: AudioControls,
    acceleration: AccelerationPreference,
    output: AudioOutput,
    on_error: Option<ErrorCallback>,
}

impl AudioDecoder {
    pub fn new(
        engines: Vec<BoxedEngine<AudioCodecConfig, AudioBlock>>,
        config: &PipelineConfig,
        controls: AudioControls,
        output: impl FnMut(AudioBlock) + Send + 'static,
    ) -> Self {
        Self {
            reassembler: PesReassembler::new(),
            framer: AudioFramer::new(config.verify_crc),
            timeline: PtsUnwrapper::new(),
            pipeline: DecodePipeline::new("audio", engines, config),
            controls,
            acceleration: config.acceleration,
            output: Box::new(output),
            on_error: None,
        }
    }

    /// Decoder backed only by the software engine
    pub fn with_software(
        config: &PipelineConfig,
        controls: AudioControls,
        output: impl FnMut(AudioBlock) + Send + 'static,
    ) -> Self {
        let engine: BoxedEngine<AudioCodecConfig, AudioBlock> = Box::new(SoftwareFallback::new(SilentAudioCodec));
        Self::new(vec![engine], config, controls, output)
    }

    pub fn set_error_callback(&mut self, callback: impl FnMut(&PipelineError) + Send + 'static) {
        self.on_error = Some(Box::new(callback));
    }

    pub fn state(&self) -> DecoderState {
        self.pipeline.state()
    }

    pub fn codec_config(&self) -> Option<&AudioCodecConfig> {
        self.pipeline.config()
    }

    /// Name of the engine picked at initialize time
    pub fn engine_name(&self) -> Option<&str> {
        self.pipeline.engine_name()
    }

    fn surface<T>(&mut self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(e) = &result {
            if let Some(callback) = self.on_error.as_mut() {
                callback(e);
            }
        }
        result
    }

    /// Configures the engine. The configuration is replaced by the first frame
    /// header if that describes a different layout.
    pub fn initialize(&mut self, mut config: AudioCodecConfig) -> Result<(), PipelineError> {
        config.acceleration = self.acceleration;
        let result = self.pipeline.initialize(config);
        self.surface(result)
    }

    /// Feeds one demultiplexed chunk of the audio PES stream.
    pub fn process_payload(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        let started = Instant::now();
        let result = self.process_inner(chunk);
        self.pipeline.metrics.record_processing(started.elapsed());
        self.surface(result)
    }

    fn process_inner(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        if let Some(packet) = self.reassembler.process_payload(chunk) {
            self.handle_packet(packet)?;
        }
        self.pump()
    }

    fn handle_packet(&mut self, packet: PesPacket) -> Result<(), PipelineError> {
        self.pipeline.metrics.add_bytes(packet.payload.len());
        for frame in self.framer.push(&packet.payload, packet.header.pts) {
            self.submit_frame(frame)?;
        }
        Ok(())
    }

    fn submit_frame(&mut self, frame: AudioFrame) -> Result<(), PipelineError> {
        let layout_changed = self
            .pipeline
            .config()
            .is_some_and(|config| !config.matches(&frame.header));
        if layout_changed {
            info!(
                sample_rate = frame.header.sample_rate,
                channels = frame.header.num_channels,
                acmod = frame.header.channel_mode,
                lfe = frame.header.lfe,
                "audio layout changed"
            );
            self.pipeline
                .reconfigure(AudioCodecConfig::from_header(&frame.header, self.acceleration))?;
        }
        self.pipeline.metrics.set_header_bitrate(frame.header.bitrate_kbps);

        let ticks = self.timeline.extend(frame.pts) + self.controls.lip_sync_ms as i64 * TICKS_PER_MS;
        self.pipeline.submit(DecodeUnit {
            timestamp_us: ticks_to_micros(ticks),
            is_key: true,
            data: frame.data,
        })
    }

    fn pump(&mut self) -> Result<(), PipelineError> {
        let controls = &self.controls;
        let output = &mut self.output;
        self.pipeline
            .pump(&mut |_, block| output(dsp::process(block, controls)))
    }

    /// Forwards the unit still being accumulated, waits for the engine to
    /// finish, then presents everything queued.
    pub async fn flush(&mut self) -> Result<(), PipelineError> {
        let mut result = Ok(());
        if let Some(packet) = self.reassembler.flush() {
            result = self.handle_packet(packet);
        }
        if result.is_ok() {
            let controls = &self.controls;
            let output = &mut self.output;
            result = self
                .pipeline
                .flush(&mut |_, block| output(dsp::process(block, controls)))
                .await;
        }
        self.surface(result)
    }

    /// Discards buffered input and queued output; configuration is kept.
    pub fn reset(&mut self) {
        self.reassembler.clear();
        self.framer.reset();
        self.timeline.reset();
        self.pipeline.reset();
    }

    pub fn close(&mut self) {
        self.reassembler.clear();
        self.framer.reset();
        self.timeline.reset();
        self.pipeline.close();
    }

    pub fn controls(&self) -> &AudioControls {
        &self.controls
    }

    pub fn set_controls(&mut self, controls: AudioControls) {
        self.controls = controls;
    }

    pub fn set_drc(&mut self, enabled: bool, ratio: f32) {
        self.controls.drc_enabled = enabled;
        self.controls.drc_ratio = ratio.max(1.0);
    }

    pub fn set_downmix(&mut self, policy: DownmixPolicy) {
        self.controls.downmix = policy;
    }

    /// Positive values delay audio, negative values advance it.
    pub fn set_lip_sync_ms(&mut self, ms: i32) {
        self.controls.lip_sync_ms = ms;
    }

    pub fn set_language(&mut self, language: Option<String>) {
        debug!(language = ?language, "language selection has no effect on single-track input");
        self.controls.language = language;
    }

    pub fn metrics(&mut self) -> MetricsSnapshot {
        let metrics = &mut self.pipeline.metrics;
        metrics.parse_errors = self.framer.parse_errors + self.reassembler.units_discarded;
        metrics.resyncs = self.framer.resyncs;
        self.pipeline.snapshot()
    }
}
