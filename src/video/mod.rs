//! Video orchestrator.
//!
//! Reassembles access units, lifts codec configuration out of the stream,
//! tags each unit key or delta and hands it to the Decode Engine. Decoded
//! frames come back through the presentation queue in timestamp order.

use std::time::Instant;

use tracing::{debug, info, trace};

use crate::engine::{BoxedEngine, DecodeUnit, NullVideoCodec, SoftwareFallback};
use crate::error::PipelineError;
use crate::frame::VideoFrame;
use crate::parsers::{ExtractedConfig, extract_config, is_keyframe};
use crate::pes::{PesReassembler, PtsUnwrapper, ticks_to_micros};
use crate::pipeline::DecodePipeline;
use crate::stats::MetricsSnapshot;
use crate::types::{AccelerationPreference, DecoderState, PesPacket, PipelineConfig, VideoCodec, VideoCodecConfig};

/// Receives each presented frame and its timestamp in microseconds. The
/// receiver owns the frame and must release it.
pub type FrameOutput = Box<dyn FnMut(VideoFrame, i64) + Send + 'static>;
pub type ErrorCallback = Box<dyn FnMut(&PipelineError) + Send + 'static>;

pub struct VideoDecoder {
    reassembler: PesReassembler,
    timeline: PtsUnwrapper,
    pipeline: DecodePipeline<VideoCodecConfig, VideoFrame>,
    codec: Option<VideoCodec>,
    acceleration: AccelerationPreference,
    config_extracted: bool,
    awaiting_keyframe: bool,
    untimed_units: u64,
    skipped_deltas: u64,
    pub keyframes: u64,
    output: FrameOutput,
    on_error: Option<ErrorCallback>,
}

impl VideoDecoder {
    pub fn new(
        engines: Vec<BoxedEngine<VideoCodecConfig, VideoFrame>>,
        config: &PipelineConfig,
        output: impl FnMut(VideoFrame, i64) + Send + 'static,
    ) -> Self {
        Self {
            reassembler: PesReassembler::new(),
            timeline: PtsUnwrapper::new(),
            pipeline: DecodePipeline::new("video", engines, config),
            codec: None,
            acceleration: config.acceleration,
            config_extracted: false,
            awaiting_keyframe: true,
            untimed_units: 0,
            skipped_deltas: 0,
            keyframes: 0,
            output: Box::new(output),
            on_error: None,
        }
    }

    /// Decoder backed only by the software engine
    pub fn with_software(
        config: &PipelineConfig,
        emit_pixels: bool,
        output: impl FnMut(VideoFrame, i64) + Send + 'static,
    ) -> Self {
        let engine: BoxedEngine<VideoCodecConfig, VideoFrame> =
            Box::new(SoftwareFallback::new(NullVideoCodec::new(emit_pixels)));
        Self::new(vec![engine], config, output)
    }

    pub fn set_error_callback(&mut self, callback: impl FnMut(&PipelineError) + Send + 'static) {
        self.on_error = Some(Box::new(callback));
    }

    pub fn state(&self) -> DecoderState {
        self.pipeline.state()
    }

    pub fn codec_config(&self) -> Option<&VideoCodecConfig> {
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

    /// Configures the engine with a provisional configuration. Fails with
    /// [`PipelineError::Configuration`] if no engine accepts it.
    pub fn initialize(&mut self, codec: VideoCodec, width: u32, height: u32) -> Result<(), PipelineError> {
        let config = VideoCodecConfig::initial(codec, width, height, self.acceleration);
        let result = self.pipeline.initialize(config);
        if result.is_ok() {
            self.codec = Some(codec);
            self.config_extracted = false;
            self.awaiting_keyframe = true;
        }
        self.surface(result)
    }

    /// Feeds one demultiplexed chunk of the video PES stream.
    pub fn process_payload(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        let started = Instant::now();
        let mut result = Ok(());
        if let Some(packet) = self.reassembler.process_payload(chunk) {
            result = self.handle_packet(packet);
        }
        if result.is_ok() {
            result = self.pump();
        }
        self.pipeline.metrics.record_processing(started.elapsed());
        self.surface(result)
    }

    fn handle_packet(&mut self, packet: PesPacket) -> Result<(), PipelineError> {
        let Some(codec) = self.codec else {
            return Err(PipelineError::InvalidState {
                operation: "decode",
                state: self.pipeline.state(),
            });
        };
        let data = packet.payload;
        self.pipeline.metrics.add_bytes(data.len());

        let is_key = is_keyframe(codec, &data);
        if !self.config_extracted || is_key {
            if let Some(extracted) = extract_config(codec, &data) {
                self.apply_config(codec, extracted)?;
            }
        }

        let Some(ticks) = packet.header.pts.or(packet.header.dts) else {
            trace!(len = data.len(), "access unit without timestamp skipped");
            self.untimed_units += 1;
            return Ok(());
        };
        if is_key {
            self.keyframes += 1;
            self.awaiting_keyframe = false;
        } else if self.awaiting_keyframe {
            trace!(pts = ticks, "delta unit before first keyframe skipped");
            self.skipped_deltas += 1;
            return Ok(());
        }

        self.pipeline.submit(DecodeUnit {
            timestamp_us: ticks_to_micros(self.timeline.extend(ticks)),
            is_key,
            data,
        })
    }

    fn apply_config(&mut self, codec: VideoCodec, extracted: ExtractedConfig) -> Result<(), PipelineError> {
        self.config_extracted = true;
        let unchanged = self
            .pipeline
            .config()
            .and_then(|config| config.description.as_ref())
            .is_some_and(|record| *record == extracted.record);
        if unchanged {
            return Ok(());
        }
        info!(
            codec_string = %extracted.codec_string,
            width = extracted.width,
            height = extracted.height,
            "in-band video configuration"
        );
        self.pipeline.reconfigure(VideoCodecConfig {
            codec,
            codec_string: extracted.codec_string,
            coded_width: extracted.width,
            coded_height: extracted.height,
            description: Some(extracted.record),
            acceleration: self.acceleration,
        })
    }

    fn pump(&mut self) -> Result<(), PipelineError> {
        let output = &mut self.output;
        self.pipeline.pump(&mut |pts, frame| output(frame, pts))
    }

    /// Forwards the unit still being accumulated, then waits until the engine
    /// has nothing outstanding and presents everything queued.
    pub async fn flush(&mut self) -> Result<(), PipelineError> {
        let mut result = Ok(());
        if let Some(packet) = self.reassembler.flush() {
            result = self.handle_packet(packet);
        }
        if result.is_ok() {
            let output = &mut self.output;
            result = self.pipeline.flush(&mut |pts, frame| output(frame, pts)).await;
        }
        self.surface(result)
    }

    /// Discards buffered input and releases every decoded frame still held.
    /// The extracted configuration survives.
    pub fn reset(&mut self) {
        self.reassembler.clear();
        self.timeline.reset();
        self.awaiting_keyframe = true;
        self.pipeline.reset();
        debug!("video decoder reset");
    }

    pub fn close(&mut self) {
        self.reassembler.clear();
        self.timeline.reset();
        self.pipeline.close();
        self.codec = None;
        self.config_extracted = false;
        self.awaiting_keyframe = true;
    }

    pub fn metrics(&mut self) -> MetricsSnapshot {
        let metrics = &mut self.pipeline.metrics;
        metrics.parse_errors = self.reassembler.units_discarded + self.untimed_units;
        let mut snapshot = self.pipeline.snapshot();
        snapshot.frames_dropped += self.skipped_deltas;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Release;
    use crate::parsers::video::tests::{H264_PPS, H264_SPS_720P, annexb, avc_sps};
    use crate::pes::tests::build_pes;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Shown = Arc<Mutex<Vec<(i64, u32, u32, bool)>>>;

    fn decoder_with(codec: NullVideoCodec) -> (VideoDecoder, Shown) {
        let shown: Shown = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&shown);
        let engine: BoxedEngine<VideoCodecConfig, VideoFrame> = Box::new(SoftwareFallback::new(codec));
        let decoder = VideoDecoder::new(vec![engine], &PipelineConfig::default(), move |frame, pts| {
            sink.lock()
                .unwrap()
                .push((pts, frame.width, frame.height, frame.is_key));
            frame.release();
        });
        (decoder, shown)
    }

    fn idr_unit(pts: u64) -> Vec<u8> {
        let au = annexb(&[&H264_SPS_720P, &H264_PPS, &[0x65, 0x88, 0x84, 0x00]]);
        build_pes(0xE0, Some(pts), None, &au)
    }

    fn delta_unit(pts: u64) -> Vec<u8> {
        build_pes(0xE0, Some(pts), None, &annexb(&[&[0x41, 0x9A, 0x02]]))
    }

    #[test]
    fn unsupported_dimensions_fail_initialize() {
        let (mut decoder, _) = decoder_with(NullVideoCodec::new(false));
        let result = decoder.initialize(VideoCodec::H264, 0, 0);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
        assert_eq!(decoder.state(), DecoderState::Unconfigured);
    }

    #[tokio::test]
    async fn parameter_sets_reconfigure_engine() {
        let (mut decoder, shown) = decoder_with(NullVideoCodec::new(false));
        decoder.initialize(VideoCodec::H264, 640, 360).unwrap();
        decoder.process_payload(&idr_unit(90_000)).unwrap();
        decoder.process_payload(&delta_unit(93_000)).unwrap();
        decoder.flush().await.unwrap();

        let config = decoder.codec_config().unwrap();
        assert_eq!(config.codec_string, "avc1.42c01f");
        assert_eq!((config.coded_width, config.coded_height), (1280, 720));
        assert!(config.description.is_some());

        let shown = shown.lock().unwrap();
        assert_eq!(
            *shown,
            vec![(1_000_000, 1280, 720, true), (1_033_333, 1280, 720, false)]
        );
        assert_eq!(decoder.keyframes, 1);
    }

    #[tokio::test]
    async fn later_keyframe_with_new_sps_reconfigures() {
        let (mut decoder, shown) = decoder_with(NullVideoCodec::new(false));
        decoder.initialize(VideoCodec::H264, 1280, 720).unwrap();
        let sps_1080 = avc_sps(120, 68, Some([0, 0, 0, 4]));
        let au = annexb(&[&sps_1080, &H264_PPS, &[0x65, 0x88, 0x84, 0x00]]);

        decoder.process_payload(&idr_unit(0)).unwrap();
        decoder.process_payload(&build_pes(0xE0, Some(3000), None, &au)).unwrap();
        let first = decoder.codec_config().unwrap().description.clone();
        assert!(first.is_some());
        // let the 720p unit come out of the engine before it is reconfigured
        tokio::time::sleep(Duration::from_millis(20)).await;

        decoder.process_payload(&build_pes(0xE0, Some(6000), None, &au)).unwrap();
        decoder.flush().await.unwrap();

        let config = decoder.codec_config().unwrap();
        assert_eq!((config.coded_width, config.coded_height), (1920, 1080));
        assert_ne!(config.description, first);
        let sizes: Vec<(u32, u32)> = shown.lock().unwrap().iter().map(|s| (s.1, s.2)).collect();
        assert_eq!(sizes, vec![(1280, 720), (1920, 1080), (1920, 1080)]);
        assert_eq!(decoder.keyframes, 3);
    }

    #[tokio::test]
    async fn dts_stands_in_for_missing_pts() {
        let (mut decoder, shown) = decoder_with(NullVideoCodec::new(false));
        decoder.initialize(VideoCodec::H264, 1280, 720).unwrap();
        decoder.process_payload(&idr_unit(0)).unwrap();

        let mut dts_only = build_pes(0xE0, Some(0), Some(9000), &annexb(&[&[0x41, 0x9A, 0x02]]));
        dts_only[7] = 0x40;
        decoder.process_payload(&dts_only).unwrap();
        // neither timestamp: skipped and counted
        decoder
            .process_payload(&build_pes(0xE0, None, None, &annexb(&[&[0x41, 0x9A, 0x02]])))
            .unwrap();
        decoder.flush().await.unwrap();

        let pts: Vec<i64> = shown.lock().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(pts, vec![0, 100_000]);
        let metrics = decoder.metrics();
        assert_eq!(metrics.frames_processed, 2);
        assert_eq!(metrics.parse_errors, 1);
    }

    #[tokio::test]
    async fn pts_rollover_is_not_late() {
        let (mut decoder, shown) = decoder_with(NullVideoCodec::new(false));
        decoder.initialize(VideoCodec::H264, 1280, 720).unwrap();
        decoder.process_payload(&idr_unit((1 << 33) - 3000)).unwrap();
        decoder.process_payload(&delta_unit(0)).unwrap();
        decoder.flush().await.unwrap();

        let pts: Vec<i64> = shown.lock().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(pts, vec![95_443_684_355, 95_443_717_688]);
        assert_eq!(decoder.metrics().frames_dropped, 0);
    }

    #[tokio::test]
    async fn deltas_wait_for_a_keyframe() {
        let (mut decoder, shown) = decoder_with(NullVideoCodec::new(false));
        decoder.initialize(VideoCodec::H264, 1280, 720).unwrap();
        decoder.process_payload(&delta_unit(0)).unwrap();
        decoder.process_payload(&idr_unit(3000)).unwrap();
        decoder.flush().await.unwrap();

        let pts: Vec<i64> = shown.lock().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(pts, vec![33_333]);
        assert_eq!(decoder.metrics().frames_dropped, 1);
    }

    #[tokio::test]
    async fn reset_releases_undelivered_frames() {
        let codec = NullVideoCodec::new(true);
        let live = codec.live_frames();
        let (mut decoder, shown) = decoder_with(codec);
        decoder.initialize(VideoCodec::H264, 1280, 720).unwrap();
        decoder.process_payload(&idr_unit(0)).unwrap();
        decoder.process_payload(&delta_unit(3000)).unwrap();
        decoder.process_payload(&delta_unit(6000)).unwrap();
        // let the worker emit into the output channel without pumping it
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(live.load(Ordering::SeqCst) > 0);

        decoder.reset();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(shown.lock().unwrap().is_empty());
        assert_eq!(decoder.state(), DecoderState::Configured);
        assert_eq!(decoder.codec_config().unwrap().coded_width, 1280);
    }

    #[tokio::test]
    async fn mpeg2_sequence_header_and_intra() {
        let (mut decoder, shown) = decoder_with(NullVideoCodec::new(false));
        decoder.initialize(VideoCodec::Mpeg2, 352, 288).unwrap();
        let mut es = vec![0x00, 0x00, 0x01, 0xB3, 0x2D, 0x02, 0x40, 0x33, 0xFF, 0xFF, 0xE0, 0x18];
        es.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x00, 0x0F, 0xFF, 0xF8]);
        decoder.process_payload(&build_pes(0xE0, Some(0), None, &es)).unwrap();
        decoder.flush().await.unwrap();

        let config = decoder.codec_config().unwrap();
        assert_eq!(config.codec_string, "mp2v");
        assert_eq!((config.coded_width, config.coded_height), (720, 576));
        assert_eq!(*shown.lock().unwrap(), vec![(0, 720, 576, true)]);
    }

    #[tokio::test]
    async fn engine_failure_reaches_error_callback() {
        let (mut decoder, _) = decoder_with(NullVideoCodec::new(false));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        decoder.set_error_callback(move |e| sink.lock().unwrap().push(e.to_string()));
        decoder.initialize(VideoCodec::H264, 1280, 720).unwrap();

        // the software codec refuses an empty access unit
        decoder.process_payload(&idr_unit(0)).unwrap();
        decoder.process_payload(&build_pes(0xE0, Some(3000), None, &[])).unwrap();
        assert!(decoder.flush().await.is_err());
        assert_eq!(decoder.state(), DecoderState::Error);
        assert_eq!(errors.lock().unwrap().len(), 1);

        decoder.close();
        decoder.initialize(VideoCodec::H264, 1280, 720).unwrap();
        assert_eq!(decoder.state(), DecoderState::Configured);
    }
}
