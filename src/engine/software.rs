//! Software fallback engine.
//!
//! Units are decoded on a tokio worker task so output reaches the orchestrator
//! through the sink asynchronously, exactly as a hardware engine's would. The
//! codec itself is pluggable: [`NullVideoCodec`] and [`SilentAudioCodec`] keep
//! framing, timing and resource accounting honest without reconstructing media.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{DecodeEngine, DecodeUnit, EngineKind, EngineSink};
use crate::constants::AC3_SAMPLES_PER_FRAME;
use crate::error::EngineError;
use crate::frame::{AudioBlock, Release, VideoFrame};
use crate::types::{AudioCodecConfig, VideoCodecConfig};

/// Per-unit decode step run on the worker
pub trait SoftwareCodec: Send + Sync + 'static {
    type Config: Clone + Send + Sync + 'static;
    type Output: Release + Send + 'static;

    fn supports(&self, config: &Self::Config) -> bool;

    fn decode(&self, config: &Self::Config, unit: &DecodeUnit) -> Result<Self::Output, EngineError>;
}

/// Work submitted since the last reset. A reset retires the generation; work
/// finishing on a retired generation is released instead of emitted.
#[derive(Default)]
struct Generation {
    id: u64,
    count: AtomicUsize,
    idle: Notify,
    retired: Mutex<bool>,
}

impl Generation {
    fn next(&self) -> Self {
        Self {
            id: self.id + 1,
            ..Self::default()
        }
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn complete(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    /// Emits `output` unless the generation was retired. Holding the lock across
    /// the send means no output of a retired generation lands after `retire` returns.
    fn deliver<O: Release>(&self, sink: &EngineSink<O>, timestamp_us: i64, output: O) {
        let retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        if *retired {
            trace!(generation = self.id, timestamp_us, "stale software output released");
            output.release();
        } else {
            sink.output(timestamp_us, output);
        }
    }

    fn retire(&self) {
        *self.retired.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.count.store(0, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    fn is_retired(&self) -> bool {
        *self.retired.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct Worker {
    tx: mpsc::UnboundedSender<DecodeUnit>,
    handle: JoinHandle<()>,
}

pub struct SoftwareFallback<S: SoftwareCodec> {
    codec: Arc<S>,
    sink: Option<EngineSink<S::Output>>,
    config: Option<S::Config>,
    worker: Option<Worker>,
    generation: Arc<Generation>,
}

impl<S: SoftwareCodec> SoftwareFallback<S> {
    pub fn new(codec: S) -> Self {
        Self {
            codec: Arc::new(codec),
            sink: None,
            config: None,
            worker: None,
            generation: Arc::new(Generation::default()),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.generation.count.load(Ordering::SeqCst)
    }

    fn spawn_worker(&mut self, config: S::Config) -> Result<(), EngineError> {
        let runtime = Handle::try_current()
            .map_err(|_| EngineError::new("software engine needs a tokio runtime"))?;
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| EngineError::new("no output registered"))?;
        let codec = Arc::clone(&self.codec);
        let generation = Arc::clone(&self.generation);
        let (tx, mut rx) = mpsc::unbounded_channel::<DecodeUnit>();

        let handle = runtime.spawn(async move {
            while let Some(unit) = rx.recv().await {
                if generation.is_retired() {
                    break;
                }
                match codec.decode(&config, &unit) {
                    Ok(output) => generation.deliver(&sink, unit.timestamp_us, output),
                    Err(e) => {
                        if !generation.is_retired() {
                            sink.error(e);
                        }
                    }
                }
                generation.complete();
            }
        });
        self.worker = Some(Worker { tx, handle });
        Ok(())
    }

    /// Stops the worker and starts a fresh generation. A decode already running
    /// on another thread finishes against the retired generation.
    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
        }
        self.generation.retire();
        self.generation = Arc::new(self.generation.next());
    }
}

#[async_trait]
impl<S: SoftwareCodec> DecodeEngine for SoftwareFallback<S> {
    type Config = S::Config;
    type Output = S::Output;

    fn kind(&self) -> EngineKind {
        EngineKind::SoftwareFallback
    }

    fn name(&self) -> &str {
        "software"
    }

    fn is_config_supported(&self, config: &S::Config) -> bool {
        self.codec.supports(config)
    }

    fn set_output(&mut self, sink: EngineSink<S::Output>) {
        self.sink = Some(sink);
    }

    fn configure(&mut self, config: &S::Config) -> Result<(), EngineError> {
        if !self.codec.supports(config) {
            return Err(EngineError::new("configuration rejected"));
        }
        // Units already queued finish on the old worker with the old config
        if let Some(old) = self.worker.take() {
            drop(old.tx);
        }
        self.config = Some(config.clone());
        self.spawn_worker(config.clone())
    }

    fn decode(&mut self, unit: DecodeUnit) -> Result<(), EngineError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| EngineError::new("decode before configure"))?;
        self.generation.add();
        if worker.tx.send(unit).is_err() {
            self.generation.complete();
            return Err(EngineError::new("software worker stopped"));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), EngineError> {
        if self.worker.as_ref().is_some_and(|w| w.handle.is_finished()) && self.outstanding() > 0 {
            warn!("software worker exited with work outstanding");
            self.stop_worker();
            return Err(EngineError::new("software worker exited"));
        }
        self.generation.wait_idle().await;
        Ok(())
    }

    fn reset(&mut self) {
        self.stop_worker();
        if let Some(config) = self.config.clone() {
            if let Err(e) = self.spawn_worker(config) {
                debug!(error = %e, "software engine not restarted after reset");
            }
        }
    }

    fn close(&mut self) {
        self.stop_worker();
        self.config = None;
    }
}

impl<S: SoftwareCodec> Drop for SoftwareFallback<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
        }
        self.generation.retire();
    }
}

/// Emits frames of the configured size. Counts live frames so leaks are visible.
#[derive(Default)]
pub struct NullVideoCodec {
    pub emit_pixels: bool,
    live_frames: Arc<AtomicUsize>,
}

impl NullVideoCodec {
    pub fn new(emit_pixels: bool) -> Self {
        Self {
            emit_pixels,
            live_frames: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of frames handed out and not yet released
    pub fn live_frames(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_frames)
    }
}

const MAX_DIMENSION: u32 = 8192;

impl SoftwareCodec for NullVideoCodec {
    type Config = VideoCodecConfig;
    type Output = VideoFrame;

    fn supports(&self, config: &VideoCodecConfig) -> bool {
        (1..=MAX_DIMENSION).contains(&config.coded_width) && (1..=MAX_DIMENSION).contains(&config.coded_height)
    }

    fn decode(&self, config: &VideoCodecConfig, unit: &DecodeUnit) -> Result<VideoFrame, EngineError> {
        if unit.data.is_empty() {
            return Err(EngineError::new("empty access unit"));
        }
        let (w, h) = (config.coded_width, config.coded_height);
        let data = if self.emit_pixels {
            Bytes::from(vec![0x10; w as usize * h as usize * 4])
        } else {
            Bytes::new()
        };
        let live = Arc::clone(&self.live_frames);
        live.fetch_add(1, Ordering::SeqCst);
        let mut frame = VideoFrame::new(w, h, unit.timestamp_us, data).with_releaser(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        });
        frame.is_key = unit.is_key;
        Ok(frame)
    }
}

/// Emits one block of silence per sync frame
#[derive(Default)]
pub struct SilentAudioCodec;

impl SoftwareCodec for SilentAudioCodec {
    type Config = AudioCodecConfig;
    type Output = AudioBlock;

    fn supports(&self, config: &AudioCodecConfig) -> bool {
        matches!(config.sample_rate, 32_000 | 44_100 | 48_000) && (1..=6).contains(&config.channels)
    }

    fn decode(&self, config: &AudioCodecConfig, unit: &DecodeUnit) -> Result<AudioBlock, EngineError> {
        Ok(AudioBlock {
            samples: vec![0.0; AC3_SAMPLES_PER_FRAME as usize * config.channels as usize],
            sample_rate: config.sample_rate,
            channels: config.channels,
            channel_mode: config.channel_mode,
            lfe: config.lfe,
            pts_us: unit.timestamp_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineEvent, output_channel};
    use crate::frame::Release;
    use crate::types::{AccelerationPreference, VideoCodec};

    fn unit(ts: i64) -> DecodeUnit {
        DecodeUnit {
            timestamp_us: ts,
            is_key: ts == 0,
            data: Bytes::from_static(&[0x00, 0x00, 0x01, 0x65]),
        }
    }

    #[tokio::test]
    async fn flush_waits_for_all_output() {
        let codec = NullVideoCodec::new(false);
        let live = codec.live_frames();
        let mut engine = SoftwareFallback::new(codec);
        let (sink, mut rx) = output_channel();
        engine.set_output(sink);
        let config = VideoCodecConfig::initial(VideoCodec::H264, 64, 32, AccelerationPreference::NoPreference);
        engine.configure(&config).unwrap();

        for ts in [0, 40_000, 80_000] {
            engine.decode(unit(ts)).unwrap();
        }
        engine.flush().await.unwrap();
        assert_eq!(engine.outstanding(), 0);

        let mut seen = Vec::new();
        while let Ok(EngineEvent::Output { timestamp_us, output }) = rx.try_recv() {
            assert_eq!((output.width, output.height), (64, 32));
            seen.push(timestamp_us);
            output.release();
        }
        assert_eq!(seen, vec![0, 40_000, 80_000]);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    /// Takes 100 ms per unit on whatever thread runs it
    struct SlowCodec {
        live: Arc<AtomicUsize>,
    }

    impl SoftwareCodec for SlowCodec {
        type Config = VideoCodecConfig;
        type Output = VideoFrame;

        fn supports(&self, _config: &VideoCodecConfig) -> bool {
            true
        }

        fn decode(&self, _config: &VideoCodecConfig, unit: &DecodeUnit) -> Result<VideoFrame, EngineError> {
            std::thread::sleep(std::time::Duration::from_millis(100));
            let live = Arc::clone(&self.live);
            live.fetch_add(1, Ordering::SeqCst);
            Ok(VideoFrame::new(4, 4, unit.timestamp_us, Bytes::new()).with_releaser(move || {
                live.fetch_sub(1, Ordering::SeqCst);
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reset_retires_in_flight_decode() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut engine = SoftwareFallback::new(SlowCodec {
            live: Arc::clone(&live),
        });
        let (sink, mut rx) = output_channel();
        engine.set_output(sink);
        let config = VideoCodecConfig::initial(VideoCodec::H264, 4, 4, AccelerationPreference::NoPreference);
        engine.configure(&config).unwrap();

        engine.decode(unit(0)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        engine.reset();
        assert_eq!(engine.outstanding(), 0);

        engine.decode(unit(40_000)).unwrap();
        assert_eq!(engine.outstanding(), 1);
        engine.flush().await.unwrap();
        assert_eq!(engine.outstanding(), 0);

        // let the retired decode finish too
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Output { timestamp_us, output } = event {
                seen.push(timestamp_us);
                output.release();
            }
        }
        assert_eq!(seen, vec![40_000]);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_never_underflows() {
        let generation = Generation::default();
        generation.add();
        generation.retire();
        generation.complete();
        assert_eq!(generation.count.load(Ordering::SeqCst), 0);
        assert_eq!(generation.next().id, 1);
    }

    #[tokio::test]
    async fn decode_before_configure_fails() {
        let mut engine = SoftwareFallback::new(SilentAudioCodec);
        assert!(engine.decode(unit(0)).is_err());
    }

    #[test]
    fn configure_without_runtime_is_an_error() {
        let mut engine = SoftwareFallback::new(SilentAudioCodec);
        let (sink, _rx) = output_channel();
        engine.set_output(sink);
        assert!(engine.configure(&AudioCodecConfig::default()).is_err());
    }

    #[test]
    fn capability_limits() {
        let video = SoftwareFallback::new(NullVideoCodec::default());
        let huge = VideoCodecConfig::initial(VideoCodec::Hevc, 16_384, 16_384, AccelerationPreference::NoPreference);
        assert!(!video.is_config_supported(&huge));

        let audio = SoftwareFallback::new(SilentAudioCodec);
        let mut config = AudioCodecConfig::default();
        assert!(audio.is_config_supported(&config));
        config.sample_rate = 22_050;
        assert!(!audio.is_config_supported(&config));
    }
}
