//! Harness behind the `cli` binary: transport stream in, PID routing, both
//! orchestrators on the software engine, frames onto a [`Canvas`].

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

use crate::audio::AudioDecoder;
use crate::constants::TS_PACKET_SIZE;
use crate::error::PipelineError;
use crate::frame::{AudioBlock, Release};
use crate::network::create_udp_socket;
use crate::render::{Canvas, Presenter};
use crate::report::{Reporter, StreamReport};
use crate::ts::{TsPacket, TsSplitter};
use crate::types::{AudioCodecConfig, AudioControls, DecoderState, PipelineConfig, PresenterConfig, VideoCodec};
use crate::video::VideoDecoder;

pub enum Input {
    File(PathBuf),
    Udp {
        addr: SocketAddr,
        iface: Option<Ipv4Addr>,
    },
}

/// Settings that can come from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub pipeline: PipelineConfig,
    pub audio: AudioControls,
    pub presenter: PresenterConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub struct Options {
    pub input: Input,
    pub audio_pid: Option<u16>,
    pub video_pid: Option<u16>,
    pub video_codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub emit_pixels: bool,
    pub config: FileConfig,
    pub refresh_secs: u64,
}

/// Everything one input stream drives
pub struct Session {
    splitter: TsSplitter,
    audio: Option<(u16, AudioDecoder)>,
    video: Option<(u16, VideoDecoder)>,
    presenter: Arc<Mutex<Presenter<Canvas>>>,
    video_codec: VideoCodec,
    width: u32,
    height: u32,
}

impl Session {
    pub fn new(opts: &Options) -> anyhow::Result<Self> {
        let presenter_config = opts.config.presenter;
        let presenter = Arc::new(Mutex::new(Presenter::new(
            Canvas::new(presenter_config.width, presenter_config.height),
            presenter_config,
        )));

        let audio = match opts.audio_pid {
            Some(pid) => {
                let mut decoder = AudioDecoder::with_software(
                    &opts.config.pipeline,
                    opts.config.audio.clone(),
                    |block: AudioBlock| {
                        trace!(pts_us = block.pts_us, frames = block.frames(), "audio block");
                        block.release();
                    },
                );
                decoder.initialize(AudioCodecConfig::default())?;
                Some((pid, decoder))
            }
            None => None,
        };

        let video = match opts.video_pid {
            Some(pid) => {
                let sink = Arc::clone(&presenter);
                let mut decoder =
                    VideoDecoder::with_software(&opts.config.pipeline, opts.emit_pixels, move |frame, pts| {
                        trace!(pts_us = pts, "video frame");
                        match sink.lock() {
                            Ok(mut presenter) => {
                                if let Err(e) = presenter.present(frame) {
                                    trace!(error = %e, pts_us = pts, "frame skipped");
                                }
                            }
                            Err(_) => frame.release(),
                        }
                    });
                decoder.initialize(opts.video_codec, opts.width, opts.height)?;
                Some((pid, decoder))
            }
            None => None,
        };

        if audio.is_none() && video.is_none() {
            anyhow::bail!("no audio or video PID selected");
        }

        Ok(Self {
            splitter: TsSplitter::new(),
            audio,
            video,
            presenter,
            video_codec: opts.video_codec,
            width: opts.width,
            height: opts.height,
        })
    }

    /// Feeds raw transport stream bytes of any length
    pub fn feed(&mut self, data: &[u8]) {
        self.splitter.push(data);
        while let Some(raw) = self.splitter.next_packet() {
            let Some(packet) = TsPacket::parse(&raw) else {
                continue;
            };
            self.route(&packet);
        }
    }

    fn route(&mut self, packet: &TsPacket<'_>) {
        if let Some((pid, decoder)) = self.audio.as_mut() {
            if *pid == packet.pid {
                let result = decoder.process_payload(packet.payload);
                if let Err(e) = result {
                    Self::recover_audio(decoder, &e);
                }
                return;
            }
        }
        if let Some((pid, decoder)) = self.video.as_mut() {
            if *pid == packet.pid {
                let result = decoder.process_payload(packet.payload);
                if let Err(e) = result {
                    Self::recover_video(decoder, &e, self.video_codec, self.width, self.height);
                }
            }
        }
    }

    fn recover_audio(decoder: &mut AudioDecoder, error: &PipelineError) {
        warn!(error = %error, "audio pipeline error");
        if decoder.state() == DecoderState::Error {
            decoder.close();
            if let Err(e) = decoder.initialize(AudioCodecConfig::default()) {
                warn!(error = %e, "audio re-initialization failed");
            }
        }
    }

    fn recover_video(decoder: &mut VideoDecoder, error: &PipelineError, codec: VideoCodec, width: u32, height: u32) {
        warn!(error = %error, "video pipeline error");
        if decoder.state() == DecoderState::Error {
            decoder.close();
            if let Err(e) = decoder.initialize(codec, width, height) {
                warn!(error = %e, "video re-initialization failed");
            }
        }
    }

    /// End of input: forwards partial units and drains both pipelines
    pub async fn finish(&mut self) {
        if let Some((_, decoder)) = self.audio.as_mut() {
            if let Err(e) = decoder.flush().await {
                warn!(error = %e, "audio flush failed");
            }
        }
        if let Some((_, decoder)) = self.video.as_mut() {
            if let Err(e) = decoder.flush().await {
                warn!(error = %e, "video flush failed");
            }
        }
    }

    pub fn frames_drawn(&self) -> u64 {
        self.presenter.lock().map(|p| p.frames_drawn).unwrap_or(0)
    }

    pub fn report(&mut self) -> String {
        let audio = self.audio.as_mut().map(|(pid, decoder)| {
            let config = decoder.codec_config().cloned();
            StreamReport {
                pid: *pid,
                state: decoder.state(),
                codec: config.as_ref().map(|c| c.codec_string.clone()),
                width: None,
                height: None,
                channels: config.as_ref().map(|c| c.channels),
                sample_rate: config.as_ref().map(|c| c.sample_rate),
                metrics: decoder.metrics(),
            }
        });
        let video = self.video.as_mut().map(|(pid, decoder)| {
            let config = decoder.codec_config().cloned();
            StreamReport {
                pid: *pid,
                state: decoder.state(),
                codec: config.as_ref().map(|c| c.codec_string.clone()),
                width: config.as_ref().map(|c| c.coded_width),
                height: config.as_ref().map(|c| c.coded_height),
                channels: None,
                sample_rate: None,
                metrics: decoder.metrics(),
            }
        });
        let fps = self.presenter.lock().map(|p| p.fps()).unwrap_or(0.0);
        Reporter::generate_json_report(audio.as_ref(), video.as_ref(), fps, self.splitter.resyncs)
    }

    pub fn close(&mut self) {
        if let Some((_, decoder)) = self.audio.as_mut() {
            decoder.close();
        }
        if let Some((_, decoder)) = self.video.as_mut() {
            decoder.close();
        }
    }
}

/// Runs until the input ends, the socket fails or Ctrl-C.
pub async fn run(opts: Options) -> anyhow::Result<()> {
    let mut session = Session::new(&opts)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(opts.refresh_secs.max(1)));
    ticker.tick().await;
    let mut buf = vec![0u8; TS_PACKET_SIZE * 64];

    match &opts.input {
        Input::File(path) => {
            info!(path = %path.display(), "reading transport stream file");
            let mut file = tokio::fs::File::open(path).await?;
            loop {
                tokio::select! {
                    n = file.read(&mut buf) => {
                        let n = n?;
                        if n == 0 {
                            break;
                        }
                        session.feed(&buf[..n]);
                    }
                    _ = ticker.tick() => println!("{}", session.report()),
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Input::Udp { addr, iface } => {
            info!(addr = %addr, "listening for transport stream over UDP");
            let socket = UdpSocket::from_std(create_udp_socket(*addr, *iface)?)?;
            loop {
                tokio::select! {
                    n = socket.recv(&mut buf) => {
                        let n = n?;
                        session.feed(&buf[..n]);
                    }
                    _ = ticker.tick() => println!("{}", session.report()),
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    session.finish().await;
    println!("{}", session.report());
    session.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TS_SYNC_BYTE;
    use crate::parsers::audio::tests::build_frame;
    use crate::parsers::video::tests::{H264_PPS, H264_SPS_720P, annexb};
    use crate::pes::tests::build_pes;

    /// Splits a PES unit into TS packets, stuffing the last one through its adaptation field
    fn packetize(pid: u16, pes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, chunk) in pes.chunks(184).enumerate() {
            let mut packet = vec![TS_SYNC_BYTE, (pid >> 8) as u8 & 0x1F, pid as u8, 0x10 | (i as u8 & 0x0F)];
            if i == 0 {
                packet[1] |= 0x40;
            }
            if chunk.len() < 184 {
                packet[3] |= 0x20;
                let stuffing = 184 - chunk.len() - 1;
                packet.push(stuffing as u8);
                if stuffing > 0 {
                    packet.push(0x00);
                    packet.extend(std::iter::repeat_n(0xFF, stuffing - 1));
                }
            }
            packet.extend_from_slice(chunk);
            out.extend(packet);
        }
        out
    }

    fn options() -> Options {
        Options {
            input: Input::File(PathBuf::from("unused.ts")),
            audio_pid: Some(0x101),
            video_pid: Some(0x100),
            video_codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            emit_pixels: true,
            config: FileConfig {
                presenter: PresenterConfig {
                    width: 320,
                    height: 180,
                    ..PresenterConfig::default()
                },
                ..FileConfig::default()
            },
            refresh_secs: 1,
        }
    }

    #[tokio::test]
    async fn transport_stream_end_to_end() {
        let mut session = Session::new(&options()).unwrap();
        let idr = annexb(&[&H264_SPS_720P, &H264_PPS, &[0x65, 0x88, 0x84, 0x21]]);
        let delta = annexb(&[&[0x41, 0x9A, 0x02, 0x11]]);

        let mut stream = Vec::new();
        stream.extend(packetize(0x100, &build_pes(0xE0, Some(90_000), None, &idr)));
        stream.extend(packetize(0x101, &build_pes(0xC0, Some(90_000), None, &build_frame(0, 2, false))));
        stream.extend(packetize(0x100, &build_pes(0xE0, Some(93_600), None, &delta)));
        stream.extend(packetize(0x101, &build_pes(0xC0, Some(92_880), None, &build_frame(0, 2, false))));

        // deliver in awkward slices
        for chunk in stream.chunks(100) {
            session.feed(chunk);
        }
        session.finish().await;

        assert_eq!(session.frames_drawn(), 2);
        let report: serde_json::Value = serde_json::from_str(&session.report()).unwrap();
        assert_eq!(report["video"]["codec"], "avc1.42c01f");
        assert_eq!(report["video"]["metrics"]["frames_presented"], 2);
        assert_eq!(report["audio"]["metrics"]["frames_presented"], 2);
        assert_eq!(report["ts_resyncs"], 0);
        session.close();
    }

    #[test]
    fn file_config_defaults_fill_gaps() {
        let config: FileConfig = serde_json::from_str(r#"{"audio": {"lip_sync_ms": -40}}"#).unwrap();
        assert_eq!(config.audio.lip_sync_ms, -40);
        assert_eq!(config.pipeline.queue_timeout_ms, 1000);
        assert_eq!(config.presenter, PresenterConfig::default());
    }

    #[test]
    fn nothing_selected_is_an_error() {
        let mut opts = options();
        opts.audio_pid = None;
        opts.video_pid = None;
        assert!(Session::new(&opts).is_err());
    }
}
