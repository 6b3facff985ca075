use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use pes_decode::core::{FileConfig, Input, Options, run};
use pes_decode::types::{AccelerationPreference, DownmixPolicy, ScaleMode, VideoCodec};

#[derive(Clone, Copy, ValueEnum)]
enum CodecArg {
    H264,
    Hevc,
    Mpeg2,
}

impl From<CodecArg> for VideoCodec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::H264 => VideoCodec::H264,
            CodecArg::Hevc => VideoCodec::Hevc,
            CodecArg::Mpeg2 => VideoCodec::Mpeg2,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineArg {
    Any,
    Hardware,
    Software,
}

#[derive(Parser)]
#[command(version, about = "Decode audio and video PES streams from an MPEG-TS input")]
struct Opt {
    /// Transport stream file to read
    #[clap(long, conflicts_with = "addr")]
    input: Option<PathBuf>,

    /// UDP socket to bind + listen (IPv4, unicast or multicast)
    #[clap(long, default_value = "239.1.1.2:1234")]
    addr: String,

    /// Interface to join multicast groups on
    #[clap(long)]
    iface: Option<Ipv4Addr>,

    /// PID carrying AC-3 audio
    #[clap(long, value_parser = parse_pid)]
    audio_pid: Option<u16>,

    /// PID carrying video
    #[clap(long, value_parser = parse_pid)]
    video_pid: Option<u16>,

    #[clap(long, value_enum, default_value = "h264")]
    codec: CodecArg,

    /// Provisional coded size until the stream says otherwise
    #[clap(long, default_value_t = 1920)]
    width: u32,

    #[clap(long, default_value_t = 1080)]
    height: u32,

    /// fit, fill or stretch
    #[clap(long)]
    scale_mode: Option<ScaleMode>,

    /// Audio delay in milliseconds; negative advances audio
    #[clap(long, allow_hyphen_values = true)]
    lip_sync_ms: Option<i32>,

    /// Enable dynamic range compression with this ratio
    #[clap(long)]
    drc: Option<f32>,

    /// Fold multichannel audio down to stereo
    #[clap(long, default_value_t = false)]
    stereo: bool,

    /// Verify AC-3 frame CRCs
    #[clap(long, default_value_t = false)]
    verify_crc: bool,

    #[clap(long, value_enum, default_value = "any")]
    engine: EngineArg,

    /// Skip pixel output from the software video engine
    #[clap(long, default_value_t = false)]
    no_pixels: bool,

    /// JSON file with pipeline, audio and presenter settings
    #[clap(long)]
    config: Option<PathBuf>,

    /// Refresh interval for the JSON snapshot
    #[clap(long, default_value_t = 2)]
    refresh: u64,
}

fn parse_pid(s: &str) -> Result<u16, String> {
    let pid = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid PID '{s}': {e}"))?;
    if pid > 0x1FFF {
        return Err(format!("PID {pid:#x} exceeds 13 bits"));
    }
    Ok(pid)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init();

    let opt = Opt::parse();

    let mut config = match &opt.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    if let Some(mode) = opt.scale_mode {
        config.presenter.scale_mode = mode;
    }
    if let Some(ms) = opt.lip_sync_ms {
        config.audio.lip_sync_ms = ms;
    }
    if let Some(ratio) = opt.drc {
        config.audio.drc_enabled = true;
        config.audio.drc_ratio = ratio.max(1.0);
    }
    if opt.stereo {
        config.audio.downmix = DownmixPolicy::Stereo;
    }
    if opt.verify_crc {
        config.pipeline.verify_crc = true;
    }
    config.pipeline.acceleration = match opt.engine {
        EngineArg::Any => config.pipeline.acceleration,
        EngineArg::Hardware => AccelerationPreference::PreferHardware,
        EngineArg::Software => AccelerationPreference::PreferSoftware,
    };

    let input = match opt.input {
        Some(path) => Input::File(path),
        None => Input::Udp {
            addr: opt.addr.parse()?,
            iface: opt.iface,
        },
    };

    run(Options {
        input,
        audio_pid: opt.audio_pid,
        video_pid: opt.video_pid,
        video_codec: opt.codec.into(),
        width: opt.width,
        height: opt.height,
        emit_pixels: !opt.no_pixels,
        config,
        refresh_secs: opt.refresh,
    })
    .await
}
