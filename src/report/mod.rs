//! JSON status report printed by the command-line harness

use serde::Serialize;

use crate::stats::MetricsSnapshot;
use crate::types::DecoderState;

/// Per-stream section of the report
#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub pid: u16,
    pub state: DecoderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    pub metrics: MetricsSnapshot,
}

#[derive(Serialize)]
struct ReportJson<'a> {
    ts_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<&'a StreamReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<&'a StreamReport>,
    presenter_fps: f64,
    ts_resyncs: u64,
}

pub struct Reporter;

impl Reporter {
    /// Pretty-printed JSON snapshot stamped with the current UTC time
    pub fn generate_json_report(
        audio: Option<&StreamReport>,
        video: Option<&StreamReport>,
        presenter_fps: f64,
        ts_resyncs: u64,
    ) -> String {
        let rep = ReportJson {
            ts_time: chrono::Utc::now().to_rfc3339(),
            audio,
            video,
            presenter_fps,
            ts_resyncs,
        };
        serde_json::to_string_pretty(&rep).unwrap_or_else(|_| "{\"error\": \"JSON serialization failed\"}".to_string())
    }
}
