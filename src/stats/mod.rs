//! Per-orchestrator counters and the read-only snapshot handed to callers

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::frame::Release;
use crate::queue::PresentationQueue;

/// Mutable counters owned by one orchestrator
pub struct Metrics {
    pub frames_processed: u64,
    /// Units dropped outside the presentation queue (engine discarded, reset)
    pub frames_discarded: u64,
    pub parse_errors: u64,
    pub resyncs: u64,
    total_processing: Duration,
    processing_samples: u64,
    bytes: usize,
    start: Instant,
    header_bitrate_kbps: Option<u32>,
}

/// Read-only view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_processed: u64,
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub late_drops: u64,
    pub timeout_drops: u64,
    pub parse_errors: u64,
    pub resyncs: u64,
    pub avg_processing_ms: f64,
    pub bitrate_kbps: f64,
    pub buffer_occupancy_percent: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_processed: 0,
            frames_discarded: 0,
            parse_errors: 0,
            resyncs: 0,
            total_processing: Duration::ZERO,
            processing_samples: 0,
            bytes: 0,
            start: Instant::now(),
            header_bitrate_kbps: None,
        }
    }

    pub fn record_processing(&mut self, elapsed: Duration) {
        self.total_processing += elapsed;
        self.processing_samples += 1;
    }

    pub fn add_bytes(&mut self, bytes: usize) {
        self.bytes += bytes;
    }

    /// Bitrate announced by the stream itself; wins over the measured one
    pub fn set_header_bitrate(&mut self, kbps: u32) {
        self.header_bitrate_kbps = Some(kbps);
    }

    pub fn average_processing(&self) -> Duration {
        if self.processing_samples == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_processing.as_nanos() / self.processing_samples as u128;
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }

    /// Bitrate in kbps
    pub fn bitrate_kbps(&self) -> f64 {
        if let Some(kbps) = self.header_bitrate_kbps {
            return kbps as f64;
        }
        let seconds = self.start.elapsed().as_secs_f64().max(0.1);
        (self.bytes as f64 * 8.0 / 1000.0) / seconds
    }

    pub fn snapshot<T: Release>(&self, queue: &PresentationQueue<T>) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_processed: self.frames_processed,
            frames_presented: queue.presented,
            frames_dropped: queue.dropped + self.frames_discarded,
            late_drops: queue.late_drops,
            timeout_drops: queue.timeout_drops,
            parse_errors: self.parse_errors,
            resyncs: self.resyncs,
            avg_processing_ms: self.average_processing().as_secs_f64() * 1000.0,
            bitrate_kbps: self.bitrate_kbps(),
            buffer_occupancy_percent: queue.occupancy_percent(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
