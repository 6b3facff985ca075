//! AC-3 sync frame extraction across PES boundaries

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::constants::{AC3_HEADER_LEN, AC3_SYNC_WORD, PTS_MASK};
use crate::parsers::{frame_duration_ticks, parse_ac3_header, verify_frame_crc};
use crate::types::AudioFrameHeader;

/// One complete sync frame with its 90 kHz timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub header: AudioFrameHeader,
    pub pts: u64,
    pub data: Bytes,
}

#[derive(Default)]
pub struct AudioFramer {
    carry: BytesMut,
    verify_crc: bool,
    /// PES timestamp not yet claimed, with the buffer offset its payload starts at
    pending_pts: Option<(usize, u64)>,
    next_pts: Option<u64>,
    pub frames: u64,
    pub parse_errors: u64,
    pub resyncs: u64,
}

fn find_sync(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == AC3_SYNC_WORD)
}

impl AudioFramer {
    pub fn new(verify_crc: bool) -> Self {
        Self {
            verify_crc,
            ..Self::default()
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    fn keep_from(&mut self, buf: &Bytes, from: usize) {
        self.carry.extend_from_slice(&buf[from..]);
        self.pending_pts = self.pending_pts.map(|(start, pts)| (start.saturating_sub(from), pts));
    }

    /// Scans `payload` (after whatever was carried over) for complete frames.
    ///
    /// The first frame starting inside the payload a PES timestamp came with
    /// takes that timestamp; every other frame takes the previous frame's
    /// timestamp plus its duration.
    pub fn push(&mut self, payload: &[u8], pts: Option<u64>) -> Vec<AudioFrame> {
        if let Some(pts) = pts {
            self.pending_pts = Some((self.carry.len(), pts));
        }
        self.carry.extend_from_slice(payload);
        let buf = self.carry.split().freeze();

        let mut frames = Vec::new();
        let mut pos = 0;

        loop {
            let Some(offset) = find_sync(&buf[pos..]) else {
                // a trailing 0x0B may be the first half of a sync word
                let keep = if buf.len() > pos && buf[buf.len() - 1] == AC3_SYNC_WORD[0] {
                    buf.len() - 1
                } else {
                    buf.len()
                };
                self.keep_from(&buf, keep);
                break;
            };
            let sync = pos + offset;
            if offset > 0 {
                trace!(skipped = offset, "bytes skipped before AC-3 sync");
            }
            if buf.len() - sync < AC3_HEADER_LEN {
                self.keep_from(&buf, sync);
                break;
            }

            let header = match parse_ac3_header(&buf[sync..]) {
                Ok(header) => header,
                Err(e) => {
                    trace!(error = %e, at = sync, "false AC-3 sync, resynchronizing");
                    self.parse_errors += 1;
                    self.resyncs += 1;
                    pos = sync + 2;
                    continue;
                }
            };
            if buf.len() - sync < header.frame_size {
                self.keep_from(&buf, sync);
                break;
            }

            let data = buf.slice(sync..sync + header.frame_size);
            if self.verify_crc && verify_frame_crc(&data).is_err() {
                trace!(at = sync, "AC-3 CRC mismatch, resynchronizing");
                self.parse_errors += 1;
                self.resyncs += 1;
                pos = sync + 2;
                continue;
            }
            pos = sync + header.frame_size;

            let timestamp = match self.pending_pts {
                Some((start, pts)) if sync >= start => {
                    self.pending_pts = None;
                    Some(pts)
                }
                _ => self.next_pts,
            };
            let Some(frame_pts) = timestamp else {
                trace!("AC-3 frame without timestamp skipped");
                self.parse_errors += 1;
                continue;
            };
            self.next_pts = Some((frame_pts + frame_duration_ticks(header.sample_rate)) & PTS_MASK);
            self.frames += 1;
            frames.push(AudioFrame {
                header,
                pts: frame_pts,
                data,
            });
        }
        frames
    }

    /// Forgets carried bytes and the timestamp chain
    pub fn reset(&mut self) {
        self.carry.clear();
        self.pending_pts = None;
        self.next_pts = None;
    }
}
