//! PES reassembly and header / timestamp parsing.
//!
//! Payload chunks arrive with arbitrary boundaries. A chunk beginning with
//! `00 00 01` closes the unit in progress and opens a new one; anything else
//! extends the open unit. Chunks seen before the first start code are dropped.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::constants::{PES_FIXED_HEADER_LEN, PES_START_CODE, PTS_WRAP_THRESHOLD};
use crate::error::MalformedStream;
use crate::types::{PesHeader, PesPacket};

/// Per-stream accumulation state
#[derive(Default)]
pub struct PesReassembler {
    buffer: BytesMut,
    in_progress: bool,
    pub units_completed: u64,
    pub units_discarded: u64,
}

impl PesReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one demultiplexed chunk. Returns the unit closed by this chunk, if any.
    pub fn process_payload(&mut self, chunk: &[u8]) -> Option<PesPacket> {
        if chunk.starts_with(&PES_START_CODE) {
            let completed = self.flush();
            self.buffer.extend_from_slice(chunk);
            self.in_progress = true;
            completed
        } else {
            if self.in_progress {
                self.buffer.extend_from_slice(chunk);
            } else {
                trace!(len = chunk.len(), "dropping chunk before first PES start code");
            }
            None
        }
    }

    /// Closes the unit in progress and parses it.
    pub fn flush(&mut self) -> Option<PesPacket> {
        if !self.in_progress {
            return None;
        }
        self.in_progress = false;
        if self.buffer.is_empty() {
            return None;
        }

        let unit = self.buffer.split().freeze();
        match parse_pes(unit) {
            Ok(packet) => {
                self.units_completed += 1;
                Some(packet)
            }
            Err(e) => {
                trace!(error = %e, "discarding PES unit");
                self.units_discarded += 1;
                None
            }
        }
    }

    /// Drops any partial unit.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.in_progress = false;
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

/// Parses the PES header of a complete unit and slices off its elementary stream bytes.
pub fn parse_pes(unit: Bytes) -> Result<PesPacket, MalformedStream> {
    let header = parse_pes_header(&unit)?;
    let offset = PES_FIXED_HEADER_LEN + header.header_data_length as usize;
    if unit.len() < offset {
        return Err(MalformedStream::Truncated {
            have: unit.len(),
            need: offset,
        });
    }
    Ok(PesPacket {
        header,
        payload: unit.slice(offset..),
    })
}

pub fn parse_pes_header(data: &[u8]) -> Result<PesHeader, MalformedStream> {
    if data.len() < PES_FIXED_HEADER_LEN {
        return Err(MalformedStream::Truncated {
            have: data.len(),
            need: PES_FIXED_HEADER_LEN,
        });
    }
    if !data.starts_with(&PES_START_CODE) {
        return Err(MalformedStream::BadStartCode);
    }

    let stream_id = data[3];
    let packet_length = u16::from_be_bytes([data[4], data[5]]);
    let pts_present = data[7] & 0x80 != 0;
    let dts_present = data[7] & 0x40 != 0;
    let header_data_length = data[8];

    let pts = if pts_present {
        Some(decode_timestamp(field(data, 9)?))
    } else {
        None
    };
    let dts = if dts_present {
        Some(decode_timestamp(field(data, 14)?))
    } else {
        None
    };

    Ok(PesHeader {
        stream_id,
        packet_length,
        pts,
        dts,
        header_data_length,
    })
}

fn field(data: &[u8], at: usize) -> Result<&[u8; 5], MalformedStream> {
    data.get(at..at + 5)
        .and_then(|s| s.try_into().ok())
        .ok_or(MalformedStream::Truncated {
            have: data.len(),
            need: at + 5,
        })
}

/// Decodes a 33-bit PTS/DTS from its 5-byte marker-bit layout:
/// `pppp xxx1 | xxxxxxxx | xxxxxxx1 | xxxxxxxx | xxxxxxx1`
pub fn decode_timestamp(p: &[u8; 5]) -> u64 {
    ((p[0] as u64 & 0x0E) << 29)
        | ((p[1] as u64) << 22)
        | (((p[2] as u64 & 0xFE) >> 1) << 15)
        | ((p[3] as u64) << 7)
        | ((p[4] as u64) >> 1)
}

/// Extends 33-bit timestamps into a continuous 64-bit timeline across rollover.
///
/// A step back of more than half the PTS range counts as a wrap. A step forward
/// of more than half the range is a straggler from before the last wrap.
#[derive(Debug, Default)]
pub struct PtsUnwrapper {
    last: Option<u64>,
    offset: i64,
}

impl PtsUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, pts: u64) -> i64 {
        let half = PTS_WRAP_THRESHOLD / 2;
        let Some(last) = self.last else {
            self.last = Some(pts);
            return pts as i64;
        };
        if pts < last && last - pts > half {
            self.offset += PTS_WRAP_THRESHOLD as i64;
            trace!(last, pts, offset = self.offset, "PTS rollover");
        } else if pts > last && pts - last > half {
            return pts as i64 + self.offset - PTS_WRAP_THRESHOLD as i64;
        }
        self.last = Some(pts);
        pts as i64 + self.offset
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.offset = 0;
    }
}

/// 90 kHz ticks to microseconds, integer only.
pub fn ticks_to_micros(ticks: i64) -> i64 {
    ticks * crate::constants::MICROS_PER_SECOND / crate::constants::PTS_CLOCK_HZ as i64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Inverse of [`decode_timestamp`] with the given 4-bit prefix
    pub(crate) fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
        [
            (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
            (ts >> 22) as u8,
            (((ts >> 15) as u8) << 1) | 1,
            (ts >> 7) as u8,
            ((ts as u8) << 1) | 1,
        ]
    }

    /// Builds a PES unit with optional PTS/DTS and the given ES payload
    pub(crate) fn build_pes(stream_id: u8, pts: Option<u64>, dts: Option<u64>, es: &[u8]) -> Vec<u8> {
        let mut optional = Vec::new();
        let mut flags = 0u8;
        match (pts, dts) {
            (Some(p), Some(d)) => {
                flags = 0xC0;
                optional.extend_from_slice(&encode_timestamp(0x3, p));
                optional.extend_from_slice(&encode_timestamp(0x1, d));
            }
            (Some(p), None) => {
                flags = 0x80;
                optional.extend_from_slice(&encode_timestamp(0x2, p));
            }
            _ => {}
        }
        let packet_length = (3 + optional.len() + es.len()) as u16;
        let mut out = vec![0x00, 0x00, 0x01, stream_id];
        out.extend_from_slice(&packet_length.to_be_bytes());
        out.push(0x80);
        out.push(flags);
        out.push(optional.len() as u8);
        out.extend_from_slice(&optional);
        out.extend_from_slice(es);
        out
    }

    #[test]
    fn timestamp_fixture() {
        // '0010' prefix, every data bit zero, markers set
        assert_eq!(decode_timestamp(&[0x21, 0x00, 0x01, 0x00, 0x01]), 0);
    }

    #[test]
    fn timestamp_uses_all_33_bits() {
        let max = (1u64 << 33) - 1;
        assert_eq!(decode_timestamp(&encode_timestamp(0x2, max)), max);

        let ts = 0x1_2345_6789;
        assert_eq!(decode_timestamp(&encode_timestamp(0x2, ts)), ts);
        assert_eq!(decode_timestamp(&[0x31, 0x00, 0x03, 0x5F, 0x91]), 45_000);
    }

    #[test]
    fn header_with_pts_and_dts() {
        let unit = build_pes(0xE0, Some(183_003), Some(180_000), &[0xAA, 0xBB]);
        let packet = parse_pes(Bytes::from(unit)).unwrap();
        assert_eq!(packet.header.stream_id, 0xE0);
        assert_eq!(packet.header.pts, Some(183_003));
        assert_eq!(packet.header.dts, Some(180_000));
        assert_eq!(packet.header.header_data_length, 10);
        assert_eq!(packet.header.packet_length, 15);
        assert_eq!(&packet.payload[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn split_invariance() {
        let es: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        let unit = build_pes(0xC0, Some(0x1_0000_0001), None, &es);
        let next = build_pes(0xC0, None, None, &[]);

        let mut whole = PesReassembler::new();
        assert!(whole.process_payload(&unit).is_none());
        let expected = whole.process_payload(&next).unwrap();

        for split in [3usize, 5, 9, 13, 14, 100, unit.len() - 1] {
            let mut r = PesReassembler::new();
            // continuation chunks must not look like a start code
            if unit[split..].starts_with(&PES_START_CODE) {
                continue;
            }
            assert!(r.process_payload(&unit[..split]).is_none());
            assert!(r.process_payload(&unit[split..]).is_none());
            let got = r.process_payload(&next).unwrap();
            assert_eq!(got.header, expected.header, "split at {split}");
            assert_eq!(got.payload, expected.payload);
        }
    }

    #[test]
    fn chunks_before_start_code_are_discarded() {
        let mut r = PesReassembler::new();
        assert!(r.process_payload(&[0x12, 0x34, 0x56]).is_none());
        assert!(!r.is_in_progress());
        assert!(r.flush().is_none());
    }

    #[test]
    fn truncated_unit_is_skipped() {
        let mut r = PesReassembler::new();
        // claims 10 bytes of optional header, carries 2
        r.process_payload(&[0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x0A, 0x21, 0x00]);
        assert!(r.flush().is_none());
        assert_eq!(r.units_discarded, 1);

        r.process_payload(&[0x00, 0x00, 0x01, 0xE0]);
        assert!(r.flush().is_none());
        assert_eq!(r.units_discarded, 2);
    }

    #[test]
    fn rollover_keeps_timeline_increasing() {
        let wrap = PTS_WRAP_THRESHOLD as i64;
        let mut unwrapper = PtsUnwrapper::new();
        assert_eq!(unwrapper.extend((1 << 33) - 3000), wrap - 3000);
        assert_eq!(unwrapper.extend(0), wrap);
        // reordered unit from before the wrap
        assert_eq!(unwrapper.extend((1 << 33) - 1500), wrap - 1500);
        assert_eq!(unwrapper.extend(3000), wrap + 3000);
        assert_eq!(unwrapper.extend(2_000_000_000), wrap + 2_000_000_000);

        unwrapper.reset();
        assert_eq!(unwrapper.extend(3000), 3000);
    }

    #[test]
    fn ticks_convert_to_micros() {
        assert_eq!(ticks_to_micros(90_000), 1_000_000);
        assert_eq!(ticks_to_micros(3_003), 33_366);
        assert_eq!(ticks_to_micros((1 << 33) - 1), 95_443_717_677);
    }
}
