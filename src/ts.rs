//! Minimal MPEG-TS packet splitting for the command-line harness.
//!
//! Only what routing PES payloads by PID needs: sync, PID, payload unit start
//! and the payload after any adaptation field. PSI is not interpreted.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsPacket<'a> {
    pub pid: u16,
    pub payload_unit_start: bool,
    pub continuity_counter: u8,
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// `None` for bad sync, short packets and packets carrying no payload.
    pub fn parse(chunk: &'a [u8]) -> Option<Self> {
        if chunk.len() < TS_PACKET_SIZE || chunk[0] != TS_SYNC_BYTE {
            return None;
        }
        let pid = (((chunk[1] & 0x1F) as u16) << 8) | chunk[2] as u16;
        let payload_unit_start = chunk[1] & 0x40 != 0;
        let adaptation_field_ctrl = (chunk[3] & 0x30) >> 4;
        let continuity_counter = chunk[3] & 0x0F;

        if adaptation_field_ctrl & 0x01 == 0 {
            return None;
        }
        let mut payload_offset = 4usize;
        if adaptation_field_ctrl == 3 {
            payload_offset += 1 + chunk[4] as usize;
            if payload_offset >= TS_PACKET_SIZE {
                return None;
            }
        }

        Some(Self {
            pid,
            payload_unit_start,
            continuity_counter,
            payload: &chunk[payload_offset..TS_PACKET_SIZE],
        })
    }
}

/// Cuts a byte stream into 188-byte packets, realigning on the sync byte.
#[derive(Default)]
pub struct TsSplitter {
    buf: BytesMut,
    pub resyncs: u64,
}

impl TsSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next whole packet, if one is buffered
    pub fn next_packet(&mut self) -> Option<BytesMut> {
        loop {
            let sync = self.buf.iter().position(|&b| b == TS_SYNC_BYTE);
            match sync {
                None => {
                    self.buf.clear();
                    return None;
                }
                Some(0) => {}
                Some(skip) => {
                    trace!(skip, "realigning on TS sync byte");
                    self.resyncs += 1;
                    self.buf.advance(skip);
                }
            }
            if self.buf.len() < TS_PACKET_SIZE {
                return None;
            }
            // a lone 0x47 inside payload; confirm with the following packet when we can
            if self.buf.len() > TS_PACKET_SIZE && self.buf[TS_PACKET_SIZE] != TS_SYNC_BYTE {
                self.resyncs += 1;
                self.buf.advance(1);
                continue;
            }
            return Some(self.buf.split_to(TS_PACKET_SIZE));
        }
    }
}
