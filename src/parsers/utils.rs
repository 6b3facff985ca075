//! Common parsing utilities

use bitstream_io::{BigEndian, BitRead, BitReader};

/// Unsigned Exp-Golomb decoder
pub fn ue<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> Option<u32> {
    let mut zeros = 0;
    while br.read::<1, u8>().ok()? == 0 {
        zeros += 1;
        if zeros > 31 {
            return None;
        }
    }
    let mut val = 1u64;
    for _ in 0..zeros {
        val = (val << 1) | br.read::<1, u8>().ok()? as u64;
    }
    u32::try_from(val - 1).ok()
}

/// Signed Exp-Golomb decoder
pub fn se<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> Option<i32> {
    let k = ue(br)? as i64;
    let v = if k & 1 == 0 { -(k / 2) } else { (k + 1) / 2 };
    i32::try_from(v).ok()
}

/// Remove emulation prevention bytes (0x000003)
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 3 {
            v.extend_from_slice(&data[i..i + 2]);
            i += 3;
        } else {
            v.push(data[i]);
            i += 1;
        }
    }
    v
}

/// Offsets of every byte that follows a `00 00 01` prefix
pub fn start_code_offsets(data: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
            offsets.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    offsets
}

/// Splits an Annex-B byte stream into NAL units (header byte included,
/// start codes and trailing zero bytes removed)
pub fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let offsets = start_code_offsets(data);
    let mut units = Vec::with_capacity(offsets.len());
    for (n, &start) in offsets.iter().enumerate() {
        let end = offsets.get(n + 1).map(|next| next - 3).unwrap_or(data.len());
        let mut unit = &data[start..end.max(start)];
        while let [rest @ .., 0x00] = unit {
            unit = rest;
        }
        if !unit.is_empty() {
            units.push(unit);
        }
    }
    units
}
