//! AC-3 sync frame header parser

use bitstream_io::{BigEndian, BitRead, BitReader};
use crc::{CRC_16_UMTS, Crc};

use crate::constants::{AC3_FRAME_SIZE_CODES, AC3_HEADER_LEN, AC3_SAMPLES_PER_FRAME, AC3_SYNC_WORD, PTS_CLOCK_HZ};
use crate::error::MalformedStream;
use crate::types::AudioFrameHeader;

/// Poly 0x8005, no reflection, zero init: the AC-3 frame check
const CRC_AC3: Crc<u16> = Crc::<u16>::new(&CRC_16_UMTS);

/// Nominal bitrate per frmsizecod pair
const BITRATES_KBPS: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

/// 16-bit words per frame at 44.1 kHz (the only rate that needs padding words)
const WORDS_44K: [u16; AC3_FRAME_SIZE_CODES] = [
    69, 70, 87, 88, 104, 105, 121, 122, 139, 140, 174, 175, 208, 209, 243, 244, 278, 279, 348, 349,
    417, 418, 487, 488, 557, 558, 696, 697, 835, 836, 975, 976, 1114, 1115, 1253, 1254, 1393, 1394,
];

pub fn sample_rate(fscod: u8) -> Option<u32> {
    match fscod {
        0 => Some(48_000),
        1 => Some(44_100),
        2 => Some(32_000),
        _ => None,
    }
}

/// Frame size in bytes, `None` outside the table
pub fn frame_size_bytes(fscod: u8, frmsizecod: u8) -> Option<usize> {
    let code = frmsizecod as usize;
    if code >= AC3_FRAME_SIZE_CODES {
        return None;
    }
    let kbps = BITRATES_KBPS[code / 2] as usize;
    let words = match fscod {
        0 => kbps * 2,
        1 => WORDS_44K[code] as usize,
        2 => kbps * 3,
        _ => return None,
    };
    Some(words * 2)
}

/// Full-bandwidth channels for each acmod, LFE excluded
pub fn channels_for_mode(acmod: u8) -> u8 {
    match acmod & 0x07 {
        0 => 2, // 1+1 dual mono
        1 => 1, // 1/0
        2 => 2, // 2/0
        3 => 3, // 3/0
        4 => 3, // 2/1
        5 => 4, // 3/1
        6 => 4, // 2/2
        _ => 5, // 3/2
    }
}

/// 90 kHz ticks covered by one sync frame
pub fn frame_duration_ticks(sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    AC3_SAMPLES_PER_FRAME * PTS_CLOCK_HZ / sample_rate as u64
}

/// Parses the 7-byte header at the start of `data` (sync word included).
pub fn parse_ac3_header(data: &[u8]) -> Result<AudioFrameHeader, MalformedStream> {
    if data.len() < AC3_HEADER_LEN {
        return Err(MalformedStream::Truncated {
            have: data.len(),
            need: AC3_HEADER_LEN,
        });
    }
    if !data.starts_with(&AC3_SYNC_WORD) {
        return Err(MalformedStream::BadSync);
    }

    let mut br = BitReader::endian(&data[..AC3_HEADER_LEN], BigEndian);
    let truncated = |_| MalformedStream::Truncated {
        have: data.len(),
        need: AC3_HEADER_LEN,
    };

    let sync_word = br.read::<16, u16>().map_err(truncated)?;
    let crc1 = br.read::<16, u16>().map_err(truncated)?;
    let fscod = br.read::<2, u8>().map_err(truncated)?;
    let frmsizecod = br.read::<6, u8>().map_err(truncated)?;
    let bsid = br.read::<5, u8>().map_err(truncated)?;
    let bsmod = br.read::<3, u8>().map_err(truncated)?;
    let acmod = br.read::<3, u8>().map_err(truncated)?;

    let sample_rate = sample_rate(fscod).ok_or(MalformedStream::OutOfRange {
        field: "fscod",
        value: fscod as u32,
    })?;
    let frame_size = frame_size_bytes(fscod, frmsizecod).ok_or(MalformedStream::OutOfRange {
        field: "frmsizecod",
        value: frmsizecod as u32,
    })?;
    // bsid above 10 is E-AC-3 or reserved, with a different header layout
    if bsid > 10 {
        return Err(MalformedStream::OutOfRange {
            field: "bsid",
            value: bsid as u32,
        });
    }

    // cmixlev, surmixlev, dsurmod precede lfeon depending on acmod
    let mut skip = 0;
    if acmod & 0x01 != 0 && acmod != 0x01 {
        skip += 2;
    }
    if acmod & 0x04 != 0 {
        skip += 2;
    }
    if acmod == 0x02 {
        skip += 2;
    }
    if skip > 0 {
        br.skip(skip).map_err(truncated)?;
    }
    let lfe = br.read_bit().map_err(truncated)?;

    Ok(AudioFrameHeader {
        sync_word,
        crc1,
        sample_rate_code: fscod,
        frame_size_code: frmsizecod,
        bitstream_id: bsid,
        bitstream_mode: bsmod,
        channel_mode: acmod,
        lfe,
        sample_rate,
        frame_size,
        num_channels: channels_for_mode(acmod) + lfe as u8,
        bitrate_kbps: BITRATES_KBPS[frmsizecod as usize / 2],
    })
}

/// The CRC over everything after the sync word is zero for an intact frame.
pub fn verify_frame_crc(frame: &[u8]) -> Result<(), MalformedStream> {
    if frame.len() < AC3_HEADER_LEN {
        return Err(MalformedStream::Truncated {
            have: frame.len(),
            need: AC3_HEADER_LEN,
        });
    }
    if CRC_AC3.checksum(&frame[2..]) == 0 {
        Ok(())
    } else {
        Err(MalformedStream::Crc)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A syntactically valid frame: 48 kHz, given frmsizecod and acmod, LFE on/off, zero body
    pub(crate) fn build_frame(frmsizecod: u8, acmod: u8, lfe: bool) -> Vec<u8> {
        let size = frame_size_bytes(0, frmsizecod).unwrap();
        let mut frame = vec![0u8; size];
        frame[0] = 0x0B;
        frame[1] = 0x77;
        frame[4] = frmsizecod & 0x3F; // fscod 0
        frame[5] = 8 << 3; // bsid 8, bsmod 0
        let mut bits: u8 = acmod << 5;
        let mut pos = 3;
        if acmod & 0x01 != 0 && acmod != 0x01 {
            pos += 2;
        }
        if acmod & 0x04 != 0 {
            pos += 2;
        }
        if acmod == 0x02 {
            pos += 2;
        }
        if lfe {
            bits |= 0x80 >> pos;
        }
        frame[6] = bits;
        let crc = CRC_AC3.checksum(&frame[2..size - 2]);
        frame[size - 2..].copy_from_slice(&crc.to_be_bytes());
        frame
    }

    #[test]
    fn smallest_frame_is_128_bytes() {
        assert_eq!(frame_size_bytes(0, 0), Some(128));
        let header = parse_ac3_header(&build_frame(0, 2, false)).unwrap();
        assert_eq!(header.frame_size, 128);
        assert_eq!(header.sample_rate, 48_000);
        assert_eq!(header.bitrate_kbps, 32);
    }

    #[test]
    fn frame_size_table_edges() {
        assert_eq!(frame_size_bytes(0, 37), Some(2560));
        assert_eq!(frame_size_bytes(1, 0), Some(138));
        assert_eq!(frame_size_bytes(1, 37), Some(2788));
        assert_eq!(frame_size_bytes(2, 0), Some(192));
        assert_eq!(frame_size_bytes(2, 37), Some(3840));
    }

    #[test]
    fn out_of_range_frame_size_code_rejected() {
        for fscod in 0..3u8 {
            for code in 38..64u8 {
                assert_eq!(frame_size_bytes(fscod, code), None);
                let mut header = build_frame(0, 2, false);
                header[4] = (fscod << 6) | code;
                assert!(matches!(
                    parse_ac3_header(&header),
                    Err(MalformedStream::OutOfRange { field: "frmsizecod", .. })
                ));
            }
        }
    }

    #[test]
    fn reserved_sample_rate_rejected() {
        let mut frame = build_frame(4, 2, false);
        frame[4] |= 0xC0;
        assert!(matches!(
            parse_ac3_header(&frame),
            Err(MalformedStream::OutOfRange { field: "fscod", .. })
        ));
    }

    #[test]
    fn channel_counts_with_lfe() {
        let expected = [2u8, 1, 2, 3, 3, 4, 4, 5];
        for acmod in 0..8u8 {
            let plain = parse_ac3_header(&build_frame(8, acmod, false)).unwrap();
            assert_eq!(plain.num_channels, expected[acmod as usize], "acmod {acmod}");
            assert!(!plain.lfe);
            let with_lfe = parse_ac3_header(&build_frame(8, acmod, true)).unwrap();
            assert!(with_lfe.lfe, "acmod {acmod}");
            assert_eq!(with_lfe.num_channels, expected[acmod as usize] + 1);
        }
    }

    #[test]
    fn short_header_is_truncated() {
        assert!(matches!(
            parse_ac3_header(&[0x0B, 0x77, 0x00]),
            Err(MalformedStream::Truncated { .. })
        ));
    }

    #[test]
    fn crc_detects_corruption() {
        let mut frame = build_frame(2, 7, true);
        assert!(verify_frame_crc(&frame).is_ok());
        frame[40] ^= 0x10;
        assert_eq!(verify_frame_crc(&frame), Err(MalformedStream::Crc));
    }

    #[test]
    fn frame_duration() {
        assert_eq!(frame_duration_ticks(48_000), 2880);
        assert_eq!(frame_duration_ticks(32_000), 4320);
    }
}
