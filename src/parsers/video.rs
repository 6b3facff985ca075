//! Video configuration extraction and access-unit classification

use bitstream_io::{BigEndian, BitRead, BitReader};
use bytes::{BufMut, Bytes, BytesMut};

use super::utils::{nal_units, remove_emulation_prevention, se, start_code_offsets, ue};
use crate::constants::*;
use crate::types::VideoCodec;

/// Fields of a sequence parameter set the orchestrator cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

/// In-band configuration found in an access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedConfig {
    pub codec_string: String,
    pub width: u32,
    pub height: u32,
    pub record: Bytes,
}

fn h264_nal_type(nal: &[u8]) -> u8 {
    nal[0] & 0x1F
}

fn hevc_nal_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3F
}

/// Looks for a complete configuration set (SPS+PPS, VPS+SPS+PPS or a sequence header)
pub fn extract_config(codec: VideoCodec, data: &[u8]) -> Option<ExtractedConfig> {
    match codec {
        VideoCodec::H264 => extract_h264(data),
        VideoCodec::Hevc => extract_hevc(data),
        VideoCodec::Mpeg2 => parse_mpeg2_seq_hdr(data),
    }
}

/// True when the access unit is independently decodable
pub fn is_keyframe(codec: VideoCodec, data: &[u8]) -> bool {
    match codec {
        VideoCodec::H264 => nal_units(data)
            .iter()
            .any(|nal| h264_nal_type(nal) == H264_NAL_IDR),
        VideoCodec::Hevc => nal_units(data).iter().any(|nal| {
            nal.len() >= 2
                && matches!(hevc_nal_type(nal), HEVC_NAL_IDR_W_RADL | HEVC_NAL_IDR_N_LP)
        }),
        VideoCodec::Mpeg2 => start_code_offsets(data).into_iter().any(|at| {
            // picture_start_code, temporal_reference(10), picture_coding_type(3)
            data.get(at) == Some(&MPEG2_PICTURE_START)
                && data
                    .get(at + 2)
                    .is_some_and(|b| (b >> 3) & 0x07 == MPEG2_PICTURE_TYPE_I)
        }),
    }
}

fn extract_h264(data: &[u8]) -> Option<ExtractedConfig> {
    let units = nal_units(data);
    let sps = units.iter().find(|n| h264_nal_type(n) == H264_NAL_SPS && n.len() > 4)?;
    let pps = units.iter().find(|n| h264_nal_type(n) == H264_NAL_PPS)?;
    let info = parse_avc_sps(&sps[1..])?;

    // AVCDecoderConfigurationRecord with one SPS and one PPS
    let mut record = BytesMut::with_capacity(11 + sps.len() + pps.len());
    record.put_u8(1);
    record.put_u8(info.profile_idc);
    record.put_u8(info.constraint_flags);
    record.put_u8(info.level_idc);
    record.put_u8(0xFF); // 4-byte NAL lengths
    record.put_u8(0xE1); // one SPS
    record.put_u16(sps.len() as u16);
    record.put_slice(sps);
    record.put_u8(1);
    record.put_u16(pps.len() as u16);
    record.put_slice(pps);

    Some(ExtractedConfig {
        codec_string: format!(
            "avc1.{:02x}{:02x}{:02x}",
            info.profile_idc, info.constraint_flags, info.level_idc
        ),
        width: info.width,
        height: info.height,
        record: record.freeze(),
    })
}

fn extract_hevc(data: &[u8]) -> Option<ExtractedConfig> {
    let units: Vec<&[u8]> = nal_units(data).into_iter().filter(|n| n.len() >= 2).collect();
    let vps = units.iter().find(|n| hevc_nal_type(n) == HEVC_NAL_VPS)?;
    let sps = units.iter().find(|n| hevc_nal_type(n) == HEVC_NAL_SPS)?;
    let pps = units.iter().find(|n| hevc_nal_type(n) == HEVC_NAL_PPS)?;
    let info = parse_hevc_sps(&sps[2..])?;

    let mut record = BytesMut::with_capacity(12 + vps.len() + sps.len() + pps.len());
    for nal in [vps, sps, pps] {
        record.put_slice(&ANNEXB_START_CODE);
        record.put_slice(nal);
    }

    Some(ExtractedConfig {
        codec_string: format!(
            "hvc1.{}.{:X}.{}{}",
            info.profile_idc,
            info.compatibility_flags.reverse_bits(),
            if info.high_tier { 'H' } else { 'L' },
            info.level_idc
        ),
        width: info.width,
        height: info.height,
        record: record.freeze(),
    })
}

const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Parse MPEG-2 sequence header; the record spans the header, its quantiser
/// matrices and any extensions up to the next non-extension start code
pub fn parse_mpeg2_seq_hdr(data: &[u8]) -> Option<ExtractedConfig> {
    let offsets = start_code_offsets(data);
    let pos = offsets
        .iter()
        .position(|&at| data.get(at) == Some(&MPEG2_SEQUENCE_HEADER))?;
    let at = offsets[pos];
    let seq_hdr = data.get(at + 1..at + 9)?;

    let horizontal_size = ((seq_hdr[0] as u32) << 4) | ((seq_hdr[1] as u32) >> 4);
    let vertical_size = ((seq_hdr[1] as u32 & 0x0F) << 8) | (seq_hdr[2] as u32);
    if horizontal_size == 0 || vertical_size == 0 {
        return None;
    }

    let end = offsets[pos + 1..]
        .iter()
        .find(|&&next| data.get(next) != Some(&MPEG2_EXTENSION_START))
        .map(|&next| next - 3)
        .unwrap_or(data.len());

    Some(ExtractedConfig {
        codec_string: VideoCodec::Mpeg2.default_codec_string().to_string(),
        width: horizontal_size,
        height: vertical_size,
        record: Bytes::copy_from_slice(&data[at - 3..end]),
    })
}

/// Parses an H.264 SPS body (NAL header byte excluded)
pub fn parse_avc_sps(raw: &[u8]) -> Option<SpsInfo> {
    let rbsp = remove_emulation_prevention(raw);
    let mut br = BitReader::endian(&rbsp[..], BigEndian);

    // Header
    let profile_idc = br.read::<8, u8>().ok()?;
    let constraint_flags = br.read::<8, u8>().ok()?;
    let level_idc = br.read::<8, u8>().ok()?;
    ue(&mut br)?; // seq_parameter_set_id

    // High profiles
    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = ue(&mut br)?;
        if chroma_format_idc == 3 {
            br.skip(1).ok()?; // separate_colour_plane_flag
        }
        ue(&mut br)?; // bit_depth_luma_minus8
        ue(&mut br)?; // bit_depth_chroma_minus8
        br.skip(1).ok()?; // qpprime_y_zero_transform_bypass_flag

        if br.read_bit().ok()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for idx in 0..lists {
                if br.read_bit().ok()? {
                    skip_scaling_list(&mut br, if idx < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    ue(&mut br)?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = ue(&mut br)?;
    if pic_order_cnt_type == 0 {
        ue(&mut br)?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        br.skip(1).ok()?; // delta_pic_order_always_zero_flag
        se(&mut br)?; // offset_for_non_ref_pic
        se(&mut br)?; // offset_for_top_to_bottom_field
        let n = ue(&mut br)?;
        for _ in 0..n {
            se(&mut br)?;
        }
    }
    ue(&mut br)?; // max_num_ref_frames
    br.skip(1).ok()?; // gaps_in_frame_num_value_allowed_flag

    // Size
    let pic_width_in_mbs_minus1 = ue(&mut br)?;
    let pic_height_in_map_units_minus1 = ue(&mut br)?;
    let frame_mbs_only_flag = br.read_bit().ok()?;
    if !frame_mbs_only_flag {
        br.skip(1).ok()?; // mb_adaptive_frame_field_flag
    }
    br.skip(1).ok()?; // direct_8x8_inference_flag

    // Cropping
    let (crop_l, crop_r, crop_t, crop_b) = if br.read_bit().ok()? {
        (ue(&mut br)?, ue(&mut br)?, ue(&mut br)?, ue(&mut br)?)
    } else {
        (0, 0, 0, 0)
    };

    let crop_unit_x = match chroma_format_idc {
        0 | 3 => 1,
        _ => 2,
    };
    let field_factor = 2 - frame_mbs_only_flag as u32;
    let crop_unit_y = match chroma_format_idc {
        0 | 3 => field_factor,
        _ => 2 * field_factor,
    };

    let width = (pic_width_in_mbs_minus1 + 1)
        .checked_mul(16)?
        .checked_sub(crop_l.checked_add(crop_r)?.checked_mul(crop_unit_x)?)?;
    let height = (pic_height_in_map_units_minus1 + 1)
        .checked_mul(16 * field_factor)?
        .checked_sub(crop_t.checked_add(crop_b)?.checked_mul(crop_unit_y)?)?;

    Some(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        width,
        height,
    })
}

fn skip_scaling_list<R: std::io::Read>(br: &mut BitReader<R, BigEndian>, size: usize) -> Option<()> {
    let mut last = 8i64;
    let mut next = 8i64;
    for _ in 0..size {
        if next != 0 {
            let delta = se(br)? as i64;
            next = (last + delta).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HevcSpsInfo {
    pub profile_idc: u8,
    pub high_tier: bool,
    pub compatibility_flags: u32,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

/// Parses an HEVC SPS body (2-byte NAL header excluded) up to the conformance window
pub fn parse_hevc_sps(raw: &[u8]) -> Option<HevcSpsInfo> {
    let rbsp = remove_emulation_prevention(raw);
    let mut br = BitReader::endian(&rbsp[..], BigEndian);

    br.skip(4).ok()?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = br.read::<3, u8>().ok()?;
    br.skip(1).ok()?; // sps_temporal_id_nesting_flag

    // profile_tier_level(1, max_sub_layers_minus1)
    br.skip(2).ok()?; // general_profile_space
    let high_tier = br.read_bit().ok()?;
    let profile_idc = br.read::<5, u8>().ok()?;
    let compatibility_flags = br.read::<32, u32>().ok()?;
    br.skip(48).ok()?; // source flags + constraint flags
    let level_idc = br.read::<8, u8>().ok()?;

    let mut sub_layers = Vec::with_capacity(max_sub_layers_minus1 as usize);
    for _ in 0..max_sub_layers_minus1 {
        let profile_present = br.read_bit().ok()?;
        let level_present = br.read_bit().ok()?;
        sub_layers.push((profile_present, level_present));
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            br.skip(2).ok()?; // reserved_zero_2bits
        }
    }
    for (profile_present, level_present) in sub_layers {
        if profile_present {
            br.skip(88).ok()?;
        }
        if level_present {
            br.skip(8).ok()?;
        }
    }

    ue(&mut br)?; // sps_seq_parameter_set_id
    let chroma_format_idc = ue(&mut br)?;
    if chroma_format_idc == 3 {
        br.skip(1).ok()?; // separate_colour_plane_flag
    }
    let mut width = ue(&mut br)?;
    let mut height = ue(&mut br)?;

    if br.read_bit().ok()? {
        // conformance_window_flag
        let (sub_w, sub_h) = match chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        let left = ue(&mut br)?;
        let right = ue(&mut br)?;
        let top = ue(&mut br)?;
        let bottom = ue(&mut br)?;
        width = width.checked_sub(left.checked_add(right)?.checked_mul(sub_w)?)?;
        height = height.checked_sub(top.checked_add(bottom)?.checked_mul(sub_h)?)?;
    }

    Some(HevcSpsInfo {
        profile_idc,
        high_tier,
        compatibility_flags,
        level_idc,
        width,
        height,
    })
}
