//! Sequence parameter set parsing, limited to picture geometry: coded
//! size, crop rectangle and sample aspect ratio. Everything else in the
//! SPS is skipped field-accurate so the geometry fields land in the right
//! place.

use rp_common::{H264Error, VideoDimensions};

use crate::bits::{strip_emulation_prevention, BitReader};
use crate::nal::NalUnitType;

/// Profiles whose SPS carries chroma format, bit depth and scaling lists
/// ahead of the frame geometry (ISO 14496-10, 7.3.2.1.1).
const EXTENDED_PROFILE_IDCS: [u32; 13] =
    [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Sample aspect ratios by `aspect_ratio_idc` (Table E-1).
const SAR_TABLE: [(u32, u32); 17] = [
    (1, 1), // 0 = unspecified, treated as square
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

const EXTENDED_SAR: u32 = 255;

/// Parse an SPS NAL unit (header byte included) into video dimensions.
pub fn parse_sps(nal: &[u8]) -> Result<VideoDimensions, H264Error> {
    if nal.is_empty() {
        return Err(H264Error::InvalidSps("empty NAL unit".to_string()));
    }
    if NalUnitType::from(nal[0]) != NalUnitType::Sps {
        return Err(H264Error::InvalidSps(format!(
            "not an SPS NAL unit (header 0x{:02x})",
            nal[0]
        )));
    }

    let rbsp = strip_emulation_prevention(&nal[1..]);
    let r = &mut BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(8)?; // constraint_set flags + reserved_zero bits
    r.read_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1; // 4:2:0 unless stated otherwise
    let mut separate_colour_plane = false;
    if EXTENDED_PROFILE_IDCS.contains(&profile_idc) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()? == 1;
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present_flag
            let list_count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..list_count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    match r.read_ue()? {
        0 => {
            r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.read_bit()?; // delta_pic_order_always_zero_flag
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let cycle_len = r.read_ue()?;
            for _ in 0..cycle_len {
                r.read_se()?; // offset_for_ref_frame[i]
            }
        }
        _ => {}
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    let width = pic_width_in_mbs * 16;
    let height = pic_height_in_map_units * 16 * (2 - frame_mbs_only);

    // Crop offsets are in chroma sample units; scale to pixels.
    let (crop_unit_x, crop_unit_y) = if chroma_format_idc == 0 || separate_colour_plane {
        (1, 2 - frame_mbs_only)
    } else {
        let (sub_w, sub_h) = match chroma_format_idc {
            1 => (2, 2), // 4:2:0
            2 => (2, 1), // 4:2:2
            _ => (1, 1), // 4:4:4
        };
        (sub_w, sub_h * (2 - frame_mbs_only))
    };

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bit()? == 1 {
        crop_left = r.read_ue()? * crop_unit_x;
        crop_right = r.read_ue()? * crop_unit_x;
        crop_top = r.read_ue()? * crop_unit_y;
        crop_bottom = r.read_ue()? * crop_unit_y;
    }

    let (mut sar_width, mut sar_height) = (1, 1);
    if r.read_bit()? == 1 {
        // vui_parameters_present_flag; only the aspect ratio matters here
        if r.read_bit()? == 1 {
            let idc = r.read_bits(8)?;
            if idc == EXTENDED_SAR {
                sar_width = r.read_bits(16)?;
                sar_height = r.read_bits(16)?;
            } else if let Some(&(w, h)) = SAR_TABLE.get(idc as usize) {
                sar_width = w;
                sar_height = h;
            }
        }
    }
    if sar_width == 0 || sar_height == 0 {
        sar_width = 1;
        sar_height = 1;
    }

    if crop_left + crop_right >= width || crop_top + crop_bottom >= height {
        return Err(H264Error::InvalidSps(format!(
            "crop rectangle ({crop_left},{crop_right},{crop_top},{crop_bottom}) \
             exceeds coded size {width}x{height}"
        )));
    }

    Ok(VideoDimensions {
        width,
        height,
        crop_left,
        crop_right,
        crop_top,
        crop_bottom,
        sar_width,
        sar_height,
    })
}

/// Skip one scaling list (7.3.2.1.1.1); only the bit positions matter.
fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), H264Error> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}
