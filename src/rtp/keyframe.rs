use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};

/// Returns true when an RTP payload starts a frame a decoder can begin from.
pub type KeyframeFn = fn(&[u8]) -> bool;

const NALU_TYPE_MASK: u8 = 0x1f;
const NALU_IDR: u8 = 5;
const NALU_SPS: u8 = 7;
const NALU_PPS: u8 = 8;
const NALU_STAP_A: u8 = 24;
const NALU_FU_A: u8 = 28;

static KEYFRAME_DETECTORS: &[(&str, KeyframeFn)] = &[
    (MIME_TYPE_VP8, is_vp8_keyframe),
    (MIME_TYPE_VP9, is_vp9_keyframe),
    (MIME_TYPE_H264, is_h264_keyframe),
];

/// Looks up the detector registered for a MIME type. Codecs without one are never gated.
pub fn keyframe_detector(mime_type: &str) -> Option<KeyframeFn> {
    KEYFRAME_DETECTORS
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(mime_type))
        .map(|(_, detector)| *detector)
}

/// VP8 payload descriptor (RFC 7741 section 4.2) followed by the P bit of the payload header.
pub fn is_vp8_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let start_of_partition = payload[0] & 0x10 != 0;
    let partition_id = payload[0] & 0x07;
    if !start_of_partition || partition_id != 0 {
        return false;
    }

    let mut offset = 1;
    if payload[0] & 0x80 != 0 {
        let Some(&ext) = payload.get(offset) else {
            return false;
        };
        offset += 1;
        if ext & 0x80 != 0 {
            // PictureID, 15 bits when M is set.
            let Some(&pid) = payload.get(offset) else {
                return false;
            };
            offset += if pid & 0x80 != 0 { 2 } else { 1 };
        }
        if ext & 0x40 != 0 {
            offset += 1;
        }
        if ext & 0x30 != 0 {
            offset += 1;
        }
    }

    match payload.get(offset) {
        Some(header) => header & 0x01 == 0,
        None => false,
    }
}

/// VP9 payload descriptor: not inter-picture predicted and beginning of a frame.
pub fn is_vp9_keyframe(payload: &[u8]) -> bool {
    match payload.first() {
        Some(descriptor) => descriptor & 0x40 == 0 && descriptor & 0x08 != 0,
        None => false,
    }
}

/// H.264 (RFC 6184): IDR, SPS or PPS in a single NAL, inside a STAP-A, or at the start of a FU-A.
pub fn is_h264_keyframe(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };
    match first & NALU_TYPE_MASK {
        NALU_STAP_A => {
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                if is_key_nalu(payload[offset + 2] & NALU_TYPE_MASK) {
                    return true;
                }
                offset += 2 + size;
            }
            false
        }
        NALU_FU_A => match payload.get(1) {
            Some(fu_header) => fu_header & 0x80 != 0 && is_key_nalu(fu_header & NALU_TYPE_MASK),
            None => false,
        },
        nalu => is_key_nalu(nalu),
    }
}

fn is_key_nalu(nalu: u8) -> bool {
    matches!(nalu, NALU_IDR | NALU_SPS | NALU_PPS)
}
