//! RTP packet helpers shared by the reader and the forwarders.

pub mod audio_level;
pub mod bitrate;
pub mod jitter;
pub mod keyframe;
pub mod pool;

use crate::error::{Error, PacketErrorKind};

const FIXED_HEADER_LEN: usize = 12;
const VERSION: u8 = 2;

/// Computes the length of the RTP header at the start of `raw`, including CSRCs and the extension block.
pub fn header_len(raw: &[u8]) -> Result<usize, Error> {
    if raw.len() < FIXED_HEADER_LEN {
        return Err(Error::new_packet(
            format!("packet of {} bytes is shorter than an RTP header", raw.len()),
            PacketErrorKind::ShortBuffer,
        ));
    }
    if raw[0] >> 6 != VERSION {
        return Err(Error::new_packet(
            format!("unsupported RTP version {}", raw[0] >> 6),
            PacketErrorKind::MalformedPacket,
        ));
    }

    let csrc_count = (raw[0] & 0x0f) as usize;
    let mut len = FIXED_HEADER_LEN + csrc_count * 4;
    if raw[0] & 0x10 != 0 {
        if raw.len() < len + 4 {
            return Err(Error::new_packet(
                "extension header is truncated".to_string(),
                PacketErrorKind::ShortBuffer,
            ));
        }
        let words = u16::from_be_bytes([raw[len + 2], raw[len + 3]]) as usize;
        len += 4 + words * 4;
    }
    if raw.len() < len {
        return Err(Error::new_packet(
            format!("header needs {} bytes but packet has {}", len, raw.len()),
            PacketErrorKind::ShortBuffer,
        ));
    }
    Ok(len)
}

/// Returns the end offset of the payload once trailing padding is removed.
pub fn payload_end(raw: &[u8], header_len: usize) -> Result<usize, Error> {
    if raw[0] & 0x20 == 0 {
        return Ok(raw.len());
    }
    // A count of zero strips nothing.
    let padding = raw.last().copied().unwrap_or(0) as usize;
    if raw.len() < header_len + padding {
        return Err(Error::new_packet(
            format!(
                "padding of {} bytes underflows payload of {} bytes",
                padding,
                raw.len().saturating_sub(header_len)
            ),
            PacketErrorKind::MalformedPacket,
        ));
    }
    Ok(raw.len() - padding)
}

/// True when `a` comes after `b` in RTP sequence space (reorder window of 2^15).
pub fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}
