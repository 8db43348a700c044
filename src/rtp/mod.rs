//! RTP packet parsing (RFC 3550)

use crate::wire::{read_u16_be, read_u32_be};
use thiserror::Error;

pub const RTP_HEADER_MIN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet too short: {0} bytes")]
    Truncated(usize),
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("padding length {padding} exceeds payload {payload}")]
    BadPadding { padding: usize, payload: usize },
    #[error("header extension overruns packet")]
    BadExtension,
}

/// Parsed view of an RTP packet. Offsets index the original datagram so the
/// payload can be forwarded without copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_type: u8,
    pub marker: bool,
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// Parse an RTP header, handling CSRC lists, header extensions and padding.
pub fn parse(buf: &[u8]) -> Result<RtpPacket, RtpError> {
    if buf.len() < RTP_HEADER_MIN {
        return Err(RtpError::Truncated(buf.len()));
    }
    let b0 = buf[0];
    let version = b0 >> 6;
    if version != 2 {
        return Err(RtpError::BadVersion(version));
    }
    let has_padding = b0 & 0x20 != 0;
    let has_extension = b0 & 0x10 != 0;
    let csrc_count = (b0 & 0x0f) as usize;
    let b1 = buf[1];
    let marker = b1 & 0x80 != 0;
    let payload_type = b1 & 0x7f;

    let sequence = read_u16_be(buf, 2).ok_or(RtpError::Truncated(buf.len()))?;
    let timestamp = read_u32_be(buf, 4).ok_or(RtpError::Truncated(buf.len()))?;
    let ssrc = read_u32_be(buf, 8).ok_or(RtpError::Truncated(buf.len()))?;

    let mut offset = RTP_HEADER_MIN + csrc_count * 4;
    if buf.len() < offset {
        return Err(RtpError::Truncated(buf.len()));
    }
    if has_extension {
        // Extension header: 16-bit profile id, 16-bit length in 32-bit words.
        let words = read_u16_be(buf, offset + 2).ok_or(RtpError::BadExtension)? as usize;
        offset += 4 + words * 4;
        if buf.len() < offset {
            return Err(RtpError::BadExtension);
        }
    }

    let mut end = buf.len();
    if has_padding {
        let padding = buf[end - 1] as usize;
        if padding == 0 || padding > end - offset {
            return Err(RtpError::BadPadding { padding, payload: end - offset });
        }
        end -= padding;
    }

    Ok(RtpPacket {
        sequence,
        timestamp,
        ssrc,
        payload_type,
        marker,
        payload_offset: offset,
        payload_len: end - offset,
    })
}

/// Signed distance `a - b` on the 16-bit sequence circle.
#[inline]
pub fn seq_delta(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}
