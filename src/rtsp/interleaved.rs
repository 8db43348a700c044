//! Interleaved RTSP stream de-framing
//!
//! On a TCP transport the server multiplexes binary media frames with RTSP
//! text messages on one connection. Binary frames are prefixed
//! `$ <channel:u8> <length:u16 be>` (RFC 2326 §10.12); anything else at a
//! frame boundary must parse as an RTSP message or the stream is corrupt.

use bytes::{Buf, BytesMut};
use rtsp_types::Message;
use thiserror::Error;

/// Accumulation buffer bound; single frames above this are rejected.
pub const INTERLEAVED_BUF_MAX: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DeframeError {
    #[error("interleaved frame of {0} bytes exceeds buffer")]
    FrameTooLarge(usize),
    #[error("garbage at frame boundary (byte {0:#04x})")]
    Corrupt(u8),
    #[error("unparseable RTSP message")]
    BadMessage,
}

#[derive(Debug)]
pub enum Deframed {
    /// Binary frame: channel id and payload.
    Data(u8, Vec<u8>),
    /// RTSP text message (request or response).
    Message(Message<Vec<u8>>),
}

#[derive(Default)]
pub struct Deframer {
    buf: BytesMut,
}

impl Deframer {
    pub fn new() -> Self {
        Deframer { buf: BytesMut::with_capacity(8 * 1024) }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<(), DeframeError> {
        if self.buf.len() + data.len() > INTERLEAVED_BUF_MAX {
            let total = self.buf.len() + data.len();
            self.buf.clear();
            return Err(DeframeError::FrameTooLarge(total));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame or message, if any. On error the
    /// buffer is reset; the caller should drop the connection.
    pub fn next(&mut self) -> Result<Option<Deframed>, DeframeError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] == b'$' {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let channel = self.buf[1];
            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if 4 + len > INTERLEAVED_BUF_MAX {
                self.buf.clear();
                return Err(DeframeError::FrameTooLarge(4 + len));
            }
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            self.buf.advance(4);
            let payload = self.buf.split_to(len).to_vec();
            return Ok(Some(Deframed::Data(channel, payload)));
        }
        // Must be the start of an RTSP message. RTSP methods and the
        // "RTSP/" version prefix are all ASCII uppercase.
        if !self.buf[0].is_ascii_uppercase() {
            let b = self.buf[0];
            self.buf.clear();
            return Err(DeframeError::Corrupt(b));
        }
        match Message::parse(&self.buf[..]) {
            Ok((msg, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(Deframed::Message(msg)))
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => Ok(None),
            Err(_) => {
                self.buf.clear();
                Err(DeframeError::BadMessage)
            }
        }
    }
}
