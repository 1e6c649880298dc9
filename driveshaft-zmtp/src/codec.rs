//! Wire framing, version 2.
//!
//! One flag byte (MORE / LONG / COMMAND), then a one-byte length for
//! bodies up to 255 bytes or an eight-byte big-endian length under the
//! LONG flag, then the body. The decoder is incremental: feed it the
//! segmented read buffer, get back at most one message frame per call.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use driveshaft_core::buffer::SegmentedBuffer;
use driveshaft_core::error::DriveshaftError;
use driveshaft_core::msg::Msg;

/// Wire flag: another frame of the same message follows.
pub const FLAG_MORE: u8 = 0x01;
/// Wire flag: eight-byte length field.
pub const FLAG_LONG: u8 = 0x02;
/// Wire flag: protocol command frame.
pub const FLAG_COMMAND: u8 = 0x04;

const RESERVED_MASK: u8 = 0xF8;

/// Wire-protocol violations.
#[derive(Debug, Error)]
pub enum ZmtpError {
    #[error("reserved flag bits set")]
    ReservedBits,

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("malformed greeting")]
    BadGreeting,

    #[error("unsupported protocol version {0}.{1}")]
    BadVersion(u8, u8),

    #[error("peer proposed a different security mechanism")]
    MechanismMismatch,

    #[error("malformed handshake command")]
    BadHandshake,

    #[error("peer socket type is not a valid counterpart")]
    IncompatiblePeer,
}

impl From<ZmtpError> for DriveshaftError {
    fn from(err: ZmtpError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Incremental frame decoder.
///
/// Fast path: a whole frame inside one buffer segment comes out as a
/// refcounted slice. Slow path: a frame fragmented across reads is
/// reassembled in a staging buffer.
pub struct Decoder {
    pending_flags: Option<u8>,
    expected_len: usize,
    staging: BytesMut,
    /// Reject bodies larger than this; `None` is unlimited.
    max_msg_size: Option<u64>,
}

impl Decoder {
    #[must_use]
    pub fn new(max_msg_size: Option<u64>) -> Self {
        Self {
            pending_flags: None,
            expected_len: 0,
            staging: BytesMut::new(),
            max_msg_size,
        }
    }

    fn frame(flags: u8, payload: Bytes) -> Msg {
        let mut msg = Msg::from_bytes(payload);
        if flags & FLAG_MORE != 0 {
            msg.set_flags(Msg::MORE);
        }
        if flags & FLAG_COMMAND != 0 {
            msg.set_flags(Msg::COMMAND);
        }
        msg
    }

    /// Decode one frame.
    ///
    /// - `Ok(Some(msg))`: a frame was decoded
    /// - `Ok(None)`: more bytes needed
    /// - `Err`: protocol violation; the connection must reset
    pub fn decode(&mut self, src: &mut SegmentedBuffer) -> Result<Option<Msg>, ZmtpError> {
        // Reassembly of a fragmented body.
        if let Some(flags) = self.pending_flags {
            let needed = self.expected_len - self.staging.len();
            let count = needed.min(src.len());
            if let Some(bytes) = src.take(count) {
                self.staging.extend_from_slice(&bytes);
            }
            if self.staging.len() < self.expected_len {
                return Ok(None);
            }
            let payload = self.staging.split().freeze();
            self.pending_flags = None;
            self.expected_len = 0;
            return Ok(Some(Self::frame(flags, payload)));
        }

        if src.len() < 2 {
            return Ok(None);
        }

        let mut hdr = [0u8; 9];
        if !src.peek(&mut hdr[..2]) {
            return Ok(None);
        }

        let flags = hdr[0];
        if flags & RESERVED_MASK != 0 {
            return Err(ZmtpError::ReservedBits);
        }

        let is_long = flags & FLAG_LONG != 0;
        let header_len = if is_long { 9 } else { 2 };
        if src.len() < header_len {
            return Ok(None);
        }

        let body_len = if is_long {
            if !src.peek(&mut hdr) {
                return Ok(None);
            }
            let mut len_bytes = &hdr[1..9];
            let size = len_bytes.get_u64();
            // The high bit is reserved in this framing revision.
            if size > i64::MAX as u64 {
                return Err(ZmtpError::FrameTooLarge {
                    size,
                    max: i64::MAX as u64,
                });
            }
            size as usize
        } else {
            hdr[1] as usize
        };

        if let Some(max) = self.max_msg_size {
            if body_len as u64 > max {
                return Err(ZmtpError::FrameTooLarge {
                    size: body_len as u64,
                    max,
                });
            }
        }

        let total_len = header_len + body_len;

        // Fast path: the whole frame is buffered.
        if src.len() >= total_len {
            src.skip(header_len);
            let payload = src
                .take(body_len)
                .expect("length was checked against the buffer");
            return Ok(Some(Self::frame(flags, payload)));
        }

        // Slow path: start reassembly.
        src.skip(header_len);
        self.pending_flags = Some(flags);
        self.expected_len = body_len;
        self.staging.clear();
        self.staging.reserve(body_len);
        let available = src.len().min(body_len);
        if let Some(bytes) = src.take(available) {
            self.staging.extend_from_slice(&bytes);
        }
        Ok(None)
    }
}

/// Append one encoded frame to `out`.
pub fn encode_msg(msg: &Msg, out: &mut BytesMut) {
    let body = msg.data();
    let is_long = body.len() > 255;

    let mut flags = 0u8;
    if msg.has_more() {
        flags |= FLAG_MORE;
    }
    if msg.is_command() {
        flags |= FLAG_COMMAND;
    }
    if is_long {
        flags |= FLAG_LONG;
    }

    out.reserve(if is_long { 9 } else { 2 } + body.len());
    out.extend_from_slice(&[flags]);
    if is_long {
        out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    } else {
        out.extend_from_slice(&[body.len() as u8]);
    }
    out.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<Msg> {
        let mut src = SegmentedBuffer::new();
        src.push(Bytes::copy_from_slice(bytes));
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode(&mut src).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_round_trip_identity() {
        let mut out = BytesMut::new();
        let frames = [
            Msg::from("alpha").with_more(true),
            Msg::from("").with_more(true),
            Msg::from("omega"),
        ];
        for f in &frames {
            encode_msg(f, &mut out);
        }

        let mut decoder = Decoder::new(None);
        let decoded = decode_all(&mut decoder, &out);
        assert_eq!(decoded.len(), 3);
        for (got, want) in decoded.iter().zip(&frames) {
            assert_eq!(got.data(), want.data());
            assert_eq!(got.has_more(), want.has_more());
        }
    }

    #[test]
    fn test_length_width_boundaries() {
        for (size, long) in [
            (0usize, false),
            (1, false),
            (254, false),
            (255, false),
            (256, true),
            (65535, true),
        ] {
            let mut out = BytesMut::new();
            encode_msg(&Msg::from(vec![0xABu8; size]), &mut out);
            assert_eq!(
                out[0] & FLAG_LONG != 0,
                long,
                "wrong width flag for size {size}"
            );
            let header = if long { 9 } else { 2 };
            assert_eq!(out.len(), header + size);

            let mut decoder = Decoder::new(None);
            let decoded = decode_all(&mut decoder, &out);
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].size(), size);
        }
    }

    #[test]
    fn test_fragmented_delivery() {
        let mut out = BytesMut::new();
        encode_msg(&Msg::from(vec![7u8; 1000]), &mut out);

        let mut decoder = Decoder::new(None);
        let mut src = SegmentedBuffer::new();
        let mut decoded = None;
        for chunk in out.chunks(13) {
            src.push(Bytes::copy_from_slice(chunk));
            if let Some(msg) = decoder.decode(&mut src).unwrap() {
                decoded = Some(msg);
            }
        }
        let msg = decoded.expect("message reassembled");
        assert_eq!(msg.size(), 1000);
        assert!(msg.data().iter().all(|b| *b == 7));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let mut decoder = Decoder::new(None);
        let mut src = SegmentedBuffer::new();
        src.push(Bytes::from_static(&[0x10, 0x00]));
        assert!(matches!(
            decoder.decode(&mut src),
            Err(ZmtpError::ReservedBits)
        ));
    }

    #[test]
    fn test_max_msg_size_enforced() {
        let mut out = BytesMut::new();
        encode_msg(&Msg::from(vec![1u8; 600]), &mut out);

        let mut decoder = Decoder::new(Some(512));
        let mut src = SegmentedBuffer::new();
        src.push(out.freeze());
        assert!(matches!(
            decoder.decode(&mut src),
            Err(ZmtpError::FrameTooLarge { size: 600, max: 512 })
        ));
    }

    #[test]
    fn test_command_flag_survives() {
        let mut cmd = Msg::from("READY-ish");
        cmd.set_flags(Msg::COMMAND);
        let mut out = BytesMut::new();
        encode_msg(&cmd, &mut out);
        assert_eq!(out[0] & FLAG_COMMAND, FLAG_COMMAND);

        let mut decoder = Decoder::new(None);
        let decoded = decode_all(&mut decoder, &out);
        assert!(decoded[0].is_command());
    }
}
