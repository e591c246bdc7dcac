//! WebSocket frame model (RFC 6455 section 5.2).
//!
//! [`Frame`] is the unit both the codec and the session operate on. Header
//! formatting and masking live here; validation of where a frame is allowed
//! to appear (fragmentation rules, control-frame limits) is split between
//! the decoder and the session.

use bytes::BytesMut;

use crate::close::CloseCode;
use crate::{Result, WsError};

/// Frame type nibble from the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continues a fragmented message started by a Text or Binary frame.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Arbitrary binary data.
    Binary,
    /// Starts the closing handshake.
    Close,
    /// Keepalive probe; the peer answers with a pong.
    Ping,
    /// Answer to a ping, or an unsolicited heartbeat.
    Pong,
}

impl OpCode {
    /// Control frames may interleave with a fragmented message but must
    /// not themselves be fragmented.
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            byte => Err(WsError::InvalidOpCode(byte)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> u8 {
        match value {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }
}

/// Scratch space large enough for any frame header: 10 header bytes plus a
/// 4-byte mask key, rounded up.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// A single WebSocket frame.
#[derive(Debug)]
pub struct Frame {
    /// Final fragment flag. When `true` this frame completes a message.
    pub fin: bool,
    /// Extension bit (RSV1). Only meaningful when a negotiated extension
    /// claimed it; the decoder rejects it otherwise.
    pub rsv1: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// XOR masking key. Set on client-to-server frames.
    mask: Option<[u8; 4]>,
    /// Frame payload. Unmasked once it leaves the decoder.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame with the given parameters.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// A final text frame. The payload is known-valid UTF-8 by type.
    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(true, OpCode::Text, None, payload.into().into_bytes().as_slice())
    }

    /// A final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, payload.as_ref())
    }

    /// A close frame carrying `code` and a UTF-8 reason.
    pub fn close(code: CloseCode, reason: impl AsRef<str>) -> Self {
        let reason = reason.as_ref().as_bytes();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, None, payload)
    }

    /// A close frame with a raw payload, echoed verbatim. No validation is
    /// performed on `payload`.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, None, payload.as_ref())
    }

    /// A ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, payload.as_ref())
    }

    /// A pong frame.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, payload.as_ref())
    }

    /// Close code carried in the payload, if there is one.
    pub fn close_code(&self) -> Option<CloseCode> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        Some(CloseCode::from(code))
    }

    /// Close reason following the code, validated as UTF-8.
    pub fn close_reason(&self) -> Result<Option<&str>> {
        if self.opcode != OpCode::Close || self.payload.len() <= 2 {
            return Ok(None);
        }
        std::str::from_utf8(&self.payload[2..])
            .map(Some)
            .map_err(|_| WsError::InvalidUtf8)
    }

    pub(crate) fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masks the payload in place. Without a preset key a fresh random one
    /// is generated, which is the normal client send path.
    pub(crate) fn mask(&mut self) {
        let key = self.mask.unwrap_or_else(rand::random);
        crate::mask::apply_mask(&mut self.payload, key);
        self.mask = Some(key);
    }

    /// Reverses masking using the key recorded in the header.
    pub(crate) fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, key);
        }
    }

    pub(crate) fn set_mask(&mut self, key: [u8; 4]) {
        self.mask = Some(key);
    }

    /// Writes the frame header into `head` and returns the header length
    /// (2, 4 or 10 bytes, plus 4 when masked).
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv1 as u8) << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn control_classification() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());
            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn try_from_valid_nibbles() {
            assert_eq!(OpCode::try_from(0x0).unwrap(), OpCode::Continuation);
            assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
            assert_eq!(OpCode::try_from(0x2).unwrap(), OpCode::Binary);
            assert_eq!(OpCode::try_from(0x8).unwrap(), OpCode::Close);
            assert_eq!(OpCode::try_from(0x9).unwrap(), OpCode::Ping);
            assert_eq!(OpCode::try_from(0xa).unwrap(), OpCode::Pong);
        }

        #[test]
        fn try_from_reserved_nibbles() {
            for byte in [0x3, 0x4, 0x5, 0x6, 0x7, 0xb, 0xc, 0xd, 0xe, 0xf] {
                assert!(matches!(
                    OpCode::try_from(byte),
                    Err(WsError::InvalidOpCode(b)) if b == byte
                ));
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn close_frame_payload_layout() {
            let frame = Frame::close(CloseCode::Normal, "bye");
            assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
            assert_eq!(&frame.payload[2..], b"bye");
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
            assert_eq!(frame.close_reason().unwrap(), Some("bye"));
        }

        #[test]
        fn close_reason_must_be_utf8() {
            let mut payload = 1000u16.to_be_bytes().to_vec();
            payload.extend_from_slice(&[0xff, 0xfe]);
            let frame = Frame::close_raw(payload);
            assert!(matches!(frame.close_reason(), Err(WsError::InvalidUtf8)));
        }

        #[test]
        fn empty_close_has_no_code() {
            let frame = Frame::close_raw(b"");
            assert_eq!(frame.close_code(), None);
            assert_eq!(frame.close_reason().unwrap(), None);
        }

        #[test]
        fn short_header() {
            let frame = Frame::text("hi");
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = frame.fmt_head(&mut head);
            assert_eq!(n, 2);
            assert_eq!(head[0], 0x81); // FIN + text
            assert_eq!(head[1], 2);
        }

        #[test]
        fn extended_16bit_header() {
            let frame = Frame::binary(vec![0u8; 300]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = frame.fmt_head(&mut head);
            assert_eq!(n, 4);
            assert_eq!(head[1], 126);
            assert_eq!(u16::from_be_bytes([head[2], head[3]]), 300);
        }

        #[test]
        fn extended_64bit_header() {
            let frame = Frame::binary(vec![0u8; 70000]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = frame.fmt_head(&mut head);
            assert_eq!(n, 10);
            assert_eq!(head[1], 127);
            assert_eq!(u64::from_be_bytes(head[2..10].try_into().unwrap()), 70000);
        }

        #[test]
        fn masked_header_carries_key() {
            let mut frame = Frame::text("data");
            frame.set_mask([1, 2, 3, 4]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = frame.fmt_head(&mut head);
            assert_eq!(n, 6);
            assert_eq!(head[1] & 0x80, 0x80);
            assert_eq!(&head[2..6], &[1, 2, 3, 4]);
        }

        #[test]
        fn mask_then_unmask_restores_payload() {
            let mut frame = Frame::binary(b"roundtrip");
            frame.mask();
            assert!(frame.is_masked());
            assert_ne!(&frame.payload[..], b"roundtrip");
            frame.unmask();
            assert!(!frame.is_masked());
            assert_eq!(&frame.payload[..], b"roundtrip");
        }

        #[test]
        fn rsv1_bit_in_header() {
            let mut frame = Frame::binary(b"z");
            frame.rsv1 = true;
            let mut head = [0u8; MAX_HEAD_SIZE];
            frame.fmt_head(&mut head);
            assert_eq!(head[0] & 0x40, 0x40);
        }
    }
}
