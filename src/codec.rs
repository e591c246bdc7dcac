//! Frame encoder/decoder implementing the `tokio_util::codec` traits.
//!
//! The decoder is resumable: it keeps its progress in an explicit state and
//! returns `Ok(None)` without consuming anything it might need again, so it
//! can run directly over socket reads of arbitrary sizes. Masking direction
//! is validated per role at both ends: clients always mask outgoing frames
//! and must never receive masked ones, servers the opposite.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    WsError,
};

/// Which end of the connection this codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Decoding progress for a frame that is not fully buffered yet.
enum ReadState {
    /// The first two bytes are parsed; waiting for the extended length and
    /// mask key.
    Header(Header),
    /// The full header is parsed; waiting for the payload.
    Payload(HeaderAndMask),
}

/// Fields from the first two header bytes.
struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Bytes of extended payload length still to read (0, 2 or 8).
    extra: usize,
    /// Raw 7-bit length code.
    length_code: u8,
    /// Remaining header bytes: `extra` plus the mask key if present.
    header_size: usize,
}

struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Resumable WebSocket frame decoder.
pub struct Decoder {
    role: Role,
    state: Option<ReadState>,
    /// Maximum allowed payload size for a single frame.
    max_payload_len: usize,
    /// Whether a negotiated extension claimed the RSV1 bit.
    rsv1_allowed: bool,
}

impl Decoder {
    /// Creates a decoder for `role` limiting frame payloads to
    /// `max_payload_len` bytes.
    pub fn new(role: Role, max_payload_len: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_len,
            rsv1_allowed: false,
        }
    }

    /// Permits the RSV1 extension bit on incoming frames.
    pub fn allow_rsv1(&mut self) {
        self.rsv1_allowed = true;
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WsError;

    /// Decodes the next frame, unmasking it if it arrived masked.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame;
    /// already-parsed header fields are kept so the next call resumes where
    /// this one stopped.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;

                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WsError::ReservedBitsNotZero);
                    }
                    if rsv1 && !self.rsv1_allowed {
                        return Err(WsError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7f;

                    match self.role {
                        // Servers must never mask (RFC 6455 section 5.1).
                        Role::Client if masked => return Err(WsError::UnexpectedMask),
                        Role::Server if !masked => return Err(WsError::UnexpectedMask),
                        _ => {}
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => {
                            let len = src.get_u64();
                            if len & (1 << 63) != 0 {
                                return Err(WsError::InvalidPayloadLength);
                            }
                            usize::try_from(len).map_err(|_| WsError::FrameTooLarge)?
                        }
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WsError::ControlFrameFragmented);
                        }
                        if payload_len > 125 {
                            return Err(WsError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_payload_len {
                        return Err(WsError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(parts)) => {
                    if src.remaining() < parts.payload_len {
                        self.state = Some(ReadState::Payload(parts));
                        return Ok(None);
                    }

                    let payload = src.split_to(parts.payload_len);
                    let mut frame =
                        Frame::new(parts.header.fin, parts.header.opcode, parts.mask, payload);
                    frame.rsv1 = parts.header.rsv1;
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder.
///
/// For the client role every outgoing frame is masked with a fresh random
/// key at encode time; the server role refuses masked frames.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WsError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.role {
            Role::Client => frame.mask(),
            Role::Server => {
                if frame.is_masked() {
                    return Err(WsError::UnexpectedMask);
                }
            }
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Combined codec for use with framed transports.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> crate::Result<Vec<Frame>> {
        let mut src = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(frame) = decoder.decode(&mut src)? {
            out.push(frame);
        }
        Ok(out)
    }

    #[test]
    fn client_encode_server_decode() {
        let mut encoder = Encoder::new(Role::Client);
        let mut dst = BytesMut::new();
        encoder.encode(Frame::text("hello"), &mut dst).unwrap();

        // Client frames go out masked.
        assert_eq!(dst[1] & 0x80, 0x80);

        let mut decoder = Decoder::new(Role::Server, 1024);
        let frames = decode_all(&mut decoder, &dst).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert_eq!(&frames[0].payload[..], b"hello");
    }

    #[test]
    fn server_encode_client_decode() {
        let mut encoder = Encoder::new(Role::Server);
        let mut dst = BytesMut::new();
        encoder.encode(Frame::binary(vec![0u8; 300]), &mut dst).unwrap();
        assert_eq!(dst[1] & 0x80, 0);

        let mut decoder = Decoder::new(Role::Client, 1024);
        let frames = decode_all(&mut decoder, &dst).unwrap();
        assert_eq!(frames[0].payload.len(), 300);
    }

    #[test]
    fn partial_input_returns_none_and_resumes() {
        let mut encoder = Encoder::new(Role::Server);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::binary(vec![7u8; 200]), &mut wire).unwrap();

        let mut decoder = Decoder::new(Role::Client, 1024);
        let mut src = BytesMut::new();

        // Feed the wire bytes one at a time; nothing comes out early.
        let total = wire.len();
        for (i, byte) in wire.iter().enumerate() {
            src.extend_from_slice(&[*byte]);
            let res = decoder.decode(&mut src).unwrap();
            if i + 1 < total {
                assert!(res.is_none(), "frame produced early at byte {i}");
            } else {
                let frame = res.unwrap();
                assert_eq!(frame.payload.len(), 200);
            }
        }
    }

    #[test]
    fn masked_server_frame_rejected_by_client() {
        let mut encoder = Encoder::new(Role::Client);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::text("x"), &mut wire).unwrap();

        let mut decoder = Decoder::new(Role::Client, 1024);
        let err = decode_all(&mut decoder, &wire).unwrap_err();
        assert!(matches!(err, WsError::UnexpectedMask));
    }

    #[test]
    fn unmasked_client_frame_rejected_by_server() {
        let mut encoder = Encoder::new(Role::Server);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::text("x"), &mut wire).unwrap();

        let mut decoder = Decoder::new(Role::Server, 1024);
        assert!(matches!(
            decode_all(&mut decoder, &wire),
            Err(WsError::UnexpectedMask)
        ));
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut decoder = Decoder::new(Role::Client, 1024);
        // RSV2 set.
        assert!(matches!(
            decode_all(&mut decoder, &[0xa1, 0x00]),
            Err(WsError::ReservedBitsNotZero)
        ));

        // RSV1 without an extension.
        let mut decoder = Decoder::new(Role::Client, 1024);
        assert!(matches!(
            decode_all(&mut decoder, &[0xc1, 0x00]),
            Err(WsError::ReservedBitsNotZero)
        ));

        // RSV1 with an extension that claimed it.
        let mut decoder = Decoder::new(Role::Client, 1024);
        decoder.allow_rsv1();
        let frames = decode_all(&mut decoder, &[0xc1, 0x00]).unwrap();
        assert!(frames[0].rsv1);
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        // Ping with FIN clear.
        let mut decoder = Decoder::new(Role::Client, 1024);
        assert!(matches!(
            decode_all(&mut decoder, &[0x09, 0x00]),
            Err(WsError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn oversized_control_frame_rejected() {
        // Close with a 126-byte payload needs the 16-bit length form.
        let mut wire = vec![0x88, 126, 0x00, 126];
        wire.extend_from_slice(&[0u8; 126]);
        let mut decoder = Decoder::new(Role::Client, 1024);
        assert!(matches!(
            decode_all(&mut decoder, &wire),
            Err(WsError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn payload_over_limit_rejected() {
        let mut encoder = Encoder::new(Role::Server);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::binary(vec![0u8; 2000]), &mut wire).unwrap();

        let mut decoder = Decoder::new(Role::Client, 1024);
        assert!(matches!(
            decode_all(&mut decoder, &wire),
            Err(WsError::FrameTooLarge)
        ));
    }

    #[test]
    fn sixtyfour_bit_length_high_bit_rejected() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(1u64 << 63).to_be_bytes());
        let mut decoder = Decoder::new(Role::Client, usize::MAX);
        assert!(matches!(
            decode_all(&mut decoder, &wire),
            Err(WsError::InvalidPayloadLength)
        ));
    }

    #[test]
    fn several_frames_in_one_buffer() {
        let mut encoder = Encoder::new(Role::Server);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::text("one"), &mut wire).unwrap();
        encoder.encode(Frame::ping(b"p"), &mut wire).unwrap();
        encoder.encode(Frame::text("two"), &mut wire).unwrap();

        let mut decoder = Decoder::new(Role::Client, 1024);
        let frames = decode_all(&mut decoder, &wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].opcode, OpCode::Ping);
        assert_eq!(&frames[2].payload[..], b"two");
    }
}
