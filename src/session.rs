//! Post-upgrade protocol session.
//!
//! Sits between raw socket bytes and application messages: accumulates
//! reads, runs the frame decoder, enforces fragmentation rules, validates
//! text as it streams in, assembles messages, and answers pings. The
//! session is sans-io; the caller writes out whatever
//! [`take_obligated`](Session::take_obligated) returns and delivers the
//! produced events.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::buffer::{GrowableBuffer, DEFAULT_STEP_SIZE};
use crate::close::CloseCode;
use crate::codec::{Decoder, Encoder, Role};
use crate::extensions::Extension;
use crate::frame::{Frame, OpCode};
use crate::{Result, WsError};

/// Something the session produced from incoming bytes.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete text message, already validated as UTF-8.
    Text(String),
    /// A complete binary message.
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    /// The peer started the closing handshake.
    Close {
        code: Option<CloseCode>,
        reason: String,
    },
}

/// Frame-level protocol state for one connection.
pub struct Session {
    decoder: Decoder,
    encoder: Encoder,
    in_buffer: GrowableBuffer,
    /// Opcode of the fragmented message being received, if any.
    in_fragmented: Option<OpCode>,
    assembly: BytesMut,
    utf8: crate::utf8::Utf8Validator,
    /// Original opcode of the fragmented message being sent, if any.
    out_fragmented: Option<OpCode>,
    extensions: Vec<Box<dyn Extension>>,
    max_message_size: usize,
    close_received: bool,
    /// Frames the protocol demands be written (pong replies, close echo).
    obligated: Vec<Frame>,
}

impl Session {
    pub fn new(role: Role, max_message_size: usize, extensions: Vec<Box<dyn Extension>>) -> Self {
        let mut decoder = Decoder::new(role, max_message_size);
        if extensions.iter().any(|ext| ext.claims_rsv1()) {
            decoder.allow_rsv1();
        }
        Self {
            decoder,
            encoder: Encoder::new(role),
            // Room for a full-size frame plus its header.
            in_buffer: GrowableBuffer::new(
                max_message_size.saturating_add(crate::frame::MAX_HEAD_SIZE),
                DEFAULT_STEP_SIZE,
            ),
            in_fragmented: None,
            assembly: BytesMut::new(),
            utf8: crate::utf8::Utf8Validator::new(),
            out_fragmented: None,
            extensions,
            max_message_size,
            close_received: false,
            obligated: Vec::new(),
        }
    }

    /// Whether the peer already sent a close frame.
    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Feeds raw socket bytes in and returns the events they complete.
    ///
    /// On a protocol error the caller should send
    /// [`close_frame_for`](Self::close_frame_for) and tear the connection
    /// down; the session is not usable afterwards.
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<SessionEvent>> {
        self.in_buffer.append(data)?;

        let mut events = Vec::new();
        loop {
            let frame = match self.decoder.decode(self.in_buffer.as_mut())? {
                Some(frame) => frame,
                None => break,
            };
            // Nothing matters after the peer's close frame.
            if self.close_received {
                break;
            }
            if let Some(event) = self.on_frame(frame)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn on_frame(&mut self, mut frame: Frame) -> Result<Option<SessionEvent>> {
        if !frame.opcode.is_control() {
            for ext in self.extensions.iter_mut() {
                frame = ext.process_incoming(frame)?;
            }
        }

        match frame.opcode {
            OpCode::Ping => {
                self.obligated.push(Frame::pong(&frame.payload[..]));
                Ok(Some(SessionEvent::Ping(frame.payload.freeze())))
            }
            OpCode::Pong => Ok(Some(SessionEvent::Pong(frame.payload.freeze()))),
            OpCode::Close => self.on_close(frame).map(Some),
            OpCode::Text | OpCode::Binary | OpCode::Continuation => self.on_data(frame),
        }
    }

    fn on_close(&mut self, frame: Frame) -> Result<SessionEvent> {
        let (code, reason) = match frame.payload.len() {
            0 => (None, String::new()),
            1 => return Err(WsError::InvalidCloseFrame),
            _ => {
                let code = frame.close_code().ok_or(WsError::InvalidCloseFrame)?;
                if !code.is_allowed() {
                    return Err(WsError::InvalidCloseCode);
                }
                let reason = frame.close_reason()?.unwrap_or_default().to_string();
                (Some(code), reason)
            }
        };

        self.close_received = true;
        self.obligated.push(Frame::close_raw(&frame.payload[..]));
        Ok(SessionEvent::Close { code, reason })
    }

    fn on_data(&mut self, frame: Frame) -> Result<Option<SessionEvent>> {
        let message_opcode = match (frame.opcode, self.in_fragmented) {
            (OpCode::Continuation, Some(open)) => open,
            (OpCode::Continuation, None) => return Err(WsError::InvalidContinuationFrame),
            (opcode, None) => opcode,
            // A new data message may not start while another is open.
            (_, Some(_)) => return Err(WsError::InvalidFragment),
        };

        if self.assembly.len() + frame.payload.len() > self.max_message_size {
            return Err(WsError::FrameTooLarge);
        }
        if message_opcode == OpCode::Text {
            self.utf8.push(&frame.payload)?;
        }
        self.assembly.extend_from_slice(&frame.payload);

        if !frame.fin {
            self.in_fragmented = Some(message_opcode);
            return Ok(None);
        }

        self.in_fragmented = None;
        let payload = self.assembly.split();
        let event = if message_opcode == OpCode::Text {
            self.utf8.finish()?;
            let text =
                String::from_utf8(payload.to_vec()).map_err(|_| WsError::InvalidUtf8)?;
            SessionEvent::Text(text)
        } else {
            SessionEvent::Binary(payload.freeze())
        };
        Ok(Some(event))
    }

    /// Frames the protocol requires be sent now, in order.
    pub fn take_obligated(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.obligated)
    }

    /// Encodes one fragment of an outgoing data message.
    ///
    /// Callers pass the message's opcode on every fragment; wire opcodes
    /// for follow-up fragments become `Continuation` here. Starting a
    /// message of a different type while one is open is an error.
    pub fn encode_data(&mut self, opcode: OpCode, fin: bool, payload: BytesMut) -> Result<Bytes> {
        if opcode.is_control() || opcode == OpCode::Continuation {
            return Err(WsError::IllegalState("encode_data takes text or binary"));
        }

        let wire_opcode = match self.out_fragmented {
            None => {
                if !fin {
                    self.out_fragmented = Some(opcode);
                }
                opcode
            }
            Some(open) => {
                if opcode != open {
                    return Err(WsError::InvalidFragment);
                }
                if fin {
                    self.out_fragmented = None;
                }
                OpCode::Continuation
            }
        };

        let mut frame = Frame::new(fin, wire_opcode, None, payload);
        for ext in self.extensions.iter_mut() {
            frame = ext.process_outgoing(frame)?;
        }
        self.encode(frame)
    }

    /// Encodes a control frame (ping, pong, close). Size limits apply.
    pub fn encode_control(&mut self, frame: Frame) -> Result<Bytes> {
        if !frame.opcode.is_control() {
            return Err(WsError::IllegalState("encode_control takes control frames"));
        }
        if frame.payload.len() > 125 {
            return Err(WsError::ControlFrameTooLarge);
        }
        self.encode(frame)
    }

    fn encode(&mut self, frame: Frame) -> Result<Bytes> {
        let mut out = BytesMut::new();
        self.encoder.encode(frame, &mut out)?;
        Ok(out.freeze())
    }

    /// Close frame announcing `err` to the peer, with the code RFC 6455
    /// assigns to the violation.
    pub fn close_frame_for(err: &WsError) -> Frame {
        let code = match err {
            WsError::FrameTooLarge | WsError::BufferOverflow(_) => CloseCode::Size,
            WsError::InvalidOpCode(_) => CloseCode::Unsupported,
            WsError::InvalidUtf8 => CloseCode::Invalid,
            WsError::ReservedBitsNotZero
            | WsError::ControlFrameFragmented
            | WsError::ControlFrameTooLarge
            | WsError::InvalidFragment
            | WsError::InvalidContinuationFrame
            | WsError::InvalidCloseFrame
            | WsError::InvalidCloseCode
            | WsError::InvalidPayloadLength
            | WsError::UnexpectedMask => CloseCode::Protocol,
            _ => CloseCode::Error,
        };
        Frame::close(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Encoder as _;

    /// Encodes server-side frames to feed the client session under test.
    fn server_bytes(frames: Vec<Frame>) -> BytesMut {
        let mut encoder = Encoder::new(Role::Server);
        let mut out = BytesMut::new();
        for frame in frames {
            encoder.encode(frame, &mut out).unwrap();
        }
        out
    }

    fn session() -> Session {
        Session::new(Role::Client, 1024 * 1024, Vec::new())
    }

    #[test]
    fn single_text_message() {
        let mut s = session();
        let wire = server_bytes(vec![Frame::text("hello")]);
        let events = s.receive(&wire).unwrap();
        assert!(matches!(&events[0], SessionEvent::Text(t) if t == "hello"));
    }

    #[test]
    fn fragmented_text_reassembled() {
        let mut s = session();
        let wire = server_bytes(vec![
            Frame::new(false, OpCode::Text, None, &b"a"[..]),
            Frame::new(false, OpCode::Continuation, None, &b"b"[..]),
            Frame::new(true, OpCode::Continuation, None, &b"c"[..]),
        ]);
        let events = s.receive(&wire).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::Text(t) if t == "abc"));
    }

    #[test]
    fn utf8_split_across_fragments() {
        // A two-byte character split between fragments.
        let mut s = session();
        let wire = server_bytes(vec![
            Frame::new(false, OpCode::Text, None, &b"caf\xc3"[..]),
            Frame::new(true, OpCode::Continuation, None, &b"\xa9"[..]),
        ]);
        let events = s.receive(&wire).unwrap();
        assert!(matches!(&events[0], SessionEvent::Text(t) if t == "café"));
    }

    #[test]
    fn truncated_utf8_at_message_end_fails() {
        let mut s = session();
        let wire = server_bytes(vec![Frame::new(true, OpCode::Text, None, &b"ok\xc3"[..])]);
        assert!(matches!(s.receive(&wire), Err(WsError::InvalidUtf8)));
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let mut s = session();
        let wire = server_bytes(vec![
            Frame::new(false, OpCode::Binary, None, &b"12"[..]),
            Frame::ping(b"keepalive"),
            Frame::new(true, OpCode::Continuation, None, &b"34"[..]),
        ]);
        let events = s.receive(&wire).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SessionEvent::Ping(p) if &p[..] == b"keepalive"));
        assert!(matches!(&events[1], SessionEvent::Binary(b) if &b[..] == b"1234"));

        // The ping reply is queued automatically.
        let obligated = s.take_obligated();
        assert_eq!(obligated.len(), 1);
        assert_eq!(obligated[0].opcode, OpCode::Pong);
        assert_eq!(&obligated[0].payload[..], b"keepalive");
    }

    #[test]
    fn continuation_without_open_message_fails() {
        let mut s = session();
        let wire = server_bytes(vec![Frame::new(true, OpCode::Continuation, None, &b"x"[..])]);
        assert!(matches!(
            s.receive(&wire),
            Err(WsError::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn new_data_opcode_during_fragmentation_fails() {
        let mut s = session();
        let wire = server_bytes(vec![
            Frame::new(false, OpCode::Text, None, &b"a"[..]),
            Frame::new(true, OpCode::Binary, None, &b"b"[..]),
        ]);
        assert!(matches!(s.receive(&wire), Err(WsError::InvalidFragment)));
    }

    #[test]
    fn oversized_assembled_message_fails() {
        let mut s = Session::new(Role::Client, 10, Vec::new());
        let wire = server_bytes(vec![
            Frame::new(false, OpCode::Binary, None, &[0u8; 6][..]),
            Frame::new(true, OpCode::Continuation, None, &[0u8; 6][..]),
        ]);
        assert!(matches!(s.receive(&wire), Err(WsError::FrameTooLarge)));
    }

    #[test]
    fn close_with_code_and_reason() {
        let mut s = session();
        let wire = server_bytes(vec![Frame::close(CloseCode::Away, "maintenance")]);
        let events = s.receive(&wire).unwrap();
        match &events[0] {
            SessionEvent::Close { code, reason } => {
                assert_eq!(*code, Some(CloseCode::Away));
                assert_eq!(reason, "maintenance");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(s.close_received());

        // Close is echoed back.
        let obligated = s.take_obligated();
        assert_eq!(obligated[0].opcode, OpCode::Close);
        assert_eq!(obligated[0].close_code(), Some(CloseCode::Away));
    }

    #[test]
    fn one_byte_close_payload_fails() {
        let mut s = session();
        let wire = server_bytes(vec![Frame::close_raw(&[0x03][..])]);
        assert!(matches!(s.receive(&wire), Err(WsError::InvalidCloseFrame)));
    }

    #[test]
    fn disallowed_close_code_fails() {
        let mut s = session();
        let wire = server_bytes(vec![Frame::close_raw(1005u16.to_be_bytes())]);
        assert!(matches!(s.receive(&wire), Err(WsError::InvalidCloseCode)));
    }

    #[test]
    fn frames_after_close_ignored() {
        let mut s = session();
        let wire = server_bytes(vec![
            Frame::close(CloseCode::Normal, ""),
            Frame::text("late"),
        ]);
        let events = s.receive(&wire).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::Close { .. }));
    }

    #[test]
    fn partial_frames_across_receives() {
        let mut s = session();
        let wire = server_bytes(vec![Frame::text("split me")]);
        let (first, second) = wire.split_at(3);

        assert!(s.receive(first).unwrap().is_empty());
        let events = s.receive(second).unwrap();
        assert!(matches!(&events[0], SessionEvent::Text(t) if t == "split me"));
    }

    #[test]
    fn outgoing_fragmentation_rules() {
        let mut s = session();

        // Client output is masked, so just check the encode succeeds and
        // the state machine enforces typing.
        s.encode_data(OpCode::Text, false, BytesMut::from("a")).unwrap();
        assert!(matches!(
            s.encode_data(OpCode::Binary, true, BytesMut::from("b")),
            Err(WsError::InvalidFragment)
        ));
        s.encode_data(OpCode::Text, true, BytesMut::from("c")).unwrap();

        // After the final fragment a new message may start.
        s.encode_data(OpCode::Binary, true, BytesMut::from("d")).unwrap();
    }

    #[test]
    fn outgoing_continuation_wire_opcode() {
        // Use a server session so output is unmasked and inspectable.
        let mut s = Session::new(Role::Server, 1024, Vec::new());
        let first = s.encode_data(OpCode::Text, false, BytesMut::from("a")).unwrap();
        let second = s.encode_data(OpCode::Text, true, BytesMut::from("b")).unwrap();

        assert_eq!(first[0] & 0x0f, 0x1); // text
        assert_eq!(first[0] & 0x80, 0); // no FIN
        assert_eq!(second[0] & 0x0f, 0x0); // continuation
        assert_eq!(second[0] & 0x80, 0x80); // FIN
    }

    #[test]
    fn control_frame_size_checked_on_send() {
        let mut s = session();
        assert!(matches!(
            s.encode_control(Frame::ping(vec![0u8; 126])),
            Err(WsError::ControlFrameTooLarge)
        ));
        s.encode_control(Frame::ping(vec![0u8; 125])).unwrap();
    }

    #[test]
    fn rsv1_requires_claiming_extension() {
        struct Passthrough;
        impl Extension for Passthrough {
            fn name(&self) -> &str {
                "passthrough"
            }
            fn claims_rsv1(&self) -> bool {
                true
            }
        }

        let mut frame = Frame::text("tagged");
        frame.rsv1 = true;
        let wire = server_bytes(vec![frame]);

        let mut plain = session();
        assert!(matches!(
            plain.receive(&wire),
            Err(WsError::ReservedBitsNotZero)
        ));

        let mut s = Session::new(Role::Client, 1024, vec![Box::new(Passthrough)]);
        let events = s.receive(&wire).unwrap();
        assert!(matches!(&events[0], SessionEvent::Text(t) if t == "tagged"));
    }

    #[test]
    fn close_code_mapping() {
        let frame = Session::close_frame_for(&WsError::FrameTooLarge);
        assert_eq!(frame.close_code(), Some(CloseCode::Size));

        let frame = Session::close_frame_for(&WsError::InvalidContinuationFrame);
        assert_eq!(frame.close_code(), Some(CloseCode::Protocol));

        let frame = Session::close_frame_for(&WsError::InvalidUtf8);
        assert_eq!(frame.close_code(), Some(CloseCode::Invalid));

        let frame = Session::close_frame_for(&WsError::ConnectionClosed);
        assert_eq!(frame.close_code(), Some(CloseCode::Error));
    }
}
