//! Close status codes (RFC 6455 section 7.4).

/// Status code carried in the first two bytes of a close frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure, the purpose of the connection was fulfilled.
    Normal,
    /// 1001: endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: protocol error detected by the peer.
    Protocol,
    /// 1003: received a data type the endpoint cannot accept.
    Unsupported,
    /// 1005: reserved, no status code was present. Must not be sent.
    Status,
    /// 1006: reserved, connection dropped without a close frame. Must not
    /// be sent.
    Abnormal,
    /// 1007: received data inconsistent with the message type, for example
    /// invalid UTF-8 in a text message.
    Invalid,
    /// 1008: message violates the endpoint's policy.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: client expected an extension the server did not negotiate.
    Extension,
    /// 1011: server encountered an unexpected condition.
    Error,
    /// 1012: service is restarting.
    Restart,
    /// 1013: try again later, for example the server is overloaded.
    Again,
    /// 1015: reserved, TLS handshake failure. Must not be sent.
    Tls,
    /// 3000..=4999: registered and private-use codes.
    Other(u16),
    /// Anything outside the ranges defined by the RFC.
    Reserved(u16),
}

impl CloseCode {
    /// Whether this code may legally appear in a close frame on the wire.
    ///
    /// The reserved codes (1004, 1005, 1006, 1015) and anything below 1000
    /// or in the unassigned 1016..=2999 gap are not allowed.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls | CloseCode::Reserved(_)
        )
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Other(code) | CloseCode::Reserved(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            3000..=4999 => CloseCode::Other(code),
            _ => CloseCode::Reserved(code),
        }
    }
}
