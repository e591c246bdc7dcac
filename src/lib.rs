//! # wspipe
//! Client-side implementation of the WebSocket protocol (RFC 6455): a frame
//! codec with automatic masking and fragmentation handling, an incremental
//! HTTP/1.1 handshake parser, and a filter-chain connection pipeline with
//! plain-TCP and TLS transports.
//!
//! The crate is organized in two layers:
//!
//! - **Protocol**: [`frame`], [`codec`], [`close`], [`utf8`] and [`buffer`]
//!   implement the wire format. The decoder is resumable and never consumes
//!   bytes of an incomplete frame, so it can sit directly on top of socket
//!   reads of arbitrary sizes.
//! - **Pipeline**: [`filter::Filter`] is the seam between the transport, the
//!   TLS layer, the serializing write queue and the handshake driver. Each
//!   filter owns its downstream neighbor; events travel back up through weak
//!   references so dropping a connection tears the chain down cleanly.
//!
//! The handshake itself is a state machine ([`engine::ClientEngine`]) that
//! knows how to answer `401` challenges (Basic and Digest out of the box),
//! follow `3xx` redirects with cycle detection, and honor `503 Retry-After`
//! backoff before handing the socket over to the frame session.
//!
//! ## Client example
//! ```no_run
//! use std::sync::Arc;
//! use wspipe::{ClientConfig, Message, MessageHandler, WsClient};
//!
//! struct Echo;
//!
//! impl MessageHandler for Echo {
//!     fn on_message(&self, msg: Message) {
//!         println!("got {msg:?}");
//!     }
//! }
//!
//! async fn run() -> wspipe::Result<()> {
//!     let client = WsClient::new(ClientConfig::default());
//!     let conn = client
//!         .connect("wss://echo.websocket.org".parse()?, Arc::new(Echo))
//!         .await?;
//!     conn.send_text("hello").await?;
//!     conn.close(wspipe::close::CloseCode::Normal, "done").await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod buffer;
pub mod client;
pub mod close;
pub mod codec;
pub mod config;
pub mod engine;
pub mod extensions;
pub mod filter;
pub mod frame;
pub mod http;
pub mod session;
pub mod transport;
pub mod utf8;

mod mask;
mod queue;
mod tls;

pub use client::{Connection, Message, MessageHandler, WsClient};
pub use codec::Role;
pub use config::{ClientConfig, ProxyConfig};
pub use engine::Negotiation;
pub use extensions::{Extension, ExtensionDecl, ExtensionFactory, ExtensionOffer};
pub use frame::{Frame, OpCode};
pub use http::{UpgradeRequest, UpgradeResponse};

/// Result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, WsError>;

/// Errors that can occur during WebSocket connection establishment and
/// frame processing.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum WsError {
    /// Occurs when a frame declares a different data opcode while a
    /// fragmented message of another type is still in progress.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when a continuation frame arrives without a fragmented
    /// message being in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a text message contains invalid UTF-8 data, or ended
    /// in the middle of a multi-byte character.
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// Indicates that a received close frame is malformed, for example a
    /// one-byte payload that cannot carry a close code.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame carries a code outside the ranges allowed
    /// by RFC 6455 section 7.4.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Indicates that reserved bits in the frame header are set without an
    /// extension having claimed them.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with
    /// the FIN bit not set. RFC 6455 forbids fragmented control frames.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Indicates that a control frame payload exceeds the 125-byte limit.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a frame's payload length exceeds the configured maximum,
    /// or an assembled message outgrows the incoming buffer.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Indicates receipt of a frame with an opcode value not defined by
    /// RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Occurs when a 64-bit payload length has its most significant bit
    /// set, which RFC 6455 forbids.
    #[error("Invalid payload length")]
    InvalidPayloadLength,

    /// Indicates a frame masked in the wrong direction: servers must never
    /// mask, clients always must.
    #[error("Frame masked in the wrong direction")]
    UnexpectedMask,

    /// Occurs when appending data would grow a buffer beyond its configured
    /// maximum capacity.
    #[error("Buffer overflow: capacity limit {0} exceeded")]
    BufferOverflow(usize),

    /// Indicates that the HTTP status line of a handshake response could
    /// not be parsed.
    #[error("Malformed status line: {0}")]
    MalformedStatusLine(String),

    /// Indicates a handshake response that is structurally invalid beyond
    /// the status line, such as a garbled header field.
    #[error("Malformed handshake response: {0}")]
    MalformedResponse(String),

    /// Occurs when the server's 101 reply fails validation, for example a
    /// wrong `Sec-WebSocket-Accept` value or a missing `Upgrade` header.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Occurs when HTTP authentication cannot be completed, for example
    /// repeated 401 responses or missing credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Occurs when a redirect cannot be followed, for example a missing
    /// `Location` header, a redirect loop, or too many hops.
    #[error("Redirect failed: {0}")]
    Redirect(String),

    /// Returned for a `503 Service Unavailable` response whose `Retry-After`
    /// could not be honored, carrying the parsed delay when there was one.
    #[error("Service unavailable (retry after {0:?})")]
    RetryAfter(Option<std::time::Duration>),

    /// Indicates a handshake response status the client cannot act on.
    #[error("Invalid response code: {0}")]
    InvalidResponseCode(u16),

    /// Occurs when an operation is attempted in a state that does not allow
    /// it, such as creating two upgrade requests for one exchange.
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// Indicates that the handshake did not complete within the configured
    /// timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Occurs when an operation is attempted on a closed connection, or
    /// when a queued write is cancelled by a close.
    #[error("Connection has been closed")]
    ConnectionClosed,

    /// Returned when attempting to establish a connection with an invalid
    /// URL scheme. Only `ws://` and `wss://` are valid.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// Indicates a proxy that refused the CONNECT tunnel.
    #[error("Proxy tunnel failed with status {0}")]
    ProxyHandshake(u16),

    /// Wraps errors from URL parsing that may occur when processing
    /// WebSocket URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors such as connection resets or refused
    /// connections.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps TLS errors from rustls, both configuration and protocol level.
    #[error(transparent)]
    TlsError(#[from] tokio_rustls::rustls::Error),

    /// Wraps invalid header names or values produced while building
    /// handshake messages.
    #[error(transparent)]
    HttpError(#[from] ::http::Error),
}

impl From<::http::header::InvalidHeaderValue> for WsError {
    fn from(err: ::http::header::InvalidHeaderValue) -> Self {
        WsError::HttpError(err.into())
    }
}

impl From<::http::header::InvalidHeaderName> for WsError {
    fn from(err: ::http::header::InvalidHeaderName) -> Self {
        WsError::HttpError(err.into())
    }
}
