//! HTTP/1.1 handshake messages and the incremental response parser.
//!
//! Only the small slice of HTTP the opening handshake needs is implemented:
//! serializing an upgrade (or proxy CONNECT) request, and parsing a status
//! line plus headers out of a byte stream. The parser is incremental and
//! never consumes past the blank line that ends the header section, so any
//! bytes that follow it (the first frames of a fast server) stay in the
//! input for the frame decoder.

use bytes::{Buf, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use url::Url;

use crate::buffer::GrowableBuffer;
use crate::{Result, WsError};

/// Maximum size of a response header section before parsing fails.
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

const RESPONSE_BUFFER_STEP: usize = 256;

/// An outgoing handshake request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl UpgradeRequest {
    /// A GET request for `url` with no headers yet.
    pub fn new(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header, keeping any existing values for the same name.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.headers.append(name, value);
        self
    }

    /// The request target as it appears on the request line: path plus
    /// query for GET upgrades, `host:port` for CONNECT.
    pub fn request_target(&self) -> String {
        if self.method == Method::CONNECT {
            let host = self.url.host_str().unwrap_or_default();
            let port = self.url.port_or_known_default().unwrap_or(80);
            return format!("{host}:{port}");
        }
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// Serializes the request head to wire bytes.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(self.request_target().as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// A parsed handshake response head.
#[derive(Debug)]
pub struct UpgradeResponse {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl UpgradeResponse {
    /// First value of `name`, as a string, if present and valid.
    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Scanner position inside the `\r\n\r\n` terminator.
///
/// The terminator can be split across reads at any point, so the position
/// persists between [`ResponseParser::append`] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Init,
    R,
    Rn,
    Rnr,
}

/// Incremental parser for a handshake response head.
///
/// Feed it network chunks with [`append`](Self::append); once
/// [`is_complete`](Self::is_complete) reports true, [`parse`](Self::parse)
/// yields the response and any unconsumed bytes are still in the caller's
/// buffer. [`clear`](Self::clear) resets the parser for the next response
/// on the same connection (proxy CONNECT followed by the upgrade).
#[derive(Debug)]
pub struct ResponseParser {
    buffer: GrowableBuffer,
    scan: ScanState,
    complete: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            buffer: GrowableBuffer::new(MAX_RESPONSE_SIZE, RESPONSE_BUFFER_STEP),
            scan: ScanState::Init,
            complete: false,
        }
    }

    /// Consumes bytes from `src` up to and including the header terminator.
    ///
    /// Bytes past the terminator are left in `src`; they belong to whatever
    /// comes next on the connection. Fails with
    /// [`WsError::BufferOverflow`] if the header section outgrows the
    /// internal limit.
    pub fn append(&mut self, src: &mut BytesMut) -> Result<()> {
        if self.complete || src.is_empty() {
            return Ok(());
        }

        let mut end = None;
        for (i, &byte) in src.iter().enumerate() {
            self.scan = match (self.scan, byte) {
                (ScanState::Init, b'\r') => ScanState::R,
                (ScanState::R, b'\n') => ScanState::Rn,
                (ScanState::Rn, b'\r') => ScanState::Rnr,
                (ScanState::Rnr, b'\n') => {
                    end = Some(i + 1);
                    break;
                }
                (_, b'\r') => ScanState::R,
                _ => ScanState::Init,
            };
        }

        match end {
            Some(end) => {
                self.buffer.append(&src[..end])?;
                src.advance(end);
                self.complete = true;
            }
            None => {
                self.buffer.append(src)?;
                src.clear();
            }
        }
        Ok(())
    }

    /// Whether a full header section has been buffered.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Parses the buffered header section.
    pub fn parse(&self) -> Result<UpgradeResponse> {
        if !self.complete {
            return Err(WsError::IllegalState("response head is not complete"));
        }

        let text = self.buffer.as_ref();
        let mut lines = split_crlf(text);

        let status_line = lines
            .next()
            .ok_or_else(|| WsError::MalformedStatusLine(String::new()))?;
        let status_line = std::str::from_utf8(status_line)
            .map_err(|_| WsError::MalformedStatusLine("not valid UTF-8".into()))?;

        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(line)
                .map_err(|_| WsError::MalformedResponse("header is not valid UTF-8".into()))?;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WsError::MalformedResponse(format!("header without colon: {line}")))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| WsError::MalformedResponse(format!("bad header name in: {line}")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| WsError::MalformedResponse(format!("bad header value in: {line}")))?;
            headers.append(name, value);
        }

        Ok(UpgradeResponse {
            status,
            reason,
            headers,
        })
    }

    /// Resets the parser for the next response on the same connection.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan = ScanState::Init;
        self.complete = false;
    }
}

/// Splits the status line into its code and reason phrase.
///
/// The reason phrase may be empty or contain spaces, so only the first two
/// separators matter.
fn parse_status_line(line: &str) -> Result<(StatusCode, String)> {
    let malformed = || WsError::MalformedStatusLine(line.to_string());

    let rest = line.strip_prefix("HTTP/").ok_or_else(malformed)?;
    let (_version, rest) = rest.split_once(' ').ok_or_else(malformed)?;
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        // "HTTP/1.1 200" with no reason phrase at all.
        None => (rest, ""),
    };

    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(malformed)?;

    Ok((status, reason.trim_end().to_string()))
}

fn split_crlf(text: &[u8]) -> impl Iterator<Item = &[u8]> {
    text.split(|&b| b == b'\n').map(|line| {
        line.strip_suffix(b"\r").unwrap_or(line)
    })
}
