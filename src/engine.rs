//! Client handshake engine.
//!
//! [`ClientEngine`] owns the HTTP side of connection establishment: it
//! creates upgrade requests and interprets responses, deciding whether the
//! connection is established, another request must be sent (authentication
//! challenge or redirect), the attempt should be retried later, or the
//! handshake has failed for good. The engine survives across connection
//! attempts so redirect and retry budgets span the whole chain.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use http::header::{self, HeaderValue};
use http::StatusCode;
use log::debug;
use sha1::{Digest, Sha1};
use url::Url;

use crate::config::ClientConfig;
use crate::extensions::{self, ExtensionDecl};
use crate::http::{UpgradeRequest, UpgradeResponse};
use crate::{Result, WsError};

/// GUID from RFC 6455 section 1.3, mixed into the accept key.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Where the engine stands in the handshake exchange.
#[derive(Debug)]
enum EngineState {
    /// No response processed yet, or following a redirect.
    Init,
    /// A 401 was answered; the next response decides.
    InProgress(AuthContext),
    /// The upgrade succeeded. Terminal.
    Success,
    /// The handshake failed. Terminal.
    Failed,
}

/// Challenge the engine is currently answering.
#[derive(Debug)]
struct AuthContext {
    scheme: String,
    challenge: String,
}

/// What the caller should do with the connection attempt.
#[derive(Debug)]
pub enum UpgradeOutcome {
    /// The server switched protocols; frame traffic may begin.
    Upgraded(Negotiation),
    /// Close this connection and send a fresh upgrade request (possibly to
    /// a new target after a redirect).
    AnotherRequestRequired,
    /// Close this connection and try again after the delay.
    RetryAfter(Duration),
}

/// Parameters agreed during a successful upgrade.
#[derive(Debug, Default)]
pub struct Negotiation {
    /// Sub-protocol the server selected from the client's offers.
    pub subprotocol: Option<String>,
    /// Extensions the server accepted, in response order.
    pub extensions: Vec<ExtensionDecl>,
}

/// Handshake state machine for one logical connect call.
pub struct ClientEngine {
    config: ClientConfig,
    state: EngineState,
    /// Current target; redirects replace it.
    url: Url,
    /// Key sent in the last upgrade request.
    sec_key: String,
    /// Targets already tried in this handshake chain.
    visited: HashSet<String>,
    redirect_count: usize,
    retry_count: usize,
    /// Guards the one-request-per-exchange contract.
    request_pending: bool,
}

impl std::fmt::Debug for ClientEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEngine")
            .field("state", &self.state)
            .field("url", &self.url)
            .field("redirect_count", &self.redirect_count)
            .field("retry_count", &self.retry_count)
            .field("request_pending", &self.request_pending)
            .finish_non_exhaustive()
    }
}

impl ClientEngine {
    /// Creates an engine for `url`. Only `ws` and `wss` schemes are valid.
    pub fn new(url: Url, config: ClientConfig) -> Result<Self> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WsError::InvalidHttpScheme);
        }
        let mut visited = HashSet::new();
        visited.insert(url.to_string());
        Ok(Self {
            config,
            state: EngineState::Init,
            url,
            sec_key: String::new(),
            visited,
            redirect_count: 0,
            retry_count: 0,
            request_pending: false,
        })
    }

    /// Current target, updated by redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds the next upgrade request.
    ///
    /// May be called once per exchange: again only after
    /// [`process_response`](Self::process_response) asked for another
    /// request, and never after the engine reached a terminal state.
    pub fn create_upgrade_request(&mut self) -> Result<UpgradeRequest> {
        match self.state {
            EngineState::Success | EngineState::Failed => {
                return Err(WsError::IllegalState(
                    "handshake already finished, cannot create another request",
                ));
            }
            _ if self.request_pending => {
                return Err(WsError::IllegalState(
                    "upgrade request already created for this exchange",
                ));
            }
            _ => {}
        }

        self.sec_key = generate_key();

        let mut request = UpgradeRequest::new(self.url.clone());
        request.append_header(header::HOST, host_header(&self.url)?);
        request.append_header(header::UPGRADE, HeaderValue::from_static("websocket"));
        request.append_header(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        request.append_header(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_str(&self.sec_key)?,
        );
        request.append_header(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static("13"),
        );

        if !self.config.subprotocols.is_empty() {
            request.append_header(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&self.config.subprotocols.join(", "))?,
            );
        }
        if !self.config.extensions.is_empty() {
            request.append_header(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_str(&extensions::format_list(&self.config.extension_decls()))?,
            );
        }
        for (name, value) in self.config.headers.iter() {
            request.append_header(name.clone(), value.clone());
        }

        if let EngineState::InProgress(auth) = &self.state {
            let authenticator = self
                .config
                .authenticators
                .get(&auth.scheme)
                .ok_or_else(|| {
                    WsError::Authentication(format!("no authenticator for scheme {}", auth.scheme))
                })?;
            let credentials = self.config.credentials.as_ref().ok_or_else(|| {
                WsError::Authentication("credentials required but not configured".into())
            })?;
            let value = authenticator.generate(&self.url, &auth.challenge, credentials)?;
            request.append_header(header::AUTHORIZATION, HeaderValue::from_str(&value)?);
        }

        self.request_pending = true;
        Ok(request)
    }

    /// Interprets a handshake response and advances the state machine.
    pub fn process_response(&mut self, response: &UpgradeResponse) -> Result<UpgradeOutcome> {
        if matches!(self.state, EngineState::Success | EngineState::Failed) {
            return Err(WsError::IllegalState(
                "handshake already finished, cannot process a response",
            ));
        }

        match response.status {
            StatusCode::SWITCHING_PROTOCOLS => {
                let negotiation = self.verify_upgrade(response)?;
                debug!(
                    "upgrade accepted by {} (subprotocol: {:?})",
                    self.url, negotiation.subprotocol
                );
                self.state = EngineState::Success;
                Ok(UpgradeOutcome::Upgraded(negotiation))
            }
            StatusCode::UNAUTHORIZED => self.on_unauthorized(response),
            status if status.is_redirection() => self.on_redirect(response),
            StatusCode::SERVICE_UNAVAILABLE => self.on_service_unavailable(response),
            status => {
                self.state = EngineState::Failed;
                Err(WsError::InvalidResponseCode(status.as_u16()))
            }
        }
    }

    /// Validates a 101 reply per RFC 6455 section 4.1.
    fn verify_upgrade(&mut self, response: &UpgradeResponse) -> Result<Negotiation> {
        let fail = |msg: String| -> WsError {
            WsError::Handshake(msg)
        };

        let upgrade = response.header_str(&header::UPGRADE).unwrap_or_default();
        if !upgrade.eq_ignore_ascii_case("websocket") {
            self.state = EngineState::Failed;
            return Err(fail(format!("invalid Upgrade header: {upgrade:?}")));
        }

        let connection = response.header_str(&header::CONNECTION).unwrap_or_default();
        let has_upgrade_token = connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        if !has_upgrade_token {
            self.state = EngineState::Failed;
            return Err(fail(format!("invalid Connection header: {connection:?}")));
        }

        let accept = response
            .header_str(&header::SEC_WEBSOCKET_ACCEPT)
            .unwrap_or_default();
        let expected = accept_key(&self.sec_key);
        if accept != expected {
            self.state = EngineState::Failed;
            return Err(fail("Sec-WebSocket-Accept mismatch".into()));
        }

        let subprotocol = match response.header_str(&header::SEC_WEBSOCKET_PROTOCOL) {
            Some(agreed) => {
                let offered = self
                    .config
                    .subprotocols
                    .iter()
                    .any(|offer| offer.eq_ignore_ascii_case(agreed));
                if !offered {
                    self.state = EngineState::Failed;
                    return Err(fail(format!("server chose unoffered subprotocol {agreed:?}")));
                }
                Some(agreed.to_string())
            }
            None => None,
        };

        let extensions = match response.header_str(&header::SEC_WEBSOCKET_EXTENSIONS) {
            Some(value) => {
                let accepted = ExtensionDecl::parse_list(value).map_err(|err| {
                    self.state = EngineState::Failed;
                    WsError::Handshake(format!("bad Sec-WebSocket-Extensions header: {err}"))
                })?;
                extensions::match_response(&self.config.extension_decls(), &accepted).map_err(|name| {
                    self.state = EngineState::Failed;
                    WsError::Handshake(format!("server accepted unoffered extension {name:?}"))
                })?
            }
            None => Vec::new(),
        };

        Ok(Negotiation {
            subprotocol,
            extensions,
        })
    }

    fn on_unauthorized(&mut self, response: &UpgradeResponse) -> Result<UpgradeOutcome> {
        if matches!(self.state, EngineState::InProgress(_)) {
            self.state = EngineState::Failed;
            return Err(WsError::Authentication(
                "authentication rejected by server".into(),
            ));
        }

        let challenge = response
            .header_str(&header::WWW_AUTHENTICATE)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                self.state = EngineState::Failed;
                WsError::Authentication("401 without WWW-Authenticate header".into())
            })?
            .to_string();

        let scheme = challenge
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if self.config.authenticators.get(&scheme).is_none() {
            self.state = EngineState::Failed;
            return Err(WsError::Authentication(format!(
                "no authenticator for scheme {scheme:?}"
            )));
        }
        if self.config.credentials.is_none() {
            self.state = EngineState::Failed;
            return Err(WsError::Authentication(
                "credentials required but not configured".into(),
            ));
        }

        debug!("answering {scheme} challenge from {}", self.url);
        self.state = EngineState::InProgress(AuthContext { scheme, challenge });
        self.request_pending = false;
        Ok(UpgradeOutcome::AnotherRequestRequired)
    }

    fn on_redirect(&mut self, response: &UpgradeResponse) -> Result<UpgradeOutcome> {
        if !self.config.follow_redirects || self.config.max_redirects == 0 {
            self.state = EngineState::Failed;
            return Err(WsError::Redirect("redirect support is disabled".into()));
        }

        let location = response.header_str(&header::LOCATION).ok_or_else(|| {
            self.state = EngineState::Failed;
            WsError::Redirect("redirect without Location header".into())
        })?;

        // Location may be relative; resolve against the current target.
        let mut target = self.url.join(location).map_err(|err| {
            self.state = EngineState::Failed;
            WsError::Redirect(format!("invalid Location {location:?}: {err}"))
        })?;

        let scheme = match target.scheme() {
            "ws" | "wss" => None,
            "http" => Some("ws"),
            "https" => Some("wss"),
            other => {
                self.state = EngineState::Failed;
                return Err(WsError::Redirect(format!(
                    "unsupported redirect scheme {other:?}"
                )));
            }
        };
        if let Some(scheme) = scheme {
            // Cannot fail for ws/wss over http(s) URLs.
            let _ = target.set_scheme(scheme);
        }
        if self.redirect_count >= self.config.max_redirects {
            self.state = EngineState::Failed;
            return Err(WsError::Redirect(format!(
                "redirect threshold of {} exceeded",
                self.config.max_redirects
            )));
        }
        if !self.visited.insert(target.to_string()) {
            self.state = EngineState::Failed;
            return Err(WsError::Redirect(format!("redirect loop via {target}")));
        }

        debug!("redirected from {} to {target}", self.url);
        self.redirect_count += 1;
        self.url = target;
        // Auth context does not carry over to a new target.
        self.state = EngineState::Init;
        self.request_pending = false;
        Ok(UpgradeOutcome::AnotherRequestRequired)
    }

    fn on_service_unavailable(&mut self, response: &UpgradeResponse) -> Result<UpgradeOutcome> {
        let delay = response
            .header_str(&header::RETRY_AFTER)
            .and_then(parse_retry_after);

        if !self.config.retry_after_enabled {
            self.state = EngineState::Failed;
            return Err(WsError::RetryAfter(delay));
        }
        let delay = match delay {
            Some(delay) if delay <= self.config.max_retry_delay => delay,
            _ => {
                self.state = EngineState::Failed;
                return Err(WsError::RetryAfter(delay));
            }
        };
        if self.retry_count >= self.config.max_retries {
            self.state = EngineState::Failed;
            return Err(WsError::RetryAfter(Some(delay)));
        }

        debug!("service unavailable, retrying {} in {delay:?}", self.url);
        self.retry_count += 1;
        self.state = EngineState::Init;
        self.request_pending = false;
        Ok(UpgradeOutcome::RetryAfter(delay))
    }
}

/// `Retry-After` is either delta-seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = httpdate::parse_http_date(value).ok()?;
    Some(
        date.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64.
pub(crate) fn generate_key() -> String {
    let bytes: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(bytes)
}

/// Computes the `Sec-WebSocket-Accept` value for `key`.
pub(crate) fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Host header value. Default ports never show up here: url parsing
/// already elides them, so an explicit port is always worth sending.
fn host_header(url: &Url) -> Result<HeaderValue> {
    let host = url
        .host_str()
        .ok_or(WsError::InvalidHttpScheme)?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(HeaderValue::from_str(&value)?)
}
