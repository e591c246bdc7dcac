//! Client configuration.
//!
//! [`ClientConfig`] gathers everything a connect call needs: timeouts,
//! buffer sizes, redirect and retry policies, credentials, sub-protocol and
//! extension offers, an optional proxy and an optional custom TLS config.
//! All knobs have defaults; the `with_*` methods are chainable.

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_rustls::rustls;

use crate::auth::{Authenticator, AuthenticatorRegistry, Credentials};
use crate::buffer;
use crate::extensions::{ExtensionDecl, ExtensionFactory, ExtensionOffer};

/// Default time allowed for the whole handshake of one attempt.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default redirect threshold.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Default `Retry-After` attempt budget.
pub const DEFAULT_MAX_RETRIES: usize = 5;

/// Default cap on an individual `Retry-After` delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Default size of each socket read buffer.
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 16 * 1024;

/// Default grace period before the idle transport pool shuts down.
pub const DEFAULT_POOL_IDLE_GRACE: Duration = Duration::from_secs(30);

/// An HTTP proxy to tunnel through with CONNECT.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy host name or address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Extra headers for the CONNECT request, e.g. `Proxy-Authorization`.
    pub headers: HeaderMap,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Configuration for [`WsClient`](crate::WsClient).
#[derive(Clone)]
pub struct ClientConfig {
    /// Per-attempt handshake deadline.
    pub handshake_timeout: Duration,
    /// Maximum size of an assembled incoming message, and the cap of the
    /// read accumulation buffer.
    pub incoming_buffer_size: usize,
    /// Size of each socket read.
    pub input_buffer_size: usize,
    /// Whether 3xx responses are followed.
    pub follow_redirects: bool,
    /// Redirect hop budget across one handshake chain. Zero disables
    /// redirect following entirely.
    pub max_redirects: usize,
    /// Whether `503 Retry-After` responses are retried.
    pub retry_after_enabled: bool,
    /// Retry attempt budget across one handshake chain.
    pub max_retries: usize,
    /// Upper bound on a single accepted retry delay.
    pub max_retry_delay: Duration,
    /// Credentials for answering 401 challenges.
    pub credentials: Option<Credentials>,
    /// Authenticators keyed by scheme; Basic and Digest by default.
    pub authenticators: AuthenticatorRegistry,
    /// Sub-protocols to offer, in preference order.
    pub subprotocols: Vec<String>,
    /// Extensions to offer, each backed by an implementation.
    pub extensions: Vec<ExtensionOffer>,
    /// Extra headers appended to every upgrade request.
    pub headers: HeaderMap,
    /// Optional HTTP proxy.
    pub proxy: Option<ProxyConfig>,
    /// Custom TLS configuration; a webpki-roots default is built otherwise.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// How long the transport pool survives without open connections.
    pub pool_idle_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            incoming_buffer_size: buffer::DEFAULT_MAX_CAPACITY,
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            retry_after_enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            credentials: None,
            authenticators: AuthenticatorRegistry::default(),
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            headers: HeaderMap::new(),
            proxy: None,
            tls: None,
            pool_idle_grace: DEFAULT_POOL_IDLE_GRACE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_incoming_buffer_size(mut self, size: usize) -> Self {
        self.incoming_buffer_size = size;
        self
    }

    pub fn with_input_buffer_size(mut self, size: usize) -> Self {
        self.input_buffer_size = size;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn with_retry_after(mut self, enabled: bool) -> Self {
        self.retry_after_enabled = enabled;
        self
    }

    pub fn with_max_retries(mut self, max: usize) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Registers an authenticator for `scheme`, overriding the built-in
    /// one if present.
    pub fn with_authenticator(
        mut self,
        scheme: impl AsRef<str>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        self.authenticators.register(scheme, authenticator);
        self
    }

    pub fn with_subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Offers an extension. The factory runs once per connection when the
    /// server accepts, receiving the declaration the server answered with.
    pub fn with_extension(mut self, decl: ExtensionDecl, factory: ExtensionFactory) -> Self {
        self.extensions.push(ExtensionOffer::new(decl, factory));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_pool_idle_grace(mut self, grace: Duration) -> Self {
        self.pool_idle_grace = grace;
        self
    }

    /// Declarations of the configured offers, for the request header and
    /// for matching the server's answer.
    pub(crate) fn extension_decls(&self) -> Vec<ExtensionDecl> {
        self.extensions.iter().map(|offer| offer.decl.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::default();
        assert!(config.follow_redirects);
        assert!(config.retry_after_enabled);
        assert_eq!(config.max_redirects, DEFAULT_MAX_REDIRECTS);
        assert_eq!(config.incoming_buffer_size, 4 * 1024 * 1024 + 11);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn builder_chain() {
        let config = ClientConfig::new()
            .with_handshake_timeout(Duration::from_secs(5))
            .with_subprotocols(["chat", "superchat"])
            .with_max_redirects(2)
            .with_proxy(ProxyConfig::new("proxy.local", 3128));

        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.subprotocols, vec!["chat", "superchat"]);
        assert_eq!(config.max_redirects, 2);
        assert_eq!(config.proxy.as_ref().unwrap().port, 3128);
    }
}
