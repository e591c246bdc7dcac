//! HTTP authentication for handshake `401` challenges.
//!
//! An [`Authenticator`] turns a `WWW-Authenticate` challenge plus the
//! configured [`Credentials`] into an `Authorization` header value. Basic
//! (RFC 7617) and Digest (RFC 2617) are registered by default; callers can
//! override a scheme or add their own through
//! [`AuthConfig`](crate::config::ClientConfig::with_authenticator).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::prelude::{Engine, BASE64_STANDARD};
use md5::{Digest as _, Md5};
use url::Url;

use crate::{Result, WsError};

/// Username and password for HTTP authentication.
///
/// The password is kept as raw bytes; RFC 2617 hashes it without assuming
/// a text encoding.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Vec<u8>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the password.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Produces `Authorization` header values for one authentication scheme.
pub trait Authenticator: Send + Sync {
    /// Generates the header value for a challenge.
    ///
    /// `challenge` is the full `WWW-Authenticate` value including the
    /// scheme token; `url` is the request target the authorization covers.
    fn generate(&self, url: &Url, challenge: &str, credentials: &Credentials) -> Result<String>;
}

/// Registry of authenticators keyed by lowercase scheme name.
#[derive(Clone)]
pub struct AuthenticatorRegistry {
    schemes: HashMap<String, Arc<dyn Authenticator>>,
}

impl Default for AuthenticatorRegistry {
    fn default() -> Self {
        let mut schemes: HashMap<String, Arc<dyn Authenticator>> = HashMap::new();
        schemes.insert("basic".into(), Arc::new(BasicAuthenticator));
        schemes.insert("digest".into(), Arc::new(DigestAuthenticator::new()));
        Self { schemes }
    }
}

impl AuthenticatorRegistry {
    /// Registers `authenticator` for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: impl AsRef<str>, authenticator: Arc<dyn Authenticator>) {
        self.schemes
            .insert(scheme.as_ref().to_ascii_lowercase(), authenticator);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Authenticator>> {
        self.schemes.get(&scheme.to_ascii_lowercase()).cloned()
    }
}

/// Basic access authentication (RFC 7617).
pub struct BasicAuthenticator;

impl Authenticator for BasicAuthenticator {
    fn generate(&self, _url: &Url, _challenge: &str, credentials: &Credentials) -> Result<String> {
        let mut raw = Vec::with_capacity(
            credentials.username().len() + credentials.password().len() + 1,
        );
        raw.extend_from_slice(credentials.username().as_bytes());
        raw.push(b':');
        raw.extend_from_slice(credentials.password());
        Ok(format!("Basic {}", BASE64_STANDARD.encode(raw)))
    }
}

/// Digest access authentication (RFC 2617) with MD5 and MD5-sess.
pub struct DigestAuthenticator {
    nonce_counter: AtomicU64,
}

impl Default for DigestAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestAuthenticator {
    pub fn new() -> Self {
        Self {
            nonce_counter: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Default)]
struct DigestChallenge {
    realm: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    qop: Option<String>,
    algorithm: Option<String>,
}

impl DigestChallenge {
    /// Parses the parameter list after the `Digest` scheme token.
    ///
    /// Values may be quoted or bare; unknown keys are ignored.
    fn parse(params: &str) -> Self {
        let mut this = Self::default();
        let mut rest = params;
        while let Some((key, value, remaining)) = next_param(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => this.realm = Some(value.to_string()),
                "nonce" => this.nonce = Some(value.to_string()),
                "opaque" => this.opaque = Some(value.to_string()),
                "qop" => this.qop = Some(value.to_string()),
                "algorithm" => this.algorithm = Some(value.to_string()),
                _ => {}
            }
            rest = remaining;
        }
        this
    }
}

/// Scans one `key=value` or `key="value"` pair, returning the remainder.
fn next_param(input: &str) -> Option<(&str, &str, &str)> {
    let input = input.trim_start_matches([' ', '\t', ',']);
    let eq = input.find('=')?;
    let key = input[..eq].trim();
    let rest = &input[eq + 1..];
    if let Some(rest) = rest.strip_prefix('"') {
        let end = rest.find('"')?;
        Some((key, &rest[..end], &rest[end + 1..]))
    } else {
        let end = rest.find(',').unwrap_or(rest.len());
        Some((key, rest[..end].trim(), &rest[end..]))
    }
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl Authenticator for DigestAuthenticator {
    fn generate(&self, url: &Url, challenge: &str, credentials: &Credentials) -> Result<String> {
        let params = challenge
            .trim()
            .split_once(char::is_whitespace)
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("digest"))
            .map(|(_, params)| params)
            .ok_or_else(|| WsError::Authentication("malformed digest challenge".into()))?;

        let challenge = DigestChallenge::parse(params);
        let realm = challenge.realm.unwrap_or_default();
        let nonce = challenge
            .nonce
            .ok_or_else(|| WsError::Authentication("digest challenge without nonce".into()))?;
        let algorithm = challenge.algorithm.as_deref().unwrap_or("MD5");
        let uri = url.as_str();

        let ha1 = {
            let base = md5_hex(&[
                credentials.username().as_bytes(),
                realm.as_bytes(),
                credentials.password(),
            ]);
            if algorithm.eq_ignore_ascii_case("md5-sess") {
                md5_hex(&[base.as_bytes()])
            } else {
                base
            }
        };
        let ha2 = md5_hex(&[b"GET", uri.as_bytes()]);

        let mut header = String::with_capacity(128);
        header.push_str("Digest ");
        push_param(&mut header, "username", credentials.username(), true);
        push_param(&mut header, "realm", &realm, true);
        push_param(&mut header, "nonce", &nonce, true);
        if let Some(opaque) = &challenge.opaque {
            push_param(&mut header, "opaque", opaque, true);
        }
        push_param(&mut header, "algorithm", algorithm, false);
        push_param(&mut header, "uri", uri, true);

        let response = match &challenge.qop {
            // qop=auth adds the client nonce and request counter.
            Some(qop) => {
                let cnonce: [u8; 4] = rand::random();
                let cnonce = hex(&cnonce);
                let nc = format!("{:08x}", self.nonce_counter.fetch_add(1, Ordering::Relaxed) + 1);
                push_param(&mut header, "qop", qop, false);
                push_param(&mut header, "cnonce", &cnonce, true);
                push_param(&mut header, "nc", &nc, false);
                md5_hex(&[
                    ha1.as_bytes(),
                    nonce.as_bytes(),
                    nc.as_bytes(),
                    cnonce.as_bytes(),
                    qop.as_bytes(),
                    ha2.as_bytes(),
                ])
            }
            None => md5_hex(&[ha1.as_bytes(), nonce.as_bytes(), ha2.as_bytes()]),
        };
        push_param(&mut header, "response", &response, true);

        Ok(header)
    }
}

fn push_param(out: &mut String, key: &str, value: &str, quoted: bool) {
    if !out.ends_with(' ') {
        out.push_str(", ");
    }
    out.push_str(key);
    out.push('=');
    if quoted {
        out.push('"');
        out.push_str(value);
        out.push('"');
    } else {
        out.push_str(value);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
