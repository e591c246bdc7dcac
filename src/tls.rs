//! TLS filter.
//!
//! Drives a `rustls::ClientConnection` without owning any I/O: ciphertext
//! moves through the neighbouring filters and this one translates. The
//! filter starts in passthrough, so a chain can carry the proxy CONNECT
//! exchange in the clear and secure itself afterwards with `start_tls`.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConnection, RootCertStore};

use crate::filter::{with_upstream, Filter, WriteDone};
use crate::{Result, WsError};

/// WebPKI roots with no client auth; the stock browser-like setup.
pub(crate) fn default_tls_config() -> Arc<tokio_rustls::rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

enum TlsState {
    /// Bytes pass through untouched. Before `start_tls`.
    Passthrough,
    Handshaking(Box<ClientConnection>),
    Active(Box<ClientConnection>),
}

pub(crate) struct TlsFilter {
    downstream: Arc<dyn Filter>,
    upstream: Mutex<Option<Weak<dyn Filter>>>,
    config: Arc<tokio_rustls::rustls::ClientConfig>,
    server_name: ServerName<'static>,
    state: Mutex<TlsState>,
    me: Weak<TlsFilter>,
}

impl TlsFilter {
    pub(crate) fn new(
        downstream: Arc<dyn Filter>,
        config: Arc<tokio_rustls::rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            downstream,
            upstream: Mutex::new(None),
            config,
            server_name,
            state: Mutex::new(TlsState::Passthrough),
            me: me.clone(),
        })
    }

    fn upstream(&self) -> Weak<dyn Filter> {
        self.upstream
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Weak::<Self>::new() as Weak<dyn Filter>)
    }

    /// Flushes pending TLS records downstream and reports handshake
    /// completion the first time the connection leaves the handshake.
    fn pump(&self) {
        let mut out = Vec::new();
        let mut completed = false;
        {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                TlsState::Passthrough => return,
                TlsState::Handshaking(conn) | TlsState::Active(conn) => {
                    while conn.wants_write() {
                        if let Err(err) = conn.write_tls(&mut out) {
                            debug!("tls write failed: {err}");
                            break;
                        }
                    }
                }
            }
            if matches!(&*state, TlsState::Handshaking(conn) if !conn.is_handshaking()) {
                if let TlsState::Handshaking(conn) =
                    std::mem::replace(&mut *state, TlsState::Passthrough)
                {
                    *state = TlsState::Active(conn);
                    completed = true;
                }
            }
        }

        if !out.is_empty() {
            trace!("tls pump flushing {} bytes", out.len());
            let me = self.me.clone();
            self.downstream.write(
                Bytes::from(out),
                Box::new(move |result| {
                    if let Some(me) = me.upgrade() {
                        match result {
                            Ok(()) => me.pump(),
                            Err(err) => me.fail(err),
                        }
                    }
                }),
            );
        }
        if completed {
            debug!("tls handshake completed");
            with_upstream(&self.upstream(), |up| up.on_tls_handshake_completed());
        }
    }

    fn fail(&self, err: WsError) {
        with_upstream(&self.upstream(), |up| up.on_error(err));
        self.downstream.close();
    }
}

impl Filter for TlsFilter {
    fn connect(&self, addr: &str, upstream: Weak<dyn Filter>) -> Result<()> {
        *self.upstream.lock().unwrap() = Some(upstream);
        self.downstream
            .connect(addr, self.me.clone() as Weak<dyn Filter>)
    }

    fn write(&self, data: Bytes, done: WriteDone) {
        let out = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                TlsState::Passthrough => {
                    drop(state);
                    self.downstream.write(data, done);
                    return;
                }
                TlsState::Handshaking(_) => {
                    done(Err(WsError::IllegalState(
                        "write during tls handshake",
                    )));
                    return;
                }
                TlsState::Active(conn) => {
                    let result = conn.writer().write_all(&data);
                    if let Err(err) = result {
                        done(Err(err.into()));
                        return;
                    }
                    let mut out = Vec::new();
                    while conn.wants_write() {
                        if let Err(err) = conn.write_tls(&mut out) {
                            done(Err(err.into()));
                            return;
                        }
                    }
                    out
                }
            }
        };
        self.downstream.write(Bytes::from(out), done);
    }

    fn close(&self) {
        let out = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                TlsState::Passthrough => Vec::new(),
                TlsState::Handshaking(conn) | TlsState::Active(conn) => {
                    conn.send_close_notify();
                    let mut out = Vec::new();
                    while conn.wants_write() {
                        if conn.write_tls(&mut out).is_err() {
                            break;
                        }
                    }
                    out
                }
            }
        };
        if out.is_empty() {
            self.downstream.close();
            return;
        }
        let downstream = self.downstream.clone();
        self.downstream.write(
            Bytes::from(out),
            Box::new(move |_| downstream.close()),
        );
    }

    fn start_tls(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(&*state, TlsState::Passthrough) {
                return;
            }
            let conn = match ClientConnection::new(self.config.clone(), self.server_name.clone()) {
                Ok(conn) => conn,
                Err(err) => {
                    drop(state);
                    self.fail(err.into());
                    return;
                }
            };
            *state = TlsState::Handshaking(Box::new(conn));
        }
        self.pump();
    }

    fn on_connect(&self) {
        with_upstream(&self.upstream(), |up| up.on_connect());
    }

    fn on_read(&self, data: BytesMut) {
        let plain = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                TlsState::Passthrough => {
                    drop(state);
                    with_upstream(&self.upstream(), |up| up.on_read(data));
                    return;
                }
                TlsState::Handshaking(conn) | TlsState::Active(conn) => {
                    let mut ciphertext = &data[..];
                    let mut plain = BytesMut::new();
                    while !ciphertext.is_empty() {
                        match conn.read_tls(&mut ciphertext) {
                            Ok(0) => break,
                            Ok(_) => {}
                            Err(err) => {
                                drop(state);
                                self.fail(err.into());
                                return;
                            }
                        }
                        if let Err(err) = conn.process_new_packets() {
                            drop(state);
                            self.fail(err.into());
                            return;
                        }
                        let mut chunk = [0u8; 4096];
                        loop {
                            match conn.reader().read(&mut chunk) {
                                Ok(0) => break,
                                Ok(n) => plain.extend_from_slice(&chunk[..n]),
                                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                                Err(err)
                                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                                {
                                    break
                                }
                                Err(err) => {
                                    drop(state);
                                    self.fail(err.into());
                                    return;
                                }
                            }
                        }
                    }
                    plain
                }
            }
        };

        // Answer any handshake records first, then surface plaintext.
        self.pump();
        if !plain.is_empty() {
            with_upstream(&self.upstream(), |up| up.on_read(plain));
        }
    }

    fn on_connection_closed(&self) {
        with_upstream(&self.upstream(), |up| up.on_connection_closed());
    }

    fn on_tls_handshake_completed(&self) {
        // The transport acks start_tls it never saw a TLS filter for; this
        // filter produces its own completion from pump().
    }

    fn on_error(&self, err: WsError) {
        with_upstream(&self.upstream(), |up| up.on_error(err));
    }
}
