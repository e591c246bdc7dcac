//! WebSocket client: handshake driver, connection handle, message dispatch.
//!
//! [`WsClient::connect`] builds a fresh filter chain per attempt
//! (`handshake -> queue [-> tls] -> transport`), drives the handshake
//! engine over it and loops on redirects, auth challenges and
//! `Retry-After` backoff until the server switches protocols. The
//! resulting [`Connection`] encodes outgoing frames through the session
//! and pushes them into the write queue; incoming bytes flow up the chain
//! into the session and out to the [`MessageHandler`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderName, HeaderValue};
use http::Method;
use log::{debug, trace, warn};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use url::Url;

use crate::close::CloseCode;
use crate::codec::Role;
use crate::config::{ClientConfig, ProxyConfig};
use crate::engine::{ClientEngine, Negotiation, UpgradeOutcome};
use crate::extensions::{Extension, ExtensionDecl};
use crate::filter::{Filter, WriteDone};
use crate::frame::{Frame, OpCode};
use crate::http::{ResponseParser, UpgradeRequest};
use crate::queue::WriteQueueFilter;
use crate::session::{Session, SessionEvent};
use crate::tls::{default_tls_config, TlsFilter};
use crate::transport::{TransportFilter, TransportPool};
use crate::{Result, WsError};

/// A complete incoming data message.
#[derive(Debug, Clone)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Receives everything a connection produces. Callbacks run on the
/// transport runtime; keep them short or hand the work off.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: Message);

    fn on_ping(&self, payload: Bytes) {
        let _ = payload;
    }

    fn on_pong(&self, payload: Bytes) {
        let _ = payload;
    }

    /// The peer started (or answered) the closing handshake.
    fn on_close(&self, code: Option<CloseCode>, reason: String) {
        let _ = (code, reason);
    }

    /// A protocol violation or transport failure ended the connection.
    fn on_error(&self, err: WsError) {
        let _ = err;
    }
}

/// WebSocket client over a shared transport pool.
///
/// Cheap to keep around; every [`connect`](Self::connect) call reuses the
/// pool runtime, which shuts down after the configured idle grace once the
/// last connection is gone.
pub struct WsClient {
    config: ClientConfig,
    pool: Arc<TransportPool>,
}

impl WsClient {
    pub fn new(config: ClientConfig) -> Self {
        let pool = TransportPool::new(config.pool_idle_grace);
        Self { config, pool }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to `url` and runs the opening handshake to completion,
    /// following redirects, answering auth challenges and honoring
    /// `Retry-After` within the configured budgets.
    pub async fn connect(&self, url: Url, handler: Arc<dyn MessageHandler>) -> Result<Connection> {
        let engine = Arc::new(Mutex::new(ClientEngine::new(url, self.config.clone())?));

        loop {
            let (request, target) = {
                let mut engine = engine.lock().unwrap();
                let request = engine.create_upgrade_request()?;
                (request, engine.url().clone())
            };
            debug!("connecting to {target}");

            let (chain, rx) = self.build_chain(&target, request, engine.clone(), handler.clone())?;
            let addr = match &self.config.proxy {
                Some(proxy) => format!("{}:{}", proxy.host, proxy.port),
                None => target_addr(&target)?,
            };
            chain.connect(&addr, Weak::<HandshakeFilter>::new() as Weak<dyn Filter>)?;

            let outcome = match tokio::time::timeout(self.config.handshake_timeout, rx).await {
                Err(_) => {
                    chain.close();
                    return Err(WsError::HandshakeTimeout);
                }
                Ok(Err(_)) => return Err(WsError::ConnectionClosed),
                Ok(Ok(outcome)) => outcome,
            };

            match outcome {
                Ok(AttemptOutcome::Upgraded(core)) => {
                    return Ok(Connection {
                        core,
                        _chain: chain,
                    });
                }
                Ok(AttemptOutcome::Again) => {
                    chain.close();
                }
                Ok(AttemptOutcome::RetryAfter(delay)) => {
                    chain.close();
                    debug!("service unavailable, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    chain.close();
                    return Err(err);
                }
            }
        }
    }

    fn build_chain(
        &self,
        target: &Url,
        request: UpgradeRequest,
        engine: Arc<Mutex<ClientEngine>>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(Arc<HandshakeFilter>, oneshot::Receiver<Result<AttemptOutcome>>)> {
        let secure = target.scheme() == "wss";

        let mut downstream: Arc<dyn Filter> =
            TransportFilter::new(self.pool.clone(), self.config.input_buffer_size);
        if secure {
            let host = target
                .host_str()
                .ok_or_else(|| WsError::Handshake("url has no host".into()))?;
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| WsError::Handshake(format!("invalid server name {host}")))?;
            let tls_config = self
                .config
                .tls
                .clone()
                .unwrap_or_else(default_tls_config);
            downstream = TlsFilter::new(downstream, tls_config, server_name);
        }
        let queue = WriteQueueFilter::new(downstream);

        let (tx, rx) = oneshot::channel();
        let chain = HandshakeFilter::new(
            queue,
            engine,
            handler,
            self.config.clone(),
            request.encode().freeze(),
            target.clone(),
            secure,
            tx,
        );
        Ok((chain, rx))
    }
}

fn target_addr(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| WsError::Handshake("url has no host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or(WsError::InvalidHttpScheme)?;
    Ok(format!("{host}:{port}"))
}

enum AttemptOutcome {
    Upgraded(Arc<ConnectionCore>),
    /// Engine wants the next request on a fresh connection.
    Again,
    RetryAfter(std::time::Duration),
}

enum Phase {
    Connecting,
    /// CONNECT sent, waiting for the proxy's reply.
    ProxyConnect,
    /// Upgrade request queued, waiting for the server's reply.
    AwaitingResponse,
    Open(Arc<ConnectionCore>),
    Done,
}

/// Top of the chain for one connection attempt. Drives the HTTP exchange
/// and, once upgraded, feeds the frame session.
struct HandshakeFilter {
    downstream: Arc<dyn Filter>,
    engine: Arc<Mutex<ClientEngine>>,
    handler: Arc<dyn MessageHandler>,
    config: ClientConfig,
    request: Bytes,
    target: Url,
    secure: bool,
    parser: Mutex<ResponseParser>,
    phase: Mutex<Phase>,
    result_tx: Mutex<Option<oneshot::Sender<Result<AttemptOutcome>>>>,
    me: Weak<HandshakeFilter>,
}

impl HandshakeFilter {
    #[allow(clippy::too_many_arguments)]
    fn new(
        downstream: Arc<dyn Filter>,
        engine: Arc<Mutex<ClientEngine>>,
        handler: Arc<dyn MessageHandler>,
        config: ClientConfig,
        request: Bytes,
        target: Url,
        secure: bool,
        result_tx: oneshot::Sender<Result<AttemptOutcome>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            downstream,
            engine,
            handler,
            config,
            request,
            target,
            secure,
            parser: Mutex::new(ResponseParser::new()),
            phase: Mutex::new(Phase::Connecting),
            result_tx: Mutex::new(Some(result_tx)),
            me: me.clone(),
        })
    }

    fn finish(&self, result: Result<AttemptOutcome>) {
        if !matches!(&result, Ok(AttemptOutcome::Upgraded(_))) {
            *self.phase.lock().unwrap() = Phase::Done;
        }
        if let Some(tx) = self.result_tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }

    /// Secures the chain if needed and queues the upgrade request. The
    /// write queue holds the request back until TLS reports completion.
    fn begin_upgrade(&self) {
        *self.phase.lock().unwrap() = Phase::AwaitingResponse;
        if self.secure {
            self.downstream.start_tls();
        }
        let me = self.me.clone();
        self.downstream.write(
            self.request.clone(),
            Box::new(move |result| {
                if let (Err(err), Some(me)) = (result, me.upgrade()) {
                    me.finish(Err(err));
                }
            }),
        );
    }

    fn send_proxy_connect(&self, proxy: &ProxyConfig) {
        *self.phase.lock().unwrap() = Phase::ProxyConnect;
        let connect = match proxy_connect_request(&self.target, proxy) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.finish(Err(err));
                return;
            }
        };
        let me = self.me.clone();
        self.downstream.write(
            connect,
            Box::new(move |result| {
                if let (Err(err), Some(me)) = (result, me.upgrade()) {
                    me.finish(Err(err));
                }
            }),
        );
    }

    fn on_proxy_reply(&self, mut data: BytesMut) {
        let response = {
            let mut parser = self.parser.lock().unwrap();
            if let Err(err) = parser.append(&mut data) {
                drop(parser);
                self.finish(Err(err));
                return;
            }
            if !parser.is_complete() {
                return;
            }
            let response = parser.parse();
            parser.clear();
            response
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.finish(Err(err));
                return;
            }
        };
        if !response.status.is_success() {
            self.finish(Err(WsError::ProxyHandshake(response.status.as_u16())));
            return;
        }
        debug!("proxy tunnel to {} established", self.target);
        self.begin_upgrade();
        if !data.is_empty() {
            self.on_read(data);
        }
    }

    fn on_upgrade_reply(&self, mut data: BytesMut) {
        let response = {
            let mut parser = self.parser.lock().unwrap();
            if let Err(err) = parser.append(&mut data) {
                drop(parser);
                self.finish(Err(err));
                return;
            }
            if !parser.is_complete() {
                return;
            }
            parser.parse()
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.finish(Err(err));
                return;
            }
        };
        trace!("handshake response: {}", response.status);

        let outcome = self.engine.lock().unwrap().process_response(&response);
        match outcome {
            Ok(UpgradeOutcome::Upgraded(negotiation)) => {
                let extensions = instantiate_extensions(&self.config, &negotiation.extensions);
                let core = Arc::new(ConnectionCore {
                    queue: self.downstream.clone(),
                    session: Mutex::new(Session::new(
                        Role::Client,
                        self.config.incoming_buffer_size,
                        extensions,
                    )),
                    handler: self.handler.clone(),
                    negotiation,
                    closed: AtomicBool::new(false),
                });
                *self.phase.lock().unwrap() = Phase::Open(core.clone());
                // A fast server may have sent frames right behind the 101.
                if !data.is_empty() {
                    core.receive(data);
                }
                self.finish(Ok(AttemptOutcome::Upgraded(core)));
            }
            Ok(UpgradeOutcome::AnotherRequestRequired) => {
                self.finish(Ok(AttemptOutcome::Again));
            }
            Ok(UpgradeOutcome::RetryAfter(delay)) => {
                self.finish(Ok(AttemptOutcome::RetryAfter(delay)));
            }
            Err(err) => self.finish(Err(err)),
        }
    }
}

impl Filter for HandshakeFilter {
    fn connect(&self, addr: &str, _upstream: Weak<dyn Filter>) -> Result<()> {
        self.downstream
            .connect(addr, self.me.clone() as Weak<dyn Filter>)
    }

    fn write(&self, data: Bytes, done: WriteDone) {
        self.downstream.write(data, done);
    }

    fn close(&self) {
        self.downstream.close();
    }

    fn start_tls(&self) {
        self.downstream.start_tls();
    }

    fn on_connect(&self) {
        match &self.config.proxy {
            Some(proxy) => {
                let proxy = proxy.clone();
                self.send_proxy_connect(&proxy);
            }
            None => self.begin_upgrade(),
        }
    }

    fn on_read(&self, data: BytesMut) {
        let phase = self.phase.lock().unwrap();
        match &*phase {
            Phase::Open(core) => {
                let core = core.clone();
                drop(phase);
                core.receive(data);
            }
            Phase::ProxyConnect => {
                drop(phase);
                self.on_proxy_reply(data);
            }
            Phase::AwaitingResponse => {
                drop(phase);
                self.on_upgrade_reply(data);
            }
            Phase::Connecting | Phase::Done => {}
        }
    }

    fn on_connection_closed(&self) {
        let phase = std::mem::replace(&mut *self.phase.lock().unwrap(), Phase::Done);
        match phase {
            Phase::Open(core) => {
                if !core.closed.swap(true, Ordering::AcqRel) {
                    core.handler.on_error(WsError::ConnectionClosed);
                }
            }
            Phase::Done => {}
            _ => self.finish(Err(WsError::ConnectionClosed)),
        }
    }

    fn on_tls_handshake_completed(&self) {
        trace!("chain secured");
    }

    fn on_error(&self, err: WsError) {
        let phase = self.phase.lock().unwrap();
        match &*phase {
            Phase::Open(core) => {
                let core = core.clone();
                drop(phase);
                core.handler.on_error(err);
            }
            _ => {
                drop(phase);
                self.finish(Err(err));
            }
        }
    }
}

fn proxy_connect_request(target: &Url, proxy: &ProxyConfig) -> Result<Bytes> {
    let mut request = UpgradeRequest::new(target.clone());
    request.method = Method::CONNECT;
    let authority = request.request_target();
    request.append_header(header::HOST, HeaderValue::from_str(&authority)?);
    request.append_header(
        HeaderName::from_static("proxy-connection"),
        HeaderValue::from_static("keep-alive"),
    );
    for (name, value) in proxy.headers.iter() {
        request.append_header(name.clone(), value.clone());
    }
    Ok(request.encode().freeze())
}

/// Instantiates the offered implementations behind the declarations the
/// server accepted, in server order.
fn instantiate_extensions(
    config: &ClientConfig,
    accepted: &[ExtensionDecl],
) -> Vec<Box<dyn Extension>> {
    accepted
        .iter()
        .filter_map(|decl| {
            config
                .extensions
                .iter()
                .find(|offer| offer.decl.name == decl.name)
                .map(|offer| (offer.factory)(decl))
        })
        .collect()
}

/// Shared state behind a [`Connection`] handle and the read path.
struct ConnectionCore {
    /// Write entry point; the serializing queue filter.
    queue: Arc<dyn Filter>,
    session: Mutex<Session>,
    handler: Arc<dyn MessageHandler>,
    negotiation: Negotiation,
    /// Set once a close frame has been sent in either direction's name.
    closed: AtomicBool,
}

impl ConnectionCore {
    /// Runs incoming socket bytes through the session and dispatches the
    /// results.
    fn receive(&self, data: BytesMut) {
        let (events, obligated, close_received) = {
            let mut session = self.session.lock().unwrap();
            match session.receive(&data) {
                Ok(events) => (events, session.take_obligated(), session.close_received()),
                Err(err) => {
                    drop(session);
                    self.protocol_error(err);
                    return;
                }
            }
        };

        for frame in obligated {
            let is_close = frame.opcode == OpCode::Close;
            if is_close && self.closed.swap(true, Ordering::AcqRel) {
                // We already sent our close; the peer's frame was the echo.
                continue;
            }
            self.send_frame(frame);
        }

        for event in events {
            match event {
                SessionEvent::Text(text) => self.handler.on_message(Message::Text(text)),
                SessionEvent::Binary(data) => self.handler.on_message(Message::Binary(data)),
                SessionEvent::Ping(payload) => self.handler.on_ping(payload),
                SessionEvent::Pong(payload) => self.handler.on_pong(payload),
                SessionEvent::Close { code, reason } => self.handler.on_close(code, reason),
            }
        }

        if close_received {
            self.queue.close();
        }
    }

    /// Announces a violation to the peer and tears the connection down.
    fn protocol_error(&self, err: WsError) {
        warn!("protocol error: {err}");
        if !self.closed.swap(true, Ordering::AcqRel) {
            let frame = Session::close_frame_for(&err);
            if let Ok(bytes) = self.session.lock().unwrap().encode_control(frame) {
                self.queue.write(bytes, Box::new(|_| {}));
            }
        }
        self.handler.on_error(err);
        self.queue.close();
    }

    /// Fire-and-forget write for protocol-obligated frames.
    fn send_frame(&self, frame: Frame) {
        let encoded = self.session.lock().unwrap().encode_control(frame);
        match encoded {
            Ok(bytes) => self.queue.write(bytes, Box::new(|_| {})),
            Err(err) => debug!("failed to encode obligated frame: {err}"),
        }
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue.write(
            data,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.map_err(|_| WsError::ConnectionClosed)?
    }
}

/// Handle to an open WebSocket connection.
///
/// Clones share the connection. Dropping the last handle tears the filter
/// chain down.
#[derive(Clone)]
pub struct Connection {
    core: Arc<ConnectionCore>,
    /// Keeps the chain's top filter alive; upward events die without it.
    _chain: Arc<HandshakeFilter>,
}

impl Connection {
    /// Parameters agreed during the handshake.
    pub fn negotiation(&self) -> &Negotiation {
        &self.core.negotiation
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(text).await,
            Message::Binary(data) => {
                self.send_fragment(OpCode::Binary, true, data.to_vec()).await
            }
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_fragment(OpCode::Text, true, text.into().into_bytes())
            .await
    }

    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_fragment(OpCode::Binary, true, data.into()).await
    }

    /// Sends one fragment of a text message; pass `fin` on the last one.
    /// Fragment boundaries may fall inside a UTF-8 character.
    pub async fn stream_text(&self, text: impl Into<String>, fin: bool) -> Result<()> {
        self.send_fragment(OpCode::Text, fin, text.into().into_bytes())
            .await
    }

    /// Sends one fragment of a binary message; pass `fin` on the last one.
    pub async fn stream_binary(&self, data: impl Into<Vec<u8>>, fin: bool) -> Result<()> {
        self.send_fragment(OpCode::Binary, fin, data.into()).await
    }

    pub async fn ping(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control(Frame::ping(payload)).await
    }

    pub async fn pong(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control(Frame::pong(payload)).await
    }

    /// Starts the closing handshake. The connection is torn down once the
    /// peer echoes the close frame or the transport drops.
    pub async fn close(&self, code: CloseCode, reason: impl AsRef<str>) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Err(WsError::ConnectionClosed);
        }
        let bytes = self
            .core
            .session
            .lock()
            .unwrap()
            .encode_control(Frame::close(code, reason))?;
        self.core.write(bytes).await
    }

    async fn send_fragment(&self, opcode: OpCode, fin: bool, payload: Vec<u8>) -> Result<()> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(WsError::ConnectionClosed);
        }
        let bytes = self
            .core
            .session
            .lock()
            .unwrap()
            .encode_data(opcode, fin, BytesMut::from(&payload[..]))?;
        self.core.write(bytes).await
    }

    async fn send_control(&self, frame: Frame) -> Result<()> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(WsError::ConnectionClosed);
        }
        let bytes = self.core.session.lock().unwrap().encode_control(frame)?;
        self.core.write(bytes).await
    }
}
