//! TCP transport filter and the runtime pool behind it.
//!
//! [`TransportFilter`] is the bottom of every chain. It owns the socket,
//! runs a read loop that pushes fresh buffers upward, and executes writes
//! on the pool's runtime. [`TransportPool`] lazily builds a shared tokio
//! runtime when the first connection opens and tears it down on a detached
//! thread once the last connection has been gone for a grace period; a new
//! connection arriving inside the grace window cancels the teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::filter::{with_upstream, Filter, WriteDone};
use crate::{Result, WsError};

struct PoolInner {
    runtime: Option<Runtime>,
    open: usize,
    /// Bumped on every acquire so a pending teardown can tell it has been
    /// overtaken.
    generation: u64,
}

/// Shared runtime for all connections of one client.
pub struct TransportPool {
    inner: Mutex<PoolInner>,
    idle_grace: Duration,
}

impl TransportPool {
    pub fn new(idle_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                runtime: None,
                open: 0,
                generation: 0,
            }),
            idle_grace,
        })
    }

    /// Registers a connection and returns a handle to the pool runtime,
    /// building the runtime if none is live.
    pub(crate) fn acquire(&self) -> Result<Handle> {
        let mut inner = self.inner.lock().unwrap();
        inner.generation = inner.generation.wrapping_add(1);
        let runtime = match inner.runtime {
            Some(ref runtime) => runtime,
            None => {
                debug!("starting transport runtime");
                inner
                    .runtime
                    .insert(Builder::new_multi_thread().enable_all().build()?)
            }
        };
        let handle = runtime.handle().clone();
        inner.open += 1;
        Ok(handle)
    }

    /// Deregisters a connection. When the count hits zero a teardown is
    /// scheduled after the grace period, on its own thread since a runtime
    /// must not be dropped from one of its tasks.
    pub(crate) fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        inner.open = inner.open.saturating_sub(1);
        if inner.open > 0 {
            return;
        }
        let generation = inner.generation;
        drop(inner);

        let pool = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(pool.idle_grace);
            let mut inner = pool.inner.lock().unwrap();
            if inner.open == 0 && inner.generation == generation {
                if let Some(runtime) = inner.runtime.take() {
                    debug!("shutting down idle transport runtime");
                    runtime.shutdown_background();
                }
            }
        });
    }

    #[cfg(test)]
    fn has_runtime(&self) -> bool {
        self.inner.lock().unwrap().runtime.is_some()
    }
}

/// Socket endpoint of a connection pipeline.
pub(crate) struct TransportFilter {
    pool: Arc<TransportPool>,
    input_buffer_size: usize,
    handle: Mutex<Option<Handle>>,
    upstream: Mutex<Option<Weak<dyn Filter>>>,
    write_half: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    /// First transition wins; guards pool release and the closed event.
    closed: AtomicBool,
    me: Weak<TransportFilter>,
}

impl TransportFilter {
    pub(crate) fn new(pool: Arc<TransportPool>, input_buffer_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pool,
            input_buffer_size,
            handle: Mutex::new(None),
            upstream: Mutex::new(None),
            write_half: Arc::new(tokio::sync::Mutex::new(None)),
            read_task: Mutex::new(None),
            closed: AtomicBool::new(false),
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

    /// Releases the pool slot and reports the loss upward, once.
    fn shutdown_complete(&self, notify: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.release();
        if notify {
            with_upstream(&self.upstream(), |up| up.on_connection_closed());
        }
    }
}

impl Filter for TransportFilter {
    fn connect(&self, addr: &str, upstream: Weak<dyn Filter>) -> Result<()> {
        *self.upstream.lock().unwrap() = Some(upstream.clone());
        let handle = self.pool.acquire()?;
        *self.handle.lock().unwrap() = Some(handle.clone());

        let addr = addr.to_string();
        let me = self.me.clone();
        let write_half = self.write_half.clone();
        let input_buffer_size = self.input_buffer_size;
        handle.spawn(async move {
            let stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!("connect to {addr} failed: {err}");
                    with_upstream(&upstream, |up| up.on_error(err.into()));
                    if let Some(me) = me.upgrade() {
                        me.shutdown_complete(true);
                    }
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            let (mut read_half, writer) = stream.into_split();
            *write_half.lock().await = Some(writer);

            let read_loop = {
                let upstream = upstream.clone();
                let me = me.clone();
                async move {
                    loop {
                        let mut buf = BytesMut::with_capacity(input_buffer_size);
                        match read_half.read_buf(&mut buf).await {
                            Ok(0) => break,
                            Ok(n) => {
                                trace!("transport read {n} bytes");
                                with_upstream(&upstream, |up| up.on_read(buf));
                            }
                            Err(err) => {
                                debug!("transport read failed: {err}");
                                break;
                            }
                        }
                    }
                    if let Some(me) = me.upgrade() {
                        me.shutdown_complete(true);
                    }
                }
            };
            if let Some(me) = me.upgrade() {
                // The connect event must reach the chain before any bytes
                // do, or an early read would be delivered into a filter
                // that is not set up yet.
                with_upstream(&upstream, |up| up.on_connect());
                if me.closed.load(Ordering::Acquire) {
                    return;
                }
                let task = tokio::spawn(read_loop);
                *me.read_task.lock().unwrap() = Some(task);
            }
        });
        Ok(())
    }

    fn write(&self, data: Bytes, done: WriteDone) {
        let handle = self.handle.lock().unwrap().clone();
        let Some(handle) = handle else {
            done(Err(WsError::ConnectionClosed));
            return;
        };
        let write_half = self.write_half.clone();
        handle.spawn(async move {
            let mut guard = write_half.lock().await;
            let Some(writer) = guard.as_mut() else {
                done(Err(WsError::ConnectionClosed));
                return;
            };
            let result = async {
                writer.write_all(&data).await?;
                writer.flush().await
            }
            .await;
            done(result.map_err(Into::into));
        });
    }

    fn close(&self) {
        if let Some(task) = self.read_task.lock().unwrap().take() {
            task.abort();
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let write_half = self.write_half.clone();
            let me = self.me.clone();
            handle.spawn(async move {
                if let Some(mut writer) = write_half.lock().await.take() {
                    let _ = writer.shutdown().await;
                }
                if let Some(me) = me.upgrade() {
                    me.shutdown_complete(true);
                }
            });
        } else {
            self.shutdown_complete(false);
        }
    }

    /// No TLS below a transport; answer right away so plaintext chains go
    /// through the same sequencing as secure ones.
    fn start_tls(&self) {
        with_upstream(&self.upstream(), |up| up.on_tls_handshake_completed());
    }
}

impl Drop for TransportFilter {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.lock().unwrap().take() {
            task.abort();
        }
        if self.handle.lock().unwrap().is_some() {
            self.shutdown_complete(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Condvar;

    #[derive(Default)]
    struct CollectorState {
        connected: bool,
        closed: bool,
        tls_completed: bool,
        errors: usize,
        read: Vec<u8>,
        read_before_connect: bool,
    }

    /// Top-of-chain filter that records upward events for assertions.
    #[derive(Default)]
    struct Collector {
        state: Mutex<CollectorState>,
        cv: Condvar,
    }

    impl Collector {
        fn wait_for(&self, pred: impl Fn(&CollectorState) -> bool) {
            let guard = self.state.lock().unwrap();
            let (_guard, timeout) = self
                .cv
                .wait_timeout_while(guard, Duration::from_secs(5), |s| !pred(s))
                .unwrap();
            assert!(!timeout.timed_out(), "timed out waiting for event");
        }

        fn update(&self, f: impl FnOnce(&mut CollectorState)) {
            f(&mut self.state.lock().unwrap());
            self.cv.notify_all();
        }
    }

    impl Filter for Collector {
        fn connect(&self, _addr: &str, _upstream: Weak<dyn Filter>) -> Result<()> {
            Ok(())
        }
        fn write(&self, _data: Bytes, _done: WriteDone) {}
        fn close(&self) {}
        fn start_tls(&self) {}

        fn on_connect(&self) {
            self.update(|s| s.connected = true);
        }
        fn on_read(&self, data: BytesMut) {
            self.update(|s| {
                if !s.connected {
                    s.read_before_connect = true;
                }
                s.read.extend_from_slice(&data);
            });
        }
        fn on_connection_closed(&self) {
            self.update(|s| s.closed = true);
        }
        fn on_tls_handshake_completed(&self) {
            self.update(|s| s.tls_completed = true);
        }
        fn on_error(&self, _err: WsError) {
            self.update(|s| s.errors += 1);
        }
    }

    #[test]
    fn connect_read_write_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = TransportPool::new(Duration::from_secs(60));
        let transport = TransportFilter::new(pool, 16 * 1024);
        let collector: Arc<Collector> = Arc::new(Collector::default());
        let upstream = Arc::downgrade(&collector) as Weak<dyn Filter>;

        transport.connect(&addr, upstream).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        collector.wait_for(|s| s.connected);

        server.write_all(b"from server").unwrap();
        collector.wait_for(|s| s.read == b"from server");

        let (tx, rx) = std::sync::mpsc::channel();
        transport.write(
            Bytes::from_static(b"from client"),
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let mut buf = [0u8; 11];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"from client");

        transport.close();
        collector.wait_for(|s| s.closed);
    }

    #[test]
    fn connect_event_precedes_first_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = TransportPool::new(Duration::from_secs(60));
        let transport = TransportFilter::new(pool, 1024);
        let collector: Arc<Collector> = Arc::new(Collector::default());
        transport
            .connect(&addr, Arc::downgrade(&collector) as Weak<dyn Filter>)
            .unwrap();

        // The peer speaks first, racing the connect event.
        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"early").unwrap();

        collector.wait_for(|s| s.read == b"early");
        let state = collector.state.lock().unwrap();
        assert!(state.connected);
        assert!(!state.read_before_connect);
    }

    #[test]
    fn peer_disconnect_reported_upward() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = TransportPool::new(Duration::from_secs(60));
        let transport = TransportFilter::new(pool, 1024);
        let collector: Arc<Collector> = Arc::new(Collector::default());
        transport
            .connect(&addr, Arc::downgrade(&collector) as Weak<dyn Filter>)
            .unwrap();

        let (server, _) = listener.accept().unwrap();
        collector.wait_for(|s| s.connected);
        drop(server);
        collector.wait_for(|s| s.closed);
    }

    #[test]
    fn failed_connect_reports_error_and_close() {
        // Reserved port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = TransportPool::new(Duration::from_secs(60));
        let transport = TransportFilter::new(pool.clone(), 1024);
        let collector: Arc<Collector> = Arc::new(Collector::default());
        transport
            .connect(&addr, Arc::downgrade(&collector) as Weak<dyn Filter>)
            .unwrap();

        collector.wait_for(|s| s.errors > 0 && s.closed);
    }

    #[test]
    fn start_tls_without_tls_completes_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = TransportPool::new(Duration::from_secs(60));
        let transport = TransportFilter::new(pool, 1024);
        let collector: Arc<Collector> = Arc::new(Collector::default());
        transport
            .connect(&addr, Arc::downgrade(&collector) as Weak<dyn Filter>)
            .unwrap();
        let _server = listener.accept().unwrap();
        collector.wait_for(|s| s.connected);

        transport.start_tls();
        collector.wait_for(|s| s.tls_completed);
        transport.close();
        collector.wait_for(|s| s.closed);
    }

    #[test]
    fn pool_keeps_runtime_while_connections_open() {
        let pool = TransportPool::new(Duration::from_millis(10));
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        pool.release();
        std::thread::sleep(Duration::from_millis(100));
        // One connection still registered.
        assert!(pool.has_runtime());

        pool.release();
        std::thread::sleep(Duration::from_millis(200));
        assert!(!pool.has_runtime());
    }

    #[test]
    fn pool_reacquire_cancels_teardown() {
        let pool = TransportPool::new(Duration::from_millis(100));
        let _a = pool.acquire().unwrap();
        pool.release();
        // Re-acquire inside the grace window.
        let _b = pool.acquire().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(pool.has_runtime());
    }
}
