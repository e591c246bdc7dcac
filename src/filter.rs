//! Connection pipeline built from stacked filters.
//!
//! A chain looks like `handshake -> queue -> tls -> transport`. Calls made
//! down the chain (connect, write, close) run on the caller's thread until
//! they hit the transport, which hands them to its runtime. Events travel
//! back up (`on_read`, `on_connect`, ...) on whatever task the transport
//! read loop runs on. Filters hold their downstream neighbour strongly and
//! their upstream neighbour weakly, so dropping the top of a chain tears
//! the whole thing down.

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};

use crate::{Result, WsError};

/// Completion callback for a [`Filter::write`] call. Invoked exactly once,
/// after the bytes reached the socket or the attempt failed.
pub type WriteDone = Box<dyn FnOnce(Result<()>) + Send>;

/// One stage of a connection pipeline.
///
/// The default upward handlers forward nothing; a filter overrides the ones
/// it cares about and explicitly propagates the rest to its upstream.
pub trait Filter: Send + Sync + 'static {
    /// Opens the connection. `addr` is a `host:port` pair; `upstream` is the
    /// neighbour that receives this filter's upward events.
    fn connect(&self, addr: &str, upstream: Weak<dyn Filter>) -> Result<()>;

    /// Writes `data` towards the socket. `done` fires when the write
    /// completed or failed; ordering guarantees are the queue filter's job.
    fn write(&self, data: Bytes, done: WriteDone);

    /// Shuts the connection down. Safe to call more than once.
    fn close(&self);

    /// Asks the chain to secure itself. A transport with no TLS filter
    /// below answers with `on_tls_handshake_completed` immediately so
    /// plaintext chains share the handshake sequencing.
    fn start_tls(&self);

    /// The transport established its connection.
    fn on_connect(&self) {}

    /// Bytes arrived from below.
    fn on_read(&self, data: BytesMut) {
        let _ = data;
    }

    /// The peer closed the connection or the socket died.
    fn on_connection_closed(&self) {}

    /// A `start_tls` request finished.
    fn on_tls_handshake_completed(&self) {}

    /// A failure that terminates the connection attempt.
    fn on_error(&self, err: WsError) {
        let _ = err;
    }
}

/// Upgrades an upstream handle, dropping the event if the chain owner is
/// already gone.
pub(crate) fn with_upstream(upstream: &Weak<dyn Filter>, f: impl FnOnce(&Arc<dyn Filter>)) {
    if let Some(upstream) = upstream.upgrade() {
        f(&upstream);
    }
}
