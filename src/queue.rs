//! Write serialization for the connection pipeline.
//!
//! Several tasks may call [`Filter::write`] concurrently, and the transport
//! below makes no ordering promise between overlapping writes. This filter
//! funnels everything through a queue and keeps at most one downstream
//! operation in flight, so frames leave the socket in submission order.
//! A `start_tls` request parks the queue until the handshake below reports
//! completion, which keeps the upgrade request from racing the TLS records.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};

use crate::filter::{with_upstream, Filter, WriteDone};
use crate::{Result, WsError};

enum Task {
    Write(Bytes, WriteDone),
    Close,
    StartTls,
}

pub(crate) struct WriteQueueFilter {
    downstream: Arc<dyn Filter>,
    upstream: Mutex<Option<Weak<dyn Filter>>>,
    queue: Mutex<VecDeque<Task>>,
    /// Whether a task currently owns the drain loop.
    processing: AtomicBool,
    /// Set while a TLS handshake below is in progress.
    suspended: AtomicBool,
    closed: AtomicBool,
    me: Weak<WriteQueueFilter>,
}

impl WriteQueueFilter {
    pub(crate) fn new(downstream: Arc<dyn Filter>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            downstream,
            upstream: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    fn enqueue(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.process_next();
    }

    /// Drains the queue while this call holds the processing flag. Returns
    /// without draining when another caller holds it; that caller re-checks
    /// the queue before letting go, so no task is stranded.
    fn process_next(&self) {
        loop {
            if self.suspended.load(Ordering::Acquire) {
                return;
            }
            if self
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let task = self.queue.lock().unwrap().pop_front();
            let Some(task) = task else {
                self.processing.store(false, Ordering::Release);
                // A producer may have enqueued between the pop and the
                // release; re-check so its task is not lost.
                if self.queue.lock().unwrap().is_empty() {
                    return;
                }
                continue;
            };

            match task {
                Task::Write(data, done) => {
                    if self.closed.load(Ordering::Acquire) {
                        self.processing.store(false, Ordering::Release);
                        done(Err(WsError::ConnectionClosed));
                        continue;
                    }
                    // The flag stays held until the write completes; the
                    // completion callback resumes the drain.
                    let me = self.me.clone();
                    self.downstream.write(
                        data,
                        Box::new(move |result| {
                            done(result);
                            if let Some(me) = me.upgrade() {
                                me.processing.store(false, Ordering::Release);
                                me.process_next();
                            }
                        }),
                    );
                    return;
                }
                Task::Close => {
                    self.closed.store(true, Ordering::Release);
                    self.downstream.close();
                    self.processing.store(false, Ordering::Release);
                    continue;
                }
                Task::StartTls => {
                    self.suspended.store(true, Ordering::Release);
                    self.processing.store(false, Ordering::Release);
                    self.downstream.start_tls();
                    return;
                }
            }
        }
    }

    /// Fails every queued write. Used when the connection dies under us.
    fn drain_with_error(&self) {
        let tasks = std::mem::take(&mut *self.queue.lock().unwrap());
        for task in tasks {
            if let Task::Write(_, done) = task {
                done(Err(WsError::ConnectionClosed));
            }
        }
    }

    fn upstream(&self) -> Weak<dyn Filter> {
        self.upstream
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Weak::<Self>::new() as Weak<dyn Filter>)
    }
}

impl Filter for WriteQueueFilter {
    fn connect(&self, addr: &str, upstream: Weak<dyn Filter>) -> Result<()> {
        *self.upstream.lock().unwrap() = Some(upstream);
        self.downstream
            .connect(addr, self.me.clone() as Weak<dyn Filter>)
    }

    fn write(&self, data: Bytes, done: WriteDone) {
        self.enqueue(Task::Write(data, done));
    }

    fn close(&self) {
        self.enqueue(Task::Close);
    }

    fn start_tls(&self) {
        self.enqueue(Task::StartTls);
    }

    fn on_connect(&self) {
        with_upstream(&self.upstream(), |up| up.on_connect());
    }

    fn on_read(&self, data: BytesMut) {
        with_upstream(&self.upstream(), |up| up.on_read(data));
    }

    fn on_connection_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.drain_with_error();
        with_upstream(&self.upstream(), |up| up.on_connection_closed());
    }

    fn on_tls_handshake_completed(&self) {
        self.suspended.store(false, Ordering::Release);
        with_upstream(&self.upstream(), |up| up.on_tls_handshake_completed());
        self.process_next();
    }

    fn on_error(&self, err: WsError) {
        with_upstream(&self.upstream(), |up| up.on_error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::RecordingFilter;

    fn chain() -> (Arc<WriteQueueFilter>, Arc<RecordingFilter>) {
        let transport = Arc::new(RecordingFilter::default());
        let queue = WriteQueueFilter::new(transport.clone());
        (queue, transport)
    }

    fn ignore() -> WriteDone {
        Box::new(|_| {})
    }

    #[test]
    fn writes_pass_through_in_order() {
        let (queue, transport) = chain();
        queue.write(Bytes::from_static(b"one"), ignore());
        queue.write(Bytes::from_static(b"two"), ignore());
        queue.write(Bytes::from_static(b"three"), ignore());

        let written = transport.written();
        assert_eq!(written, vec!["one", "two", "three"]);
    }

    #[test]
    fn completion_callbacks_fire() {
        let (queue, _transport) = chain();
        let hits = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            queue.write(
                Bytes::from_static(b"x"),
                Box::new(move |result| {
                    result.unwrap();
                    *hits.lock().unwrap() += 1;
                }),
            );
        }
        assert_eq!(*hits.lock().unwrap(), 3);
    }

    #[test]
    fn writes_after_close_fail() {
        let (queue, transport) = chain();
        queue.write(Bytes::from_static(b"ok"), ignore());
        queue.close();

        let failed = Arc::new(Mutex::new(false));
        let flag = failed.clone();
        queue.write(
            Bytes::from_static(b"late"),
            Box::new(move |result| {
                assert!(matches!(result, Err(WsError::ConnectionClosed)));
                *flag.lock().unwrap() = true;
            }),
        );

        assert!(*failed.lock().unwrap());
        assert!(*transport.closed.lock().unwrap());
        assert_eq!(transport.written(), vec!["ok"]);
    }

    #[test]
    fn start_tls_parks_queue_until_handshake_completes() {
        let (queue, transport) = chain();
        queue.start_tls();
        queue.write(Bytes::from_static(b"upgrade request"), ignore());

        // Held back while the handshake is pending.
        assert!(*transport.tls_started.lock().unwrap());
        assert!(transport.written().is_empty());

        queue.on_tls_handshake_completed();
        assert_eq!(transport.written(), vec!["upgrade request"]);
    }

    #[test]
    fn connection_loss_fails_pending_writes() {
        let (queue, _transport) = chain();
        queue.start_tls(); // park the queue so writes stay pending
        let failed = Arc::new(Mutex::new(false));
        let flag = failed.clone();
        queue.write(
            Bytes::from_static(b"never sent"),
            Box::new(move |result| {
                assert!(result.is_err());
                *flag.lock().unwrap() = true;
            }),
        );

        queue.on_connection_closed();
        assert!(*failed.lock().unwrap());
    }

    #[test]
    fn write_error_from_below_reaches_caller() {
        let (queue, transport) = chain();
        *transport.fail_writes.lock().unwrap() = true;

        let failed = Arc::new(Mutex::new(false));
        let flag = failed.clone();
        queue.write(
            Bytes::from_static(b"doomed"),
            Box::new(move |result| {
                assert!(result.is_err());
                *flag.lock().unwrap() = true;
            }),
        );
        assert!(*failed.lock().unwrap());
    }
}
