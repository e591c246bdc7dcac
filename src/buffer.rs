//! Growable byte buffer with a hard capacity cap.
//!
//! Incoming network data is accumulated here before the handshake parser or
//! the frame decoder consume it. Growth happens in three tiers: append into
//! spare tail capacity, compact already-consumed head space, and only as a
//! last resort reallocate, rounding the new capacity up to a step so a slow
//! trickle of small reads does not trigger a reallocation per chunk.

use bytes::BytesMut;

use crate::{Result, WsError};

/// Default maximum capacity: a 4 MiB payload plus the largest frame header.
pub const DEFAULT_MAX_CAPACITY: usize = 4 * 1024 * 1024 + 11;

/// Default allocation rounding step.
pub const DEFAULT_STEP_SIZE: usize = 256;

/// A `BytesMut` wrapper that grows in rounded steps up to a fixed limit.
#[derive(Debug)]
pub struct GrowableBuffer {
    buf: BytesMut,
    max_capacity: usize,
    step_size: usize,
}

impl GrowableBuffer {
    /// Creates an empty buffer that may grow up to `max_capacity` bytes in
    /// `step_size`-rounded allocations.
    pub fn new(max_capacity: usize, step_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_capacity,
            step_size,
        }
    }

    /// Appends `data`, growing the buffer if needed.
    ///
    /// Fails with [`WsError::BufferOverflow`] when the combined contents
    /// would not fit in `max_capacity`; the buffer is left untouched in
    /// that case.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        // Tier 1: spare tail capacity.
        if self.buf.capacity() - self.buf.len() >= data.len() {
            self.buf.extend_from_slice(data);
            return Ok(());
        }

        // Tier 2: reclaim space released by earlier consumers.
        if self.buf.try_reclaim(data.len()) {
            self.buf.extend_from_slice(data);
            return Ok(());
        }

        // Tier 3: reallocate, rounded up to the step.
        let required = self.buf.len() + data.len();
        if required > self.max_capacity {
            return Err(WsError::BufferOverflow(self.max_capacity));
        }
        let capacity = round_up(required, self.step_size).min(self.max_capacity);
        let mut next = BytesMut::with_capacity(capacity);
        next.extend_from_slice(&self.buf);
        next.extend_from_slice(data);
        self.buf = next;
        Ok(())
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no unconsumed bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops all contents while keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Access to the underlying bytes for decoding. Decoders consume from
    /// the front; reclaimed space becomes tier-2 growth room.
    pub fn as_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Takes the accumulated bytes, leaving the buffer empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }
}

impl AsRef<[u8]> for GrowableBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

fn round_up(value: usize, step: usize) -> usize {
    if step == 0 {
        return value;
    }
    value.div_ceil(step) * step
}
