//! Streaming UTF-8 validation for fragmented text messages.
//!
//! Text fragments can split a multi-byte character at any point, so the
//! validator keeps the trailing incomplete sequence (at most three bytes)
//! and stitches it together with the start of the next fragment. Only the
//! final fragment is required to end on a character boundary.

use crate::{Result, WsError};

/// Incremental UTF-8 validator carrying state across fragment boundaries.
#[derive(Debug, Default)]
pub struct Utf8Validator {
    /// Bytes of an incomplete character held over from the previous push.
    pending: [u8; 4],
    pending_len: usize,
    /// Total length the pending sequence must reach, from its lead byte.
    pending_need: usize,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the next chunk of a text message.
    ///
    /// A chunk ending mid-character is fine; the remainder is carried over.
    /// Any byte that can never form valid UTF-8 fails immediately with
    /// [`WsError::InvalidUtf8`].
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<()> {
        if self.pending_len > 0 {
            // Top up the held-over sequence before looking at the rest.
            while self.pending_len < self.pending_need && !chunk.is_empty() {
                self.pending[self.pending_len] = chunk[0];
                self.pending_len += 1;
                chunk = &chunk[1..];
            }
            match std::str::from_utf8(&self.pending[..self.pending_len]) {
                Ok(_) => {
                    self.pending_len = 0;
                    self.pending_need = 0;
                }
                Err(err) if err.error_len().is_some() => return Err(WsError::InvalidUtf8),
                // Chunk exhausted before the character completed.
                Err(_) => return Ok(()),
            }
        }

        match std::str::from_utf8(chunk) {
            Ok(_) => Ok(()),
            Err(err) => {
                if err.error_len().is_some() {
                    return Err(WsError::InvalidUtf8);
                }
                let tail = &chunk[err.valid_up_to()..];
                let need = sequence_len(tail[0]).ok_or(WsError::InvalidUtf8)?;
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                self.pending_need = need;
                Ok(())
            }
        }
    }

    /// Marks the end of the message. Fails if a character is still open.
    pub fn finish(&mut self) -> Result<()> {
        if self.pending_len > 0 {
            self.pending_len = 0;
            self.pending_need = 0;
            return Err(WsError::InvalidUtf8);
        }
        Ok(())
    }

    /// Whether a partial character is currently held over.
    pub fn has_pending(&self) -> bool {
        self.pending_len > 0
    }
}

/// Expected sequence length for a UTF-8 lead byte, `None` for invalid leads.
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7f => Some(1),
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}
