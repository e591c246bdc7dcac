//! Payload masking (RFC 6455 section 5.3).
//!
//! Masking is a plain XOR with a 4-byte key repeated over the payload, so
//! applying the same key twice restores the input. The hot path operates on
//! whole `u32` words; the scalar version handles the unaligned edges.

/// Masks or unmasks `buf` in place with `key`.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let key_word = u32::from_ne_bytes(key);

    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    xor_scalar(prefix, key);

    // The word key has to be rotated by however many bytes the scalar
    // prefix consumed, so the repeating pattern stays in phase.
    let consumed = prefix.len() & 3;
    let key_word = if consumed > 0 {
        if cfg!(target_endian = "big") {
            key_word.rotate_left(8 * consumed as u32)
        } else {
            key_word.rotate_right(8 * consumed as u32)
        }
    } else {
        key_word
    };

    for word in words.iter_mut() {
        *word ^= key_word;
    }
    xor_scalar(suffix, key_word.to_ne_bytes());
}

#[inline]
fn xor_scalar(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
