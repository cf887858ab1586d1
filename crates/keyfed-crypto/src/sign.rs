//! Keyed packet authenticator.
//!
//! Long frames carry a 32-bit authenticator over their first eleven bytes,
//! computed by folding the message as big-endian 32-bit words and XOR-mixing
//! the signing key into every word. A trailing partial word is padded with
//! zero bytes on the right before folding. The fold is byte-identical across
//! device, server, and verifier roles; interoperability depends on it.

use keyfed_types::Key;

/// Fold `buf` into a 32-bit authenticator under `key`.
///
/// Every full big-endian word contributes `word ^ key`; a trailing partial
/// word is right-padded with zeros and contributes the same way. The empty
/// buffer folds to 0.
pub fn keyed_sign(buf: &[u8], key: Key) -> u32 {
    let mut sign = 0u32;
    let mut chunks = buf.chunks_exact(4);
    for word in chunks.by_ref() {
        let helper = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        sign ^= helper ^ key;
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut padded = [0u8; 4];
        padded[..tail.len()].copy_from_slice(tail);
        sign ^= u32::from_be_bytes(padded) ^ key;
    }
    sign
}
