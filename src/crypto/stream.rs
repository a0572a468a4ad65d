//! Stateful keystream transforms
//!
//! The obfuscation layer is a pure stream cipher: each direction owns an
//! AES-256-CTR state that advances by exactly the number of bytes pushed
//! through it. Reordering or replaying bytes on one direction desynchronizes
//! the keystream and surfaces as garbage downstream.

use std::fmt;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;

use super::{IV_LEN, KEY_LEN};

type Aes256Ctr = Ctr128BE<Aes256>;

/// One direction's keystream state.
///
/// Stream-position sensitive: bytes must be applied in the exact order they
/// travel on the wire.
pub struct StreamKey {
    cipher: Aes256Ctr,
}

impl StreamKey {
    /// Create a keystream from a derived key and IV
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            cipher: Aes256Ctr::new(key.into(), iv.into()),
        }
    }

    /// Transform `data` in place, advancing the keystream by `data.len()`
    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamKey")
    }
}

/// The two keystream states of one connection, created together by the
/// handshake codec and owned by the cipher stream wrapper afterwards.
#[derive(Debug)]
pub struct CipherPair {
    /// Applied to bytes written toward the peer
    pub encrypt: StreamKey,
    /// Applied to bytes read from the peer
    pub decrypt: StreamKey,
}
