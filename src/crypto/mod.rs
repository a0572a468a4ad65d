//! Cryptographic primitives for the obfuscated transport
//!
//! This module provides:
//! - SHA-256 key derivation binding handshake material to a tenant secret
//! - AES-256-CTR keystream states, one per relay direction
//! - Secure random generation for frame material

mod kdf;
mod stream;

pub use kdf::derive_stream_key;
pub use stream::{CipherPair, StreamKey};

/// Length of a derived symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of a counter-mode IV in bytes
pub const IV_LEN: usize = 16;

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}
