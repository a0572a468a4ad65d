//! Stream-level transport wrappers
//!
//! [`CipherStream`] turns the raw client socket into the plaintext inner
//! stream by applying the per-direction keystreams negotiated during the
//! handshake. Everything above it (framing, relay) works on plaintext.

mod cipher;

pub use cipher::CipherStream;
