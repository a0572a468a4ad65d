//! # Veilgate
//!
//! A transparent TCP proxy that terminates an obfuscated client transport,
//! authenticates clients against a registry of tenant secrets, and relays
//! the inner protocol to an upstream service.
//!
//! ## Features
//!
//! - **Obfuscated handshake**: a 64-byte preamble carrying the cipher seed,
//!   the framing variant and the requested upstream route
//! - **Stream obfuscation** with per-direction AES-256-CTR keystreams
//! - **Replay rejection** for handshake frames, bounded by size and age
//! - **Direct mode**: byte-for-byte relay of the decrypted stream
//! - **Middle mode**: per-message re-framing with quick/simple ack side
//!   channels and a proxy-auth hello toward the upstream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Accept loop                       │
//! ├─────────────────────────────────────────────────────┤
//! │     Handshake codec + anti-replay + policy           │
//! ├─────────────────────────────────────────────────────┤
//! │     Cipher stream (per-direction keystreams)         │
//! ├─────────────────────────────────────────────────────┤
//! │     Framing (abridged / intermediate / secure)       │
//! ├─────────────────────────────────────────────────────┤
//! │     Relay ⇄ upstream connector (direct / middle)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod framing;
pub mod handshake;
pub mod proxy;
pub mod replay;
pub mod secrets;
pub mod transport;
pub mod upstream;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] handshake::HandshakeError),

    #[error("framing error: {0}")]
    Frame(#[from] framing::FrameError),

    #[error("upstream error: {0}")]
    Upstream(#[from] upstream::UpstreamError),

    #[error("secret registry error: {0}")]
    Secrets(#[from] secrets::SecretError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] proxy::PipelineError),

    #[error("configuration error: {0}")]
    Config(String),
}
