//! Client handshake for the obfuscated transport
//!
//! Every client connection opens with a 64-byte frame that is both the
//! cipher seed and the connection descriptor. On the wire the frame looks
//! like random noise; with the right tenant secret it decrypts to:
//!
//! ```text
//! bytes  0..8   random, must not resemble a plaintext transport prefix
//! bytes  8..40  key material for the client-to-proxy direction
//! bytes 40..56  IV for the client-to-proxy direction
//! bytes 56..60  variant tag, one byte repeated four times
//! bytes 60..62  requested upstream route, little-endian i16
//! bytes 62..64  random tail
//! ```
//!
//! The proxy-to-client direction derives from the same material reversed, so
//! a passive observer cannot relate the two keystreams. Only bytes 56..64
//! travel encrypted; the prefix doubles as the key material itself.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use crate::crypto::{derive_stream_key, random_bytes, CipherPair, StreamKey, IV_LEN};
use crate::secrets::Secret;

/// Size of the client handshake frame in bytes
pub const FRAME_LEN: usize = 64;

const TAG_ABRIDGED: u8 = 0xEF;
const TAG_INTERMEDIATE: u8 = 0xEE;
const TAG_INTERMEDIATE_SECURE: u8 = 0xDD;

/// First words that identify a client speaking a plaintext transport
/// instead of the obfuscated one. Such connections are refused outright.
const PLAIN_FIRST_WORDS: [u32; 6] = [
    0xEEEE_EEEE,
    0xDDDD_DDDD,
    u32::from_le_bytes(*b"POST"),
    u32::from_le_bytes(*b"GET "),
    u32::from_le_bytes(*b"HEAD"),
    u32::from_le_bytes(*b"OPTI"),
];

/// Handshake failures
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("client did not complete the handshake in time")]
    Timeout,

    #[error("frame carries a plaintext transport prefix")]
    PlainTransportPrefix,

    #[error("no active secret validates the frame")]
    NoMatchingSecret,

    #[error("{0} active secrets validate the frame")]
    AmbiguousSecret(usize),
}

/// Framing variant requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionVariant {
    /// 1-or-4-byte word-count length prefix
    Abridged,
    /// 4-byte little-endian length prefix
    Intermediate,
    /// Intermediate framing with 16-byte payload alignment
    IntermediateSecure,
}

impl ConnectionVariant {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_ABRIDGED => Some(Self::Abridged),
            TAG_INTERMEDIATE => Some(Self::Intermediate),
            TAG_INTERMEDIATE_SECURE => Some(Self::IntermediateSecure),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Abridged => TAG_ABRIDGED,
            Self::Intermediate => TAG_INTERMEDIATE,
            Self::IntermediateSecure => TAG_INTERMEDIATE_SECURE,
        }
    }
}

impl fmt::Display for ConnectionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abridged => f.write_str("abridged"),
            Self::Intermediate => f.write_str("intermediate"),
            Self::IntermediateSecure => f.write_str("intermediate-secure"),
        }
    }
}

/// Address family used toward the upstream. Direct mode leaves this as
/// `Any`; middle mode sets it from the listening socket before dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkFamily {
    #[default]
    Any,
    V4,
    V6,
}

/// Everything the pipeline needs to know about a negotiated connection.
///
/// `variant` and `route` are fixed at handshake completion and never change
/// for the lifetime of the connection.
#[derive(Debug, Clone)]
pub struct ConnectionOpts {
    pub variant: ConnectionVariant,
    pub route: u16,
    pub family: NetworkFamily,
    pub peer: SocketAddr,
}

/// The 64-byte opaque preamble read from a client before any other byte.
///
/// Consumed exactly once by [`parse_client_frame`]; its raw bytes also key
/// the anti-replay cache.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeFrame([u8; FRAME_LEN]);

impl HandshakeFrame {
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl fmt::Debug for HandshakeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material, never logged in full.
        write!(f, "HandshakeFrame({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Validate a client frame against the active secret set.
///
/// Tries every secret; exactly one must decrypt the frame tail to a known
/// variant tag. On success, returns the per-direction keystreams (with the
/// read direction already advanced past the frame itself, matching the
/// client's cipher position) and the connection descriptor.
pub fn parse_client_frame(
    secrets: &[Secret],
    frame: &HandshakeFrame,
    peer: SocketAddr,
) -> Result<(CipherPair, ConnectionOpts), HandshakeError> {
    if looks_like_plain_transport(frame.as_bytes()) {
        return Err(HandshakeError::PlainTransportPrefix);
    }

    let mut candidate: Option<(StreamKey, [u8; FRAME_LEN], ConnectionVariant, &Secret)> = None;
    let mut matches = 0usize;

    for secret in secrets {
        let mut decrypt = read_schedule(frame.as_bytes(), secret);
        let mut plain = *frame.as_bytes();
        decrypt.apply(&mut plain);

        let Some(variant) = decode_tag(&plain) else {
            continue;
        };
        matches += 1;
        if candidate.is_none() {
            candidate = Some((decrypt, plain, variant, secret));
        }
    }

    if matches > 1 {
        return Err(HandshakeError::AmbiguousSecret(matches));
    }
    let Some((decrypt, plain, variant, secret)) = candidate else {
        return Err(HandshakeError::NoMatchingSecret);
    };

    let pair = CipherPair {
        encrypt: write_schedule(frame.as_bytes(), secret),
        decrypt,
    };
    let opts = ConnectionOpts {
        variant,
        route: decode_route(&plain),
        family: NetworkFamily::Any,
        peer,
    };
    Ok((pair, opts))
}

/// Build a handshake frame the way a client builds one.
///
/// Returns the wire frame together with the client-side cipher pair: the
/// client writes with the schedule the proxy reads with, and vice versa.
/// Used by the test harness and by client tooling.
pub fn seal_client_frame(
    secret: &[u8],
    variant: ConnectionVariant,
    route: i16,
) -> (HandshakeFrame, CipherPair) {
    let mut plain = [0u8; FRAME_LEN];
    loop {
        random_bytes(&mut plain);
        plain[56..60].fill(variant.tag());
        plain[60..62].copy_from_slice(&route.to_le_bytes());
        if !looks_like_plain_transport(&plain) {
            break;
        }
    }

    let mut client_tx = read_schedule(&plain, secret);
    let client_rx = write_schedule(&plain, secret);

    // Only the tail travels encrypted; the prefix is the key material and
    // must stay readable for the receiver to derive the same schedule.
    let mut sealed = plain;
    client_tx.apply(&mut sealed);
    let mut wire = plain;
    wire[56..64].copy_from_slice(&sealed[56..64]);

    (
        HandshakeFrame(wire),
        CipherPair {
            encrypt: client_tx,
            decrypt: client_rx,
        },
    )
}

/// Keystream for bytes the proxy reads from the client
fn read_schedule(frame: &[u8; FRAME_LEN], secret: &[u8]) -> StreamKey {
    let key = derive_stream_key(&frame[8..40], secret);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&frame[40..56]);
    StreamKey::new(&key, &iv)
}

/// Keystream for bytes the proxy writes to the client, derived from the
/// reversed material so the directions never share a keystream
fn write_schedule(frame: &[u8; FRAME_LEN], secret: &[u8]) -> StreamKey {
    let mut rev = [0u8; 48];
    for (dst, src) in rev.iter_mut().zip(frame[8..56].iter().rev()) {
        *dst = *src;
    }
    let key = derive_stream_key(&rev[..32], secret);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&rev[32..48]);
    StreamKey::new(&key, &iv)
}

fn decode_tag(plain: &[u8; FRAME_LEN]) -> Option<ConnectionVariant> {
    let tag = plain[56];
    if plain[57] != tag || plain[58] != tag || plain[59] != tag {
        return None;
    }
    ConnectionVariant::from_tag(tag)
}

fn decode_route(plain: &[u8; FRAME_LEN]) -> u16 {
    // Negative routes are the client's media-shard convention; route zero
    // falls back to the first shard.
    match i16::from_le_bytes([plain[60], plain[61]]) {
        0 => 1,
        route => route.unsigned_abs(),
    }
}

fn looks_like_plain_transport(frame: &[u8; FRAME_LEN]) -> bool {
    if frame[0] == TAG_ABRIDGED {
        return true;
    }
    let first = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let second = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    PLAIN_FIRST_WORDS.contains(&first) || second == 0
}
