//! Message framing for middle mode
//!
//! Once the handshake selects a variant, the plaintext byte stream becomes a
//! sequence of length-delimited messages. Three framings exist:
//!
//! - [`Abridged`]: word-count length in 1 or 4 bytes
//! - [`Intermediate`]: 4-byte little-endian length prefix
//! - [`IntermediateSecure`]: intermediate framing with 16-byte alignment
//!
//! Decoders raise per-message [`RelayHints`] (quick-ack and simple-ack side
//! channels) that travel with the message to the opposite direction's writer
//! and die with that write. Hints never persist across messages.
//!
//! [`Abridged`]: ConnectionVariant::Abridged
//! [`Intermediate`]: ConnectionVariant::Intermediate
//! [`IntermediateSecure`]: ConnectionVariant::IntermediateSecure

mod abridged;
mod intermediate;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::handshake::ConnectionVariant;

/// Default upper bound for a single framed message
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Top bit of a length field, requesting a quick acknowledgment
pub(crate) const QUICK_ACK_BIT: u32 = 0x8000_0000;

/// Length word marking an ack-only message in intermediate framing
pub(crate) const SIMPLE_ACK_MARKER: u32 = 0x8000_0004;

/// Framing failures
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message length {len} exceeds the {max}-byte cap")]
    TooLarge { len: u64, max: usize },

    #[error("message length {len} is not aligned to {align} bytes")]
    Misaligned { len: u64, align: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-message side-channel flags raised by a decoder.
///
/// Fresh on every decode; the writer on the opposite direction consumes them
/// when it emits the message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayHints {
    /// Peer asked for a quick acknowledgment of this message
    pub quick_ack: bool,
    /// This message is an ack-only marker, not regular payload
    pub simple_ack: bool,
}

/// One decoded message together with the hints its decoder raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub hints: RelayHints,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            hints: RelayHints::default(),
        }
    }
}

/// Reads variant-framed messages from a plaintext stream.
///
/// Tolerates the optional transport greeting ahead of the first message.
#[derive(Debug)]
pub struct MessageReader<R> {
    pub(crate) io: R,
    pub(crate) variant: ConnectionVariant,
    pub(crate) max_len: usize,
    pub(crate) greeting_checked: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R, variant: ConnectionVariant) -> Self {
        Self::with_limit(io, variant, MAX_MESSAGE_LEN)
    }

    pub fn with_limit(io: R, variant: ConnectionVariant, max_len: usize) -> Self {
        Self {
            io,
            variant,
            max_len,
            greeting_checked: false,
        }
    }

    /// Decode the next message. Hints start cleared on every call and carry
    /// only what this decode raised.
    pub async fn read_message(&mut self) -> Result<Message, FrameError> {
        match self.variant {
            ConnectionVariant::Abridged => abridged::read_message(self).await,
            ConnectionVariant::Intermediate | ConnectionVariant::IntermediateSecure => {
                intermediate::read_message(self).await
            }
        }
    }
}

/// Writes variant-framed messages to a plaintext stream.
#[derive(Debug)]
pub struct MessageWriter<W> {
    pub(crate) io: W,
    pub(crate) variant: ConnectionVariant,
    pub(crate) greeting_sent: bool,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Writer that never emits a greeting, for peers that negotiated the
    /// variant out of band
    pub fn new(io: W, variant: ConnectionVariant) -> Self {
        Self {
            io,
            variant,
            greeting_sent: true,
        }
    }

    /// Writer that announces the variant with its greeting ahead of the
    /// first message
    pub fn with_greeting(io: W, variant: ConnectionVariant) -> Self {
        Self {
            io,
            variant,
            greeting_sent: false,
        }
    }

    /// Frame and send one message, honoring its hints
    pub async fn write_message(&mut self, message: &Message) -> Result<(), FrameError> {
        match self.variant {
            ConnectionVariant::Abridged => abridged::write_message(self, message).await,
            ConnectionVariant::Intermediate | ConnectionVariant::IntermediateSecure => {
                intermediate::write_message(self, message).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(variant: ConnectionVariant, message: Message) -> Message {
        let mut wire = Vec::new();
        let mut writer = MessageWriter::with_greeting(&mut wire, variant);
        writer.write_message(&message).await.unwrap();

        let mut reader = MessageReader::new(wire.as_slice(), variant);
        reader.read_message().await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_all_variants() {
        for variant in [
            ConnectionVariant::Abridged,
            ConnectionVariant::Intermediate,
            ConnectionVariant::IntermediateSecure,
        ] {
            let payload = vec![0x5Au8; 64];
            let seen = roundtrip(variant, Message::new(payload.clone())).await;
            assert_eq!(seen.payload, payload, "variant {variant}");
            assert!(!seen.hints.quick_ack);
            assert!(!seen.hints.simple_ack);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_reproduces_quick_ack() {
        for variant in [
            ConnectionVariant::Abridged,
            ConnectionVariant::Intermediate,
            ConnectionVariant::IntermediateSecure,
        ] {
            let mut message = Message::new(vec![1u8; 16]);
            message.hints.quick_ack = true;
            let seen = roundtrip(variant, message).await;
            assert!(seen.hints.quick_ack, "variant {variant}");
            assert_eq!(seen.payload.as_ref(), &[1u8; 16]);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_without_greeting() {
        let mut wire = Vec::new();
        let mut writer = MessageWriter::new(&mut wire, ConnectionVariant::Intermediate);
        writer.write_message(&Message::new(vec![3u8; 8])).await.unwrap();

        // The reader must not require a greeting.
        let mut reader = MessageReader::new(wire.as_slice(), ConnectionVariant::Intermediate);
        let seen = reader.read_message().await.unwrap();
        assert_eq!(seen.payload.as_ref(), &[3u8; 8]);
    }

    #[tokio::test]
    async fn test_simple_ack_roundtrip_intermediate() {
        let mut message = Message::new(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        message.hints.simple_ack = true;

        let seen = roundtrip(ConnectionVariant::Intermediate, message).await;
        assert!(seen.hints.simple_ack);
        assert_eq!(seen.payload.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[tokio::test]
    async fn test_second_message_keeps_hints_clear() {
        let mut wire = Vec::new();
        let mut writer = MessageWriter::with_greeting(&mut wire, ConnectionVariant::Intermediate);
        let mut first = Message::new(vec![1u8; 8]);
        first.hints.quick_ack = true;
        writer.write_message(&first).await.unwrap();
        writer.write_message(&Message::new(vec![2u8; 4])).await.unwrap();

        let mut reader = MessageReader::new(wire.as_slice(), ConnectionVariant::Intermediate);
        assert!(reader.read_message().await.unwrap().hints.quick_ack);
        // Hints are per message, never carried over.
        let second = reader.read_message().await.unwrap();
        assert!(!second.hints.quick_ack);
        assert_eq!(second.payload.as_ref(), &[2u8; 4]);
    }
}
