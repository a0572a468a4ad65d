//! Intermediate framing, plain and secure
//!
//! A 4-byte little-endian length word precedes every payload. The top bit
//! requests a quick acknowledgment and is stripped before the size is
//! computed. The word 0x80000004 is not a length at all but an ack-only
//! marker followed by a 4-byte token. The secure variant tightens payload
//! alignment from 4 to 16 bytes; the ack bit is divisible by both, so the
//! alignment check holds with or without it.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    FrameError, Message, MessageReader, MessageWriter, RelayHints, QUICK_ACK_BIT,
    SIMPLE_ACK_MARKER,
};
use crate::handshake::ConnectionVariant;

const GREETING_PLAIN: [u8; 4] = [0xEE; 4];
const GREETING_SECURE: [u8; 4] = [0xDD; 4];

fn alignment(variant: ConnectionVariant) -> usize {
    match variant {
        ConnectionVariant::IntermediateSecure => 16,
        _ => 4,
    }
}

pub(super) async fn read_message<R: AsyncRead + Unpin>(
    r: &mut MessageReader<R>,
) -> Result<Message, FrameError> {
    let mut hints = RelayHints::default();

    let mut word = r.io.read_u32_le().await?;
    if !r.greeting_checked {
        r.greeting_checked = true;
        let raw = word.to_le_bytes();
        if raw == GREETING_PLAIN || raw == GREETING_SECURE {
            word = r.io.read_u32_le().await?;
        }
    }

    if word == SIMPLE_ACK_MARKER {
        hints.simple_ack = true;
        let mut token = vec![0u8; 4];
        r.io.read_exact(&mut token).await?;
        return Ok(Message {
            payload: Bytes::from(token),
            hints,
        });
    }

    if word & QUICK_ACK_BIT != 0 {
        hints.quick_ack = true;
        word &= !QUICK_ACK_BIT;
    }

    let len = u64::from(word);
    if len > r.max_len as u64 {
        return Err(FrameError::TooLarge {
            len,
            max: r.max_len,
        });
    }
    let align = alignment(r.variant);
    if len % align as u64 != 0 {
        return Err(FrameError::Misaligned { len, align });
    }

    let mut payload = vec![0u8; word as usize];
    r.io.read_exact(&mut payload).await?;
    Ok(Message {
        payload: Bytes::from(payload),
        hints,
    })
}

pub(super) async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut MessageWriter<W>,
    message: &Message,
) -> Result<(), FrameError> {
    let payload = &message.payload;
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    if !w.greeting_sent {
        w.greeting_sent = true;
        let greeting = match w.variant {
            ConnectionVariant::IntermediateSecure => GREETING_SECURE,
            _ => GREETING_PLAIN,
        };
        buf.put_slice(&greeting);
    }

    if message.hints.simple_ack {
        buf.put_u32_le(SIMPLE_ACK_MARKER);
        buf.put_slice(payload);
        w.io.write_all(&buf).await?;
        return Ok(());
    }

    let align = alignment(w.variant);
    if payload.len() % align != 0 {
        return Err(FrameError::Misaligned {
            len: payload.len() as u64,
            align,
        });
    }
    if payload.len() as u64 >= u64::from(QUICK_ACK_BIT) {
        return Err(FrameError::TooLarge {
            len: payload.len() as u64,
            max: (QUICK_ACK_BIT - 1) as usize,
        });
    }

    let mut word = payload.len() as u32;
    if message.hints.quick_ack {
        word |= QUICK_ACK_BIT;
    }
    buf.put_u32_le(word);
    buf.put_slice(payload);

    w.io.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_wire(wire: &[u8], variant: ConnectionVariant) -> Result<Message, FrameError> {
        let mut reader = MessageReader::new(wire, variant);
        reader.read_message().await
    }

    #[tokio::test]
    async fn test_plain_length_prefix() {
        let mut wire = 8u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&[9u8; 8]);
        let seen = read_wire(&wire, ConnectionVariant::Intermediate).await.unwrap();
        assert_eq!(seen.payload.as_ref(), &[9u8; 8]);
    }

    #[tokio::test]
    async fn test_both_greetings_tolerated() {
        for greeting in [GREETING_PLAIN, GREETING_SECURE] {
            let mut wire = greeting.to_vec();
            wire.extend_from_slice(&4u32.to_le_bytes());
            wire.extend_from_slice(&[1, 2, 3, 4]);
            let seen = read_wire(&wire, ConnectionVariant::Intermediate).await.unwrap();
            assert_eq!(seen.payload.as_ref(), &[1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn test_quick_ack_word_stripped() {
        let mut wire = (4u32 | QUICK_ACK_BIT).to_le_bytes().to_vec();
        wire.extend_from_slice(&[5, 6, 7, 8]);
        let seen = read_wire(&wire, ConnectionVariant::Intermediate).await.unwrap();
        assert!(seen.hints.quick_ack);
        assert_eq!(seen.payload.as_ref(), &[5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        // 0x00100001 bytes, one past the 1 MiB cap.
        let wire = 0x0010_0001u32.to_le_bytes();
        let err = read_wire(&wire, ConnectionVariant::Intermediate)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 0x0010_0001, .. }));
    }

    #[tokio::test]
    async fn test_secure_alignment_enforced() {
        // 20 bytes is 4-aligned but not 16-aligned.
        let mut wire = 20u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 20]);

        let seen = read_wire(&wire, ConnectionVariant::Intermediate).await.unwrap();
        assert_eq!(seen.payload.len(), 20);

        let err = read_wire(&wire, ConnectionVariant::IntermediateSecure)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Misaligned { align: 16, .. }));
    }

    #[tokio::test]
    async fn test_unaligned_plain_rejected() {
        let wire = 6u32.to_le_bytes();
        let err = read_wire(&wire, ConnectionVariant::Intermediate)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Misaligned { align: 4, .. }));
    }

    #[tokio::test]
    async fn test_simple_ack_marker() {
        let mut wire = SIMPLE_ACK_MARKER.to_le_bytes().to_vec();
        wire.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let seen = read_wire(&wire, ConnectionVariant::Intermediate).await.unwrap();
        assert!(seen.hints.simple_ack);
        assert!(!seen.hints.quick_ack);
        assert_eq!(seen.payload.as_ref(), &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[tokio::test]
    async fn test_secure_greeting_emitted() {
        let mut out = Vec::new();
        let mut writer =
            MessageWriter::with_greeting(&mut out, ConnectionVariant::IntermediateSecure);
        writer.write_message(&Message::new(vec![0u8; 16])).await.unwrap();
        assert_eq!(&out[..4], &GREETING_SECURE);
        assert_eq!(&out[4..8], &16u32.to_le_bytes());
    }
}
