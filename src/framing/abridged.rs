//! Abridged framing
//!
//! Lengths count 4-byte words. A first byte below 0x7F is the word count
//! itself; 0x7F escapes to a 3-byte little-endian word count. The high bit
//! of the first byte requests a quick acknowledgment and is stripped before
//! the size is computed.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{FrameError, Message, MessageReader, MessageWriter, RelayHints};

const GREETING: u8 = 0xEF;
const QUICK_ACK_BIT: u8 = 0x80;
const EXTENDED_LEN: u8 = 0x7F;
const MAX_WORDS: u32 = 1 << 24;

pub(super) async fn read_message<R: AsyncRead + Unpin>(
    r: &mut MessageReader<R>,
) -> Result<Message, FrameError> {
    let mut hints = RelayHints::default();

    let mut first = r.io.read_u8().await?;
    if !r.greeting_checked {
        r.greeting_checked = true;
        // 0xEF opening the stream is the transport greeting, not a length.
        if first == GREETING {
            first = r.io.read_u8().await?;
        }
    }

    if first & QUICK_ACK_BIT != 0 {
        hints.quick_ack = true;
        first &= !QUICK_ACK_BIT;
    }

    let words = if first == EXTENDED_LEN {
        let mut raw = [0u8; 4];
        r.io.read_exact(&mut raw[..3]).await?;
        u32::from_le_bytes(raw)
    } else {
        u32::from(first)
    };

    let len = u64::from(words) * 4;
    if len > r.max_len as u64 {
        return Err(FrameError::TooLarge {
            len,
            max: r.max_len,
        });
    }

    let mut payload = vec![0u8; len as usize];
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
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    if !w.greeting_sent {
        w.greeting_sent = true;
        buf.put_u8(GREETING);
    }

    if message.hints.simple_ack {
        // Ack-only replies carry no length header and travel reversed.
        buf.extend(payload.iter().rev());
        w.io.write_all(&buf).await?;
        return Ok(());
    }

    if payload.len() % 4 != 0 {
        return Err(FrameError::Misaligned {
            len: payload.len() as u64,
            align: 4,
        });
    }
    let words = (payload.len() / 4) as u32;
    if words >= MAX_WORDS {
        return Err(FrameError::TooLarge {
            len: payload.len() as u64,
            max: ((MAX_WORDS - 1) * 4) as usize,
        });
    }

    let quick = if message.hints.quick_ack {
        QUICK_ACK_BIT
    } else {
        0
    };
    if words < u32::from(EXTENDED_LEN) {
        buf.put_u8(words as u8 | quick);
    } else {
        buf.put_u8(EXTENDED_LEN | quick);
        buf.put_slice(&words.to_le_bytes()[..3]);
    }
    buf.put_slice(payload);

    // Header and payload go out in one write.
    w.io.write_all(&buf).await?;
    Ok(())
}
