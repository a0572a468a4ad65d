//! Obfuscating stream wrapper

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{CipherPair, StreamKey};

pin_project! {
    /// Applies the connection's keystreams to a bidirectional byte stream:
    /// the read keystream to every byte arriving from the peer, the write
    /// keystream to every byte sent to it.
    ///
    /// Both keystreams are position sensitive, so reads must stay sequential
    /// on one direction and writes on the other. Partial transfers are fine;
    /// each keystream advances by exactly the bytes that moved.
    #[derive(Debug)]
    pub struct CipherStream<IO> {
        #[pin]
        io: IO,
        encrypt: StreamKey,
        decrypt: StreamKey,
        pending: Vec<u8>,
        drained: usize,
    }
}

impl<IO> CipherStream<IO> {
    pub fn new(io: IO, ciphers: CipherPair) -> Self {
        Self {
            io,
            encrypt: ciphers.encrypt,
            decrypt: ciphers.decrypt,
            pending: Vec::new(),
            drained: 0,
        }
    }

    /// Access the wrapped stream
    pub fn get_ref(&self) -> &IO {
        &self.io
    }
}

impl<IO: AsyncRead> AsyncRead for CipherStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.project();
        let before = buf.filled().len();
        ready!(me.io.poll_read(cx, buf))?;
        me.decrypt.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<IO: AsyncWrite> AsyncWrite for CipherStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut me = self.project();
        if buf.is_empty() {
            return me.io.poll_write(cx, buf);
        }

        // Each chunk is transformed exactly once; the ciphertext is then
        // drained across however many underlying writes it takes. Callers
        // retry a pending poll_write with the same buffer, so `pending`
        // always corresponds to `buf`.
        if me.pending.is_empty() {
            me.pending.extend_from_slice(buf);
            me.encrypt.apply(me.pending.as_mut_slice());
            *me.drained = 0;
        }

        while *me.drained < me.pending.len() {
            let n = ready!(me.io.as_mut().poll_write(cx, &me.pending[*me.drained..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            *me.drained += n;
        }

        let written = me.pending.len();
        me.pending.clear();
        *me.drained = 0;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut me = self.project();
        while *me.drained < me.pending.len() {
            let n = ready!(me.io.as_mut().poll_write(cx, &me.pending[*me.drained..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            *me.drained += n;
        }
        me.pending.clear();
        *me.drained = 0;
        me.io.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        self.project().io.poll_shutdown(cx)
    }
}
