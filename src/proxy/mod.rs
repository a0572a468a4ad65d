//! Accept loop and per-connection relay pipeline
//!
//! One pipeline per accepted socket: tune the socket, read and validate the
//! 64-byte handshake under its deadline, consult the anti-replay cache and
//! the secure-only policy, establish the upstream leg, then relay both
//! directions until either side ends. All failures are silent on the wire;
//! the client only ever sees its socket close.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::framing::{FrameError, MessageReader, MessageWriter};
use crate::handshake::{
    self, ConnectionVariant, HandshakeError, HandshakeFrame, NetworkFamily, FRAME_LEN,
};
use crate::replay::{Freshness, ReplayCache};
use crate::secrets::{SecretError, SecretProvider};
use crate::transport::CipherStream;
use crate::upstream::{UpstreamConnector, UpstreamError, UpstreamLink};

/// Budget for the 64-byte client handshake read
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why one connection's pipeline ended early
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("handshake frame replayed")]
    Replay,

    #[error("{0} connection rejected by the secure-only policy")]
    PolicyRejected(ConnectionVariant),

    #[error(transparent)]
    Secrets(#[from] SecretError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("relay failed: {0}")]
    Relay(#[from] std::io::Error),
}

/// The proxy core: a listener plus everything the pipelines share
pub struct Proxy {
    conf: Arc<ProxyConfig>,
    cache: Arc<ReplayCache>,
    secrets: Arc<dyn SecretProvider>,
    upstream: Arc<dyn UpstreamConnector>,
}

impl Proxy {
    pub fn new(
        conf: Arc<ProxyConfig>,
        cache: Arc<ReplayCache>,
        secrets: Arc<dyn SecretProvider>,
        upstream: Arc<dyn UpstreamConnector>,
    ) -> Self {
        Self {
            conf,
            cache,
            secrets,
            upstream,
        }
    }

    /// Bind the configured listen address and serve forever. Only the bind
    /// itself is fatal.
    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.conf.bind_addr()).await?;
        self.serve_on(listener).await
    }

    /// Serve connections from an already bound listener. Accept errors are
    /// logged and the loop keeps going; a panicking pipeline is contained
    /// and logged without touching its siblings.
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening");
        }
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        let conn_id = Uuid::new_v4();
                        let span = info_span!("conn", id = %conn_id, %peer);
                        let pipeline = proxy
                            .handle_connection(socket, peer)
                            .instrument(span.clone());
                        match std::panic::AssertUnwindSafe(pipeline).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                let _guard = span.enter();
                                warn!(error = %e, "connection closed");
                            }
                            Err(_) => {
                                let _guard = span.enter();
                                error!("connection handler panicked");
                            }
                        }
                    });
                }
                Err(e) => error!(error = %e, "cannot accept incoming connection"),
            }
        }
    }

    async fn handle_connection(
        &self,
        mut socket: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), PipelineError> {
        info!("client connected");
        let local = socket.local_addr()?;
        socket.set_nodelay(true)?;
        self.tune_socket(&socket);

        let secrets = self.secrets.active_secrets().await?;

        let mut raw = [0u8; FRAME_LEN];
        match timeout(HANDSHAKE_TIMEOUT, socket.read_exact(&mut raw)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(HandshakeError::Io(e).into()),
            Err(_) => return Err(HandshakeError::Timeout.into()),
        }
        let frame = HandshakeFrame::from_bytes(raw);

        let (ciphers, mut opts) = handshake::parse_client_frame(&secrets, &frame, peer)?;

        if self.cache.observe(&frame) == Freshness::Replay {
            return Err(PipelineError::Replay);
        }

        if self.conf.secure_only && opts.variant != ConnectionVariant::IntermediateSecure {
            return Err(PipelineError::PolicyRejected(opts.variant));
        }

        debug!(variant = %opts.variant, route = opts.route, "handshake complete");

        let client = CipherStream::new(socket, ciphers);

        if self.conf.use_middle() {
            opts.family = if local.is_ipv4() {
                NetworkFamily::V4
            } else {
                NetworkFamily::V6
            };
            let UpstreamLink::Framed {
                reader: up_reader,
                writer: up_writer,
            } = self.upstream.establish(&opts).await?
            else {
                return Err(
                    UpstreamError::Handshake("connector returned an unframed link".to_string())
                        .into(),
                );
            };

            let (client_read, client_write) = tokio::io::split(client);
            let client_reader = MessageReader::new(client_read, opts.variant);
            let client_writer = MessageWriter::new(client_write, opts.variant);
            self.relay_framed(client_reader, client_writer, up_reader, up_writer)
                .await;
        } else {
            let UpstreamLink::Stream(upstream) = self.upstream.establish(&opts).await? else {
                return Err(
                    UpstreamError::Handshake("connector returned a framed link".to_string())
                        .into(),
                );
            };
            self.relay_direct(client, upstream).await;
        }

        info!("client disconnected");
        Ok(())
    }

    /// Byte-for-byte relay for direct mode.
    ///
    /// The first direction to finish ends the whole exchange: every half
    /// drops here, both sockets close, and whichever read or write the other
    /// direction is parked on comes back with an error it treats as
    /// terminal.
    async fn relay_direct(&self, client: CipherStream<TcpStream>, upstream: TcpStream) {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut up_read, mut up_write) = upstream.into_split();

        tokio::select! {
            res = copy_bytes(&mut client_read, &mut up_write, self.conf.write_buffer_size) => {
                log_direction("client to upstream", res);
            }
            res = copy_bytes(&mut up_read, &mut client_write, self.conf.read_buffer_size) => {
                log_direction("upstream to client", res);
            }
        }
    }

    /// Message relay for middle mode. Hints decoded with each message ride
    /// along to the opposite writer and die with that write.
    async fn relay_framed<CR, CW>(
        &self,
        mut client_reader: MessageReader<CR>,
        mut client_writer: MessageWriter<CW>,
        mut up_reader: MessageReader<tokio::net::tcp::OwnedReadHalf>,
        mut up_writer: MessageWriter<tokio::net::tcp::OwnedWriteHalf>,
    ) where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
    {
        tokio::select! {
            res = pump_messages(&mut client_reader, &mut up_writer) => {
                log_framed_direction("client to upstream", res);
            }
            res = pump_messages(&mut up_reader, &mut client_writer) => {
                log_framed_direction("upstream to client", res);
            }
        }
    }

    fn tune_socket(&self, socket: &TcpStream) {
        let sock = SockRef::from(socket);
        if let Err(e) = sock.set_recv_buffer_size(self.conf.read_buffer_size) {
            debug!(error = %e, "cannot set receive buffer size");
        }
        if let Err(e) = sock.set_send_buffer_size(self.conf.write_buffer_size) {
            debug!(error = %e, "cannot set send buffer size");
        }
    }
}

/// Pump decrypted bytes from `src` to `dst` until EOF or error
async fn copy_bytes<R, W>(src: &mut R, dst: &mut W, buf_size: usize) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Pump framed messages from `reader` to `writer` until the source ends
async fn pump_messages<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let message = reader.read_message().await?;
        writer.write_message(&message).await?;
    }
}

fn log_direction(direction: &str, res: std::io::Result<u64>) {
    match res {
        Ok(bytes) => debug!(direction, bytes, "relay direction finished"),
        Err(e) => debug!(direction, error = %e, "relay direction failed"),
    }
}

fn log_framed_direction(direction: &str, res: Result<(), FrameError>) {
    match res {
        Ok(()) => {}
        Err(FrameError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
            debug!(direction, "peer closed");
        }
        Err(e) => warn!(direction, error = %e, "relay direction failed"),
    }
}
