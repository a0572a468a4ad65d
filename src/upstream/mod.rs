//! Upstream connection establishment
//!
//! Direct mode hands the pipeline a raw TCP stream toward one of the
//! upstream shards and the decrypted client bytes flow through verbatim.
//! Middle mode authenticates this proxy to the shard with a short hello
//! carrying the ad-tag, then re-frames the connection with the variant the
//! client negotiated, so both legs of the relay are message-oriented.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::framing::{MessageReader, MessageWriter};
use crate::handshake::{ConnectionOpts, NetworkFamily};

/// Budget for one upstream dial
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Magic opening the proxy-auth hello toward a middle shard
const HELLO_MAGIC: [u8; 4] = *b"VGM1";
/// Magic acknowledging the hello
const HELLO_ACK: [u8; 4] = *b"VGA1";

/// Upstream leg failures. Any of these kills only the one connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no shard serves route {0}")]
    NoShard(u16),

    #[error("cannot dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("dial to {addr} timed out")]
    DialTimeout { addr: SocketAddr },

    #[error("proxy-auth handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the pipeline relays against once the upstream leg is up
#[derive(Debug)]
pub enum UpstreamLink {
    /// Direct mode: a raw byte stream
    Stream(TcpStream),
    /// Middle mode: a message-oriented duplex in the client's variant
    Framed {
        reader: MessageReader<OwnedReadHalf>,
        writer: MessageWriter<OwnedWriteHalf>,
    },
}

/// Opens and initializes the upstream leg for one connection
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn establish(&self, opts: &ConnectionOpts) -> Result<UpstreamLink, UpstreamError>;
}

/// Production shard endpoints, one entry per route
fn default_shards_v4() -> Vec<SocketAddr> {
    [
        (Ipv4Addr::new(149, 154, 175, 50), 443),
        (Ipv4Addr::new(149, 154, 167, 51), 443),
        (Ipv4Addr::new(149, 154, 175, 100), 443),
        (Ipv4Addr::new(149, 154, 167, 91), 443),
        (Ipv4Addr::new(149, 154, 171, 5), 443),
    ]
    .into_iter()
    .map(SocketAddr::from)
    .collect()
}

fn default_shards_v6() -> Vec<SocketAddr> {
    [
        (Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf001, 0, 0, 0, 0x000a), 443),
        (Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf002, 0, 0, 0, 0x000a), 443),
        (Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf003, 0, 0, 0, 0x000a), 443),
        (Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf004, 0, 0, 0, 0x000a), 443),
        (Ipv6Addr::new(0x2001, 0x0b28, 0xf23f, 0xf005, 0, 0, 0, 0x000a), 443),
    ]
    .into_iter()
    .map(SocketAddr::from)
    .collect()
}

fn pick_shard(shards: &[SocketAddr], route: u16) -> Result<SocketAddr, UpstreamError> {
    if shards.is_empty() {
        return Err(UpstreamError::NoShard(route));
    }
    // Routes are 1-based; out-of-range routes wrap.
    let idx = usize::from(route.saturating_sub(1)) % shards.len();
    Ok(shards[idx])
}

async fn dial(addr: SocketAddr) -> Result<TcpStream, UpstreamError> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| UpstreamError::DialTimeout { addr })?
        .map_err(|source| UpstreamError::Dial { addr, source })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Direct mode connector
pub struct DirectUpstream {
    shards_v4: Vec<SocketAddr>,
    shards_v6: Vec<SocketAddr>,
}

impl DirectUpstream {
    pub fn new() -> Self {
        Self::with_shards(default_shards_v4(), default_shards_v6())
    }

    pub fn with_shards(shards_v4: Vec<SocketAddr>, shards_v6: Vec<SocketAddr>) -> Self {
        Self {
            shards_v4,
            shards_v6,
        }
    }
}

impl Default for DirectUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamConnector for DirectUpstream {
    async fn establish(&self, opts: &ConnectionOpts) -> Result<UpstreamLink, UpstreamError> {
        let shards = match opts.family {
            NetworkFamily::V6 => &self.shards_v6,
            _ => &self.shards_v4,
        };
        let addr = pick_shard(shards, opts.route)?;
        let stream = dial(addr).await?;
        debug!(%addr, route = opts.route, "upstream stream connected");
        Ok(UpstreamLink::Stream(stream))
    }
}

/// Middle mode connector: dial, authenticate, re-frame
pub struct MiddleUpstream {
    shards_v4: Vec<SocketAddr>,
    shards_v6: Vec<SocketAddr>,
    ad_tag: Vec<u8>,
}

impl MiddleUpstream {
    pub fn new(ad_tag: Vec<u8>) -> Self {
        Self::with_shards(default_shards_v4(), default_shards_v6(), ad_tag)
    }

    pub fn with_shards(
        shards_v4: Vec<SocketAddr>,
        shards_v6: Vec<SocketAddr>,
        ad_tag: Vec<u8>,
    ) -> Self {
        Self {
            shards_v4,
            shards_v6,
            ad_tag,
        }
    }

    async fn hello(&self, opts: &ConnectionOpts, stream: &mut TcpStream) -> Result<(), UpstreamError> {
        let mut buf = BytesMut::with_capacity(7 + self.ad_tag.len());
        buf.put_slice(&HELLO_MAGIC);
        buf.put_u8(match opts.family {
            NetworkFamily::Any => 0,
            NetworkFamily::V4 => 4,
            NetworkFamily::V6 => 6,
        });
        buf.put_u16_le(self.ad_tag.len() as u16);
        buf.put_slice(&self.ad_tag);
        stream.write_all(&buf).await?;

        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack).await?;
        if ack != HELLO_ACK {
            return Err(UpstreamError::Handshake(
                "unexpected hello acknowledgment".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamConnector for MiddleUpstream {
    async fn establish(&self, opts: &ConnectionOpts) -> Result<UpstreamLink, UpstreamError> {
        let shards = match opts.family {
            NetworkFamily::V6 => &self.shards_v6,
            _ => &self.shards_v4,
        };
        let addr = pick_shard(shards, opts.route)?;
        let mut stream = dial(addr).await?;
        self.hello(opts, &mut stream).await?;
        debug!(%addr, route = opts.route, variant = %opts.variant, "upstream framed connection initialized");

        let (read_half, write_half) = stream.into_split();
        Ok(UpstreamLink::Framed {
            reader: MessageReader::new(read_half, opts.variant),
            writer: MessageWriter::with_greeting(write_half, opts.variant),
        })
    }
}
