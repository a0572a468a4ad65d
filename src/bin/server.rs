//! Veilgate proxy server
//!
//! Accepts obfuscated client connections, validates them against the tenant
//! secret registry and relays them to the upstream shards in direct or
//! middle mode.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use veilgate::config::{Config, LoggingConfig};
use veilgate::proxy::Proxy;
use veilgate::replay::ReplayCache;
use veilgate::secrets::{FileRegistry, SecretProvider, StaticSecrets};
use veilgate::upstream::{DirectUpstream, MiddleUpstream, UpstreamConnector};

/// Veilgate - obfuscated TCP proxy in front of the upstream shards
#[derive(Parser, Debug)]
#[command(name = "veilgate-server")]
#[command(about = "Obfuscated TCP proxy in front of the upstream shards")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'b', long, env = "VEILGATE_BIND_IP")]
    bind_ip: Option<IpAddr>,

    /// Listen port (overrides config)
    #[arg(short = 'P', long, env = "VEILGATE_PORT")]
    port: Option<u16>,

    /// Public IPv4 address advertised for middle mode
    #[arg(short = '4', long, env = "VEILGATE_IPV4")]
    public_ipv4: Option<Ipv4Addr>,

    /// Public IPv4 port, defaults to the listen port
    #[arg(long, env = "VEILGATE_IPV4_PORT")]
    public_ipv4_port: Option<u16>,

    /// Public IPv6 address advertised for middle mode
    #[arg(short = '6', long, env = "VEILGATE_IPV6")]
    public_ipv6: Option<Ipv6Addr>,

    /// Public IPv6 port, defaults to the listen port
    #[arg(long, env = "VEILGATE_IPV6_PORT")]
    public_ipv6_port: Option<u16>,

    /// Relay buffer for the upstream-to-client direction, bytes
    #[arg(short = 'r', long, env = "VEILGATE_BUFFER_READ")]
    read_buffer: Option<usize>,

    /// Relay buffer for the client-to-upstream direction, bytes
    #[arg(short = 'w', long, env = "VEILGATE_BUFFER_WRITE")]
    write_buffer: Option<usize>,

    /// Accept only clients that negotiate the secure variant
    #[arg(short = 's', long, env = "VEILGATE_SECURE_ONLY")]
    secure_only: bool,

    /// Anti-replay cache cap in mebibytes
    #[arg(long, env = "VEILGATE_ANTIREPLAY_MAX_MIB")]
    anti_replay_max_mib: Option<usize>,

    /// Anti-replay eviction period in seconds
    #[arg(long, env = "VEILGATE_ANTIREPLAY_TTL_SECS")]
    anti_replay_ttl: Option<u64>,

    /// Proxy tag forwarded in the middle-mode hello (hex)
    #[arg(short = 'a', long, env = "VEILGATE_ADTAG")]
    adtag: Option<String>,

    /// Tenant secret (hex), repeatable
    #[arg(long = "secret", env = "VEILGATE_SECRET")]
    secrets: Vec<String>,

    /// Registry file with one hex secret per line
    #[arg(long, env = "VEILGATE_SECRETS_FILE")]
    secrets_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides config
    #[arg(short = 'v', long, env = "VEILGATE_LOG")]
    log_level: Option<String>,

    /// Log format (pretty, json), overrides config
    #[arg(long, env = "VEILGATE_LOG_FORMAT")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    init_logging(&config.logging)?;

    if let Err(e) = raise_nofile_limit() {
        warn!(error = %e, "cannot raise the open-file limit");
    }

    config.proxy.validate().context("Invalid configuration")?;
    let conf = Arc::new(config.proxy.clone());

    let cache = Arc::new(ReplayCache::new(
        conf.anti_replay_max_bytes,
        conf.anti_replay_ttl(),
    ));

    let secrets: Arc<dyn SecretProvider> = match &conf.secrets_file {
        Some(path) => {
            info!(path = %path.display(), "using secret registry file");
            Arc::new(FileRegistry::new(path.clone()))
        }
        None => {
            let set = conf.secret_bytes().context("Invalid secrets")?;
            info!(count = set.len(), "using configured secrets");
            Arc::new(StaticSecrets::new(set).context("Invalid secrets")?)
        }
    };

    let upstream: Arc<dyn UpstreamConnector> = if conf.use_middle() {
        info!("using middle connection to the upstream");
        let ad_tag = conf.ad_tag_bytes().context("Invalid ad_tag")?;
        Arc::new(MiddleUpstream::new(ad_tag))
    } else {
        info!("using direct connection to the upstream");
        Arc::new(DirectUpstream::new())
    };

    info!(
        version = veilgate::VERSION,
        addr = %conf.bind_addr(),
        secure_only = conf.secure_only,
        "starting proxy"
    );

    let proxy = Arc::new(Proxy::new(conf, cache, secrets, upstream));
    proxy.serve().await.context("Server stopped")?;

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    let proxy = &mut config.proxy;
    if let Some(ip) = args.bind_ip {
        proxy.bind_ip = ip;
    }
    if let Some(port) = args.port {
        proxy.bind_port = port;
    }
    if let Some(ip) = args.public_ipv4 {
        proxy.public_ipv4 = Some(ip);
    }
    if let Some(port) = args.public_ipv4_port {
        proxy.public_ipv4_port = Some(port);
    }
    if let Some(ip) = args.public_ipv6 {
        proxy.public_ipv6 = Some(ip);
    }
    if let Some(port) = args.public_ipv6_port {
        proxy.public_ipv6_port = Some(port);
    }
    if let Some(size) = args.read_buffer {
        proxy.read_buffer_size = size;
    }
    if let Some(size) = args.write_buffer {
        proxy.write_buffer_size = size;
    }
    if args.secure_only {
        proxy.secure_only = true;
    }
    if let Some(mib) = args.anti_replay_max_mib {
        proxy.anti_replay_max_bytes = mib * 1024 * 1024;
    }
    if let Some(secs) = args.anti_replay_ttl {
        proxy.anti_replay_ttl_secs = secs;
    }
    if let Some(tag) = &args.adtag {
        proxy.ad_tag = tag.clone();
    }
    if !args.secrets.is_empty() {
        proxy.secrets = args.secrets.clone();
    }
    if let Some(path) = &args.secrets_file {
        proxy.secrets_file = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &args.log_format {
        config.logging.format = format.clone();
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .context("Invalid log level")?;
    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

/// Lift the soft descriptor cap to the hard cap so long-lived relays are not
/// starved. Best effort; failure is logged, never fatal.
#[cfg(unix)]
fn raise_nofile_limit() -> std::io::Result<()> {
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        limit.rlim_cur = limit.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn raise_nofile_limit() -> std::io::Result<()> {
    Ok(())
}
