//! Configuration management

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address
    pub bind_ip: IpAddr,
    /// Listen port
    pub bind_port: u16,
    /// Public IPv4 address advertised for middle mode
    pub public_ipv4: Option<Ipv4Addr>,
    /// Public IPv4 port, defaults to `bind_port`
    pub public_ipv4_port: Option<u16>,
    /// Public IPv6 address advertised for middle mode
    pub public_ipv6: Option<Ipv6Addr>,
    /// Public IPv6 port, defaults to `bind_port`
    pub public_ipv6_port: Option<u16>,
    /// Relay buffer for the upstream-to-client direction, bytes
    pub read_buffer_size: usize,
    /// Relay buffer for the client-to-upstream direction, bytes
    pub write_buffer_size: usize,
    /// Reject clients that negotiate anything but the secure variant
    pub secure_only: bool,
    /// Anti-replay cache cap in bytes
    pub anti_replay_max_bytes: usize,
    /// Anti-replay eviction period in seconds
    pub anti_replay_ttl_secs: u64,
    /// Opaque tag forwarded in the middle-mode proxy hello (hex)
    pub ad_tag: String,
    /// Tenant secrets accepted by the handshake (hex)
    pub secrets: Vec<String>,
    /// Optional registry file consulted per connection instead of `secrets`
    pub secrets_file: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 3128,
            public_ipv4: None,
            public_ipv4_port: None,
            public_ipv6: None,
            public_ipv6_port: None,
            read_buffer_size: 131_072,
            write_buffer_size: 65_536,
            secure_only: false,
            anti_replay_max_bytes: 128 * 1024 * 1024,
            anti_replay_ttl_secs: 168 * 3600,
            ad_tag: String::new(),
            secrets: Vec::new(),
            secrets_file: None,
        }
    }
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.bind_port)
    }

    /// Middle mode is selected by advertising any public endpoint
    pub fn use_middle(&self) -> bool {
        self.public_ipv4.is_some() || self.public_ipv6.is_some()
    }

    pub fn anti_replay_ttl(&self) -> Duration {
        Duration::from_secs(self.anti_replay_ttl_secs)
    }

    /// Decoded ad-tag bytes
    pub fn ad_tag_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        hex::decode(&self.ad_tag)
            .map_err(|_| crate::Error::Config("ad_tag is not valid hex".to_string()))
    }

    /// Decoded tenant secrets
    pub fn secret_bytes(&self) -> Result<Vec<Vec<u8>>, crate::Error> {
        self.secrets
            .iter()
            .map(|s| {
                hex::decode(s)
                    .map_err(|_| crate::Error::Config(format!("secret {:?} is not valid hex", s)))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(crate::Error::Config(
                "relay buffer sizes must be positive".to_string(),
            ));
        }
        if self.anti_replay_max_bytes == 0 {
            return Err(crate::Error::Config(
                "anti_replay_max_bytes must be positive".to_string(),
            ));
        }
        self.ad_tag_bytes()?;
        let secrets = self.secret_bytes()?;
        if secrets.is_empty() && self.secrets_file.is_none() {
            return Err(crate::Error::Config(
                "no secrets and no secrets_file configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
