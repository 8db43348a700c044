//! Configuration management for tsgate
//!
//! A TOML file provides the durable configuration; CLI flags override the
//! hot ones. Named services map URL paths to upstream sources.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

/// FCC dialect selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FccDialect {
    #[default]
    Telecom,
    Huawei,
}

impl FccDialect {
    pub fn to_packets(self) -> crate::fcc::packets::Dialect {
        match self {
            FccDialect::Telecom => crate::fcc::packets::Dialect::Telecom,
            FccDialect::Huawei => crate::fcc::packets::Dialect::Huawei,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub buffers: BufferConfig,
    pub upstream: UpstreamConfig,
    pub rtsp: RtspConfig,
    pub logging: LoggingConfig,
    pub services: HashMap<String, ServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            buffers: BufferConfig::default(),
            upstream: UpstreamConfig::default(),
            rtsp: RtspConfig::default(),
            logging: LoggingConfig::default(),
            services: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen addresses; every worker binds each with SO_REUSEPORT.
    pub bind: Vec<String>,
    /// Worker threads; 0 means one per CPU.
    pub workers: usize,
    pub maxclients: usize,
    /// Shared bearer token; empty disables the check.
    pub token: String,
    /// Enable /udp/ and /rtp/ address routes.
    pub udpxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: vec!["0.0.0.0:8080".to_string()],
            workers: 0,
            maxclients: 256,
            token: String::new(),
            udpxy: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub pool_initial: usize,
    pub pool_max: usize,
    pub expand_step: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
    /// Kernel receive buffer for upstream UDP sockets.
    pub udp_rcvbuf: usize,
    /// MSG_ZEROCOPY on client sockets.
    pub zerocopy: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            pool_initial: 1024,
            pool_max: 65536,
            expand_step: 1024,
            low_watermark: 64,
            high_watermark: 4096,
            udp_rcvbuf: 512 * 1024,
            zerocopy: true,
        }
    }
}

impl BufferConfig {
    pub fn pool_config(&self) -> crate::buffer::PoolConfig {
        crate::buffer::PoolConfig {
            initial_buffers: self.pool_initial,
            max_buffers: self.pool_max,
            expand_step: self.expand_step,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Interface (name or address) for multicast membership.
    pub mcast_interface: String,
    /// Seconds between membership re-assertions; 0 disables.
    pub mcast_rejoin_interval: u64,
    /// Seconds without upstream data before a stream is declared dead.
    pub mcast_timeout: u64,
    pub fcc_dialect: FccDialect,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            mcast_interface: String::new(),
            mcast_rejoin_interval: 0,
            mcast_timeout: 30,
            fcc_dialect: FccDialect::Telecom,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RtspConfig {
    /// STUN server (host:port) for UDP transport NAT mapping.
    pub stun_server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0=error, 1=warn, 2=info, 3=debug, 4=trace.
    pub level: i32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Multicast RTP: payload extracted, reordered, FEC-recoverable.
    Mrtp,
    /// Raw multicast UDP, forwarded verbatim.
    Mudp,
    /// RTSP unicast upstream.
    Rtsp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Multicast group `ip:port` (mrtp/mudp).
    #[serde(default)]
    pub address: String,
    /// Source filter for source-specific multicast.
    #[serde(default)]
    pub source: String,
    /// RTSP target url.
    #[serde(default)]
    pub url: String,
    /// FCC server `ip:port`; empty disables fast channel change.
    #[serde(default)]
    pub fcc: String,
    /// FEC parity stream group `ip:port`; empty disables recovery.
    #[serde(default)]
    pub fec: String,
}

/// A fully resolved upstream target for one client.
#[derive(Debug, Clone)]
pub enum Service {
    Mrtp {
        group: SocketAddrV4,
        source: Option<Ipv4Addr>,
        fcc: Option<SocketAddrV4>,
        fec: Option<SocketAddrV4>,
    },
    Mudp {
        group: SocketAddrV4,
        source: Option<Ipv4Addr>,
    },
    Rtsp {
        url: Url,
        playseek: Option<String>,
    },
}

impl Service {
    pub fn describe(&self) -> String {
        match self {
            Service::Mrtp { group, .. } => format!("rtp://{}", group),
            Service::Mudp { group, .. } => format!("udp://{}", group),
            Service::Rtsp { url, .. } => url.to_string(),
        }
    }
}

pub fn parse_v4_addr(value: &str, field: &'static str) -> Result<SocketAddrV4, ConfigError> {
    value
        .parse::<SocketAddrV4>()
        .map_err(|_| ConfigError::Invalid { field, value: value.to_string() })
}

impl ServiceConfig {
    pub fn resolve(&self, playseek: Option<&str>) -> Result<Service, ConfigError> {
        match self.kind {
            ServiceKind::Mrtp => Ok(Service::Mrtp {
                group: parse_v4_addr(&self.address, "service address")?,
                source: parse_optional_ip(&self.source)?,
                fcc: parse_optional_addr(&self.fcc, "fcc server")?,
                fec: parse_optional_addr(&self.fec, "fec group")?,
            }),
            ServiceKind::Mudp => Ok(Service::Mudp {
                group: parse_v4_addr(&self.address, "service address")?,
                source: parse_optional_ip(&self.source)?,
            }),
            ServiceKind::Rtsp => {
                let url = Url::parse(&self.url).map_err(|_| ConfigError::Invalid {
                    field: "service url",
                    value: self.url.clone(),
                })?;
                Ok(Service::Rtsp { url, playseek: playseek.map(str::to_string) })
            }
        }
    }
}

fn parse_optional_ip(value: &str) -> Result<Option<Ipv4Addr>, ConfigError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<Ipv4Addr>()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { field: "source", value: value.to_string() })
}

fn parse_optional_addr(
    value: &str,
    field: &'static str,
) -> Result<Option<SocketAddrV4>, ConfigError> {
    if value.is_empty() {
        return Ok(None);
    }
    parse_v4_addr(value, field).map(Some)
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists; defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
        if path.exists() {
            Config::load(path)
        } else {
            log::info!("config file {:?} not found, using defaults", path);
            Ok(Config::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.is_empty() {
            return Err(ConfigError::Invalid { field: "server.bind", value: "(empty)".into() });
        }
        for addr in &self.server.bind {
            addr.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
                field: "server.bind",
                value: addr.clone(),
            })?;
        }
        if self.server.maxclients == 0 {
            return Err(ConfigError::Invalid { field: "server.maxclients", value: "0".into() });
        }
        if self.buffers.pool_max < self.buffers.pool_initial {
            return Err(ConfigError::Invalid {
                field: "buffers.pool_max",
                value: self.buffers.pool_max.to_string(),
            });
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        if self.server.workers > 0 {
            self.server.workers.min(crate::status::MAX_WORKERS)
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(crate::status::MAX_WORKERS)
        }
    }

    pub fn stun_server(&self) -> Option<SocketAddr> {
        if self.rtsp.stun_server.is_empty() {
            return None;
        }
        let value = &self.rtsp.stun_server;
        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Some(addr);
        }
        // Bare host: default STUN port.
        format!("{}:3478", value).parse().ok()
    }
}
