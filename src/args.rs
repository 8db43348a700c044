use clap::Parser;
use std::path::PathBuf;

use crate::config::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "tsgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "IPTV multicast/RTSP to HTTP streaming gateway", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tsgate.toml")]
    pub config: PathBuf,

    /// Listen address (overrides the config file, may repeat)
    #[arg(short, long)]
    pub bind: Vec<String>,

    /// Worker threads (0 = one per CPU)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Maximum concurrent streaming clients
    #[arg(long)]
    pub maxclients: Option<usize>,

    /// Shared bearer token for all routes
    #[arg(long)]
    pub token: Option<String>,

    /// Upstream interface for multicast membership (name or address)
    #[arg(long)]
    pub mcast_interface: Option<String>,

    /// STUN server for RTSP-over-UDP NAT traversal
    #[arg(long)]
    pub stun_server: Option<String>,

    /// Disable MSG_ZEROCOPY on client sockets
    #[arg(long, action)]
    pub no_zerocopy: bool,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = Config::load_or_default(&self.config)?;
        if !self.bind.is_empty() {
            config.server.bind = self.bind.clone();
        }
        if let Some(workers) = self.workers {
            config.server.workers = workers;
        }
        if let Some(maxclients) = self.maxclients {
            config.server.maxclients = maxclients;
        }
        if let Some(token) = &self.token {
            config.server.token = token.clone();
        }
        if let Some(iface) = &self.mcast_interface {
            config.upstream.mcast_interface = iface.clone();
        }
        if let Some(stun) = &self.stun_server {
            config.rtsp.stun_server = stun.clone();
        }
        if self.no_zerocopy {
            config.buffers.zerocopy = false;
        }
        if self.verbose > 0 {
            config.logging.level = (2 + self.verbose as i32).min(4);
        }
        config.validate()?;
        Ok(config)
    }
}
