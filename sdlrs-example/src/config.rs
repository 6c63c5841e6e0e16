//! Configuration file of the ground station.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sdlrs::config::{DownlinkConfig, UplinkConfig};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading the configuration failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing the configuration failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid log level {0}")]
    InvalidLogLevel(String),
    #[error("uplink virtual channel {0} is configured twice")]
    DuplicateUplinkVc(u8),
    #[error("uplink virtual channel {0}: the window width must not be 0")]
    InvalidWindowWidth(u8),
    #[error("uplink virtual channel {0}: the transmission limit must not be 0")]
    InvalidTxLimit(u8),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> Result<log::LevelFilter, ConfigError> {
        log::LevelFilter::from_str(&self.level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.level.clone()))
    }
}

/// UDP endpoints of the ground station.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Raw downlink frames are received here, one frame per datagram.
    pub downlink_bind: SocketAddr,
    /// Reassembled packets are sent to this address.
    pub packet_out: SocketAddr,
    /// Telecommands are received here. The first byte of a datagram is the virtual channel ID,
    /// the second byte holds the bypass flag in bit 0, the rest is the command.
    pub command_bind: SocketAddr,
    /// Encoded uplink frames or CLTUs are sent to this address.
    pub uplink_out: SocketAddr,
    /// Wrap the uplink frames into CLTUs.
    #[serde(default)]
    pub cltu: bool,
    /// Randomize the frames inside the CLTUs.
    #[serde(default)]
    pub randomize: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroundStationConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub downlink: DownlinkConfig,
    #[serde(default)]
    pub uplink: UplinkConfig,
}

impl GroundStationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.level_filter()?;
        let mut vc_ids = HashSet::new();
        for vc_config in &self.uplink.virtual_channels {
            if !vc_ids.insert(vc_config.vc_id) {
                return Err(ConfigError::DuplicateUplinkVc(vc_config.vc_id));
            }
            if vc_config.window_width == 0 {
                return Err(ConfigError::InvalidWindowWidth(vc_config.vc_id));
            }
            if vc_config.tx_limit == 0 {
                return Err(ConfigError::InvalidTxLimit(vc_config.vc_id));
            }
        }
        Ok(())
    }
}

impl FromStr for GroundStationConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: GroundStationConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

pub fn load(path: &Path) -> Result<GroundStationConfig, ConfigError> {
    std::fs::read_to_string(path)?.parse()
}
