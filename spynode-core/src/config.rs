//! Node configuration: defaults, TOML file loading, CLI-flag overrides.
//!
//! Mirrors the teacher binary's `NodeConfig` (network selection, data
//! directory, daemon flag) plus the spy-node-specific policy knobs from the
//! external-interfaces surface (trusted peer address, fleet size, safe
//! delay, tracker retry policy).

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{crypto::Hash, Network};

/// Full configuration for a running spy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpyConfig {
    /// Which chain to track.
    pub network: Network,
    /// `host:port` of the single trusted peer.
    pub node_address: SocketAddr,
    /// User agent string sent in `version`.
    pub user_agent: String,
    /// Marks the earliest block of interest; headers at or before this
    /// hash are appended to the chain but not otherwise surfaced.
    pub start_hash: Option<Hash>,
    /// Target size of the untrusted peer fleet.
    pub untrusted_count: usize,
    /// Milliseconds between first sight of a tx and its safe promotion.
    #[serde(with = "duration_millis")]
    pub safe_tx_delay: Duration,
    /// How many peers to request `getdata` from in parallel per round
    /// ("shotgun" retry policy for the tx tracker).
    pub shotgun_count: usize,
    /// Retry interval before re-requesting a pending `getdata`.
    #[serde(with = "duration_millis")]
    pub retry_duration: Duration,
    /// Storage directory.
    pub data_dir: PathBuf,
    /// `tracing_subscriber` filter string (falls back to `RUST_LOG`).
    pub log_level: String,
    /// Whether the CLI wrapper should detach and run as a background
    /// process. The library itself does not act on this; it is read by
    /// the binary entrypoint.
    pub daemon: bool,
}

impl SpyConfig {
    /// Sane out-of-the-box values: mainnet, a loopback trusted peer, a
    /// modest fleet, and a five-minute safe-promotion delay.
    pub fn mainnet_defaults() -> Self {
        SpyConfig {
            network: Network::Mainnet,
            node_address: "127.0.0.1:8333".parse().unwrap(),
            user_agent: format!("/spynode:{}/", crate::VERSION),
            start_hash: None,
            untrusted_count: 8,
            safe_tx_delay: Duration::from_secs(5 * 60),
            shotgun_count: 3,
            retry_duration: Duration::from_secs(30),
            data_dir: PathBuf::from("./spynode-data"),
            log_level: "info".to_string(),
            daemon: false,
        }
    }

    /// Testnet defaults: same policy, different network/magic and port.
    pub fn testnet_defaults() -> Self {
        SpyConfig {
            network: Network::Testnet,
            node_address: "127.0.0.1:18333".parse().unwrap(),
            user_agent: format!("/spynode:{}-testnet/", crate::VERSION),
            data_dir: PathBuf::from("./spynode-data-testnet"),
            ..Self::mainnet_defaults()
        }
    }

    /// Load a config from a TOML file, falling back to network defaults for
    /// any field the file omits is not supported by `toml`'s flat
    /// deserialization, so the file must be complete; use
    /// [`SpyConfig::mainnet_defaults`]/[`SpyConfig::testnet_defaults`] as a
    /// starting template.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply a CLI-flag override for the trusted peer address, if given.
    pub fn with_node_address(mut self, addr: Option<SocketAddr>) -> Self {
        if let Some(addr) = addr {
            self.node_address = addr;
        }
        self
    }

    /// Apply a CLI-flag override for the data directory, if given.
    pub fn with_data_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.data_dir = dir;
        }
        self
    }

    /// Apply a CLI-flag override for the log level, if given.
    pub fn with_log_level(mut self, level: Option<String>) -> Self {
        if let Some(level) = level {
            self.log_level = level;
        }
        self
    }

    /// Validate cross-field invariants not expressible in the type alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.untrusted_count == 0 {
            return Err(ConfigError::Invalid("untrusted_count must be at least 1".to_string()));
        }
        if self.shotgun_count == 0 {
            return Err(ConfigError::Invalid("shotgun_count must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Configuration-layer errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {0}: {1}")]
    Io(String, String),
    #[error("could not parse config file: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_and_testnet_defaults_differ() {
        let mainnet = SpyConfig::mainnet_defaults();
        let testnet = SpyConfig::testnet_defaults();
        assert_ne!(mainnet.network, testnet.network);
        assert_ne!(mainnet.node_address.port(), testnet.node_address.port());
    }

    #[test]
    fn overrides_apply_only_when_some() {
        let config = SpyConfig::mainnet_defaults();
        let original_addr = config.node_address;
        let config = config.with_node_address(None);
        assert_eq!(config.node_address, original_addr);

        let new_addr: SocketAddr = "10.0.0.1:8333".parse().unwrap();
        let config = config.with_node_address(Some(new_addr));
        assert_eq!(config.node_address, new_addr);
    }

    #[test]
    fn validate_rejects_zero_fleet_size() {
        let mut config = SpyConfig::mainnet_defaults();
        config.untrusted_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trips_through_serde() {
        let config = SpyConfig::mainnet_defaults();
        let text = toml::to_string(&config).unwrap();
        let parsed: SpyConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.node_address, config.node_address);
        assert_eq!(parsed.safe_tx_delay, config.safe_tx_delay);
    }
}
