//! Network layer: wire protocol framing and connection-level configuration.

pub mod protocol;

use std::time::Duration;

pub use protocol::*;
use thiserror::Error;

/// Progressive connection timeouts, applied to both the trusted and untrusted
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// TCP connection establishment timeout.
    pub tcp_connect: Duration,
    /// Handshake (version/verack exchange) timeout.
    pub handshake: Duration,
    /// Headers-request round trip timeout.
    pub headers_request: Duration,
    /// `getdata(tx)` round trip timeout before the tracker drops the entry.
    pub getdata_request: Duration,
    /// Poll interval for the request-timeout monitor task.
    pub timeout_check_interval: Duration,
    /// Poll interval for the safe-delay promoter task.
    pub safe_delay_check_interval: Duration,
    /// Poll interval for the untrusted-fleet supervisor task.
    pub fleet_check_interval: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        ConnectionTimeouts {
            tcp_connect: Duration::from_secs(10),
            handshake: Duration::from_secs(15),
            headers_request: Duration::from_secs(30),
            getdata_request: Duration::from_secs(60),
            timeout_check_interval: Duration::from_secs(10),
            safe_delay_check_interval: Duration::from_millis(200),
            fleet_check_interval: Duration::from_secs(5),
        }
    }
}

/// Network-level configuration shared by the trusted connection and the
/// untrusted fleet. Protocol-magic and peer-selection policy live here;
/// spy-node-specific policy (safe delay, start hash, fleet size) lives in
/// [`crate::config::SpyConfig`].
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// User agent string sent in `version`.
    pub user_agent: String,
    /// Whether to use testnet magic bytes.
    pub testnet: bool,
    /// Progressive timeouts.
    pub timeouts: ConnectionTimeouts,
    /// Outgoing channel capacity, recreated on every reconnect.
    pub outgoing_queue_size: usize,
}

impl NetworkConfig {
    /// Mainnet defaults.
    pub fn mainnet() -> Self {
        NetworkConfig {
            user_agent: "/spynode:0.1.0/".to_string(),
            testnet: false,
            timeouts: ConnectionTimeouts::default(),
            outgoing_queue_size: 100,
        }
    }

    /// Testnet defaults.
    pub fn testnet() -> Self {
        NetworkConfig {
            user_agent: "/spynode:0.1.0-testnet/".to_string(),
            testnet: true,
            timeouts: ConnectionTimeouts::default(),
            outgoing_queue_size: 100,
        }
    }

    /// Network magic bytes for framing.
    pub fn magic_bytes(&self) -> [u8; 4] {
        if self.testnet {
            protocol::SPYNODE_TESTNET_MAGIC
        } else {
            protocol::SPYNODE_MAINNET_MAGIC
        }
    }
}

/// Network-layer errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("dial failed for {addr}: {source}")]
    Dial { addr: String, source: std::io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection timed out: {0}")]
    Timeout(&'static str),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_and_testnet_have_distinct_magic() {
        assert_ne!(NetworkConfig::mainnet().magic_bytes(), NetworkConfig::testnet().magic_bytes());
    }

    #[test]
    fn default_timeouts_are_sane() {
        let t = ConnectionTimeouts::default();
        assert!(t.getdata_request > t.timeout_check_interval);
        assert!(t.fleet_check_interval > t.safe_delay_check_interval);
    }
}
