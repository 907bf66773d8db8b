// Spynode Core Library
//
// Implements a peer-to-peer "spy" node for a UTXO-based cryptocurrency
// network: a client that maintains a trusted connection to one full node
// and a rotating fleet of untrusted peers, tracks unconfirmed transactions
// with a double-spend awareness model, and surfaces a "safe" signal once a
// configurable quiescence window has elapsed without conflict.
//
// Full block validation, mining, and wallet key management are out of
// scope; this crate tracks header-chain continuity and transaction
// relationships only.

#![allow(dead_code)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod mempool;
pub mod network;
pub mod node;
pub mod promoter;
pub mod state;
pub mod storage;
pub mod tx_tracker;
pub mod untrusted;

pub use config::SpyConfig;
pub use crypto::{BlockHash, Hash, Txid};
pub use error::SpyNodeError;
pub use listener::Listener;
pub use network::{Block, BlockHeader, OutPoint, Transaction};
pub use node::Node;
pub use state::{ConnectionPhase, Source};
pub use untrusted::UntrustedFleet;

/// Crate version, re-exported for `version` message user agents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Which chain a node is tracking. Distinct magic bytes keep the two
/// networks from accidentally cross-connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Network {
    /// Production chain.
    Mainnet,
    /// Public test chain.
    Testnet,
}

impl Network {
    /// Network magic bytes for wire framing.
    pub fn magic_bytes(self) -> [u8; 4] {
        match self {
            Network::Mainnet => network::protocol::SPYNODE_MAINNET_MAGIC,
            Network::Testnet => network::protocol::SPYNODE_TESTNET_MAGIC,
        }
    }

    /// Lowercase name, as used in config files and CLI flags.
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}
