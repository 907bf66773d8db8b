//! Crate-level error aggregation. Each subsystem defines its own `thiserror`
//! enum; `SpyNodeError` folds them together via `#[from]` so the handler
//! layer and the supervised tasks can propagate a single type. `anyhow` is
//! reserved for the CLI boundary, where the final error just needs to be
//! printed and turned into an exit code.

use thiserror::Error;

use crate::{
    mempool::MempoolError,
    network::{NetworkError, ProtocolError},
    storage::{BlockRepositoryError, PeerRepositoryError, StorageError, TxRepositoryError},
};

/// The crate's unified error type.
#[derive(Debug, Error)]
pub enum SpyNodeError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    TxRepository(#[from] TxRepositoryError),
    #[error(transparent)]
    BlockRepository(#[from] BlockRepositoryError),
    #[error(transparent)]
    PeerRepository(#[from] PeerRepositoryError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("a registered listener returned an error: {0}")]
    Listener(String),
}

impl SpyNodeError {
    /// Whether this error should trigger the trusted node's restart policy
    /// (transport loss, malformed framing) as opposed to a local-only
    /// failure (configuration, a listener's own error) that should simply
    /// propagate out of `Run`.
    pub fn is_restartable(&self) -> bool {
        matches!(self, SpyNodeError::Network(_) | SpyNodeError::Protocol(_))
    }
}

/// Convenience alias used across handler and task signatures.
pub type SpyNodeResult<T> = Result<T, SpyNodeError>;
