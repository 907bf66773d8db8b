//! Storage layer: RocksDB-backed repositories for peers, header chain, and
//! transaction tracking.

use serde::{Deserialize, Serialize};

pub mod block_repo;
pub mod database;
pub mod peer_repo;
pub mod tx_repo;

pub use block_repo::{BlockRepository, BlockRepositoryError};
pub use database::{Database, DatabaseConfig, DatabaseError};
pub use peer_repo::{Peer, PeerRepository, PeerRepositoryError};
pub use tx_repo::{TxRecord, TxRepository, TxRepositoryError};

/// Tuning knobs for the backing RocksDB instance.
pub mod constants {
    /// Default cache size for RocksDB (128MB).
    pub const DEFAULT_CACHE_SIZE: usize = 128 * 1024 * 1024;
    /// Default write buffer size (64MB).
    pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;
    /// Maximum open files for RocksDB.
    pub const DEFAULT_MAX_OPEN_FILES: i32 = 1000;
    /// Target file size for compaction (64MB).
    pub const DEFAULT_TARGET_FILE_SIZE: u64 = 64 * 1024 * 1024;
    /// Bloom filter bits per key.
    pub const DEFAULT_BLOOM_FILTER_BITS: i32 = 10;
}

/// Storage configuration, shared by all three repositories (they share one
/// RocksDB instance, partitioned by key prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database directory.
    pub data_dir: String,
    /// Cache size in bytes.
    pub cache_size: usize,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Maximum open files.
    pub max_open_files: i32,
    /// Enable compression.
    pub enable_compression: bool,
    /// Enable statistics collection.
    pub enable_statistics: bool,
    /// Bloom filter bits per key.
    pub bloom_filter_bits: i32,
}

impl StorageConfig {
    /// Production defaults rooted at `data_dir`.
    pub fn new(data_dir: &str) -> Self {
        StorageConfig {
            data_dir: data_dir.to_string(),
            cache_size: constants::DEFAULT_CACHE_SIZE,
            write_buffer_size: constants::DEFAULT_WRITE_BUFFER_SIZE,
            max_open_files: constants::DEFAULT_MAX_OPEN_FILES,
            enable_compression: true,
            enable_statistics: true,
            bloom_filter_bits: constants::DEFAULT_BLOOM_FILTER_BITS,
        }
    }

    /// Smaller, uncompressed configuration for tests.
    pub fn test(data_dir: &str) -> Self {
        StorageConfig {
            data_dir: data_dir.to_string(),
            cache_size: 16 * 1024 * 1024,
            write_buffer_size: 8 * 1024 * 1024,
            max_open_files: 100,
            enable_compression: false,
            enable_statistics: false,
            bloom_filter_bits: 10,
        }
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.data_dir.is_empty() {
            return Err(StorageError::InvalidConfig("empty data directory".to_string()));
        }
        if self.cache_size == 0 {
            return Err(StorageError::InvalidConfig("cache size cannot be zero".to_string()));
        }
        if self.write_buffer_size == 0 {
            return Err(StorageError::InvalidConfig("write buffer size cannot be zero".to_string()));
        }
        if self.max_open_files <= 0 {
            return Err(StorageError::InvalidConfig("max open files must be positive".to_string()));
        }
        Ok(())
    }
}

/// Storage-layer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage corrupted: {0}")]
    Corrupted(String),
    #[error("not found")]
    NotFound,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_config_defaults_are_sane() {
        let config = StorageConfig::new("/tmp/spynode_test");
        assert_eq!(config.data_dir, "/tmp/spynode_test");
        assert!(config.cache_size > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn storage_config_rejects_empty_data_dir() {
        let mut config = StorageConfig::new("/tmp/spynode_test");
        config.data_dir = String::new();
        assert!(matches!(config.validate(), Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn storage_config_rejects_zero_cache() {
        let mut config = StorageConfig::new("/tmp/spynode_test");
        config.cache_size = 0;
        assert!(config.validate().is_err());
    }
}
