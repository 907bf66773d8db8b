//! Persisted header chain: one confirmed hash per height, append-only.

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::{crypto::BlockHash, storage::Database};

const BLOCKS_PREFIX: &[u8] = b"blocks/";

/// Errors from the block repository.
#[derive(Debug, Error)]
pub enum BlockRepositoryError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::DatabaseError),
    #[error("corrupt block record at height {0}: expected 32 bytes, got {1}")]
    CorruptRecord(u32, usize),
    #[error("chain discontinuity: attempted to append height {attempted} with previous {previous}, but chain tip is at height {tip} with hash {tip_hash}")]
    ChainDiscontinuity { attempted: u32, previous: BlockHash, tip: i32, tip_hash: BlockHash },
}

/// Append-only header chain: a contiguous run of `height -> hash` entries
/// starting at 0, cached in memory alongside the RocksDB copy so lookups
/// and locator construction don't round-trip to disk.
pub struct BlockRepository {
    db: Arc<Database>,
    /// In-memory mirror of every persisted height, index == height.
    heights: RwLock<Vec<BlockHash>>,
}

impl BlockRepository {
    /// Open the repository, loading the existing chain from `db` into memory.
    pub fn open(db: Arc<Database>) -> Result<Self, BlockRepositoryError> {
        let mut entries: Vec<(u32, BlockHash)> = Vec::new();
        for item in db.iter_prefix(BLOCKS_PREFIX) {
            let (key, value) = item?;
            let height_str = std::str::from_utf8(&key[BLOCKS_PREFIX.len()..]).unwrap_or("");
            let height = u32::from_str_radix(height_str, 16)
                .map_err(|_| BlockRepositoryError::CorruptRecord(0, key.len()))?;
            if value.len() != 32 {
                return Err(BlockRepositoryError::CorruptRecord(height, value.len()));
            }
            entries.push((height, BlockHash::from_slice(&value).unwrap()));
        }
        entries.sort_by_key(|(h, _)| *h);
        let heights = entries.into_iter().map(|(_, h)| h).collect();
        Ok(BlockRepository { db, heights: RwLock::new(heights) })
    }

    fn key(height: u32) -> Vec<u8> {
        let mut key = BLOCKS_PREFIX.to_vec();
        key.extend_from_slice(format!("{height:08x}").as_bytes());
        key
    }

    /// Height of the chain tip, or -1 if the chain is empty.
    pub fn last_height(&self) -> i32 {
        let heights = self.heights.read().unwrap();
        heights.len() as i32 - 1
    }

    /// Hash at `height`, if known.
    pub fn hash(&self, height: u32) -> Option<BlockHash> {
        let heights = self.heights.read().unwrap();
        heights.get(height as usize).copied()
    }

    /// Height of `hash`, if it is part of the chain, and whether it exists.
    pub fn height(&self, hash: BlockHash) -> (i32, bool) {
        let heights = self.heights.read().unwrap();
        match heights.iter().position(|h| *h == hash) {
            Some(idx) => (idx as i32, true),
            None => (-1, false),
        }
    }

    /// Append a block at `height`, verifying it continues the chain:
    /// `height` must be `last_height() + 1` and `previous` must equal
    /// the hash currently at `height - 1` (the genesis block, at height 0,
    /// has no predecessor to check).
    pub fn append(
        &self,
        height: u32,
        hash: BlockHash,
        previous: BlockHash,
    ) -> Result<(), BlockRepositoryError> {
        let expected_height = self.last_height() + 1;
        if height as i32 != expected_height {
            return Err(BlockRepositoryError::ChainDiscontinuity {
                attempted: height,
                previous,
                tip: self.last_height(),
                tip_hash: self.hash(self.last_height().max(0) as u32).unwrap_or_else(BlockHash::zero),
            });
        }
        if height > 0 {
            let expected_prev = self.hash(height - 1).unwrap_or_else(BlockHash::zero);
            if previous != expected_prev {
                return Err(BlockRepositoryError::ChainDiscontinuity {
                    attempted: height,
                    previous,
                    tip: self.last_height(),
                    tip_hash: expected_prev,
                });
            }
        }

        self.db.put(&Self::key(height), hash.as_slice())?;
        self.heights.write().unwrap().push(hash);
        Ok(())
    }

    /// Build a block locator: hashes at `tip - delta`, `tip - 2*delta`,
    /// `tip - 4*delta`, ... doubling the gap every step, stopping once
    /// `delta` would walk past the tip or `max` entries have been collected.
    /// Mirrors the upstream `buildHeaderRequest` construction so a peer can
    /// find the common ancestor in O(log n) round trips.
    pub fn build_locator(&self, delta_initial: u32, max: usize) -> Vec<BlockHash> {
        let heights = self.heights.read().unwrap();
        let tip = heights.len() as i64 - 1;
        if tip < 0 {
            return Vec::new();
        }

        let mut locator = Vec::new();
        let mut delta = delta_initial as i64;

        while delta <= tip {
            let height = (tip - delta) as usize;
            locator.push(heights[height]);
            if locator.len() > max {
                break;
            }
            if tip <= delta {
                break;
            }
            delta *= 2;
        }

        locator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DatabaseConfig, StorageConfig};

    fn open_repo(dir: &std::path::Path) -> BlockRepository {
        let config = StorageConfig::test(dir.to_str().unwrap());
        let db = Database::open(dir, DatabaseConfig::from_storage_config(&config)).unwrap();
        BlockRepository::open(Arc::new(db)).unwrap()
    }

    fn dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("spynode-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn empty_chain_has_no_tip() {
        let repo = open_repo(&dir("block_repo_empty"));
        assert_eq!(repo.last_height(), -1);
        assert!(repo.build_locator(1, 50).is_empty());
    }

    #[test]
    fn append_extends_chain_and_rejects_gap() {
        let repo = open_repo(&dir("block_repo_append"));
        let genesis = BlockHash::from_bytes([1u8; 32]);
        repo.append(0, genesis, BlockHash::zero()).unwrap();
        assert_eq!(repo.last_height(), 0);
        assert_eq!(repo.hash(0), Some(genesis));

        let block1 = BlockHash::from_bytes([2u8; 32]);
        let err = repo.append(2, block1, genesis).unwrap_err();
        assert!(matches!(err, BlockRepositoryError::ChainDiscontinuity { .. }));
    }

    #[test]
    fn append_rejects_wrong_previous_hash() {
        let repo = open_repo(&dir("block_repo_wrong_prev"));
        let genesis = BlockHash::from_bytes([1u8; 32]);
        repo.append(0, genesis, BlockHash::zero()).unwrap();

        let block1 = BlockHash::from_bytes([2u8; 32]);
        let wrong_prev = BlockHash::from_bytes([9u8; 32]);
        let err = repo.append(1, block1, wrong_prev).unwrap_err();
        assert!(matches!(err, BlockRepositoryError::ChainDiscontinuity { .. }));
    }

    #[test]
    fn locator_doubles_the_gap_each_step() {
        let repo = open_repo(&dir("block_repo_locator"));
        let mut prev = BlockHash::zero();
        for i in 0..15u32 {
            let hash = BlockHash::from_bytes([i as u8 + 1; 32]);
            repo.append(i, hash, prev).unwrap();
            prev = hash;
        }

        // tip = 14, delta starts at 1 and doubles: 1, 2, 4, 8, (16 > tip, stop)
        let locator = repo.build_locator(1, 50);
        let expected: Vec<BlockHash> =
            [13, 12, 10, 6].iter().map(|&h| repo.hash(h).unwrap()).collect();
        assert_eq!(locator, expected);
    }

    #[test]
    fn locator_stops_at_max_entries() {
        let repo = open_repo(&dir("block_repo_locator_max"));
        let mut prev = BlockHash::zero();
        for i in 0..15u32 {
            let hash = BlockHash::from_bytes([i as u8 + 1; 32]);
            repo.append(i, hash, prev).unwrap();
            prev = hash;
        }

        let locator = repo.build_locator(1, 2);
        assert_eq!(locator.len(), 3);
        assert_eq!(locator[0], repo.hash(13).unwrap());
    }

    #[test]
    fn reopen_restores_chain_from_disk() {
        let path = dir("block_repo_reopen");
        let genesis = BlockHash::from_bytes([1u8; 32]);
        {
            let repo = open_repo(&path);
            repo.append(0, genesis, BlockHash::zero()).unwrap();
        }
        let config = StorageConfig::test(path.to_str().unwrap());
        let db = Database::open(&path, DatabaseConfig::from_storage_config(&config)).unwrap();
        let repo = BlockRepository::open(Arc::new(db)).unwrap();
        assert_eq!(repo.last_height(), 0);
        assert_eq!(repo.hash(0), Some(genesis));
    }
}
