//! Persisted record of every transaction the node is tracking, confirmed or not.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

use crate::{crypto::Txid, storage::Database};

const UNCONFIRMED_PREFIX: &[u8] = b"txs/unconfirmed/";
const CONFIRMED_PREFIX: &[u8] = b"txs/confirmed/";

/// A tracked transaction's lifecycle state.
///
/// `height == -1` means unconfirmed. `unsafe` and `safe` are mutually
/// exclusive; once `unsafe` is set it is permanent; `safe` transitions
/// false to true at most once, and only while `unsafe` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRecord {
    /// The transaction's id.
    pub txid: Txid,
    /// Confirmation height, or -1 if unconfirmed.
    pub height: i32,
    /// Unix milliseconds when this txid was first seen.
    pub seen_ms: i64,
    /// Whether a conflicting outpoint has ever been observed for this tx.
    pub unsafe_: bool,
    /// Whether the safe-delay promoter has already marked this tx safe.
    pub safe: bool,
}

impl TxRecord {
    fn new_unconfirmed(txid: Txid, seen_ms: i64) -> Self {
        TxRecord { txid, height: -1, seen_ms, unsafe_: false, safe: false }
    }

    fn encode(&self) -> [u8; 10] {
        let mut buf = [0u8; 10];
        buf[0..8].copy_from_slice(&self.seen_ms.to_le_bytes());
        buf[8] = self.unsafe_ as u8;
        buf[9] = self.safe as u8;
        buf
    }

    fn decode(txid: Txid, bytes: &[u8]) -> Result<Self, TxRepositoryError> {
        if bytes.len() != 10 {
            return Err(TxRepositoryError::CorruptRecord(bytes.len()));
        }
        let seen_ms = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        Ok(TxRecord { txid, height: -1, seen_ms, unsafe_: bytes[8] != 0, safe: bytes[9] != 0 })
    }
}

/// Errors from the transaction repository.
#[derive(Debug, Error)]
pub enum TxRepositoryError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::DatabaseError),
    #[error("corrupt unconfirmed record: expected 10 bytes, got {0}")]
    CorruptRecord(usize),
}

/// Durable tracker for every txid the node cares about, confirmed or not.
///
/// Backed by the shared [`Database`] under the `txs/unconfirmed/` and
/// `txs/confirmed/` key prefixes. The key suffix is the txid's 64-character
/// hex encoding (not the raw 32 bytes), followed by a 10-byte encoded value
/// (`seen_ms:i64 LE || unsafe:u8 || safe:u8`) for unconfirmed records.
pub struct TxRepository {
    db: Arc<Database>,
}

impl TxRepository {
    /// Open the repository over a shared database handle.
    pub fn new(db: Arc<Database>) -> Self {
        TxRepository { db }
    }

    fn unconfirmed_key(txid: Txid) -> Vec<u8> {
        let mut key = UNCONFIRMED_PREFIX.to_vec();
        key.extend_from_slice(txid.to_hex().as_bytes());
        key
    }

    fn confirmed_key(height: i32, txid: Txid) -> Vec<u8> {
        let mut key = CONFIRMED_PREFIX.to_vec();
        key.extend_from_slice(height.to_string().as_bytes());
        key.push(b'/');
        key.extend_from_slice(txid.to_hex().as_bytes());
        key
    }

    fn now_ms() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
    }

    /// Add a txid at `height` (-1 for unconfirmed). Returns `true` if this
    /// call created the record (the guard the tx handler uses to avoid
    /// double-processing a tx arriving on two paths at once).
    pub fn add(&self, txid: Txid, height: i32) -> Result<bool, TxRepositoryError> {
        if height >= 0 {
            let key = Self::confirmed_key(height, txid);
            if self.db.exists(&key)? {
                return Ok(false);
            }
            self.db.put(&key, &[])?;
            return Ok(true);
        }

        let key = Self::unconfirmed_key(txid);
        if self.db.exists(&key)? {
            return Ok(false);
        }
        let record = TxRecord::new_unconfirmed(txid, Self::now_ms());
        self.db.put(&key, &record.encode())?;
        Ok(true)
    }

    /// Look up a transaction's current unconfirmed record, if any.
    pub fn get_unconfirmed(&self, txid: Txid) -> Result<Option<TxRecord>, TxRepositoryError> {
        match self.db.get(&Self::unconfirmed_key(txid))? {
            Some(bytes) => Ok(Some(TxRecord::decode(txid, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a txid's unconfirmed (`height < 0`) or confirmed record.
    pub fn remove(&self, txid: Txid, height: i32) -> Result<bool, TxRepositoryError> {
        if height >= 0 {
            let key = Self::confirmed_key(height, txid);
            if !self.db.exists(&key)? {
                return Ok(false);
            }
            self.db.delete(&key)?;
            return Ok(true);
        }
        let key = Self::unconfirmed_key(txid);
        if !self.db.exists(&key)? {
            return Ok(false);
        }
        self.db.delete(&key)?;
        Ok(true)
    }

    /// Mark a txid's unconfirmed record unsafe. Returns `true` if it was
    /// marked (i.e. the record existed); idempotent on an already-unsafe
    /// record.
    pub fn mark_unsafe(&self, txid: Txid) -> Result<bool, TxRepositoryError> {
        let key = Self::unconfirmed_key(txid);
        match self.db.get(&key)? {
            Some(bytes) => {
                let mut record = TxRecord::decode(txid, &bytes)?;
                record.unsafe_ = true;
                self.db.put(&key, &record.encode())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the unconfirmed record for `txid` and add a confirmed record
    /// at `height`. The spy node never copies `unsafe`/`safe` state forward:
    /// a listener that needs cleanup observes it via the `Confirmed` event.
    pub fn add_confirmed(&self, txid: Txid, height: i32) -> Result<(), TxRepositoryError> {
        self.remove(txid, -1)?;
        self.add(txid, height)?;
        Ok(())
    }

    /// Every unconfirmed txid that is neither safe nor unsafe and was first
    /// seen before `before_ms`. Marks each returned txid safe as a side
    /// effect — this is the only path allowed to set `safe = true`.
    pub fn get_new_safe(&self, before_ms: i64) -> Result<Vec<Txid>, TxRepositoryError> {
        let mut result = Vec::new();
        for entry in self.db.iter_prefix(UNCONFIRMED_PREFIX) {
            let (key, value) = entry?;
            let txid = Txid::from_hex(std::str::from_utf8(&key[UNCONFIRMED_PREFIX.len()..]).unwrap())
                .map_err(|_| TxRepositoryError::CorruptRecord(key.len()))?;
            let mut record = TxRecord::decode(txid, &value)?;
            if !record.safe && !record.unsafe_ && record.seen_ms < before_ms {
                record.safe = true;
                self.db.put(&key, &record.encode())?;
                result.push(txid);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DatabaseConfig, StorageConfig};

    fn repo(dir: &std::path::Path) -> TxRepository {
        let config = StorageConfig::test(dir.to_str().unwrap());
        let db = Database::open(dir, DatabaseConfig::from_storage_config(&config)).unwrap();
        TxRepository::new(Arc::new(db))
    }

    #[test]
    fn add_then_remove_unconfirmed_round_trips() {
        let dir = tempfile_dir("tx_repo_add_remove");
        let repo = repo(&dir);
        let txid = Txid::random();

        assert!(repo.add(txid, -1).unwrap());
        assert!(!repo.add(txid, -1).unwrap(), "second add must report already-present");
        assert!(repo.get_unconfirmed(txid).unwrap().is_some());

        assert!(repo.remove(txid, -1).unwrap());
        assert!(repo.get_unconfirmed(txid).unwrap().is_none());
    }

    #[test]
    fn mark_unsafe_then_get_new_safe_excludes_it() {
        let dir = tempfile_dir("tx_repo_unsafe_excluded");
        let repo = repo(&dir);
        let txid = Txid::random();
        repo.add(txid, -1).unwrap();
        assert!(repo.mark_unsafe(txid).unwrap());

        let safe = repo.get_new_safe(TxRepository::now_ms() + 10_000).unwrap();
        assert!(!safe.contains(&txid));
    }

    #[test]
    fn get_new_safe_marks_returned_txids_safe() {
        let dir = tempfile_dir("tx_repo_get_new_safe");
        let repo = repo(&dir);
        let txid = Txid::random();
        repo.add(txid, -1).unwrap();

        let cutoff = TxRepository::now_ms() + 1;
        let safe = repo.get_new_safe(cutoff).unwrap();
        assert_eq!(safe, vec![txid]);

        // Second call before a new cutoff should not return it again.
        let safe_again = repo.get_new_safe(cutoff).unwrap();
        assert!(safe_again.is_empty());
    }

    #[test]
    fn add_confirmed_removes_unconfirmed_record() {
        let dir = tempfile_dir("tx_repo_add_confirmed");
        let repo = repo(&dir);
        let txid = Txid::random();
        repo.add(txid, -1).unwrap();

        repo.add_confirmed(txid, 42).unwrap();
        assert!(repo.get_unconfirmed(txid).unwrap().is_none());
    }

    fn tempfile_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("spynode-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }
}
