//! Persisted peer address book, plus the in-memory reuse-avoidance window
//! the untrusted fleet uses to avoid reconnecting to a peer too soon.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::Database;

const PEERS_PREFIX: &[u8] = b"peers/";

/// Avoid reconnecting to the same untrusted address within this window,
/// even if it is otherwise eligible, so the fleet doesn't collapse onto a
/// handful of always-reachable peers.
pub const ADDRESS_REUSE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// A remembered peer: its handshake-quality score and when it was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// +5 on a verified handshake, -1 on a connection failure, floor 0.
    pub score: i32,
    /// Unix seconds of the last successful contact.
    pub last_seen: i64,
}

impl Peer {
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Peer serialization is infallible")
    }

    fn decode(bytes: &[u8]) -> Result<Self, PeerRepositoryError> {
        bincode::deserialize(bytes).map_err(|e| PeerRepositoryError::Corrupt(e.to_string()))
    }
}

/// Errors from the peer repository.
#[derive(Debug, Error)]
pub enum PeerRepositoryError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::DatabaseError),
    #[error("corrupt peer record: {0}")]
    Corrupt(String),
}

/// Durable address book of untrusted peers, keyed by `host:port`, plus an
/// in-memory avoid-list for the address-reuse window. The avoid-list is
/// intentionally not persisted: a restart is allowed to immediately retry
/// whatever it last knew.
pub struct PeerRepository {
    db: Arc<Database>,
    recently_used: Mutex<HashMap<SocketAddr, Instant>>,
}

impl PeerRepository {
    /// Open the repository over a shared database handle.
    pub fn new(db: Arc<Database>) -> Self {
        PeerRepository { db, recently_used: Mutex::new(HashMap::new()) }
    }

    fn key(addr: SocketAddr) -> Vec<u8> {
        let mut key = PEERS_PREFIX.to_vec();
        key.extend_from_slice(addr.to_string().as_bytes());
        key
    }

    fn now_secs() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
    }

    /// Look up a peer record.
    pub fn get(&self, addr: SocketAddr) -> Result<Option<Peer>, PeerRepositoryError> {
        match self.db.get(&Self::key(addr))? {
            Some(bytes) => Ok(Some(Peer::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record an address learned from an `addr` message: a new address is
    /// added at score 0, an already-known one just has `last_seen` refreshed.
    pub fn learn(&self, addr: SocketAddr) -> Result<(), PeerRepositoryError> {
        let peer = match self.get(addr)? {
            Some(mut existing) => {
                existing.last_seen = Self::now_secs();
                existing
            }
            None => Peer { score: 0, last_seen: Self::now_secs() },
        };
        self.db.put(&Self::key(addr), &peer.encode())?;
        Ok(())
    }

    /// Reward a verified handshake: `+5` to score, refresh `last_seen`.
    pub fn record_success(&self, addr: SocketAddr) -> Result<Peer, PeerRepositoryError> {
        let mut peer = self.get(addr)?.unwrap_or(Peer { score: 0, last_seen: 0 });
        peer.score += 5;
        peer.last_seen = Self::now_secs();
        self.db.put(&Self::key(addr), &peer.encode())?;
        self.recently_used.lock().unwrap().insert(addr, Instant::now());
        Ok(peer)
    }

    /// Penalize a connection failure: `-1` to score. Unfloored: a peer that
    /// keeps failing falls below the ones we've simply never contacted.
    pub fn record_failure(&self, addr: SocketAddr) -> Result<Peer, PeerRepositoryError> {
        let mut peer = self.get(addr)?.unwrap_or(Peer { score: 0, last_seen: 0 });
        peer.score -= 1;
        self.db.put(&Self::key(addr), &peer.encode())?;
        self.recently_used.lock().unwrap().insert(addr, Instant::now());
        Ok(peer)
    }

    /// All known addresses, highest score first.
    pub fn all(&self) -> Result<Vec<(SocketAddr, Peer)>, PeerRepositoryError> {
        let mut result = Vec::new();
        for item in self.db.iter_prefix(PEERS_PREFIX) {
            let (key, value) = item?;
            let addr_str = std::str::from_utf8(&key[PEERS_PREFIX.len()..])
                .map_err(|_| PeerRepositoryError::Corrupt("non-utf8 peer key".into()))?;
            let addr: SocketAddr = addr_str
                .parse()
                .map_err(|_| PeerRepositoryError::Corrupt(format!("bad address {addr_str}")))?;
            result.push((addr, Peer::decode(&value)?));
        }
        result.sort_by(|a, b| b.1.score.cmp(&a.1.score));
        Ok(result)
    }

    /// Whether `addr` was used within [`ADDRESS_REUSE_WINDOW`] and should be
    /// skipped when picking the fleet's next dial candidate.
    pub fn recently_used(&self, addr: SocketAddr) -> bool {
        match self.recently_used.lock().unwrap().get(&addr) {
            Some(at) => at.elapsed() < ADDRESS_REUSE_WINDOW,
            None => false,
        }
    }

    /// Pick the best candidate address not currently in the reuse window,
    /// preferring higher scores. `min_score` lets the fleet supervisor widen
    /// its net once the fleet has fallen under half its target size.
    pub fn pick_address(&self, min_score: i32) -> Result<Option<SocketAddr>, PeerRepositoryError> {
        for (addr, peer) in self.all()? {
            if peer.score < min_score {
                continue;
            }
            if self.recently_used(addr) {
                continue;
            }
            return Ok(Some(addr));
        }
        Ok(None)
    }
}
