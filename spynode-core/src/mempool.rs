//! In-memory pool of unconfirmed transactions the node is tracking, with
//! conflict reporting instead of double-spend rejection: the spy node's job
//! is to *observe* conflicts, not adjudicate them, so both sides of a double
//! spend stay indexed until a block resolves it.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use thiserror::Error;

use crate::{
    crypto::Txid,
    network::{OutPoint, Transaction},
};

/// Mempool-layer errors. `add_transaction`/`remove_block_txids` are
/// infallible by design (conflicts are reported, never rejected), so this
/// exists for the listener-filter integration point, which can refuse a tx
/// for reasons outside the mempool's own invariants.
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("no registered filter accepted transaction {0}")]
    RejectedByFilters(Txid),
}

/// A transaction held in the mempool alongside its outpoint bindings.
#[derive(Debug, Clone)]
struct MempoolEntry {
    transaction: Transaction,
}

/// Unconfirmed-transaction pool with outpoint-conflict detection.
///
/// All state lives behind one lock: conflict detection and outpoint binding
/// must happen as a single atomic step, matching the upstream Go mempool's
/// single coarse-grained mutex.
pub struct Mempool {
    inner: Mutex<MempoolInner>,
}

struct MempoolInner {
    transactions: HashMap<Txid, MempoolEntry>,
    /// Maps a spent outpoint to the one txid currently bound to it.
    spent_outpoints: HashMap<OutPoint, Txid>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    /// Create an empty mempool.
    pub fn new() -> Self {
        Mempool {
            inner: Mutex::new(MempoolInner {
                transactions: HashMap::new(),
                spent_outpoints: HashMap::new(),
            }),
        }
    }

    /// Insert `tx`. Returns the set of txids whose outpoints collide with
    /// `tx`'s inputs, and whether `tx` was newly added. A tx already present
    /// is a no-op: `(∅, false)`. Conflicts never prevent insertion — both
    /// the new and the previously-bound spender remain indexed.
    pub fn add_transaction(&self, tx: Transaction) -> (HashSet<Txid>, bool) {
        let mut inner = self.inner.lock().unwrap();
        let txid = tx.txid();

        if inner.transactions.contains_key(&txid) {
            return (HashSet::new(), false);
        }

        let mut conflicts = HashSet::new();
        for outpoint in &tx.inputs {
            if let Some(owner) = inner.spent_outpoints.get(outpoint) {
                if *owner != txid {
                    conflicts.insert(*owner);
                }
            }
        }

        for outpoint in &tx.inputs {
            inner.spent_outpoints.insert(*outpoint, txid);
        }
        inner.transactions.insert(txid, MempoolEntry { transaction: tx });

        (conflicts, true)
    }

    /// Drop `txids` and their outpoint bindings, e.g. after a block commit.
    pub fn remove_block_txids(&self, txids: &[Txid]) {
        let mut inner = self.inner.lock().unwrap();
        for txid in txids {
            if inner.transactions.remove(txid).is_some() {
                inner.spent_outpoints.retain(|_, owner| owner != txid);
            }
        }
    }

    /// Whether `txid` is currently indexed.
    pub fn contains(&self, txid: Txid) -> bool {
        self.inner.lock().unwrap().transactions.contains_key(&txid)
    }

    /// Number of indexed transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().transactions.len()
    }

    /// Whether the mempool holds no transactions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
