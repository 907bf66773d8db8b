//! Tracks outstanding `getdata(tx)` requests: a txid is pending iff it was
//! announced via `inv` and neither a `tx` nor a `notfound` has resolved it
//! yet. Grounded in the upstream Go tracker's retry/timeout loop over
//! outgoing requests.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{
    crypto::Txid,
    mempool::Mempool,
    network::{InvType, InventoryVector},
};

struct PendingEntry {
    first_requested_at: Instant,
    last_requested_at: Instant,
}

/// Pending `getdata(tx)` bookkeeping for one connection.
pub struct TxTracker {
    pending: Mutex<HashMap<Txid, PendingEntry>>,
    retry_interval: Duration,
    timeout: Duration,
}

impl TxTracker {
    /// Create a tracker with the given retry interval and absolute timeout.
    pub fn new(retry_interval: Duration, timeout: Duration) -> Self {
        TxTracker { pending: Mutex::new(HashMap::new()), retry_interval, timeout }
    }

    /// Record that `txid` was announced and should be requested.
    pub fn add(&self, txid: Txid) {
        let mut pending = self.pending.lock().unwrap();
        pending.entry(txid).or_insert_with(|| {
            let now = Instant::now();
            PendingEntry { first_requested_at: now, last_requested_at: now }
        });
    }

    /// Drop `txids` from tracking: called after the tx itself arrives, a
    /// `notfound` resolves it, or its block commits.
    pub fn remove(&self, txids: &[Txid]) {
        let mut pending = self.pending.lock().unwrap();
        for txid in txids {
            pending.remove(txid);
        }
    }

    /// Whether `txid` currently has an outstanding request.
    pub fn is_pending(&self, txid: Txid) -> bool {
        self.pending.lock().unwrap().contains_key(&txid)
    }

    /// Emit `getdata` inventory for every pending txid not already in
    /// `mempool`, re-issuing any entry whose retry interval has elapsed and
    /// dropping any entry past its absolute timeout. Pure with respect to
    /// side effects outside the tracker's own state: the caller is
    /// responsible for actually enqueuing the returned inventory.
    pub fn check(&self, mempool: &Mempool) -> Vec<InventoryVector> {
        let mut pending = self.pending.lock().unwrap();
        let now = Instant::now();
        let mut outgoing = Vec::new();
        let mut expired = Vec::new();

        for (txid, entry) in pending.iter_mut() {
            if mempool.contains(*txid) {
                expired.push(*txid);
                continue;
            }
            if now.duration_since(entry.first_requested_at) >= self.timeout {
                expired.push(*txid);
                continue;
            }
            if now.duration_since(entry.last_requested_at) >= self.retry_interval {
                entry.last_requested_at = now;
                outgoing.push(InventoryVector { inv_type: InvType::Tx, hash: *txid });
            }
        }

        for txid in expired {
            pending.remove(&txid);
        }

        outgoing
    }

    /// Number of txids currently pending.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Whether no txids are currently pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn add_then_remove_clears_pending() {
        let tracker = TxTracker::new(Duration::from_millis(10), Duration::from_secs(60));
        let txid = Txid::random();
        tracker.add(txid);
        assert!(tracker.is_pending(txid));
        tracker.remove(&[txid]);
        assert!(!tracker.is_pending(txid));
    }

    #[test]
    fn check_skips_entries_already_in_mempool() {
        let tracker = TxTracker::new(Duration::from_millis(0), Duration::from_secs(60));
        let mempool = Mempool::new();
        let tx = crate::network::Transaction { txid: Txid::random(), inputs: vec![], raw: vec![] };
        let txid = tx.txid();
        tracker.add(txid);
        mempool.add_transaction(tx);

        let outgoing = tracker.check(&mempool);
        assert!(outgoing.is_empty());
        assert!(!tracker.is_pending(txid), "resolved entries should be dropped");
    }

    #[test]
    fn check_reissues_after_retry_interval_elapses() {
        let tracker = TxTracker::new(Duration::from_millis(1), Duration::from_secs(60));
        let mempool = Mempool::new();
        let txid = Txid::random();
        tracker.add(txid);
        sleep(Duration::from_millis(5));

        let outgoing = tracker.check(&mempool);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].hash, txid);
    }

    #[test]
    fn check_drops_entries_past_absolute_timeout() {
        let tracker = TxTracker::new(Duration::from_millis(1), Duration::from_millis(5));
        let mempool = Mempool::new();
        let txid = Txid::random();
        tracker.add(txid);
        sleep(Duration::from_millis(20));

        tracker.check(&mempool);
        assert!(!tracker.is_pending(txid));
    }
}
