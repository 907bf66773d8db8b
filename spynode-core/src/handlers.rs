//! Per-command message handlers for the trusted connection's reader task
//! (§4.5). Each method implements one command's effect against the shared
//! mempool/repositories/tracker and dispatches the appropriate listener
//! callbacks; none of them perform network I/O themselves.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    crypto::Txid,
    error::SpyNodeResult,
    listener::{BlockStateKind, Listener, TxFilter, TxStateKind},
    mempool::Mempool,
    network::{Block, BlockHeader, InvType, InventoryVector, NetworkAddress, RejectMessage, Transaction},
    storage::{BlockRepository, PeerRepository, TxRepository},
    tx_tracker::TxTracker,
};

/// Maximum headers returned per batch by a well-behaved peer; fewer than
/// this in a response means the peer has no more to send.
pub const HEADERS_BATCH_SIZE: usize = 2000;

/// The shared collaborators every command handler needs. Cheap to clone:
/// every field is an `Arc`.
#[derive(Clone)]
pub struct Handlers {
    pub mempool: Arc<Mempool>,
    pub txs: Arc<TxRepository>,
    pub blocks: Arc<BlockRepository>,
    pub peers: Arc<PeerRepository>,
    pub tracker: Arc<TxTracker>,
    pub listeners: Arc<Vec<Box<dyn Listener>>>,
    pub filters: Arc<Vec<Box<dyn TxFilter>>>,
}

impl Handlers {
    fn dispatch_tx_state(&self, kind: TxStateKind, txid: Txid) {
        for listener in self.listeners.iter() {
            listener.handle_tx_state(kind, txid);
        }
    }

    /// Notify every registered listener that the connection just reached
    /// the in-sync steady state. Called exactly once per successful trusted
    /// `Run` session, right after the transition to `ConnectionPhase::InSync`.
    pub fn dispatch_in_sync(&self) {
        for listener in self.listeners.iter() {
            listener.handle_in_sync();
        }
    }

    /// Handle an incoming `tx`. `expected` is true if the tracker requested
    /// it or the connection is in steady-state sync (gossip is expected
    /// once caught up); an unexpected tx is ignored.
    pub fn handle_tx(&self, tx: Transaction, expected: bool) -> SpyNodeResult<()> {
        if !expected {
            debug!(txid = %tx.txid(), "ignoring unexpected tx");
            return Ok(());
        }

        let txid = tx.txid();
        let (conflicts, added) = self.mempool.add_transaction(tx.clone());
        if !added {
            return Ok(());
        }

        for conflict in &conflicts {
            if self.txs.mark_unsafe(*conflict)? {
                self.dispatch_tx_state(TxStateKind::Unsafe, *conflict);
            }
        }

        if !self.txs.add(txid, -1)? {
            // Already processed via another path (e.g. raced with an
            // untrusted peer observing the same inv).
            self.tracker.remove(&[txid]);
            return Ok(());
        }

        if !self.filters.is_empty() && !self.filters.iter().any(|f| f.accepts(&tx)) {
            self.txs.remove(txid, -1)?;
            self.tracker.remove(&[txid]);
            return Ok(());
        }

        let mut retained = false;
        for listener in self.listeners.iter() {
            if listener.handle_tx(&tx) {
                retained = true;
            }
        }

        if !retained {
            self.txs.remove(txid, -1)?;
        } else if !conflicts.is_empty() {
            self.txs.mark_unsafe(txid)?;
            self.dispatch_tx_state(TxStateKind::Unsafe, txid);
        }

        self.tracker.remove(&[txid]);
        Ok(())
    }

    /// Handle an incoming `block`: append its header, confirm its
    /// transactions, and return their txids so the caller can clean up the
    /// tracker on every connection (trusted and untrusted fleet).
    pub fn handle_block(&self, block: Block) -> SpyNodeResult<Vec<Txid>> {
        self.blocks.append(block.header.height, block.header.hash, block.header.previous)?;

        for txid in &block.txids {
            self.mempool.remove_block_txids(&[*txid]);
            self.txs.add_confirmed(*txid, block.header.height as i32)?;
            self.dispatch_tx_state(TxStateKind::Confirmed, *txid);
        }

        for listener in self.listeners.iter() {
            listener.handle_block(BlockStateKind::Connected, block.header.height, block.header.hash);
        }

        info!(height = block.header.height, txs = block.txids.len(), "block connected");
        Ok(block.txids.clone())
    }

    /// Handle an incoming `headers` batch: append each header in order.
    /// Returns whether the batch was shorter than [`HEADERS_BATCH_SIZE`]
    /// (meaning the peer has caught the connection up to its own tip).
    pub fn handle_headers(&self, headers: Vec<BlockHeader>) -> SpyNodeResult<bool> {
        let reached_tip = headers.len() < HEADERS_BATCH_SIZE;
        for header in headers {
            self.blocks.append(header.height, header.hash, header.previous)?;
        }
        Ok(reached_tip)
    }

    /// Handle an incoming `inv`: hand announced txids to the tracker.
    /// Block inventory is consumed by the sync loop, not here.
    pub fn handle_inv(&self, entries: Vec<InventoryVector>) {
        for entry in entries {
            if matches!(entry.inv_type, InvType::Tx) {
                self.tracker.add(entry.hash);
            }
        }
    }

    /// Handle an incoming `addr`: learn each address (new at score 0,
    /// refreshing `last_seen` if already known).
    pub fn handle_addr(&self, addresses: Vec<NetworkAddress>) -> SpyNodeResult<()> {
        for addr in addresses {
            let socket_addr = std::net::SocketAddr::new(addr.ip, addr.port);
            self.peers.learn(socket_addr)?;
        }
        Ok(())
    }

    /// Handle an incoming `reject`: log only. The trusted peer is
    /// operator-chosen, so a reject never adjusts its score and never
    /// triggers a restart.
    pub fn handle_reject(&self, reject: RejectMessage) {
        warn!(message = %reject.message, code = ?reject.code, reason = %reject.reason, "peer rejected our message");
    }

    /// Handle an incoming `notfound`: drop the matching pending entries.
    pub fn handle_notfound(&self, entries: Vec<InventoryVector>) {
        let txids: Vec<Txid> = entries
            .into_iter()
            .filter(|e| matches!(e.inv_type, InvType::Tx))
            .map(|e| e.hash)
            .collect();
        self.tracker.remove(&txids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, DatabaseConfig, StorageConfig};
    use std::time::Duration;

    struct RetainAllListener;
    impl Listener for RetainAllListener {
        fn handle_tx(&self, _tx: &Transaction) -> bool {
            true
        }
        fn handle_tx_state(&self, _kind: TxStateKind, _txid: Txid) {}
        fn handle_block(&self, _kind: BlockStateKind, _height: u32, _hash: crate::crypto::BlockHash) {}
        fn handle_in_sync(&self) {}
    }

    fn test_handlers(dir_name: &str) -> Handlers {
        let dir = std::env::temp_dir().join(format!("spynode-test-{dir_name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = StorageConfig::test(dir.to_str().unwrap());
        let db = Arc::new(Database::open(&dir, DatabaseConfig::from_storage_config(&config)).unwrap());

        Handlers {
            mempool: Arc::new(Mempool::new()),
            txs: Arc::new(TxRepository::new(db.clone())),
            blocks: Arc::new(BlockRepository::open(db.clone()).unwrap()),
            peers: Arc::new(PeerRepository::new(db)),
            tracker: Arc::new(TxTracker::new(Duration::from_secs(30), Duration::from_secs(120))),
            listeners: Arc::new(vec![Box::new(RetainAllListener) as Box<dyn Listener>]),
            filters: Arc::new(Vec::new()),
        }
    }

    #[test]
    fn unexpected_tx_is_ignored() {
        let handlers = test_handlers("handlers_unexpected_tx");
        let tx = Transaction { txid: Txid::random(), inputs: vec![], raw: vec![] };
        let txid = tx.txid();
        handlers.handle_tx(tx, false).unwrap();
        assert!(!handlers.mempool.contains(txid));
    }

    #[test]
    fn expected_tx_is_retained_without_filters() {
        let handlers = test_handlers("handlers_expected_tx");
        let tx = Transaction { txid: Txid::random(), inputs: vec![], raw: vec![] };
        let txid = tx.txid();
        handlers.tracker.add(txid);
        handlers.handle_tx(tx, true).unwrap();

        assert!(handlers.mempool.contains(txid));
        assert!(handlers.txs.get_unconfirmed(txid).unwrap().is_some());
        assert!(!handlers.tracker.is_pending(txid));
    }

    #[test]
    fn block_confirms_txs_and_clears_mempool() {
        let handlers = test_handlers("handlers_block");
        let tx = Transaction { txid: Txid::random(), inputs: vec![], raw: vec![] };
        let txid = tx.txid();
        handlers.tracker.add(txid);
        handlers.handle_tx(tx, true).unwrap();

        let genesis = crate::crypto::BlockHash::from_bytes([1u8; 32]);
        handlers.blocks.append(0, genesis, crate::crypto::BlockHash::zero()).unwrap();
        let block = Block {
            header: BlockHeader { height: 1, hash: crate::crypto::BlockHash::from_bytes([2u8; 32]), previous: genesis },
            txids: vec![txid],
        };

        let cleaned_up = handlers.handle_block(block).unwrap();
        assert_eq!(cleaned_up, vec![txid]);
        assert!(!handlers.mempool.contains(txid));
        assert!(handlers.txs.get_unconfirmed(txid).unwrap().is_none());
    }

    #[test]
    fn headers_batch_shorter_than_max_signals_tip_reached() {
        let handlers = test_handlers("handlers_headers");
        let genesis = BlockHeader { height: 0, hash: crate::crypto::BlockHash::from_bytes([1u8; 32]), previous: crate::crypto::BlockHash::zero() };
        let reached_tip = handlers.handle_headers(vec![genesis]).unwrap();
        assert!(reached_tip);
    }

    #[test]
    fn notfound_clears_tracker_entries() {
        let handlers = test_handlers("handlers_notfound");
        let txid = Txid::random();
        handlers.tracker.add(txid);
        handlers.handle_notfound(vec![InventoryVector { inv_type: InvType::Tx, hash: txid }]);
        assert!(!handlers.tracker.is_pending(txid));
    }
}
