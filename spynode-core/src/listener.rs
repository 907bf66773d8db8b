//! The outward event contract: consumers register one or more [`Listener`]s
//! before calling `Run`, and every tx/block/sync event the node observes is
//! dispatched to each of them from the reader task.

use crate::crypto::{BlockHash, Txid};

/// Why a tx-state callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStateKind {
    /// The safe-delay window elapsed with no conflict observed.
    Safe,
    /// A conflicting outpoint spender was observed.
    Unsafe,
    /// The tx's inputs were spent by a confirmed block before the tx itself
    /// confirmed.
    StolenByBlock,
    /// The tx was included in a block.
    Confirmed,
    /// A previously-confirmed tx's block was reverted.
    Reverted,
}

/// Why a block-state callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStateKind {
    /// The block extended the chain.
    Connected,
    /// The block was reverted (reorg; not otherwise implemented).
    Reverted,
}

/// Registered before `Run`; receives every tx, tx-state, block, and in-sync
/// event the node observes, in wire order per connection. Calls are issued
/// from the reader task and must not block indefinitely — a listener that
/// panics or deadlocks stalls that connection's message processing.
pub trait Listener: Send + Sync {
    /// A transaction was accepted into the mempool and tracking repository.
    /// Returning `true` asks the node to retain the tracking record (and
    /// thus keep delivering state callbacks for it); `false` asks the node
    /// to drop it immediately.
    fn handle_tx(&self, tx: &crate::network::Transaction) -> bool;

    /// A tracked transaction's lifecycle state changed.
    fn handle_tx_state(&self, kind: TxStateKind, txid: Txid);

    /// The header chain advanced or reverted.
    fn handle_block(&self, kind: BlockStateKind, height: u32, hash: BlockHash);

    /// Fired exactly once per trusted-connection lifecycle, when header
    /// sync and mempool population have both settled.
    fn handle_in_sync(&self);
}

/// A filter consulted before a newly-accepted tx is retained in the
/// tracking repository. If no registered filter accepts a tx, its repository
/// record is dropped immediately after `Listener::handle_tx` dispatch.
pub trait TxFilter: Send + Sync {
    /// Whether this filter wants the given transaction tracked.
    fn accepts(&self, tx: &crate::network::Transaction) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        in_sync_calls: AtomicUsize,
    }

    impl Listener for CountingListener {
        fn handle_tx(&self, _tx: &crate::network::Transaction) -> bool {
            true
        }
        fn handle_tx_state(&self, _kind: TxStateKind, _txid: Txid) {}
        fn handle_block(&self, _kind: BlockStateKind, _height: u32, _hash: BlockHash) {}
        fn handle_in_sync(&self) {
            self.in_sync_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listener_trait_is_object_safe_and_callable() {
        let listener = CountingListener { in_sync_calls: AtomicUsize::new(0) };
        let listeners: Vec<Box<dyn Listener>> = vec![Box::new(listener)];
        for l in &listeners {
            l.handle_in_sync();
        }
    }

    struct AcceptAllFilter;
    impl TxFilter for AcceptAllFilter {
        fn accepts(&self, _tx: &crate::network::Transaction) -> bool {
            true
        }
    }

    #[test]
    fn tx_filter_trait_is_object_safe() {
        let filters: Vec<Box<dyn TxFilter>> = vec![Box::new(AcceptAllFilter)];
        let tx = crate::network::Transaction { txid: Txid::zero(), inputs: vec![], raw: vec![] };
        assert!(filters.iter().any(|f| f.accepts(&tx)));
    }
}
