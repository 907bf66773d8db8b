//! Safe-delay promotion: once a tx has sat unconfirmed and uncontested for
//! `safe_tx_delay`, listeners are told it's safe to treat as settled.
//! Grounded in the upstream Go node's `checkTxDelays` loop.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, time::sleep};
use tracing::warn;

use crate::{handlers::Handlers, listener::TxStateKind, state::ConnectionPhase};

/// Poll interval matching the upstream promoter's cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run until the caller aborts the task. While the connection is in sync,
/// every [`POLL_INTERVAL`] this asks the tx repository for newly-safe txids
/// and dispatches [`TxStateKind::Safe`] to every listener.
///
/// `interval` is accepted for parity with the other supervised loops but the
/// promoter always polls at [`POLL_INTERVAL`]; the interval only governs how
/// often it re-checks `phase` while out of sync.
pub async fn run_safe_delay_promoter(
    handlers: Handlers,
    phase: Arc<RwLock<ConnectionPhase>>,
    interval: Duration,
    safe_tx_delay: Duration,
) {
    loop {
        sleep(POLL_INTERVAL.min(interval)).await;

        if !phase.read().await.is_in_sync() {
            continue;
        }

        let cutoff = now_ms() - safe_tx_delay.as_millis() as i64;
        let newly_safe = match handlers.txs.get_new_safe(cutoff) {
            Ok(txids) => txids,
            Err(e) => {
                warn!(error = %e, "safe-delay check failed");
                continue;
            }
        };

        for txid in newly_safe {
            for listener in handlers.listeners.iter() {
                listener.handle_tx_state(TxStateKind::Safe, txid);
            }
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}
