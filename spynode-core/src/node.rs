//! The trusted node: one supervised TCP connection to an operator-configured
//! peer, driving header sync and owning the shared repositories, mempool,
//! and tracker. Grounded in the upstream Go `node.go`'s reconnect loop and
//! the teacher's `SimplePeerManager` task-spawn shape (bounded mpsc channel,
//! one task per direction).

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{
    io::{split, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, Mutex, RwLock},
    time::{interval, sleep},
};
use tracing::{error, info, warn};

use crate::{
    config::SpyConfig,
    error::{SpyNodeError, SpyNodeResult},
    handlers::Handlers,
    listener::{Listener, TxFilter},
    mempool::Mempool,
    network::{
        Message, NetworkAddress, NetworkConfig, PeerConnection, ProtocolCodec, ServiceFlags, Transaction,
        VersionMessage,
    },
    state::{ConnectionPhase, Source},
    storage::{BlockRepository, Database, DatabaseConfig, PeerRepository, StorageConfig, TxRepository},
    tx_tracker::TxTracker,
    untrusted::UntrustedFleet,
};

/// The trusted node. Construct with [`Node::new`], register listeners and
/// filters, then call [`Node::run`].
pub struct Node {
    config: SpyConfig,
    network_config: NetworkConfig,
    handlers: Handlers,
    listeners: Arc<Mutex<Vec<Box<dyn Listener>>>>,
    filters: Arc<Mutex<Vec<Box<dyn TxFilter>>>>,
    phase: Arc<RwLock<ConnectionPhase>>,
    stopping: Arc<AtomicBool>,
    fleet: Arc<UntrustedFleet>,
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
}

impl Node {
    /// Open storage at `config.data_dir` and assemble the shared
    /// collaborators. Does not connect; call [`Node::run`] for that.
    pub async fn new(config: SpyConfig) -> SpyNodeResult<Self> {
        config.validate().map_err(|e| SpyNodeError::Config(e.to_string()))?;

        let storage_config = StorageConfig::new(config.data_dir.to_string_lossy().as_ref());
        let db = Arc::new(Database::open(&config.data_dir, DatabaseConfig::from_storage_config(&storage_config))?);

        let mempool = Arc::new(Mempool::new());
        let txs = Arc::new(TxRepository::new(db.clone()));
        let blocks = Arc::new(BlockRepository::open(db.clone())?);
        let peers = Arc::new(PeerRepository::new(db));
        let tracker = Arc::new(TxTracker::new(
            config.retry_duration,
            config.retry_duration * config.shotgun_count as u32,
        ));

        let listeners: Arc<Vec<Box<dyn Listener>>> = Arc::new(Vec::new());
        let filters: Arc<Vec<Box<dyn TxFilter>>> = Arc::new(Vec::new());

        let handlers = Handlers { mempool: mempool.clone(), txs, blocks: blocks.clone(), peers: peers.clone(), tracker, listeners, filters };

        let network_config = if config.network.as_str() == "testnet" { NetworkConfig::testnet() } else { NetworkConfig::mainnet() };
        let fleet = Arc::new(UntrustedFleet::new(config.untrusted_count, peers, blocks, network_config.clone()));

        Ok(Node {
            config,
            network_config,
            handlers,
            listeners: Arc::new(Mutex::new(Vec::new())),
            filters: Arc::new(Mutex::new(Vec::new())),
            phase: Arc::new(RwLock::new(ConnectionPhase::Dialing)),
            stopping: Arc::new(AtomicBool::new(false)),
            fleet,
            outgoing: Mutex::new(None),
        })
    }

    /// Register a listener. Must be called before [`Node::run`].
    pub async fn register_listener(&self, listener: Box<dyn Listener>) {
        self.listeners.lock().await.push(listener);
    }

    /// Register a tx filter. Must be called before [`Node::run`].
    pub async fn add_tx_filter(&self, filter: Box<dyn TxFilter>) {
        self.filters.lock().await.push(filter);
    }

    /// Enqueue `tx` to the trusted peer and every active untrusted peer.
    pub async fn broadcast_tx(&self, tx: Transaction) -> SpyNodeResult<()> {
        if let Some(sender) = self.outgoing.lock().await.as_ref() {
            let _ = sender.send(Message::Tx(tx.clone())).await;
        }
        self.fleet.broadcast_tx(&tx).await;
        Ok(())
    }

    /// Inject `tx` locally, as if received from the wire, tagged
    /// [`Source::Local`]. Runs it through the same mempool/repository/
    /// listener pipeline as a wire-arrived tx exactly once.
    pub async fn handle_tx(&self, tx: Transaction) -> SpyNodeResult<()> {
        let _source = Source::Local;
        self.handlers.handle_tx(tx, true)
    }

    /// Cleanup hook invoked after a block commits: drop its txids from this
    /// node's tracker and every untrusted peer's tracker.
    pub async fn process_block(&self, txids: &[crate::crypto::Txid]) {
        self.handlers.tracker.remove(txids);
        self.fleet.remove_confirmed(txids).await;
    }

    /// Idempotent shutdown: stops the reconnect loop after the current
    /// connection's tasks drain.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Build the handlers with the currently-registered listeners/filters
    /// snapshotted in. Listeners/filters are read-only once `run` begins,
    /// per the listener contract.
    async fn snapshot_handlers(&self) -> Handlers {
        let mut handlers = self.handlers.clone();
        handlers.listeners = Arc::new(std::mem::take(&mut *self.listeners.lock().await));
        handlers.filters = Arc::new(std::mem::take(&mut *self.filters.lock().await));
        handlers
    }

    /// Drive the connection to `config.node_address` until [`Node::stop`] is
    /// called. Reconnects automatically on transport loss.
    pub async fn run(&self) -> SpyNodeResult<()> {
        let handlers = self.snapshot_handlers().await;
        self.fleet.set_handlers(handlers.clone()).await;

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return Ok(());
            }

            *self.phase.write().await = ConnectionPhase::Dialing;
            match self.run_one_connection(&handlers).await {
                Ok(()) => {}
                Err(err) if err.is_restartable() => {
                    warn!(error = %err, "trusted connection lost, reconnecting");
                }
                Err(err) => return Err(err),
            }

            if self.stopping.load(Ordering::SeqCst) {
                return Ok(());
            }
            sleep(self.network_config.timeouts.tcp_connect).await;
        }
    }

    async fn run_one_connection(&self, handlers: &Handlers) -> SpyNodeResult<()> {
        let stream = TcpStream::connect(self.config.node_address)
            .await
            .map_err(|e| SpyNodeError::Network(crate::network::NetworkError::Dial { addr: self.config.node_address.to_string(), source: e }))?;

        let codec = ProtocolCodec::new(self.network_config.magic_bytes());
        let mut conn = PeerConnection::new(stream, codec);

        *self.phase.write().await = ConnectionPhase::HandshakingVersion;
        let our_version = VersionMessage::new(
            ServiceFlags::NETWORK,
            NetworkAddress::new(self.config.node_address.ip(), self.config.node_address.port(), ServiceFlags::NETWORK),
            NetworkAddress::default(),
            self.network_config.user_agent.clone(),
            self.handlers.blocks.last_height().max(0) as u32,
            true,
        );
        conn.handshake(our_version).await.map_err(SpyNodeError::Protocol)?;
        *self.phase.write().await = ConnectionPhase::HeaderSync;
        info!(addr = %self.config.node_address, "trusted peer handshake complete");

        let (stream, codec) = conn.into_parts();
        let (mut read_half, mut write_half) = split(stream);

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(self.network_config.outgoing_queue_size);
        *self.outgoing.lock().await = Some(outgoing_tx.clone());

        // Request the first header batch immediately; the check task keeps
        // requesting subsequent batches until `isInSync`.
        let locator = self.handlers.blocks.build_locator(1, 50);
        let _ = outgoing_tx
            .send(Message::GetHeaders(crate::network::GetHeadersMessage {
                version: crate::network::PROTOCOL_VERSION,
                block_locator: locator,
                hash_stop: crate::crypto::Hash::zero(),
            }))
            .await;

        let writer_codec = codec;
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let Ok(encoded) = writer_codec.encode_message(&message) else { continue };
                if write_half.write_all(&encoded).await.is_err() {
                    break;
                }
            }
        });

        let reader_handlers = handlers.clone();
        let reader_phase = self.phase.clone();
        let reader_fleet = self.fleet.clone();
        let reader_outgoing = outgoing_tx.clone();
        let reader_codec = codec;
        let reader = tokio::spawn(async move {
            loop {
                let message = match reader_codec.decode_message(&mut read_half).await {
                    Ok(m) => m,
                    Err(e) => return Err::<(), SpyNodeError>(SpyNodeError::Protocol(e)),
                };
                if let Err(e) = handle_trusted_message(&reader_handlers, &reader_phase, &reader_fleet, &reader_outgoing, message).await {
                    if e.is_restartable() {
                        return Err(e);
                    }
                    warn!(error = %e, "trusted message handler error, continuing");
                }
            }
        });

        let check_phase = self.phase.clone();
        let check_handlers = handlers.clone();
        let check_outgoing = outgoing_tx.clone();
        let check_interval = self.network_config.timeouts.timeout_check_interval;
        let check = tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            loop {
                ticker.tick().await;
                let outgoing = check_handlers.tracker.check(&check_handlers.mempool);
                for entry in outgoing {
                    let _ = check_outgoing.send(Message::GetData(vec![entry])).await;
                }
                if check_phase.read().await.is_in_sync() {
                    // steady state; nothing else to drive here besides the
                    // tracker retries above.
                }
            }
        });

        let promoter_handlers = handlers.clone();
        let promoter_phase = self.phase.clone();
        let promoter_interval = self.network_config.timeouts.safe_delay_check_interval;
        let safe_tx_delay = self.config.safe_tx_delay;
        let promoter = tokio::spawn(async move {
            crate::promoter::run_safe_delay_promoter(promoter_handlers, promoter_phase, promoter_interval, safe_tx_delay).await;
        });

        let fleet_handle = self.fleet.clone();
        let fleet_interval = self.network_config.timeouts.fleet_check_interval;
        let fleet_task = tokio::spawn(async move {
            fleet_handle.run_supervisor(fleet_interval).await;
        });

        let result = reader.await.unwrap_or(Ok(()));

        writer.abort();
        check.abort();
        promoter.abort();
        fleet_task.abort();
        *self.outgoing.lock().await = None;
        *self.phase.write().await = ConnectionPhase::Draining;

        if let Err(e) = &result {
            error!(error = %e, "trusted connection ended");
        }
        result
    }
}

async fn handle_trusted_message(
    handlers: &Handlers,
    phase: &Arc<RwLock<ConnectionPhase>>,
    fleet: &Arc<UntrustedFleet>,
    outgoing: &mpsc::Sender<Message>,
    message: Message,
) -> SpyNodeResult<()> {
    match message {
        Message::Headers(headers) => {
            let reached_tip = handlers.handle_headers(headers)?;
            let mut phase = phase.write().await;
            *phase = if reached_tip { ConnectionPhase::MempoolSync } else { ConnectionPhase::HeaderSync };
            if reached_tip {
                let _ = outgoing.send(Message::SendHeaders).await;
                let _ = outgoing.send(Message::GetAddr).await;
                let _ = outgoing.send(Message::MemPool).await;
                *phase = ConnectionPhase::InSync;
                drop(phase);
                handlers.dispatch_in_sync();
            } else {
                let locator = handlers.blocks.build_locator(1, 50);
                let _ = outgoing
                    .send(Message::GetHeaders(crate::network::GetHeadersMessage {
                        version: crate::network::PROTOCOL_VERSION,
                        block_locator: locator,
                        hash_stop: crate::crypto::Hash::zero(),
                    }))
                    .await;
            }
        }
        Message::Inv(entries) => handlers.handle_inv(entries),
        Message::Tx(tx) => {
            let in_sync = phase.read().await.is_in_sync();
            let expected = in_sync || handlers.tracker.is_pending(tx.txid());
            handlers.handle_tx(tx, expected)?;
        }
        Message::Block(block) => {
            let txids = handlers.handle_block(block)?;
            handlers.tracker.remove(&txids);
            fleet.remove_confirmed(&txids).await;
        }
        Message::Addr(addrs) => handlers.handle_addr(addrs)?,
        Message::Reject(reject) => handlers.handle_reject(reject),
        Message::NotFound(entries) => handlers.handle_notfound(entries),
        Message::Ping(nonce) => {
            let _ = outgoing.send(Message::Pong(nonce)).await;
        }
        Message::Pong(_) | Message::VerAck | Message::Version(_) | Message::GetAddr
        | Message::GetHeaders(_) | Message::GetData(_) | Message::MemPool | Message::SendHeaders => {}
    }
    Ok(())
}
