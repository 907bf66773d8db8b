//! Wire protocol implementation.
//!
//! Implements a Bitcoin-style P2P wire format: a 24-byte header (magic,
//! NUL-padded command name, length, double-SHA256 checksum) followed by a
//! command-specific payload.

use std::{
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::{BlockHash, Hash, Txid};

/// Protocol version advertised in `version` messages.
pub const PROTOCOL_VERSION: u32 = 70015;

/// Mainnet network magic bytes.
pub const SPYNODE_MAINNET_MAGIC: [u8; 4] = [0xB7, 0xC0, 0x1A, 0x55];
/// Testnet network magic bytes.
pub const SPYNODE_TESTNET_MAGIC: [u8; 4] = [0xF1, 0xC0, 0xBA, 0x55];

/// Overall frame size ceiling, enforced before any per-command limit.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// `block` messages carry only a header plus txid list, so this is generous.
pub const MAX_BLOCK_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
/// `tx` messages carry only a txid and its input outpoints.
pub const MAX_TX_MESSAGE_SIZE: usize = 100 * 1024;
/// Bitcoin limit: 50,000 inventory items per message.
pub const MAX_INV_MESSAGE_SIZE: usize = 50_000 * 36;
/// Bitcoin limit: 2,000 headers per message.
pub const MAX_HEADERS_MESSAGE_SIZE: usize = 2_000 * 81;
/// Bitcoin limit: 1,000 addresses per `addr` message.
pub const MAX_ADDR_MESSAGE_SIZE: usize = 1_000 * 30;
/// Ample for all `version` fields.
pub const MAX_VERSION_MESSAGE_SIZE: usize = 256;
/// Generic ceiling for `getheaders`/`reject`.
pub const MAX_GENERIC_MESSAGE_SIZE: usize = 1024 * 1024;
/// Per-message inventory item cap.
pub const MAX_INV_ITEMS: usize = 50_000;

/// Node service bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    /// Node can serve full blocks.
    pub const NETWORK: ServiceFlags = ServiceFlags(1);
    /// Node supports bloom filters.
    pub const BLOOM: ServiceFlags = ServiceFlags(1 << 2);
    /// Node supports witness data.
    pub const WITNESS: ServiceFlags = ServiceFlags(1 << 3);
    /// Node keeps only a limited window of recent blocks.
    pub const NETWORK_LIMITED: ServiceFlags = ServiceFlags(1 << 10);
}

/// A network address with last-seen timestamp, as carried in `addr` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// Timestamp when the address was seen.
    pub time: u32,
    /// Services provided by this node.
    pub services: u64,
    /// IP address.
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Build an address stamped with the current time.
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        NetworkAddress {
            time: SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32,
            services: services.0,
            ip,
            port,
        }
    }
}

impl Default for NetworkAddress {
    fn default() -> Self {
        use std::net::Ipv4Addr;
        NetworkAddress { time: 0, services: 0, ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port: 0 }
    }
}

/// An outpoint: a previous transaction's output being spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Id of the transaction holding the output being spent.
    pub txid: Txid,
    /// Index of the output within that transaction.
    pub vout: u32,
}

/// A transaction as observed on the wire.
///
/// Only the fields the spy node's mempool and filters need are modeled;
/// full validation (signatures, amounts, script evaluation) is out of scope
/// and left to whatever consumer embeds this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// The transaction's id.
    pub txid: Txid,
    /// Outpoints this transaction spends.
    pub inputs: Vec<OutPoint>,
    /// Opaque serialized transaction, forwarded to listeners unexamined.
    pub raw: Vec<u8>,
}

impl Transaction {
    /// The id used to key the mempool and tx repository.
    pub fn txid(&self) -> Txid {
        self.txid
    }
}

/// A block header, the unit the local chain is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Height of this header in the chain.
    pub height: u32,
    /// This header's hash.
    pub hash: BlockHash,
    /// Hash of the header at `height - 1`.
    pub previous: BlockHash,
}

/// A block as observed on the wire: a header plus the ids of the
/// transactions it confirms. Block validation beyond header continuity is
/// out of scope, so transaction bodies are not carried here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// This block's header.
    pub header: BlockHeader,
    /// Ids of the transactions this block confirms.
    pub txids: Vec<Txid>,
}

/// Wire protocol message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Version handshake.
    Version(VersionMessage),
    /// Version acknowledgment.
    VerAck,
    /// Keep-alive ping.
    Ping(u64),
    /// Ping response.
    Pong(u64),
    /// Request peer addresses.
    GetAddr,
    /// Peer addresses.
    Addr(Vec<NetworkAddress>),
    /// Inventory announcement.
    Inv(Vec<InventoryVector>),
    /// Request inventory items by hash.
    GetData(Vec<InventoryVector>),
    /// A block.
    Block(Block),
    /// A transaction.
    Tx(Transaction),
    /// Request headers.
    GetHeaders(GetHeadersMessage),
    /// Headers response.
    Headers(Vec<BlockHeader>),
    /// Rejection notice.
    Reject(RejectMessage),
    /// Request the peer's mempool contents.
    MemPool,
    /// Response for inventory items the peer doesn't have.
    NotFound(Vec<InventoryVector>),
    /// Preference to receive headers instead of inv for new blocks.
    SendHeaders,
}

impl Message {
    /// Maximum payload size allowed for this message's command, enforced
    /// after deserialization to bound memory use from a misbehaving peer.
    pub fn max_size(&self) -> usize {
        match self {
            Message::Block(_) => MAX_BLOCK_MESSAGE_SIZE,
            Message::Tx(_) => MAX_TX_MESSAGE_SIZE,
            Message::Inv(_) | Message::GetData(_) | Message::NotFound(_) => MAX_INV_MESSAGE_SIZE,
            Message::Headers(_) => MAX_HEADERS_MESSAGE_SIZE,
            Message::Addr(_) => MAX_ADDR_MESSAGE_SIZE,
            Message::Version(_) => MAX_VERSION_MESSAGE_SIZE,
            Message::VerAck
            | Message::Ping(_)
            | Message::Pong(_)
            | Message::GetAddr
            | Message::MemPool
            | Message::SendHeaders => 32,
            Message::GetHeaders(_) | Message::Reject(_) => MAX_GENERIC_MESSAGE_SIZE,
        }
    }

    /// The command name sent in the message header.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Reject(_) => "reject",
            Message::MemPool => "mempool",
            Message::NotFound(_) => "notfound",
            Message::SendHeaders => "sendheaders",
        }
    }
}

/// Version handshake message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMessage {
    /// Protocol version.
    pub version: u32,
    /// Services provided by the sender.
    pub services: u64,
    /// Timestamp.
    pub timestamp: i64,
    /// Receiver's address.
    pub addr_recv: NetworkAddress,
    /// Sender's address.
    pub addr_from: NetworkAddress,
    /// Random nonce, used to detect self-connections.
    pub nonce: u64,
    /// User agent string.
    pub user_agent: String,
    /// Sender's chain tip height.
    pub start_height: u32,
    /// Whether the sender wants unfiltered tx relay.
    pub relay: bool,
}

impl VersionMessage {
    /// Build a version message stamped with the current time and a random nonce.
    pub fn new(
        services: ServiceFlags,
        addr_recv: NetworkAddress,
        addr_from: NetworkAddress,
        user_agent: String,
        start_height: u32,
        relay: bool,
    ) -> Self {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: services.0,
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64,
            addr_recv,
            addr_from,
            nonce: rand::random(),
            user_agent,
            start_height,
            relay,
        }
    }
}

/// An entry in an `inv`/`getdata`/`notfound` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryVector {
    /// Kind of object being announced.
    pub inv_type: InvType,
    /// The object's hash.
    pub hash: Hash,
}

/// Inventory object kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[repr(u32)]
pub enum InvType {
    /// Transaction.
    Tx = 1,
    /// Block.
    Block = 2,
    /// Filtered (merkle) block.
    FilteredBlock = 3,
    /// Compact block.
    CompactBlock = 4,
}

/// Request for headers, built from a block locator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHeadersMessage {
    /// Protocol version.
    pub version: u32,
    /// Locator hashes, most recent first.
    pub block_locator: Vec<Hash>,
    /// Hash to stop at; zero means "as many as possible".
    pub hash_stop: Hash,
}

/// Rejection notice for a previously sent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectMessage {
    /// Command name of the rejected message.
    pub message: String,
    /// Rejection code.
    pub code: RejectCode,
    /// Human-readable reason.
    pub reason: String,
    /// Extra data (e.g. the offending hash).
    pub data: Option<Vec<u8>>,
}

/// Rejection codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[repr(u8)]
pub enum RejectCode {
    /// Malformed message.
    Malformed = 0x01,
    /// Invalid transaction/block.
    Invalid = 0x10,
    /// Obsolete protocol version.
    Obsolete = 0x11,
    /// Duplicate.
    Duplicate = 0x12,
    /// Non-standard transaction.
    Nonstandard = 0x40,
    /// Insufficient fee.
    InsufficientFee = 0x42,
    /// Checkpoint mismatch.
    Checkpoint = 0x43,
}

/// The 24-byte frame header preceding every message's payload.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    /// Network magic bytes.
    pub magic: [u8; 4],
    /// Command name.
    pub command: String,
    /// Payload length.
    pub length: u32,
    /// Payload checksum.
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// Build a header for `payload`, computing its checksum.
    pub fn new(magic: [u8; 4], command: &str, payload: &[u8]) -> Self {
        let checksum = Self::calculate_checksum(payload);
        MessageHeader { magic, command: command.to_string(), length: payload.len() as u32, checksum }
    }

    fn calculate_checksum(payload: &[u8]) -> [u8; 4] {
        let digest = Hash::double_sha256(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&digest.as_bytes()[..4]);
        checksum
    }

    /// Verify the header's checksum matches `payload`.
    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == Self::calculate_checksum(payload)
    }
}

/// Protocol-layer errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("invalid message format")]
    InvalidFormat,
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("message type '{command}' exceeds size limit: {size} bytes (max: {max} bytes)")]
    MessageTypeTooLarge { command: String, size: usize, max: usize },
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("protocol version mismatch")]
    VersionMismatch,
    #[error("too many inventory items: {count} (max: {max})")]
    TooManyInventoryItems { count: usize, max: usize },
}

/// Encodes and decodes wire messages for a fixed network magic.
#[derive(Clone, Copy)]
pub struct ProtocolCodec {
    magic: [u8; 4],
}

impl ProtocolCodec {
    /// Build a codec for the given network magic bytes.
    pub fn new(magic: [u8; 4]) -> Self {
        ProtocolCodec { magic }
    }

    /// Encode a message to its full wire frame (header + payload).
    pub fn encode_message(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let (command, payload) = self.serialize_message(message)?;
        let header = MessageHeader::new(self.magic, &command, &payload);

        let mut encoded = Vec::with_capacity(24 + payload.len());
        encoded.extend_from_slice(&header.magic);

        let mut cmd_bytes = [0u8; 12];
        let cmd_slice = command.as_bytes();
        if cmd_slice.len() > 12 {
            return Err(ProtocolError::InvalidFormat);
        }
        cmd_bytes[..cmd_slice.len()].copy_from_slice(cmd_slice);
        encoded.extend_from_slice(&cmd_bytes);

        encoded.extend_from_slice(&header.length.to_le_bytes());
        encoded.extend_from_slice(&header.checksum);
        encoded.extend_from_slice(&payload);

        Ok(encoded)
    }

    /// Decode one message from an async byte stream.
    pub async fn decode_message<R>(&self, reader: &mut R) -> Result<Message, ProtocolError>
    where R: AsyncRead + Unpin {
        use tokio::io::AsyncReadExt;

        let mut header_bytes = [0u8; 24];
        reader.read_exact(&mut header_bytes).await.map_err(|e| ProtocolError::Io(e.to_string()))?;

        let magic: [u8; 4] = header_bytes[0..4].try_into().unwrap();
        if magic != self.magic {
            return Err(ProtocolError::InvalidMagic);
        }

        let command_bytes = &header_bytes[4..16];
        let command = String::from_utf8_lossy(command_bytes).trim_end_matches('\0').to_string();

        let length = u32::from_le_bytes(header_bytes[16..20].try_into().unwrap());
        let checksum: [u8; 4] = header_bytes[20..24].try_into().unwrap();

        if length as usize > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length as usize));
        }

        let mut payload = vec![0u8; length as usize];
        if length > 0 {
            reader.read_exact(&mut payload).await.map_err(|e| ProtocolError::Io(e.to_string()))?;
        }

        let header = MessageHeader::new(magic, &command, &payload);
        if header.checksum != checksum {
            return Err(ProtocolError::InvalidChecksum);
        }

        self.deserialize_message(&command, &payload)
    }

    fn serialize_message(&self, message: &Message) -> Result<(String, Vec<u8>), ProtocolError> {
        match message {
            Message::Version(msg) => {
                // Bincode keeps version messages compact, under the 256-byte limit.
                let payload =
                    bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Ok(("version".to_string(), payload))
            }
            Message::VerAck => Ok(("verack".to_string(), Vec::new())),
            Message::Ping(nonce) => Ok(("ping".to_string(), nonce.to_le_bytes().to_vec())),
            Message::Pong(nonce) => Ok(("pong".to_string(), nonce.to_le_bytes().to_vec())),
            Message::GetAddr => Ok(("getaddr".to_string(), Vec::new())),
            Message::Addr(addrs) => Ok((
                "addr".to_string(),
                serde_json::to_vec(addrs).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::Inv(inv) => Ok((
                "inv".to_string(),
                serde_json::to_vec(inv).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::GetData(inv) => Ok((
                "getdata".to_string(),
                serde_json::to_vec(inv).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::Block(block) => Ok((
                "block".to_string(),
                serde_json::to_vec(block).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::Tx(tx) => Ok((
                "tx".to_string(),
                serde_json::to_vec(tx).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::GetHeaders(msg) => Ok((
                "getheaders".to_string(),
                serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::Headers(headers) => Ok((
                "headers".to_string(),
                serde_json::to_vec(headers).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::Reject(msg) => Ok((
                "reject".to_string(),
                serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::MemPool => Ok(("mempool".to_string(), Vec::new())),
            Message::NotFound(inv) => Ok((
                "notfound".to_string(),
                serde_json::to_vec(inv).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
            )),
            Message::SendHeaders => Ok(("sendheaders".to_string(), Vec::new())),
        }
    }

    /// Deserialize a message, then enforce its command-specific size limit.
    fn deserialize_message(&self, command: &str, payload: &[u8]) -> Result<Message, ProtocolError> {
        let message = match command {
            "version" => {
                let msg: VersionMessage = bincode::deserialize(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Message::Version(msg)
            }
            "verack" => Message::VerAck,
            "ping" => {
                if payload.len() != 8 {
                    return Err(ProtocolError::InvalidFormat);
                }
                Message::Ping(u64::from_le_bytes(payload.try_into().unwrap()))
            }
            "pong" => {
                if payload.len() != 8 {
                    return Err(ProtocolError::InvalidFormat);
                }
                Message::Pong(u64::from_le_bytes(payload.try_into().unwrap()))
            }
            "getaddr" => Message::GetAddr,
            "addr" => {
                let addrs: Vec<NetworkAddress> = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Message::Addr(addrs)
            }
            "inv" => {
                let inv: Vec<InventoryVector> = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Self::check_inv_count(&inv)?;
                Message::Inv(inv)
            }
            "getdata" => {
                let inv: Vec<InventoryVector> = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Self::check_inv_count(&inv)?;
                Message::GetData(inv)
            }
            "block" => {
                let block: Block = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Message::Block(block)
            }
            "tx" => {
                let tx: Transaction = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Message::Tx(tx)
            }
            "getheaders" => {
                let msg: GetHeadersMessage = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Message::GetHeaders(msg)
            }
            "headers" => {
                let headers: Vec<BlockHeader> = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Message::Headers(headers)
            }
            "reject" => {
                let msg: RejectMessage = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Message::Reject(msg)
            }
            "mempool" => Message::MemPool,
            "notfound" => {
                let inv: Vec<InventoryVector> = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Self::check_inv_count(&inv)?;
                Message::NotFound(inv)
            }
            "sendheaders" => Message::SendHeaders,
            _ => return Err(ProtocolError::UnknownCommand(command.to_string())),
        };

        let max_size = message.max_size();
        if payload.len() > max_size {
            return Err(ProtocolError::MessageTypeTooLarge {
                command: command.to_string(),
                size: payload.len(),
                max: max_size,
            });
        }

        Ok(message)
    }

    fn check_inv_count(inv: &[InventoryVector]) -> Result<(), ProtocolError> {
        if inv.len() > MAX_INV_ITEMS {
            return Err(ProtocolError::TooManyInventoryItems { count: inv.len(), max: MAX_INV_ITEMS });
        }
        Ok(())
    }
}

/// A framed connection to a single peer.
pub struct PeerConnection<S> {
    stream: S,
    codec: ProtocolCodec,
    version: Option<VersionMessage>,
    handshake_complete: bool,
}

impl<S> PeerConnection<S>
where S: AsyncRead + AsyncWrite + Unpin
{
    /// Wrap an established stream in protocol framing.
    pub fn new(stream: S, codec: ProtocolCodec) -> Self {
        PeerConnection { stream, codec, version: None, handshake_complete: false }
    }

    /// Send a message to the peer.
    pub async fn send_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        use tokio::io::AsyncWriteExt;

        let encoded = self.codec.encode_message(message)?;
        self.stream.write_all(&encoded).await.map_err(|e| ProtocolError::Io(e.to_string()))?;
        Ok(())
    }

    /// Receive the next message from the peer.
    pub async fn receive_message(&mut self) -> Result<Message, ProtocolError> {
        self.codec.decode_message(&mut self.stream).await
    }

    /// Exchange `version`/`verack` with the peer.
    pub async fn handshake(
        &mut self,
        our_version: VersionMessage,
    ) -> Result<VersionMessage, ProtocolError> {
        self.send_message(&Message::Version(our_version)).await?;

        let peer_version = match self.receive_message().await? {
            Message::Version(version) => {
                if version.version < PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch);
                }
                version
            }
            _ => return Err(ProtocolError::InvalidFormat),
        };

        self.send_message(&Message::VerAck).await?;

        match self.receive_message().await? {
            Message::VerAck => {}
            _ => return Err(ProtocolError::InvalidFormat),
        }

        self.version = Some(peer_version.clone());
        self.handshake_complete = true;

        Ok(peer_version)
    }

    /// Whether `handshake` has completed.
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// The peer's advertised version, once known.
    pub fn peer_version(&self) -> Option<&VersionMessage> {
        self.version.as_ref()
    }

    /// Unwrap the connection into its raw stream and codec, once the
    /// handshake is done, so the caller can split the stream into
    /// independent read/write halves for the reader and writer tasks.
    pub fn into_parts(self) -> (S, ProtocolCodec) {
        (self.stream, self.codec)
    }
}
