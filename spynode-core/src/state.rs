//! Per-connection state machines: which phase a connection is in, and which
//! kind of peer originated a given tx/block (used to tag listener events and
//! to decide which policy — trusted restart vs. untrusted score penalty —
//! applies to a failure).

use std::net::SocketAddr;

/// Where an event (tx, block, connection failure) originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// The single, operator-configured trusted peer.
    Trusted,
    /// One of the rotating untrusted fleet members.
    Untrusted(SocketAddr),
    /// Injected locally (e.g. `Node::handle_tx` feeding a tx back through
    /// the same pipeline as if it had arrived from the network).
    Local,
}

/// The lifecycle phase of a single peer connection, trusted or untrusted.
///
/// Supersedes the scattered boolean flags (`versionReceived`,
/// `handshakeComplete`, `isInSync`, ...) of the handler state with a single
/// linear state machine; each transition corresponds 1:1 to a point where
/// the original design flipped one of those booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    /// TCP connect in flight.
    Dialing,
    /// Connected; our `version` sent, peer's `version` not yet received.
    HandshakingVersion,
    /// Peer's `version` received; waiting on `verack`.
    HandshakingVerack,
    /// Handshake complete; requesting and applying header batches.
    HeaderSync,
    /// Headers caught up; `sendheaders`/`getaddr`/`mempool` sent, waiting
    /// for the listener-visible in-sync notification to fire exactly once.
    MempoolSync,
    /// Steady state: new headers, inv, and tx traffic are applied live.
    InSync,
    /// `Stop` was called or a fatal error occurred; supervised tasks are
    /// being allowed to finish before the connection is torn down.
    Draining,
}

impl ConnectionPhase {
    /// Whether the connection has completed the version/verack exchange.
    pub fn handshake_complete(self) -> bool {
        !matches!(self, ConnectionPhase::Dialing | ConnectionPhase::HandshakingVersion | ConnectionPhase::HandshakingVerack)
    }

    /// Whether the connection is caught up with the chain tip.
    pub fn is_in_sync(self) -> bool {
        matches!(self, ConnectionPhase::InSync)
    }

    /// The phase reached after a successful `verack`.
    pub fn advance_past_handshake(self) -> ConnectionPhase {
        match self {
            ConnectionPhase::HandshakingVerack => ConnectionPhase::HeaderSync,
            other => other,
        }
    }
}
