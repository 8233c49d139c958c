//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Response patterns use `tokio::sync::oneshot` for
//! request-reply semantics.

use crate::errors::BrokerError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::engine::RouterHandle;
use signal_protocol::{
    DtlsParameters, MediaKind, PeerSummary, RtpCapabilities, RtpParameters, ServerMessage,
    TransportDescriptor,
};

use super::room::RoomActorHandle;

/// Messages sent to the `BrokerActor`.
pub enum BrokerMessage {
    /// A connection opened; allocate an identity and register the peer.
    RegisterPeer {
        respond_to: oneshot::Sender<PeerIdentity>,
    },

    /// A connection closed; remove the peer from the registry.
    DeregisterPeer { peer_id: String },

    /// Install a new room around a freshly created router.
    CreateRoom {
        router: Arc<dyn RouterHandle>,
        engine_index: usize,
        respond_to: oneshot::Sender<Result<RoomActorHandle, BrokerError>>,
    },

    /// Resolve a room id to its actor handle.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, BrokerError>>,
    },

    /// Get current broker status (for health/debugging).
    GetStatus {
        respond_to: oneshot::Sender<BrokerStatus>,
    },
}

/// Messages sent to a `RoomActor`.
pub enum RoomMessage {
    /// Admit a peer to the room.
    Join {
        peer_id: String,
        display_name: String,
        /// Channel to the peer's connection writer.
        outbound: mpsc::Sender<ServerMessage>,
        /// Receive capabilities the peer exchanged before joining, if any.
        rtp_capabilities: Option<RtpCapabilities>,
        respond_to: oneshot::Sender<Result<JoinOutcome, BrokerError>>,
    },

    /// Remove a peer and release everything it owns.
    Leave {
        peer_id: String,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// Store a member's receive capabilities.
    StoreRtpCapabilities {
        peer_id: String,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// Lazily create (or return the existing) send/recv transport pair.
    EnsureTransports {
        peer_id: String,
        respond_to: oneshot::Sender<Result<TransportPair, BrokerError>>,
    },

    /// Run the DTLS handshake for one of the peer's transports.
    ConnectTransport {
        peer_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// Mark the peer ready and catch it up on existing producers.
    ReadyToConsume {
        peer_id: String,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// Publish a stream and fan it out to ready members.
    Produce {
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<String, BrokerError>>,
    },

    /// Pause relay delivery of one of the peer's producers.
    PauseProducer {
        peer_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// Resume relay delivery of one of the peer's producers.
    ResumeProducer {
        peer_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// Get current room state (reaper, health, tests).
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Identity assigned to a peer when its connection opens.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub peer_id: String,
    pub display_name: String,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Capability descriptor of the room's router.
    pub router_rtp_capabilities: RtpCapabilities,
    /// Members present before this join (id + name only), captured
    /// atomically with the membership mutation.
    pub existing_peers: Vec<PeerSummary>,
}

/// Both transport descriptors for a peer.
#[derive(Debug, Clone)]
pub struct TransportPair {
    pub send: TransportDescriptor,
    pub recv: TransportDescriptor,
}

/// Status of the `BrokerActor`.
#[derive(Debug, Clone)]
pub struct BrokerStatus {
    /// Registered rooms.
    pub room_count: usize,
    /// Registered peers (connections, joined or not).
    pub peer_count: usize,
}

/// Snapshot of one member, for state inspection.
#[derive(Debug, Clone)]
pub struct RoomPeerState {
    pub peer_id: String,
    pub display_name: String,
    pub is_ready: bool,
    pub has_send_transport: bool,
    pub has_recv_transport: bool,
    pub producer_count: usize,
    pub consumer_count: usize,
    pub consumed_producers: Vec<String>,
}

/// Snapshot of a room.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    pub engine_index: usize,
    pub created_at: i64,
    pub peers: Vec<RoomPeerState>,
    /// How long the room has been empty, if it is.
    pub empty_for: Option<Duration>,
}

impl RoomState {
    /// Number of producers currently live in the room.
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.peers.iter().map(|p| p.producer_count).sum()
    }
}
