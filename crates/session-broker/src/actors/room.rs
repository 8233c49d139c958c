//! `RoomActor` - per-room actor that owns all member state.
//!
//! Each `RoomActor`:
//! - Owns the membership map and every member's media handles
//! - Serializes all mutation of room state through its mailbox
//! - Drives the engine router assigned to the room
//!
//! Handlers may await the engine; that suspends only this room. Peers in
//! other rooms are handled by their own actors and never wait on this one.
//!
//! # Consumer creation
//!
//! [`RoomActor::try_create_consumer`] is the single path that attaches a
//! member to a remote producer. Both triggers go through it - a peer
//! declaring itself ready (pull) and a new producer appearing (push) - so
//! the at-most-one-consumer-per-(peer, producer) invariant holds regardless
//! of message ordering. Its skip conditions are normal races, not faults,
//! and surface no error to anyone.

use crate::config::RoomLimits;
use crate::engine::{
    ConsumerHandle, ListenConfig, ProducerHandle, RouterHandle, TransportHandle,
};
use crate::errors::BrokerError;

use super::messages::{JoinOutcome, RoomMessage, RoomPeerState, RoomState, TransportPair};

use signal_protocol::{
    DtlsParameters, MediaKind, PeerSummary, RtpCapabilities, RtpParameters, ServerMessage,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 256;

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomActorHandle {
    /// Get the room ID.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn request<T>(
        &self,
        message: RoomMessage,
        rx: oneshot::Receiver<Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        // A closed mailbox means the room was reaped or shut down; callers
        // holding a stale handle see the room as gone.
        self.sender
            .send(message)
            .await
            .map_err(|_| BrokerError::RoomClosed)?;
        rx.await.map_err(|_| BrokerError::RoomClosed)?
    }

    /// Admit a peer to the room.
    pub async fn join(
        &self,
        peer_id: String,
        display_name: String,
        outbound: mpsc::Sender<ServerMessage>,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> Result<JoinOutcome, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RoomMessage::Join {
                peer_id,
                display_name,
                outbound,
                rtp_capabilities,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Remove a peer and release everything it owns.
    pub async fn leave(&self, peer_id: String) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(RoomMessage::Leave { peer_id, respond_to: tx }, rx)
            .await
    }

    /// Store a member's receive capabilities.
    pub async fn store_rtp_capabilities(
        &self,
        peer_id: String,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RoomMessage::StoreRtpCapabilities {
                peer_id,
                rtp_capabilities,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Lazily create (or return the existing) send/recv transport pair.
    pub async fn ensure_transports(&self, peer_id: String) -> Result<TransportPair, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(RoomMessage::EnsureTransports { peer_id, respond_to: tx }, rx)
            .await
    }

    /// Run the DTLS handshake for one of the peer's transports.
    pub async fn connect_transport(
        &self,
        peer_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Mark the peer ready and catch it up on existing producers.
    pub async fn ready_to_consume(&self, peer_id: String) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(RoomMessage::ReadyToConsume { peer_id, respond_to: tx }, rx)
            .await
    }

    /// Publish a stream; returns the new producer id.
    pub async fn produce(
        &self,
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Pause relay delivery of one of the peer's producers.
    pub async fn pause_producer(
        &self,
        peer_id: String,
        producer_id: String,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RoomMessage::PauseProducer {
                peer_id,
                producer_id,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Resume relay delivery of one of the peer's producers.
    pub async fn resume_producer(
        &self,
        peer_id: String,
        producer_id: String,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RoomMessage::ResumeProducer {
                peer_id,
                producer_id,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Get current room state.
    pub async fn get_state(&self) -> Result<RoomState, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| BrokerError::RoomClosed)?;
        rx.await.map_err(|_| BrokerError::RoomClosed)
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// One member of the room, together with everything it owns.
struct Peer {
    peer_id: String,
    display_name: String,
    /// Channel to the peer's connection writer task.
    outbound: mpsc::Sender<ServerMessage>,
    /// Receive capabilities; required before any consume succeeds.
    rtp_capabilities: Option<RtpCapabilities>,
    send_transport_id: Option<String>,
    recv_transport_id: Option<String>,
    transports: HashMap<String, Arc<dyn TransportHandle>>,
    producers: HashMap<String, Arc<dyn ProducerHandle>>,
    consumers: HashMap<String, Arc<dyn ConsumerHandle>>,
    /// Producer ids this peer already consumes; the dedup guard.
    consumed_producers: HashSet<String>,
    is_ready: bool,
}

impl Peer {
    fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.peer_id.clone(),
            name: self.display_name.clone(),
        }
    }

    fn to_state(&self) -> RoomPeerState {
        RoomPeerState {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            is_ready: self.is_ready,
            has_send_transport: self.send_transport_id.is_some(),
            has_recv_transport: self.recv_transport_id.is_some(),
            producer_count: self.producers.len(),
            consumer_count: self.consumers.len(),
            consumed_producers: self.consumed_producers.iter().cloned().collect(),
        }
    }

    /// Close everything the peer owns, skipping already-closed handles.
    /// Engine close is infallible by contract, so this cannot fail partway.
    fn close_all(&self) {
        for consumer in self.consumers.values() {
            if !consumer.closed() {
                consumer.close();
            }
        }
        for producer in self.producers.values() {
            if !producer.closed() {
                producer.close();
            }
        }
        for transport in self.transports.values() {
            if !transport.closed() {
                transport.close();
            }
        }
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    /// Engine routing context assigned to this room.
    router: Arc<dyn RouterHandle>,
    /// Which engine instance the router lives on.
    engine_index: usize,
    listen: ListenConfig,
    limits: RoomLimits,
    peers: HashMap<String, Peer>,
    created_at: i64,
    /// Set exactly while the room has no members; the reaper keys off this.
    empty_since: Option<Instant>,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        router: Arc<dyn RouterHandle>,
        engine_index: usize,
        listen: ListenConfig,
        limits: RoomLimits,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            router,
            engine_index,
            listen,
            limits,
            peers: HashMap::new(),
            created_at: chrono::Utc::now().timestamp(),
            empty_since: Some(Instant::now()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "broker.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            engine_index = self.engine_index,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "broker.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "broker.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown();
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            "RoomActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                display_name,
                outbound,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_join(peer_id, display_name, outbound, rtp_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave { peer_id, respond_to } => {
                let result = self.handle_leave(&peer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::StoreRtpCapabilities {
                peer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self.handle_store_capabilities(&peer_id, rtp_capabilities);
                let _ = respond_to.send(result);
            }

            RoomMessage::EnsureTransports { peer_id, respond_to } => {
                let result = self.handle_ensure_transports(&peer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(&peer_id, &transport_id, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ReadyToConsume { peer_id, respond_to } => {
                let result = self.handle_ready_to_consume(&peer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_produce(&peer_id, &transport_id, kind, rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::PauseProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_pause_producer(&peer_id, &producer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ResumeProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_resume_producer(&peer_id, &producer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    /// Admit a peer: capacity check first, then membership mutation, then the
    /// join broadcast. The roster handed back is captured in the same message
    /// so no concurrent join or leave can skew it.
    #[instrument(skip_all, fields(room_id = %self.room_id, peer_id = %peer_id))]
    async fn handle_join(
        &mut self,
        peer_id: String,
        display_name: String,
        outbound: mpsc::Sender<ServerMessage>,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> Result<JoinOutcome, BrokerError> {
        if self.peers.contains_key(&peer_id) {
            return Err(BrokerError::InvalidData("Peer already in room".to_string()));
        }

        if self.peers.len() >= self.limits.max_peers_per_room {
            return Err(BrokerError::RoomFull);
        }

        let existing_peers: Vec<PeerSummary> = self.peers.values().map(Peer::summary).collect();

        let peer = Peer {
            peer_id: peer_id.clone(),
            display_name: display_name.clone(),
            outbound,
            rtp_capabilities,
            send_transport_id: None,
            recv_transport_id: None,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            consumed_producers: HashSet::new(),
            is_ready: false,
        };
        self.peers.insert(peer_id.clone(), peer);
        self.empty_since = None;

        self.broadcast(
            &peer_id,
            ServerMessage::NewPeerJoined {
                id: peer_id.clone(),
                name: display_name,
            },
        )
        .await;

        info!(
            target: "broker.actor.room",
            total_peers = self.peers.len(),
            "Peer joined"
        );

        Ok(JoinOutcome {
            router_rtp_capabilities: self.router.rtp_capabilities(),
            existing_peers,
        })
    }

    /// Remove a peer and release everything it owns. Consumers on other
    /// members that source the departed peer's producers are pruned too, so
    /// no consumer outlives its producer within the room.
    #[instrument(skip_all, fields(room_id = %self.room_id, peer_id = %peer_id))]
    async fn handle_leave(&mut self, peer_id: &str) -> Result<(), BrokerError> {
        let Some(peer) = self.peers.remove(peer_id) else {
            return Err(BrokerError::PeerNotFound);
        };

        peer.close_all();

        let departed_producers: HashSet<String> = peer.producers.keys().cloned().collect();
        if !departed_producers.is_empty() {
            self.prune_consumers_of(&departed_producers);
        }

        self.broadcast(
            peer_id,
            ServerMessage::PeerLeft {
                id: peer.peer_id.clone(),
                name: peer.display_name.clone(),
            },
        )
        .await;

        if self.peers.is_empty() {
            self.empty_since = Some(Instant::now());
        }

        info!(
            target: "broker.actor.room",
            remaining_peers = self.peers.len(),
            "Peer left"
        );

        Ok(())
    }

    /// Close and drop consumers on remaining members sourced from the given
    /// producers, keeping `consumed_producers` in step.
    fn prune_consumers_of(&mut self, producer_ids: &HashSet<String>) {
        for peer in self.peers.values_mut() {
            let stale: Vec<String> = peer
                .consumers
                .iter()
                .filter(|(_, consumer)| producer_ids.contains(consumer.producer_id()))
                .map(|(id, _)| id.clone())
                .collect();

            for consumer_id in stale {
                if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                    peer.consumed_producers.remove(consumer.producer_id());
                    if !consumer.closed() {
                        consumer.close();
                    }
                }
            }
        }
    }

    fn handle_store_capabilities(
        &mut self,
        peer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), BrokerError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or(BrokerError::PeerNotFound)?;
        peer.rtp_capabilities = Some(rtp_capabilities);

        debug!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            "Receive capabilities stored"
        );
        Ok(())
    }

    /// Lazily create the peer's transports. A repeated call returns the
    /// existing descriptors and allocates nothing on the engine.
    async fn handle_ensure_transports(
        &mut self,
        peer_id: &str,
    ) -> Result<TransportPair, BrokerError> {
        let (need_send, need_recv) = {
            let peer = self.peers.get(peer_id).ok_or(BrokerError::PeerNotFound)?;
            (
                peer.send_transport_id.is_none(),
                peer.recv_transport_id.is_none(),
            )
        };

        let new_send = if need_send {
            Some(self.create_transport().await?)
        } else {
            None
        };
        let new_recv = if need_recv {
            Some(self.create_transport().await?)
        } else {
            None
        };

        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or(BrokerError::PeerNotFound)?;

        if let Some(transport) = new_send {
            peer.send_transport_id = Some(transport.id().to_string());
            peer.transports.insert(transport.id().to_string(), transport);
        }
        if let Some(transport) = new_recv {
            peer.recv_transport_id = Some(transport.id().to_string());
            peer.transports.insert(transport.id().to_string(), transport);
        }

        let send = Self::descriptor_for(peer, peer.send_transport_id.clone())?;
        let recv = Self::descriptor_for(peer, peer.recv_transport_id.clone())?;

        debug!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            "Transports ready (reused if already created)"
        );

        Ok(TransportPair { send, recv })
    }

    async fn create_transport(&self) -> Result<Arc<dyn TransportHandle>, BrokerError> {
        self.router
            .create_transport(&self.listen)
            .await
            .map_err(|e| {
                warn!(
                    target: "broker.actor.room",
                    room_id = %self.room_id,
                    error = %e,
                    "Engine failed to create transport"
                );
                BrokerError::Transport("Failed to setup transports".to_string())
            })
    }

    fn descriptor_for(
        peer: &Peer,
        transport_id: Option<String>,
    ) -> Result<signal_protocol::TransportDescriptor, BrokerError> {
        transport_id
            .as_ref()
            .and_then(|id| peer.transports.get(id))
            .map(|t| t.descriptor())
            .ok_or_else(|| BrokerError::Transport("Failed to setup transports".to_string()))
    }

    async fn handle_connect_transport(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), BrokerError> {
        let transport = {
            let peer = self.peers.get(peer_id).ok_or(BrokerError::PeerNotFound)?;
            peer.transports
                .get(transport_id)
                .cloned()
                .ok_or_else(|| BrokerError::Transport("Transport not found".to_string()))?
        };

        transport.connect(dtls_parameters).await.map_err(|e| {
            warn!(
                target: "broker.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                transport_id = %transport_id,
                error = %e,
                "Transport connect failed"
            );
            BrokerError::Transport("Failed to connect transport".to_string())
        })?;

        debug!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            "Transport connected"
        );
        Ok(())
    }

    /// Mark the peer ready and pull in every producer already live in the
    /// room. Push delivery of later producers happens in `handle_produce`.
    #[instrument(skip_all, fields(room_id = %self.room_id, peer_id = %peer_id))]
    async fn handle_ready_to_consume(&mut self, peer_id: &str) -> Result<(), BrokerError> {
        {
            let peer = self
                .peers
                .get_mut(peer_id)
                .ok_or(BrokerError::PeerNotFound)?;
            if peer.recv_transport_id.is_none() || peer.rtp_capabilities.is_none() {
                return Err(BrokerError::InvalidData(
                    "Missing requirements for consuming".to_string(),
                ));
            }
            peer.is_ready = true;
        }

        let existing: Vec<(String, String)> = self
            .peers
            .iter()
            .filter(|(id, _)| id.as_str() != peer_id)
            .flat_map(|(id, peer)| {
                peer.producers
                    .keys()
                    .map(move |producer_id| (id.clone(), producer_id.clone()))
            })
            .collect();

        for (producing_peer_id, producer_id) in existing {
            self.try_create_consumer(peer_id, &producing_peer_id, &producer_id)
                .await;
        }

        debug!(target: "broker.actor.room", "Peer is ready to consume");
        Ok(())
    }

    /// Publish a stream on one of the peer's transports and fan it out to
    /// every other member already marked ready.
    #[instrument(skip_all, fields(room_id = %self.room_id, peer_id = %peer_id))]
    async fn handle_produce(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, BrokerError> {
        let transport = {
            let peer = self.peers.get(peer_id).ok_or(BrokerError::PeerNotFound)?;
            if peer.producers.len() >= self.limits.max_producers_per_peer {
                return Err(BrokerError::Producer("Maximum producers reached".to_string()));
            }
            peer.transports
                .get(transport_id)
                .cloned()
                .ok_or_else(|| BrokerError::Transport("Transport not found".to_string()))?
        };

        let producer = transport.produce(kind, rtp_parameters).await.map_err(|e| {
            warn!(
                target: "broker.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                error = %e,
                "Engine failed to create producer"
            );
            BrokerError::Producer("Failed to create producer".to_string())
        })?;
        let producer_id = producer.id().to_string();

        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or(BrokerError::PeerNotFound)?;
        peer.producers.insert(producer_id.clone(), producer);

        let ready_peers: Vec<String> = self
            .peers
            .iter()
            .filter(|(id, peer)| id.as_str() != peer_id && peer.is_ready)
            .map(|(id, _)| id.clone())
            .collect();

        for consuming_peer_id in ready_peers {
            self.try_create_consumer(&consuming_peer_id, peer_id, &producer_id)
                .await;
        }

        info!(
            target: "broker.actor.room",
            producer_id = %producer_id,
            kind = ?kind,
            "Producer created"
        );

        Ok(producer_id)
    }

    /// The single consumer-creation path (pull and push both land here).
    ///
    /// Every skip is silent: a missing recv-transport, missing capabilities,
    /// an already-consumed producer, an incompatible encoding or a full
    /// consumer budget are expected interleavings of the protocol.
    async fn try_create_consumer(
        &mut self,
        consuming_peer_id: &str,
        producing_peer_id: &str,
        producer_id: &str,
    ) {
        let (transport, capabilities) = {
            let Some(peer) = self.peers.get(consuming_peer_id) else {
                return;
            };
            let Some(recv_id) = peer.recv_transport_id.as_ref() else {
                debug!(
                    target: "broker.actor.room",
                    room_id = %self.room_id,
                    peer_id = %consuming_peer_id,
                    "Skipping consumer: no recv transport"
                );
                return;
            };
            let Some(capabilities) = peer.rtp_capabilities.clone() else {
                debug!(
                    target: "broker.actor.room",
                    room_id = %self.room_id,
                    peer_id = %consuming_peer_id,
                    "Skipping consumer: no capabilities"
                );
                return;
            };
            if peer.consumed_producers.contains(producer_id) {
                return;
            }
            if !self.router.can_consume(producer_id, &capabilities) {
                debug!(
                    target: "broker.actor.room",
                    room_id = %self.room_id,
                    peer_id = %consuming_peer_id,
                    producer_id = %producer_id,
                    "Skipping consumer: capabilities incompatible"
                );
                return;
            }
            if peer.consumers.len() >= self.limits.max_consumers_per_peer {
                warn!(
                    target: "broker.actor.room",
                    room_id = %self.room_id,
                    peer_id = %consuming_peer_id,
                    "Max consumers reached for peer"
                );
                return;
            }
            let Some(transport) = peer.transports.get(recv_id).cloned() else {
                return;
            };
            (transport, capabilities)
        };

        let Some(producing_summary) = self.peers.get(producing_peer_id).map(Peer::summary) else {
            return;
        };

        match transport.consume(producer_id, &capabilities).await {
            Ok(consumer) => {
                let message = ServerMessage::Consume {
                    producer_id: producer_id.to_string(),
                    peer: producing_summary,
                    id: consumer.id().to_string(),
                    kind: consumer.kind(),
                    rtp_parameters: consumer.rtp_parameters(),
                };

                let Some(peer) = self.peers.get_mut(consuming_peer_id) else {
                    consumer.close();
                    return;
                };
                peer.consumed_producers.insert(producer_id.to_string());
                let consumer_id = consumer.id().to_string();
                peer.consumers.insert(consumer_id.clone(), consumer);
                let outbound = peer.outbound.clone();

                debug!(
                    target: "broker.actor.room",
                    room_id = %self.room_id,
                    peer_id = %consuming_peer_id,
                    consumer_id = %consumer_id,
                    producer_id = %producer_id,
                    "Consumer created"
                );

                let _ = outbound.send(message).await;
            }
            Err(e) => {
                warn!(
                    target: "broker.actor.room",
                    room_id = %self.room_id,
                    peer_id = %consuming_peer_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to create consumer"
                );
            }
        }
    }

    async fn handle_pause_producer(
        &mut self,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<(), BrokerError> {
        let producer = self.owned_producer(peer_id, producer_id)?;
        producer
            .pause()
            .await
            .map_err(|_| BrokerError::Producer("Failed to pause producer".to_string()))?;

        debug!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            "Producer paused"
        );
        Ok(())
    }

    async fn handle_resume_producer(
        &mut self,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<(), BrokerError> {
        let producer = self.owned_producer(peer_id, producer_id)?;
        producer
            .resume()
            .await
            .map_err(|_| BrokerError::Producer("Failed to resume producer".to_string()))?;

        debug!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            "Producer resumed"
        );
        Ok(())
    }

    fn owned_producer(
        &self,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<Arc<dyn ProducerHandle>, BrokerError> {
        let peer = self.peers.get(peer_id).ok_or(BrokerError::PeerNotFound)?;
        peer.producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| BrokerError::Producer("Producer not found".to_string()))
    }

    fn get_state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            engine_index: self.engine_index,
            created_at: self.created_at,
            peers: self.peers.values().map(Peer::to_state).collect(),
            empty_for: self.empty_since.map(|since| since.elapsed()),
        }
    }

    /// Broadcast to all members except the named one.
    async fn broadcast(&self, except_peer_id: &str, message: ServerMessage) {
        for peer in self.peers.values() {
            if peer.peer_id != except_peer_id {
                let _ = peer.outbound.send(message.clone()).await;
            }
        }
    }

    /// Release every member's handles and the router.
    fn graceful_shutdown(&mut self) {
        for peer in self.peers.values() {
            peer.close_all();
        }
        self.peers.clear();

        if !self.router.closed() {
            self.router.close();
        }

        info!(
            target: "broker.actor.room",
            room_id = %self.room_id,
            "Room shut down, router released"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::RoomLimits;
    use crate::engine::loopback::LoopbackEngine;
    use crate::engine::MediaEngine;
    use signal_protocol::codecs;
    use signal_protocol::{DtlsFingerprint, DtlsRole, RtpCodecParameters};

    fn test_limits() -> RoomLimits {
        RoomLimits {
            max_peers_per_room: 4,
            max_producers_per_peer: 2,
            max_consumers_per_peer: 8,
        }
    }

    fn test_listen() -> ListenConfig {
        ListenConfig {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            min_port: 40_000,
            max_port: 40_099,
        }
    }

    fn caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: codecs::balanced(),
            header_extensions: vec![],
        }
    }

    fn video_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: serde_json::Map::new(),
                rtcp_feedback: vec![],
            }],
            ..RtpParameters::default()
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "00:11".to_string(),
            }],
        }
    }

    async fn spawn_room() -> (RoomActorHandle, JoinHandle<()>) {
        let router = LoopbackEngine::new(0)
            .create_router(codecs::balanced())
            .await
            .unwrap();
        RoomActor::spawn(
            "room-test".to_string(),
            router,
            0,
            test_listen(),
            test_limits(),
            CancellationToken::new(),
        )
    }

    fn peer_channel() -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(32)
    }

    #[tokio::test]
    async fn test_join_returns_roster_and_capabilities() {
        let (room, _task) = spawn_room().await;

        let (tx_a, _rx_a) = peer_channel();
        let outcome = room
            .join("a".to_string(), "Fox-1".to_string(), tx_a, None)
            .await
            .unwrap();
        assert!(outcome.existing_peers.is_empty());
        assert!(outcome.router_rtp_capabilities.supports_mime_type("video/VP8"));

        let (tx_b, _rx_b) = peer_channel();
        let outcome = room
            .join("b".to_string(), "Panda-2".to_string(), tx_b, None)
            .await
            .unwrap();
        assert_eq!(outcome.existing_peers.len(), 1);
        assert_eq!(outcome.existing_peers[0].id, "a");

        room.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_join_is_rejected() {
        let (room, _task) = spawn_room().await;

        let (tx, _rx) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx.clone(), None)
            .await
            .unwrap();

        let result = room.join("a".to_string(), "Fox-1".to_string(), tx, None).await;
        assert!(matches!(result, Err(BrokerError::InvalidData(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_join_at_capacity_is_rejected_without_mutation() {
        let router = LoopbackEngine::new(0)
            .create_router(codecs::balanced())
            .await
            .unwrap();
        let limits = RoomLimits {
            max_peers_per_room: 1,
            ..test_limits()
        };
        let (room, _task) = RoomActor::spawn(
            "room-cap".to_string(),
            router,
            0,
            test_listen(),
            limits,
            CancellationToken::new(),
        );

        let (tx_a, _rx_a) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx_a, None)
            .await
            .unwrap();

        let (tx_b, _rx_b) = peer_channel();
        let result = room.join("b".to_string(), "Panda-2".to_string(), tx_b, None).await;
        assert!(matches!(result, Err(BrokerError::RoomFull)));

        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.peers[0].peer_id, "a");

        room.cancel();
    }

    #[tokio::test]
    async fn test_ensure_transports_is_idempotent() {
        let (room, _task) = spawn_room().await;

        let (tx, _rx) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx, None)
            .await
            .unwrap();

        let first = room.ensure_transports("a".to_string()).await.unwrap();
        let second = room.ensure_transports("a".to_string()).await.unwrap();

        assert_eq!(first.send.id, second.send.id);
        assert_eq!(first.recv.id, second.recv.id);
        assert_ne!(first.send.id, first.recv.id);

        room.cancel();
    }

    #[tokio::test]
    async fn test_ready_without_prerequisites_is_invalid() {
        let (room, _task) = spawn_room().await;

        let (tx, _rx) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx, None)
            .await
            .unwrap();

        // No transports, no capabilities yet.
        let result = room.ready_to_consume("a".to_string()).await;
        assert!(matches!(result, Err(BrokerError::InvalidData(_))));

        // Transports alone are not enough either.
        room.ensure_transports("a".to_string()).await.unwrap();
        let result = room.ready_to_consume("a".to_string()).await;
        assert!(matches!(result, Err(BrokerError::InvalidData(_))));

        room.store_rtp_capabilities("a".to_string(), caps())
            .await
            .unwrap();
        room.ready_to_consume("a".to_string()).await.unwrap();

        room.cancel();
    }

    #[tokio::test]
    async fn test_producer_cap_is_enforced() {
        let (room, _task) = spawn_room().await;

        let (tx, _rx) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx, None)
            .await
            .unwrap();
        let pair = room.ensure_transports("a".to_string()).await.unwrap();
        room.connect_transport("a".to_string(), pair.send.id.clone(), dtls())
            .await
            .unwrap();

        for _ in 0..2 {
            room.produce(
                "a".to_string(),
                pair.send.id.clone(),
                MediaKind::Video,
                video_parameters(),
            )
            .await
            .unwrap();
        }

        let result = room
            .produce(
                "a".to_string(),
                pair.send.id.clone(),
                MediaKind::Video,
                video_parameters(),
            )
            .await;
        assert!(matches!(result, Err(BrokerError::Producer(_))));

        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers[0].producer_count, 2);

        room.cancel();
    }

    #[tokio::test]
    async fn test_produce_on_unknown_transport_is_transport_error() {
        let (room, _task) = spawn_room().await;

        let (tx, _rx) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx, None)
            .await
            .unwrap();

        let result = room
            .produce(
                "a".to_string(),
                "missing".to_string(),
                MediaKind::Video,
                video_parameters(),
            )
            .await;
        assert!(matches!(result, Err(BrokerError::Transport(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_pause_unknown_producer_is_producer_error() {
        let (room, _task) = spawn_room().await;

        let (tx, _rx) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx, None)
            .await
            .unwrap();

        let result = room
            .pause_producer("a".to_string(), "missing".to_string())
            .await;
        assert!(matches!(result, Err(BrokerError::Producer(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_leave_prunes_consumers_of_departed_producers() {
        let (room, _task) = spawn_room().await;

        let (tx_a, _rx_a) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx_a, None)
            .await
            .unwrap();
        let (tx_b, mut rx_b) = peer_channel();
        room.join("b".to_string(), "Panda-2".to_string(), tx_b, Some(caps()))
            .await
            .unwrap();

        let pair_a = room.ensure_transports("a".to_string()).await.unwrap();
        room.ensure_transports("b".to_string()).await.unwrap();
        room.ready_to_consume("b".to_string()).await.unwrap();

        room.produce(
            "a".to_string(),
            pair_a.send.id.clone(),
            MediaKind::Video,
            video_parameters(),
        )
        .await
        .unwrap();

        // B got a consumer for A's producer.
        let mut saw_consume = false;
        while let Ok(msg) = rx_b.try_recv() {
            if matches!(msg, ServerMessage::Consume { .. }) {
                saw_consume = true;
            }
        }
        assert!(saw_consume);

        room.leave("a".to_string()).await.unwrap();

        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);
        let b_state = &state.peers[0];
        assert_eq!(b_state.consumer_count, 0);
        assert!(b_state.consumed_producers.is_empty());

        room.cancel();
    }

    #[tokio::test]
    async fn test_empty_room_reports_empty_duration() {
        let (room, _task) = spawn_room().await;

        let state = room.get_state().await.unwrap();
        assert!(state.empty_for.is_some());

        let (tx, _rx) = peer_channel();
        room.join("a".to_string(), "Fox-1".to_string(), tx, None)
            .await
            .unwrap();
        let state = room.get_state().await.unwrap();
        assert!(state.empty_for.is_none());

        room.leave("a".to_string()).await.unwrap();
        let state = room.get_state().await.unwrap();
        assert!(state.empty_for.is_some());

        room.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_room_reports_closed_to_stale_handles() {
        let (room, task) = spawn_room().await;

        room.cancel();
        let _ = task.await;

        let (tx, _rx) = peer_channel();
        let result = room.join("a".to_string(), "Fox-1".to_string(), tx, None).await;
        assert!(matches!(result, Err(BrokerError::RoomClosed)));
    }
}
