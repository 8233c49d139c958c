//! WebSocket signaling endpoint and per-connection message loop.
//!
//! One task per connection reads, decodes and dispatches messages in receipt
//! order; a separate writer task drains the peer's outbound channel so
//! broadcasts from room actors are delivered even while this peer's own
//! request is awaiting the engine. Malformed or unknown messages are
//! answered with an `error` envelope and never tear the connection down.

use crate::actors::messages::PeerIdentity;
use crate::actors::{BrokerActorHandle, RoomActorHandle};
use crate::engine::EnginePool;
use crate::errors::BrokerError;
use crate::observability::{health_router, HealthState};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use signal_protocol::{
    ClientMessage, ErrorKind, PeerSummary, RtpCapabilities, RtpCodecCapability, ServerMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Buffer for messages queued toward one client.
const OUTBOUND_BUFFER: usize = 256;

/// Shared state for the signaling endpoint.
pub struct AppState {
    pub broker: BrokerActorHandle,
    pub engines: Arc<EnginePool>,
    /// Codec table rooms' routers are created with.
    pub router_codecs: Vec<RtpCodecCapability>,
}

/// Build the HTTP router: the `/ws` signaling endpoint plus health probes.
pub fn app_router(state: Arc<AppState>, health: Arc<HealthState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .merge(health_router(health))
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-connection signaling state. Everything race-sensitive lives in the
/// room actor; this only tracks identity, the room handle once joined, and
/// capabilities exchanged before joining.
struct PeerSession {
    identity: PeerIdentity,
    outbound: mpsc::Sender<ServerMessage>,
    room: Option<RoomActorHandle>,
    /// Capabilities received before the peer joined a room; handed to the
    /// room at join time.
    pending_capabilities: Option<RtpCapabilities>,
}

impl PeerSession {
    fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.identity.peer_id.clone(),
            name: self.identity.display_name.clone(),
        }
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_outbound(sink, outbound_rx));

    let identity = match state.broker.register_peer().await {
        Ok(identity) => identity,
        Err(e) => {
            error!(target: "broker.ws", error = %e, "Failed to register peer");
            return;
        }
    };

    info!(
        target: "broker.ws",
        peer_id = %identity.peer_id,
        display_name = %identity.display_name,
        "Client connected"
    );

    let _ = outbound_tx
        .send(ServerMessage::Connected {
            peer_id: identity.peer_id.clone(),
            name: identity.display_name.clone(),
        })
        .await;

    let mut session = PeerSession {
        identity,
        outbound: outbound_tx,
        room: None,
        pending_capabilities: None,
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&state, &mut session, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {}
            Err(e) => {
                debug!(
                    target: "broker.ws",
                    peer_id = %session.identity.peer_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    teardown(&state, session).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
}

/// Drain the outbound channel into the socket. Runs until every sender is
/// dropped (teardown) or the socket rejects a write.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        match serde_json::to_string(&message) {
            Ok(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(target: "broker.ws", error = %e, "Failed to encode server message");
            }
        }
    }
    let _ = sink.close().await;
}

/// Decode one frame and dispatch it. Handler failures become an `error`
/// envelope to this peer only.
async fn handle_text(state: &Arc<AppState>, session: &mut PeerSession, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(
                target: "broker.ws",
                peer_id = %session.identity.peer_id,
                error = %e,
                "Rejected malformed message"
            );
            let _ = session
                .outbound
                .send(ServerMessage::error(
                    ErrorKind::InvalidData,
                    "Invalid message format",
                ))
                .await;
            return;
        }
    };

    debug!(
        target: "broker.ws",
        peer_id = %session.identity.peer_id,
        action = message.action(),
        "Message received"
    );

    if let Err(error) = dispatch(state, session, message).await {
        warn!(
            target: "broker.ws",
            peer_id = %session.identity.peer_id,
            error = %error,
            "Handler failed"
        );
        let _ = session
            .outbound
            .send(ServerMessage::error(error.kind(), error.client_message()))
            .await;
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    session: &mut PeerSession,
    message: ClientMessage,
) -> Result<(), BrokerError> {
    match message {
        ClientMessage::CreateRoom => handle_create_room(state, session).await,

        ClientMessage::JoinRoom { room_id } => handle_join_room(state, session, room_id).await,

        ClientMessage::SendRtpCapabilities { rtp_capabilities } => {
            handle_capabilities(session, rtp_capabilities).await
        }

        ClientMessage::CreateWebRtcTransports => {
            let room = joined_room(session)?;
            let pair = room
                .ensure_transports(session.identity.peer_id.clone())
                .await?;
            let _ = session
                .outbound
                .send(ServerMessage::WebRtcTransports {
                    send_transport_options: pair.send,
                    recv_transport_options: pair.recv,
                })
                .await;
            Ok(())
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            let room = joined_room(session)?;
            room.connect_transport(
                session.identity.peer_id.clone(),
                transport_id.clone(),
                dtls_parameters,
            )
            .await?;
            let _ = session
                .outbound
                .send(ServerMessage::TransportConnected { transport_id })
                .await;
            Ok(())
        }

        ClientMessage::ReadyToConsume => {
            let room = joined_room(session)?;
            room.ready_to_consume(session.identity.peer_id.clone()).await
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let room = joined_room(session)?;
            let producer_id = room
                .produce(
                    session.identity.peer_id.clone(),
                    transport_id,
                    kind,
                    rtp_parameters,
                )
                .await?;
            let _ = session
                .outbound
                .send(ServerMessage::Produced { producer_id })
                .await;
            Ok(())
        }

        ClientMessage::PauseProducer { producer_id } => {
            let room = joined_room(session)?;
            room.pause_producer(session.identity.peer_id.clone(), producer_id.clone())
                .await?;
            let _ = session
                .outbound
                .send(ServerMessage::ProducerPaused { producer_id })
                .await;
            Ok(())
        }

        ClientMessage::ResumeProducer { producer_id } => {
            let room = joined_room(session)?;
            room.resume_producer(session.identity.peer_id.clone(), producer_id.clone())
                .await?;
            let _ = session
                .outbound
                .send(ServerMessage::ProducerResumed { producer_id })
                .await;
            Ok(())
        }
    }
}

fn joined_room(session: &PeerSession) -> Result<RoomActorHandle, BrokerError> {
    session
        .room
        .clone()
        .ok_or_else(|| BrokerError::InvalidData("Peer must be in a room".to_string()))
}

async fn handle_create_room(
    state: &Arc<AppState>,
    session: &mut PeerSession,
) -> Result<(), BrokerError> {
    if session.room.is_some() {
        return Err(BrokerError::InvalidData("Already in a room".to_string()));
    }

    // Router creation happens here, not in the broker actor, so a slow
    // engine suspends only this connection.
    let (engine_index, engine) = state.engines.next();
    let router = engine
        .create_router(state.router_codecs.clone())
        .await
        .map_err(|e| BrokerError::Internal(format!("engine create_router failed: {e}")))?;

    let room = state.broker.create_room(router, engine_index).await?;
    let outcome = room
        .join(
            session.identity.peer_id.clone(),
            session.identity.display_name.clone(),
            session.outbound.clone(),
            session.pending_capabilities.take(),
        )
        .await?;

    let room_id = room.room_id().to_string();
    session.room = Some(room);

    info!(
        target: "broker.ws",
        peer_id = %session.identity.peer_id,
        room_id = %room_id,
        "Room created"
    );

    let _ = session
        .outbound
        .send(ServerMessage::RoomCreated {
            room_id,
            router_rtp_capabilities: outcome.router_rtp_capabilities,
        })
        .await;
    Ok(())
}

async fn handle_join_room(
    state: &Arc<AppState>,
    session: &mut PeerSession,
    room_id: String,
) -> Result<(), BrokerError> {
    if session.room.is_some() {
        return Err(BrokerError::InvalidData("Already in a room".to_string()));
    }
    if room_id.is_empty() {
        return Err(BrokerError::InvalidData("Room ID is required".to_string()));
    }

    let room = state.broker.get_room(room_id.clone()).await?;
    let outcome = room
        .join(
            session.identity.peer_id.clone(),
            session.identity.display_name.clone(),
            session.outbound.clone(),
            session.pending_capabilities.take(),
        )
        .await?;
    session.room = Some(room);

    info!(
        target: "broker.ws",
        peer_id = %session.identity.peer_id,
        room_id = %room_id,
        "Joined room"
    );

    let _ = session
        .outbound
        .send(ServerMessage::JoinedRoom {
            peer: session.summary(),
            room_id,
            router_rtp_capabilities: outcome.router_rtp_capabilities,
            existing_peers: outcome.existing_peers,
        })
        .await;
    Ok(())
}

/// Store capabilities; held locally until the peer joins a room, forwarded
/// immediately once it has. No response message either way.
async fn handle_capabilities(
    session: &mut PeerSession,
    rtp_capabilities: RtpCapabilities,
) -> Result<(), BrokerError> {
    match &session.room {
        Some(room) => {
            room.store_rtp_capabilities(session.identity.peer_id.clone(), rtp_capabilities)
                .await
        }
        None => {
            session.pending_capabilities = Some(rtp_capabilities);
            Ok(())
        }
    }
}

/// Full peer teardown: leave the room (closing every owned handle and
/// notifying the remaining members), then drop the registry entry. Runs on
/// every exit path - clean close, socket error, or decode loop exit - and
/// never propagates a failure.
async fn teardown(state: &Arc<AppState>, session: PeerSession) {
    let peer_id = session.identity.peer_id.clone();

    if let Some(room) = &session.room {
        if let Err(e) = room.leave(peer_id.clone()).await {
            debug!(
                target: "broker.ws",
                peer_id = %peer_id,
                error = %e,
                "Leave during teardown failed"
            );
        }
    }

    if let Err(e) = state.broker.deregister_peer(peer_id.clone()).await {
        warn!(
            target: "broker.ws",
            peer_id = %peer_id,
            error = %e,
            "Deregister during teardown failed"
        );
    }

    info!(target: "broker.ws", peer_id = %peer_id, "Client disconnected");
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::config::RoomLimits;
    use crate::engine::loopback::LoopbackEngine;
    use crate::engine::{ListenConfig, MediaEngine};
    use signal_protocol::codecs;

    fn app_state() -> Arc<AppState> {
        let limits = RoomLimits {
            max_peers_per_room: 4,
            max_producers_per_peer: 4,
            max_consumers_per_peer: 16,
        };
        let listen = ListenConfig {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            min_port: 40_000,
            max_port: 40_099,
        };
        let broker = BrokerActorHandle::new(
            limits,
            listen,
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        let engines: Vec<Arc<dyn MediaEngine>> = vec![Arc::new(LoopbackEngine::new(0))];
        Arc::new(AppState {
            broker,
            engines: Arc::new(EnginePool::new(engines).unwrap()),
            router_codecs: codecs::balanced(),
        })
    }

    async fn session_for(
        state: &Arc<AppState>,
    ) -> (PeerSession, mpsc::Receiver<ServerMessage>) {
        let identity = state.broker.register_peer().await.unwrap();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (
            PeerSession {
                identity,
                outbound: tx,
                room: None,
                pending_capabilities: None,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_create_room_responds_with_room_id() {
        let state = app_state();
        let (mut session, mut rx) = session_for(&state).await;

        dispatch(&state, &mut session, ClientMessage::CreateRoom)
            .await
            .unwrap();
        assert!(session.room.is_some());

        match rx.recv().await.unwrap() {
            ServerMessage::RoomCreated {
                room_id,
                router_rtp_capabilities,
            } => {
                assert!(!room_id.is_empty());
                assert!(router_rtp_capabilities.supports_mime_type("video/VP8"));
            }
            other => panic!("expected roomCreated, got {other:?}"),
        }

        state.broker.cancel();
    }

    #[tokio::test]
    async fn test_join_unknown_room_fails() {
        let state = app_state();
        let (mut session, _rx) = session_for(&state).await;

        let result = dispatch(
            &state,
            &mut session,
            ClientMessage::JoinRoom {
                room_id: "no-such-room".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(BrokerError::RoomNotFound)));
        assert!(session.room.is_none());

        state.broker.cancel();
    }

    #[tokio::test]
    async fn test_room_scoped_action_without_room_is_invalid() {
        let state = app_state();
        let (mut session, _rx) = session_for(&state).await;

        let result = dispatch(&state, &mut session, ClientMessage::CreateWebRtcTransports).await;
        assert!(matches!(result, Err(BrokerError::InvalidData(_))));

        state.broker.cancel();
    }

    #[tokio::test]
    async fn test_capabilities_before_join_are_handed_to_room() {
        let state = app_state();

        // A creates the room.
        let (mut creator, mut creator_rx) = session_for(&state).await;
        dispatch(&state, &mut creator, ClientMessage::CreateRoom)
            .await
            .unwrap();
        let room_id = match creator_rx.recv().await.unwrap() {
            ServerMessage::RoomCreated { room_id, .. } => room_id,
            other => panic!("expected roomCreated, got {other:?}"),
        };

        // B exchanges capabilities first, then joins.
        let (mut joiner, mut joiner_rx) = session_for(&state).await;
        dispatch(
            &state,
            &mut joiner,
            ClientMessage::SendRtpCapabilities {
                rtp_capabilities: RtpCapabilities {
                    codecs: codecs::balanced(),
                    header_extensions: vec![],
                },
            },
        )
        .await
        .unwrap();
        assert!(joiner.pending_capabilities.is_some());

        dispatch(&state, &mut joiner, ClientMessage::JoinRoom { room_id })
            .await
            .unwrap();
        assert!(joiner.pending_capabilities.is_none());

        match joiner_rx.recv().await.unwrap() {
            ServerMessage::JoinedRoom { existing_peers, .. } => {
                assert_eq!(existing_peers.len(), 1);
                assert_eq!(existing_peers[0].id, creator.identity.peer_id);
            }
            other => panic!("expected joinedRoom, got {other:?}"),
        }

        // With capabilities delivered at join, readiness only needs transports.
        dispatch(&state, &mut joiner, ClientMessage::CreateWebRtcTransports)
            .await
            .unwrap();
        dispatch(&state, &mut joiner, ClientMessage::ReadyToConsume)
            .await
            .unwrap();

        state.broker.cancel();
    }

    #[tokio::test]
    async fn test_second_create_room_is_rejected() {
        let state = app_state();
        let (mut session, _rx) = session_for(&state).await;

        dispatch(&state, &mut session, ClientMessage::CreateRoom)
            .await
            .unwrap();
        let result = dispatch(&state, &mut session, ClientMessage::CreateRoom).await;
        assert!(matches!(result, Err(BrokerError::InvalidData(_))));

        state.broker.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frame_yields_invalid_data_envelope() {
        let state = app_state();
        let (mut session, mut rx) = session_for(&state).await;

        handle_text(&state, &mut session, "not json at all").await;
        match rx.recv().await.unwrap() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidData),
            other => panic!("expected error envelope, got {other:?}"),
        }

        handle_text(&state, &mut session, r#"{"action":"hijack"}"#).await;
        match rx.recv().await.unwrap() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidData),
            other => panic!("expected error envelope, got {other:?}"),
        }

        state.broker.cancel();
    }
}
