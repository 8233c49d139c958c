//! `BrokerActor` - singleton supervisor for rooms and the peer registry.
//!
//! The `BrokerActor` is the top-level actor in the hierarchy:
//!
//! - Singleton per process
//! - Owns the room registry and the peer registry
//! - Spawns a `RoomActor` per room and monitors child health
//! - Runs the idle-room reaper in its own select loop
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! # Idle-room policy
//!
//! Empty rooms are removed exclusively by the periodic sweep once they have
//! been empty past the idle threshold. Because room lookups and the sweep
//! are both broker messages, a join can never race the reaper for the same
//! registry entry; a join holding an already-reaped handle observes a closed
//! mailbox and surfaces `ROOM_NOT_FOUND`.

use crate::config::RoomLimits;
use crate::engine::{ListenConfig, RouterHandle};
use crate::errors::BrokerError;
use crate::ids;

use super::messages::{BrokerMessage, BrokerStatus, PeerIdentity};
use super::room::{RoomActor, RoomActorHandle};

use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the broker mailbox.
const BROKER_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `BrokerActor`.
///
/// This is the public interface for interacting with the broker. All
/// methods are async and return results via oneshot channels.
#[derive(Clone)]
pub struct BrokerActorHandle {
    sender: mpsc::Sender<BrokerMessage>,
    cancel_token: CancellationToken,
}

impl BrokerActorHandle {
    /// Create a new `BrokerActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        limits: RoomLimits,
        listen: ListenConfig,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(BROKER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = BrokerActor {
            receiver,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            peers: HashMap::new(),
            limits,
            listen,
            idle_timeout,
            sweep_interval,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Register a newly connected peer and receive its identity.
    pub async fn register_peer(&self) -> Result<PeerIdentity, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(BrokerMessage::RegisterPeer { respond_to: tx })
            .await
            .map_err(|e| BrokerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BrokerError::Internal(format!("response receive failed: {e}")))
    }

    /// Remove a peer from the registry (connection closed).
    pub async fn deregister_peer(&self, peer_id: String) -> Result<(), BrokerError> {
        self.sender
            .send(BrokerMessage::DeregisterPeer { peer_id })
            .await
            .map_err(|e| BrokerError::Internal(format!("channel send failed: {e}")))
    }

    /// Install a new room around a freshly created router.
    pub async fn create_room(
        &self,
        router: Arc<dyn RouterHandle>,
        engine_index: usize,
    ) -> Result<RoomActorHandle, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(BrokerMessage::CreateRoom {
                router,
                engine_index,
                respond_to: tx,
            })
            .await
            .map_err(|e| BrokerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BrokerError::Internal(format!("response receive failed: {e}")))?
    }

    /// Resolve a room id to its actor handle.
    pub async fn get_room(&self, room_id: String) -> Result<RoomActorHandle, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(BrokerMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| BrokerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BrokerError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current broker status.
    pub async fn get_status(&self) -> Result<BrokerStatus, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(BrokerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| BrokerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BrokerError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (immediate shutdown, propagates to all rooms).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that should stop with the broker.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    /// Handle to the room actor.
    handle: RoomActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
}

/// A registered peer (one live connection).
struct RegisteredPeer {
    display_name: String,
}

/// The `BrokerActor` implementation.
pub struct BrokerActor {
    receiver: mpsc::Receiver<BrokerMessage>,
    cancel_token: CancellationToken,
    /// Managed rooms by ID.
    rooms: HashMap<String, ManagedRoom>,
    /// Registered peers by ID.
    peers: HashMap<String, RegisteredPeer>,
    limits: RoomLimits,
    listen: ListenConfig,
    /// Empty-room inactivity threshold.
    idle_timeout: Duration,
    /// Reaper period.
    sweep_interval: Duration,
}

impl BrokerActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "broker.actor.broker")]
    async fn run(mut self) {
        info!(
            target: "broker.actor.broker",
            idle_timeout_secs = self.idle_timeout.as_secs(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "BrokerActor started"
        );

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Reap rooms whose actor task has terminated.
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "broker.actor.broker",
                        "BrokerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep_idle_rooms().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "broker.actor.broker",
                                "BrokerActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "broker.actor.broker",
            rooms_remaining = self.rooms.len(),
            "BrokerActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: BrokerMessage) {
        match message {
            BrokerMessage::RegisterPeer { respond_to } => {
                let identity = self.register_peer();
                let _ = respond_to.send(identity);
            }

            BrokerMessage::DeregisterPeer { peer_id } => {
                self.deregister_peer(&peer_id);
            }

            BrokerMessage::CreateRoom {
                router,
                engine_index,
                respond_to,
            } => {
                let result = self.create_room(router, engine_index);
                let _ = respond_to.send(result);
            }

            BrokerMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self
                    .rooms
                    .get(&room_id)
                    .map(|managed| managed.handle.clone())
                    .ok_or(BrokerError::RoomNotFound);
                let _ = respond_to.send(result);
            }

            BrokerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(BrokerStatus {
                    room_count: self.rooms.len(),
                    peer_count: self.peers.len(),
                });
            }
        }
    }

    fn register_peer(&mut self) -> PeerIdentity {
        let identity = PeerIdentity {
            peer_id: ids::new_id(),
            display_name: ids::random_display_name(),
        };

        self.peers.insert(
            identity.peer_id.clone(),
            RegisteredPeer {
                display_name: identity.display_name.clone(),
            },
        );

        counter!("broker_connections_total").increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!("broker_peers").set(self.peers.len() as f64);

        info!(
            target: "broker.actor.broker",
            peer_id = %identity.peer_id,
            display_name = %identity.display_name,
            total_peers = self.peers.len(),
            "Peer registered"
        );

        identity
    }

    fn deregister_peer(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.remove(peer_id) {
            #[allow(clippy::cast_precision_loss)]
            gauge!("broker_peers").set(self.peers.len() as f64);

            info!(
                target: "broker.actor.broker",
                peer_id = %peer_id,
                display_name = %peer.display_name,
                total_peers = self.peers.len(),
                "Peer deregistered"
            );
        } else {
            debug!(
                target: "broker.actor.broker",
                peer_id = %peer_id,
                "Deregister for unknown peer ignored"
            );
        }
    }

    /// Spawn a room actor around the router and register it.
    fn create_room(
        &mut self,
        router: Arc<dyn RouterHandle>,
        engine_index: usize,
    ) -> Result<RoomActorHandle, BrokerError> {
        let room_id = ids::new_id();
        let room_token = self.cancel_token.child_token();

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            router,
            engine_index,
            self.listen.clone(),
            self.limits,
            room_token,
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );

        counter!("broker_rooms_created_total").increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!("broker_rooms").set(self.rooms.len() as f64);

        info!(
            target: "broker.actor.broker",
            room_id = %room_id,
            engine_index = engine_index,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        Ok(handle)
    }

    /// Sweep the room registry and reap rooms empty past the idle threshold.
    async fn sweep_idle_rooms(&mut self) {
        let entries: Vec<(String, RoomActorHandle)> = self
            .rooms
            .iter()
            .map(|(id, managed)| (id.clone(), managed.handle.clone()))
            .collect();

        for (room_id, handle) in entries {
            match handle.get_state().await {
                Ok(state) => {
                    if state.empty_for.is_some_and(|idle| idle >= self.idle_timeout) {
                        info!(
                            target: "broker.actor.broker",
                            room_id = %room_id,
                            "Reaping idle room"
                        );
                        self.remove_room(&room_id).await;
                    }
                }
                Err(_) => {
                    // Room actor is gone but still registered; drop the entry.
                    warn!(
                        target: "broker.actor.broker",
                        room_id = %room_id,
                        "Room actor unreachable during sweep, removing"
                    );
                    self.remove_room(&room_id).await;
                }
            }
        }
    }

    /// Cancel a room actor and drop its registry entry.
    async fn remove_room(&mut self, room_id: &str) {
        if let Some(managed) = self.rooms.remove(room_id) {
            managed.handle.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(1), managed.task_handle).await;

            #[allow(clippy::cast_precision_loss)]
            gauge!("broker_rooms").set(self.rooms.len() as f64);

            info!(
                target: "broker.actor.broker",
                room_id = %room_id,
                total_rooms = self.rooms.len(),
                "Room removed"
            );
        }
    }

    /// Check for terminated room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in finished {
            if let Some(managed) = self.rooms.remove(&room_id) {
                match managed.task_handle.await {
                    Ok(()) => {
                        debug!(
                            target: "broker.actor.broker",
                            room_id = %room_id,
                            "Room actor exited cleanly"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "broker.actor.broker",
                                room_id = %room_id,
                                error = ?join_error,
                                "Room actor panicked"
                            );
                        }
                    }
                }

                #[allow(clippy::cast_precision_loss)]
                gauge!("broker_rooms").set(self.rooms.len() as f64);
            }
        }
    }

    /// Perform graceful shutdown: cancel every room and wait briefly.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "broker.actor.broker",
            rooms = self.rooms.len(),
            peers = self.peers.len(),
            "Performing graceful shutdown"
        );

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "broker.actor.broker",
                        room_id = %room_id,
                        "Room completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "broker.actor.broker",
                        room_id = %room_id,
                        error = ?e,
                        "Room task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "broker.actor.broker",
                        room_id = %room_id,
                        "Room shutdown timed out"
                    );
                }
            }
        }

        self.peers.clear();

        info!(target: "broker.actor.broker", "Graceful shutdown complete");
    }
}
