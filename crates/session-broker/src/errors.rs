//! Session broker error types.
//!
//! Error variants map to wire [`ErrorKind`] values for client responses.
//! Internal details are logged server-side but not exposed to clients.

use signal_protocol::ErrorKind;
use thiserror::Error;

/// Session broker error type.
///
/// Maps to wire `ErrorKind` values:
/// - `RoomNotFound`, `RoomClosed`: `ROOM_NOT_FOUND`
/// - `RoomFull`: `ROOM_FULL`
/// - `PeerNotFound`: `PEER_NOT_FOUND`
/// - `Transport`: `TRANSPORT_ERROR`
/// - `Producer`: `PRODUCER_ERROR`
/// - `Consumer`: `CONSUMER_ERROR`
/// - `InvalidData`: `INVALID_DATA`
/// - `Internal`: `SERVER_ERROR`
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Room id does not resolve to a registered room.
    #[error("room not found")]
    RoomNotFound,

    /// Room is at its peer capacity.
    #[error("room is full")]
    RoomFull,

    /// Peer id does not resolve to a registered peer.
    #[error("peer not found")]
    PeerNotFound,

    /// The room's actor has shut down (reaped or cancelled); callers holding
    /// a stale handle observe this instead of a hung request.
    #[error("room closed")]
    RoomClosed,

    /// Transport lookup or engine transport operation failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Producer lookup, capacity or engine producer operation failed.
    #[error("producer error: {0}")]
    Producer(String),

    /// Consumer operation failed.
    #[error("consumer error: {0}")]
    Consumer(String),

    /// Request was well-formed JSON but violated a handler precondition.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Internal error (actor channel failures, unexpected engine faults).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Returns the wire `ErrorKind` for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::RoomNotFound | BrokerError::RoomClosed => ErrorKind::RoomNotFound,
            BrokerError::RoomFull => ErrorKind::RoomFull,
            BrokerError::PeerNotFound => ErrorKind::PeerNotFound,
            BrokerError::Transport(_) => ErrorKind::TransportError,
            BrokerError::Producer(_) => ErrorKind::ProducerError,
            BrokerError::Consumer(_) => ErrorKind::ConsumerError,
            BrokerError::InvalidData(_) => ErrorKind::InvalidData,
            BrokerError::Internal(_) => ErrorKind::ServerError,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            BrokerError::RoomNotFound | BrokerError::RoomClosed => {
                "Room does not exist".to_string()
            }
            BrokerError::RoomFull => "Room is full".to_string(),
            BrokerError::PeerNotFound => "Peer not found".to_string(),
            BrokerError::Transport(msg)
            | BrokerError::Producer(msg)
            | BrokerError::Consumer(msg)
            | BrokerError::InvalidData(msg) => msg.clone(),
            BrokerError::Internal(_) => "Internal server error".to_string(),
        }
    }
}
