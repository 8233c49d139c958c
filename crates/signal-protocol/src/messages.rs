//! Signaling envelope types.
//!
//! Client-to-broker and broker-to-client messages are closed tagged unions:
//! the `action` string selects the variant and `data` carries the payload.
//! Decoding rejects unknown actions and malformed payloads up front, so the
//! dispatch match in the broker is exhaustive by construction. Extra envelope
//! fields (such as a client-supplied `id`) are ignored; responses that need
//! correlation carry their own key (`transportId`, `producerId`).

use crate::rtp::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDescriptor,
};
use serde::{Deserialize, Serialize};

/// Error taxonomy surfaced to clients in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RoomNotFound,
    RoomFull,
    PeerNotFound,
    TransportError,
    ProducerError,
    ConsumerError,
    InvalidData,
    ServerError,
}

/// Public identity of a peer as shared with other room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
}

/// Messages a client sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data")]
pub enum ClientMessage {
    /// Create a new room and join it as the first member.
    #[serde(rename = "createRoom")]
    CreateRoom,

    /// Join an existing room by id.
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom { room_id: String },

    /// Store the peer's receive capabilities; required before consuming.
    #[serde(rename = "sendRtpCapabilities", rename_all = "camelCase")]
    SendRtpCapabilities { rtp_capabilities: RtpCapabilities },

    /// Lazily create (or return the existing) send and recv transports.
    #[serde(rename = "createWebRtcTransports")]
    CreateWebRtcTransports,

    /// Run the DTLS handshake for one of the peer's transports.
    #[serde(rename = "connectTransport", rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    /// Declare the peer ready to receive; catches up on existing producers.
    #[serde(rename = "readyToConsume")]
    ReadyToConsume,

    /// Publish an outbound stream on the given transport.
    #[serde(rename = "produce", rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Pause relay delivery of one of the peer's producers.
    #[serde(rename = "pauseProducer", rename_all = "camelCase")]
    PauseProducer { producer_id: String },

    /// Resume relay delivery of one of the peer's producers.
    #[serde(rename = "resumeProducer", rename_all = "camelCase")]
    ResumeProducer { producer_id: String },
}

impl ClientMessage {
    /// Action name, for logging.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom => "createRoom",
            ClientMessage::JoinRoom { .. } => "joinRoom",
            ClientMessage::SendRtpCapabilities { .. } => "sendRtpCapabilities",
            ClientMessage::CreateWebRtcTransports => "createWebRtcTransports",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::ReadyToConsume => "readyToConsume",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::PauseProducer { .. } => "pauseProducer",
            ClientMessage::ResumeProducer { .. } => "resumeProducer",
        }
    }
}

/// Messages the broker sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data")]
pub enum ServerMessage {
    /// Post-connect welcome carrying the assigned identity.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { peer_id: String, name: String },

    /// Response to `createRoom`.
    #[serde(rename = "roomCreated", rename_all = "camelCase")]
    RoomCreated {
        room_id: String,
        router_rtp_capabilities: RtpCapabilities,
    },

    /// Response to `joinRoom`, sent to the joiner.
    #[serde(rename = "joinedRoom", rename_all = "camelCase")]
    JoinedRoom {
        peer: PeerSummary,
        room_id: String,
        router_rtp_capabilities: RtpCapabilities,
        existing_peers: Vec<PeerSummary>,
    },

    /// Broadcast to existing members when a peer joins.
    #[serde(rename = "newPeerJoined")]
    NewPeerJoined { id: String, name: String },

    /// Broadcast to remaining members when a peer leaves.
    #[serde(rename = "peerLeft")]
    PeerLeft { id: String, name: String },

    /// Response to `createWebRtcTransports` with both directions.
    #[serde(rename = "createWebRtcTransports", rename_all = "camelCase")]
    WebRtcTransports {
        send_transport_options: TransportDescriptor,
        recv_transport_options: TransportDescriptor,
    },

    /// Acknowledgement of `connectTransport`, keyed by transport id.
    #[serde(rename = "transportConnected", rename_all = "camelCase")]
    TransportConnected { transport_id: String },

    /// Response to `produce` with the new producer id.
    #[serde(rename = "produced", rename_all = "camelCase")]
    Produced { producer_id: String },

    /// Push: a consumer was created for this peer against a remote producer.
    #[serde(rename = "consume", rename_all = "camelCase")]
    Consume {
        producer_id: String,
        peer: PeerSummary,
        id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Acknowledgement of `pauseProducer`.
    #[serde(rename = "producerPaused", rename_all = "camelCase")]
    ProducerPaused { producer_id: String },

    /// Acknowledgement of `resumeProducer`.
    #[serde(rename = "producerResumed", rename_all = "camelCase")]
    ProducerResumed { producer_id: String },

    /// Error report to the originating peer.
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "type")]
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    /// Build an `error` envelope.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_action_without_data() {
        let msg: ClientMessage = serde_json::from_str(r#"{"action":"createRoom"}"#).unwrap();
        assert_eq!(msg, ClientMessage::CreateRoom);

        let msg: ClientMessage = serde_json::from_str(r#"{"action":"readyToConsume"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ReadyToConsume);
    }

    #[test]
    fn test_decode_join_room() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"action":"joinRoom","data":{"roomId":"room-1"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: "room-1".to_string()
            }
        );
    }

    #[test]
    fn test_decode_ignores_envelope_id() {
        // Clients may tag envelopes with an id; the broker ignores it.
        let msg: ClientMessage = serde_json::from_str(
            r#"{"action":"pauseProducer","data":{"producerId":"p-9"},"id":"req-42"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::PauseProducer {
                producer_id: "p-9".to_string()
            }
        );
    }

    #[test]
    fn test_decode_unknown_action_fails() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"action":"hijack","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_missing_required_field_fails() {
        // joinRoom without a roomId must not reach a handler.
        let result = serde_json::from_str::<ClientMessage>(r#"{"action":"joinRoom","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_envelope_wire_shape() {
        let msg = ServerMessage::error(ErrorKind::RoomNotFound, "Room does not exist");
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["action"], "error");
        assert_eq!(value["data"]["type"], "ROOM_NOT_FOUND");
        assert_eq!(value["data"]["message"], "Room does not exist");
    }

    #[test]
    fn test_error_kind_names() {
        for (kind, name) in [
            (ErrorKind::RoomNotFound, "ROOM_NOT_FOUND"),
            (ErrorKind::RoomFull, "ROOM_FULL"),
            (ErrorKind::PeerNotFound, "PEER_NOT_FOUND"),
            (ErrorKind::TransportError, "TRANSPORT_ERROR"),
            (ErrorKind::ProducerError, "PRODUCER_ERROR"),
            (ErrorKind::ConsumerError, "CONSUMER_ERROR"),
            (ErrorKind::InvalidData, "INVALID_DATA"),
            (ErrorKind::ServerError, "SERVER_ERROR"),
        ] {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(name.to_string())
            );
        }
    }

    #[test]
    fn test_connected_envelope_shape() {
        let msg = ServerMessage::Connected {
            peer_id: "peer-1".to_string(),
            name: "Fox-17".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["action"], "connected");
        assert_eq!(value["data"]["peerId"], "peer-1");
        assert_eq!(value["data"]["name"], "Fox-17");
    }

    #[test]
    fn test_joined_room_lists_existing_peers() {
        let msg = ServerMessage::JoinedRoom {
            peer: PeerSummary {
                id: "b".to_string(),
                name: "Panda-3".to_string(),
            },
            room_id: "room-1".to_string(),
            router_rtp_capabilities: RtpCapabilities::default(),
            existing_peers: vec![PeerSummary {
                id: "a".to_string(),
                name: "Fox-1".to_string(),
            }],
        };
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["action"], "joinedRoom");
        assert_eq!(value["data"]["existingPeers"][0]["id"], "a");
        assert_eq!(value["data"]["roomId"], "room-1");
    }

    #[test]
    fn test_transports_response_uses_original_action_name() {
        // The response reuses the request's action name, as clients expect.
        let json = serde_json::to_value(&ServerMessage::TransportConnected {
            transport_id: "t-1".to_string(),
        })
        .unwrap();
        assert_eq!(json["action"], "transportConnected");
        assert_eq!(json["data"]["transportId"], "t-1");
    }

    #[test]
    fn test_produce_roundtrip() {
        let original = ClientMessage::Produce {
            transport_id: "t-send".to_string(),
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters::default(),
        };
        let text = serde_json::to_string(&original).unwrap();
        let decoded: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(original, decoded);
    }
}
