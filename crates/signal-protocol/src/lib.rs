//! Signaling wire protocol for Huddlecast.
//!
//! This crate defines the JSON envelope exchanged between clients and the
//! session broker over a persistent WebSocket connection, plus the RTP/ICE/
//! DTLS descriptor types carried inside it. Every envelope has the shape
//! `{"action": <string>, "data": <object>}`; the enums in [`messages`] are
//! adjacently tagged so that shape falls out of serde directly and unknown
//! actions fail to decode instead of reaching a handler.

#![warn(clippy::pedantic)]

pub mod codecs;
pub mod messages;
pub mod rtp;

pub use messages::{ClientMessage, ErrorKind, PeerSummary, ServerMessage};
pub use rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    TransportDescriptor,
};
