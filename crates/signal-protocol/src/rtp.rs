//! RTP, ICE and DTLS descriptor types.
//!
//! These mirror the structures the relay engine hands out during transport
//! negotiation. Codec `parameters` and `encodings` are carried as loosely
//! typed JSON: the broker routes them between peers and only inspects the
//! fields it needs (kind, mime type, payload type).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Media kind of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as the lowercase string used in mime types.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// An RTCP feedback mechanism supported by a codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// A codec a router or receiving peer is able to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

/// The set of codecs and header extensions a receiver can decode.
///
/// Exchanged once per peer via `sendRtpCapabilities` and consulted on every
/// consume decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// True if any codec in these capabilities matches the given mime type
    /// (case-insensitive).
    #[must_use]
    pub fn supports_mime_type(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// A negotiated codec inside [`RtpParameters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Negotiated send/receive parameters for one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

/// ICE parameters advertised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// A single ICE candidate advertised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

/// DTLS role for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// A certificate fingerprint used during the DTLS handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters for one side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything a client needs to establish one transport: the transport id
/// plus the ICE and DTLS material the engine allocated for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
    }

    #[test]
    fn test_capabilities_support_lookup_is_case_insensitive() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: vec![],
                preferred_payload_type: None,
            }],
            header_extensions: vec![],
        };

        assert!(caps.supports_mime_type("video/vp8"));
        assert!(caps.supports_mime_type("VIDEO/VP8"));
        assert!(!caps.supports_mime_type("video/h264"));
    }

    #[test]
    fn test_transport_descriptor_wire_shape() {
        let descriptor = TransportDescriptor {
            id: "t-1".to_string(),
            ice_parameters: IceParameters {
                username_fragment: "ufrag".to_string(),
                password: "pwd".to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: "127.0.0.1".to_string(),
                protocol: "udp".to_string(),
                port: 40_001,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "AB:CD".to_string(),
                }],
            },
        };

        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["iceParameters"]["usernameFragment"], "ufrag");
        assert_eq!(value["iceCandidates"][0]["type"], "host");
        assert_eq!(value["dtlsParameters"]["role"], "auto");
    }

    #[test]
    fn test_rtp_parameters_roundtrip_preserves_opaque_fields() {
        let raw = serde_json::json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 96,
                "clockRate": 90000,
                "parameters": {"x-google-start-bitrate": 1000},
                "rtcpFeedback": [{"type": "nack"}, {"type": "nack", "parameter": "pli"}]
            }],
            "encodings": [{"ssrc": 1111, "maxBitrate": 500000}]
        });

        let parsed: RtpParameters = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.mid.as_deref(), Some("0"));
        assert_eq!(parsed.codecs.len(), 1);
        assert_eq!(parsed.encodings.len(), 1);

        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["codecs"][0]["payloadType"], 96);
        assert_eq!(back["encodings"][0]["ssrc"], 1111);
    }
}
