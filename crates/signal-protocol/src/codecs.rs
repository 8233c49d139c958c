//! Router codec presets.
//!
//! Rooms are created against one of three codec profiles. `minimal` keeps
//! negotiation cheap for constrained deployments, `balanced` is the
//! production default, and `full` enables every codec the relay understands,
//! including ones with limited browser support.

use crate::rtp::{MediaKind, RtcpFeedback, RtpCodecCapability};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

/// Which codec table a room's router is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecProfile {
    Minimal,
    #[default]
    Balanced,
    Full,
}

/// Error for unrecognized profile names.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown codec profile: {0}")]
pub struct UnknownProfile(pub String);

impl FromStr for CodecProfile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(CodecProfile::Minimal),
            "balanced" | "production" => Ok(CodecProfile::Balanced),
            "full" | "maximum" => Ok(CodecProfile::Full),
            other => Err(UnknownProfile(other.to_string())),
        }
    }
}

impl CodecProfile {
    /// The codec table for this profile.
    #[must_use]
    pub fn codecs(self) -> Vec<RtpCodecCapability> {
        match self {
            CodecProfile::Minimal => minimal(),
            CodecProfile::Balanced => balanced(),
            CodecProfile::Full => full(),
        }
    }
}

/// Validation failures for a codec table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecConfigError {
    #[error("codec table is empty")]
    Empty,
    #[error("codec {0}: mime type does not match its media kind")]
    MimeKindMismatch(String),
    #[error("codec {0}: clock rate must be non-zero")]
    ZeroClockRate(String),
    #[error("codec {0}: audio channel count must be at least 1")]
    InvalidChannels(String),
    #[error("duplicate preferred payload type {0}")]
    DuplicatePayloadType(u8),
    #[error("preferred payload type {0} outside the dynamic range 0..=127")]
    PayloadTypeOutOfRange(u8),
}

/// Check a codec table before handing it to the engine: mime types must
/// match their kind, clock rates must be non-zero, audio channel counts at
/// least 1, and preferred payload types unique and within 0..=127.
pub fn validate(codecs: &[RtpCodecCapability]) -> Result<(), CodecConfigError> {
    if codecs.is_empty() {
        return Err(CodecConfigError::Empty);
    }

    let mut payload_types: HashSet<u8> = HashSet::new();

    for codec in codecs {
        let prefix = codec.kind.as_str();
        if !codec
            .mime_type
            .to_ascii_lowercase()
            .starts_with(&format!("{prefix}/"))
        {
            return Err(CodecConfigError::MimeKindMismatch(codec.mime_type.clone()));
        }

        if codec.clock_rate == 0 {
            return Err(CodecConfigError::ZeroClockRate(codec.mime_type.clone()));
        }

        if codec.kind == MediaKind::Audio && codec.channels == Some(0) {
            return Err(CodecConfigError::InvalidChannels(codec.mime_type.clone()));
        }

        if let Some(pt) = codec.preferred_payload_type {
            if pt > 127 {
                return Err(CodecConfigError::PayloadTypeOutOfRange(pt));
            }
            if !payload_types.insert(pt) {
                return Err(CodecConfigError::DuplicatePayloadType(pt));
            }
        }
    }

    Ok(())
}

fn parameters(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn feedback(entries: &[(&str, Option<&str>)]) -> Vec<RtcpFeedback> {
    entries
        .iter()
        .map(|(kind, parameter)| RtcpFeedback {
            kind: (*kind).to_string(),
            parameter: parameter.map(ToString::to_string),
        })
        .collect()
}

/// The feedback set shared by every video codec.
fn video_feedback() -> Vec<RtcpFeedback> {
    feedback(&[
        ("nack", None),
        ("nack", Some("pli")),
        ("ccm", Some("fir")),
        ("goog-remb", None),
        ("transport-cc", None),
    ])
}

fn opus() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Audio,
        mime_type: "audio/opus".to_string(),
        clock_rate: 48_000,
        channels: Some(2),
        parameters: parameters(&[("useinbandfec", Value::from(1)), ("usedtx", Value::from(1))]),
        rtcp_feedback: feedback(&[("transport-cc", None)]),
        preferred_payload_type: None,
    }
}

fn vp8() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/VP8".to_string(),
        clock_rate: 90_000,
        channels: None,
        parameters: Map::new(),
        rtcp_feedback: video_feedback(),
        preferred_payload_type: None,
    }
}

fn vp9(profile_id: u32) -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/VP9".to_string(),
        clock_rate: 90_000,
        channels: None,
        parameters: parameters(&[("profile-id", Value::from(profile_id))]),
        rtcp_feedback: video_feedback(),
        preferred_payload_type: None,
    }
}

fn h264(profile_level_id: &str) -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/H264".to_string(),
        clock_rate: 90_000,
        channels: None,
        parameters: parameters(&[
            ("packetization-mode", Value::from(1)),
            ("profile-level-id", Value::from(profile_level_id)),
            ("level-asymmetry-allowed", Value::from(1)),
        ]),
        rtcp_feedback: video_feedback(),
        preferred_payload_type: None,
    }
}

fn narrowband_audio(mime_type: &str, payload_type: u8) -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Audio,
        mime_type: mime_type.to_string(),
        clock_rate: 8_000,
        channels: Some(1),
        parameters: Map::new(),
        rtcp_feedback: vec![],
        preferred_payload_type: Some(payload_type),
    }
}

/// Opus plus VP8 only.
#[must_use]
pub fn minimal() -> Vec<RtpCodecCapability> {
    vec![opus(), vp8()]
}

/// The production default: opus, VP9, VP8 and baseline H.264.
#[must_use]
pub fn balanced() -> Vec<RtpCodecCapability> {
    vec![opus(), vp9(0), vp8(), h264("42e01f")]
}

/// Every codec the relay understands, for maximum compatibility.
#[must_use]
pub fn full() -> Vec<RtpCodecCapability> {
    let mut opus_full = opus();
    opus_full.parameters = parameters(&[
        ("sprop-stereo", Value::from(1)),
        ("stereo", Value::from(1)),
        ("useinbandfec", Value::from(1)),
        ("usedtx", Value::from(1)),
    ]);
    opus_full.preferred_payload_type = Some(111);

    let mut vp9_0 = vp9(0);
    vp9_0.preferred_payload_type = Some(101);
    let mut vp9_1 = vp9(1);
    vp9_1.preferred_payload_type = Some(102);
    let mut vp8_full = vp8();
    vp8_full.preferred_payload_type = Some(96);

    let mut h264_baseline = h264("42001f");
    h264_baseline.preferred_payload_type = Some(103);
    let mut h264_cbaseline = h264("42e01f");
    h264_cbaseline.preferred_payload_type = Some(104);
    let mut h264_main = h264("4d001f");
    h264_main.preferred_payload_type = Some(105);
    let mut h264_high = h264("640032");
    h264_high.preferred_payload_type = Some(106);

    let h265 = RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/H265".to_string(),
        clock_rate: 90_000,
        channels: None,
        parameters: parameters(&[
            ("profile-id", Value::from(1)),
            ("tier-flag", Value::from(0)),
            ("level-id", Value::from(120)),
            ("tx-mode", Value::from("SRST")),
            ("max-recv-level-id", Value::from(120)),
            ("max-recv-temporal-id", Value::from(0)),
        ]),
        rtcp_feedback: video_feedback(),
        preferred_payload_type: Some(107),
    };

    let av1 = RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/AV1".to_string(),
        clock_rate: 90_000,
        channels: None,
        parameters: Map::new(),
        rtcp_feedback: video_feedback(),
        preferred_payload_type: Some(108),
    };

    vec![
        opus_full,
        narrowband_audio("audio/PCMU", 0),
        narrowband_audio("audio/PCMA", 8),
        narrowband_audio("audio/G722", 9),
        narrowband_audio("audio/CN", 13),
        vp9_0,
        vp9_1,
        vp8_full,
        h264_baseline,
        h264_cbaseline,
        h264_main,
        h264_high,
        h265,
        av1,
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_validate() {
        validate(&minimal()).unwrap();
        validate(&balanced()).unwrap();
        validate(&full()).unwrap();
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("minimal".parse::<CodecProfile>().unwrap(), CodecProfile::Minimal);
        assert_eq!("BALANCED".parse::<CodecProfile>().unwrap(), CodecProfile::Balanced);
        assert_eq!("production".parse::<CodecProfile>().unwrap(), CodecProfile::Balanced);
        assert_eq!("maximum".parse::<CodecProfile>().unwrap(), CodecProfile::Full);
        assert!("h264-only".parse::<CodecProfile>().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_table() {
        assert_eq!(validate(&[]), Err(CodecConfigError::Empty));
    }

    #[test]
    fn test_validate_rejects_duplicate_payload_types() {
        let mut codecs = vec![opus(), vp8()];
        for codec in &mut codecs {
            codec.preferred_payload_type = Some(100);
        }
        assert_eq!(
            validate(&codecs),
            Err(CodecConfigError::DuplicatePayloadType(100))
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_payload_type() {
        let mut codec = vp8();
        codec.preferred_payload_type = Some(200);
        assert_eq!(
            validate(&[codec]),
            Err(CodecConfigError::PayloadTypeOutOfRange(200))
        );
    }

    #[test]
    fn test_validate_rejects_kind_mismatch() {
        let mut codec = vp8();
        codec.mime_type = "audio/VP8".to_string();
        assert!(matches!(
            validate(&[codec]),
            Err(CodecConfigError::MimeKindMismatch(_))
        ));
    }

    #[test]
    fn test_full_preset_is_superset_of_balanced() {
        let full_mimes: Vec<String> = full().iter().map(|c| c.mime_type.clone()).collect();
        for codec in balanced() {
            assert!(
                full_mimes.contains(&codec.mime_type),
                "full preset missing {}",
                codec.mime_type
            );
        }
    }
}
