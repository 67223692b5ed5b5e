//! Codec capability negotiation
//!
//! Builds the router's capability descriptor from the configured media codecs
//! and decides whether a producer's RTP parameters can be delivered to an
//! endpoint with a given set of capabilities.

use super::EngineError;
use confer_protocol::{
    CodecParameters, MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpParameters,
};
use serde_json::Value;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// First payload type handed out to codecs without a preferred one
const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;
const DYNAMIC_PAYLOAD_TYPE_END: u8 = 127;

/// Codecs registered on the router when none are configured
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut h264_parameters = CodecParameters::new();
    h264_parameters.insert("packetization-mode".to_string(), Value::from(1));
    h264_parameters.insert("profile-level-id".to_string(), Value::from("42e01f"));
    h264_parameters.insert("level-asymmetry-allowed".to_string(), Value::from(1));

    let mut vp8_parameters = CodecParameters::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: MIME_TYPE_OPUS.to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: CodecParameters::new(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: MIME_TYPE_VP8.to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
            rtcp_feedback: vec![],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: MIME_TYPE_H264.to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: h264_parameters,
            rtcp_feedback: vec![],
        },
    ]
}

/// Media kind implied by a MIME type such as `video/VP8`
pub fn codec_kind(mime_type: &str) -> Option<MediaKind> {
    let prefix = mime_type.split('/').next().unwrap_or_default().to_lowercase();
    match RTPCodecType::from(prefix.as_str()) {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

pub fn is_rtx(mime_type: &str) -> bool {
    mime_type.to_lowercase().ends_with("/rtx")
}

fn default_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind: Some(kind),
        uri: uri.to_string(),
        preferred_id,
        preferred_encrypt: false,
        direction: Some("sendrecv".to_string()),
    };

    vec![
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(
            MediaKind::Audio,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            MediaKind::Video,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
        ext(MediaKind::Video, "urn:3gpp:video-orientation", 11),
    ]
}

/// Build the router capability descriptor, assigning dynamic payload types
pub fn generate_router_rtp_capabilities(
    media_codecs: &[RtpCodecCapability],
) -> Result<RtpCapabilities, EngineError> {
    if media_codecs.is_empty() {
        return Err(EngineError::UnsupportedCodec(
            "router needs at least one media codec".to_string(),
        ));
    }

    let mut taken: Vec<u8> = media_codecs
        .iter()
        .filter_map(|c| c.preferred_payload_type)
        .collect();
    let mut next_dynamic = DYNAMIC_PAYLOAD_TYPE_START;
    let mut codecs = Vec::with_capacity(media_codecs.len());

    for codec in media_codecs {
        if is_rtx(&codec.mime_type) {
            return Err(EngineError::UnsupportedCodec(format!(
                "{} cannot be configured as a media codec",
                codec.mime_type
            )));
        }

        if codec_kind(&codec.mime_type) != Some(codec.kind) {
            return Err(EngineError::UnsupportedCodec(format!(
                "{} does not match kind {}",
                codec.mime_type, codec.kind
            )));
        }

        let payload_type = match codec.preferred_payload_type {
            Some(pt) => pt,
            None => {
                while taken.contains(&next_dynamic) {
                    if next_dynamic >= DYNAMIC_PAYLOAD_TYPE_END {
                        return Err(EngineError::UnsupportedCodec(
                            "ran out of dynamic payload types".to_string(),
                        ));
                    }
                    next_dynamic += 1;
                }
                taken.push(next_dynamic);
                next_dynamic
            }
        };

        let mut capability = codec.clone();
        capability.preferred_payload_type = Some(payload_type);
        if capability.rtcp_feedback.is_empty() {
            capability.rtcp_feedback = default_feedback(codec.kind);
        }
        codecs.push(capability);
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: default_header_extensions(),
    })
}

fn int_parameter(parameters: &CodecParameters, key: &str) -> i64 {
    match parameters.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Whether two codec descriptions denote the same codec
#[allow(clippy::too_many_arguments)]
pub fn codecs_match(
    mime_a: &str,
    clock_rate_a: u32,
    channels_a: Option<u8>,
    parameters_a: &CodecParameters,
    mime_b: &str,
    clock_rate_b: u32,
    channels_b: Option<u8>,
    parameters_b: &CodecParameters,
) -> bool {
    if !mime_a.eq_ignore_ascii_case(mime_b) || clock_rate_a != clock_rate_b {
        return false;
    }

    if codec_kind(mime_a) == Some(MediaKind::Audio)
        && channels_a.unwrap_or(1) != channels_b.unwrap_or(1)
    {
        return false;
    }

    let mime = mime_a.to_lowercase();
    if mime == "video/h264" {
        return int_parameter(parameters_a, "packetization-mode")
            == int_parameter(parameters_b, "packetization-mode");
    }
    if mime == "video/vp9" {
        return int_parameter(parameters_a, "profile-id")
            == int_parameter(parameters_b, "profile-id");
    }

    true
}

fn parameters_match_capability(codec: &RtpCodecParameters, cap: &RtpCodecCapability) -> bool {
    codecs_match(
        &codec.mime_type,
        codec.clock_rate,
        codec.channels,
        &codec.parameters,
        &cap.mime_type,
        cap.clock_rate,
        cap.channels,
        &cap.parameters,
    )
}

/// Check a producer's parameters against what the router supports
pub fn validate_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router_capabilities: &RtpCapabilities,
) -> Result<(), EngineError> {
    let media_codecs: Vec<&RtpCodecParameters> = rtp_parameters
        .codecs
        .iter()
        .filter(|c| !is_rtx(&c.mime_type))
        .collect();

    if media_codecs.is_empty() {
        return Err(EngineError::InvalidRtpParameters(
            "no media codecs given".to_string(),
        ));
    }

    for codec in media_codecs {
        if codec_kind(&codec.mime_type) != Some(kind) {
            return Err(EngineError::InvalidRtpParameters(format!(
                "{} is not a {} codec",
                codec.mime_type, kind
            )));
        }

        let supported = router_capabilities
            .codecs
            .iter()
            .any(|cap| cap.kind == kind && parameters_match_capability(codec, cap));
        if !supported {
            return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
        }
    }

    Ok(())
}

/// Whether at least one media codec of the producer is acceptable to `capabilities`
pub fn can_consume(producer_parameters: &RtpParameters, capabilities: &RtpCapabilities) -> bool {
    producer_parameters
        .codecs
        .iter()
        .filter(|c| !is_rtx(&c.mime_type))
        .any(|codec| {
            capabilities
                .codecs
                .iter()
                .any(|cap| parameters_match_capability(codec, cap))
        })
}

/// RTP parameters a consumer will receive for the given producer
pub fn consumer_rtp_parameters(
    producer_parameters: &RtpParameters,
    router_capabilities: &RtpCapabilities,
    capabilities: &RtpCapabilities,
    ssrc: u32,
) -> Result<RtpParameters, EngineError> {
    let mut codecs = Vec::new();

    for codec in producer_parameters
        .codecs
        .iter()
        .filter(|c| !is_rtx(&c.mime_type))
    {
        let Some(remote) = capabilities
            .codecs
            .iter()
            .find(|cap| parameters_match_capability(codec, cap))
        else {
            continue;
        };

        let payload_type = router_capabilities
            .codecs
            .iter()
            .find(|cap| parameters_match_capability(codec, cap))
            .and_then(|cap| cap.preferred_payload_type)
            .unwrap_or(codec.payload_type);

        codecs.push(RtpCodecParameters {
            mime_type: codec.mime_type.clone(),
            payload_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: codec.parameters.clone(),
            rtcp_feedback: remote.rtcp_feedback.clone(),
        });
    }

    if codecs.is_empty() {
        return Err(EngineError::InvalidRtpParameters(
            "no compatible media codecs".to_string(),
        ));
    }

    let header_extensions = producer_parameters
        .header_extensions
        .iter()
        .filter(|ext| {
            capabilities
                .header_extensions
                .iter()
                .any(|cap| cap.uri == ext.uri)
        })
        .cloned()
        .collect();

    Ok(RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..Default::default()
        }],
        rtcp: producer_parameters.rtcp.clone(),
    })
}
