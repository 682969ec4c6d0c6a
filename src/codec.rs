//! Codecs and RTP header extensions offered to clients.

use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9},
        APIBuilder, API,
    },
    interceptor::registry::Registry,
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType},
        RTCPFeedback,
    },
};

use crate::error::{Error, FatalErrorKind};

pub const MIME_TYPE_RED: &str = "audio/red";
pub const MIME_TYPE_RTX: &str = "video/rtx";

pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const SDES_MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const SDES_RTP_STREAM_ID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
pub const SDES_REPAIRED_RTP_STREAM_ID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id";
pub const PLAYOUT_DELAY_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

const VIDEO_CLOCK_RATE: u32 = 90000;
const AUDIO_CLOCK_RATE: u32 = 48000;

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

fn video(mime_type: &str, fmtp: &str, payload_type: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: fmtp.to_owned(),
            rtcp_feedback: video_rtcp_feedback(),
        },
        payload_type,
        ..Default::default()
    }
}

fn rtx(apt: u8, payload_type: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_RTX.to_owned(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: format!("apt={}", apt),
            rtcp_feedback: vec![],
        },
        payload_type,
        ..Default::default()
    }
}

fn h264(packetization_mode: u8, profile_level_id: &str, payload_type: u8) -> RTCRtpCodecParameters {
    video(
        MIME_TYPE_H264,
        &format!(
            "level-asymmetry-allowed=1;packetization-mode={};profile-level-id={}",
            packetization_mode, profile_level_id
        ),
        payload_type,
    )
}

/// Video codecs in order of preference, each followed by its RTX pairing.
pub fn video_codecs() -> Vec<(RTCRtpCodecParameters, RTCRtpCodecParameters)> {
    vec![
        (video(MIME_TYPE_VP8, "", 96), rtx(96, 97)),
        (h264(1, "42001f", 102), rtx(102, 103)),
        (h264(0, "42001f", 104), rtx(104, 105)),
        (h264(1, "42e01f", 106), rtx(106, 107)),
        (h264(0, "42e01f", 108), rtx(108, 109)),
        (h264(1, "4d001f", 127), rtx(127, 125)),
        (h264(0, "4d001f", 39), rtx(39, 40)),
        (video(MIME_TYPE_VP9, "profile-id=0", 98), rtx(98, 99)),
        (video(MIME_TYPE_VP9, "profile-id=2", 100), rtx(100, 101)),
        (h264(1, "64001f", 112), rtx(112, 113)),
    ]
}

pub fn audio_codecs() -> Vec<RTCRtpCodecParameters> {
    let audio = |mime_type: &str, fmtp: &str, payload_type: u8| RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate: AUDIO_CLOCK_RATE,
            channels: 2,
            sdp_fmtp_line: fmtp.to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type,
        ..Default::default()
    };
    vec![
        audio(MIME_TYPE_RED, "111/111", 63),
        audio(MIME_TYPE_OPUS, "minptime=10;useinbandfec=1", 111),
    ]
}

/// Codec parameters for `mime_type`, the first table entry wins.
pub fn codec_parameters(mime_type: &str) -> Option<RTCRtpCodecParameters> {
    audio_codecs()
        .into_iter()
        .chain(video_codecs().into_iter().map(|(codec, _)| codec))
        .find(|codec| codec.capability.mime_type.eq_ignore_ascii_case(mime_type))
}

fn enabled(codecs: &[String], mime_type: &str) -> bool {
    codecs.iter().any(|codec| codec.eq_ignore_ascii_case(mime_type))
}

/// Registers the enabled codecs, their RTX pairings and the header extensions the forwarding core reads.
pub fn register_codecs(media_engine: &mut MediaEngine, codecs: &[String]) -> Result<(), Error> {
    let mut failures = Vec::new();

    for codec in audio_codecs() {
        if enabled(codecs, &codec.capability.mime_type) {
            let mime_type = codec.capability.mime_type.clone();
            if let Err(err) = media_engine.register_codec(codec, RTPCodecType::Audio) {
                failures.push(format!("{}: {}", mime_type, err));
            }
        }
    }

    for (codec, rtx) in video_codecs() {
        if !enabled(codecs, &codec.capability.mime_type) {
            continue;
        }
        let payload_type = codec.payload_type;
        if let Err(err) = media_engine.register_codec(codec, RTPCodecType::Video) {
            failures.push(format!("video {}: {}", payload_type, err));
            continue;
        }
        if let Err(err) = media_engine.register_codec(rtx, RTPCodecType::Video) {
            failures.push(format!("rtx for {}: {}", payload_type, err));
        }
    }

    let extensions = [
        (AUDIO_LEVEL_URI, RTPCodecType::Audio),
        (SDES_MID_URI, RTPCodecType::Audio),
        (SDES_MID_URI, RTPCodecType::Video),
        (SDES_RTP_STREAM_ID_URI, RTPCodecType::Video),
        (SDES_REPAIRED_RTP_STREAM_ID_URI, RTPCodecType::Video),
        (PLAYOUT_DELAY_URI, RTPCodecType::Video),
    ];
    for (uri, typ) in extensions {
        if let Err(err) = media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability { uri: uri.to_owned() },
            typ,
            None,
        ) {
            failures.push(format!("{}: {}", uri, err));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::new_fatal(
            format!("failed to register codecs: {}", failures.join(", ")),
            FatalErrorKind::CodecRegistration,
        ))
    }
}

/// Builds the webrtc-rs API object every peer connection of a room is created from.
pub fn build_api(codecs: &[String]) -> Result<API, Error> {
    let mut media_engine = MediaEngine::default();
    register_codecs(&mut media_engine, codecs)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(|err| {
        Error::new_fatal(
            format!("failed to register interceptors: {}", err),
            FatalErrorKind::CodecRegistration,
        )
    })?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;

    #[test]
    fn every_video_codec_has_matching_rtx() {
        for (codec, rtx) in video_codecs() {
            assert_eq!(rtx.capability.sdp_fmtp_line, format!("apt={}", codec.payload_type));
            assert_eq!(codec.capability.rtcp_feedback.len(), 4);
        }
        let h264 = video_codecs()
            .into_iter()
            .filter(|(codec, _)| codec.capability.mime_type == MIME_TYPE_H264)
            .count();
        assert_eq!(h264, 7);
    }

    #[test]
    fn parameters_are_looked_up_case_insensitively() {
        let red = codec_parameters("AUDIO/RED").expect("red");
        assert_eq!(red.payload_type, 63);
        let vp9 = codec_parameters(MIME_TYPE_VP9).expect("vp9");
        assert_eq!(vp9.payload_type, 98);
        assert!(codec_parameters("video/AV1").is_none());
    }

    #[test]
    fn default_codecs_register() {
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine, &RoomConfig::default().codecs).expect("register");
    }

    #[test]
    fn api_builds_with_only_opus() {
        assert!(build_api(&[MIME_TYPE_OPUS.to_owned()]).is_ok());
    }
}
