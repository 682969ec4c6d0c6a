use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};

use crate::codec::MIME_TYPE_RED;

/// Top level configuration shared by every room created from a [`crate::hub::Hub`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub session: SessionConfig,
    pub bitrates: BitrateConfig,
    pub room: RoomConfig,
}

/// Per-subscriber options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Permits incremental candidate exchange.
    pub ice_trickle: bool,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    pub enable_voice_detection: bool,
    /// Milliseconds.
    pub min_playout_delay: u16,
    /// Milliseconds.
    pub max_playout_delay: u16,
    #[serde(with = "duration_ms")]
    pub jitter_buffer_min_wait: Duration,
    #[serde(with = "duration_ms")]
    pub jitter_buffer_max_wait: Duration,
    pub reorder_packets: bool,
    /// Negotiated id of the playout-delay extension written on outbound video, if any.
    pub playout_delay_extension_id: Option<u8>,
    /// Levels the allocator is allowed to assign to video forwarders.
    pub quality_levels: Vec<QualityLevel>,
    pub vad: VadConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_trickle: true,
            idle_timeout: Duration::from_secs(5 * 60),
            enable_voice_detection: true,
            min_playout_delay: 100,
            max_playout_delay: 200,
            jitter_buffer_min_wait: Duration::from_millis(20),
            jitter_buffer_max_wait: Duration::from_millis(150),
            reorder_packets: false,
            playout_delay_extension_id: None,
            quality_levels: vec![QualityLevel::Low, QualityLevel::Mid, QualityLevel::High],
            vad: VadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    #[serde(with = "duration_ms")]
    pub head_margin: Duration,
    #[serde(with = "duration_ms")]
    pub tail_margin: Duration,
    /// RFC 6464 level in -dBov, lower is louder.
    pub threshold: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            head_margin: Duration::from_millis(200),
            tail_margin: Duration::from_millis(300),
            threshold: 40,
        }
    }
}

/// Initial per-layer bitrate guesses used until the receive side measures the real value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    pub audio_red: u32,
    pub audio: u32,
    pub video_high: u32,
    pub video_high_pixels: u32,
    pub video_mid: u32,
    pub video_mid_pixels: u32,
    pub video_low: u32,
    pub video_low_pixels: u32,
    pub initial_bandwidth: u64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            audio_red: 75_000,
            audio: 48_000,
            video_high: 700_000,
            video_high_pixels: 720 * 360,
            video_mid: 300_000,
            video_mid_pixels: 360 * 180,
            video_low: 90_000,
            video_low_pixels: 180 * 90,
            initial_bandwidth: 1_000_000,
        }
    }
}

impl BitrateConfig {
    pub fn for_quality(&self, quality: QualityLevel) -> u32 {
        match quality {
            QualityLevel::None => 0,
            QualityLevel::Low => self.video_low,
            QualityLevel::Mid => self.video_mid,
            QualityLevel::High => self.video_high,
            QualityLevel::Audio => self.audio,
            QualityLevel::AudioRed => self.audio_red,
        }
    }

    /// Maps a rendered video size to the highest quality worth sending for it.
    pub fn quality_for_size(&self, width: u32, height: u32) -> QualityLevel {
        let pixels = width.saturating_mul(height);
        if pixels == 0 {
            QualityLevel::None
        } else if pixels >= self.video_high_pixels {
            QualityLevel::High
        } else if pixels >= self.video_mid_pixels {
            QualityLevel::Mid
        } else {
            QualityLevel::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    #[serde(with = "duration_ms")]
    pub empty_room_timeout: Duration,
    /// Zero disables periodic PLI.
    #[serde(with = "duration_ms")]
    pub pli_interval: Duration,
    /// Enabled MIME types, matched case-insensitively against the codec table.
    pub codecs: Vec<String>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            empty_room_timeout: Duration::from_secs(3 * 60),
            pli_interval: Duration::ZERO,
            codecs: vec![
                MIME_TYPE_VP9.to_owned(),
                MIME_TYPE_H264.to_owned(),
                MIME_TYPE_VP8.to_owned(),
                MIME_TYPE_RED.to_owned(),
                MIME_TYPE_OPUS.to_owned(),
            ],
        }
    }
}

/// Quality a forwarder sends to its subscriber.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QualityLevel {
    None = 0,
    Low = 1,
    Mid = 2,
    High = 3,
    Audio = 10,
    AudioRed = 11,
}

impl QualityLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => QualityLevel::Low,
            2 => QualityLevel::Mid,
            3 => QualityLevel::High,
            10 => QualityLevel::Audio,
            11 => QualityLevel::AudioRed,
            _ => QualityLevel::None,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, QualityLevel::Audio | QualityLevel::AudioRed)
    }

    /// Simulcast layer carrying this quality. Audio rides on the single default layer.
    pub fn rid(&self) -> Option<Rid> {
        match self {
            QualityLevel::None => None,
            QualityLevel::Low => Some(Rid::Low),
            QualityLevel::Mid => Some(Rid::Mid),
            QualityLevel::High | QualityLevel::Audio | QualityLevel::AudioRed => Some(Rid::High),
        }
    }
}

/// RTP stream identifier of a simulcast layer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum Rid {
    #[strum(serialize = "q")]
    #[serde(rename = "q")]
    Low,
    #[strum(serialize = "h")]
    #[serde(rename = "h")]
    Mid,
    #[strum(serialize = "f")]
    #[serde(rename = "f")]
    High,
}

impl Rid {
    /// Parses a RID as carried in SDP. Streams without a RID are treated as the full layer.
    pub fn from_rid(rid: &str) -> Rid {
        rid.parse().unwrap_or(Rid::High)
    }

    pub fn quality(&self) -> QualityLevel {
        match self {
            Rid::Low => QualityLevel::Low,
            Rid::Mid => QualityLevel::Mid,
            Rid::High => QualityLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_mime_type(mime_type: &str) -> MediaKind {
        if mime_type.to_lowercase().starts_with("video") {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Media,
    Screen,
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
