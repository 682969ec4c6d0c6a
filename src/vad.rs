//! Voice activity detection from RFC 6464 audio levels.
//!
//! One [`VoiceDetector`] runs per published audio SSRC. It emits [`VoiceEvent::Started`] once the
//! publisher has been talking for the head margin, ships buffered [`VoicePacketData`] every
//! interval while speaking, and closes each speaking interval with an empty batch followed by
//! [`VoiceEvent::Ended`].

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::header::Header;

use crate::config::VadConfig;

const INPUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePacketData {
    pub sequence_no: u16,
    pub timestamp: u32,
    pub audio_level: u8,
    pub is_voice: bool,
}

/// Speaking batch delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceActivity {
    #[serde(rename = "trackID")]
    pub track_id: String,
    #[serde(rename = "streamID")]
    pub stream_id: String,
    pub ssrc: u32,
    #[serde(rename = "clockRate")]
    pub clock_rate: u32,
    #[serde(rename = "audioLevels")]
    pub audio_levels: Vec<VoicePacketData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Started { ssrc: u32 },
    /// An empty batch marks the end of a speaking interval.
    Batch { ssrc: u32, packets: Vec<VoicePacketData> },
    Ended { ssrc: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoiceState {
    Silent,
    Speaking,
}

#[derive(Debug)]
pub struct VoiceDetector {
    pub ssrc: u32,
    input: broadcast::Sender<VoicePacketData>,
    cancel: CancellationToken,
}

impl VoiceDetector {
    pub fn new(
        ssrc: u32,
        config: VadConfig,
        events: mpsc::UnboundedSender<VoiceEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (input, receiver) = broadcast::channel(INPUT_CAPACITY);
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                Self::run(ssrc, config, receiver, events, cancel).await;
            });
        }
        tracing::debug!("VoiceDetector ssrc={} is created", ssrc);
        Self {
            ssrc,
            input,
            cancel,
        }
    }

    /// Queues one packet's level. When the queue is full the oldest entry is dropped.
    pub fn add_packet(&self, header: &Header, audio_level: u8, is_voice: bool) {
        let _ = self.input.send(VoicePacketData {
            sequence_no: header.sequence_number,
            timestamp: header.timestamp,
            audio_level,
            is_voice,
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(
        ssrc: u32,
        config: VadConfig,
        mut receiver: broadcast::Receiver<VoicePacketData>,
        events: mpsc::UnboundedSender<VoiceEvent>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(config.interval);
        let mut state = VoiceState::Silent;
        let mut buffer: Vec<VoicePacketData> = Vec::new();
        let mut head_started: Option<Instant> = None;
        let mut last_voice: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = receiver.recv() => {
                    let packet = match res {
                        Ok(packet) => packet,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("VoiceDetector ssrc={} dropped {} packets", ssrc, skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if packet.audio_level >= config.threshold || !packet.is_voice {
                        continue;
                    }
                    let now = Instant::now();
                    if state == VoiceState::Silent {
                        let stale = last_voice
                            .map(|last| now.duration_since(last) > config.tail_margin)
                            .unwrap_or(true);
                        if stale {
                            buffer.clear();
                            head_started = Some(now);
                        }
                    }
                    buffer.push(packet);
                    last_voice = Some(now);

                    if state == VoiceState::Silent {
                        let head = head_started.get_or_insert(now);
                        if now.duration_since(*head) >= config.head_margin {
                            state = VoiceState::Speaking;
                            tracing::debug!("VoiceDetector ssrc={} started", ssrc);
                            if events.send(VoiceEvent::Started { ssrc }).is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    if state != VoiceState::Speaking {
                        continue;
                    }
                    if !buffer.is_empty() {
                        let packets = std::mem::take(&mut buffer);
                        if events.send(VoiceEvent::Batch { ssrc, packets }).is_err() {
                            break;
                        }
                    }
                    let silent_for = last_voice.map(|last| Instant::now().duration_since(last));
                    if silent_for.map_or(true, |d| d >= config.tail_margin) {
                        state = VoiceState::Silent;
                        head_started = None;
                        tracing::debug!("VoiceDetector ssrc={} ended", ssrc);
                        let _ = events.send(VoiceEvent::Batch { ssrc, packets: Vec::new() });
                        if events.send(VoiceEvent::Ended { ssrc }).is_err() {
                            break;
                        }
                    }
                }
            }
        }

        if state == VoiceState::Speaking {
            let _ = events.send(VoiceEvent::Batch {
                ssrc,
                packets: Vec::new(),
            });
            let _ = events.send(VoiceEvent::Ended { ssrc });
        }
        tracing::debug!("VoiceDetector ssrc={} has stopped", ssrc);
    }
}

impl Drop for VoiceDetector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
