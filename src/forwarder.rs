use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;

use bytes::Bytes;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp::packet::Packet;

use crate::{
    config::{MediaKind, QualityLevel, Rid},
    published_track::PublishedTrack,
    rtp::{
        self,
        bitrate::BitrateMeter,
        keyframe::{keyframe_detector, KeyframeFn},
        pool::PooledPacket,
    },
    session::{ActivityClock, SessionEvent},
    transport::RtpSink,
};

/// Writes failing for this long with no success in between break the forwarder.
const BROKEN_AFTER: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_WRITE_FAILURES: u32 = 5;
const DEFAULT_VIDEO_FPS: u32 = 30;
const DEFAULT_AUDIO_PACKETS_PER_SECOND: u32 = 50;

/// Snapshot of one forwarder, as reported to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderStats {
    pub id: String,
    pub track_id: String,
    pub kind: MediaKind,
    pub quality: QualityLevel,
    pub target_quality: QualityLevel,
    pub max_quality: QualityLevel,
    pub send_bitrate: u32,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub write_failures: u64,
}

/// Sequence and timestamp rewrite state of the outbound stream.
#[derive(Debug)]
struct RewriteState {
    active: Option<Rid>,
    started: bool,
    seq_offset: u16,
    ts_offset: u32,
    last_out_seq: u16,
    last_out_ts: u32,
    last_in_ts: Option<u32>,
    tick: u32,
    max_tick: u32,
}

impl RewriteState {
    fn new(tick: u32, max_tick: u32) -> Self {
        Self {
            active: None,
            started: false,
            seq_offset: 0,
            ts_offset: 0,
            last_out_seq: 0,
            last_out_ts: 0,
            last_in_ts: None,
            tick,
            max_tick,
        }
    }

    /// Makes `(seq, ts)` the successor of the last emitted packet.
    fn commit(&mut self, layer: Rid, seq: u16, ts: u32) {
        if self.started {
            self.seq_offset = self.last_out_seq.wrapping_add(1).wrapping_sub(seq);
            self.ts_offset = self
                .last_out_ts
                .wrapping_add(self.tick)
                .wrapping_sub(ts);
        } else {
            self.seq_offset = 0;
            self.ts_offset = 0;
        }
        self.active = Some(layer);
        self.last_in_ts = None;
    }

    /// Rewrites one packet, or returns `None` when it would not advance the outbound sequence.
    fn rewrite(&mut self, seq: u16, ts: u32) -> Option<(u16, u32)> {
        let out_seq = seq.wrapping_add(self.seq_offset);
        let out_ts = ts.wrapping_add(self.ts_offset);
        if self.started && !rtp::seq_newer(out_seq, self.last_out_seq) {
            return None;
        }

        if let Some(prev) = self.last_in_ts {
            let delta = ts.wrapping_sub(prev);
            if delta > 0 && delta <= self.max_tick {
                self.tick = delta;
            }
        }
        self.last_in_ts = Some(ts);

        let out_ts = if self.started && out_ts.wrapping_sub(self.last_out_ts) >= 0x8000_0000 {
            self.last_out_ts
        } else {
            out_ts
        };
        self.started = true;
        self.last_out_seq = out_seq;
        self.last_out_ts = out_ts;
        Some((out_seq, out_ts))
    }

    /// Maps an outbound sequence number back to the active layer's numbering.
    fn inbound_seq(&self, out_seq: u16) -> u16 {
        out_seq.wrapping_sub(self.seq_offset)
    }
}

/// Forwards one published track to one subscriber, choosing the layer and rewriting sequence space.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ClientTrackForwarder {
    pub id: String,
    pub subscriber_id: String,
    pub track: Arc<PublishedTrack>,
    sink: Arc<dyn RtpSink>,
    #[derivative(Debug = "ignore")]
    keyframe: Option<KeyframeFn>,
    current: AtomicU8,
    target: AtomicU8,
    max: AtomicU8,
    paused: AtomicBool,
    closed: AtomicBool,
    sink_closed: AtomicBool,
    /// Never held across an await.
    rewrite: Mutex<RewriteState>,
    /// Reused outbound packet. Holding it orders writes to the sink.
    outbound: tokio::sync::Mutex<Packet>,
    playout_delay: Option<(u8, Bytes)>,
    send_bitrate: BitrateMeter,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    write_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    created_at: Instant,
    last_success_ms: AtomicU64,
    activity: Arc<ActivityClock>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientTrackForwarder {
    pub fn new(
        subscriber_id: String,
        track: Arc<PublishedTrack>,
        sink: Arc<dyn RtpSink>,
        activity: Arc<ActivityClock>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let id = format!("{}:{}", subscriber_id, track.id);
        let clock_rate = track.clock_rate().max(1);
        let (tick, max_quality) = match track.kind {
            MediaKind::Audio => (clock_rate / DEFAULT_AUDIO_PACKETS_PER_SECOND, QualityLevel::Audio),
            MediaKind::Video => (clock_rate / DEFAULT_VIDEO_FPS, QualityLevel::High),
        };
        tracing::debug!(
            "ClientTrackForwarder id={} track_id={} ssrc={} is created",
            id,
            track.id,
            sink.ssrc()
        );
        Arc::new(Self {
            id,
            subscriber_id,
            keyframe: keyframe_detector(track.mime_type()),
            sink,
            current: AtomicU8::new(QualityLevel::None as u8),
            target: AtomicU8::new(QualityLevel::None as u8),
            max: AtomicU8::new(max_quality as u8),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sink_closed: AtomicBool::new(false),
            rewrite: Mutex::new(RewriteState::new(tick, clock_rate)),
            outbound: tokio::sync::Mutex::new(Packet::default()),
            playout_delay: None,
            send_bitrate: BitrateMeter::new(),
            packets_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            created_at: Instant::now(),
            last_success_ms: AtomicU64::new(0),
            activity,
            events,
            track,
        })
    }

    /// Writes the playout-delay extension under `id` on outbound video.
    pub fn with_playout_delay(mut self: Arc<Self>, id: u8, min_ms: u16, max_ms: u16) -> Arc<Self> {
        if self.track.kind == MediaKind::Video {
            if let Some(forwarder) = Arc::get_mut(&mut self) {
                forwarder.playout_delay = Some((id, playout_delay_payload(min_ms, max_ms)));
            }
        }
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.track.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.sink.ssrc()
    }

    pub fn quality(&self) -> QualityLevel {
        QualityLevel::from_u8(self.current.load(Ordering::Acquire))
    }

    pub fn target_quality(&self) -> QualityLevel {
        QualityLevel::from_u8(self.target.load(Ordering::Acquire))
    }

    pub fn max_quality(&self) -> QualityLevel {
        QualityLevel::from_u8(self.max.load(Ordering::Acquire))
    }

    /// Applied on the next eligible packet.
    pub fn set_target_quality(&self, quality: QualityLevel) {
        let previous = QualityLevel::from_u8(self.target.swap(quality as u8, Ordering::AcqRel));
        if previous != quality {
            tracing::debug!(
                "ClientTrackForwarder id={} target quality {} -> {}",
                self.id,
                previous,
                quality
            );
        }
    }

    pub fn set_max_quality(&self, quality: QualityLevel) {
        self.max.store(quality as u8, Ordering::Release);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send_bitrate(&self) -> u32 {
        self.send_bitrate.bitrate()
    }

    /// Handles one packet from `layer` of the source track. Runs on the source reader task.
    pub async fn push(&self, packet: PooledPacket, layer: Rid) {
        if self.closed.load(Ordering::Acquire) || self.paused.load(Ordering::Acquire) {
            return;
        }
        let target = self.target_quality();
        let current = self.quality();
        if target == QualityLevel::None {
            if current != QualityLevel::None {
                self.rewrite_state().active = None;
                self.current.store(QualityLevel::None as u8, Ordering::Release);
                tracing::debug!("ClientTrackForwarder id={} stopped forwarding", self.id);
            }
            return;
        }
        let wanted = self.wanted_layer(target);
        if Some(layer) != wanted && current.rid() != Some(layer) {
            return;
        }

        let mut out = self.outbound.lock().await;
        let Some((seq, ts)) = self.rewrite_packet(&packet, layer, target, wanted) else {
            return;
        };
        packet.fill_rtp(&mut out);
        out.header.sequence_number = seq;
        out.header.timestamp = ts;
        out.header.ssrc = self.sink.ssrc();
        if let Some((id, payload)) = &self.playout_delay {
            if let Err(err) = out.header.set_extension(*id, payload.clone()) {
                tracing::trace!("ClientTrackForwarder id={} failed to set playout delay: {}", self.id, err);
            }
        }

        let result = self.sink.write_rtp(&out).await;
        let bytes = out.payload.len();
        // The pool only reclaims a payload nobody else references.
        out.payload = Bytes::new();
        drop(out);
        drop(packet);
        match result {
            Ok(_) => self.on_write_success(bytes),
            Err(err) => self.on_write_failure(err).await,
        }
    }

    /// Switches layers if `packet` allows it and returns the outbound sequence number and timestamp.
    fn rewrite_packet(
        &self,
        packet: &PooledPacket,
        layer: Rid,
        target: QualityLevel,
        wanted: Option<Rid>,
    ) -> Option<(u16, u32)> {
        let mut state = self.rewrite_state();
        let header = packet.header();
        if Some(layer) == wanted {
            if state.active != Some(layer) || self.quality() != target {
                let can_switch = self.track.kind == MediaKind::Audio
                    || state.active == Some(layer)
                    || self.is_keyframe(packet);
                if !can_switch {
                    drop(state);
                    self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    self.track.send_pli(layer);
                    return None;
                }
                state.commit(layer, header.sequence_number, header.timestamp);
                self.current.store(target as u8, Ordering::Release);
                tracing::debug!(
                    "ClientTrackForwarder id={} switched to {} on layer {} seq_offset={} ts_offset={}",
                    self.id,
                    target,
                    layer,
                    state.seq_offset,
                    state.ts_offset
                );
            }
        } else if state.active != Some(layer) {
            return None;
        }

        let rewritten = state.rewrite(header.sequence_number, header.timestamp);
        if rewritten.is_none() {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "ClientTrackForwarder id={} dropped stale packet seq={}",
                self.id,
                header.sequence_number
            );
        }
        rewritten
    }

    fn rewrite_state(&self) -> MutexGuard<'_, RewriteState> {
        self.rewrite.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wanted_layer(&self, target: QualityLevel) -> Option<Rid> {
        match self.track.kind {
            MediaKind::Audio => Some(Rid::High),
            MediaKind::Video if self.track.is_simulcast() => target.rid(),
            MediaKind::Video => self.track.rids().first().copied().or(target.rid()),
        }
    }

    fn is_keyframe(&self, packet: &PooledPacket) -> bool {
        match self.keyframe {
            Some(detect) => detect(packet.payload()),
            None => true,
        }
    }

    fn on_write_success(&self, bytes: usize) {
        self.send_bitrate.record(bytes);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_ms.store(self.elapsed_ms(), Ordering::Relaxed);
        self.activity.touch();
    }

    async fn on_write_failure(&self, err: crate::error::Error) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == 1 {
            tracing::error!("ClientTrackForwarder id={} failed to write rtp: {}", self.id, err);
        } else {
            tracing::trace!("ClientTrackForwarder id={} failed to write rtp: {}", self.id, err);
        }

        let since_success = self
            .elapsed_ms()
            .saturating_sub(self.last_success_ms.load(Ordering::Relaxed));
        if failures >= MAX_CONSECUTIVE_WRITE_FAILURES
            && since_success >= BROKEN_AFTER.as_millis() as u64
            && !self.closed.swap(true, Ordering::AcqRel)
        {
            tracing::error!(
                "ClientTrackForwarder id={} is broken after {} failed writes",
                self.id,
                failures
            );
            self.target.store(QualityLevel::None as u8, Ordering::Release);
            self.current.store(QualityLevel::None as u8, Ordering::Release);
            let _ = self.events.send(SessionEvent::ForwarderBroken {
                forwarder_id: self.id.clone(),
            });
        }
    }

    /// Asks the publisher for a keyframe on the layer this forwarder wants.
    pub fn request_pli(&self) -> bool {
        let quality = match self.target_quality() {
            QualityLevel::None => self.quality(),
            target => target,
        };
        match self.wanted_layer(quality) {
            Some(rid) if quality != QualityLevel::None => self.track.send_pli(rid),
            _ => false,
        }
    }

    /// Translates a subscriber NACK into the active layer's sequence space and sends it upstream.
    pub fn forward_nack(&self, nack: &TransportLayerNack) -> bool {
        let (rid, nacks) = {
            let state = self.rewrite_state();
            let Some(rid) = state.active else {
                return false;
            };
            let nacks: Vec<NackPair> = nack
                .nacks
                .iter()
                .map(|pair| NackPair {
                    packet_id: state.inbound_seq(pair.packet_id),
                    lost_packets: pair.lost_packets,
                })
                .collect();
            (rid, nacks)
        };
        let Some(layer) = self.track.layer(rid) else {
            return false;
        };
        layer.send_rtcp(Box::new(TransportLayerNack {
            sender_ssrc: nack.sender_ssrc,
            media_ssrc: layer.ssrc,
            nacks,
        }));
        true
    }

    /// Stops forwarding and closes the outbound track. A broken forwarder still gets its track closed here.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.sink_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.target.store(QualityLevel::None as u8, Ordering::Release);
        self.current.store(QualityLevel::None as u8, Ordering::Release);
        self.rewrite_state().active = None;
        if let Err(err) = self.sink.close().await {
            tracing::error!("ClientTrackForwarder id={} failed to close sink: {}", self.id, err);
        }
        tracing::debug!("ClientTrackForwarder id={} is closed", self.id);
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            id: self.id.clone(),
            track_id: self.track.id.clone(),
            kind: self.track.kind,
            quality: self.quality(),
            target_quality: self.target_quality(),
            max_quality: self.max_quality(),
            send_bitrate: self.send_bitrate.bitrate(),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.send_bitrate.total_bytes(),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.created_at)
            .as_millis() as u64
    }
}

impl Drop for ClientTrackForwarder {
    fn drop(&mut self) {
        tracing::debug!("ClientTrackForwarder id={} is dropped", self.id);
    }
}

/// Payload of the playout-delay header extension: two 12-bit values in 10 ms units.
fn playout_delay_payload(min_ms: u16, max_ms: u16) -> Bytes {
    let min = (min_ms / 10).min(0x0fff);
    let max = (max_ms / 10).min(0x0fff);
    Bytes::from(vec![
        (min >> 4) as u8,
        (((min & 0x0f) << 4) | (max >> 8)) as u8,
        (max & 0xff) as u8,
    ])
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::interceptor::Attributes;
    use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
    use webrtc::rtp::header::Header;
    use webrtc_util::marshal::Marshal;

    use super::*;
    use crate::published_track::tests::track_with_layers;
    use crate::rtp::pool::PacketPool;
    use crate::transport::{tests::RecordingSink, RtcpPacket};

    pub(crate) const VP8_KEYFRAME: &[u8] = &[0x10, 0x00, 0xaa];
    pub(crate) const VP8_DELTA: &[u8] = &[0x10, 0x01, 0xbb];

    pub(crate) fn pooled(pool: &Arc<PacketPool>, seq: u16, ts: u32, payload: &[u8]) -> PooledPacket {
        let header = Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 4242,
            ..Default::default()
        }
        .marshal()
        .expect("marshal");
        pool.acquire(&header, payload, &Attributes::new())
            .expect("acquire")
    }

    struct Fixture {
        forwarder: Arc<ClientTrackForwarder>,
        sink: Arc<RecordingSink>,
        rtcp: mpsc::UnboundedReceiver<RtcpPacket>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _feeds: HashMap<Rid, mpsc::UnboundedSender<Vec<u8>>>,
    }

    async fn fixture(mime_type: &str, rids: &[Rid]) -> Fixture {
        let (track, feeds, rtcp) = track_with_layers("cam", "alice", mime_type, rids).await;
        let sink = RecordingSink::new(9000);
        let (events_tx, events) = mpsc::unbounded_channel();
        let forwarder = ClientTrackForwarder::new(
            "bob".to_owned(),
            track,
            sink.clone(),
            ActivityClock::new(),
            events_tx,
        );
        Fixture {
            forwarder,
            sink,
            rtcp,
            events,
            _feeds: feeds,
        }
    }

    fn plis(rtcp: &mut mpsc::UnboundedReceiver<RtcpPacket>) -> Vec<u32> {
        let mut ssrcs = Vec::new();
        while let Ok(packet) = rtcp.try_recv() {
            if let Some(pli) = packet.as_any().downcast_ref::<PictureLossIndication>() {
                ssrcs.push(pli.media_ssrc);
            }
        }
        ssrcs
    }

    #[tokio::test(start_paused = true)]
    async fn single_layer_passthrough_keeps_sequence_space() {
        let mut f = fixture(MIME_TYPE_VP8, &[Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::High);

        for i in 0..300u16 {
            let payload = if i == 0 { VP8_KEYFRAME } else { VP8_DELTA };
            f.forwarder
                .push(pooled(&pool, 1000 + i, 3000 * i as u32, payload), Rid::High)
                .await;
        }

        let written = f.sink.written();
        assert_eq!(written.len(), 300);
        for (i, packet) in written.iter().enumerate() {
            assert_eq!(packet.header.sequence_number, 1000 + i as u16);
            assert_eq!(packet.header.timestamp, 3000 * i as u32);
            assert_eq!(packet.header.ssrc, 9000);
        }
        assert_eq!(&written[0].payload[..], VP8_KEYFRAME);
        assert_eq!(f.forwarder.quality(), QualityLevel::High);
        assert!(plis(&mut f.rtcp).is_empty());
        assert_eq!(pool.idle_buffers() as u64, pool.allocated());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_keyframe_before_first_packet() {
        let mut f = fixture(MIME_TYPE_VP8, &[Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::High);

        f.forwarder.push(pooled(&pool, 1, 0, VP8_DELTA), Rid::High).await;
        assert!(f.sink.written().is_empty());
        assert_eq!(plis(&mut f.rtcp), vec![1000]);

        f.forwarder.push(pooled(&pool, 2, 3000, VP8_KEYFRAME), Rid::High).await;
        assert_eq!(f.sink.written().len(), 1);
        assert_eq!(f.forwarder.quality(), QualityLevel::High);
    }

    #[tokio::test(start_paused = true)]
    async fn upshift_waits_for_keyframe_and_keeps_sequence_monotonic() {
        let mut f = fixture(MIME_TYPE_VP8, &[Rid::Low, Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Low);

        f.forwarder.push(pooled(&pool, 500, 9000, VP8_KEYFRAME), Rid::Low).await;
        f.forwarder.push(pooled(&pool, 501, 12000, VP8_DELTA), Rid::Low).await;
        // Not wanted yet.
        f.forwarder.push(pooled(&pool, 40000, 700, VP8_KEYFRAME), Rid::High).await;
        assert_eq!(f.sink.written().len(), 2);

        f.forwarder.set_target_quality(QualityLevel::High);
        f.forwarder.push(pooled(&pool, 40001, 3700, VP8_DELTA), Rid::High).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        f.forwarder.push(pooled(&pool, 40002, 6700, VP8_DELTA), Rid::High).await;
        // The old layer keeps flowing while the switch is pending.
        f.forwarder.push(pooled(&pool, 502, 15000, VP8_DELTA), Rid::Low).await;
        assert_eq!(plis(&mut f.rtcp), vec![1001]);
        assert_eq!(f.forwarder.quality(), QualityLevel::Low);

        f.forwarder.push(pooled(&pool, 40003, 9700, VP8_KEYFRAME), Rid::High).await;
        f.forwarder.push(pooled(&pool, 503, 18000, VP8_DELTA), Rid::Low).await;
        f.forwarder.push(pooled(&pool, 40004, 12700, VP8_DELTA), Rid::High).await;
        assert_eq!(f.forwarder.quality(), QualityLevel::High);

        let written = f.sink.written();
        let seqs: Vec<u16> = written.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![500, 501, 502, 503, 504]);
        let ts: Vec<u32> = written.iter().map(|p| p.header.timestamp).collect();
        assert!(ts.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(ts[3], 18000);
        assert_eq!(&written[3].payload[..], VP8_KEYFRAME);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_sequence_survives_wraparound() {
        let f = fixture(MIME_TYPE_VP8, &[Rid::Low, Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Low);
        f.forwarder.push(pooled(&pool, 65534, 0, VP8_KEYFRAME), Rid::Low).await;
        f.forwarder.push(pooled(&pool, 65535, 3000, VP8_DELTA), Rid::Low).await;
        f.forwarder.set_target_quality(QualityLevel::High);
        f.forwarder.push(pooled(&pool, 10, 100, VP8_KEYFRAME), Rid::High).await;
        f.forwarder.push(pooled(&pool, 11, 3100, VP8_DELTA), Rid::High).await;

        let seqs: Vec<u16> = f
            .sink
            .written()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect();
        assert_eq!(seqs, vec![65534, 65535, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_forwards_without_keyframes_and_stops_on_none() {
        let f = fixture(MIME_TYPE_OPUS, &[Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Audio);
        f.forwarder.push(pooled(&pool, 1, 960, &[1]), Rid::High).await;
        f.forwarder.push(pooled(&pool, 2, 1920, &[2]), Rid::High).await;
        assert_eq!(f.sink.written().len(), 2);
        assert_eq!(f.forwarder.quality(), QualityLevel::Audio);

        f.forwarder.set_target_quality(QualityLevel::None);
        f.forwarder.push(pooled(&pool, 3, 2880, &[3]), Rid::High).await;
        assert_eq!(f.sink.written().len(), 2);
        assert_eq!(f.forwarder.quality(), QualityLevel::None);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_write_failures_break_the_forwarder() {
        let mut f = fixture(MIME_TYPE_OPUS, &[Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Audio);
        f.sink.failing.store(true, Ordering::SeqCst);

        for seq in 0..10u16 {
            f.forwarder.push(pooled(&pool, seq, seq as u32 * 960, &[0]), Rid::High).await;
        }
        assert!(f.events.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        f.forwarder.push(pooled(&pool, 10, 9600, &[0]), Rid::High).await;
        match f.events.try_recv() {
            Ok(SessionEvent::ForwarderBroken { forwarder_id }) => assert_eq!(forwarder_id, "bob:cam"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.forwarder.is_closed());
        assert_eq!(f.forwarder.quality(), QualityLevel::None);

        let attempts = f.sink.attempts.load(Ordering::SeqCst);
        f.forwarder.push(pooled(&pool, 11, 10560, &[0]), Rid::High).await;
        assert_eq!(f.sink.attempts.load(Ordering::SeqCst), attempts);
        assert_eq!(pool.idle_buffers() as u64, pool.allocated());
    }

    #[tokio::test(start_paused = true)]
    async fn nack_is_mapped_to_active_layer() {
        let mut f = fixture(MIME_TYPE_VP8, &[Rid::Low, Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Low);
        f.forwarder.push(pooled(&pool, 100, 0, VP8_KEYFRAME), Rid::Low).await;
        f.forwarder.set_target_quality(QualityLevel::High);
        f.forwarder.push(pooled(&pool, 7000, 0, VP8_KEYFRAME), Rid::High).await;

        let nack = TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 9000,
            nacks: vec![NackPair {
                packet_id: 101,
                lost_packets: 0b10,
            }],
        };
        assert!(f.forwarder.forward_nack(&nack));
        let upstream = f.rtcp.try_recv().expect("nack upstream");
        let upstream = upstream
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .expect("nack packet");
        assert_eq!(upstream.media_ssrc, 1001);
        assert_eq!(upstream.nacks[0].packet_id, 7000);
        assert_eq!(upstream.nacks[0].lost_packets, 0b10);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_forwarding_and_closes_sink() {
        let f = fixture(MIME_TYPE_OPUS, &[Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Audio);
        f.forwarder.push(pooled(&pool, 1, 960, &[1]), Rid::High).await;
        f.forwarder.close().await;
        f.forwarder.push(pooled(&pool, 2, 1920, &[2]), Rid::High).await;

        assert_eq!(f.sink.written().len(), 1);
        assert!(f.sink.closed.load(Ordering::SeqCst));
        assert_eq!(f.forwarder.quality(), QualityLevel::None);
        let stats = f.forwarder.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.track_id, "cam");
    }

    #[test]
    fn playout_delay_is_packed_in_ten_ms_units() {
        assert_eq!(&playout_delay_payload(100, 200)[..], &[0x00, 0xa0, 0x14]);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_is_answered_while_a_write_is_stalled() {
        let mut f = fixture(MIME_TYPE_VP8, &[Rid::Low, Rid::High]).await;
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Low);
        f.forwarder.push(pooled(&pool, 300, 0, VP8_KEYFRAME), Rid::Low).await;

        *f.sink.stall.lock().expect("lock") = Some(Duration::from_secs(2));
        let writer = tokio::spawn({
            let forwarder = f.forwarder.clone();
            let packet = pooled(&pool, 301, 3000, VP8_DELTA);
            async move { forwarder.push(packet, Rid::Low).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.sink.written().len(), 1);

        let nack = TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 9000,
            nacks: vec![NackPair {
                packet_id: 300,
                lost_packets: 0,
            }],
        };
        assert!(f.forwarder.forward_nack(&nack));
        let upstream = f.rtcp.try_recv().expect("nack upstream");
        let upstream = upstream
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .expect("nack packet");
        assert_eq!(upstream.media_ssrc, 1000);
        assert_eq!(upstream.nacks[0].packet_id, 300);
        assert_eq!(f.sink.written().len(), 1);

        writer.await.expect("writer");
        assert_eq!(f.sink.written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_reuses_pooled_buffers() {
        let f = fixture(MIME_TYPE_OPUS, &[Rid::High]).await;
        let other = ClientTrackForwarder::new(
            "carol".to_owned(),
            f.forwarder.track.clone(),
            RecordingSink::new(9001),
            ActivityClock::new(),
            mpsc::unbounded_channel().0,
        );
        let pool = PacketPool::new();
        f.forwarder.set_target_quality(QualityLevel::Audio);
        other.set_target_quality(QualityLevel::Audio);

        for seq in 0..50u16 {
            let packet = pooled(&pool, seq, seq as u32 * 960, &[seq as u8]);
            let copy = packet.retain().expect("retain");
            f.forwarder.push(packet, Rid::High).await;
            other.push(copy, Rid::High).await;
        }

        assert_eq!(f.sink.written().len(), 50);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.escaped(), 0);
    }
}
