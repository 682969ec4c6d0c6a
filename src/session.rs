use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use derivative::Derivative;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use webrtc::rtcp::{
    payload_feedbacks::{
        full_intra_request::FullIntraRequest, picture_loss_indication::PictureLossIndication,
    },
    transport_feedbacks::transport_layer_nack::TransportLayerNack,
};

use crate::{
    allocator::{AllocatorEvent, BitrateAllocator},
    config::{BitrateConfig, MediaKind, SessionConfig, SfuConfig},
    data_channel::{ClientMessage, MessageSink},
    error::{Error, StateErrorKind},
    forwarder::{ClientTrackForwarder, ForwarderStats},
    published_track::PublishedTrack,
    room::RoomEvent,
    transport::{BandwidthEstimatorRegistry, RtcpPacket, TrackSinkFactory},
    vad::{VoiceActivity, VoiceEvent},
};

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const VOICE_ACTIVITY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    Active = 1,
    /// ICE/DTLS renegotiation in progress. Writes are paused, allocation continues.
    Restart = 2,
    Ended = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::New,
            1 => SessionState::Active,
            2 => SessionState::Restart,
            _ => SessionState::Ended,
        }
    }
}

/// Last time media or feedback moved on a session.
#[derive(Debug)]
pub struct ActivityClock {
    started: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        })
    }

    pub fn touch(&self) {
        let now = Instant::now()
            .saturating_duration_since(self.started)
            .as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = Instant::now().saturating_duration_since(self.started);
        now.saturating_sub(Duration::from_millis(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Audio track a voice event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSource {
    pub track_id: String,
    pub stream_id: String,
    pub client_id: String,
    pub clock_rate: u32,
}

impl VoiceSource {
    pub fn of(track: &PublishedTrack) -> Self {
        Self {
            track_id: track.id.clone(),
            stream_id: track.stream_id.clone(),
            client_id: track.client_id.clone(),
            clock_rate: track.clock_rate(),
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    ForwarderBroken { forwarder_id: String },
    TrackEnded { track_id: String },
    Voice { source: VoiceSource, event: VoiceEvent },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub client_id: String,
    pub state: SessionState,
    pub bandwidth: u64,
    pub forwarders: Vec<ForwarderStats>,
}

/// One receiving client: its forwarders, its allocator and the tasks serving them.
///
/// Every task of the session stops when it reaches [`SessionState::Ended`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SubscriberSession {
    pub id: String,
    config: SessionConfig,
    bitrates: BitrateConfig,
    state: AtomicU8,
    forwarders: Arc<ArcSwap<Vec<Arc<ClientTrackForwarder>>>>,
    mutation: Mutex<()>,
    sink_factory: Arc<dyn TrackSinkFactory>,
    activity: Arc<ActivityClock>,
    events: mpsc::UnboundedSender<SessionEvent>,
    allocator: mpsc::UnboundedSender<AllocatorEvent>,
    estimators: Arc<BandwidthEstimatorRegistry>,
    estimate: watch::Receiver<u64>,
    voice_activity: broadcast::Sender<VoiceActivity>,
    #[derivative(Debug = "ignore")]
    message_sink: Mutex<Option<Arc<dyn MessageSink>>>,
    room_events: mpsc::UnboundedSender<RoomEvent>,
    cancel: CancellationToken,
}

impl SubscriberSession {
    pub async fn new(
        id: String,
        config: &SfuConfig,
        sink_factory: Arc<dyn TrackSinkFactory>,
        estimators: Arc<BandwidthEstimatorRegistry>,
        room_events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let forwarders = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let estimate = estimators
            .register(&id, config.bitrates.initial_bandwidth)
            .await;
        let allocator = BitrateAllocator::spawn(
            id.clone(),
            Arc::clone(&forwarders),
            estimate.clone(),
            config.bitrates.clone(),
            config.session.quality_levels.clone(),
            cancel.clone(),
        );
        let (events, events_receiver) = mpsc::unbounded_channel();
        let (voice_activity, _) = broadcast::channel(VOICE_ACTIVITY_CAPACITY);

        let session = Arc::new(Self {
            id,
            config: config.session.clone(),
            bitrates: config.bitrates.clone(),
            state: AtomicU8::new(SessionState::New as u8),
            forwarders,
            mutation: Mutex::new(()),
            sink_factory,
            activity: ActivityClock::new(),
            events,
            allocator,
            estimators,
            estimate,
            voice_activity,
            message_sink: Mutex::new(None),
            room_events,
            cancel,
        });

        {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                Self::session_event_loop(session, events_receiver).await;
            });
        }

        tracing::debug!("SubscriberSession id={} is created", session.id);
        session
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> Result<SessionState, Error> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = SessionState::from_u8(current);
            if !from.contains(&state) {
                return Err(Error::new_state(
                    format!("session {} cannot go from {} to {}", self.id, state, to),
                    StateErrorKind::ClientStopped,
                ));
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!("SubscriberSession id={} state {} -> {}", self.id, state, to);
                    return Ok(state);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Transport connected.
    pub fn activate(&self) -> Result<(), Error> {
        let previous = self.transition(&[SessionState::New, SessionState::Restart], SessionState::Active)?;
        if previous == SessionState::Restart {
            self.set_paused(false);
        }
        self.activity.touch();
        Ok(())
    }

    /// Starts an ICE restart. Forwarders stop writing until [`Self::resume`].
    pub fn restart(&self) -> Result<(), Error> {
        self.transition(&[SessionState::Active], SessionState::Restart)?;
        self.set_paused(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.transition(&[SessionState::Restart], SessionState::Active)?;
        self.set_paused(false);
        self.activity.touch();
        Ok(())
    }

    fn set_paused(&self, paused: bool) {
        for forwarder in self.forwarders.load().iter() {
            if paused {
                forwarder.pause();
            } else {
                forwarder.resume();
            }
        }
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.state() == SessionState::Ended {
            return Err(Error::new_state(
                format!("session {} has ended", self.id),
                StateErrorKind::ClientStopped,
            ));
        }
        Ok(())
    }

    /// Creates an outbound track for `track` and starts forwarding it.
    pub async fn subscribe(&self, track: Arc<PublishedTrack>) -> Result<Arc<ClientTrackForwarder>, Error> {
        self.ensure_running()?;
        if self.forwarder_for_track(&track.id).is_some() {
            return Err(Error::new_state(
                format!("session {} already receives track {}", self.id, track.id),
                StateErrorKind::TrackExists,
            ));
        }
        let sink = self.sink_factory.create_sink(&track).await?;
        let mut forwarder = ClientTrackForwarder::new(
            self.id.clone(),
            track,
            sink,
            Arc::clone(&self.activity),
            self.events.clone(),
        );
        if let Some(id) = self.config.playout_delay_extension_id {
            forwarder = forwarder.with_playout_delay(
                id,
                self.config.min_playout_delay,
                self.config.max_playout_delay,
            );
        }
        self.add_forwarder(Arc::clone(&forwarder)).await?;
        Ok(forwarder)
    }

    /// Registers a forwarder and attaches it to its source track.
    pub async fn add_forwarder(&self, forwarder: Arc<ClientTrackForwarder>) -> Result<(), Error> {
        {
            let _guard = self.mutation.lock().await;
            self.ensure_running()?;
            let current = self.forwarders.load();
            if current.iter().any(|f| f.id == forwarder.id) {
                return Err(Error::new_state(
                    format!("forwarder {} already exists", forwarder.id),
                    StateErrorKind::TrackExists,
                ));
            }
            if self.state() == SessionState::Restart {
                forwarder.pause();
            }
            let mut next = current.as_ref().clone();
            next.push(Arc::clone(&forwarder));
            self.forwarders.store(Arc::new(next));
        }
        forwarder.track.add_forwarder(Arc::clone(&forwarder)).await;
        tracing::debug!(
            "SubscriberSession id={} added forwarder {}",
            self.id,
            forwarder.id
        );
        self.reallocate();
        Ok(())
    }

    /// Detaches a forwarder from its track and closes its outbound track.
    pub async fn remove_forwarder(&self, forwarder_id: &str) -> Result<(), Error> {
        let removed = {
            let _guard = self.mutation.lock().await;
            let current = self.forwarders.load();
            let Some(removed) = current.iter().find(|f| f.id == forwarder_id).cloned() else {
                return Err(Error::new_state(
                    format!("forwarder {} is not in session {}", forwarder_id, self.id),
                    StateErrorKind::TrackNotFound,
                ));
            };
            let next: Vec<_> = current
                .iter()
                .filter(|f| f.id != forwarder_id)
                .cloned()
                .collect();
            self.forwarders.store(Arc::new(next));
            removed
        };
        removed.track.remove_forwarder(&removed.id).await;
        removed.close().await;
        tracing::debug!("SubscriberSession id={} removed forwarder {}", self.id, forwarder_id);
        self.reallocate();
        Ok(())
    }

    pub fn forwarders(&self) -> Vec<Arc<ClientTrackForwarder>> {
        self.forwarders.load().as_ref().clone()
    }

    pub fn forwarder_for_track(&self, track_id: &str) -> Option<Arc<ClientTrackForwarder>> {
        self.forwarders
            .load()
            .iter()
            .find(|f| f.track.id == track_id)
            .cloned()
    }

    fn forwarder_by_ssrc(&self, ssrc: u32) -> Option<Arc<ClientTrackForwarder>> {
        self.forwarders
            .load()
            .iter()
            .find(|f| f.ssrc() == ssrc)
            .cloned()
    }

    pub(crate) fn reallocate(&self) {
        let _ = self.allocator.send(AllocatorEvent::Reallocate);
    }

    /// New downlink estimate in bits/s.
    pub async fn on_bandwidth_estimate(&self, bitrate: u64) {
        self.estimators.update(&self.id, bitrate).await;
    }

    pub fn bandwidth(&self) -> u64 {
        *self.estimate.borrow()
    }

    /// Routes RTCP feedback from the subscriber to the forwarder owning the reported SSRC.
    pub fn on_rtcp(&self, packet: &RtcpPacket) {
        self.activity.touch();
        let packet = packet.as_any();
        if let Some(pli) = packet.downcast_ref::<PictureLossIndication>() {
            if let Some(forwarder) = self.forwarder_by_ssrc(pli.media_ssrc) {
                forwarder.request_pli();
            }
        } else if let Some(fir) = packet.downcast_ref::<FullIntraRequest>() {
            for entry in fir.fir.iter() {
                if let Some(forwarder) = self.forwarder_by_ssrc(entry.ssrc) {
                    forwarder.request_pli();
                }
            }
        } else if let Some(nack) = packet.downcast_ref::<TransportLayerNack>() {
            if let Some(forwarder) = self.forwarder_by_ssrc(nack.media_ssrc) {
                forwarder.forward_nack(nack);
            }
        }
    }

    /// Sets where messages for this client go, normally its control data channel.
    pub async fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.message_sink.lock().await = Some(sink);
    }

    async fn send_message(&self, message: &ClientMessage) {
        let sink = self.message_sink.lock().await.clone();
        match sink {
            Some(sink) => {
                if let Err(err) = sink.send(message).await {
                    tracing::error!("SubscriberSession id={} failed to send message: {}", self.id, err);
                }
            }
            None => tracing::trace!("SubscriberSession id={} has no message sink", self.id),
        }
    }

    /// Handles one JSON message received from the client.
    pub async fn on_message(&self, text: &str) -> Result<(), Error> {
        self.activity.touch();
        match ClientMessage::parse(text)? {
            ClientMessage::VideoSize {
                track_id,
                width,
                height,
            } => {
                let forwarder = self.forwarder_for_track(&track_id).ok_or_else(|| {
                    Error::new_state(
                        format!("session {} does not receive track {}", self.id, track_id),
                        StateErrorKind::TrackNotFound,
                    )
                })?;
                if forwarder.kind() == MediaKind::Video {
                    let quality = self.bitrates.quality_for_size(width, height);
                    forwarder.set_max_quality(quality);
                    tracing::debug!(
                        "SubscriberSession id={} track_id={} video size {}x{} caps quality at {}",
                        self.id,
                        track_id,
                        width,
                        height,
                        quality
                    );
                    self.reallocate();
                }
            }
            ClientMessage::Stats { .. } => {
                let reply = ClientMessage::Stats {
                    forwarders: self.stats().forwarders,
                };
                self.send_message(&reply).await;
            }
            message => {
                tracing::debug!("SubscriberSession id={} ignored message {:?}", self.id, message);
            }
        }
        Ok(())
    }

    pub fn subscribe_voice_activity(&self) -> broadcast::Receiver<VoiceActivity> {
        self.voice_activity.subscribe()
    }

    /// Queues a voice event of another client's audio track.
    pub fn on_voice(&self, source: VoiceSource, event: VoiceEvent) {
        let _ = self.events.send(SessionEvent::Voice { source, event });
    }

    /// Forgets forwarders of a track that has ended.
    pub fn on_track_ended(&self, track_id: &str) {
        let _ = self.events.send(SessionEvent::TrackEnded {
            track_id: track_id.to_owned(),
        });
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            client_id: self.id.clone(),
            state: self.state(),
            bandwidth: self.bandwidth(),
            forwarders: self.forwarders.load().iter().map(|f| f.stats()).collect(),
        }
    }

    /// Ends the session: stops its tasks, closes every forwarder and tells the room.
    pub async fn end(&self) {
        if self.state.swap(SessionState::Ended as u8, Ordering::AcqRel) == SessionState::Ended as u8 {
            return;
        }
        self.cancel.cancel();
        let forwarders = {
            let _guard = self.mutation.lock().await;
            self.forwarders.swap(Arc::new(Vec::new()))
        };
        for forwarder in forwarders.iter() {
            forwarder.track.remove_forwarder(&forwarder.id).await;
            forwarder.close().await;
        }
        self.estimators.remove(&self.id).await;
        let _ = self.room_events.send(RoomEvent::SessionEnded {
            client_id: self.id.clone(),
        });
        tracing::debug!("SubscriberSession id={} has ended", self.id);
    }

    async fn session_event_loop(session: Arc<Self>, mut event_receiver: mpsc::UnboundedReceiver<SessionEvent>) {
        tracing::debug!("SubscriberSession id={} event loop has started", session.id);
        let idle_timeout = session.config.idle_timeout;
        let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL.min(idle_timeout).max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = idle_check.tick(), if !idle_timeout.is_zero() => {
                    if session.state() == SessionState::Active && session.activity.idle_for() >= idle_timeout {
                        tracing::info!("SubscriberSession id={} is idle, ending", session.id);
                        session.end().await;
                        break;
                    }
                }
                event = event_receiver.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    session.handle_event(event).await;
                }
            }
        }
        tracing::debug!("SubscriberSession id={} event loop has finished", session.id);
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ForwarderBroken { forwarder_id } => {
                if let Err(err) = self.remove_forwarder(&forwarder_id).await {
                    tracing::debug!("SubscriberSession id={} broken forwarder: {}", self.id, err);
                }
            }
            SessionEvent::TrackEnded { track_id } => {
                if let Some(forwarder) = self.forwarder_for_track(&track_id) {
                    if let Err(err) = self.remove_forwarder(&forwarder.id).await {
                        tracing::debug!("SubscriberSession id={} ended track: {}", self.id, err);
                    }
                }
            }
            SessionEvent::Voice { source, event } => self.handle_voice(source, event).await,
        }
    }

    async fn handle_voice(&self, source: VoiceSource, event: VoiceEvent) {
        match event {
            VoiceEvent::Started { ssrc } => {
                let _ = self.allocator.send(AllocatorEvent::VoiceStarted {
                    client_id: source.client_id.clone(),
                });
                self.send_message(&ClientMessage::VadStarted {
                    ssrc,
                    client_id: source.client_id,
                })
                .await;
            }
            VoiceEvent::Batch { ssrc, packets } => {
                let _ = self.voice_activity.send(VoiceActivity {
                    track_id: source.track_id,
                    stream_id: source.stream_id,
                    ssrc,
                    clock_rate: source.clock_rate,
                    audio_levels: packets,
                });
            }
            VoiceEvent::Ended { ssrc } => {
                let _ = self.allocator.send(AllocatorEvent::VoiceEnded {
                    client_id: source.client_id.clone(),
                });
                self.send_message(&ClientMessage::VadEnded {
                    ssrc,
                    client_id: source.client_id,
                })
                .await;
            }
        }
    }
}

impl Drop for SubscriberSession {
    fn drop(&mut self) {
        tracing::debug!("SubscriberSession id={} is dropped", self.id);
    }
}
