use std::{collections::HashMap, sync::Arc};

use derivative::Derivative;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::{MediaKind, SfuConfig, SourceType},
    error::{Error, StateErrorKind},
    hub::HubEvent,
    published_track::{PublishedTrack, TrackInfo, TrackRegistry},
    remote_track::{RemoteTrack, RemoteTrackOptions},
    rtp::pool::PacketPool,
    session::{SubscriberSession, VoiceSource},
    transport::{BandwidthEstimatorRegistry, RtcpSender, RtpSource, TrackSinkFactory},
    vad::{VoiceDetector, VoiceEvent},
};

/// Room accommodates the clients of one conference. Every track published in a room is
/// forwarded to every other client of the same room.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Room {
    pub id: String,
    config: SfuConfig,
    sessions: HashMap<String, Arc<SubscriberSession>>,
    tracks: TrackRegistry,
    #[derivative(Debug = "ignore")]
    pool: Arc<PacketPool>,
    estimators: Arc<BandwidthEstimatorRegistry>,
    room_event_sender: mpsc::UnboundedSender<RoomEvent>,
    hub_event_sender: mpsc::UnboundedSender<HubEvent>,
    empty_timer: Option<CancellationToken>,
    cancel: CancellationToken,
}

impl Room {
    pub(crate) fn new(
        config: SfuConfig,
        estimators: Arc<BandwidthEstimatorRegistry>,
        hub_event_sender: mpsc::UnboundedSender<HubEvent>,
    ) -> (Arc<Mutex<Room>>, String) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel::<RoomEvent>();

        let mut room = Room {
            id: id.clone(),
            config,
            sessions: HashMap::new(),
            tracks: TrackRegistry::new(),
            pool: PacketPool::new(),
            estimators,
            room_event_sender: tx,
            hub_event_sender,
            empty_timer: None,
            cancel: CancellationToken::new(),
        };
        // A room nobody joins is as empty as one everybody left.
        room.start_empty_timer();

        tracing::debug!("Room {} is created", id);

        let room = Arc::new(Mutex::new(room));
        {
            let copied = Arc::clone(&room);
            let id = id.clone();
            tokio::spawn(async move {
                Room::room_event_loop(id, copied, rx).await;
            });
        }

        (room, id)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn session(&self, client_id: &str) -> Result<Arc<SubscriberSession>, Error> {
        self.sessions.get(client_id).cloned().ok_or_else(|| {
            Error::new_state(
                format!("client {} is not in room {}", client_id, self.id),
                StateErrorKind::ClientNotFound,
            )
        })
    }

    /// Tracks already published in this room. Useful to tell a new client what it will receive.
    pub async fn tracks(&self) -> Vec<Arc<PublishedTrack>> {
        self.tracks.all().await
    }

    /// Marks a published track as screen share or camera. Screen shares are allocated first.
    pub async fn set_source_type(&self, track_id: &str, source_type: SourceType) -> Result<(), Error> {
        let track = self.tracks.get(track_id).await?;
        track.set_source_type(source_type);
        for session in self.sessions.values() {
            if session.forwarder_for_track(track_id).is_some() {
                session.reallocate();
            }
        }
        tracing::debug!("Room {} track {} source type is {}", self.id, track_id, source_type);
        Ok(())
    }

    /// Joins a client. It immediately receives every track other clients publish.
    pub async fn add_client(
        &mut self,
        client_id: &str,
        sink_factory: Arc<dyn TrackSinkFactory>,
    ) -> Result<Arc<SubscriberSession>, Error> {
        if self.sessions.contains_key(client_id) {
            return Err(Error::new_state(
                format!("client {} is already in room {}", client_id, self.id),
                StateErrorKind::ClientExists,
            ));
        }
        let session = SubscriberSession::new(
            client_id.to_owned(),
            &self.config,
            sink_factory,
            Arc::clone(&self.estimators),
            self.room_event_sender.clone(),
        )
        .await;
        self.sessions
            .insert(client_id.to_owned(), Arc::clone(&session));
        if let Some(timer) = self.empty_timer.take() {
            timer.cancel();
        }

        for track in self.tracks.others(client_id).await {
            if let Err(err) = session.subscribe(track).await {
                tracing::error!("Room {} failed to subscribe client {}: {}", self.id, client_id, err);
            }
        }
        tracing::debug!("Room {} client {} joined", self.id, client_id);
        Ok(session)
    }

    /// Adds one layer stream of a client's track. The first layer of a track publishes it
    /// and creates a forwarder in every other client's session.
    pub async fn publish_track(
        &self,
        client_id: &str,
        info: TrackInfo,
        source: Arc<dyn RtpSource>,
        rtcp_sender: RtcpSender,
        audio_level_extension_id: Option<u8>,
    ) -> Result<Arc<PublishedTrack>, Error> {
        if !self.sessions.contains_key(client_id) {
            return Err(Error::new_state(
                format!("client {} is not in room {}", client_id, self.id),
                StateErrorKind::ClientNotFound,
            ));
        }

        let (track, created) = match self.tracks.get(&info.id).await {
            Ok(track) if track.client_id == client_id => (track, false),
            Ok(_) => {
                return Err(Error::new_state(
                    format!("track {} is published by another client", info.id),
                    StateErrorKind::TrackExists,
                ))
            }
            Err(_) => (self.create_track(info, source.ssrc()).await?, true),
        };

        let session = &self.config.session;
        let layer = RemoteTrack::new(
            source,
            Arc::clone(&self.pool),
            rtcp_sender,
            RemoteTrackOptions {
                audio_level_extension_id,
                reorder: session
                    .reorder_packets
                    .then_some((session.jitter_buffer_min_wait, session.jitter_buffer_max_wait)),
                idle_timeout: (!session.idle_timeout.is_zero()).then_some(session.idle_timeout),
            },
            self.cancel.child_token(),
        );
        track.add_layer(Arc::clone(&layer)).await?;
        if track.kind == MediaKind::Video {
            layer.enable_interval_pli(self.config.room.pli_interval);
        }

        if created {
            for (id, session) in self.sessions.iter() {
                if id == client_id {
                    continue;
                }
                if let Err(err) = session.subscribe(Arc::clone(&track)).await {
                    tracing::error!("Room {} failed to subscribe client {}: {}", self.id, id, err);
                }
            }
        }
        Ok(track)
    }

    async fn create_track(&self, info: TrackInfo, ssrc: u32) -> Result<Arc<PublishedTrack>, Error> {
        let is_audio = MediaKind::from_mime_type(&info.capability.mime_type) == MediaKind::Audio;
        let voice = if is_audio && self.config.session.enable_voice_detection {
            let (tx, mut rx) = mpsc::unbounded_channel::<VoiceEvent>();
            let source = VoiceSource {
                track_id: info.id.clone(),
                stream_id: info.stream_id.clone(),
                client_id: info.client_id.clone(),
                clock_rate: info.capability.clock_rate,
            };
            let room_event_sender = self.room_event_sender.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let event = RoomEvent::Voice {
                        source: source.clone(),
                        event,
                    };
                    if room_event_sender.send(event).is_err() {
                        break;
                    }
                }
            });
            Some(VoiceDetector::new(
                ssrc,
                self.config.session.vad.clone(),
                tx,
                self.cancel.child_token(),
            ))
        } else {
            None
        };

        let track = PublishedTrack::new(info, voice);
        self.tracks.insert(Arc::clone(&track)).await?;
        {
            let room_event_sender = self.room_event_sender.clone();
            let track_id = track.id.clone();
            track
                .on_ended(Box::new(move || {
                    let _ = room_event_sender.send(RoomEvent::TrackEnded { track_id });
                }))
                .await;
        }
        tracing::debug!("Room {} track {} is published", self.id, track.id);
        Ok(track)
    }

    /// Removes a client: its session ends and every track it published ends for everyone.
    pub async fn remove_client(&mut self, client_id: &str) -> Result<(), Error> {
        let session = self.sessions.remove(client_id).ok_or_else(|| {
            Error::new_state(
                format!("client {} is not in room {}", client_id, self.id),
                StateErrorKind::ClientNotFound,
            )
        })?;
        session.end().await;

        for track in self.tracks.by_client(client_id).await {
            let _ = self.tracks.remove(&track.id).await;
            track.close().await;
            for session in self.sessions.values() {
                session.on_track_ended(&track.id);
            }
        }
        tracing::debug!("Room {} client {} left", self.id, client_id);

        if self.sessions.is_empty() {
            self.start_empty_timer();
        }
        Ok(())
    }

    fn start_empty_timer(&mut self) {
        if let Some(timer) = self.empty_timer.take() {
            timer.cancel();
        }
        let timer = self.cancel.child_token();
        let timeout = self.config.room.empty_room_timeout;
        let room_event_sender = self.room_event_sender.clone();
        {
            let timer = timer.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        let _ = room_event_sender.send(RoomEvent::EmptyTimeout);
                    }
                }
            });
        }
        self.empty_timer = Some(timer);
    }

    /// Ends every session and track, then removes the room from its hub.
    pub async fn close(&mut self) {
        let client_ids = self.client_ids();
        for client_id in client_ids {
            let _ = self.remove_client(&client_id).await;
        }
        for track in self.tracks.all().await {
            track.close().await;
        }
        let _ = self.room_event_sender.send(RoomEvent::Closed);
    }

    pub(crate) async fn room_event_loop(
        id: String,
        room: Arc<Mutex<Room>>,
        mut event_receiver: mpsc::UnboundedReceiver<RoomEvent>,
    ) {
        tracing::debug!("Room {} event loop started", id);
        while let Some(event) = event_receiver.recv().await {
            match event {
                RoomEvent::SessionEnded { client_id } => {
                    let mut r = room.lock().await;
                    if r.sessions.contains_key(&client_id) {
                        if let Err(err) = r.remove_client(&client_id).await {
                            tracing::error!("Room {} failed to remove client {}: {}", id, client_id, err);
                        }
                    }
                }
                RoomEvent::TrackEnded { track_id } => {
                    let r = room.lock().await;
                    let _ = r.tracks.remove(&track_id).await;
                    for session in r.sessions.values() {
                        session.on_track_ended(&track_id);
                    }
                }
                RoomEvent::Voice { source, event } => {
                    let r = room.lock().await;
                    for (client_id, session) in r.sessions.iter() {
                        if *client_id != source.client_id {
                            session.on_voice(source.clone(), event.clone());
                        }
                    }
                }
                RoomEvent::EmptyTimeout => {
                    let mut r = room.lock().await;
                    if r.sessions.is_empty() {
                        tracing::info!("Room {} has been empty for {:?}, closing", id, r.config.room.empty_room_timeout);
                        r.close().await;
                    }
                }
                RoomEvent::Closed => {
                    let r = room.lock().await;
                    r.cancel.cancel();
                    if let Err(err) = r.hub_event_sender.send(HubEvent::RoomRemoved(r.id.clone())) {
                        tracing::error!("Failed to send RoomRemoved event id={}: {}", r.id, err);
                    }
                    break;
                }
            }
        }
        tracing::debug!("Room {} event loop finished", id);
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::debug!("Room {} is dropped", self.id);
    }
}

#[derive(Debug)]
pub enum RoomEvent {
    SessionEnded { client_id: String },
    TrackEnded { track_id: String },
    Voice { source: VoiceSource, event: VoiceEvent },
    EmptyTimeout,
    Closed,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::rtp::header::{Extension, Header};

    use super::*;
    use crate::config::Rid;
    use crate::data_channel::{tests::RecordingMessageSink, ClientMessage};
    use crate::error::ErrorKind;
    use crate::forwarder::tests::{VP8_DELTA, VP8_KEYFRAME};
    use crate::published_track::tests::info;
    use crate::rtp::tests::raw_packet;
    use crate::transport::tests::{ChannelSource, RecordingSinkFactory};

    struct Fixture {
        room: Arc<Mutex<Room>>,
        hub_events: mpsc::UnboundedReceiver<HubEvent>,
    }

    fn fixture(config: SfuConfig) -> Fixture {
        let (hub_tx, hub_events) = mpsc::unbounded_channel();
        let (room, _id) = Room::new(config, BandwidthEstimatorRegistry::new(), hub_tx);
        Fixture { room, hub_events }
    }

    fn video_packet(ssrc: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
        let header = Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: seq as u32 * 3000,
            ssrc,
            ..Default::default()
        };
        raw_packet(&header, payload)
    }

    fn loud_audio_packet(ssrc: u32, seq: u16) -> Vec<u8> {
        let header = Header {
            version: 2,
            payload_type: 111,
            sequence_number: seq,
            timestamp: seq as u32 * 960,
            ssrc,
            extension: true,
            extension_profile: 0xBEDE,
            extensions: vec![Extension {
                id: 1,
                payload: Bytes::from_static(&[0x80 | 20]),
            }],
            ..Default::default()
        };
        raw_packet(&header, &[0xfc, 0x01])
    }

    #[tokio::test(start_paused = true)]
    async fn clients_receive_tracks_published_before_and_after_they_join() {
        let f = fixture(SfuConfig::default());
        let bob_sinks = Arc::new(RecordingSinkFactory::default());
        let carol_sinks = Arc::new(RecordingSinkFactory::default());
        let mut room = f.room.lock().await;
        room.add_client("alice", Arc::new(RecordingSinkFactory::default()))
            .await
            .expect("alice");
        let bob = room.add_client("bob", bob_sinks.clone()).await.expect("bob");

        let (source, feed) = ChannelSource::new(1234, Rid::High);
        let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
        let track = room
            .publish_track("alice", info("cam", "alice", MIME_TYPE_VP8), source, rtcp_tx, None)
            .await
            .expect("publish");
        assert!(bob.forwarder_for_track("cam").is_some());
        assert_eq!(track.forwarders().len(), 1);

        let carol = room.add_client("carol", carol_sinks.clone()).await.expect("carol");
        assert!(carol.forwarder_for_track("cam").is_some());
        let alice = room.session("alice").expect("alice session");
        assert!(alice.forwarders().is_empty());
        drop(room);

        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.send(video_packet(1234, 1, VP8_KEYFRAME)).expect("feed");
        feed.send(video_packet(1234, 2, VP8_DELTA)).expect("feed");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bob_sinks.sinks()[0].written().len(), 2);
        assert_eq!(carol_sinks.sinks()[0].written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn source_type_marks_screen_shares() {
        let f = fixture(SfuConfig::default());
        let mut room = f.room.lock().await;
        room.add_client("alice", Arc::new(RecordingSinkFactory::default()))
            .await
            .expect("alice");
        let (source, _feed) = ChannelSource::new(1234, Rid::High);
        let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
        let track = room
            .publish_track("alice", info("screen", "alice", MIME_TYPE_VP8), source, rtcp_tx, None)
            .await
            .expect("publish");
        assert_eq!(track.source_type(), SourceType::Media);

        room.set_source_type("screen", SourceType::Screen)
            .await
            .expect("source type");
        assert_eq!(track.source_type(), SourceType::Screen);

        let err = room
            .set_source_type("nope", SourceType::Screen)
            .await
            .expect_err("unknown track");
        assert_eq!(err.kind, ErrorKind::State(StateErrorKind::TrackNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_duplicate_clients_are_rejected() {
        let f = fixture(SfuConfig::default());
        let mut room = f.room.lock().await;
        room.add_client("alice", Arc::new(RecordingSinkFactory::default()))
            .await
            .expect("alice");
        let err = room
            .add_client("alice", Arc::new(RecordingSinkFactory::default()))
            .await
            .expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::State(StateErrorKind::ClientExists));

        let (source, _feed) = ChannelSource::new(1, Rid::High);
        let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
        let err = room
            .publish_track("mallory", info("cam", "mallory", MIME_TYPE_VP8), source, rtcp_tx, None)
            .await
            .expect_err("unknown client");
        assert_eq!(err.kind, ErrorKind::State(StateErrorKind::ClientNotFound));

        let err = room.remove_client("mallory").await.expect_err("unknown client");
        assert_eq!(err.kind, ErrorKind::State(StateErrorKind::ClientNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn simulcast_layers_join_one_track() {
        let f = fixture(SfuConfig::default());
        let mut room = f.room.lock().await;
        room.add_client("alice", Arc::new(RecordingSinkFactory::default()))
            .await
            .expect("alice");
        room.add_client("bob", Arc::new(RecordingSinkFactory::default()))
            .await
            .expect("bob");

        let mut feeds = Vec::new();
        for (ssrc, rid) in [(11, Rid::Low), (12, Rid::Mid), (13, Rid::High)] {
            let (source, feed) = ChannelSource::new(ssrc, rid);
            let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
            room.publish_track("alice", info("cam", "alice", MIME_TYPE_VP8), source, rtcp_tx, None)
                .await
                .expect("publish layer");
            feeds.push(feed);
        }
        let tracks = room.tracks().await;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].rids(), vec![Rid::Low, Rid::Mid, Rid::High]);
        assert_eq!(room.session("bob").expect("bob").forwarders().len(), 1);

        let (source, _feed) = ChannelSource::new(14, Rid::High);
        let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
        let err = room
            .publish_track("bob", info("cam", "bob", MIME_TYPE_VP8), source, rtcp_tx, None)
            .await
            .expect_err("taken track id");
        assert_eq!(err.kind, ErrorKind::State(StateErrorKind::TrackExists));
    }

    #[tokio::test(start_paused = true)]
    async fn ended_track_is_unpublished_everywhere() {
        let f = fixture(SfuConfig::default());
        let bob_sinks = Arc::new(RecordingSinkFactory::default());
        let bob = {
            let mut room = f.room.lock().await;
            room.add_client("alice", Arc::new(RecordingSinkFactory::default()))
                .await
                .expect("alice");
            let bob = room.add_client("bob", bob_sinks.clone()).await.expect("bob");
            let (source, feed) = ChannelSource::new(1234, Rid::High);
            let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
            room.publish_track("alice", info("cam", "alice", MIME_TYPE_VP8), source, rtcp_tx, None)
                .await
                .expect("publish");
            drop(feed);
            bob
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.room.lock().await.tracks().await.is_empty());
        assert!(bob.forwarder_for_track("cam").is_none());
        assert!(bob_sinks.sinks()[0].closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_client_takes_its_tracks_and_empty_room_closes() {
        let mut f = fixture(SfuConfig::default());
        let bob = {
            let mut room = f.room.lock().await;
            room.add_client("alice", Arc::new(RecordingSinkFactory::default()))
                .await
                .expect("alice");
            let bob = room
                .add_client("bob", Arc::new(RecordingSinkFactory::default()))
                .await
                .expect("bob");
            let (source, _feed) = ChannelSource::new(1234, Rid::High);
            let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
            room.publish_track("alice", info("mic", "alice", MIME_TYPE_OPUS), source, rtcp_tx, None)
                .await
                .expect("publish");
            room.remove_client("alice").await.expect("alice leaves");
            assert!(room.tracks().await.is_empty());
            bob
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bob.forwarders().is_empty());

        f.room.lock().await.remove_client("bob").await.expect("bob leaves");
        tokio::time::sleep(Duration::from_secs(179)).await;
        assert!(f.hub_events.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        match f.hub_events.try_recv() {
            Ok(HubEvent::RoomRemoved(_)) => {}
            other => panic!("unexpected hub event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejoining_cancels_the_empty_room_timer() {
        let mut f = fixture(SfuConfig::default());
        tokio::time::sleep(Duration::from_secs(100)).await;
        f.room
            .lock()
            .await
            .add_client("alice", Arc::new(RecordingSinkFactory::default()))
            .await
            .expect("alice");
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(f.hub_events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn speaking_publisher_is_announced_to_others() {
        let f = fixture(SfuConfig::default());
        let messages = Arc::new(RecordingMessageSink::default());
        let (feed, mut activity) = {
            let mut room = f.room.lock().await;
            room.add_client("alice", Arc::new(RecordingSinkFactory::default()))
                .await
                .expect("alice");
            let bob = room
                .add_client("bob", Arc::new(RecordingSinkFactory::default()))
                .await
                .expect("bob");
            bob.set_message_sink(messages.clone()).await;
            let activity = bob.subscribe_voice_activity();
            let (source, feed) = ChannelSource::new(4321, Rid::High);
            let (rtcp_tx, _rtcp_rx) = mpsc::unbounded_channel();
            room.publish_track("alice", info("mic", "alice", MIME_TYPE_OPUS), source, rtcp_tx, Some(1))
                .await
                .expect("publish");
            (feed, activity)
        };

        for seq in 0..30u16 {
            feed.send(loud_audio_packet(4321, seq)).expect("feed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let batch = activity.try_recv().expect("voice activity");
        assert_eq!(batch.track_id, "mic");
        assert_eq!(batch.ssrc, 4321);
        assert!(!batch.audio_levels.is_empty());
        assert!(batch.audio_levels.iter().all(|level| level.audio_level == 20));
        assert_eq!(
            messages.taken().first(),
            Some(&ClientMessage::VadStarted {
                ssrc: 4321,
                client_id: "alice".to_owned()
            })
        );
    }
}
