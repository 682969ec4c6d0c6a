use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::API,
    data_channel::{data_channel_message::DataChannelMessage, RTCDataChannel},
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{
        configuration::RTCConfiguration, offer_answer_options::RTCOfferOptions,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate,
    rtp_transceiver::rtp_receiver::RTCRtpReceiver,
    track::track_remote::TrackRemote,
};

use crate::{
    codec::AUDIO_LEVEL_URI,
    config::{SessionConfig, SourceType},
    data_channel::DataChannelSink,
    error::{Error, FatalErrorKind, StateErrorKind},
    published_track::{PublishedTrack, TrackInfo},
    room::Room,
    session::SubscriberSession,
    transport::{LocalTrackSink, RemoteTrackSource, RtcpPacket, RtcpReceiver, RtcpSender, RtpSink, TrackSinkFactory},
};

pub type OnIceCandidateFn = Box<dyn Fn(RTCIceCandidate) + Send + Sync>;
/// Receives the offer the server created and expects the client to answer with [`PeerTransport::set_answer`].
pub type OnRenegotiationFn = Box<dyn Fn(RTCSessionDescription) + Send + Sync>;

/// One client's [`webrtc::peer_connection::RTCPeerConnection`]. Tracks the client sends are
/// published to its room, tracks of other clients are added to it as outbound tracks.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerTransport {
    pub id: String,
    peer_connection: Arc<RTCPeerConnection>,
    room: Arc<Mutex<Room>>,
    session: Mutex<Option<Arc<SubscriberSession>>>,
    config: SessionConfig,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    // Publisher feedback, written to the peer connection.
    rtcp_sender: RtcpSender,
    // Subscriber feedback, routed to the session.
    subscriber_rtcp_sender: RtcpSender,
    #[derivative(Debug = "ignore")]
    on_ice_candidate_fn: Arc<Mutex<OnIceCandidateFn>>,
    #[derivative(Debug = "ignore")]
    on_renegotiation_fn: Arc<Mutex<Option<OnRenegotiationFn>>>,
    negotiation_pending: AtomicBool,
    ice_restart_pending: AtomicBool,
    cancel: CancellationToken,
}

impl PeerTransport {
    /// Creates the peer connection and joins `client_id` to `room`.
    pub async fn new(
        client_id: String,
        room: Arc<Mutex<Room>>,
        api: &API,
        rtc_config: RTCConfiguration,
        config: SessionConfig,
    ) -> Result<Arc<Self>, Error> {
        let peer_connection = api.new_peer_connection(rtc_config).await.map_err(|err| {
            Error::new_fatal(
                format!("failed to create peer connection: {}", err),
                FatalErrorKind::TransportConstruction,
            )
        })?;
        let (rtcp_sender, rtcp_receiver) = mpsc::unbounded_channel();
        let (subscriber_rtcp_sender, subscriber_rtcp_receiver) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            id: client_id.clone(),
            peer_connection: Arc::new(peer_connection),
            room: Arc::clone(&room),
            session: Mutex::new(None),
            config,
            pending_candidates: Mutex::new(Vec::new()),
            rtcp_sender,
            subscriber_rtcp_sender,
            on_ice_candidate_fn: Arc::new(Mutex::new(Box::new(|_| {}))),
            on_renegotiation_fn: Arc::new(Mutex::new(None)),
            negotiation_pending: AtomicBool::new(false),
            ice_restart_pending: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let session = room
            .lock()
            .await
            .add_client(&client_id, Arc::clone(&transport) as Arc<dyn TrackSinkFactory>)
            .await?;
        *transport.session.lock().await = Some(Arc::clone(&session));

        transport.rtcp_writer_loop(rtcp_receiver);
        transport.subscriber_rtcp_loop(session, subscriber_rtcp_receiver);
        transport.peer_hooks();

        tracing::debug!("PeerTransport {} is created", transport.id);
        Ok(transport)
    }

    pub async fn session(&self) -> Option<Arc<SubscriberSession>> {
        self.session.lock().await.clone()
    }

    /// Sets the client's offer and creates the answer for it. Without trickle ICE the answer
    /// carries every gathered candidate.
    pub async fn get_answer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription, Error> {
        if self.peer_connection.signaling_state() != RTCSignalingState::Stable {
            return Err(Error::new_state(
                format!("signaling state is {}", self.peer_connection.signaling_state()),
                StateErrorKind::NegotiationNotRequested,
            ));
        }
        self.peer_connection.set_remote_description(offer).await?;
        self.add_pending_candidates().await;

        let answer = self.peer_connection.create_answer(None).await?;
        let mut gathered = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(answer).await?;
        if !self.config.ice_trickle {
            let _ = gathered.recv().await;
        }
        self.peer_connection.local_description().await.ok_or_else(|| {
            Error::new_fatal(
                "failed to set local description".to_string(),
                FatalErrorKind::TransportConstruction,
            )
        })
    }

    /// Creates a new offer for the client, for example after outbound tracks were added.
    pub async fn renegotiate(&self) -> Result<(), Error> {
        self.send_offer(false).await
    }

    /// Starts an ICE restart. Outbound media pauses until the client answers.
    pub async fn restart_ice(&self) -> Result<(), Error> {
        if let Some(session) = self.session().await {
            session.restart()?;
        }
        self.send_offer(true).await
    }

    async fn send_offer(&self, ice_restart: bool) -> Result<(), Error> {
        let callback = self.on_renegotiation_fn.lock().await;
        let Some(callback) = callback.as_ref() else {
            return Err(Error::new_state(
                format!("transport {} has no renegotiation callback", self.id),
                StateErrorKind::RenegotiationCallbackMissing,
            ));
        };
        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                ice_restart,
                ..Default::default()
            }))
            .await?;
        self.peer_connection.set_local_description(offer).await?;
        let offer = self.peer_connection.local_description().await.ok_or_else(|| {
            Error::new_fatal(
                "failed to set local description".to_string(),
                FatalErrorKind::TransportConstruction,
            )
        })?;
        if ice_restart {
            self.ice_restart_pending.store(true, Ordering::Release);
        }
        self.negotiation_pending.store(true, Ordering::Release);
        (callback)(offer);
        Ok(())
    }

    /// Completes a negotiation the server started. The answer to an ICE restart resumes outbound media.
    pub async fn set_answer(&self, answer: RTCSessionDescription) -> Result<(), Error> {
        if !self.negotiation_pending.swap(false, Ordering::AcqRel) {
            return Err(Error::new_state(
                format!("transport {} did not send an offer", self.id),
                StateErrorKind::NegotiationNotRequested,
            ));
        }
        self.peer_connection.set_remote_description(answer).await?;
        self.add_pending_candidates().await;

        if self.ice_restart_pending.swap(false, Ordering::AcqRel) {
            if let Some(session) = self.session().await {
                // Already active when the connection state change got there first.
                if let Err(err) = session.resume() {
                    tracing::debug!("PeerTransport {} ICE restart answered: {}", self.id, err);
                }
            }
        }
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("PeerTransport {} queues ICE candidate", self.id);
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    async fn add_pending_candidates(&self) {
        let candidates = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in candidates {
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("PeerTransport {} failed to add ICE candidate: {}", self.id, err);
            }
        }
    }

    fn rtcp_writer_loop(&self, mut rtcp_receiver: RtcpReceiver) {
        let pc = Arc::clone(&self.peer_connection);
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            tracing::debug!("PeerTransport {} RTCP writer loop started", id);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    data = rtcp_receiver.recv() => {
                        let Some(data) = data else {
                            break;
                        };
                        if let Err(err) = pc.write_rtcp(&[data]).await {
                            tracing::error!("PeerTransport {} failed to write RTCP: {}", id, err);
                        }
                    }
                }
            }
            tracing::debug!("PeerTransport {} RTCP writer loop stopped", id);
        });
    }

    fn subscriber_rtcp_loop(&self, session: Arc<SubscriberSession>, mut receiver: RtcpReceiver) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = receiver.recv() => {
                        let Some(packet) = packet else {
                            break;
                        };
                        on_subscriber_rtcp(&session, packet).await;
                    }
                }
            }
        });
    }

    fn peer_hooks(self: &Arc<Self>) {
        let peer = Arc::clone(&self.peer_connection);

        let on_ice_candidate = Arc::clone(&self.on_ice_candidate_fn);
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((on_ice_candidate) async move {
                if let Some(candidate) = candidate {
                    tracing::debug!("on ice candidate: {}", candidate);
                    let locked = on_ice_candidate.lock().await;
                    (locked)(candidate);
                }
            }))
        }));

        let weak = Arc::downgrade(self);
        peer.on_negotiation_needed(Box::new(enc!((weak) move || {
            Box::pin(enc!((weak) async move {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = transport.renegotiate().await {
                    tracing::warn!("PeerTransport {} could not renegotiate: {}", transport.id, err);
                }
            }))
        })));

        peer.on_track(Box::new(enc!((weak) move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver| {
            Box::pin(enc!((weak) async move {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = transport.publish(track, receiver).await {
                    tracing::error!("PeerTransport {} failed to publish track: {}", transport.id, err);
                }
            }))
        })));

        peer.on_peer_connection_state_change(Box::new(enc!((weak) move |state: RTCPeerConnectionState| {
            Box::pin(enc!((weak) async move {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                transport.on_connection_state(state).await;
            }))
        })));

        peer.on_data_channel(Box::new(enc!((weak) move |dc: Arc<RTCDataChannel>| {
            Box::pin(enc!((weak) async move {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                transport.attach_data_channel(dc).await;
            }))
        })));
    }

    async fn publish(&self, track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>) -> Result<Arc<PublishedTrack>, Error> {
        tracing::info!(
            "PeerTransport {} track published: track_id={}, ssrc={}, rid={}",
            self.id,
            track.id(),
            track.ssrc(),
            track.rid()
        );
        let audio_level_extension_id = receiver
            .get_parameters()
            .await
            .header_extensions
            .iter()
            .find(|extension| extension.uri == AUDIO_LEVEL_URI)
            .and_then(|extension| u8::try_from(extension.id).ok());
        let info = TrackInfo {
            id: track.id(),
            stream_id: track.stream_id(),
            client_id: self.id.clone(),
            capability: track.codec().capability,
            source_type: SourceType::Media,
        };
        let source = Arc::new(RemoteTrackSource::new(track));
        let room = self.room.lock().await;
        room.publish_track(
            &self.id,
            info,
            source,
            self.rtcp_sender.clone(),
            audio_level_extension_id,
        )
        .await
    }

    async fn on_connection_state(&self, state: RTCPeerConnectionState) {
        tracing::debug!("PeerTransport {} connection state changed: {}", self.id, state);
        let Some(session) = self.session().await else {
            return;
        };
        match state {
            RTCPeerConnectionState::Connected => {
                if let Err(err) = session.activate() {
                    tracing::debug!("PeerTransport {} connected: {}", self.id, err);
                }
            }
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => session.end().await,
            _ => {}
        }
    }

    async fn attach_data_channel(&self, dc: Arc<RTCDataChannel>) {
        let Some(session) = self.session().await else {
            return;
        };
        tracing::info!("PeerTransport {} data channel label={} is opened", self.id, dc.label());
        session
            .set_message_sink(Arc::new(DataChannelSink::new(Arc::clone(&dc))))
            .await;
        let id = self.id.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            Box::pin(enc!((session, id) async move {
                if !message.is_string {
                    return;
                }
                let text = String::from_utf8_lossy(&message.data).to_string();
                if let Err(err) = session.on_message(&text).await {
                    tracing::warn!("PeerTransport {} rejected message: {}", id, err);
                }
            }))
        }));
    }

    // Hooks
    /// Set callback function when the [`webrtc::peer_connection::RTCPeerConnection`] receives `on_ice_candidate` events.
    pub async fn on_ice_candidate(&self, f: OnIceCandidateFn) {
        let mut callback = self.on_ice_candidate_fn.lock().await;
        *callback = f;
    }

    /// Set callback function receiving server-side offers.
    pub async fn on_renegotiation(&self, f: OnRenegotiationFn) {
        let mut callback = self.on_renegotiation_fn.lock().await;
        *callback = Some(f);
    }

    /// Leaves the room and closes the peer connection.
    pub async fn close(&self) -> Result<(), Error> {
        self.cancel.cancel();
        if let Some(session) = self.session.lock().await.take() {
            session.end().await;
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Bandwidth estimates arrive as REMB, the rest is handled by the session.
async fn on_subscriber_rtcp(session: &SubscriberSession, packet: RtcpPacket) {
    if let Some(remb) = packet
        .as_any()
        .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
    {
        session.on_bandwidth_estimate(remb.bitrate as u64).await;
        return;
    }
    session.on_rtcp(&packet);
}

#[async_trait]
impl TrackSinkFactory for PeerTransport {
    async fn create_sink(&self, track: &PublishedTrack) -> Result<Arc<dyn RtpSink>, Error> {
        let sink = LocalTrackSink::new(
            Arc::clone(&self.peer_connection),
            track.capability.clone(),
            track.id.clone(),
            track.stream_id.clone(),
        )
        .await?;
        sink.spawn_rtcp_reader(self.subscriber_rtcp_sender.clone(), self.cancel.child_token());
        Ok(Arc::new(sink))
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::debug!("PeerTransport {} is dropped", self.id);
    }
}
