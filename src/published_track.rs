use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::{Mutex, RwLock};
use webrtc::{api::media_engine::MIME_TYPE_VP9, rtp_transceiver::rtp_codec::RTCRtpCodecCapability};

use crate::{
    config::{MediaKind, Rid, SourceType},
    error::{Error, StateErrorKind},
    forwarder::ClientTrackForwarder,
    remote_track::{OnEndedFn, PacketHandler, RemoteTrack},
    rtp::{audio_level, pool::PooledPacket},
    vad::VoiceDetector,
};

/// Identity of a track as announced by its publisher.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: String,
    pub stream_id: String,
    pub client_id: String,
    pub capability: RTCRtpCodecCapability,
    pub source_type: SourceType,
}

/// A logical media source of one publisher, grouping up to three simulcast layers.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PublishedTrack {
    pub id: String,
    pub stream_id: String,
    pub client_id: String,
    pub kind: MediaKind,
    pub capability: RTCRtpCodecCapability,
    pub is_scalable: bool,
    is_screen: AtomicBool,
    layers: ArcSwap<Vec<Arc<RemoteTrack>>>,
    forwarders: ArcSwap<Vec<Arc<ClientTrackForwarder>>>,
    mutation: Mutex<()>,
    voice: Option<VoiceDetector>,
    ended: AtomicBool,
    #[derivative(Debug = "ignore")]
    on_ended_fns: Mutex<Vec<OnEndedFn>>,
}

impl PublishedTrack {
    pub fn new(info: TrackInfo, voice: Option<VoiceDetector>) -> Arc<Self> {
        let kind = MediaKind::from_mime_type(&info.capability.mime_type);
        let is_scalable = info.capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9);
        tracing::debug!(
            "PublishedTrack id={} client_id={} kind={} is created",
            info.id,
            info.client_id,
            kind
        );
        Arc::new(Self {
            id: info.id,
            stream_id: info.stream_id,
            client_id: info.client_id,
            kind,
            capability: info.capability,
            is_scalable,
            is_screen: AtomicBool::new(info.source_type == SourceType::Screen),
            layers: ArcSwap::from_pointee(Vec::new()),
            forwarders: ArcSwap::from_pointee(Vec::new()),
            mutation: Mutex::new(()),
            voice,
            ended: AtomicBool::new(false),
            on_ended_fns: Mutex::new(Vec::new()),
        })
    }

    pub fn mime_type(&self) -> &str {
        &self.capability.mime_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.capability.clock_rate
    }

    pub fn source_type(&self) -> SourceType {
        if self.is_screen.load(Ordering::Relaxed) {
            SourceType::Screen
        } else {
            SourceType::Media
        }
    }

    pub fn set_source_type(&self, source_type: SourceType) {
        self.is_screen
            .store(source_type == SourceType::Screen, Ordering::Relaxed);
    }

    pub fn is_simulcast(&self) -> bool {
        self.layers.load().len() > 1
    }

    /// Adds a layer stream and starts reading it. The track ends once every layer has ended.
    pub async fn add_layer(self: &Arc<Self>, layer: Arc<RemoteTrack>) -> Result<(), Error> {
        {
            let _guard = self.mutation.lock().await;
            let current = self.layers.load();
            if current.iter().any(|l| l.rid == layer.rid) {
                return Err(Error::new_state(
                    format!("track {} already has layer {}", self.id, layer.rid),
                    StateErrorKind::TrackExists,
                ));
            }
            let mut next = current.as_ref().clone();
            next.push(Arc::clone(&layer));
            next.sort_by_key(|l| l.rid);
            self.layers.store(Arc::new(next));
        }

        let weak: Weak<PublishedTrack> = Arc::downgrade(self);
        layer
            .on_ended(Box::new(move || {
                if let Some(track) = weak.upgrade() {
                    tokio::spawn(async move {
                        track.layer_ended().await;
                    });
                }
            }))
            .await;
        layer.start(Arc::clone(self) as Arc<dyn PacketHandler>);
        tracing::debug!(
            "PublishedTrack id={} added layer rid={} ssrc={}",
            self.id,
            layer.rid,
            layer.ssrc
        );
        Ok(())
    }

    pub fn layer(&self, rid: Rid) -> Option<Arc<RemoteTrack>> {
        self.layers.load().iter().find(|l| l.rid == rid).cloned()
    }

    /// Layers currently published, lowest first.
    pub fn rids(&self) -> Vec<Rid> {
        self.layers.load().iter().map(|l| l.rid).collect()
    }

    pub fn receive_bitrate(&self, rid: Rid) -> u32 {
        self.layer(rid).map(|l| l.bitrate()).unwrap_or(0)
    }

    /// Requests a keyframe on `rid`, or on the only layer of a single-layer track.
    pub fn send_pli(&self, rid: Rid) -> bool {
        let layers = self.layers.load();
        let layer = layers
            .iter()
            .find(|l| l.rid == rid)
            .or_else(|| if layers.len() == 1 { layers.first() } else { None });
        match layer {
            Some(layer) => layer.send_pli(),
            None => {
                tracing::trace!("PublishedTrack id={} has no layer {} for pli", self.id, rid);
                false
            }
        }
    }

    pub async fn add_forwarder(&self, forwarder: Arc<ClientTrackForwarder>) {
        let _guard = self.mutation.lock().await;
        let mut next = self.forwarders.load().as_ref().clone();
        next.push(forwarder);
        self.forwarders.store(Arc::new(next));
    }

    pub async fn remove_forwarder(&self, forwarder_id: &str) -> Option<Arc<ClientTrackForwarder>> {
        let _guard = self.mutation.lock().await;
        let current = self.forwarders.load();
        let removed = current.iter().find(|f| f.id == forwarder_id).cloned();
        if removed.is_some() {
            let next: Vec<_> = current
                .iter()
                .filter(|f| f.id != forwarder_id)
                .cloned()
                .collect();
            self.forwarders.store(Arc::new(next));
        }
        removed
    }

    pub fn forwarders(&self) -> Vec<Arc<ClientTrackForwarder>> {
        self.forwarders.load().as_ref().clone()
    }

    /// Registers `f` to run once when the track ends. Runs immediately if it already has.
    pub async fn on_ended(&self, f: OnEndedFn) {
        let mut callbacks = self.on_ended_fns.lock().await;
        if self.ended.load(Ordering::Acquire) {
            drop(callbacks);
            f();
            return;
        }
        callbacks.push(f);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    async fn layer_ended(&self) {
        if self.layers.load().iter().all(|l| l.is_ended()) {
            self.end().await;
        }
    }

    /// Stops every layer reader; forwarders are closed once the readers report the end.
    pub async fn close(&self) {
        let layers = self.layers.load();
        if layers.is_empty() {
            self.end().await;
            return;
        }
        for layer in layers.iter() {
            layer.close();
        }
    }

    /// Ends the track: forwarders stop and close their outbound tracks, then `on_ended` callbacks run.
    pub async fn end(&self) {
        let callbacks = {
            let mut callbacks = self.on_ended_fns.lock().await;
            if self.ended.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        if let Some(voice) = &self.voice {
            voice.stop();
        }
        for layer in self.layers.load().iter() {
            layer.close();
        }
        for forwarder in self.forwarders.swap(Arc::new(Vec::new())).iter() {
            forwarder.close().await;
        }
        tracing::debug!("PublishedTrack id={} has ended", self.id);
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl PacketHandler for PublishedTrack {
    async fn on_read(&self, packet: PooledPacket, layer: crate::config::Rid) {
        if let Some(voice) = &self.voice {
            if let Some((level, is_voice)) = audio_level::from_attributes(packet.attributes()) {
                voice.add_packet(packet.header(), level, is_voice);
            }
        }

        let forwarders = self.forwarders.load();
        for forwarder in forwarders.iter() {
            match packet.retain() {
                Ok(retained) => forwarder.push(retained, layer).await,
                Err(err) => {
                    tracing::trace!("PublishedTrack id={} failed to retain packet: {}", self.id, err);
                    break;
                }
            }
        }
    }
}

impl Drop for PublishedTrack {
    fn drop(&mut self) {
        tracing::debug!("PublishedTrack id={} is dropped", self.id);
    }
}

/// Published tracks of a room, keyed by track ID.
#[derive(Debug, Default)]
pub struct TrackRegistry {
    tracks: RwLock<HashMap<String, Arc<PublishedTrack>>>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, track: Arc<PublishedTrack>) -> Result<(), Error> {
        let mut tracks = self.tracks.write().await;
        if tracks.contains_key(&track.id) {
            return Err(Error::new_state(
                format!("track {} is already published", track.id),
                StateErrorKind::TrackExists,
            ));
        }
        tracks.insert(track.id.clone(), track);
        Ok(())
    }

    pub async fn remove(&self, track_id: &str) -> Result<Arc<PublishedTrack>, Error> {
        self.tracks.write().await.remove(track_id).ok_or(Error::new_state(
            format!("track {} is not published", track_id),
            StateErrorKind::TrackNotFound,
        ))
    }

    pub async fn get(&self, track_id: &str) -> Result<Arc<PublishedTrack>, Error> {
        self.tracks
            .read()
            .await
            .get(track_id)
            .cloned()
            .ok_or(Error::new_state(
                format!("track {} is not published", track_id),
                StateErrorKind::TrackNotFound,
            ))
    }

    pub async fn all(&self) -> Vec<Arc<PublishedTrack>> {
        self.tracks.read().await.values().cloned().collect()
    }

    pub async fn by_client(&self, client_id: &str) -> Vec<Arc<PublishedTrack>> {
        self.tracks
            .read()
            .await
            .values()
            .filter(|t| t.client_id == client_id)
            .cloned()
            .collect()
    }

    /// Tracks a client may subscribe to: everything not published by itself.
    pub async fn others(&self, client_id: &str) -> Vec<Arc<PublishedTrack>> {
        self.tracks
            .read()
            .await
            .values()
            .filter(|t| t.client_id != client_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.tracks.read().await.len()
    }
}
