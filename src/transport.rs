use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::{
    peer_connection::RTCPeerConnection,
    rtcp,
    rtp,
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, rtp_sender::RTCRtpSender},
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};
use webrtc_util::marshal::Marshal;

use crate::{
    config::Rid,
    error::{Error, IoErrorKind, PacketErrorKind},
    published_track::PublishedTrack,
};

pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;
pub type RtcpSender = mpsc::UnboundedSender<RtcpPacket>;
pub type RtcpReceiver = mpsc::UnboundedReceiver<RtcpPacket>;

/// One inbound RTP stream, as delivered by the media transport.
#[async_trait]
pub trait RtpSource: Send + Sync + Debug {
    fn ssrc(&self) -> u32;
    fn rid(&self) -> Rid;
    /// Reads one raw RTP packet into `buf`. An `Eof` error ends the stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, Error>;
}

/// One outbound RTP track towards a subscriber.
#[async_trait]
pub trait RtpSink: Send + Sync + Debug {
    /// SSRC the subscriber sees, used to route its RTCP feedback.
    fn ssrc(&self) -> u32;
    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize, Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Creates outbound tracks on a subscriber's transport.
#[async_trait]
pub trait TrackSinkFactory: Send + Sync + Debug {
    async fn create_sink(&self, track: &PublishedTrack) -> Result<Arc<dyn RtpSink>, Error>;
}

/// [`RtpSource`] over a webrtc-rs remote track.
#[derive(Debug)]
pub struct RemoteTrackSource {
    track: Arc<TrackRemote>,
}

impl RemoteTrackSource {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl RtpSource for RemoteTrackSource {
    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn rid(&self) -> Rid {
        Rid::from_rid(&self.track.rid())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let (mut packet, _attributes) = self.track.read_rtp().await.map_err(map_read_error)?;
        // The depacketizer already removed padding.
        packet.header.padding = false;
        packet.marshal_to(buf).map_err(|err| {
            Error::new_packet(
                format!("packet does not fit read buffer: {}", err),
                PacketErrorKind::ShortBuffer,
            )
        })
    }
}

pub(crate) fn map_read_error(err: webrtc::Error) -> Error {
    match err {
        webrtc::Error::ErrClosedPipe | webrtc::Error::ErrDataChannelNotOpen => {
            Error::new_io(err.to_string(), IoErrorKind::Eof)
        }
        webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
            webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed),
        )) => Error::new_io("SRTP buffer closed".to_string(), IoErrorKind::Eof),
        err => Error::from(err),
    }
}

/// [`RtpSink`] over a webrtc-rs local track added to a subscriber's peer connection.
#[derive(Debug)]
pub struct LocalTrackSink {
    track: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
    peer_connection: Arc<RTCPeerConnection>,
    ssrc: u32,
}

impl LocalTrackSink {
    pub async fn new(
        peer_connection: Arc<RTCPeerConnection>,
        capability: RTCRtpCodecCapability,
        track_id: String,
        stream_id: String,
    ) -> Result<Self, Error> {
        let track = Arc::new(TrackLocalStaticRTP::new(capability, track_id, stream_id));
        let sender = peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let ssrc = sender
            .get_parameters()
            .await
            .encodings
            .first()
            .map(|encoding| encoding.ssrc)
            .unwrap_or_default();

        tracing::debug!("LocalTrackSink id={} ssrc={} is created", track.id(), ssrc);

        Ok(Self {
            track,
            sender,
            peer_connection,
            ssrc,
        })
    }

    /// Forwards RTCP read from this sender to `rtcp_sender` until cancelled or the sender closes.
    pub fn spawn_rtcp_reader(&self, rtcp_sender: RtcpSender, cancel: CancellationToken) {
        let sender = Arc::clone(&self.sender);
        let ssrc = self.ssrc;
        tokio::spawn(async move {
            tracing::debug!("LocalTrackSink ssrc={} RTCP reader has started", ssrc);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = sender.read_rtcp() => {
                        match res {
                            Ok((packets, _attributes)) => {
                                for packet in packets {
                                    if rtcp_sender.send(packet).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(webrtc::Error::ErrClosedPipe) | Err(webrtc::Error::ErrDataChannelNotOpen) => break,
                            Err(err) => {
                                tracing::error!("LocalTrackSink ssrc={} failed to read rtcp: {}", ssrc, err);
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!("LocalTrackSink ssrc={} RTCP reader has finished", ssrc);
        });
    }
}

#[async_trait]
impl RtpSink for LocalTrackSink {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize, Error> {
        self.track.write_rtp(packet).await.map_err(|err| match err {
            webrtc::Error::ErrClosedPipe => Error::new_io(err.to_string(), IoErrorKind::Broken),
            err => Error::new_io(err.to_string(), IoErrorKind::WriteDropped),
        })
    }

    async fn close(&self) -> Result<(), Error> {
        self.peer_connection.remove_track(&self.sender).await?;
        Ok(())
    }
}

/// Downlink bandwidth estimates keyed by session.
///
/// Estimators are registered before the session asks for them, so an estimate that arrives
/// early is never lost: late readers observe the latest value of the watch channel.
#[derive(Debug, Default)]
pub struct BandwidthEstimatorRegistry {
    estimates: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl BandwidthEstimatorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the estimate channel for `session_id`, creating it seeded with `initial` bits/s.
    pub async fn register(&self, session_id: &str, initial: u64) -> watch::Receiver<u64> {
        let mut estimates = self.estimates.lock().await;
        estimates
            .entry(session_id.to_owned())
            .or_insert_with(|| watch::channel(initial).0)
            .subscribe()
    }

    pub async fn update(&self, session_id: &str, bitrate: u64) {
        let estimates = self.estimates.lock().await;
        match estimates.get(session_id) {
            Some(sender) => {
                sender.send_replace(bitrate);
            }
            None => tracing::trace!("no estimator registered for session {}", session_id),
        }
    }

    pub async fn remove(&self, session_id: &str) {
        self.estimates.lock().await.remove(session_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Source fed from a channel of raw packets; closing the channel reads as EOF.
    #[derive(Debug)]
    pub(crate) struct ChannelSource {
        ssrc: u32,
        rid: Rid,
        receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    impl ChannelSource {
        pub(crate) fn new(ssrc: u32, rid: Rid) -> (Arc<Self>, mpsc::UnboundedSender<Vec<u8>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    ssrc,
                    rid,
                    receiver: Mutex::new(rx),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl RtpSource for ChannelSource {
        fn ssrc(&self) -> u32 {
            self.ssrc
        }

        fn rid(&self) -> Rid {
            self.rid
        }

        async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
            match self.receiver.lock().await.recv().await {
                Some(raw) => {
                    buf[..raw.len()].copy_from_slice(&raw);
                    Ok(raw.len())
                }
                None => Err(Error::new_io("source closed".to_string(), IoErrorKind::Eof)),
            }
        }
    }

    /// Sink recording every written packet.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) ssrc: u32,
        pub(crate) packets: std::sync::Mutex<VecDeque<rtp::packet::Packet>>,
        pub(crate) failing: AtomicBool,
        pub(crate) closed: AtomicBool,
        pub(crate) attempts: AtomicUsize,
        /// Each write blocks this long before completing.
        pub(crate) stall: std::sync::Mutex<Option<std::time::Duration>>,
    }

    impl RecordingSink {
        pub(crate) fn new(ssrc: u32) -> Arc<Self> {
            Arc::new(Self {
                ssrc,
                ..Default::default()
            })
        }

        pub(crate) fn written(&self) -> Vec<rtp::packet::Packet> {
            self.packets
                .lock()
                .map(|packets| packets.iter().cloned().collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RtpSink for RecordingSink {
        fn ssrc(&self) -> u32 {
            self.ssrc
        }

        async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize, Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let stall = self.stall.lock().map(|stall| *stall).unwrap_or_default();
            if let Some(stall) = stall {
                tokio::time::sleep(stall).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::new_io("sink unavailable".to_string(), IoErrorKind::WriteDropped));
            }
            // Real tracks marshal on write, so keep a copy rather than the shared payload.
            if let Ok(mut packets) = self.packets.lock() {
                packets.push_back(rtp::packet::Packet {
                    header: packet.header.clone(),
                    payload: bytes::Bytes::copy_from_slice(&packet.payload),
                });
            }
            Ok(packet.payload.len())
        }

        async fn close(&self) -> Result<(), Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Factory handing out recording sinks with ssrcs 5000, 5001, ...
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSinkFactory {
        pub(crate) created: std::sync::Mutex<Vec<Arc<RecordingSink>>>,
    }

    impl RecordingSinkFactory {
        pub(crate) fn sinks(&self) -> Vec<Arc<RecordingSink>> {
            self.created
                .lock()
                .map(|created| created.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl TrackSinkFactory for RecordingSinkFactory {
        async fn create_sink(&self, _track: &PublishedTrack) -> Result<Arc<dyn RtpSink>, Error> {
            let mut created = self
                .created
                .lock()
                .map_err(|err| Error::new_io(err.to_string(), IoErrorKind::Broken))?;
            let sink = RecordingSink::new(5000 + created.len() as u32);
            created.push(Arc::clone(&sink));
            Ok(sink)
        }
    }

    #[tokio::test]
    async fn registry_keeps_estimate_for_late_subscribers() {
        let registry = BandwidthEstimatorRegistry::new();
        let early = registry.register("alice", 1_000_000).await;
        registry.update("alice", 2_500_000).await;

        let late = registry.register("alice", 1_000_000).await;
        assert_eq!(*late.borrow(), 2_500_000);
        assert_eq!(*early.borrow(), 2_500_000);

        registry.update("bob", 10).await;
        registry.remove("alice").await;
    }

    #[test]
    fn closed_pipe_maps_to_eof() {
        let err = map_read_error(webrtc::Error::ErrClosedPipe);
        assert!(err.is_terminal());
    }
}
