use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use webrtc::interceptor::Attributes;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use crate::{
    config::Rid,
    error::Error,
    rtp::{
        self, audio_level,
        bitrate::BitrateMeter,
        jitter::ReorderBuffer,
        pool::{PacketPool, PooledPacket},
    },
    transport::{RtcpSender, RtpSource},
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const PLI_DEBOUNCE: Duration = Duration::from_millis(250);
const RECEIVE_MTU: usize = 1500;
const NEVER: u64 = u64::MAX;

/// Receives every packet read off a [`RemoteTrack`], on the reader task.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// The handler owns `packet` and must retain it for anything that outlives the call.
    async fn on_read(&self, packet: PooledPacket, layer: Rid);
}

pub type OnEndedFn = Box<dyn FnOnce() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RemoteTrackOptions {
    pub audio_level_extension_id: Option<u8>,
    /// `Some((min_wait, max_wait))` enables the reorder buffer.
    pub reorder: Option<(Duration, Duration)>,
    /// The stream ends after this long without a packet. `None` waits for EOF.
    pub idle_timeout: Option<Duration>,
}

/// Reader of one inbound layer stream of a published track.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RemoteTrack {
    pub ssrc: u32,
    pub rid: Rid,
    source: Arc<dyn RtpSource>,
    #[derivative(Debug = "ignore")]
    pool: Arc<PacketPool>,
    rtcp_sender: RtcpSender,
    options: RemoteTrackOptions,
    created_at: Instant,
    last_pli_ms: AtomicU64,
    last_packet_ms: AtomicU64,
    bitrate: BitrateMeter,
    last_sequence: AtomicU64,
    read_timeouts: AtomicU64,
    read_errors: AtomicU64,
    malformed: AtomicU64,
    ended: AtomicBool,
    #[derivative(Debug = "ignore")]
    on_ended_fns: Mutex<Vec<OnEndedFn>>,
    cancel: CancellationToken,
}

impl RemoteTrack {
    pub fn new(
        source: Arc<dyn RtpSource>,
        pool: Arc<PacketPool>,
        rtcp_sender: RtcpSender,
        options: RemoteTrackOptions,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let ssrc = source.ssrc();
        let rid = source.rid();
        tracing::debug!("RemoteTrack ssrc={} rid={} is created", ssrc, rid);
        Arc::new(Self {
            ssrc,
            rid,
            source,
            pool,
            rtcp_sender,
            options,
            created_at: Instant::now(),
            last_pli_ms: AtomicU64::new(NEVER),
            last_packet_ms: AtomicU64::new(0),
            bitrate: BitrateMeter::new(),
            last_sequence: AtomicU64::new(NEVER),
            read_timeouts: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            ended: AtomicBool::new(false),
            on_ended_fns: Mutex::new(Vec::new()),
            cancel,
        })
    }

    /// Spawns the reader task. Packets go to `handler` one at a time, in arrival order.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn PacketHandler>) {
        let track = Arc::clone(self);
        tokio::spawn(async move {
            track.read_loop(handler).await;
            track.end().await;
        });
    }

    async fn read_loop(&self, handler: Arc<dyn PacketHandler>) {
        tracing::debug!(
            "RemoteTrack ssrc={} rid={} read loop has started",
            self.ssrc,
            self.rid
        );

        let mut buf = vec![0u8; RECEIVE_MTU];
        let mut reorder = self
            .options
            .reorder
            .map(|(min_wait, max_wait)| ReorderBuffer::new(min_wait, max_wait));
        let poll_every = reorder
            .as_ref()
            .map(|r| r.poll_interval())
            .unwrap_or(READ_TIMEOUT);
        let mut reorder_tick = tokio::time::interval(poll_every);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break;
                }
                _ = reorder_tick.tick(), if reorder.is_some() => {
                    if let Some(reorder) = reorder.as_mut() {
                        for packet in reorder.poll(Instant::now()) {
                            handler.on_read(packet, self.rid).await;
                        }
                    }
                    if self.is_idle() {
                        break;
                    }
                }
                res = timeout(READ_TIMEOUT, self.source.read(&mut buf)) => {
                    match res {
                        Err(_elapsed) => {
                            self.read_timeouts.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!("RemoteTrack ssrc={} read timed out", self.ssrc);
                            if self.is_idle() {
                                break;
                            }
                        }
                        Ok(Err(err)) if err.is_terminal() => {
                            tracing::debug!("RemoteTrack ssrc={} reached end of stream: {}", self.ssrc, err);
                            break;
                        }
                        Ok(Err(err)) => {
                            self.read_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!("RemoteTrack ssrc={} failed to read rtp: {}", self.ssrc, err);
                            if self.is_idle() {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                        Ok(Ok(n)) => {
                            self.last_packet_ms.store(self.now_ms(), Ordering::Relaxed);
                            let packet = match self.ingest(&buf[..n]) {
                                Ok(packet) => packet,
                                Err(err) => {
                                    self.malformed.fetch_add(1, Ordering::Relaxed);
                                    tracing::trace!("RemoteTrack ssrc={} dropped packet: {}", self.ssrc, err);
                                    continue;
                                }
                            };
                            match reorder.as_mut() {
                                Some(reorder) => {
                                    for packet in reorder.push(packet, Instant::now()) {
                                        handler.on_read(packet, self.rid).await;
                                    }
                                }
                                None => handler.on_read(packet, self.rid).await,
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "RemoteTrack ssrc={} rid={} read loop has finished",
            self.ssrc,
            self.rid
        );
    }

    /// Turns one raw datagram into a pooled packet.
    fn ingest(&self, raw: &[u8]) -> Result<PooledPacket, Error> {
        let header_len = rtp::header_len(raw)?;
        let end = rtp::payload_end(raw, header_len)?;
        self.bitrate.record(raw.len());

        let mut packet =
            self.pool
                .acquire(&raw[..header_len], &raw[header_len..end], &Attributes::new())?;
        if let Some(id) = self.options.audio_level_extension_id {
            let header = packet.header().clone();
            if let Some(attributes) = packet.attributes_mut() {
                audio_level::read_into(&header, id, attributes);
            }
        }
        self.last_sequence
            .store(packet.header().sequence_number as u64, Ordering::Relaxed);
        Ok(packet)
    }

    /// Requests a keyframe from the publisher, at most once per 250 ms. Returns whether a PLI went out.
    pub fn send_pli(&self) -> bool {
        let now_ms = self.now_ms();
        let last = self.last_pli_ms.load(Ordering::Acquire);
        if last != NEVER && now_ms.saturating_sub(last) < PLI_DEBOUNCE.as_millis() as u64 {
            return false;
        }
        if self
            .last_pli_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match self.rtcp_sender.send(Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
        })) {
            Ok(_) => {
                tracing::trace!("RemoteTrack ssrc={} sent pli", self.ssrc);
                true
            }
            Err(err) => {
                tracing::error!("RemoteTrack ssrc={} failed to send pli: {}", self.ssrc, err);
                false
            }
        }
    }

    /// Sends a PLI every `interval` until the track ends.
    pub fn enable_interval_pli(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let cancel = self.cancel.clone();
        let track = Arc::clone(self);
        tokio::spawn(enc!((cancel) async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if track.is_ended() {
                            break;
                        }
                        track.send_pli();
                    }
                }
            }
        }));
    }

    /// Forwards an RTCP packet (for example a NACK) towards the publisher.
    pub fn send_rtcp(&self, packet: crate::transport::RtcpPacket) {
        if let Err(err) = self.rtcp_sender.send(packet) {
            tracing::error!("RemoteTrack ssrc={} failed to send rtcp: {}", self.ssrc, err);
        }
    }

    /// Registers `f` to run once when the stream ends. Runs immediately if it already has.
    pub async fn on_ended(&self, f: OnEndedFn) {
        let mut callbacks = self.on_ended_fns.lock().await;
        if self.ended.load(Ordering::Acquire) {
            drop(callbacks);
            f();
            return;
        }
        callbacks.push(f);
    }

    async fn end(&self) {
        let callbacks = {
            let mut callbacks = self.on_ended_fns.lock().await;
            if self.ended.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        self.cancel.cancel();
        tracing::debug!("RemoteTrack ssrc={} has ended", self.ssrc);
        for callback in callbacks {
            callback();
        }
    }

    /// Stops the reader. `on_ended` callbacks still fire.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate.bitrate()
    }

    pub fn read_timeouts(&self) -> u64 {
        self.read_timeouts.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    /// Time since the last datagram, or since creation when none arrived.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(
            self.now_ms()
                .saturating_sub(self.last_packet_ms.load(Ordering::Relaxed)),
        )
    }

    fn is_idle(&self) -> bool {
        match self.options.idle_timeout {
            Some(idle_timeout) if self.idle_for() >= idle_timeout => {
                tracing::debug!(
                    "RemoteTrack ssrc={} rid={} is idle for {:?}",
                    self.ssrc,
                    self.rid,
                    idle_timeout
                );
                true
            }
            _ => false,
        }
    }

    pub fn malformed_packets(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn last_sequence(&self) -> Option<u16> {
        match self.last_sequence.load(Ordering::Relaxed) {
            NEVER => None,
            seq => Some(seq as u16),
        }
    }

    fn now_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.created_at)
            .as_millis() as u64
    }
}

impl Drop for RemoteTrack {
    fn drop(&mut self) {
        tracing::debug!("RemoteTrack ssrc={} is dropped", self.ssrc);
    }
}
