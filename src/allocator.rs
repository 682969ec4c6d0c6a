//! Per-subscriber bitrate allocation.
//!
//! Once a second, and whenever the forwarder set or the active speakers change, the allocator
//! splits the subscriber's downlink estimate between its forwarders. Audio is always forwarded.
//! Video is assigned greedily in priority order and then upgraded while headroom remains.
//! Tick-driven changes pass through [`Hysteresis`] so a noisy estimate does not flap layers.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::MIME_TYPE_RED,
    config::{BitrateConfig, MediaKind, QualityLevel, SourceType},
    forwarder::ClientTrackForwarder,
};

const TICK: Duration = Duration::from_secs(1);
/// Share of the estimate the greedy pass may spend, in percent.
const BUDGET_PERCENT: u64 = 90;
/// Headroom kept on top of the assigned total before an upgrade, in percent.
const HEADROOM_PERCENT: u64 = 110;
const DOWNGRADE_TICKS: u32 = 2;
const UPGRADE_TICKS: u32 = 3;

/// Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Screen,
    Speaking,
    Other,
}

/// What one forwarder asks of the allocator.
#[derive(Debug, Clone)]
pub struct Demand {
    pub kind: MediaKind,
    pub priority: Priority,
    pub send_bitrate: u32,
    pub max_quality: QualityLevel,
    /// Assignable qualities with their cost in bits/s, lowest first.
    pub options: Vec<(QualityLevel, u64)>,
}

impl Demand {
    fn cost(&self, quality: QualityLevel) -> u64 {
        self.options
            .iter()
            .find(|(q, _)| *q == quality)
            .map(|(_, cost)| *cost)
            .unwrap_or(0)
    }

    fn allowed(&self) -> impl DoubleEndedIterator<Item = &(QualityLevel, u64)> + '_ {
        let max = self.max_quality;
        self.options.iter().filter(move |(q, _)| *q <= max)
    }
}

/// Splits `bandwidth` bits/s between `demands`. The result is index-aligned with `demands`.
pub fn allocate(bandwidth: u64, demands: &[Demand]) -> Vec<QualityLevel> {
    let mut assigned = vec![QualityLevel::None; demands.len()];
    let mut audio_total = 0;
    for (i, demand) in demands.iter().enumerate() {
        if demand.kind == MediaKind::Audio {
            if let Some((quality, cost)) = demand.options.last() {
                assigned[i] = *quality;
                audio_total += cost;
            }
        }
    }
    if bandwidth < audio_total {
        return assigned;
    }

    let mut order: Vec<usize> = (0..demands.len())
        .filter(|i| demands[*i].kind == MediaKind::Video)
        .collect();
    order.sort_by_key(|i| (demands[*i].priority, demands[*i].send_bitrate, *i));

    let mut remaining = bandwidth * BUDGET_PERCENT / 100;
    let mut video_total = 0;
    for &i in &order {
        if let Some((quality, cost)) = demands[i].allowed().rev().find(|(_, cost)| *cost <= remaining) {
            assigned[i] = *quality;
            remaining -= cost;
            video_total += cost;
        }
    }

    for &i in order.iter().rev() {
        let current_cost = demands[i].cost(assigned[i]);
        let upgrade = demands[i]
            .allowed()
            .rev()
            .filter(|(quality, _)| *quality > assigned[i])
            .find(|(_, cost)| (video_total - current_cost + cost) * HEADROOM_PERCENT / 100 <= bandwidth);
        if let Some((quality, cost)) = upgrade {
            video_total = video_total - current_cost + cost;
            assigned[i] = *quality;
        }
    }

    assigned
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    upgrade: bool,
    ticks: u32,
}

/// Delays tick-driven quality changes: downgrades persist for two ticks, upgrades for three.
#[derive(Debug, Default)]
pub struct Hysteresis {
    pending: HashMap<String, Pending>,
    known: HashSet<String>,
}

impl Hysteresis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the quality to apply now for forwarder `id`, given its current target and this tick's proposal.
    pub fn on_tick(&mut self, id: &str, current: QualityLevel, proposed: QualityLevel) -> QualityLevel {
        if self.known.insert(id.to_owned()) || proposed == current {
            self.pending.remove(id);
            return proposed;
        }
        let upgrade = proposed > current;
        let pending = self
            .pending
            .entry(id.to_owned())
            .and_modify(|p| {
                if p.upgrade == upgrade {
                    p.ticks += 1;
                } else {
                    *p = Pending { upgrade, ticks: 1 };
                }
            })
            .or_insert(Pending { upgrade, ticks: 1 });
        let required = if upgrade { UPGRADE_TICKS } else { DOWNGRADE_TICKS };
        if pending.ticks >= required {
            self.pending.remove(id);
            proposed
        } else {
            current
        }
    }

    /// Whether the allocator has assigned `id` before.
    pub fn is_known(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    /// Records an assignment made outside the tick cadence, dropping any streak in progress.
    pub fn mark_known(&mut self, id: &str) {
        self.known.insert(id.to_owned());
        self.pending.remove(id);
    }

    pub fn retain(&mut self, ids: &HashSet<String>) {
        self.pending.retain(|id, _| ids.contains(id));
        self.known.retain(|id| ids.contains(id));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorEvent {
    /// Forwarders were added or removed.
    Reallocate,
    VoiceStarted { client_id: String },
    VoiceEnded { client_id: String },
}

/// What started an allocation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Tick,
    Event,
    /// The speaker set changed, so the priority order did.
    Priority,
}

/// The allocation task of one subscriber session.
#[derive(Debug)]
pub struct BitrateAllocator {
    session_id: String,
    forwarders: Arc<ArcSwap<Vec<Arc<ClientTrackForwarder>>>>,
    estimate: watch::Receiver<u64>,
    bitrates: BitrateConfig,
    levels: Vec<QualityLevel>,
    speaking: HashSet<String>,
    hysteresis: Hysteresis,
}

impl BitrateAllocator {
    /// Starts the allocator; it runs until `cancel` fires.
    pub fn spawn(
        session_id: String,
        forwarders: Arc<ArcSwap<Vec<Arc<ClientTrackForwarder>>>>,
        estimate: watch::Receiver<u64>,
        bitrates: BitrateConfig,
        levels: Vec<QualityLevel>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedSender<AllocatorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let allocator = Self {
            session_id,
            forwarders,
            estimate,
            bitrates,
            levels,
            speaking: HashSet::new(),
            hysteresis: Hysteresis::new(),
        };
        tokio::spawn(async move {
            allocator.run(rx, cancel).await;
        });
        tx
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<AllocatorEvent>, cancel: CancellationToken) {
        tracing::debug!("BitrateAllocator session_id={} has started", self.session_id);
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.pass(Round::Tick),
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let changed = match event {
                        AllocatorEvent::Reallocate => false,
                        AllocatorEvent::VoiceStarted { client_id } => self.speaking.insert(client_id),
                        AllocatorEvent::VoiceEnded { client_id } => self.speaking.remove(&client_id),
                    };
                    self.pass(if changed { Round::Priority } else { Round::Event });
                }
            }
        }
        tracing::debug!("BitrateAllocator session_id={} has finished", self.session_id);
    }

    /// One allocation round. Event-driven rounds only apply changes that must not wait:
    /// new forwarders, audio, caps lowered below the current target, and a new speaker order.
    fn pass(&mut self, round: Round) {
        let forwarders = self.forwarders.load();
        let bandwidth = *self.estimate.borrow();
        let demands: Vec<Demand> = forwarders.iter().map(|f| self.demand(f)).collect();
        let proposed = allocate(bandwidth, &demands);

        for (forwarder, quality) in forwarders.iter().zip(proposed) {
            let current = forwarder.target_quality();
            let immediate = round == Round::Priority
                || forwarder.kind() == MediaKind::Audio
                || !self.hysteresis.is_known(&forwarder.id)
                || current > forwarder.max_quality();
            let next = if immediate {
                self.hysteresis.mark_known(&forwarder.id);
                quality
            } else if round == Round::Tick {
                self.hysteresis.on_tick(&forwarder.id, current, quality)
            } else {
                current
            };
            if next != current {
                forwarder.set_target_quality(next);
            }
        }

        let ids: HashSet<String> = forwarders.iter().map(|f| f.id.clone()).collect();
        self.hysteresis.retain(&ids);
        tracing::trace!(
            "BitrateAllocator session_id={} bandwidth={} forwarders={}",
            self.session_id,
            bandwidth,
            forwarders.len()
        );
    }

    fn demand(&self, forwarder: &ClientTrackForwarder) -> Demand {
        let track = &forwarder.track;
        let priority = if track.source_type() == SourceType::Screen {
            Priority::Screen
        } else if self.speaking.contains(&track.client_id) {
            Priority::Speaking
        } else {
            Priority::Other
        };

        let options = match track.kind {
            MediaKind::Audio => {
                let quality = if track.mime_type().eq_ignore_ascii_case(MIME_TYPE_RED) {
                    QualityLevel::AudioRed
                } else {
                    QualityLevel::Audio
                };
                let measured = track.receive_bitrate(crate::config::Rid::High) as u64;
                vec![(quality, self.cost(measured, quality))]
            }
            MediaKind::Video => {
                let rids = track.rids();
                if rids.len() <= 1 {
                    let measured = rids
                        .first()
                        .map(|rid| track.receive_bitrate(*rid) as u64)
                        .unwrap_or(0);
                    vec![(QualityLevel::High, self.cost(measured, QualityLevel::High))]
                } else {
                    rids.iter()
                        .map(|rid| (rid.quality(), track.receive_bitrate(*rid) as u64))
                        .filter(|(quality, _)| self.levels.contains(quality))
                        .map(|(quality, measured)| (quality, self.cost(measured, quality)))
                        .collect()
                }
            }
        };

        let max_quality = match (track.kind, forwarder.max_quality()) {
            (MediaKind::Video, QualityLevel::None) => QualityLevel::None,
            (MediaKind::Video, _) if track.rids().len() <= 1 => QualityLevel::High,
            (_, max) => max,
        };

        Demand {
            kind: track.kind,
            priority,
            send_bitrate: forwarder.send_bitrate(),
            max_quality,
            options,
        }
    }

    fn cost(&self, measured: u64, quality: QualityLevel) -> u64 {
        if measured > 0 {
            measured
        } else {
            self.bitrates.for_quality(quality) as u64
        }
    }
}

impl Drop for BitrateAllocator {
    fn drop(&mut self) {
        tracing::debug!("BitrateAllocator session_id={} is dropped", self.session_id);
    }
}
