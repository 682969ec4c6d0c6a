use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::time::Instant;

const WINDOW_MS: u64 = 1000;
/// Past this many silent windows the average is zero anyway.
const MAX_EMPTY_WINDOWS: u64 = 64;
/// Weight of the newest window in the moving average, in percent.
const EWMA_WEIGHT: u64 = 60;

/// Byte counter that turns into a bits-per-second figure once per window.
///
/// Writers call [`BitrateMeter::record`] from a single task. Readers see the average as of now,
/// so a stream that stopped decays toward zero without further writes.
#[derive(Debug)]
pub struct BitrateMeter {
    started: Instant,
    total_bytes: AtomicU64,
    window_bytes: AtomicU64,
    window_start_ms: AtomicU64,
    last: AtomicU32,
    average: AtomicU32,
}

impl Default for BitrateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitrateMeter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_bytes: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(0),
            last: AtomicU32::new(0),
            average: AtomicU32::new(0),
        }
    }

    pub fn record(&self, bytes: usize) {
        self.record_at(bytes, Instant::now());
    }

    pub fn record_at(&self, bytes: usize, now: Instant) {
        let bytes = bytes as u64;
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let now_ms = self.ms_since_start(now);
        let window_start = self.window_start_ms.load(Ordering::Relaxed);
        let elapsed = now_ms.saturating_sub(window_start);
        if elapsed < WINDOW_MS {
            self.window_bytes.fetch_add(bytes, Ordering::Relaxed);
            return;
        }

        let pending = self.window_bytes.swap(bytes, Ordering::Relaxed);
        self.window_start_ms.store(now_ms, Ordering::Relaxed);
        let (last, average) = self.roll(pending, elapsed);
        self.last.store(last, Ordering::Relaxed);
        self.average.store(average, Ordering::Relaxed);
    }

    /// Closes the pending window and every empty window after it, returning the last window's
    /// rate and the new average.
    fn roll(&self, pending_bytes: u64, elapsed_ms: u64) -> (u32, u32) {
        let windows = elapsed_ms / WINDOW_MS;
        let rate = (pending_bytes * 8 * 1000 / WINDOW_MS).min(u32::MAX as u64);
        let previous = self.average.load(Ordering::Relaxed) as u64;
        let mut average = if previous == 0 {
            rate
        } else {
            (rate * EWMA_WEIGHT + previous * (100 - EWMA_WEIGHT)) / 100
        };
        for _ in 1..windows.min(MAX_EMPTY_WINDOWS) {
            average = average * (100 - EWMA_WEIGHT) / 100;
        }
        let last = if windows > 1 { 0 } else { rate };
        (last as u32, average as u32)
    }

    /// Smoothed bits per second. Windows that closed without a packet count as silence.
    pub fn bitrate(&self) -> u32 {
        self.bitrate_at(Instant::now())
    }

    pub fn bitrate_at(&self, now: Instant) -> u32 {
        match self.elapsed_closed(now) {
            Some(elapsed) => self.roll(self.window_bytes.load(Ordering::Relaxed), elapsed).1,
            None => self.average.load(Ordering::Relaxed),
        }
    }

    /// Bits per second of the last full window.
    pub fn last_window(&self) -> u32 {
        match self.elapsed_closed(Instant::now()) {
            Some(elapsed) => self.roll(self.window_bytes.load(Ordering::Relaxed), elapsed).0,
            None => self.last.load(Ordering::Relaxed),
        }
    }

    /// Time since the open window started, once that window is over.
    fn elapsed_closed(&self, now: Instant) -> Option<u64> {
        let elapsed = self
            .ms_since_start(now)
            .saturating_sub(self.window_start_ms.load(Ordering::Relaxed));
        (elapsed >= WINDOW_MS).then_some(elapsed)
    }

    fn ms_since_start(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_millis() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}
