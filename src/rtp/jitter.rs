use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use super::pool::PooledPacket;

/// Holds out-of-order packets of one layer until the gap ahead of them is filled.
///
/// In-order packets pass straight through. A gap is given up on once the oldest held packet
/// has waited `max_wait`; the reader polls the buffer every `min_wait`.
#[derive(Debug)]
pub struct ReorderBuffer {
    min_wait: Duration,
    max_wait: Duration,
    next: Option<u64>,
    highest: Option<u64>,
    held: BTreeMap<u64, (Instant, PooledPacket)>,
}

impl ReorderBuffer {
    pub fn new(min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            min_wait,
            max_wait,
            next: None,
            highest: None,
            held: BTreeMap::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.min_wait
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Adds a packet and returns everything now deliverable in sequence order.
    pub fn push(&mut self, packet: PooledPacket, now: Instant) -> Vec<PooledPacket> {
        let seq = self.extend(packet.header().sequence_number);
        let next = *self.next.get_or_insert(seq);
        if seq < next {
            tracing::trace!(
                "ReorderBuffer dropping late packet seq={}",
                packet.header().sequence_number
            );
            return Vec::new();
        }
        self.held.entry(seq).or_insert((now, packet));
        self.drain(now)
    }

    /// Releases packets whose gap has timed out.
    pub fn poll(&mut self, now: Instant) -> Vec<PooledPacket> {
        self.drain(now)
    }

    fn drain(&mut self, now: Instant) -> Vec<PooledPacket> {
        let mut ready = Vec::new();
        loop {
            let Some((&seq, (arrived, _))) = self.held.iter().next() else {
                break;
            };
            let Some(next) = self.next else {
                break;
            };
            if seq != next && now.saturating_duration_since(*arrived) < self.max_wait {
                break;
            }
            if seq != next {
                tracing::trace!("ReorderBuffer skipping {} missing packets", seq - next);
            }
            if let Some((_, packet)) = self.held.remove(&seq) {
                ready.push(packet);
            }
            self.next = Some(seq + 1);
        }
        ready
    }

    /// Unwraps a 16-bit sequence number against the highest one seen.
    fn extend(&mut self, seq: u16) -> u64 {
        let extended = match self.highest {
            None => (1u64 << 16) + seq as u64,
            Some(highest) => {
                let base = highest & !0xffff;
                let candidates = [base.wrapping_sub(1 << 16), base, base + (1 << 16)];
                candidates
                    .iter()
                    .map(|b| b + seq as u64)
                    .min_by_key(|c| c.abs_diff(highest))
                    .unwrap_or(base + seq as u64)
            }
        };
        if self.highest.map_or(true, |h| extended > h) {
            self.highest = Some(extended);
        }
        extended
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use webrtc::interceptor::Attributes;
    use webrtc::rtp::header::Header;
    use webrtc_util::marshal::Marshal;

    use super::*;
    use crate::rtp::pool::PacketPool;

    fn packet(pool: &Arc<PacketPool>, seq: u16) -> PooledPacket {
        let header = Header {
            version: 2,
            sequence_number: seq,
            ..Default::default()
        }
        .marshal()
        .expect("marshal");
        pool.acquire(&header, &[0], &Attributes::new()).expect("acquire")
    }

    fn seqs(packets: &[PooledPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.header().sequence_number).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn reorders_within_wait() {
        let pool = PacketPool::new();
        let mut buffer = ReorderBuffer::new(Duration::from_millis(20), Duration::from_millis(150));
        let now = Instant::now();
        assert_eq!(seqs(&buffer.push(packet(&pool, 10), now)), vec![10]);
        assert!(buffer.push(packet(&pool, 12), now).is_empty());
        assert_eq!(seqs(&buffer.push(packet(&pool, 11), now)), vec![11, 12]);
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_on_gap_after_max_wait() {
        let pool = PacketPool::new();
        let mut buffer = ReorderBuffer::new(Duration::from_millis(20), Duration::from_millis(150));
        let now = Instant::now();
        buffer.push(packet(&pool, 65534), now);
        assert!(buffer.push(packet(&pool, 1), now).is_empty());
        assert!(buffer.poll(now + Duration::from_millis(100)).is_empty());
        assert_eq!(seqs(&buffer.poll(now + Duration::from_millis(150))), vec![1]);
        // Late arrival of a skipped packet is dropped.
        assert!(buffer.push(packet(&pool, 65535), now + Duration::from_millis(160)).is_empty());
    }
}
