use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use bytes::{Bytes, BytesMut};
use crossbeam_queue::ArrayQueue;
use webrtc::interceptor::Attributes;
use webrtc::rtp::{self, header::Header};
use webrtc_util::marshal::Unmarshal;

use crate::error::{Error, PacketErrorKind};

/// Largest payload a pooled buffer holds.
pub const MAX_PAYLOAD_LEN: usize = 1460;
const DEFAULT_POOL_CAPACITY: usize = 4096;

/// Free lists of RTP headers, payload buffers and attribute maps.
///
/// Buffers are fixed-size so a long-running node never fragments. Each free list is a
/// lock-free queue; when a list is full the returned item is dropped instead of blocking.
/// Payloads are frozen into shared [`Bytes`], so outbound copies only bump a reference count.
/// A buffer still referenced by a writer when the packet is released is left to the allocator.
#[derive(Debug)]
pub struct PacketPool {
    headers: ArrayQueue<Header>,
    payloads: ArrayQueue<BytesMut>,
    attributes: ArrayQueue<Attributes>,
    max_payload_len: usize,
    allocated: AtomicU64,
    recycled: AtomicU64,
    escaped: AtomicU64,
}

impl PacketPool {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, MAX_PAYLOAD_LEN)
    }

    pub fn with_capacity(capacity: usize, max_payload_len: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            headers: ArrayQueue::new(capacity),
            payloads: ArrayQueue::new(capacity),
            attributes: ArrayQueue::new(capacity),
            max_payload_len,
            allocated: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            escaped: AtomicU64::new(0),
        })
    }

    /// Parses `header_bytes`, copies the payload into a pooled buffer and returns a packet holding one reference.
    pub fn acquire(
        self: &Arc<Self>,
        header_bytes: &[u8],
        payload: &[u8],
        attributes: &Attributes,
    ) -> Result<PooledPacket, Error> {
        if payload.len() > self.max_payload_len {
            return Err(Error::new_packet(
                format!(
                    "payload of {} bytes exceeds pooled buffer of {} bytes",
                    payload.len(),
                    self.max_payload_len
                ),
                PacketErrorKind::PayloadTooLarge,
            ));
        }

        let mut reader = header_bytes;
        let parsed = Header::unmarshal(&mut reader).map_err(|err| {
            Error::new_packet(
                format!("failed to parse RTP header: {}", err),
                PacketErrorKind::MalformedPacket,
            )
        })?;

        let mut header = self.headers.pop().unwrap_or_default();
        header.clone_from(&parsed);

        let mut buffer = match self.payloads.pop() {
            Some(buffer) => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.max_payload_len)
            }
        };
        buffer.extend_from_slice(payload);

        let mut attrs = self.attributes.pop().unwrap_or_default();
        attrs.extend(attributes.iter().map(|(k, v)| (*k, *v)));

        Ok(PooledPacket {
            inner: Arc::new(PacketInner {
                refs: AtomicUsize::new(1),
                header,
                payload: buffer.freeze(),
                attributes: attrs,
                pool: Arc::clone(self),
            }),
        })
    }

    /// Number of payload buffers created because the free list was empty.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of payload buffers served from the free list.
    pub fn recycled(&self) -> u64 {
        self.recycled.load(Ordering::Relaxed)
    }

    /// Number of payload buffers that outlived their packet and were not returned.
    pub fn escaped(&self) -> u64 {
        self.escaped.load(Ordering::Relaxed)
    }

    pub fn idle_buffers(&self) -> usize {
        self.payloads.len()
    }

    fn recycle(&self, mut header: Header, payload: Bytes, mut attributes: Attributes) {
        header.extensions.clear();
        header.csrc.clear();
        attributes.clear();
        let _ = self.headers.push(header);
        let _ = self.attributes.push(attributes);
        match payload.try_into_mut() {
            Ok(mut payload) => {
                payload.iter_mut().for_each(|b| *b = 0);
                payload.clear();
                let _ = self.payloads.push(payload);
            }
            Err(_shared) => {
                self.escaped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug)]
struct PacketInner {
    refs: AtomicUsize,
    header: Header,
    payload: Bytes,
    attributes: Attributes,
    pool: Arc<PacketPool>,
}

/// A reference-counted handle to a pooled RTP packet.
///
/// Every handle owns exactly one reference. [`PooledPacket::retain`] hands out another one and
/// [`PooledPacket::release`] (or dropping the handle) gives it back. When the last reference is
/// released the buffers return to the pool.
#[derive(Debug)]
pub struct PooledPacket {
    inner: Arc<PacketInner>,
}

impl PooledPacket {
    pub fn retain(&self) -> Result<PooledPacket, Error> {
        self.inner
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs == 0 {
                    None
                } else {
                    Some(refs + 1)
                }
            })
            .map_err(|_| {
                Error::new_packet(
                    format!(
                        "retain on released packet seq={}",
                        self.inner.header.sequence_number
                    ),
                    PacketErrorKind::UseAfterRelease,
                )
            })?;
        Ok(PooledPacket {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn release(self) {
        drop(self)
    }

    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    pub fn header(&self) -> &Header {
        &self.inner.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    pub fn attributes(&self) -> &Attributes {
        &self.inner.attributes
    }

    /// Mutable access to the attributes, only possible while this handle is the sole owner.
    pub fn attributes_mut(&mut self) -> Option<&mut Attributes> {
        Arc::get_mut(&mut self.inner).map(|inner| &mut inner.attributes)
    }

    /// Points `out` at this packet. The payload is shared, and `out` keeps its own
    /// csrc and extension allocations, so a reused `out` costs no allocation per packet.
    pub fn fill_rtp(&self, out: &mut rtp::packet::Packet) {
        let src = &self.inner.header;
        let header = &mut out.header;
        header.version = src.version;
        header.padding = src.padding;
        header.extension = src.extension;
        header.marker = src.marker;
        header.payload_type = src.payload_type;
        header.sequence_number = src.sequence_number;
        header.timestamp = src.timestamp;
        header.ssrc = src.ssrc;
        header.csrc.clone_from(&src.csrc);
        header.extension_profile = src.extension_profile;
        header.extensions.clone_from(&src.extensions);
        header.extensions_padding = src.extensions_padding;
        out.payload = self.inner.payload.clone();
    }
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        let previous = self.inner.refs.fetch_sub(1, Ordering::AcqRel);
        if previous != 1 {
            return;
        }
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            let header = std::mem::take(&mut inner.header);
            let payload = std::mem::take(&mut inner.payload);
            let attributes = std::mem::take(&mut inner.attributes);
            inner.pool.recycle(header, payload, attributes);
        }
    }
}

#[cfg(test)]
mod tests {
    use webrtc::rtp::header::Header;
    use webrtc_util::marshal::Marshal;

    use super::*;
    use crate::error::ErrorKind;

    fn header_bytes(seq: u16) -> Vec<u8> {
        Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: 3000,
            ssrc: 42,
            ..Default::default()
        }
        .marshal()
        .expect("marshal")
        .to_vec()
    }

    #[test]
    fn payload_at_limit_is_accepted() {
        let pool = PacketPool::new();
        let payload = vec![7u8; MAX_PAYLOAD_LEN];
        let packet = pool
            .acquire(&header_bytes(1), &payload, &Attributes::new())
            .expect("1460 bytes fit");
        assert_eq!(packet.payload().len(), MAX_PAYLOAD_LEN);
        assert_eq!(packet.header().sequence_number, 1);
        assert_eq!(packet.ref_count(), 1);
    }

    #[test]
    fn payload_over_limit_is_rejected() {
        let pool = PacketPool::new();
        let payload = vec![7u8; MAX_PAYLOAD_LEN + 1];
        let err = pool
            .acquire(&header_bytes(1), &payload, &Attributes::new())
            .expect_err("1461 bytes do not fit");
        assert_eq!(err.kind, ErrorKind::Packet(PacketErrorKind::PayloadTooLarge));
    }

    #[test]
    fn garbage_header_is_malformed() {
        let pool = PacketPool::new();
        let err = pool
            .acquire(&[0x80], &[1, 2], &Attributes::new())
            .expect_err("header too short");
        assert_eq!(err.kind, ErrorKind::Packet(PacketErrorKind::MalformedPacket));
    }

    #[test]
    fn buffers_return_after_last_release() {
        let pool = PacketPool::new();
        let mut attrs = Attributes::new();
        attrs.insert(1, 30);

        let first = pool.acquire(&header_bytes(5), &[1, 2, 3], &attrs).expect("acquire");
        let second = first.retain().expect("retain");
        let third = second.retain().expect("retain");
        assert_eq!(first.ref_count(), 3);
        assert_eq!(third.attributes().get(&1), Some(&30));

        first.release();
        second.release();
        assert_eq!(pool.idle_buffers(), 0);
        assert_eq!(third.payload(), &[1, 2, 3]);

        third.release();
        assert_eq!(pool.idle_buffers(), 1);

        let reused = pool
            .acquire(&header_bytes(6), &[9], &Attributes::new())
            .expect("acquire");
        assert_eq!(reused.payload(), &[9]);
        assert!(reused.attributes().is_empty());
        assert_eq!(pool.recycled(), 1);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn retain_after_release_fails() {
        let pool = PacketPool::new();
        let packet = pool.acquire(&header_bytes(9), &[1], &Attributes::new()).expect("acquire");
        packet.inner.refs.store(0, Ordering::Release);
        let err = packet.retain().expect_err("count already zero");
        assert_eq!(err.kind, ErrorKind::Packet(PacketErrorKind::UseAfterRelease));
        // Restore the count so dropping the handle recycles normally.
        packet.inner.refs.store(1, Ordering::Release);
    }

    #[test]
    fn attributes_are_only_mutable_when_unshared() {
        let pool = PacketPool::new();
        let mut packet = pool.acquire(&header_bytes(1), &[1], &Attributes::new()).expect("acquire");
        packet.attributes_mut().expect("sole owner").insert(2, 1);
        let shared = packet.retain().expect("retain");
        assert!(packet.attributes_mut().is_none());
        assert_eq!(shared.attributes().get(&2), Some(&1));
    }

    #[test]
    fn outbound_packets_share_the_pooled_payload() {
        let pool = PacketPool::new();
        let packet = pool.acquire(&header_bytes(3), &[4, 5, 6], &Attributes::new()).expect("acquire");

        let mut first = rtp::packet::Packet::default();
        let mut second = rtp::packet::Packet::default();
        packet.fill_rtp(&mut first);
        packet.fill_rtp(&mut second);
        assert_eq!(first.payload.as_ptr(), packet.payload().as_ptr());
        assert_eq!(second.payload.as_ptr(), packet.payload().as_ptr());
        assert_eq!(second.header.sequence_number, 3);
        assert_eq!(second.header.ssrc, 42);

        // A writer still holding the payload keeps the buffer out of the free list.
        packet.release();
        assert_eq!(pool.idle_buffers(), 0);
        assert_eq!(pool.escaped(), 1);
        assert_eq!(&first.payload[..], &[4, 5, 6]);
        drop((first, second));

        let packet = pool.acquire(&header_bytes(4), &[7], &Attributes::new()).expect("acquire");
        let mut out = rtp::packet::Packet::default();
        packet.fill_rtp(&mut out);
        out.payload = Bytes::new();
        packet.release();
        assert_eq!(pool.idle_buffers(), 1);
    }
}
