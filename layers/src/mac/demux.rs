//! Payload buffers and PDU demultiplexing
//!
//! HARQ processes receive decoded transport blocks into buffers taken from a
//! fixed-size pool. A buffer returns its slot to the pool when dropped, so
//! delivering or deallocating it is simply moving it away.

use super::harq::GrantKind;
use super::slsch_pdu::SlSchPdu;
use crate::LayerError;
use bytes::{Bytes, BytesMut};
use common::utils::bytes_to_hex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// UE contention resolution identity control element (TS 36.321 Table 6.2.1-1)
pub const LCID_CONTENTION_RESOLUTION: u8 = 0x1C;

/// Buffer receiving one decoded transport block
#[derive(Debug)]
pub struct PayloadBuffer {
    data: BytesMut,
    capacity: usize,
    broadcast: bool,
    slot: Option<Arc<AtomicUsize>>,
}

impl PayloadBuffer {
    fn new(capacity: usize, broadcast: bool, slot: Option<Arc<AtomicUsize>>) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            broadcast,
            slot,
        }
    }

    /// A buffer outside any pool
    pub fn unpooled(capacity: usize) -> Self {
        Self::new(capacity, false, None)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Store a decoded transport block, replacing previous content
    pub fn write(&mut self, tb: &[u8]) -> Result<(), LayerError> {
        if tb.len() > self.capacity {
            return Err(LayerError::ProcessingError(format!(
                "transport block of {} bytes exceeds buffer of {}",
                tb.len(),
                self.capacity
            )));
        }
        self.data.clear();
        self.data.extend_from_slice(tb);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Take the content
    pub fn freeze(mut self) -> Bytes {
        std::mem::take(&mut self.data).freeze()
    }
}

impl Drop for PayloadBuffer {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Source of payload buffers for HARQ processes
pub trait PayloadAllocator: Send + Sync {
    /// Buffer for a unicast or sidelink transport block of `size` bytes
    fn request(&self, size: usize) -> Option<PayloadBuffer>;

    /// Buffer for a broadcast transport block of `size` bytes
    fn request_broadcast(&self, size: usize) -> Option<PayloadBuffer>;

    /// Give back a buffer that will not be delivered
    fn deallocate(&self, buffer: PayloadBuffer);
}

/// Receiver of decoded transport blocks
pub trait PduDemux: Send + Sync {
    /// Hand over a decoded PDU; for temporary C-RNTI grants the result is
    /// the contention resolution outcome
    fn push(&self, kind: GrantKind, buffer: PayloadBuffer) -> bool;
}

/// Counted pool of payload buffers
pub struct BufferPool {
    max_buffers: usize,
    max_size: usize,
    in_use: Arc<AtomicUsize>,
    broadcast_in_use: Arc<AtomicUsize>,
}

impl BufferPool {
    pub fn new(max_buffers: usize, max_size: usize) -> Self {
        Self {
            max_buffers,
            max_size,
            in_use: Arc::new(AtomicUsize::new(0)),
            broadcast_in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Buffers currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire) + self.broadcast_in_use.load(Ordering::Acquire)
    }

    fn take(&self, counter: &Arc<AtomicUsize>, limit: usize, size: usize, broadcast: bool) -> Option<PayloadBuffer> {
        if size > self.max_size {
            warn!("Payload of {} bytes above pool buffer size {}", size, self.max_size);
            return None;
        }
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| PayloadBuffer::new(size, broadcast, Some(counter.clone())))
    }
}

impl PayloadAllocator for BufferPool {
    fn request(&self, size: usize) -> Option<PayloadBuffer> {
        self.take(&self.in_use, self.max_buffers, size, false)
    }

    fn request_broadcast(&self, size: usize) -> Option<PayloadBuffer> {
        self.take(&self.broadcast_in_use, 1, size, true)
    }

    fn deallocate(&self, buffer: PayloadBuffer) {
        trace!("Deallocating payload buffer of {} bytes", buffer.capacity());
        drop(buffer);
    }
}

/// An SDU handed to the upper layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredSdu {
    pub kind: GrantKind,
    /// Source layer-2 id, 0 outside sidelink
    pub src: u32,
    /// Destination layer-2 id, 0 outside sidelink
    pub dst: u32,
    pub lcid: u8,
    pub data: Bytes,
}

/// Demux counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub pdus: u64,
    pub sdus: u64,
    pub malformed: u64,
    /// SDUs lost because the upper layer queue was full
    pub dropped: u64,
}

/// Demultiplexer forwarding SDUs over a bounded channel
pub struct ChannelDemux {
    tx: mpsc::Sender<DeliveredSdu>,
    contention_id: Option<[u8; 6]>,
    pdus: AtomicU64,
    sdus: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelDemux {
    pub fn new(tx: mpsc::Sender<DeliveredSdu>) -> Self {
        Self {
            tx,
            contention_id: None,
            pdus: AtomicU64::new(0),
            sdus: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Contention resolution identity expected on temporary C-RNTI grants
    pub fn with_contention_id(mut self, id: [u8; 6]) -> Self {
        self.contention_id = Some(id);
        self
    }

    pub fn stats(&self) -> DemuxStats {
        DemuxStats {
            pdus: self.pdus.load(Ordering::Relaxed),
            sdus: self.sdus.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn forward(&self, sdu: DeliveredSdu) {
        match self.tx.try_send(sdu) {
            Ok(()) => {
                self.sdus.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping SDU: {}", e);
            }
        }
    }

    fn push_sidelink(&self, data: Bytes) -> bool {
        match SlSchPdu::parse(&data) {
            Ok(pdu) => {
                debug!("SL-SCH PDU {:06x} -> {:06x} with {} SDUs", pdu.src, pdu.dst, pdu.sdus.len());
                for sdu in pdu.sdus {
                    self.forward(DeliveredSdu {
                        kind: GrantKind::Sidelink,
                        src: pdu.src,
                        dst: pdu.dst,
                        lcid: sdu.lcid,
                        data: sdu.data,
                    });
                }
                true
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Malformed SL-SCH PDU of {} bytes: {}", data.len(), e);
                trace!("PDU head: {}", bytes_to_hex(&data[..data.len().min(16)]));
                false
            }
        }
    }

    fn contention_resolved(&self, data: &[u8]) -> bool {
        match (self.contention_id, data.split_first()) {
            (Some(id), Some((&lcid, rest))) => lcid & 0x1F == LCID_CONTENTION_RESOLUTION && rest.starts_with(&id),
            _ => false,
        }
    }
}

impl PduDemux for ChannelDemux {
    fn push(&self, kind: GrantKind, buffer: PayloadBuffer) -> bool {
        self.pdus.fetch_add(1, Ordering::Relaxed);
        let data = buffer.freeze();

        match kind {
            GrantKind::Sidelink => self.push_sidelink(data),
            GrantKind::TemporaryCrnti(_) => {
                let resolved = self.contention_resolved(&data);
                debug!("Temporary C-RNTI PDU: contention {}", if resolved { "resolved" } else { "not resolved" });
                resolved
            }
            GrantKind::Broadcast | GrantKind::Unicast => {
                self.forward(DeliveredSdu { kind, src: 0, dst: 0, lcid: 0, data });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Rnti;

    #[test]
    fn test_pool_counts_buffers() {
        let pool = BufferPool::new(2, 100);
        let a = pool.request(10).unwrap();
        let b = pool.request(10).unwrap();
        assert!(pool.request(10).is_none());
        assert_eq!(pool.in_use(), 2);

        pool.deallocate(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.request(10).unwrap();
        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);

        assert!(pool.request(101).is_none());
        let bcch = pool.request_broadcast(50).unwrap();
        assert!(bcch.is_broadcast());
        assert!(pool.request_broadcast(50).is_none());
    }

    #[test]
    fn test_buffer_capacity() {
        let mut buffer = PayloadBuffer::unpooled(4);
        assert!(buffer.write(b"12345").is_err());
        buffer.write(b"1234").unwrap();
        assert_eq!(buffer.freeze(), Bytes::from_static(b"1234"));
    }

    #[tokio::test]
    async fn test_sidelink_demux() {
        let (tx, mut rx) = mpsc::channel(8);
        let demux = ChannelDemux::new(tx);

        let mut pdu = SlSchPdu::new(0x10, 0x20);
        pdu.push(3, Bytes::from_static(b"one")).unwrap();
        pdu.push(4, Bytes::from_static(b"two")).unwrap();
        let mut buffer = PayloadBuffer::unpooled(64);
        buffer.write(&pdu.write(Some(64)).unwrap()).unwrap();

        assert!(demux.push(GrantKind::Sidelink, buffer));
        let first = rx.recv().await.unwrap();
        assert_eq!((first.src, first.dst, first.lcid), (0x10, 0x20, 3));
        assert_eq!(first.data, Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap().data, Bytes::from_static(b"two"));

        let mut garbage = PayloadBuffer::unpooled(8);
        garbage.write(&[0xFF; 8]).unwrap();
        assert!(!demux.push(GrantKind::Sidelink, garbage));
        assert_eq!(demux.stats(), DemuxStats { pdus: 2, sdus: 2, malformed: 1, dropped: 0 });
    }

    #[test]
    fn test_full_queue_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let demux = ChannelDemux::new(tx);
        for _ in 0..3 {
            let mut buffer = PayloadBuffer::unpooled(4);
            buffer.write(b"data").unwrap();
            assert!(demux.push(GrantKind::Unicast, buffer));
        }
        assert_eq!(demux.stats().dropped, 2);
    }

    #[test]
    fn test_contention_resolution() {
        let (tx, _rx) = mpsc::channel(1);
        let id = [1, 2, 3, 4, 5, 6];
        let demux = ChannelDemux::new(tx).with_contention_id(id);
        let kind = GrantKind::TemporaryCrnti(Rnti::new(0x46));

        let mut matching = PayloadBuffer::unpooled(16);
        matching.write(&[LCID_CONTENTION_RESOLUTION, 1, 2, 3, 4, 5, 6, 0]).unwrap();
        assert!(demux.push(kind, matching));

        let mut other = PayloadBuffer::unpooled(16);
        other.write(&[LCID_CONTENTION_RESOLUTION, 9, 9, 9, 9, 9, 9]).unwrap();
        assert!(!demux.push(kind, other));
    }
}
