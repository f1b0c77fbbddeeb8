//! Software NIC
//!
//! In-memory [`PacketIo`] implementation built from the crate's own
//! [`BufferPool`] and [`RingBuffer`]. Every port gets RX and TX rings per
//! queue, an atomic link flag and hardware-style counters.
//!
//! Frames are injected into RX rings from the outside (tests, benchmarks,
//! a traffic replayer) and transmitted frames are collected from TX rings.
//! Each ring end sits behind an uncontended `parking_lot::Mutex`: a queue is
//! polled by exactly one worker, the lock only makes the handle shareable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer::{pool_capacity, BufferPool, PacketBuffer};
use crate::error::{DataplaneError, Result};
use crate::port::{LinkState, PacketIo, PortId, PortStats, QueueId};
use crate::ring::{Consumer, Producer, RingBuffer};
use crate::{RX_RING_SIZE, TX_RING_SIZE};

struct Queue {
    producer: Mutex<Producer<PacketBuffer>>,
    consumer: Mutex<Consumer<PacketBuffer>>,
}

impl Queue {
    fn new(depth: usize) -> Result<Self> {
        let (producer, consumer) = RingBuffer::new(depth)?;
        Ok(Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
        })
    }

    fn len(&self) -> usize {
        self.consumer.lock().len()
    }

    fn drain(&self) -> Vec<PacketBuffer> {
        let mut consumer = self.consumer.lock();
        let mut out = Vec::with_capacity(consumer.len());
        let max = consumer.capacity();
        consumer.pop_burst(&mut out, max);
        out
    }
}

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_missed: AtomicU64,
    tx_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PortStats {
        PortStats {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_missed: self.rx_missed.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }
}

struct SoftPort {
    link: AtomicBool,
    rx: Vec<Queue>,
    tx: Vec<Queue>,
    counters: Counters,
}

/// Builder for [`SoftNic`]
#[derive(Debug, Clone)]
pub struct SoftNicBuilder {
    ports: u16,
    rx_queues: u16,
    tx_queues: u16,
    rx_depth: usize,
    tx_depth: usize,
    pool_capacity: Option<usize>,
}

impl Default for SoftNicBuilder {
    fn default() -> Self {
        Self {
            ports: 1,
            rx_queues: 1,
            tx_queues: 1,
            rx_depth: RX_RING_SIZE,
            tx_depth: TX_RING_SIZE,
            pool_capacity: None,
        }
    }
}

impl SoftNicBuilder {
    /// Number of ports (ids `0..n`)
    pub fn ports(mut self, ports: u16) -> Self {
        self.ports = ports;
        self
    }

    /// RX queues per port
    pub fn rx_queues(mut self, queues: u16) -> Self {
        self.rx_queues = queues;
        self
    }

    /// TX queues per port
    pub fn tx_queues(mut self, queues: u16) -> Self {
        self.tx_queues = queues;
        self
    }

    /// Ring slots per RX and TX queue (one slot stays empty)
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.rx_depth = depth;
        self.tx_depth = depth;
        self
    }

    /// Buffer pool size; defaults to enough buffers to fill every ring
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// Allocate rings and the buffer pool
    pub fn build(self) -> Result<SoftNic> {
        if self.ports == 0 {
            return Err(DataplaneError::InvalidCapacity {
                what: "ports",
                requested: 0,
            });
        }
        if self.rx_queues == 0 || self.tx_queues == 0 {
            return Err(DataplaneError::InvalidCapacity {
                what: "queues per port",
                requested: 0,
            });
        }

        let per_port = self.rx_queues as usize * self.rx_depth + self.tx_queues as usize * self.tx_depth;
        let capacity = self
            .pool_capacity
            .unwrap_or_else(|| pool_capacity(per_port, 1, self.ports as usize));
        let pool = BufferPool::new(capacity)?;

        let mut ports = Vec::with_capacity(self.ports as usize);
        for _ in 0..self.ports {
            ports.push(SoftPort {
                link: AtomicBool::new(true),
                rx: (0..self.rx_queues)
                    .map(|_| Queue::new(self.rx_depth))
                    .collect::<Result<_>>()?,
                tx: (0..self.tx_queues)
                    .map(|_| Queue::new(self.tx_depth))
                    .collect::<Result<_>>()?,
                counters: Counters::default(),
            });
        }

        tracing::info!(
            ports = self.ports,
            rx_queues = self.rx_queues,
            tx_queues = self.tx_queues,
            rx_depth = self.rx_depth,
            tx_depth = self.tx_depth,
            pool = capacity,
            "Software NIC created"
        );

        Ok(SoftNic { ports, pool })
    }
}

/// In-memory NIC
pub struct SoftNic {
    ports: Vec<SoftPort>,
    pool: BufferPool,
}

impl SoftNic {
    /// Start building a software NIC
    pub fn builder() -> SoftNicBuilder {
        SoftNicBuilder::default()
    }

    fn port(&self, port: PortId) -> Result<&SoftPort> {
        self.ports
            .get(port as usize)
            .ok_or(DataplaneError::UnknownPort(port))
    }

    fn rx_queue(&self, port: PortId, queue: QueueId) -> Result<&Queue> {
        self.port(port)?
            .rx
            .get(queue as usize)
            .ok_or(DataplaneError::UnknownQueue { port, queue })
    }

    fn tx_queue(&self, port: PortId, queue: QueueId) -> Result<&Queue> {
        self.port(port)?
            .tx
            .get(queue as usize)
            .ok_or(DataplaneError::UnknownQueue { port, queue })
    }

    /// Buffer pool backing every ring
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Number of ports
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Deliver a frame to an RX queue, as the wire would.
    ///
    /// Returns `Ok(false)` when the frame was missed: link down, pool
    /// exhausted, frame larger than a buffer or RX ring full.
    pub fn inject(&self, port: PortId, queue: QueueId, frame: &[u8]) -> Result<bool> {
        let p = self.port(port)?;
        let rx = self.rx_queue(port, queue)?;

        if !p.link.load(Ordering::Acquire) {
            p.counters.rx_missed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let Some(mut buf) = self.pool.acquire() else {
            tracing::warn!(port, queue, "Buffer pool exhausted, frame missed");
            p.counters.rx_missed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        if !buf.fill(frame) {
            tracing::debug!(port, queue, len = frame.len(), "Frame exceeds buffer size");
            p.counters.rx_missed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        match rx.producer.lock().push(buf) {
            Ok(()) => {
                p.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
                p.counters.rx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            Err(_full) => {
                p.counters.rx_missed.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    /// Take every frame transmitted on a TX queue
    pub fn drain_tx(&self, port: PortId, queue: QueueId) -> Vec<PacketBuffer> {
        self.tx_queue(port, queue)
            .map(Queue::drain)
            .unwrap_or_default()
    }

    /// Take every frame still waiting on an RX queue
    pub fn drain_rx(&self, port: PortId, queue: QueueId) -> Vec<PacketBuffer> {
        self.rx_queue(port, queue)
            .map(Queue::drain)
            .unwrap_or_default()
    }

    /// Frames waiting on an RX queue
    pub fn rx_len(&self, port: PortId, queue: QueueId) -> usize {
        self.rx_queue(port, queue).map(Queue::len).unwrap_or(0)
    }

    /// Frames sitting on a TX queue
    pub fn tx_len(&self, port: PortId, queue: QueueId) -> usize {
        self.tx_queue(port, queue).map(Queue::len).unwrap_or(0)
    }

    /// Flip the link of `port`. Unknown ports are ignored.
    pub fn set_link(&self, port: PortId, state: LinkState) {
        if let Ok(p) = self.port(port) {
            let previous = p.link.swap(state.is_up(), Ordering::AcqRel);
            if previous != state.is_up() {
                tracing::info!(port, link = %state, "Link state changed");
            }
        }
    }
}

impl PacketIo for SoftNic {
    fn receive_burst(
        &self,
        port: PortId,
        queue: QueueId,
        out: &mut Vec<PacketBuffer>,
        max: usize,
    ) -> usize {
        match self.rx_queue(port, queue) {
            Ok(rx) => rx.consumer.lock().pop_burst(out, max),
            Err(_) => 0,
        }
    }

    fn transmit_burst(&self, port: PortId, queue: QueueId, bufs: &mut Vec<PacketBuffer>) -> usize {
        let Ok(p) = self.port(port) else {
            return 0;
        };
        let Ok(tx) = self.tx_queue(port, queue) else {
            p.counters.tx_errors.fetch_add(bufs.len() as u64, Ordering::Relaxed);
            return 0;
        };
        if !p.link.load(Ordering::Acquire) {
            p.counters.tx_errors.fetch_add(bufs.len() as u64, Ordering::Relaxed);
            return 0;
        }

        let mut producer = tx.producer.lock();
        // The consumer can only free slots, so `room` pushes cannot fail
        // while the producer lock is held.
        let room = producer.capacity() - producer.len();
        let take = room.min(bufs.len());

        let mut accepted = 0;
        let mut bytes = 0;
        for buf in bufs.drain(..take) {
            let len = buf.len() as u64;
            match producer.push(buf) {
                Ok(()) => {
                    accepted += 1;
                    bytes += len;
                }
                Err(full) => self.release(full.into_inner()),
            }
        }

        let rejected = (bufs.len() + take - accepted) as u64;
        p.counters.tx_packets.fetch_add(accepted as u64, Ordering::Relaxed);
        p.counters.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        p.counters.tx_errors.fetch_add(rejected, Ordering::Relaxed);
        accepted
    }

    fn release(&self, buf: PacketBuffer) {
        self.pool.release(buf);
    }

    #[inline]
    fn link_state(&self, port: PortId) -> LinkState {
        match self.port(port) {
            Ok(p) if p.link.load(Ordering::Acquire) => LinkState::Up,
            _ => LinkState::Down,
        }
    }

    fn configured_ports(&self) -> Vec<PortId> {
        (0..self.ports.len() as PortId).collect()
    }

    fn rx_queue_count(&self, port: PortId) -> u16 {
        self.port(port).map(|p| p.rx.len() as u16).unwrap_or(0)
    }

    fn tx_queue_count(&self, port: PortId) -> u16 {
        self.port(port).map(|p| p.tx.len() as u16).unwrap_or(0)
    }

    fn port_stats(&self, port: PortId) -> Option<PortStats> {
        self.port(port).ok().map(|p| p.counters.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;

    fn frame() -> Vec<u8> {
        FrameBuilder::udp([10, 0, 0, 1], [10, 0, 0, 2], 1, 2).build()
    }

    #[test]
    fn test_builder_defaults() {
        let nic = SoftNic::builder().ports(2).build().unwrap();
        assert_eq!(nic.port_count(), 2);
        assert_eq!(nic.configured_ports(), vec![0, 1]);
        assert_eq!(nic.pool().capacity(), (RX_RING_SIZE + TX_RING_SIZE) * 2);
        assert_eq!(nic.link_state(0), LinkState::Up);
        assert_eq!(nic.link_state(9), LinkState::Down);
        assert_eq!((nic.rx_queue_count(0), nic.tx_queue_count(0)), (1, 1));
        assert_eq!(nic.tx_queue_count(9), 0);
    }

    #[test]
    fn test_builder_rejects_empty() {
        assert!(SoftNic::builder().ports(0).build().is_err());
        assert!(SoftNic::builder().rx_queues(0).build().is_err());
        assert!(SoftNic::builder().queue_depth(1).build().is_err());
    }

    #[test]
    fn test_inject_receive() {
        let nic = SoftNic::builder().ports(1).queue_depth(8).build().unwrap();
        assert!(nic.inject(0, 0, &frame()).unwrap());
        assert!(nic.inject(0, 0, &frame()).unwrap());
        assert!(nic.inject(0, 1, &frame()).is_err());
        assert!(nic.inject(4, 0, &frame()).is_err());

        let mut out = Vec::new();
        assert_eq!(nic.receive_burst(0, 0, &mut out, 1), 1);
        assert_eq!(nic.receive_burst(0, 0, &mut out, 32), 1);
        assert_eq!(nic.receive_burst(0, 0, &mut out, 32), 0);
        assert_eq!(out[0].data(), frame().as_slice());

        let stats = nic.port_stats(0).unwrap();
        assert_eq!(stats.rx_packets, 2);
        assert_eq!(stats.rx_bytes, 2 * frame().len() as u64);
    }

    #[test]
    fn test_inject_missed() {
        let nic = SoftNic::builder()
            .ports(1)
            .queue_depth(4)
            .pool_capacity(8)
            .build()
            .unwrap();

        // Ring holds 3
        for _ in 0..3 {
            assert!(nic.inject(0, 0, &frame()).unwrap());
        }
        assert!(!nic.inject(0, 0, &frame()).unwrap());
        assert_eq!(nic.pool().borrowed(), 3);

        nic.set_link(0, LinkState::Down);
        assert!(!nic.inject(0, 0, &frame()).unwrap());

        assert_eq!(nic.port_stats(0).unwrap().rx_missed, 2);
    }

    #[test]
    fn test_pool_exhaustion_is_missed() {
        let nic = SoftNic::builder()
            .ports(1)
            .queue_depth(16)
            .pool_capacity(2)
            .build()
            .unwrap();
        assert!(nic.inject(0, 0, &frame()).unwrap());
        assert!(nic.inject(0, 0, &frame()).unwrap());
        assert!(!nic.inject(0, 0, &frame()).unwrap());
        assert_eq!(nic.port_stats(0).unwrap().rx_missed, 1);

        drop(nic.drain_rx(0, 0));
        assert!(nic.inject(0, 0, &frame()).unwrap());
    }

    #[test]
    fn test_transmit_partial_accept() {
        let nic = SoftNic::builder().ports(2).queue_depth(4).build().unwrap();
        let mut bufs: Vec<_> = (0..5)
            .map(|i| {
                let mut b = nic.pool().acquire().unwrap();
                b.fill(&[i as u8; 60]);
                b
            })
            .collect();

        assert_eq!(nic.transmit_burst(1, 0, &mut bufs), 3);
        // Rejected ones stay with the caller, in order
        assert_eq!(bufs.len(), 2);
        assert_eq!(bufs[0].data()[0], 3);

        let sent = nic.drain_tx(1, 0);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].data()[0], 2);

        let stats = nic.port_stats(1).unwrap();
        assert_eq!(stats.tx_packets, 3);
        assert_eq!(stats.tx_bytes, 180);
        assert_eq!(stats.tx_errors, 2);
    }

    #[test]
    fn test_transmit_link_down() {
        let nic = SoftNic::builder().ports(2).build().unwrap();
        nic.set_link(1, LinkState::Down);

        let mut bufs = vec![nic.pool().acquire().unwrap()];
        assert_eq!(nic.transmit_burst(1, 0, &mut bufs), 0);
        assert_eq!(bufs.len(), 1);

        nic.release(bufs.pop().unwrap());
        assert_eq!(nic.pool().borrowed(), 0);
    }
}
