//! Ports and the packet-I/O contract
//!
//! The NIC driver owns queues, descriptors and link negotiation. The fast
//! path only sees it through [`PacketIo`]: burst receive, burst transmit,
//! buffer release and live link state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::PacketBuffer;

/// Port identifier
pub type PortId = u16;

/// Queue identifier (per port)
pub type QueueId = u16;

/// Physical/logical link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Link active
    Up,
    /// Link inactive
    Down,
}

impl LinkState {
    /// Check if up
    #[inline(always)]
    pub fn is_up(self) -> bool {
        self == LinkState::Up
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Up => f.write_str("UP"),
            LinkState::Down => f.write_str("DOWN"),
        }
    }
}

/// Per-port hardware counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    /// Packets received
    pub rx_packets: u64,
    /// Packets transmitted
    pub tx_packets: u64,
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes transmitted
    pub tx_bytes: u64,
    /// Packets dropped on receive (no buffer, queue full)
    pub rx_missed: u64,
    /// Transmit rejections
    pub tx_errors: u64,
}

/// Packet-I/O collaborator (NIC driver or software NIC)
///
/// Every call is non-blocking and bounded. A receive may return fewer
/// buffers than requested (including zero) when the queue is empty or the
/// buffer pool is exhausted.
pub trait PacketIo: Send + Sync {
    /// Receive up to `max` buffers from `queue` of `port`, appending them
    /// to `out`. Returns the number received.
    fn receive_burst(
        &self,
        port: PortId,
        queue: QueueId,
        out: &mut Vec<PacketBuffer>,
        max: usize,
    ) -> usize;

    /// Transmit `bufs` on `queue` of `port`. Accepted buffers are removed
    /// from the front of `bufs` and now belong to the TX queue; rejected
    /// ones stay with the caller. Returns the number accepted.
    fn transmit_burst(&self, port: PortId, queue: QueueId, bufs: &mut Vec<PacketBuffer>) -> usize;

    /// Return a buffer to its pool
    fn release(&self, buf: PacketBuffer) {
        drop(buf);
    }

    /// Current link state, read live
    fn link_state(&self, port: PortId) -> LinkState;

    /// Configured ports, in the order used for round-robin forwarding
    fn configured_ports(&self) -> Vec<PortId>;

    /// RX queues set up on `port` (0 for an unknown port)
    fn rx_queue_count(&self, port: PortId) -> u16;

    /// TX queues set up on `port` (0 for an unknown port)
    fn tx_queue_count(&self, port: PortId) -> u16;

    /// Hardware counters, when the driver exposes them
    fn port_stats(&self, _port: PortId) -> Option<PortStats> {
        None
    }
}

/// Port and the queues assigned to workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// Port id
    pub id: PortId,
    /// RX queues polled by some worker
    pub rx_queues: Vec<QueueId>,
    /// TX queues written by some worker
    pub tx_queues: Vec<QueueId>,
}

impl Port {
    fn new(id: PortId) -> Self {
        Self {
            id,
            rx_queues: Vec::new(),
            tx_queues: Vec::new(),
        }
    }
}

/// Configured ports with live link state
///
/// The port list is fixed at startup. Link state is never cached: each
/// query goes to the packet-I/O collaborator, so a flap is visible to the
/// very next forwarding decision.
#[derive(Clone)]
pub struct PortRegistry {
    io: Arc<dyn PacketIo>,
    ports: Vec<Port>,
    ids: Vec<PortId>,
}

impl PortRegistry {
    /// Enumerate the collaborator's configured ports
    pub fn new(io: Arc<dyn PacketIo>) -> Self {
        let ids = io.configured_ports();
        let ports = ids.iter().copied().map(Port::new).collect();
        Self { io, ports, ids }
    }

    /// Record that a worker polls `queue` on `port`
    pub(crate) fn assign_rx(&mut self, port: PortId, queue: QueueId) {
        if let Some(p) = self.ports.iter_mut().find(|p| p.id == port) {
            p.rx_queues.push(queue);
        }
    }

    /// Record that a worker transmits on `queue` of `port`
    pub(crate) fn assign_tx(&mut self, port: PortId, queue: QueueId) {
        if let Some(p) = self.ports.iter_mut().find(|p| p.id == port) {
            p.tx_queues.push(queue);
        }
    }

    /// Port ids in configuration order
    #[inline(always)]
    pub fn ids(&self) -> &[PortId] {
        &self.ids
    }

    /// Ports with their queue assignments
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Look up a port
    pub fn get(&self, id: PortId) -> Option<&Port> {
        self.ports.iter().find(|p| p.id == id)
    }

    /// Check if `id` is configured
    pub fn contains(&self, id: PortId) -> bool {
        self.ids.contains(&id)
    }

    /// Number of configured ports
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if no port is configured
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Live link state
    #[inline(always)]
    pub fn link_state(&self, id: PortId) -> LinkState {
        self.io.link_state(id)
    }

    /// RX queues set up on `id`
    pub fn rx_queue_count(&self, id: PortId) -> u16 {
        self.io.rx_queue_count(id)
    }

    /// TX queues set up on `id`
    pub fn tx_queue_count(&self, id: PortId) -> u16 {
        self.io.tx_queue_count(id)
    }

    /// Check if `queue` is set up for receive on `port`
    pub fn has_rx_queue(&self, port: PortId, queue: QueueId) -> bool {
        self.contains(port) && queue < self.io.rx_queue_count(port)
    }

    /// Check if `queue` is set up for transmit on `port`
    pub fn has_tx_queue(&self, port: PortId, queue: QueueId) -> bool {
        self.contains(port) && queue < self.io.tx_queue_count(port)
    }

    /// Hardware counters for `id`
    pub fn stats(&self, id: PortId) -> Option<PortStats> {
        self.io.port_stats(id)
    }

    /// Underlying packet-I/O collaborator
    pub fn io(&self) -> &Arc<dyn PacketIo> {
        &self.io
    }

    /// Log link state and counters of every port
    pub fn log_port_stats(&self) {
        for &id in &self.ids {
            let link = self.link_state(id);
            match self.stats(id) {
                Some(s) => tracing::info!(
                    port = id,
                    %link,
                    rx_packets = s.rx_packets,
                    rx_missed = s.rx_missed,
                    tx_packets = s.tx_packets,
                    tx_errors = s.tx_errors,
                    "Port stats"
                ),
                None => tracing::info!(port = id, %link, "Port stats unavailable"),
            }
        }
    }
}

impl fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRegistry")
            .field("ports", &self.ports)
            .finish()
    }
}
