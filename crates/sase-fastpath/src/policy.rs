//! Forwarding Policy
//!
//! Turns packet metadata plus live link state into `Forward(port)` or
//! `Drop(reason)`. Policies are instantiated per worker, so they may keep
//! private state (sampling counters) without synchronization.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::{ClassifyError, PacketMetadata, Transport};
use crate::port::{PortId, PortRegistry};
use crate::worker::WorkerConfig;

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// No eligible egress port (all alternates down, or single port)
    NoRoute,
    /// Rejected by the active policy
    PolicyReject,
    /// Frame could not be classified
    Unclassified(ClassifyError),
    /// TX queue full or link down at transmit time
    TxRejected,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoRoute => f.write_str("no route"),
            DropReason::PolicyReject => f.write_str("policy reject"),
            DropReason::Unclassified(e) => write!(f, "unclassified: {e}"),
            DropReason::TxRejected => f.write_str("tx rejected"),
        }
    }
}

/// Policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Transmit on this port
    Forward(PortId),
    /// Release the buffer
    Drop(DropReason),
}

/// Forwarding policy trait
pub trait ForwardingPolicy: Send {
    /// Decide what to do with a packet received on `rx_port`.
    ///
    /// Link state must be read from `ports` on every call.
    fn decide(&mut self, meta: &PacketMetadata, rx_port: PortId, ports: &PortRegistry) -> Action;

    /// Policy name (for logs)
    fn name(&self) -> &'static str;
}

/// Next Up port after `rx_port` in configuration order, never `rx_port`.
#[inline]
pub fn next_port_up(rx_port: PortId, ports: &PortRegistry) -> Option<PortId> {
    let ids = ports.ids();
    let n = ids.len();
    // An unconfigured rx_port starts the scan at the first port.
    let (start, span) = match ids.iter().position(|&p| p == rx_port) {
        Some(i) => (i + 1, n - 1),
        None => (0, n),
    };

    (0..span)
        .map(|step| ids[(start + step) % n])
        .find(|&candidate| candidate != rx_port && ports.link_state(candidate).is_up())
}

/// Round-robin to the next configured port that is Up
#[derive(Debug, Default, Clone)]
pub struct RoundRobin;

impl ForwardingPolicy for RoundRobin {
    #[inline]
    fn decide(&mut self, _meta: &PacketMetadata, rx_port: PortId, ports: &PortRegistry) -> Action {
        match next_port_up(rx_port, ports) {
            Some(port) => Action::Forward(port),
            None => Action::Drop(DropReason::NoRoute),
        }
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Drop TCP, forward UDP round-robin, log every Nth decision
#[derive(Debug, Clone)]
pub struct UdpOnly {
    sample_every: u64,
    decisions: u64,
}

impl UdpOnly {
    /// Create with a sampling period (0 disables sampling)
    pub fn new(sample_every: u64) -> Self {
        Self {
            sample_every,
            decisions: 0,
        }
    }

    /// Decisions taken so far
    pub fn decisions(&self) -> u64 {
        self.decisions
    }

    fn sample(&self, meta: &PacketMetadata, rx_port: PortId, action: &Action) {
        if self.sample_every != 0 && self.decisions % self.sample_every == 0 {
            tracing::debug!(
                decision = self.decisions,
                rx_port,
                src = %meta.src_ip,
                src_port = meta.src_port,
                dst = %meta.dst_ip,
                dst_port = meta.dst_port,
                protocol = %meta.protocol,
                ?action,
                "Sampled forwarding decision"
            );
        }
    }
}

impl ForwardingPolicy for UdpOnly {
    fn decide(&mut self, meta: &PacketMetadata, rx_port: PortId, ports: &PortRegistry) -> Action {
        self.decisions += 1;
        let action = match meta.protocol {
            Transport::Tcp => Action::Drop(DropReason::PolicyReject),
            Transport::Udp => RoundRobin.decide(meta, rx_port, ports),
        };
        self.sample(meta, rx_port, &action);
        action
    }

    fn name(&self) -> &'static str {
        "udp-only"
    }
}

/// Forward to the worker's paired TX port while its link is Up
///
/// The paired port may equal the RX port, which echoes traffic back out of
/// the interface it came in on.
#[derive(Debug, Clone)]
pub struct Paired {
    tx_port: PortId,
}

impl Paired {
    /// Pair with `tx_port`
    pub fn new(tx_port: PortId) -> Self {
        Self { tx_port }
    }
}

impl ForwardingPolicy for Paired {
    #[inline]
    fn decide(&mut self, _meta: &PacketMetadata, _rx_port: PortId, ports: &PortRegistry) -> Action {
        if ports.contains(self.tx_port) && ports.link_state(self.tx_port).is_up() {
            Action::Forward(self.tx_port)
        } else {
            Action::Drop(DropReason::NoRoute)
        }
    }

    fn name(&self) -> &'static str {
        "paired"
    }
}

/// Policy selection (runtime configuration)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyKind {
    /// [`RoundRobin`]
    #[default]
    RoundRobin,
    /// [`UdpOnly`]
    UdpOnly {
        /// Log every Nth decision
        sample_every: u64,
    },
    /// [`Paired`]
    Paired,
}

impl PolicyKind {
    /// Instantiate the policy for one worker
    pub fn build(&self, worker: &WorkerConfig) -> Box<dyn ForwardingPolicy> {
        match *self {
            PolicyKind::RoundRobin => Box::new(RoundRobin),
            PolicyKind::UdpOnly { sample_every } => Box::new(UdpOnly::new(sample_every)),
            PolicyKind::Paired => Box::new(Paired::new(worker.tx_port)),
        }
    }

    /// Ports a worker running this policy may transmit on
    pub fn egress_ports(&self, worker: &WorkerConfig, ports: &PortRegistry) -> Vec<PortId> {
        match self {
            PolicyKind::Paired => vec![worker.tx_port],
            PolicyKind::RoundRobin | PolicyKind::UdpOnly { .. } => ports
                .ids()
                .iter()
                .copied()
                .filter(|&p| p != worker.rx_port)
                .collect(),
        }
    }
}
