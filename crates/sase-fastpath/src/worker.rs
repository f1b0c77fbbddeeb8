//! Per-core worker loop
//!
//! Run-to-completion: receive a burst, classify, decide, transmit, repeat.
//!
//! ```text
//!            packets               no packets
//!   ┌──────────────────────┐ ┌──────────────────┐
//!   ▼                      │ │                  ▼
//! Draining ◄──────────────► Idle (backoff)
//!   │                        │
//!   └──── cancellation ──────┴──► Stopping ──► Terminated
//! ```
//!
//! Cancellation is checked once per iteration, never per packet. Every
//! buffer the worker takes from its RX queue leaves the worker either in a
//! TX queue or back in the pool, including on the way out.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Sender, TrySendError};
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};

use crate::buffer::PacketBuffer;
use crate::classify;
use crate::core::EngineConfig;
use crate::policy::{Action, DropReason, ForwardingPolicy};
use crate::port::{PortId, PortRegistry, QueueId};
use crate::stats::{CoreStats, StatsSnapshot};

/// Execution unit identifier
pub type CoreId = u32;

/// Fixed RX/TX assignment of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Core the worker runs on
    pub core: CoreId,
    /// Port polled for packets
    pub rx_port: PortId,
    /// Queue polled on `rx_port`
    pub rx_queue: QueueId,
    /// Paired egress port
    pub tx_port: PortId,
    /// TX queue this worker owns (on whichever port it transmits to)
    pub tx_queue: QueueId,
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerState {
    /// Last burst was empty
    Idle = 0,
    /// Last burst carried packets
    Draining = 1,
    /// Cancellation observed, disposing of owned buffers
    Stopping = 2,
    /// Loop exited
    Terminated = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Draining,
            2 => WorkerState::Stopping,
            _ => WorkerState::Terminated,
        }
    }
}

/// Worker state published to the control side
#[derive(Debug)]
pub struct WorkerStatus {
    core: CoreId,
    state: AtomicU8,
}

impl WorkerStatus {
    fn new(core: CoreId) -> Self {
        Self {
            core,
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }

    /// Core id
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Current state
    #[inline(always)]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    fn set(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Cooperative cancellation flag (single writer, many readers)
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation was requested
    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Idle backoff between empty bursts
///
/// Spins briefly, then yields the thread, instead of hammering the RX queue
/// and the memory bus shared with sibling cores. Reset on the first
/// non-empty burst.
#[derive(Debug, Default)]
pub struct IdleBackoff {
    backoff: Backoff,
    idle_rounds: u64,
}

impl IdleBackoff {
    /// Fresh backoff
    pub fn new() -> Self {
        Self::default()
    }

    /// Back off after an empty burst
    #[inline]
    pub fn idle(&mut self) {
        self.idle_rounds += 1;
        self.backoff.snooze();
    }

    /// Traffic seen again
    #[inline(always)]
    pub fn reset(&mut self) {
        if self.idle_rounds != 0 {
            self.idle_rounds = 0;
            self.backoff.reset();
        }
    }

    /// Consecutive empty bursts
    pub fn idle_rounds(&self) -> u64 {
        self.idle_rounds
    }

    /// True once the backoff has escalated to yielding the thread
    pub fn is_yielding(&self) -> bool {
        self.backoff.is_completed()
    }
}

/// Per-core worker
pub struct Worker {
    config: WorkerConfig,
    ports: PortRegistry,
    policy: Box<dyn ForwardingPolicy>,
    stats: CoreStats,
    stats_tx: Sender<StatsSnapshot>,
    cancel: CancelToken,
    status: Arc<WorkerStatus>,
    backoff: IdleBackoff,
    burst_size: usize,
    rewrite_dst_mac: Option<[u8; 6]>,
    rx_burst: Vec<PacketBuffer>,
    tx_one: Vec<PacketBuffer>,
}

impl Worker {
    /// Build a worker for `config`
    pub fn new(
        config: WorkerConfig,
        engine: &EngineConfig,
        ports: PortRegistry,
        cancel: CancelToken,
        stats_tx: Sender<StatsSnapshot>,
    ) -> Self {
        Self {
            config,
            policy: engine.policy.build(&config),
            stats: CoreStats::new(config.core, engine.stats_interval, Instant::now()),
            stats_tx,
            cancel,
            status: Arc::new(WorkerStatus::new(config.core)),
            backoff: IdleBackoff::new(),
            burst_size: engine.burst_size,
            rewrite_dst_mac: engine.rewrite_dst_mac,
            rx_burst: Vec::with_capacity(engine.burst_size),
            tx_one: Vec::with_capacity(1),
            ports,
        }
    }

    /// Worker assignment
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Shared status handle
    pub fn status(&self) -> Arc<WorkerStatus> {
        self.status.clone()
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        self.status.state()
    }

    /// Main worker loop (run-to-completion)
    pub fn run(mut self) {
        tracing::info!(
            core = self.config.core,
            rx_port = self.config.rx_port,
            rx_queue = self.config.rx_queue,
            tx_port = self.config.tx_port,
            tx_queue = self.config.tx_queue,
            policy = self.policy.name(),
            "Worker starting"
        );

        while self.step() != WorkerState::Terminated {}

        tracing::info!(core = self.config.core, "Worker stopped");
    }

    /// One loop iteration. Returns the state after it.
    pub fn step(&mut self) -> WorkerState {
        match self.state() {
            WorkerState::Terminated => return WorkerState::Terminated,
            WorkerState::Stopping => return self.shutdown(),
            WorkerState::Idle | WorkerState::Draining => {}
        }

        if self.cancel.is_cancelled() {
            self.status.set(WorkerState::Stopping);
            tracing::debug!(core = self.config.core, "Cancellation observed");
            return self.shutdown();
        }

        let received = self.process_burst();
        let now = Instant::now();
        if self.stats.is_due(now) {
            self.publish(now);
        }

        if received == 0 {
            self.status.set(WorkerState::Idle);
            self.backoff.idle();
            WorkerState::Idle
        } else {
            self.status.set(WorkerState::Draining);
            self.backoff.reset();
            WorkerState::Draining
        }
    }

    /// Receive one burst and dispose of every buffer in it
    #[inline]
    fn process_burst(&mut self) -> usize {
        let received = self.ports.io().receive_burst(
            self.config.rx_port,
            self.config.rx_queue,
            &mut self.rx_burst,
            self.burst_size,
        );
        if received == 0 {
            return 0;
        }

        self.stats.record_rx(received as u64);
        let mut burst = std::mem::take(&mut self.rx_burst);
        for buf in burst.drain(..) {
            self.dispose(buf);
        }
        // Keep the allocation for the next burst
        self.rx_burst = burst;
        received
    }

    #[inline]
    fn dispose(&mut self, buf: PacketBuffer) {
        let meta = match classify::parse(buf.data()) {
            Ok(meta) => meta,
            Err(e) => return self.drop_packet(buf, DropReason::Unclassified(e)),
        };

        match self.policy.decide(&meta, self.config.rx_port, &self.ports) {
            Action::Forward(port) => self.transmit(port, buf),
            Action::Drop(reason) => self.drop_packet(buf, reason),
        }
    }

    #[inline]
    fn transmit(&mut self, port: PortId, mut buf: PacketBuffer) {
        if let Some(mac) = self.rewrite_dst_mac {
            if let Some(data) = buf.data_mut() {
                data[..6].copy_from_slice(&mac);
            }
        }

        self.tx_one.push(buf);
        let accepted = self
            .ports
            .io()
            .transmit_burst(port, self.config.tx_queue, &mut self.tx_one);

        if accepted == 1 {
            self.stats.record_forward();
        } else if let Some(rejected) = self.tx_one.pop() {
            self.drop_packet(rejected, DropReason::TxRejected);
        }
    }

    #[inline]
    fn drop_packet(&mut self, buf: PacketBuffer, reason: DropReason) {
        tracing::trace!(core = self.config.core, %reason, "Packet dropped");
        self.ports.io().release(buf);
        self.stats.record_drop(reason);
    }

    fn publish(&mut self, now: Instant) {
        let snapshot = self.stats.drain(now);
        match self.stats_tx.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(snapshot)) => {
                // Control side is behind; retry on the next drain
                self.stats.requeue(&snapshot);
                metrics::counter!("fastpath_stats_deferred_total", "core" => self.config.core.to_string())
                    .increment(1);
            }
            // The control side may already be gone during teardown.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Hand over the last counters, waiting for room on the channel
    fn publish_final(&mut self, now: Instant) {
        let snapshot = self.stats.drain(now);
        let _ = self.stats_tx.send(snapshot);
    }

    fn shutdown(&mut self) -> WorkerState {
        // Dispose of anything this iteration still owns
        let leftover = std::mem::take(&mut self.rx_burst);
        for buf in leftover {
            self.dispose(buf);
        }
        while let Some(buf) = self.tx_one.pop() {
            self.drop_packet(buf, DropReason::TxRejected);
        }

        self.publish_final(Instant::now());
        self.status.set(WorkerState::Terminated);
        WorkerState::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::policy::PolicyKind;
    use crate::port::LinkState;
    use crate::soft::SoftNic;
    use crossbeam::channel::{bounded, unbounded, Receiver};
    use std::time::Duration;

    const RX: PortId = 0;
    const TX: PortId = 1;

    fn udp_frame() -> Vec<u8> {
        FrameBuilder::udp([10, 0, 0, 1], [10, 0, 0, 2], 4000, 53).payload(16).build()
    }

    fn setup(engine: EngineConfig) -> (Arc<SoftNic>, Worker, CancelToken, Receiver<StatsSnapshot>) {
        let (tx, rx) = unbounded();
        let (nic, worker, cancel) = setup_with(engine, tx);
        (nic, worker, cancel, rx)
    }

    fn setup_with(engine: EngineConfig, stats_tx: Sender<StatsSnapshot>) -> (Arc<SoftNic>, Worker, CancelToken) {
        let nic = Arc::new(
            SoftNic::builder()
                .ports(2)
                .queue_depth(64)
                .pool_capacity(256)
                .build()
                .unwrap(),
        );
        let cancel = CancelToken::new();
        let config = WorkerConfig {
            core: 1,
            rx_port: RX,
            rx_queue: 0,
            tx_port: TX,
            tx_queue: 0,
        };
        let worker = Worker::new(config, &engine, PortRegistry::new(nic.clone()), cancel.clone(), stats_tx);
        (nic, worker, cancel)
    }

    fn total(rx: &Receiver<StatsSnapshot>) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for snap in rx.try_iter() {
            total.merge(&snap);
        }
        total
    }

    #[test]
    fn test_forwards_burst() {
        let (nic, mut worker, _cancel, _rx) = setup(EngineConfig::default());
        for _ in 0..10 {
            nic.inject(RX, 0, &udp_frame()).unwrap();
        }

        assert_eq!(worker.step(), WorkerState::Draining);
        assert_eq!(nic.tx_len(TX, 0), 10);
        assert_eq!(nic.rx_len(RX, 0), 0);
    }

    #[test]
    fn test_burst_size_bounds_receive() {
        let engine = EngineConfig {
            burst_size: 4,
            ..Default::default()
        };
        let (nic, mut worker, _cancel, _rx) = setup(engine);
        for _ in 0..10 {
            nic.inject(RX, 0, &udp_frame()).unwrap();
        }

        worker.step();
        assert_eq!(nic.tx_len(TX, 0), 4);
        assert_eq!(nic.rx_len(RX, 0), 6);
    }

    #[test]
    fn test_unclassified_released() {
        let (nic, mut worker, cancel, rx) = setup(EngineConfig::default());
        nic.inject(RX, 0, &[0u8; 20]).unwrap();
        nic.inject(RX, 0, &udp_frame()).unwrap();

        worker.step();
        assert_eq!(nic.tx_len(TX, 0), 1);
        assert_eq!(nic.pool().borrowed(), 1);

        cancel.cancel();
        worker.step();
        let stats = total(&rx);
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.drops.unclassified, 1);
    }

    #[test]
    fn test_tx_queue_full_releases() {
        let (nic, mut worker, cancel, rx) = setup(EngineConfig::default());
        // TX ring holds 63; the rest must be released, not leaked
        for _ in 0..2 {
            for _ in 0..32 {
                nic.inject(RX, 0, &udp_frame()).unwrap();
            }
            worker.step();
        }
        for _ in 0..10 {
            nic.inject(RX, 0, &udp_frame()).unwrap();
        }
        worker.step();

        assert_eq!(nic.tx_len(TX, 0), 63);
        assert_eq!(nic.pool().borrowed(), 63);

        cancel.cancel();
        worker.step();
        let stats = total(&rx);
        assert_eq!(stats.forwarded, 63);
        assert_eq!(stats.drops.tx_rejected, 11);
    }

    #[test]
    fn test_paired_port_down() {
        let engine = EngineConfig {
            policy: PolicyKind::Paired,
            ..Default::default()
        };
        let (nic, mut worker, cancel, rx) = setup(engine);
        nic.inject(RX, 0, &udp_frame()).unwrap();
        nic.set_link(TX, LinkState::Down);

        worker.step();
        cancel.cancel();
        worker.step();

        assert_eq!(nic.pool().borrowed(), 0);
        assert_eq!(total(&rx).drops.no_route, 1);
    }

    #[test]
    fn test_stop_within_one_iteration_without_leaks() {
        let (nic, mut worker, cancel, rx) = setup(EngineConfig::default());
        for _ in 0..40 {
            nic.inject(RX, 0, &udp_frame()).unwrap();
        }
        assert_eq!(worker.step(), WorkerState::Draining);

        cancel.cancel();
        assert_eq!(worker.step(), WorkerState::Terminated);
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert_eq!(worker.step(), WorkerState::Terminated);

        // Everything the worker took was transmitted; the rest is still
        // queued on the NIC.
        let stats = total(&rx);
        assert_eq!(stats.packets, 32);
        assert_eq!(stats.forwarded + stats.dropped, stats.packets);
        assert_eq!(
            nic.pool().borrowed(),
            nic.tx_len(TX, 0) + nic.rx_len(RX, 0)
        );

        drop(nic.drain_tx(TX, 0));
        drop(nic.drain_rx(RX, 0));
        assert_eq!(nic.pool().borrowed(), 0);
    }

    #[test]
    fn test_idle_backoff_on_empty_burst() {
        let (_nic, mut worker, _cancel, _rx) = setup(EngineConfig::default());
        assert_eq!(worker.step(), WorkerState::Idle);
        assert_eq!(worker.step(), WorkerState::Idle);
        assert_eq!(worker.backoff.idle_rounds(), 2);
    }

    #[test]
    fn test_periodic_drain() {
        let engine = EngineConfig {
            stats_interval: Duration::ZERO,
            ..Default::default()
        };
        let (nic, mut worker, _cancel, rx) = setup(engine);
        nic.inject(RX, 0, &udp_frame()).unwrap();
        worker.step();

        let snap = rx.try_recv().unwrap();
        assert_eq!(snap.core, 1);
        assert_eq!(snap.packets, 1);
        assert_eq!(snap.forwarded, 1);
    }

    #[test]
    fn test_full_stats_channel_keeps_counts() {
        let engine = EngineConfig {
            stats_interval: Duration::ZERO,
            ..Default::default()
        };
        let (tx, rx) = bounded(1);
        let (nic, mut worker, cancel) = setup_with(engine, tx.clone());
        tx.send(StatsSnapshot::default()).unwrap();

        nic.inject(RX, 0, &udp_frame()).unwrap();
        worker.step();
        // Channel was full: nothing new queued, counts held by the worker
        assert_eq!(rx.try_recv().unwrap(), StatsSnapshot::default());
        assert!(rx.try_recv().is_err());

        nic.inject(RX, 0, &udp_frame()).unwrap();
        worker.step();
        let snap = rx.try_recv().unwrap();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.forwarded, 2);

        cancel.cancel();
        assert_eq!(worker.step(), WorkerState::Terminated);
        assert_eq!(rx.try_recv().unwrap().packets, 0);
    }

    #[test]
    fn test_rewrite_dst_mac() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        let engine = EngineConfig {
            rewrite_dst_mac: Some(mac),
            ..Default::default()
        };
        let (nic, mut worker, _cancel, _rx) = setup(engine);
        nic.inject(RX, 0, &udp_frame()).unwrap();
        worker.step();

        let sent = nic.drain_tx(TX, 0);
        assert_eq!(&sent[0].data()[..6], &mac);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_idle_backoff_escalates_and_resets() {
        let mut backoff = IdleBackoff::new();
        for _ in 0..32 {
            backoff.idle();
        }
        assert!(backoff.is_yielding());
        assert_eq!(backoff.idle_rounds(), 32);

        backoff.reset();
        assert_eq!(backoff.idle_rounds(), 0);
        assert!(!backoff.is_yielding());
    }
}
