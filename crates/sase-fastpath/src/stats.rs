//! Engine Statistics
//!
//! Per-core counters are plain integers owned by the worker. They are
//! drained into a [`StatsSnapshot`] on the worker's own clock and the
//! snapshot is sent to the control side by value. No core ever reads
//! another core's counters.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::policy::DropReason;
use crate::worker::CoreId;

/// Drops broken down by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounters {
    /// Classification failures
    pub unclassified: u64,
    /// No eligible egress port
    pub no_route: u64,
    /// Rejected by policy
    pub policy_reject: u64,
    /// TX queue full or link down at transmit
    pub tx_rejected: u64,
}

impl DropCounters {
    #[inline(always)]
    fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::Unclassified(_) => self.unclassified += 1,
            DropReason::NoRoute => self.no_route += 1,
            DropReason::PolicyReject => self.policy_reject += 1,
            DropReason::TxRejected => self.tx_rejected += 1,
        }
    }

    fn merge(&mut self, other: &DropCounters) {
        self.unclassified += other.unclassified;
        self.no_route += other.no_route;
        self.policy_reject += other.policy_reject;
        self.tx_rejected += other.tx_rejected;
    }

    /// Sum over all reasons
    pub fn total(&self) -> u64 {
        self.unclassified + self.no_route + self.policy_reject + self.tx_rejected
    }
}

/// Per-core stats (worker-owned, unsynchronized)
#[derive(Debug)]
pub struct CoreStats {
    core: CoreId,
    packet_count: u64,
    forwarded_count: u64,
    dropped_count: u64,
    drops: DropCounters,
    interval: Duration,
    last_drain: Instant,
    carried: Duration,
}

impl CoreStats {
    /// Counters for `core`, drained every `interval`
    pub fn new(core: CoreId, interval: Duration, now: Instant) -> Self {
        Self {
            core,
            packet_count: 0,
            forwarded_count: 0,
            dropped_count: 0,
            drops: DropCounters::default(),
            interval,
            last_drain: now,
            carried: Duration::ZERO,
        }
    }

    /// Count received packets
    #[inline(always)]
    pub fn record_rx(&mut self, packets: u64) {
        self.packet_count += packets;
    }

    /// Count a forwarded packet
    #[inline(always)]
    pub fn record_forward(&mut self) {
        self.forwarded_count += 1;
    }

    /// Count a dropped packet
    #[inline(always)]
    pub fn record_drop(&mut self, reason: DropReason) {
        self.dropped_count += 1;
        self.drops.record(reason);
    }

    /// Check if the drain interval elapsed on this core's clock
    #[inline(always)]
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_drain) >= self.interval
    }

    /// Emit the counters accumulated since the last drain and reset them
    pub fn drain(&mut self, now: Instant) -> StatsSnapshot {
        let snapshot = StatsSnapshot {
            core: self.core,
            packets: self.packet_count,
            forwarded: self.forwarded_count,
            dropped: self.dropped_count,
            drops: self.drops,
            elapsed: self.carried + now.saturating_duration_since(self.last_drain),
        };

        self.packet_count = 0;
        self.forwarded_count = 0;
        self.dropped_count = 0;
        self.drops = DropCounters::default();
        self.last_drain = now;
        self.carried = Duration::ZERO;

        snapshot
    }

    /// Fold back a drained snapshot the control side could not take yet.
    /// It goes out with the next drain, one interval later.
    pub fn requeue(&mut self, snapshot: &StatsSnapshot) {
        self.packet_count += snapshot.packets;
        self.forwarded_count += snapshot.forwarded;
        self.dropped_count += snapshot.dropped;
        self.drops.merge(&snapshot.drops);
        self.carried += snapshot.elapsed;
    }
}

/// Stats snapshot (passed by value across cores)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Core the counters belong to
    pub core: CoreId,
    /// Packets received
    pub packets: u64,
    /// Packets accepted by a TX queue
    pub forwarded: u64,
    /// Packets released without transmit
    pub dropped: u64,
    /// Drops by reason
    pub drops: DropCounters,
    /// Wall-clock span covered
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Packet rate over the covered span
    pub fn packet_rate_mpps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.packets as f64 / (secs * 1_000_000.0)
    }

    /// Fraction of received packets that were forwarded
    pub fn forward_ratio(&self) -> f64 {
        if self.packets == 0 {
            return 0.0;
        }
        self.forwarded as f64 / self.packets as f64
    }

    /// Fold a later snapshot of the same core into this one
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.packets += other.packets;
        self.forwarded += other.forwarded;
        self.dropped += other.dropped;
        self.drops.merge(&other.drops);
        self.elapsed += other.elapsed;
    }
}

/// Control-side collector of drained snapshots
///
/// Consistency across cores is eventual: a snapshot shows up once its
/// worker drains, never earlier.
pub struct StatsMonitor {
    rx: Receiver<StatsSnapshot>,
    pending: BTreeMap<CoreId, StatsSnapshot>,
    lifetime: BTreeMap<CoreId, StatsSnapshot>,
}

impl StatsMonitor {
    /// Collect from the workers' stats channel
    pub fn new(rx: Receiver<StatsSnapshot>) -> Self {
        Self {
            rx,
            pending: BTreeMap::new(),
            lifetime: BTreeMap::new(),
        }
    }

    /// Pull every snapshot currently queued. Returns how many arrived.
    pub fn collect(&mut self) -> usize {
        let mut received = 0;
        loop {
            match self.rx.try_recv() {
                Ok(snap) => {
                    self.record(&snap);
                    received += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        received
    }

    fn record(&mut self, snap: &StatsSnapshot) {
        if snap.packets > 0 {
            tracing::info!(
                core = snap.core,
                packets = snap.packets,
                forwarded = snap.forwarded,
                dropped = snap.dropped,
                mpps = snap.packet_rate_mpps(),
                "Core processed packets"
            );
        }

        let core = snap.core.to_string();
        metrics::counter!("fastpath_rx_packets_total", "core" => core.clone()).increment(snap.packets);
        metrics::counter!("fastpath_forwarded_total", "core" => core.clone()).increment(snap.forwarded);
        metrics::counter!("fastpath_dropped_total", "core" => core).increment(snap.dropped);

        self.pending
            .entry(snap.core)
            .or_insert_with(|| StatsSnapshot { core: snap.core, ..Default::default() })
            .merge(snap);
        self.lifetime
            .entry(snap.core)
            .or_insert_with(|| StatsSnapshot { core: snap.core, ..Default::default() })
            .merge(snap);
    }

    /// Per-core counters drained since the previous call, ordered by core
    pub fn snapshot_stats(&mut self) -> Vec<StatsSnapshot> {
        self.collect();
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Per-core counters since the engine started
    pub fn lifetime(&mut self) -> Vec<StatsSnapshot> {
        self.collect();
        self.lifetime.values().copied().collect()
    }

    /// Aggregate across all cores since the engine started
    pub fn total(&mut self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for snap in self.lifetime() {
            total.packets += snap.packets;
            total.forwarded += snap.forwarded;
            total.dropped += snap.dropped;
            total.drops.merge(&snap.drops);
            total.elapsed = total.elapsed.max(snap.elapsed);
        }
        total
    }
}
