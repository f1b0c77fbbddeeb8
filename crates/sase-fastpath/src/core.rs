//! Core Fast Path Engine
//!
//! Run-to-completion packet processing with per-core isolation. The
//! [`Dataplane`] validates the worker assignment, spawns one thread per
//! core and owns the control side of cancellation and stats.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Sender};
use serde::{Deserialize, Serialize};

use crate::dispatch;
use crate::error::{DataplaneError, Result};
use crate::policy::PolicyKind;
use crate::port::{PacketIo, PortRegistry};
use crate::stats::{StatsMonitor, StatsSnapshot};
use crate::worker::{CancelToken, CoreId, Worker, WorkerConfig, WorkerState, WorkerStatus};
use crate::{BURST_SIZE, RX_RING_SIZE};

/// Snapshots buffered between the workers and the control side
pub const STATS_QUEUE_DEPTH: usize = 1024;

/// Fast Path Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Packets requested per receive burst
    pub burst_size: usize,
    /// How often each core drains its counters
    pub stats_interval: Duration,
    /// Forwarding policy instantiated on every worker
    pub policy: PolicyKind,
    /// Destination MAC written into forwarded frames
    pub rewrite_dst_mac: Option<[u8; 6]>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            burst_size: BURST_SIZE,
            stats_interval: Duration::from_secs(1),
            policy: PolicyKind::default(),
            rewrite_dst_mac: None,
        }
    }
}

impl EngineConfig {
    /// Check the configuration before any worker is spawned
    pub fn validate(&self) -> Result<()> {
        if self.burst_size == 0 || self.burst_size > RX_RING_SIZE {
            return Err(DataplaneError::Config(format!(
                "burst size {} outside 1..={}",
                self.burst_size, RX_RING_SIZE
            )));
        }
        if self.stats_interval.is_zero() {
            return Err(DataplaneError::Config("stats interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Per-worker handle
struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    status: Arc<WorkerStatus>,
}

/// Fast Path Engine
///
/// Manages per-core packet processing workers with:
/// - Zero-copy packet buffers
/// - Run-to-completion loops, one per core
/// - Cooperative cancellation
/// - Stats passed by value from each core
pub struct Dataplane {
    config: EngineConfig,
    io: Arc<dyn PacketIo>,
    ports: PortRegistry,
    cancel: CancelToken,
    workers: Vec<WorkerHandle>,
    stats_tx: Sender<StatsSnapshot>,
    monitor: StatsMonitor,
}

impl Dataplane {
    /// Create an engine on top of a packet-I/O collaborator
    pub fn new(config: EngineConfig, io: Arc<dyn PacketIo>) -> Result<Self> {
        config.validate()?;

        let ports = PortRegistry::new(io.clone());
        if ports.is_empty() {
            return Err(DataplaneError::Config("no configured ports".into()));
        }

        let (stats_tx, stats_rx) = bounded(STATS_QUEUE_DEPTH);
        Ok(Self {
            config,
            io,
            ports,
            cancel: CancelToken::new(),
            workers: Vec::new(),
            stats_tx,
            monitor: StatsMonitor::new(stats_rx),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ports with the queue assignments of the current run
    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    /// Map `cores` onto the NIC's queues for the configured policy
    pub fn plan(&self, cores: &[CoreId]) -> Result<Vec<WorkerConfig>> {
        dispatch::plan(cores, &self.ports, &self.config.policy)
    }

    /// Validate `workers` and spawn one thread per entry
    pub fn start(&mut self, workers: Vec<WorkerConfig>) -> Result<()> {
        if self.is_running() {
            return Err(DataplaneError::AlreadyRunning);
        }
        // Reap a previous run
        self.join();
        self.workers.clear();

        let mut ports = PortRegistry::new(self.io.clone());
        dispatch::assign(&workers, &mut ports, &self.config.policy)?;
        self.ports = ports;
        self.cancel = CancelToken::new();

        for config in &workers {
            let worker = Worker::new(
                *config,
                &self.config,
                self.ports.clone(),
                self.cancel.clone(),
                self.stats_tx.clone(),
            );
            let status = worker.status();

            let spawned = thread::Builder::new()
                .name(format!("fpe-worker-{}", config.core))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => self.workers.push(WorkerHandle {
                    thread: Some(handle),
                    status,
                }),
                Err(e) => {
                    tracing::error!(core = config.core, error = %e, "Failed to spawn worker");
                    self.request_stop();
                    self.join();
                    return Err(DataplaneError::SpawnFailed(e.to_string()));
                }
            }
        }

        for port in self.ports.ports() {
            tracing::info!(
                port = port.id,
                link = %self.ports.link_state(port.id),
                rx_queues = ?port.rx_queues,
                tx_queues = ?port.tx_queues,
                "Port assigned"
            );
        }
        tracing::info!(
            workers = self.workers.len(),
            policy = ?self.config.policy,
            burst = self.config.burst_size,
            "Fast Path Engine started"
        );

        Ok(())
    }

    /// Ask every worker to stop after its current iteration
    pub fn request_stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Stopping Fast Path Engine");
        }
        self.cancel.cancel();
    }

    /// Wait for every worker thread to exit
    pub fn join(&mut self) {
        // Keep the stats channel moving so exiting workers never block on it
        while self
            .workers
            .iter()
            .any(|w| w.thread.as_ref().is_some_and(|h| !h.is_finished()))
        {
            self.monitor.collect();
            thread::sleep(Duration::from_millis(1));
        }

        let mut joined = 0;
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    tracing::error!(core = worker.status.core(), "Worker panicked");
                }
                joined += 1;
            }
        }

        if joined > 0 {
            self.monitor.collect();
            self.ports.log_port_stats();
            tracing::info!(workers = joined, "Fast Path Engine stopped");
        }
    }

    /// Wait up to `timeout` for every worker to reach `Terminated`, then
    /// join them. Returns false on timeout; workers keep running.
    pub fn wait_terminated(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.monitor.collect();
            let done = self.workers.iter().all(|w| {
                w.status.state() == WorkerState::Terminated
                    || w.thread.as_ref().map_or(true, |h| h.is_finished())
            });
            if done {
                self.join();
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Check if any worker thread is still alive and not terminated
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| {
            w.thread.as_ref().is_some_and(|h| !h.is_finished())
                && w.status.state() != WorkerState::Terminated
        })
    }

    /// State of every worker of the current run, in start order
    pub fn worker_states(&self) -> Vec<(CoreId, WorkerState)> {
        self.workers
            .iter()
            .map(|w| (w.status.core(), w.status.state()))
            .collect()
    }

    /// Per-core counters drained since the previous call
    pub fn snapshot_stats(&mut self) -> Vec<StatsSnapshot> {
        self.monitor.snapshot_stats()
    }

    /// Aggregate counters since creation
    pub fn total_stats(&mut self) -> StatsSnapshot {
        self.monitor.total()
    }
}

impl Drop for Dataplane {
    fn drop(&mut self) {
        if self.workers.iter().any(|w| w.thread.is_some()) {
            self.request_stop();
            self.join();
        }
    }
}
