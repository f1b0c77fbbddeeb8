//! Core to port/queue mapping
//!
//! Worker `i` of `n` ports polls RX queue `i / n` of port `i % n` and is
//! paired with the next port. A worker transmits on its own TX queue id on
//! every port its policy can pick (its egress ports), so a `(port, queue)`
//! TX pair may belong to at most one worker. On a NIC with one TX queue per
//! port, two ports with one worker each both use queue 0.

use std::collections::HashSet;

use crate::error::{DataplaneError, Result};
use crate::policy::PolicyKind;
use crate::port::{PortId, PortRegistry, QueueId};
use crate::worker::{CoreId, WorkerConfig};

/// Build worker assignments for `cores` over the queues `ports` has set up
pub fn plan(cores: &[CoreId], ports: &PortRegistry, policy: &PolicyKind) -> Result<Vec<WorkerConfig>> {
    if cores.is_empty() {
        return Err(DataplaneError::InvalidAssignment("no worker cores".into()));
    }
    let ids = ports.ids();
    if ids.is_empty() {
        return Err(DataplaneError::InvalidAssignment("no ports".into()));
    }

    let n = ids.len();
    let mut taken = HashSet::new();
    let mut configs = Vec::with_capacity(cores.len());

    for (i, &core) in cores.iter().enumerate() {
        let rx_port = ids[i % n];
        let rx_queue = QueueId::try_from(i / n).map_err(|_| {
            DataplaneError::InvalidAssignment(format!("{} cores exceed the queue id space", cores.len()))
        })?;
        if !ports.has_rx_queue(rx_port, rx_queue) {
            return Err(DataplaneError::UnknownQueue {
                port: rx_port,
                queue: rx_queue,
            });
        }

        let mut config = WorkerConfig {
            core,
            rx_port,
            rx_queue,
            tx_port: ids[(i + 1) % n],
            tx_queue: 0,
        };
        let egress = policy.egress_ports(&config, ports);
        config.tx_queue = free_tx_queue(&egress, ports, &taken).ok_or_else(|| {
            DataplaneError::InvalidAssignment(format!("no free tx queue for core {core}"))
        })?;
        taken.extend(egress.iter().map(|&port| (port, config.tx_queue)));
        configs.push(config);
    }

    Ok(configs)
}

/// Lowest queue id set up and unowned on every egress port
fn free_tx_queue(
    egress: &[PortId],
    ports: &PortRegistry,
    taken: &HashSet<(PortId, QueueId)>,
) -> Option<QueueId> {
    // No egress port: the worker never transmits
    let Some(limit) = egress.iter().map(|&p| ports.tx_queue_count(p)).min() else {
        return Some(0);
    };
    (0..limit).find(|&queue| egress.iter().all(|&port| !taken.contains(&(port, queue))))
}

/// Reject assignments naming missing queues or breaking single ownership
pub fn validate(configs: &[WorkerConfig], ports: &PortRegistry, policy: &PolicyKind) -> Result<()> {
    if configs.is_empty() {
        return Err(DataplaneError::InvalidAssignment("no workers".into()));
    }

    let mut cores = HashSet::new();
    let mut rx = HashSet::new();
    let mut tx = HashSet::new();

    for c in configs {
        for port in [c.rx_port, c.tx_port] {
            if !ports.contains(port) {
                return Err(DataplaneError::UnknownPort(port));
            }
        }
        if !cores.insert(c.core) {
            return Err(DataplaneError::InvalidAssignment(format!(
                "core {} assigned twice",
                c.core
            )));
        }

        if !ports.has_rx_queue(c.rx_port, c.rx_queue) {
            return Err(DataplaneError::UnknownQueue {
                port: c.rx_port,
                queue: c.rx_queue,
            });
        }
        if !rx.insert((c.rx_port, c.rx_queue)) {
            return Err(DataplaneError::InvalidAssignment(format!(
                "rx queue {} of port {} polled by more than one core",
                c.rx_queue, c.rx_port
            )));
        }

        for port in policy.egress_ports(c, ports) {
            if !ports.has_tx_queue(port, c.tx_queue) {
                return Err(DataplaneError::UnknownQueue {
                    port,
                    queue: c.tx_queue,
                });
            }
            if !tx.insert((port, c.tx_queue)) {
                return Err(DataplaneError::InvalidAssignment(format!(
                    "tx queue {} of port {} owned by more than one core",
                    c.tx_queue, port
                )));
            }
        }
    }
    Ok(())
}

/// Validate and record the queue assignments on `ports`
pub fn assign(configs: &[WorkerConfig], ports: &mut PortRegistry, policy: &PolicyKind) -> Result<()> {
    validate(configs, ports, policy)?;
    for c in configs {
        ports.assign_rx(c.rx_port, c.rx_queue);
        for port in policy.egress_ports(c, ports) {
            ports.assign_tx(port, c.tx_queue);
        }
        tracing::debug!(
            core = c.core,
            rx_port = c.rx_port,
            rx_queue = c.rx_queue,
            tx_port = c.tx_port,
            tx_queue = c.tx_queue,
            "Worker assigned"
        );
    }
    Ok(())
}
