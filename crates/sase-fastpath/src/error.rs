//! Error types for the fast path
//!
//! Only startup can fail. Everything that goes wrong once workers are
//! running (malformed frames, full queues, link flaps, pool exhaustion)
//! is counted and logged instead of propagated.

use thiserror::Error;

use crate::port::{PortId, QueueId};

/// Fast path error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataplaneError {
    /// Ring or pool backing storage could not be sized
    #[error("invalid capacity {requested} for {what}")]
    InvalidCapacity {
        /// Which resource was being allocated
        what: &'static str,
        /// Requested capacity
        requested: usize,
    },

    /// Worker/port assignment rejected before any worker was spawned
    #[error("invalid worker assignment: {0}")]
    InvalidAssignment(String),

    /// Port is not part of the configured port set
    #[error("port {0} is not configured")]
    UnknownPort(PortId),

    /// Queue does not exist on the port
    #[error("queue {queue} does not exist on port {port}")]
    UnknownQueue {
        /// Port id
        port: PortId,
        /// Queue id
        queue: QueueId,
    },

    /// Engine configuration rejected
    #[error("config error: {0}")]
    Config(String),

    /// `start` called twice
    #[error("engine already running")]
    AlreadyRunning,

    /// Worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
}

/// Result type for the fast path
pub type Result<T> = std::result::Result<T, DataplaneError>;
