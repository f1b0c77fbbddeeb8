//! OpenSASE Fast Path Data Plane
//!
//! Multi-core packet forwarding on top of a kernel-bypass NIC driver.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        FAST PATH DATAPLANE                       │
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐            │
//! │  │   Core 0     │  │   Core 1     │  │   Core N     │            │
//! │  │ ┌──────────┐ │  │ ┌──────────┐ │  │ ┌──────────┐ │            │
//! │  │ │ RX Queue │ │  │ │ RX Queue │ │  │ │ RX Queue │ │            │
//! │  │ └────┬─────┘ │  │ └────┬─────┘ │  │ └────┬─────┘ │            │
//! │  │      ▼       │  │      ▼       │  │      ▼       │            │
//! │  │ ┌──────────┐ │  │ ┌──────────┐ │  │ ┌──────────┐ │            │
//! │  │ │ Classify │ │  │ │ Classify │ │  │ │ Classify │ │            │
//! │  │ └────┬─────┘ │  │ └────┬─────┘ │  │ └────┬─────┘ │            │
//! │  │      ▼       │  │      ▼       │  │      ▼       │            │
//! │  │ ┌──────────┐ │  │ ┌──────────┐ │  │ ┌──────────┐ │            │
//! │  │ │  Policy  │ │  │ │  Policy  │ │  │ │  Policy  │ │            │
//! │  │ └────┬─────┘ │  │ └────┬─────┘ │  │ └────┬─────┘ │            │
//! │  │      ▼       │  │      ▼       │  │      ▼       │            │
//! │  │ ┌──────────┐ │  │ ┌──────────┐ │  │ ┌──────────┐ │            │
//! │  │ │ TX Queue │ │  │ │ TX Queue │ │  │ │ TX Queue │ │            │
//! │  │ └──────────┘ │  │ └──────────┘ │  │ └──────────┘ │            │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘            │
//! │         └─── StatsSnapshot (by value) ──────┴──► StatsMonitor    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! 1. **Run-to-Completion**: each core polls, classifies and transmits its
//!    own burst, no hand-off between cores
//! 2. **Per-Core Isolation**: counters and policy state live on the core
//! 3. **Zero-Copy**: buffers move between queues as handles
//! 4. **Burst Processing**: 32 packets per receive
//! 5. **Cooperative Stop**: checked once per iteration, no buffer leaks
//!
//! The NIC itself is behind [`PacketIo`]; [`SoftNic`] provides an
//! in-memory implementation.

#![warn(missing_docs)]

pub mod buffer;
pub mod classify;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod policy;
pub mod port;
pub mod ring;
pub mod soft;
pub mod stats;
pub mod worker;

pub use buffer::{BufferPool, PacketBuffer};
pub use classify::{ClassifyError, PacketMetadata, Transport};
pub use crate::core::{Dataplane, EngineConfig};
pub use error::{DataplaneError, Result};
pub use policy::{Action, DropReason, ForwardingPolicy, PolicyKind};
pub use port::{LinkState, PacketIo, PortId, PortRegistry, QueueId};
pub use ring::RingBuffer;
pub use soft::SoftNic;
pub use stats::{StatsMonitor, StatsSnapshot};
pub use worker::{CancelToken, CoreId, WorkerConfig, WorkerState};

/// Packets requested per receive burst
pub const BURST_SIZE: usize = 32;

/// RX descriptors per queue
pub const RX_RING_SIZE: usize = 1024;

/// TX descriptors per queue
pub const TX_RING_SIZE: usize = 1024;
