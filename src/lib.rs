//! # shmport - Shared-Memory Ports for Cross-Process Pub/Sub
//!
//! shmport is the shared-memory coordination layer of a publish/subscribe
//! transport: producer processes deliver buffer descriptors to consumer
//! processes through named shared-memory segments, with liveness detection
//! for crashed consumers.
//!
//! ## Features
//!
//! - **Named port segments**: POSIX shm segments discoverable by
//!   `(domain, port_id)` across processes
//! - **MPMC descriptor ring**: fixed-capacity ring with per-listener
//!   cursors and per-cell reference counts
//! - **Inter-process wakeups**: process-shared mutex and condition
//!   variable living inside the segment
//! - **Liveness watchdog**: one background thread per process detecting
//!   frozen listeners through a heartbeat counter protocol
//! - **Self-healing open**: corrupt or unhealthy ports are removed and
//!   recreated on the next open
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Port segment (shm)                 │
//! ├─────────────────────────────────────────────────┤
//! │  PortNode                │  Descriptor ring     │
//! │  - identity, health      │  - ring node         │
//! │  - ipc mutex + condvar   │  - descriptor cells  │
//! │  - listener heartbeats   │    with ref counts   │
//! └─────────────────────────────────────────────────┘
//!        ▲                ▲                ▲
//!   writer process   reader process   reader process
//!   (Port handle)    (Port+Listener)  (Port+Listener)
//! ```
//!
//! The payloads themselves never travel through a port: descriptors point
//! into other shared segments owned by the outer transport.

pub mod descriptor;
pub mod error;
pub mod global;
pub mod port;
pub mod ring;
pub mod segment;
pub mod sync;
pub mod watchdog;

// Main API re-exports
pub use descriptor::{BufferDescriptor, SegmentId};
pub use error::{PortError, Result};
pub use global::{Domain, PortConfig};
pub use port::{Listener, ListenerStatus, OpenMode, Port, PortNode, PortStats, PushStatus};
pub use ring::{DescriptorRing, RingListener};
pub use segment::{NamedMutex, SharedSegment};
pub use watchdog::FailureHandler;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    /// Hard ceiling on domain name length; segment names embed the domain
    /// and long shm names are a portability hazard
    pub const MAX_DOMAIN_NAME_LENGTH: usize = 16;

    /// Max simultaneous listeners per port (fixed status table size)
    pub const LISTENERS_STATUS_SIZE: usize = 1024;

    /// Well-known name of the port control block inside its segment
    pub const PORT_NODE_OBJECT_NAME: &str = "port_node";

    /// Extra bytes reserved per segment for allocator bookkeeping and
    /// alignment padding
    pub const SEGMENT_EXTRA_BYTES: usize = 512;

    /// Default ring capacity in descriptors
    pub const DEFAULT_MAX_BUFFER_DESCRIPTORS: u32 = 64;

    /// Default upper bound on listener freeze detection
    pub const DEFAULT_HEALTHY_CHECK_TIMEOUT_MS: u32 = 5000;
}
