//! Job dispatch over a pool of exclusive automation sessions.
//!
//! Provides:
//! - `Dispatcher` - Admission, slot acquisition, retry and failover
//! - `JobQueue` - Capacity-bounded FIFO of waiting jobs
//! - `SessionPool` - Slots, their health and the selection policy
//! - `BridgeRegistry` - Ref-counted proxy bridges shared across slots
//! - Archive implementations (memory)

pub mod backoff;
pub mod bridge;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod queue;
pub mod storage;
mod worker;

pub use bridge::{BridgeConnector, BridgeLease, BridgeRegistry, PassthroughBridge};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherBuilder, JobHandle};
pub use error::DispatchError;
pub use pool::{HealthUpdate, SessionPool, SlotSnapshot};
pub use queue::JobQueue;
pub use storage::MemoryArchive;
