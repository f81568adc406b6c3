//! Core abstractions for the slotpool job dispatcher.
//!
//! This crate provides the fundamental building blocks:
//! - `Job` / `JobStatus` - Per-job state machine
//! - `JobResult` / `Artifact` - Terminal results
//! - `Adapter` - Contract every automation backend implements
//! - `JobArchive` - Storage for delivered jobs
//! - `ResponseBus` - Scoped one-shot extraction watchers
//! - `EventStore` - Broadcast + history of lifecycle events
//! - `PoolConfig` - Queue, timeout, retry and account configuration

pub mod account;
pub mod config;
pub mod events;
pub mod job;
pub mod result;
pub mod slot;
pub mod traits;
pub mod watcher;

pub use account::{Account, AccountId, LaunchConfig};
pub use config::{AccountConfig, BackoffConfig, ConfigError, PoolConfig, UpstreamPolicy};
pub use events::{EventStore, LifecycleEvent};
pub use job::{Job, JobContext, JobId, JobRequest, JobStatus, TransitionError};
pub use result::{Artifact, ErrorKind, JobError, JobResult, Outcome};
pub use slot::{SlotId, SlotStatus};
pub use traits::{
    Adapter, AdapterError, JobArchive, JobProgress, JobRecord, NoopPhaseSink, PhaseSink,
    RecordFilter, StorageError,
};
pub use watcher::{ExtractionWatcher, ResponseBus, WatchError};
