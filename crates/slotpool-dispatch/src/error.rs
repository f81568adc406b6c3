//! Dispatcher errors.

use slotpool_core::{AccountId, ConfigError, JobId, SlotId, StorageError};
use thiserror::Error;

/// Dispatcher error.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("No session slots available to run jobs")]
    NoCapacity,
    #[error("Job {0} is already running")]
    AlreadyRunning(JobId),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),
    #[error("Account already registered: {0}")]
    DuplicateAccount(AccountId),
    #[error("Unknown slot: {0}")]
    UnknownSlot(SlotId),
    #[error("Slot {0} is running a job")]
    SlotBusy(SlotId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
