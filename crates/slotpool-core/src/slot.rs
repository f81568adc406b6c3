//! Session slot identity and status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session slot identifier.
///
/// Stable for the slot's whole life: recycling the underlying automation
/// handle never changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Slot status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// No automation handle exists yet.
    Cold,
    /// `init_session` is in progress.
    Launching,
    /// Ready to accept a job.
    Idle,
    /// Running a job.
    Busy,
    /// Excluded from acquisition until recycled.
    Unhealthy,
    /// The automation handle is being torn down.
    Closing,
}

impl SlotStatus {
    /// Whether a slot in this status can be handed a job.
    #[must_use]
    pub const fn is_acquirable(self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cold => "cold",
            Self::Launching => "launching",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unhealthy => "unhealthy",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}
