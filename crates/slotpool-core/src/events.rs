//! Lifecycle event store: broadcast + bounded history.

use std::{collections::VecDeque, time::Duration};

use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    account::AccountId,
    job::{JobId, JobStatus},
    result::Outcome,
    slot::{SlotId, SlotStatus},
};

/// Default number of events kept for late subscribers.
const HISTORY_LEN: usize = 4096;

/// Broadcast channel capacity.
const CHANNEL_CAPACITY: usize = 1024;

/// Structured lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    JobAdmitted {
        job_id: JobId,
    },
    JobAssigned {
        job_id: JobId,
        slot: SlotId,
        account: AccountId,
        attempt: u32,
    },
    JobPhase {
        job_id: JobId,
        phase: JobStatus,
    },
    JobRetried {
        job_id: JobId,
        attempt: u32,
        reason: String,
    },
    JobTerminal {
        job_id: JobId,
        outcome: Outcome,
        attempts: u32,
    },
    /// A soft-cancelled job finished; its result was not delivered.
    JobResultDiscarded {
        job_id: JobId,
        outcome: Outcome,
    },
    SoftTimeout {
        job_id: JobId,
        slot: SlotId,
        elapsed_ms: u64,
    },
    SlotHealth {
        slot: SlotId,
        from: SlotStatus,
        to: SlotStatus,
    },
    RecycleStarted {
        slot: SlotId,
    },
    RecycleFinished {
        slot: SlotId,
        ok: bool,
    },
    BridgeOpened {
        upstream: String,
    },
    BridgeClosed {
        upstream: String,
    },
}

impl LifecycleEvent {
    /// Build a soft-timeout event.
    #[must_use]
    pub fn soft_timeout(job_id: JobId, slot: SlotId, elapsed: Duration) -> Self {
        Self::SoftTimeout {
            job_id,
            slot,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Job the event refers to, if any.
    #[must_use]
    pub const fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobAdmitted { job_id }
            | Self::JobAssigned { job_id, .. }
            | Self::JobPhase { job_id, .. }
            | Self::JobRetried { job_id, .. }
            | Self::JobTerminal { job_id, .. }
            | Self::JobResultDiscarded { job_id, .. }
            | Self::SoftTimeout { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

/// Event store with broadcast and history support.
///
/// New subscribers can replay history, then switch to live updates.
pub struct EventStore {
    history: RwLock<VecDeque<LifecycleEvent>>,
    capacity: usize,
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create a store keeping the default amount of history.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HISTORY_LEN)
    }

    /// Create a store keeping at most `capacity` events of history.
    #[must_use]
    pub fn with_history(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            sender,
        }
    }

    /// Push an event to live listeners and history.
    pub fn push(&self, event: LifecycleEvent) {
        let mut history = self.history.write();
        let _ = self.sender.send(event.clone()); // live listeners

        while history.len() >= self.capacity.max(1) {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<LifecycleEvent> {
        self.history.read().iter().cloned().collect()
    }

    /// History entries about one job.
    #[must_use]
    pub fn history_for(&self, job_id: JobId) -> Vec<LifecycleEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.job_id() == Some(job_id))
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, LifecycleEvent> {
        let (history, rx) = {
            // Subscribe under the read lock so nothing slips between the two.
            let guard = self.history.read();
            (guard.iter().cloned().collect::<Vec<_>>(), self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let store = EventStore::with_history(2);
        for _ in 0..3 {
            store.push(LifecycleEvent::RecycleStarted { slot: SlotId(0) });
        }
        store.push(LifecycleEvent::RecycleFinished {
            slot: SlotId(0),
            ok: true,
        });

        let history = store.history();
        assert_eq!(history.len(), 2);
        assert!(matches!(
            history[1],
            LifecycleEvent::RecycleFinished { ok: true, .. }
        ));
    }

    #[test]
    fn test_history_for_job() {
        let store = EventStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.push(LifecycleEvent::JobAdmitted { job_id: a });
        store.push(LifecycleEvent::JobAdmitted { job_id: b });
        store.push(LifecycleEvent::RecycleStarted { slot: SlotId(1) });
        store.push(LifecycleEvent::JobTerminal {
            job_id: a,
            outcome: Outcome::Succeeded,
            attempts: 1,
        });

        assert_eq!(store.history_for(a).len(), 2);
        assert_eq!(store.history_for(b).len(), 1);
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = EventStore::new();
        let job_id = Uuid::new_v4();
        store.push(LifecycleEvent::JobAdmitted { job_id });

        let mut stream = store.history_plus_stream();
        store.push(LifecycleEvent::JobPhase {
            job_id,
            phase: JobStatus::Interacting,
        });

        assert_eq!(
            stream.next().await,
            Some(LifecycleEvent::JobAdmitted { job_id })
        );
        assert_eq!(
            stream.next().await,
            Some(LifecycleEvent::JobPhase {
                job_id,
                phase: JobStatus::Interacting
            })
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = LifecycleEvent::SlotHealth {
            slot: SlotId(3),
            from: SlotStatus::Idle,
            to: SlotStatus::Unhealthy,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "slot_health");
        assert_eq!(json["slot"], 3);
        assert_eq!(json["to"], "unhealthy");
    }
}
