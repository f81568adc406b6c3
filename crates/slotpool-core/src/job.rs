//! Jobs and the per-job status state machine.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{account::AccountId, result::JobResult, slot::SlotId};

/// Job identifier.
pub type JobId = Uuid;

/// A generation request as admitted from the outside world.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    /// Prompt text.
    pub prompt: Option<String>,
    /// Reference images, in order.
    pub images: Vec<Bytes>,
    /// Requested model; the account default applies when absent.
    pub model: Option<String>,
    /// Time budget measured from admission.
    pub deadline: Option<Duration>,
}

impl JobRequest {
    /// Create a text-only request.
    #[must_use]
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            prompt: Some(text.into()),
            ..Self::default()
        }
    }

    /// Append a reference image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<Bytes>) -> Self {
        self.images.push(image.into());
        self
    }

    /// Request a specific model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Bound the whole job (queueing included) by `deadline`.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Job status.
///
/// `Queued → Assigned → Interacting → AwaitingUpstream → Extracting →
/// {Succeeded | Failed | TimedOut | Cancelled}`. The only backward move is a
/// retry, which returns an active job to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a slot.
    Queued,
    /// A slot has been granted, the adapter has not started yet.
    Assigned,
    /// The adapter is driving the session.
    Interacting,
    /// Submission done, waiting for the remote completion signal.
    AwaitingUpstream,
    /// Completion observed, artifact being extracted.
    Extracting,
    /// Artifact delivered.
    Succeeded,
    /// Failed permanently.
    Failed,
    /// A timeout fired.
    TimedOut,
    /// Cancelled before interaction began.
    Cancelled,
}

impl JobStatus {
    /// Whether this is a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether the job holds a slot (Assigned or later, not terminal).
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Assigned | Self::Interacting | Self::AwaitingUpstream | Self::Extracting
        )
    }

    /// Whether a cancel request is still honored.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Queued | Self::Assigned)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Assigned => 1,
            Self::Interacting => 2,
            Self::AwaitingUpstream => 3,
            Self::Extracting => 4,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled => 5,
        }
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Queued => self.is_active(),
            Self::Cancelled => self.is_cancellable(),
            Self::Failed | Self::TimedOut => true,
            Self::Succeeded => self.rank() >= Self::Interacting.rank(),
            Self::Assigned => matches!(self, Self::Queued),
            Self::Interacting | Self::AwaitingUpstream | Self::Extracting => {
                self.is_active() && next.rank() > self.rank()
            }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Interacting => "interacting",
            Self::AwaitingUpstream => "awaiting_upstream",
            Self::Extracting => "extracting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Illegal status transition.
#[derive(Debug, Error)]
#[error("Job {job_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A job tracked from admission to terminal delivery.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier, kept across retries.
    pub id: JobId,
    /// The admitted request.
    pub request: JobRequest,
    /// Admission instant.
    pub admitted_at: Instant,
    /// Admission timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Absolute deadline, if any.
    pub deadline: Option<Instant>,
    /// Number of executions started so far.
    pub attempts: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Current status.
    pub status: JobStatus,
    /// Slot currently (or most recently) holding the job.
    pub slot: Option<SlotId>,
    /// Account of that slot.
    pub account: Option<AccountId>,
    /// Final result once terminal.
    pub result: Option<JobResult>,
}

impl Job {
    /// Create a freshly admitted job.
    #[must_use]
    pub fn new(request: JobRequest, max_retries: u32) -> Self {
        let admitted_at = Instant::now();
        let deadline = request.deadline.map(|d| admitted_at + d);
        Self {
            id: Uuid::new_v4(),
            request,
            admitted_at,
            created_at: unix_now(),
            deadline,
            attempts: 0,
            max_retries,
            status: JobStatus::Queued,
            slot: None,
            account: None,
            result: None,
        }
    }

    /// Move to `next`, validating the transition.
    ///
    /// # Errors
    /// Returns error if the transition is not allowed from the current status.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether another attempt is allowed after the current one fails.
    #[must_use]
    pub const fn retries_left(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Time left before the deadline, or `None` if the job has no deadline.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}

/// What an adapter sees of a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job identifier.
    pub job_id: JobId,
    /// Prompt text.
    pub prompt: Option<String>,
    /// Reference images, in order.
    pub images: Vec<Bytes>,
    /// Resolved model, if the request or account names one.
    pub model: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Current time as Unix epoch seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 9] = [
        JobStatus::Queued,
        JobStatus::Assigned,
        JobStatus::Interacting,
        JobStatus::AwaitingUpstream,
        JobStatus::Extracting,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::TimedOut,
        JobStatus::Cancelled,
    ];

    #[test]
    fn test_happy_path() {
        let mut job = Job::new(JobRequest::prompt("a cat"), 3);
        for next in [
            JobStatus::Assigned,
            JobStatus::Interacting,
            JobStatus::AwaitingUpstream,
            JobStatus::Extracting,
            JobStatus::Succeeded,
        ] {
            job.transition(next).unwrap();
        }
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_terminal_is_final() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_cancel_only_before_interacting() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Assigned.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Interacting.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::AwaitingUpstream.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Extracting.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn test_retry_returns_to_queued_only_from_active() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Interacting.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::AwaitingUpstream.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn test_no_skipping_backwards() {
        assert!(!JobStatus::Extracting.can_transition_to(JobStatus::AwaitingUpstream));
        assert!(!JobStatus::Interacting.can_transition_to(JobStatus::Assigned));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Interacting));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
    }

    #[test]
    fn test_illegal_transition_keeps_status() {
        let mut job = Job::new(JobRequest::default(), 0);
        let err = job.transition(JobStatus::Extracting).unwrap_err();
        assert_eq!(err.from, JobStatus::Queued);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_retry_budget() {
        let mut job = Job::new(JobRequest::default(), 2);
        job.attempts = 2;
        assert!(job.retries_left());
        job.attempts = 3;
        assert!(!job.retries_left());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let job = Job::new(
            JobRequest::prompt("x").with_deadline(Duration::from_secs(10)),
            0,
        );
        assert!(!job.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(job.remaining(Instant::now()), Some(Duration::from_secs(6)));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(job.is_expired(Instant::now()));
    }
}
