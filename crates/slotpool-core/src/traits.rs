//! Core traits: the adapter contract, phase reporting and job archiving.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::{Account, AccountId, LaunchConfig},
    job::{JobContext, JobId, JobStatus},
    result::{Artifact, ErrorKind, JobResult, Outcome},
};

/// Classified adapter failure.
///
/// Adapters report exactly one of these per `execute_job` call and never
/// retry internally; retry decisions belong to the dispatcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Retryable: transient navigation or selector failure.
    #[error("Transient failure: {0}")]
    Transient(String),
    /// Non-retryable: expired credentials, ban, surface never ready.
    #[error("Fatal failure: {0}")]
    Fatal(String),
    /// The remote surface returned an explicit error.
    #[error("Upstream error [{code}]: {message}")]
    Upstream { code: String, message: String },
    /// No completion signal within the allowed window.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
    /// Completion observed but the artifact could not be extracted.
    #[error("Extraction failed: {0}")]
    Extraction(String),
}

impl AdapterError {
    /// Create an upstream error.
    #[must_use]
    pub fn upstream(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error kind reported in the job result.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::Extraction(_) => ErrorKind::Extraction,
        }
    }
}

/// Receives job phase changes reported by an adapter.
pub trait PhaseSink: Send + Sync {
    /// Record that `job_id` entered `phase`.
    fn enter_phase(&self, job_id: JobId, phase: JobStatus);
}

/// Handle an adapter uses to report progress through the job phases.
#[derive(Clone)]
pub struct JobProgress {
    job_id: JobId,
    sink: Arc<dyn PhaseSink>,
}

impl JobProgress {
    /// Create a progress handle for `job_id`.
    #[must_use]
    pub fn new(job_id: JobId, sink: Arc<dyn PhaseSink>) -> Self {
        Self { job_id, sink }
    }

    /// Submission is complete; waiting for the remote completion signal.
    pub fn awaiting_upstream(&self) {
        self.sink.enter_phase(self.job_id, JobStatus::AwaitingUpstream);
    }

    /// Completion observed; extracting the artifact.
    pub fn extracting(&self) {
        self.sink.enter_phase(self.job_id, JobStatus::Extracting);
    }
}

/// A progress sink that discards everything.
pub struct NoopPhaseSink;

impl PhaseSink for NoopPhaseSink {
    fn enter_phase(&self, _job_id: JobId, _phase: JobStatus) {}
}

/// Site-specific automation backend.
///
/// Implementations are compile-time known and injected into the dispatcher
/// at construction. The dispatcher guarantees `execute_job` is never called
/// concurrently on the same session.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Opaque automation handle, exclusively owned by one slot.
    type Session: Send + 'static;

    /// Backend name, used in logs.
    fn name(&self) -> &str;

    /// Model identifiers this backend accepts. Empty means any.
    fn supported_models(&self) -> HashSet<String>;

    /// Open an isolated context for `account` and wait until the target
    /// surface is ready.
    ///
    /// # Errors
    /// Returns `AdapterError::Fatal` if the surface never becomes ready
    /// within `config.init_attempts`.
    async fn init_session(
        &self,
        account: &Account,
        config: &LaunchConfig,
    ) -> Result<Self::Session, AdapterError>;

    /// Drive one job to completion, enforcing `timeout`.
    ///
    /// # Errors
    /// Returns the classified failure; `AdapterError::TimedOut` when
    /// `timeout` expires.
    async fn execute_job(
        &self,
        session: &mut Self::Session,
        job: &JobContext,
        timeout: Duration,
        progress: &JobProgress,
    ) -> Result<Artifact, AdapterError>;

    /// Tear down a session before it is recycled or retired.
    async fn close_session(&self, session: Self::Session) {
        drop(session);
    }
}

/// Archived job, written once its result has been delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier.
    pub id: JobId,
    /// Final status reached by the job's state machine.
    pub status: JobStatus,
    /// Result as delivered to the caller.
    pub result: JobResult,
    /// Account of the last slot that ran the job.
    pub account: Option<AccountId>,
    /// Admission timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Archive timestamp.
    pub archived_at: i64,
}

/// Archive filter for queries.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Filter by delivered outcome.
    pub outcome: Option<Outcome>,
    /// Filter by account.
    pub account: Option<AccountId>,
    /// Limit results.
    pub limit: Option<usize>,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for job archive backends.
#[async_trait]
pub trait JobArchive: Send + Sync {
    /// Store a delivered job. Storing the same id twice overwrites.
    async fn put(&self, record: JobRecord) -> Result<(), StorageError>;

    /// Get a record by job ID.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StorageError>;

    /// List records, newest first.
    async fn list(&self, filter: RecordFilter) -> Result<Vec<JobRecord>, StorageError>;
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(JobId, JobStatus)>>);

    impl PhaseSink for Recorder {
        fn enter_phase(&self, job_id: JobId, phase: JobStatus) {
            self.0.lock().push((job_id, phase));
        }
    }

    #[test]
    fn test_progress_reports_phases_in_order() {
        let recorder = Arc::new(Recorder::default());
        let job_id = uuid::Uuid::new_v4();
        let progress = JobProgress::new(job_id, Arc::clone(&recorder) as Arc<dyn PhaseSink>);

        progress.awaiting_upstream();
        progress.extracting();

        assert_eq!(
            *recorder.0.lock(),
            vec![
                (job_id, JobStatus::AwaitingUpstream),
                (job_id, JobStatus::Extracting)
            ]
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(AdapterError::Transient("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(AdapterError::upstream("rate_limited", "x").kind(), ErrorKind::Upstream);
        assert_eq!(
            AdapterError::TimedOut(Duration::from_secs(1)).kind(),
            ErrorKind::TimedOut
        );
    }
}
