//! Terminal job results.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl From<Outcome> for JobStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => Self::Succeeded,
            Outcome::Failed => Self::Failed,
            Outcome::TimedOut => Self::TimedOut,
            Outcome::Cancelled => Self::Cancelled,
        }
    }
}

/// Generated output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// Raw image bytes.
    Image { data: Bytes, mime: String },
    /// Image hosted by the remote surface.
    ImageUri { uri: String },
    /// Text response.
    Text { text: String },
}

impl Artifact {
    /// Create a text artifact.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image artifact.
    #[must_use]
    pub fn image(data: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime: mime.into(),
        }
    }
}

/// Error classification carried by a non-successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No slot will ever be able to run the job.
    NoCapacity,
    /// Retryable failure; surfaced once the retry budget is spent.
    Transient,
    /// Non-retryable failure (expired credentials, ban).
    Fatal,
    /// The remote surface returned an explicit error.
    Upstream,
    /// A timeout fired.
    TimedOut,
    /// The artifact could not be extracted.
    Extraction,
    /// The job was cancelled.
    Cancelled,
}

/// Error detail attached to a non-successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Remote error code for `Upstream` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Number of executions it took.
    pub attempts: u32,
}

impl JobResult {
    /// Successful result carrying `artifact`.
    #[must_use]
    pub const fn succeeded(artifact: Artifact, attempts: u32) -> Self {
        Self {
            outcome: Outcome::Succeeded,
            artifact: Some(artifact),
            error: None,
            attempts,
        }
    }

    /// Failed result.
    #[must_use]
    pub fn failed(kind: ErrorKind, message: impl Into<String>, attempts: u32) -> Self {
        Self::errored(Outcome::Failed, kind, message, None, attempts)
    }

    /// Failed result carrying a remote error code.
    #[must_use]
    pub fn upstream(code: impl Into<String>, message: impl Into<String>, attempts: u32) -> Self {
        Self::errored(
            Outcome::Failed,
            ErrorKind::Upstream,
            message,
            Some(code.into()),
            attempts,
        )
    }

    /// Timed-out result.
    #[must_use]
    pub fn timed_out(message: impl Into<String>, attempts: u32) -> Self {
        Self::errored(Outcome::TimedOut, ErrorKind::TimedOut, message, None, attempts)
    }

    /// Cancelled result.
    #[must_use]
    pub fn cancelled(message: impl Into<String>, attempts: u32) -> Self {
        Self::errored(Outcome::Cancelled, ErrorKind::Cancelled, message, None, attempts)
    }

    fn errored(
        outcome: Outcome,
        kind: ErrorKind,
        message: impl Into<String>,
        code: Option<String>,
        attempts: u32,
    ) -> Self {
        Self {
            outcome,
            artifact: None,
            error: Some(JobError {
                kind,
                message: message.into(),
                code,
            }),
            attempts,
        }
    }

    /// Whether the job succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded)
    }

    /// The error kind, if any.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_maps_to_terminal_status() {
        for outcome in [
            Outcome::Succeeded,
            Outcome::Failed,
            Outcome::TimedOut,
            Outcome::Cancelled,
        ] {
            assert!(JobStatus::from(outcome).is_terminal());
        }
    }

    #[test]
    fn test_upstream_result_keeps_code() {
        let result = JobResult::upstream("rate_limited", "slow down", 2);
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.error_kind(), Some(ErrorKind::Upstream));
        assert_eq!(result.error.unwrap().code.as_deref(), Some("rate_limited"));
    }

    #[test]
    fn test_artifact_serialization() {
        let json = serde_json::to_value(Artifact::text("hello")).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hello");
    }
}
