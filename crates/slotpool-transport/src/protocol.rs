//! Wire protocol for job submission and result delivery.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use slotpool_core::{Artifact, ErrorKind, JobId, JobRequest, JobResult, LifecycleEvent, Outcome};
use thiserror::Error;

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Image blob {index} is not valid base64: {source}")]
    InvalidBlob {
        index: usize,
        source: base64::DecodeError,
    },
    #[error("Submission has neither prompt text nor images")]
    EmptySubmission,
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Inbound job submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
    /// Reference images, base64 encoded, in order.
    #[serde(default)]
    pub image_blobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Time budget in seconds, measured from admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
}

impl SubmitRequest {
    /// Build a submission from raw parts, encoding the images.
    #[must_use]
    pub fn new(prompt: Option<&str>, images: &[&[u8]]) -> Self {
        Self {
            prompt_text: prompt.map(str::to_string),
            image_blobs: images.iter().map(|i| BASE64.encode(i)).collect(),
            model_id: None,
            deadline: None,
        }
    }

    /// Decode into a job request.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidBlob` for an undecodable image and
    /// `ProtocolError::EmptySubmission` when there is nothing to generate from.
    pub fn into_request(self) -> Result<JobRequest, ProtocolError> {
        let prompt = self.prompt_text.filter(|p| !p.trim().is_empty());
        if prompt.is_none() && self.image_blobs.is_empty() {
            return Err(ProtocolError::EmptySubmission);
        }

        let images = self
            .image_blobs
            .iter()
            .enumerate()
            .map(|(index, blob)| {
                BASE64
                    .decode(blob)
                    .map(Bytes::from)
                    .map_err(|source| ProtocolError::InvalidBlob { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobRequest {
            prompt,
            images,
            model: self.model_id,
            deadline: self.deadline.map(Duration::from_secs),
        })
    }
}

impl TryFrom<SubmitRequest> for JobRequest {
    type Error = ProtocolError;

    fn try_from(value: SubmitRequest) -> Result<Self, Self::Error> {
        value.into_request()
    }
}

/// Terminal status as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl From<Outcome> for WireStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => Self::Succeeded,
            Outcome::Failed => Self::Failed,
            Outcome::TimedOut => Self::TimedOut,
            Outcome::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Text,
}

/// How `WireArtifact::data` is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataEncoding {
    Base64,
    Uri,
    Utf8,
}

/// Artifact as delivered on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireArtifact {
    pub kind: ArtifactKind,
    pub data: String,
    pub encoding: DataEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl WireArtifact {
    /// Decode inline image bytes.
    #[must_use]
    pub fn decode_image(&self) -> Option<Vec<u8>> {
        if self.encoding == DataEncoding::Base64 {
            BASE64.decode(&self.data).ok()
        } else {
            None
        }
    }
}

impl From<&Artifact> for WireArtifact {
    fn from(artifact: &Artifact) -> Self {
        match artifact {
            Artifact::Image { data, mime } => Self {
                kind: ArtifactKind::Image,
                data: BASE64.encode(data),
                encoding: DataEncoding::Base64,
                mime: Some(mime.clone()),
            },
            Artifact::ImageUri { uri } => Self {
                kind: ArtifactKind::Image,
                data: uri.clone(),
                encoding: DataEncoding::Uri,
                mime: None,
            },
            Artifact::Text { text } => Self {
                kind: ArtifactKind::Text,
                data: text.clone(),
                encoding: DataEncoding::Utf8,
                mime: None,
            },
        }
    }
}

/// Outbound job result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultMessage {
    pub job_id: JobId,
    pub status: WireStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<WireArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Remote error code for upstream failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl JobResultMessage {
    #[must_use]
    pub fn new(job_id: JobId, result: &JobResult) -> Self {
        let error = result.error.as_ref();
        Self {
            job_id,
            status: result.outcome.into(),
            artifact: result.artifact.as_ref().map(WireArtifact::from),
            error_kind: error.map(|e| e.kind),
            error_message: error.map(|e| e.message.clone()),
            error_code: error.and_then(|e| e.code.clone()),
        }
    }
}

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a job.
    Submit(SubmitRequest),
    /// Cancel a job.
    Cancel { job_id: JobId },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse a JSON message.
    ///
    /// # Errors
    /// Returns `ProtocolError::Json` for malformed input.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Job admitted.
    Accepted { job_id: JobId },
    /// Terminal result.
    Result(JobResultMessage),
    /// Lifecycle event.
    Event { event: LifecycleEvent },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Create a result message.
    #[must_use]
    pub fn result(job_id: JobId, result: &JobResult) -> Self {
        Self::Result(JobResultMessage::new(job_id, result))
    }

    /// Create an error message.
    #[must_use]
    pub fn error(err: &impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_submission_decodes_images() {
        let submit = SubmitRequest::new(Some("a red fox"), &[b"\x89PNG", b"GIF8"]);
        let request = submit.into_request().unwrap();
        assert_eq!(request.prompt.as_deref(), Some("a red fox"));
        assert_eq!(request.images, vec![Bytes::from_static(b"\x89PNG"), Bytes::from_static(b"GIF8")]);
    }

    #[test]
    fn test_submission_parses_camel_case() {
        let submit: SubmitRequest = serde_json::from_str(
            r#"{"promptText": "hi", "modelId": "img-2", "deadline": 30}"#,
        )
        .unwrap();
        let request = JobRequest::try_from(submit).unwrap();
        assert_eq!(request.model.as_deref(), Some("img-2"));
        assert_eq!(request.deadline, Some(Duration::from_secs(30)));
        assert!(request.images.is_empty());
    }

    #[test]
    fn test_bad_blob_is_reported_by_index() {
        let submit = SubmitRequest {
            prompt_text: Some("x".into()),
            image_blobs: vec![BASE64.encode(b"ok"), "not base64!".into()],
            ..SubmitRequest::default()
        };
        let err = submit.into_request().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidBlob { index: 1, .. }));
    }

    #[test]
    fn test_empty_submission_rejected() {
        let submit = SubmitRequest {
            prompt_text: Some("   ".into()),
            ..SubmitRequest::default()
        };
        assert!(matches!(
            submit.into_request(),
            Err(ProtocolError::EmptySubmission)
        ));
    }

    #[test]
    fn test_result_message_shape() {
        let job_id = Uuid::new_v4();
        let timed_out = JobResult::timed_out("no completion signal within 120s", 2);
        let json = serde_json::to_value(JobResultMessage::new(job_id, &timed_out)).unwrap();

        assert_eq!(json["status"], "timedOut");
        assert_eq!(json["errorKind"], "timed_out");
        assert_eq!(json["errorMessage"], "no completion signal within 120s");
        assert!(json.get("artifact").is_none());
    }

    #[test]
    fn test_image_artifact_is_base64() {
        let result = JobResult::succeeded(Artifact::image(&b"\x89PNG"[..], "image/png"), 1);
        let msg = JobResultMessage::new(Uuid::new_v4(), &result);
        let artifact = msg.artifact.unwrap();

        assert_eq!(artifact.kind, ArtifactKind::Image);
        assert_eq!(artifact.mime.as_deref(), Some("image/png"));
        assert_eq!(artifact.decode_image().unwrap(), b"\x89PNG");
    }

    #[test]
    fn test_upstream_error_carries_code() {
        let result = JobResult::upstream("rate_limited", "slow down", 4);
        let msg = JobResultMessage::new(Uuid::new_v4(), &result);
        assert_eq!(msg.status, WireStatus::Failed);
        assert_eq!(msg.error_kind, Some(ErrorKind::Upstream));
        assert_eq!(msg.error_code.as_deref(), Some("rate_limited"));
    }

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::from_json(r#"{"type": "submit", "promptText": "x"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Submit(s) if s.prompt_text.as_deref() == Some("x")));

        let job_id = Uuid::new_v4();
        let json = serde_json::to_string(&ClientMessage::Cancel { job_id }).unwrap();
        assert!(json.contains("cancel"));
        assert!(ClientMessage::from_json("{").is_err());
    }
}
