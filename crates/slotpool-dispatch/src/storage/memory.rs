//! In-memory job archive.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use slotpool_core::{JobArchive, JobId, JobRecord, RecordFilter, StorageError};

/// In-memory archive implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryArchive {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryArchive {
    /// Create a new in-memory archive.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobArchive for MemoryArchive {
    async fn put(&self, record: JobRecord) -> Result<(), StorageError> {
        self.records
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn list(&self, filter: RecordFilter) -> Result<Vec<JobRecord>, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<JobRecord> = records
            .values()
            .filter(|r| {
                if let Some(outcome) = filter.outcome {
                    if r.result.outcome != outcome {
                        return false;
                    }
                }
                if let Some(ref account) = filter.account {
                    if r.account.as_ref() != Some(account) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        // Newest first; archive time breaks ties between same-second admissions.
        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.archived_at.cmp(&a.archived_at))
        });

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use slotpool_core::{Artifact, ErrorKind, JobResult, JobStatus, Outcome};
    use uuid::Uuid;

    use super::*;

    fn record(account: &str, created_at: i64, result: JobResult) -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            status: result.outcome.into(),
            result,
            account: Some(account.to_string()),
            created_at,
            archived_at: created_at + 1,
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let archive = MemoryArchive::new();
        let rec = record("alpha", 10, JobResult::succeeded(Artifact::text("ok"), 1));
        let id = rec.id;
        archive.put(rec).await.unwrap();

        let got = archive.get(id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Succeeded);
        assert!(archive.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let archive = MemoryArchive::new();
        archive
            .put(record("alpha", 10, JobResult::succeeded(Artifact::text("a"), 1)))
            .await
            .unwrap();
        archive
            .put(record("beta", 20, JobResult::failed(ErrorKind::Fatal, "banned", 1)))
            .await
            .unwrap();
        archive
            .put(record("alpha", 30, JobResult::succeeded(Artifact::text("b"), 2)))
            .await
            .unwrap();

        let all = archive.list(RecordFilter::default()).await.unwrap();
        let times: Vec<_> = all.iter().map(|r| r.created_at).collect();
        assert_eq!(times, vec![30, 20, 10]);

        let alpha = archive
            .list(RecordFilter {
                account: Some("alpha".into()),
                limit: Some(1),
                ..RecordFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].created_at, 30);

        let failed = archive
            .list(RecordFilter {
                outcome: Some(Outcome::Failed),
                ..RecordFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].account.as_deref(), Some("beta"));
    }
}
