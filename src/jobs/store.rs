//! Job record storage.
//!
//! [`JobStore`] is a minimal key-value contract. Writes that race (claim vs.
//! cancel, finish vs. cancel) go through [`JobStore::compare_and_set`], which
//! only succeeds when the caller saw the latest revision of the record.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::Result;
use crate::types::{JobId, JobRecord};

/// Durable home of job records.
///
/// Failures should be reported as
/// [`PromptgateError::QueueUnavailable`](crate::PromptgateError::QueueUnavailable).
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    /// Insert a new record. Its revision is reset to 0.
    async fn put(&self, record: JobRecord) -> Result<()>;

    /// Replace the record if its stored revision is still `expected_revision`.
    ///
    /// On success the stored copy carries `expected_revision + 1`. Returns
    /// `false` if the record changed or no longer exists.
    async fn compare_and_set(&self, expected_revision: u64, record: JobRecord) -> Result<bool>;

    async fn delete(&self, id: &JobId) -> Result<Option<JobRecord>>;

    /// All records. Used for retention sweeps.
    async fn list(&self) -> Result<Vec<JobRecord>>;
}

/// In-process store over a sharded map.
#[derive(Default)]
pub struct MemoryJobStore {
    records: DashMap<JobId, JobRecord>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn put(&self, mut record: JobRecord) -> Result<()> {
        record.revision = 0;
        self.records.insert(record.id, record);
        Ok(())
    }

    async fn compare_and_set(&self, expected_revision: u64, mut record: JobRecord) -> Result<bool> {
        match self.records.entry(record.id) {
            Entry::Occupied(mut current) if current.get().revision == expected_revision => {
                record.revision = expected_revision + 1;
                current.insert(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.records.remove(id).map(|(_, r)| r))
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}
