use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{RecordStore, Version, Versioned};
use crate::error::PipelineError;
use crate::model::{JobRecord, UserRecord};

/// In-memory record store for single-process deployment and tests.
///
/// Versions increment on every successful write; a stale expected version
/// makes the write a no-op, which is exactly the conditional-write contract
/// a hosted document store provides.
#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<String, (Version, UserRecord)>>>,
    jobs: Arc<RwLock<HashMap<String, (Version, JobRecord)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_user(
        &self,
        user_id: &str,
    ) -> Result<Option<Versioned<UserRecord>>, PipelineError> {
        let users = self.users.read().await;
        Ok(users.get(user_id).map(|(version, record)| Versioned {
            value: record.clone(),
            version: *version,
        }))
    }

    async fn store_user(
        &self,
        record: UserRecord,
        expected: Option<Version>,
    ) -> Result<bool, PipelineError> {
        let mut users = self.users.write().await;
        let current = users.get(&record.user_id).map(|(v, _)| *v);
        if current != expected {
            return Ok(false);
        }
        let next = current.map_or(1, |v| v + 1);
        users.insert(record.user_id.clone(), (next, record));
        Ok(true)
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<Versioned<JobRecord>>, PipelineError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(job_id).map(|(version, record)| Versioned {
            value: record.clone(),
            version: *version,
        }))
    }

    async fn store_job(
        &self,
        record: JobRecord,
        expected: Option<Version>,
    ) -> Result<bool, PipelineError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&record.job_id).map(|(v, _)| *v);
        if current != expected {
            return Ok(false);
        }
        let next = current.map_or(1, |v| v + 1);
        jobs.insert(record.job_id.clone(), (next, record));
        Ok(true)
    }
}
