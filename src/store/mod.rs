pub mod memory;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::model::{JobRecord, UserRecord};

pub use memory::MemoryStore;

/// Monotonic record version used for optimistic concurrency
pub type Version = u64;

/// A record paired with the version it was read at
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Transactional document store holding the user and job records.
///
/// `store_*` succeeds only when the record is still at the expected version,
/// which is the compare-and-swap primitive every claim and counter update in
/// the pipeline is built on. Any backend with atomic conditional writes can
/// implement this.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_user(&self, user_id: &str) -> Result<Option<Versioned<UserRecord>>, PipelineError>;

    /// Conditional write; returns false when the version check failed
    async fn store_user(
        &self,
        record: UserRecord,
        expected: Option<Version>,
    ) -> Result<bool, PipelineError>;

    async fn load_job(&self, job_id: &str) -> Result<Option<Versioned<JobRecord>>, PipelineError>;

    async fn store_job(
        &self,
        record: JobRecord,
        expected: Option<Version>,
    ) -> Result<bool, PipelineError>;
}

/// Retry budget for the optimistic transaction loops
const MAX_TX_ATTEMPTS: usize = 8;

/// Outcome of a guarded mutation inside a transaction
pub enum TxDecision<T> {
    /// Write the mutated record and return the value
    Commit(T),
    /// Guard failed; drop the mutation and return the value without writing
    Skip(T),
}

/// Run a read-modify-write transaction on a user record.
///
/// The closure receives the current record (created fresh when absent) and
/// either commits a mutation or skips. A version conflict reloads and retries;
/// an error from the closure aborts with nothing written.
pub async fn with_user<S, F, T>(store: &S, user_id: &str, mut f: F) -> Result<T, PipelineError>
where
    S: RecordStore + ?Sized,
    F: FnMut(&mut UserRecord) -> Result<TxDecision<T>, PipelineError>,
{
    for _ in 0..MAX_TX_ATTEMPTS {
        let loaded = store.load_user(user_id).await?;
        let (mut record, expected) = match loaded {
            Some(v) => (v.value, Some(v.version)),
            None => (UserRecord::new(user_id), None),
        };

        match f(&mut record)? {
            TxDecision::Commit(value) => {
                if store.store_user(record, expected).await? {
                    return Ok(value);
                }
            }
            TxDecision::Skip(value) => return Ok(value),
        }
    }

    Err(PipelineError::TxConflict(format!("user/{user_id}")))
}

/// Run a read-modify-write transaction on an existing job record.
pub async fn with_job<S, F, T>(store: &S, job_id: &str, mut f: F) -> Result<T, PipelineError>
where
    S: RecordStore + ?Sized,
    F: FnMut(&mut JobRecord) -> Result<TxDecision<T>, PipelineError>,
{
    for _ in 0..MAX_TX_ATTEMPTS {
        let loaded = store
            .load_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job/{job_id}")))?;

        let mut record = loaded.value;
        match f(&mut record)? {
            TxDecision::Commit(value) => {
                if store.store_job(record, Some(loaded.version)).await? {
                    return Ok(value);
                }
            }
            TxDecision::Skip(value) => return Ok(value),
        }
    }

    Err(PipelineError::TxConflict(format!("job/{job_id}")))
}
