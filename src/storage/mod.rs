//! Durable storage seam for failure records.
//!
//! The surrounding client's conversation database is the system of record
//! after persistence; this subsystem remains the only writer of the
//! `recovery_state` and `retry_count` fields. Record deletion is the
//! storage collaborator's concern, triggered by higher-level message
//! deletion, and is deliberately absent from this trait.

mod memory;

pub use memory::MemoryFailureStore;

use crate::types::{DedupKey, FailureCause, FailureRecord, RecordId, RecoveryState};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// A non-terminal record already exists for the same dedup tuple.
    #[error("duplicate failure record for {0}")]
    DuplicateRecord(DedupKey),
    #[error("no failure record with id {0}")]
    NotFound(RecordId),
    #[error("storage backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Partial update applied to a persisted record. Only the fields this
/// subsystem owns are expressible.
#[derive(Debug, Clone, Default)]
pub struct RecordMutation {
    pub recovery_state: Option<RecoveryState>,
    pub retry_count: Option<u32>,
    pub cause: Option<FailureCause>,
    pub plaintext: Option<Bytes>,
}

impl RecordMutation {
    pub fn state(state: RecoveryState) -> Self {
        Self {
            recovery_state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_cause(mut self, cause: FailureCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_plaintext(mut self, plaintext: Bytes) -> Self {
        self.plaintext = Some(plaintext);
        self
    }
}

#[async_trait]
pub trait FailureStore: Send + Sync {
    /// Persists a new record. Fails with [`StorageError::DuplicateRecord`]
    /// when a non-terminal record already exists for the same dedup tuple.
    async fn create_failure_record(&self, record: &FailureRecord) -> Result<()>;

    /// Applies the mutation and returns the updated record.
    async fn update_failure_record(
        &self,
        id: &RecordId,
        mutation: RecordMutation,
    ) -> Result<FailureRecord>;

    /// Most recent record for the tuple, in any state.
    async fn find_failure_record(&self, key: &DedupKey) -> Result<Option<FailureRecord>>;
}
