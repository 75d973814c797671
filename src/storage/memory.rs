use super::{FailureStore, RecordMutation, Result, StorageError};
use crate::types::{DedupKey, FailureRecord, RecordId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    by_id: HashMap<RecordId, FailureRecord>,
    // Dedup tuple -> ids ever created for it, creation order.
    by_tuple: HashMap<DedupKey, Vec<RecordId>>,
}

/// In-memory backend. A real client persists records in its conversation
/// database; this backend serves tests and embedded use.
#[derive(Default)]
pub struct MemoryFailureStore {
    inner: Mutex<Inner>,
}

impl MemoryFailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.lock().by_id.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("Mutex should not be poisoned")
    }
}

#[async_trait]
impl FailureStore for MemoryFailureStore {
    async fn create_failure_record(&self, record: &FailureRecord) -> Result<()> {
        let key = record.dedup_key();
        let mut inner = self.lock();

        let has_live = inner
            .by_tuple
            .get(&key)
            .into_iter()
            .flatten()
            .any(|id| inner.by_id.get(id).is_some_and(|r| !r.is_terminal()));
        if has_live {
            return Err(StorageError::DuplicateRecord(key));
        }

        inner
            .by_tuple
            .entry(key)
            .or_default()
            .push(record.id.clone());
        inner.by_id.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_failure_record(
        &self,
        id: &RecordId,
        mutation: RecordMutation,
    ) -> Result<FailureRecord> {
        let mut inner = self.lock();
        let record = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        if let Some(state) = mutation.recovery_state {
            record.recovery_state = state;
        }
        if let Some(retry_count) = mutation.retry_count {
            record.retry_count = retry_count;
        }
        if let Some(cause) = mutation.cause {
            record.cause = cause;
        }
        if let Some(plaintext) = mutation.plaintext {
            record.plaintext = Some(plaintext);
        }
        Ok(record.clone())
    }

    async fn find_failure_record(&self, key: &DedupKey) -> Result<Option<FailureRecord>> {
        let inner = self.lock();
        Ok(inner
            .by_tuple
            .get(key)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }
}
