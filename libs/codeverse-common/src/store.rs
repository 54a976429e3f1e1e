// Run-record store contract
// The engine only writes transitions through this trait; reads are for status polling.

use crate::types::{Language, RunId, RunRecord, RunUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("failed to (de)serialize run record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run {0} not found")]
    NotFound(RunId),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a record in `queued` state and return its id
    async fn create(&self, owner_id: &str, language: Language, stdin: &str) -> Result<RunId, StoreError>;

    /// Write a status transition into an existing record
    async fn update(&self, run_id: RunId, update: RunUpdate) -> Result<(), StoreError>;

    /// Snapshot of a record, if it exists
    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;
}

/// Process-local store, used by the CLI and tests
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    records: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, owner_id: &str, language: Language, stdin: &str) -> Result<RunId, StoreError> {
        let run_id = Uuid::new_v4();
        let record = RunRecord::queued(run_id, owner_id, language, stdin);
        self.records.write().await.insert(run_id, record);
        Ok(run_id)
    }

    async fn update(&self, run_id: RunId, update: RunUpdate) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&run_id).ok_or(StoreError::NotFound(run_id))?;
        record.apply(update);
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.records.read().await.get(&run_id).cloned())
    }
}
