use crate::store::{RunStore, StoreError};
use crate::types::{Language, RunId, RunRecord, RunUpdate};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisResult};
use async_trait::async_trait;
use uuid::Uuid;

/// Redis run-record semantics
/// Keys are deterministic so every process reading a run agrees on where it lives.

pub const RUN_PREFIX: &str = "codeverse:run";

/// Records expire after 24 hours
pub const RUN_TTL_SECONDS: u64 = 86400;

/// Generate the record key for a run
pub fn run_key(run_id: &Uuid) -> String {
    format!("{}:{}", RUN_PREFIX, run_id)
}

/// Store a run record with TTL
pub async fn store_record(conn: &mut ConnectionManager, record: &RunRecord) -> Result<(), StoreError> {
    let payload = serde_json::to_string(record)?;
    let _: () = conn.set_ex(run_key(&record.run_id), payload, RUN_TTL_SECONDS as _).await?;
    Ok(())
}

/// Retrieve a run record
pub async fn load_record(conn: &mut ConnectionManager, run_id: &Uuid) -> Result<Option<RunRecord>, StoreError> {
    let payload: Option<String> = conn.get(run_key(run_id)).await?;

    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

/// Run store backed by Redis string keys holding JSON records
#[derive(Clone)]
pub struct RedisRunStore {
    conn: ConnectionManager,
}

impl RedisRunStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Open a managed connection to `redis_url`
    pub async fn connect(redis_url: &str) -> RedisResult<Self> {
        let client = ::redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RunStore for RedisRunStore {
    async fn create(&self, owner_id: &str, language: Language, stdin: &str) -> Result<RunId, StoreError> {
        let mut conn = self.conn.clone();
        let record = RunRecord::queued(Uuid::new_v4(), owner_id, language, stdin);
        store_record(&mut conn, &record).await?;
        Ok(record.run_id)
    }

    async fn update(&self, run_id: RunId, update: RunUpdate) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut record = load_record(&mut conn, &run_id)
            .await?
            .ok_or(StoreError::NotFound(run_id))?;
        record.apply(update);
        store_record(&mut conn, &record).await
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let mut conn = self.conn.clone();
        load_record(&mut conn, &run_id).await
    }
}
