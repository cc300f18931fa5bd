//! Module M — Persistence.
//!
//! A small `Storage` trait over the two rows spec.md's comparison report
//! needs to survive a restart: one latency summary per `(session, provider)`
//! and a flat transcript log. `DieselStorage` is the r2d2-pooled Postgres
//! implementation the teacher uses everywhere else in its own tables/
//! module; `MemoryStorage` is a test fake so the session/voice test suites
//! don't need a running Postgres.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use uuid::Uuid;

use crate::schema::{latency_summaries, transcript_log};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<PgConnection>>;

/// Builds the r2d2 pool the same way the teacher's `establish_connection_pool`
/// does, just inlined here now that the connection-pool helper no longer
/// comes from an external crate.
pub fn establish_connection_pool(
    database_url: &str,
) -> Result<DbPool, diesel::r2d2::PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager)
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = latency_summaries)]
pub struct LatencySummaryRow {
    pub id: Uuid,
    pub created: NaiveDateTime,
    pub session_id: Uuid,
    pub provider: String,
    pub sample_count: i32,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub max_latency_ms: f64,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = transcript_log)]
pub struct TranscriptLogRow {
    pub id: Uuid,
    pub created: NaiveDateTime,
    pub session_id: Uuid,
    pub provider: String,
    pub window_id: i64,
    pub revision: i32,
    pub is_final: bool,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
}

/// Persistence seam (spec §4.M). Kept deliberately narrow: the comparison
/// gateway only ever needs to append a latency summary per turn and log
/// transcript rows for later replay/audit.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn save_latency_summary(&self, row: LatencySummaryRow) -> Result<(), StorageError>;
    async fn log_transcript(&self, row: TranscriptLogRow) -> Result<(), StorageError>;
}

pub struct DieselStorage {
    pool: DbPool,
}

impl DieselStorage {
    pub fn new(pool: DbPool) -> Self {
        DieselStorage { pool }
    }
}

#[async_trait::async_trait]
impl Storage for DieselStorage {
    async fn save_latency_summary(&self, row: LatencySummaryRow) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            diesel::insert_into(latency_summaries::table)
                .values(&row)
                .execute(&mut conn)?;
            Ok::<(), StorageError>(())
        })
        .await
        .expect("storage task panicked")
    }

    async fn log_transcript(&self, row: TranscriptLogRow) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            diesel::insert_into(transcript_log::table)
                .values(&row)
                .execute(&mut conn)?;
            Ok::<(), StorageError>(())
        })
        .await
        .expect("storage task panicked")
    }
}

/// In-memory fake used by tests and by deployments run without
/// `DATABASE_URL` set (spec.md treats persistence as best-effort, not a
/// hard dependency of the comparison path).
#[derive(Default)]
pub struct MemoryStorage {
    summaries: std::sync::Mutex<Vec<LatencySummaryRow>>,
    transcripts: std::sync::Mutex<Vec<TranscriptLogRow>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    pub fn summaries(&self) -> Vec<LatencySummaryRow> {
        self.summaries.lock().unwrap().clone()
    }

    pub fn transcripts(&self) -> Vec<TranscriptLogRow> {
        self.transcripts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn save_latency_summary(&self, row: LatencySummaryRow) -> Result<(), StorageError> {
        self.summaries.lock().unwrap().push(row);
        Ok(())
    }

    async fn log_transcript(&self, row: TranscriptLogRow) -> Result<(), StorageError> {
        self.transcripts.lock().unwrap().push(row);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    fn sample_summary() -> LatencySummaryRow {
        LatencySummaryRow {
            id: Uuid::new_v4(),
            created: Utc::now().naive_utc(),
            session_id: Uuid::new_v4(),
            provider: "mock".to_string(),
            sample_count: 3,
            mean_latency_ms: 120.0,
            p50_latency_ms: 110.0,
            p95_latency_ms: 180.0,
            max_latency_ms: 200.0,
        }
    }

    #[tokio::test]
    async fn memory_storage_retains_saved_rows() {
        let storage = MemoryStorage::new();
        storage.save_latency_summary(sample_summary()).await.unwrap();
        assert_eq!(storage.summaries().len(), 1);
    }

    #[tokio::test]
    async fn memory_storage_retains_transcript_rows() {
        let storage = MemoryStorage::new();
        storage
            .log_transcript(TranscriptLogRow {
                id: Uuid::new_v4(),
                created: Utc::now().naive_utc(),
                session_id: Uuid::new_v4(),
                provider: "mock".to_string(),
                window_id: 0,
                revision: 1,
                is_final: true,
                text: "hello".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(storage.transcripts().len(), 1);
    }
}
