//! Online topology change: add/remove a shard without a stop.
//! Migration progress is persisted so a restart resumes rather than
//! re-migrating from scratch.

use chrono::{DateTime, Utc};
use dataplane_core::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    AddShard,
    RemoveShard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub source: String,
    pub target: String,
    pub kind: MigrationKind,
    pub status: MigrationStatus,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MigrationRecord {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: MigrationKind) -> Self {
        Self {
            migration_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            kind,
            status: MigrationStatus::Pending,
            progress: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// Sink for migration progress, implemented by the metadata store.
/// Kept as a trait so the shard router's migration logic doesn't take a
/// hard dependency on the SQL-backed metadata implementation.
#[async_trait::async_trait]
pub trait MigrationProgressSink: Send + Sync {
    async fn record_migration(&self, record: &MigrationRecord);
}

/// No-op sink for callers that don't need durable migration progress
/// (e.g. unit tests); a restart under this sink simply re-migrates.
pub struct NullProgressSink;

#[async_trait::async_trait]
impl MigrationProgressSink for NullProgressSink {
    async fn record_migration(&self, _record: &MigrationRecord) {}
}

/// The host application owns the rows; the router only knows how to ask
/// for the keys living on a shard and how to move one row. A real
/// implementation wraps the host's schema; tests use an in-memory one.
#[async_trait::async_trait]
pub trait ShardDataMover: Send + Sync {
    async fn keys_on_shard(&self, shard_id: &str) -> anyhow::Result<Vec<Value>>;
    /// Copies one row's data to `target_shard_id` under the new
    /// routing. Must be idempotent: a row already present at the
    /// target is a no-op success ("during migration a
    /// row is readable from either source or target").
    async fn copy_row(&self, key: &Value, source_shard_id: &str, target_shard_id: &str) -> anyhow::Result<()>;
    async fn delete_row(&self, key: &Value, source_shard_id: &str) -> anyhow::Result<()>;
}
