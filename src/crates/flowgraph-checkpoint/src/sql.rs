//! Relational checkpoint store.
//!
//! Three tables hold a thread's checkpoint tree:
//!
//! ```text
//! checkpoints        (thread_id, checkpoint_id, parent_checkpoint_id, "values", metadata, created_at)
//! checkpoint_writes  (thread_id, checkpoint_id, task_id, idx, channel, value)
//! checkpoint_blobs   (thread_id, channel, version, type, value)
//! ```
//!
//! `put` runs in a single transaction. State values whose encoded size
//! exceeds [`SqlCheckpointStore::blob_threshold`] are extracted into
//! `checkpoint_blobs` and stored in the checkpoint row as a reference; loads
//! resolve the references transparently. Statement caching can be disabled
//! for connection poolers that forbid prepared statements.

use crate::checkpoint::{Checkpoint, TaskDescriptor};
use crate::error::{CheckpointError, Result};
use crate::serializer::{TaggedBinarySerializer, ValueSerializer};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use tracing::debug;

const BLOB_REF_KEY: &str = "__blob_ref__";
const DEFAULT_BLOB_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, FromRow)]
struct CheckpointRow {
    checkpoint_id: String,
    parent_checkpoint_id: Option<String>,
    values: Vec<u8>,
    metadata: Vec<u8>,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    next_nodes: Vec<String>,
    tasks: Vec<TaskDescriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobRef {
    channel: String,
    version: String,
}

/// SQL-backed [`CheckpointStore`].
#[derive(Clone)]
pub struct SqlCheckpointStore {
    pool: SqlitePool,
    serializer: Arc<dyn ValueSerializer>,
    blob_threshold: usize,
    prepared_statements: bool,
}

impl SqlCheckpointStore {
    /// Connect and bootstrap the schema. In-memory databases are pinned to
    /// one connection, each sqlite connection gets its own `:memory:` store.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and bootstrap the schema.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self {
            pool,
            serializer: Arc::new(TaggedBinarySerializer::new()),
            blob_threshold: DEFAULT_BLOB_THRESHOLD,
            prepared_statements: true,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Swap the value serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn ValueSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Size above which a state value is extracted into `checkpoint_blobs`.
    pub fn with_blob_threshold(mut self, bytes: usize) -> Self {
        self.blob_threshold = bytes;
        self
    }

    /// Disable prepared-statement caching. Needed behind poolers that reject
    /// prepared statements.
    pub fn with_prepared_statements(mut self, enabled: bool) -> Self {
        self.prepared_statements = enabled;
        self
    }

    async fn ensure_schema(&self) -> Result<()> {
        let ddl = [
            r#"CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                parent_checkpoint_id TEXT,
                "values" BLOB NOT NULL,
                metadata BLOB NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_id)
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_created
                ON checkpoints (thread_id, created_at DESC)"#,
            r#"CREATE TABLE IF NOT EXISTS checkpoint_writes (
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                channel TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_id, task_id, idx)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS checkpoint_blobs (
                thread_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                version TEXT NOT NULL,
                type TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (thread_id, channel, version)
            )"#,
        ];
        for statement in ddl {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn blob_ref(channel: &str, version: &str) -> Value {
        serde_json::json!({
            BLOB_REF_KEY: { "channel": channel, "version": version }
        })
    }

    fn as_blob_ref(value: &Value) -> Option<BlobRef> {
        value
            .as_object()
            .and_then(|obj| obj.get(BLOB_REF_KEY))
            .and_then(|inner| serde_json::from_value(inner.clone()).ok())
    }

    async fn row_to_checkpoint(&self, thread_id: &str, row: CheckpointRow) -> Result<Checkpoint> {
        let stored = self.serializer.loads(&row.values)?;
        let Value::Object(stored) = stored else {
            return Err(CheckpointError::Serialization(
                "checkpoint values payload is not an object".into(),
            ));
        };

        let mut values = Map::with_capacity(stored.len());
        for (channel, value) in stored {
            if let Some(blob_ref) = Self::as_blob_ref(&value) {
                values.insert(channel, self.load_blob(thread_id, &blob_ref).await?);
            } else {
                values.insert(channel, value);
            }
        }

        let meta: CheckpointMeta = serde_json::from_slice(&row.metadata)?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?
            .with_timezone(&Utc);

        Ok(Checkpoint {
            id: row.checkpoint_id,
            parent_id: row.parent_checkpoint_id,
            values,
            next_nodes: meta.next_nodes,
            tasks: meta.tasks,
            created_at,
        })
    }

    async fn load_blob(&self, thread_id: &str, blob_ref: &BlobRef) -> Result<Value> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM checkpoint_blobs WHERE thread_id = ? AND channel = ? AND version = ?",
        )
        .bind(thread_id)
        .bind(&blob_ref.channel)
        .bind(&blob_ref.version)
        .persistent(self.prepared_statements)
        .fetch_optional(&self.pool)
        .await?;
        let (bytes,) = row.ok_or_else(|| {
            CheckpointError::NotFound(format!(
                "blob {}@{} for thread {thread_id}",
                blob_ref.channel, blob_ref.version
            ))
        })?;
        self.serializer.loads(&bytes)
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mut stored = Map::with_capacity(checkpoint.values.len());
        for (channel, value) in &checkpoint.values {
            let encoded = self.serializer.dumps(value)?;
            if encoded.len() > self.blob_threshold {
                debug!(
                    thread_id,
                    channel,
                    bytes = encoded.len(),
                    "extracting oversized state value into checkpoint_blobs"
                );
                sqlx::query(
                    "INSERT INTO checkpoint_blobs (thread_id, channel, version, type, value)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT (thread_id, channel, version) DO UPDATE SET value = excluded.value",
                )
                .bind(thread_id)
                .bind(channel)
                .bind(&checkpoint.id)
                .bind(self.serializer.name())
                .bind(&encoded)
                .persistent(self.prepared_statements)
                .execute(&mut *tx)
                .await?;
                stored.insert(channel.clone(), Self::blob_ref(channel, &checkpoint.id));
            } else {
                stored.insert(channel.clone(), value.clone());
            }
        }

        let values_bytes = self.serializer.dumps(&Value::Object(stored))?;
        let metadata = serde_json::to_vec(&CheckpointMeta {
            next_nodes: checkpoint.next_nodes.clone(),
            tasks: checkpoint.tasks.clone(),
        })?;

        sqlx::query(
            r#"INSERT INTO checkpoints
                   (thread_id, checkpoint_id, parent_checkpoint_id, "values", metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT (thread_id, checkpoint_id) DO UPDATE SET
                   "values" = excluded."values",
                   metadata = excluded.metadata"#,
        )
        .bind(thread_id)
        .bind(&checkpoint.id)
        .bind(&checkpoint.parent_id)
        .bind(&values_bytes)
        .bind(&metadata)
        .bind(checkpoint.created_at.to_rfc3339())
        .persistent(self.prepared_statements)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"SELECT checkpoint_id, parent_checkpoint_id, "values", metadata, created_at
               FROM checkpoints
               WHERE thread_id = ?
               ORDER BY created_at DESC, rowid DESC
               LIMIT 1"#,
        )
        .bind(thread_id)
        .persistent(self.prepared_statements)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_checkpoint(thread_id, row).await?)),
            None => Ok(None),
        }
    }

    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"SELECT checkpoint_id, parent_checkpoint_id, "values", metadata, created_at
               FROM checkpoints
               WHERE thread_id = ? AND checkpoint_id = ?"#,
        )
        .bind(thread_id)
        .bind(checkpoint_id)
        .persistent(self.prepared_statements)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_checkpoint(thread_id, row).await?)),
            None => Ok(None),
        }
    }

    async fn list_ancestry(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(
            r#"SELECT checkpoint_id, parent_checkpoint_id, "values", metadata, created_at
               FROM checkpoints
               WHERE thread_id = ?
               ORDER BY created_at DESC, rowid DESC"#,
        )
        .bind(thread_id)
        .persistent(self.prepared_statements)
        .fetch_all(&self.pool)
        .await?;

        let mut all = Vec::with_capacity(rows.len());
        for row in rows {
            all.push(self.row_to_checkpoint(thread_id, row).await?);
        }

        // Newest row is the leaf; follow parent pointers from there.
        let mut chain = Vec::new();
        let mut cursor = all.first().map(|c| c.id.clone());
        while let Some(id) = cursor {
            let Some(checkpoint) = all.iter().find(|c| c.id == id) else {
                break;
            };
            cursor = checkpoint.parent_id.clone();
            chain.push(checkpoint.clone());
        }
        Ok(chain)
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        task_id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (idx, (channel, value)) in writes.into_iter().enumerate() {
            let encoded = self.serializer.dumps(&value)?;
            sqlx::query(
                "INSERT INTO checkpoint_writes (thread_id, checkpoint_id, task_id, idx, channel, value)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (thread_id, checkpoint_id, task_id, idx) DO UPDATE SET
                     channel = excluded.channel,
                     value = excluded.value",
            )
            .bind(thread_id)
            .bind(checkpoint_id)
            .bind(task_id)
            .bind(idx as i64)
            .bind(&channel)
            .bind(&encoded)
            .persistent(self.prepared_statements)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["checkpoint_writes", "checkpoint_blobs", "checkpoints"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE thread_id = ?"))
                .bind(thread_id)
                .persistent(self.prepared_statements)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqlCheckpointStore {
        SqlCheckpointStore::connect("sqlite::memory:").await.unwrap()
    }

    fn checkpoint_with(parent: Option<String>, step: i64) -> Checkpoint {
        let mut values = Map::new();
        values.insert("step".into(), json!(step));
        Checkpoint::new(parent, values, vec!["agent".into()], vec![])
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = store().await;
        let cp = checkpoint_with(None, 1);
        store.put("t1", &cp).await.unwrap();
        let loaded = store.get("t1", &cp.id).await.unwrap().unwrap();
        assert_eq!(loaded.values, cp.values);
        assert_eq!(loaded.next_nodes, cp.next_nodes);
        assert_eq!(loaded.parent_id, cp.parent_id);
    }

    #[tokio::test]
    async fn latest_is_newest_row() {
        let store = store().await;
        let root = checkpoint_with(None, 0);
        let leaf = checkpoint_with(Some(root.id.clone()), 1);
        store.put("t1", &root).await.unwrap();
        store.put("t1", &leaf).await.unwrap();
        assert_eq!(store.get_latest("t1").await.unwrap().unwrap().id, leaf.id);
    }

    #[tokio::test]
    async fn oversized_values_go_through_blobs() {
        let store = store().await.with_blob_threshold(64);
        let mut values = Map::new();
        values.insert("chapters".into(), json!(vec!["x".repeat(512)]));
        let cp = Checkpoint::new(None, values.clone(), vec![], vec![]);
        store.put("t1", &cp).await.unwrap();
        let loaded = store.get("t1", &cp.id).await.unwrap().unwrap();
        assert_eq!(loaded.values, values);
    }

    #[tokio::test]
    async fn ancestry_ends_at_root() {
        let store = store().await;
        let root = checkpoint_with(None, 0);
        let mid = checkpoint_with(Some(root.id.clone()), 1);
        let leaf = checkpoint_with(Some(mid.id.clone()), 2);
        for cp in [&root, &mid, &leaf] {
            store.put("t1", cp).await.unwrap();
        }
        let chain = store.list_ancestry("t1").await.unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.first().unwrap().id, leaf.id);
        assert!(chain.last().unwrap().parent_id.is_none());
    }

    #[tokio::test]
    async fn delete_thread_clears_all_tables() {
        let store = store().await.with_blob_threshold(8);
        let mut values = Map::new();
        values.insert("logs".into(), json!(vec!["line".repeat(32)]));
        let cp = Checkpoint::new(None, values, vec![], vec![]);
        store.put("t1", &cp).await.unwrap();
        store
            .put_writes("t1", &cp.id, "task-1", vec![("logs".into(), json!(["l"]))])
            .await
            .unwrap();
        store.delete_thread("t1").await.unwrap();
        assert!(store.get_latest("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn works_without_prepared_statements() {
        let store = store().await.with_prepared_statements(false);
        let cp = checkpoint_with(None, 7);
        store.put("t1", &cp).await.unwrap();
        assert!(store.get_latest("t1").await.unwrap().is_some());
    }
}
