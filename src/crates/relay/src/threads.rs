//! Thread registry.
//!
//! Persists thread identity, title, flow tag, and access timestamps. Clients
//! list threads to resume them; every touch bumps `last_accessed_at`. Titles
//! derive from the first user message and are only filled once.

use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

/// Maximum title length, including the ellipsis.
const TITLE_MAX_CHARS: usize = 70;

/// One row of the thread table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub flow: Option<String>,
    pub created_at: String,
    pub last_accessed_at: String,
}

/// SQL-backed thread registry.
#[derive(Debug, Clone)]
pub struct ThreadRegistry {
    pool: SqlitePool,
}

impl ThreadRegistry {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let registry = Self { pool };
        registry.ensure_schema().await?;
        Ok(registry)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT,
                flow TEXT,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_threads_user_accessed
             ON threads (user_id, last_accessed_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn thread_exists(&self, thread_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM threads WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Create or touch a thread. On conflict the access timestamp is bumped
    /// and title/flow are only filled when currently null.
    pub async fn upsert_thread(
        &self,
        thread_id: &str,
        user_id: &str,
        title: Option<&str>,
        flow: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO threads (thread_id, user_id, title, flow, created_at, last_accessed_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (thread_id) DO UPDATE SET
                 last_accessed_at = excluded.last_accessed_at,
                 title = COALESCE(threads.title, excluded.title),
                 flow = COALESCE(threads.flow, excluded.flow)",
        )
        .bind(thread_id)
        .bind(user_id)
        .bind(title)
        .bind(flow)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_last_accessed(&self, thread_id: &str) -> Result<()> {
        sqlx::query("UPDATE threads SET last_accessed_at = ? WHERE thread_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        let record = sqlx::query_as::<_, ThreadRecord>(
            "SELECT thread_id, user_id, title, flow, created_at, last_accessed_at
             FROM threads WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// A user's threads, most recently accessed first, optionally filtered
    /// by flow tag.
    pub async fn list_user_threads(
        &self,
        user_id: &str,
        flow: Option<&str>,
    ) -> Result<Vec<ThreadRecord>> {
        let records = match flow {
            Some(flow) => {
                sqlx::query_as::<_, ThreadRecord>(
                    "SELECT thread_id, user_id, title, flow, created_at, last_accessed_at
                     FROM threads WHERE user_id = ? AND flow = ?
                     ORDER BY last_accessed_at DESC",
                )
                .bind(user_id)
                .bind(flow)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ThreadRecord>(
                    "SELECT thread_id, user_id, title, flow, created_at, last_accessed_at
                     FROM threads WHERE user_id = ?
                     ORDER BY last_accessed_at DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(records)
    }
}

/// Derive a thread title from the first user message: trim, cut at the last
/// word boundary so the result (ellipsis included) stays within 70 chars.
/// Idempotent: a derived title passes through unchanged.
pub fn derive_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let budget = TITLE_MAX_CHARS - 3;
    let head: String = trimmed.chars().take(budget).collect();
    let cut = match head.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => head[..pos].trim_end().to_string(),
        _ => head,
    };
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> ThreadRegistry {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ThreadRegistry::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_creates_then_touches() {
        let registry = registry().await;
        registry
            .upsert_thread("t1", "u1", Some("eerste vraag"), Some("opgroeien.poc.chat"))
            .await
            .unwrap();
        let record = registry.get("t1").await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("eerste vraag"));

        // Second upsert with a different title keeps the first one.
        registry
            .upsert_thread("t1", "u1", Some("tweede vraag"), None)
            .await
            .unwrap();
        let record = registry.get("t1").await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("eerste vraag"));
        assert_eq!(record.flow.as_deref(), Some("opgroeien.poc.chat"));
    }

    #[tokio::test]
    async fn null_title_filled_later() {
        let registry = registry().await;
        registry.upsert_thread("t1", "u1", None, None).await.unwrap();
        registry
            .upsert_thread("t1", "u1", Some("late titel"), None)
            .await
            .unwrap();
        let record = registry.get("t1").await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("late titel"));
    }

    #[tokio::test]
    async fn listing_orders_by_access_and_filters_flow() {
        let registry = registry().await;
        registry
            .upsert_thread("a", "u1", None, Some("opgroeien.poc.chat"))
            .await
            .unwrap();
        registry
            .upsert_thread("b", "u1", None, Some("opgroeien.poc.report"))
            .await
            .unwrap();
        registry.update_last_accessed("a").await.unwrap();

        let all = registry.list_user_threads("u1", None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].thread_id, "a");

        let reports = registry
            .list_user_threads("u1", Some("opgroeien.poc.report"))
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].thread_id, "b");
    }

    #[tokio::test]
    async fn exists_reflects_rows() {
        let registry = registry().await;
        assert!(!registry.thread_exists("t1").await.unwrap());
        registry.upsert_thread("t1", "u1", None, None).await.unwrap();
        assert!(registry.thread_exists("t1").await.unwrap());
    }

    #[test]
    fn short_titles_pass_through() {
        assert_eq!(derive_title("  korte vraag  "), "korte vraag");
    }

    #[test]
    fn long_titles_cut_at_word_boundary() {
        let message = "wat zijn de verplichtingen rond veiligheid en gezondheid in de kinderopvang voor nieuwe medewerkers";
        let title = derive_title(message);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_CHARS);
        // no mid-word cut
        let stem = title.trim_end_matches("...");
        assert!(message.starts_with(stem));
        assert!(message[stem.len()..].starts_with(char::is_whitespace));
    }

    #[test]
    fn title_derivation_is_idempotent() {
        let long = "een hele lange vraag over procedures en regelgeving binnen de organisatie die zeker afgekapt wordt";
        let once = derive_title(long);
        assert_eq!(derive_title(&once), once);
        let short = "korte titel";
        assert_eq!(derive_title(&derive_title(short)), derive_title(short));
    }
}
