//! SQLite-backed conversation store.
//!
//! One table, two indices. Timestamps are stored as fixed-width RFC 3339
//! UTC strings (microsecond precision) so lexicographic order equals
//! chronological order; same-instant rows are tie-broken by rowid, which is
//! insertion order.

use chrono::{DateTime, SecondsFormat, Utc};
use ferroclaw_core::error::StoreError;
use ferroclaw_core::message::Role;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default session idle window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Summary of one tool call, persisted with the assistant row that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub server: String,
    pub tool: String,
    pub ok: bool,
}

/// Optional per-message metadata, stored as a JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSummary>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentioned_entities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.mentioned_entities.is_empty() && self.confidence.is_none()
    }
}

/// One persisted message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub user_key: String,
    pub role: Role,
    pub content: String,
    pub metadata: MessageMetadata,
    pub timestamp: DateTime<Utc>,
}

/// The append-only conversation log.
pub struct ConversationStore {
    pool: SqlitePool,
    idle_timeout: Duration,
}

impl ConversationStore {
    /// Open (or create) the store at a file path. Schema is created lazily.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("failed to open SQLite: {e}")))?;

        let store = Self {
            pool,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        };
        store.run_migrations().await?;
        info!("conversation store initialized at {path}");
        Ok(store)
    }

    /// In-process ephemeral store, for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    /// Override the session idle window.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL,
                user_key    TEXT NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                metadata    TEXT NOT NULL DEFAULT '{}',
                timestamp   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_user_time ON messages(user_key, timestamp DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("user_time index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_time ON messages(timestamp)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("time index: {e}")))?;

        debug!("conversation store migrations complete");
        Ok(())
    }

    fn encode_ts(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Reuse the user's session if their latest user/assistant message is
    /// within the idle window of `now`; otherwise mint a fresh opaque id.
    /// Internal `tool` rows never extend a session.
    pub async fn open_or_reuse_session(
        &self,
        user_key: &str,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, timestamp FROM messages
            WHERE user_key = ?1 AND role != 'tool'
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("latest session lookup: {e}")))?;

        if let Some(row) = row {
            let session_id: String = row
                .try_get("session_id")
                .map_err(|e| StoreError::QueryFailed(format!("session_id column: {e}")))?;
            let ts_str: String = row
                .try_get("timestamp")
                .map_err(|e| StoreError::QueryFailed(format!("timestamp column: {e}")))?;
            if let Ok(ts) = DateTime::parse_from_rfc3339(&ts_str) {
                let age = now.signed_duration_since(ts.with_timezone(&Utc));
                let window = chrono::Duration::from_std(self.idle_timeout)
                    .unwrap_or_else(|_| chrono::Duration::days(365_000));
                if age <= window {
                    return Ok(session_id);
                }
            }
        }

        Ok(Uuid::new_v4().to_string())
    }

    /// Append one row.
    pub async fn append(
        &self,
        session_id: &str,
        user_key: &str,
        role: Role,
        content: &str,
        metadata: &MessageMetadata,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| StoreError::Storage(format!("metadata serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO messages (session_id, user_key, role, content, metadata, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(session_id)
        .bind(user_key)
        .bind(role.as_str())
        .bind(content)
        .bind(&metadata_json)
        .bind(Self::encode_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT failed: {e}")))?;

        Ok(())
    }

    /// Last `limit` messages for a user, oldest first.
    pub async fn recent(
        &self,
        user_key: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE user_key = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(user_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("recent: {e}")))?;

        let mut messages: Vec<StoredMessage> = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<_, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Delete messages older than `cutoff`, except rows belonging to a
    /// session still inside the activity window at `now`.
    /// Returns the number of rows deleted.
    pub async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let active_floor = now
            - chrono::Duration::from_std(self.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        let result = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE timestamp < ?1
              AND session_id NOT IN (
                  SELECT session_id FROM messages
                  WHERE role != 'tool' AND timestamp >= ?2
              )
            "#,
        )
        .bind(Self::encode_ts(cutoff))
        .bind(Self::encode_ts(active_floor))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("purge failed: {e}")))?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, "purged old conversation messages");
        }
        Ok(deleted)
    }

    /// Forget everything about a user. Returns the number of rows deleted;
    /// the next `open_or_reuse_session` mints a fresh id.
    pub async fn clear(&self, user_key: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE user_key = ?1")
            .bind(user_key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("clear failed: {e}")))?;
        Ok(result.rows_affected())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, StoreError> {
        let id: i64 = row
            .try_get("id")
            .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?;
        let session_id: String = row
            .try_get("session_id")
            .map_err(|e| StoreError::QueryFailed(format!("session_id column: {e}")))?;
        let user_key: String = row
            .try_get("user_key")
            .map_err(|e| StoreError::QueryFailed(format!("user_key column: {e}")))?;
        let role_str: String = row
            .try_get("role")
            .map_err(|e| StoreError::QueryFailed(format!("role column: {e}")))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?;
        let metadata_json: String = row
            .try_get("metadata")
            .map_err(|e| StoreError::QueryFailed(format!("metadata column: {e}")))?;
        let ts_str: String = row
            .try_get("timestamp")
            .map_err(|e| StoreError::QueryFailed(format!("timestamp column: {e}")))?;

        let role = role_str
            .parse::<Role>()
            .map_err(StoreError::QueryFailed)?;
        let metadata: MessageMetadata = serde_json::from_str(&metadata_json).unwrap_or_default();
        let timestamp = DateTime::parse_from_rfc3339(&ts_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::QueryFailed(format!("bad timestamp '{ts_str}': {e}")))?;

        Ok(StoredMessage {
            id,
            session_id,
            user_key,
            role,
            content,
            metadata,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn test_store() -> ConversationStore {
        ConversationStore::in_memory()
            .await
            .unwrap()
            .with_idle_timeout(Duration::from_secs(30 * 60))
    }

    fn meta() -> MessageMetadata {
        MessageMetadata::default()
    }

    #[tokio::test]
    async fn save_and_retrieve_conversation() {
        let store = test_store().await;
        let now = Utc::now();
        let session = store.open_or_reuse_session("123456", now).await.unwrap();

        store
            .append(&session, "123456", Role::User, "What's PEPE doing?", &meta(), now)
            .await
            .unwrap();
        store
            .append(
                &session,
                "123456",
                Role::Assistant,
                "PEPE is up 15% with $2.3M volume",
                &MessageMetadata {
                    mentioned_entities: vec!["0xabc123".into()],
                    ..Default::default()
                },
                now + ChronoDuration::seconds(1),
            )
            .await
            .unwrap();

        let history = store.recent("123456", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "What's PEPE doing?");
        assert_eq!(history[1].role, Role::Assistant);
        assert!(history[1].content.contains("PEPE"));
        assert_eq!(history[1].metadata.mentioned_entities, vec!["0xabc123"]);
    }

    #[tokio::test]
    async fn session_reused_within_idle_window() {
        let store = test_store().await;
        let now = Utc::now();

        let first = store.open_or_reuse_session("789012", now).await.unwrap();
        store
            .append(&first, "789012", Role::User, "First message", &meta(), now)
            .await
            .unwrap();

        let five_min_later = now + ChronoDuration::minutes(5);
        let second = store
            .open_or_reuse_session("789012", five_min_later)
            .await
            .unwrap();
        assert_eq!(first, second, "should reuse session within timeout");
    }

    #[tokio::test]
    async fn session_rotates_after_idle_timeout() {
        let store = test_store().await;
        let now = Utc::now();

        let first = store.open_or_reuse_session("u", now).await.unwrap();
        store
            .append(&first, "u", Role::User, "hello", &meta(), now)
            .await
            .unwrap();

        let later = now + ChronoDuration::minutes(45);
        let second = store.open_or_reuse_session("u", later).await.unwrap();
        assert_ne!(first, second, "should mint a new session after timeout");
    }

    #[tokio::test]
    async fn tool_rows_do_not_extend_session() {
        let store = test_store().await;
        let now = Utc::now();

        let first = store.open_or_reuse_session("u", now).await.unwrap();
        store
            .append(&first, "u", Role::User, "hello", &meta(), now)
            .await
            .unwrap();
        // A tool row 40 minutes in: activity must not count.
        store
            .append(
                &first,
                "u",
                Role::Tool,
                "{\"ok\":true}",
                &meta(),
                now + ChronoDuration::minutes(40),
            )
            .await
            .unwrap();

        let at_45 = now + ChronoDuration::minutes(45);
        let second = store.open_or_reuse_session("u", at_45).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn recent_returns_last_n_oldest_first() {
        let store = test_store().await;
        let now = Utc::now();
        let session = store.open_or_reuse_session("567890", now).await.unwrap();

        for i in 0..15 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append(
                    &session,
                    "567890",
                    role,
                    &format!("Message {i}"),
                    &meta(),
                    now + ChronoDuration::seconds(i),
                )
                .await
                .unwrap();
        }

        let history = store.recent("567890", 5).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].content, "Message 10");
        assert_eq!(history[4].content, "Message 14");
    }

    #[tokio::test]
    async fn same_instant_rows_keep_insertion_order() {
        let store = test_store().await;
        let now = Utc::now();
        let session = store.open_or_reuse_session("u", now).await.unwrap();

        for i in 0..3 {
            store
                .append(&session, "u", Role::Tool, &format!("r{i}"), &meta(), now)
                .await
                .unwrap();
        }

        let history = store.recent("u", 10).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["r0", "r1", "r2"]);
    }

    #[tokio::test]
    async fn purge_deletes_old_keeps_recent() {
        let store = test_store().await;
        let now = Utc::now();

        store
            .append(
                "stale-session",
                "345678",
                Role::User,
                "Old message",
                &meta(),
                now - ChronoDuration::hours(25),
            )
            .await
            .unwrap();
        store
            .append(
                "fresh-session",
                "345678",
                Role::User,
                "Recent message",
                &meta(),
                now - ChronoDuration::hours(1),
            )
            .await
            .unwrap();

        let deleted = store
            .purge_older_than(now - ChronoDuration::hours(24), now)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let history = store.recent("345678", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Recent message");
    }

    #[tokio::test]
    async fn purge_spares_sessions_still_active() {
        let store = test_store().await;
        let now = Utc::now();

        // Same session: one ancient row, one row from five minutes ago.
        store
            .append(
                "s1",
                "u",
                Role::User,
                "ancient but same session",
                &meta(),
                now - ChronoDuration::hours(30),
            )
            .await
            .unwrap();
        store
            .append(
                "s1",
                "u",
                Role::Assistant,
                "recent",
                &meta(),
                now - ChronoDuration::minutes(5),
            )
            .await
            .unwrap();

        let deleted = store
            .purge_older_than(now - ChronoDuration::hours(24), now)
            .await
            .unwrap();
        assert_eq!(deleted, 0, "active session must not lose rows");
    }

    #[tokio::test]
    async fn clear_counts_and_rotates_session() {
        let store = test_store().await;
        let now = Utc::now();
        let session = store.open_or_reuse_session("12345", now).await.unwrap();

        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append(
                    &session,
                    "12345",
                    role,
                    &format!("Message {i}"),
                    &meta(),
                    now + ChronoDuration::seconds(i),
                )
                .await
                .unwrap();
        }

        let count = store.clear("12345").await.unwrap();
        assert_eq!(count, 5);
        assert!(store.recent("12345", 10).await.unwrap().is_empty());

        let fresh = store.open_or_reuse_session("12345", now).await.unwrap();
        assert_ne!(fresh, session);
    }

    #[tokio::test]
    async fn clear_with_no_history_returns_zero() {
        let store = test_store().await;
        assert_eq!(store.clear("99999").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let store = test_store().await;
        let now = Utc::now();
        let metadata = MessageMetadata {
            tool_calls: vec![ToolCallSummary {
                server: "dexscreener".into(),
                tool: "search_pairs".into(),
                ok: true,
            }],
            mentioned_entities: vec!["0xdead".into(), "0xbeef".into()],
            confidence: Some(0.92),
        };

        store
            .append("s", "u", Role::Assistant, "answer", &metadata, now)
            .await
            .unwrap();

        let history = store.recent("u", 1).await.unwrap();
        assert_eq!(history[0].metadata, metadata);
    }

    #[tokio::test]
    async fn timestamps_are_monotonic_in_history() {
        let store = test_store().await;
        let now = Utc::now();
        let session = store.open_or_reuse_session("u", now).await.unwrap();

        for i in 0..6 {
            store
                .append(
                    &session,
                    "u",
                    Role::User,
                    &format!("m{i}"),
                    &meta(),
                    now + ChronoDuration::milliseconds(i * 250),
                )
                .await
                .unwrap();
        }

        let history = store.recent("u", 10).await.unwrap();
        for pair in history.windows(2) {
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let store = test_store().await;
        let now = Utc::now();
        store
            .append("sa", "alice", Role::User, "hi from alice", &meta(), now)
            .await
            .unwrap();
        store
            .append("sb", "bob", Role::User, "hi from bob", &meta(), now)
            .await
            .unwrap();

        let alice = store.recent("alice", 10).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].content, "hi from alice");
    }

    #[tokio::test]
    async fn on_disk_store_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conversation.db");
        let store = ConversationStore::open(path.to_str().unwrap())
            .await
            .unwrap();
        let now = Utc::now();

        store
            .append("s", "u", Role::User, "persisted", &meta(), now)
            .await
            .unwrap();
        let history = store.recent("u", 10).await.unwrap();
        assert_eq!(history[0].content, "persisted");
    }
}
