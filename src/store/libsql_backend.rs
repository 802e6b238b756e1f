//! libSQL backend: `ChatStore` and `JobJournal` implementations.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::{Job, JobId, JobJournal};
use crate::store::migrations;
use crate::store::traits::{ChatStore, Conversation, NewMessage, StoredMessage};

const CONVERSATION_COLUMNS: &str = "id, user_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, user_id, role, content, liked, meta, created_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(store.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(store.conn()).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1 AND user_id = ?2"
                ),
                params![conversation_id, user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?
        {
            Some(row) => Ok(Some(row_to_conversation(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_message(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND user_id = ?2"),
                params![message_id, user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?
        {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Sortable timestamp used for every write.
fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn optional_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(v) => libsql::Value::Text(v),
        None => libsql::Value::Null,
    }
}

fn row_error(context: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("{context}: {e}"))
}

/// Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let created: String = row.get(3).map_err(|e| row_error("conversation row", e))?;
    let updated: String = row.get(4).map_err(|e| row_error("conversation row", e))?;
    Ok(Conversation {
        id: row.get(0).map_err(|e| row_error("conversation row", e))?,
        user_id: row.get(1).map_err(|e| row_error("conversation row", e))?,
        title: row.get::<String>(2).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let role: String = row.get(3).map_err(|e| row_error("message row", e))?;
    let meta: Option<String> = row.get(6).ok();
    let created: String = row.get(7).map_err(|e| row_error("message row", e))?;
    Ok(StoredMessage {
        id: row.get(0).map_err(|e| row_error("message row", e))?,
        conversation_id: row.get(1).map_err(|e| row_error("message row", e))?,
        user_id: row.get(2).map_err(|e| row_error("message row", e))?,
        role: role.parse().map_err(DatabaseError::Serialization)?,
        content: row.get(4).map_err(|e| row_error("message row", e))?,
        liked: row.get::<i64>(5).ok().map(|v| v != 0),
        meta: meta.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: parse_datetime(&created),
    })
}

impl LibSqlStore {
    /// Messages of an owned conversation, oldest first. `None` means no limit.
    async fn query_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        if self.get_conversation(user_id, conversation_id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "conversation".to_string(),
                id: conversation_id.to_string(),
            });
        }

        // A negative LIMIT is unbounded in SQLite.
        let limit = limit.map_or(-1, |l| l as i64);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC
                     LIMIT ?2 OFFSET ?3"
                ),
                params![conversation_id, limit, offset as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversation_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversation_messages: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }
}

#[async_trait]
impl ChatStore for LibSqlStore {
    async fn create_or_get_conversation(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Conversation, DatabaseError> {
        if let Some(id) = conversation_id {
            if let Some(existing) = self.get_conversation(user_id, id).await? {
                return Ok(existing);
            }
            debug!(conversation_id = %id, user_id, "Conversation not found, creating new one");
        }

        let id = Uuid::new_v4().to_string();
        let now = now_str();
        self.conn()
            .execute(
                "INSERT INTO conversations (id, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![id.clone(), user_id, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            title: None,
            created_at: parse_datetime(&now),
            updated_at: parse_datetime(&now),
        })
    }

    async fn save_message(&self, message: NewMessage) -> Result<StoredMessage, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        let meta = message
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO messages (id, conversation_id, user_id, role, content, meta, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.clone(),
                    message.conversation_id.clone(),
                    message.user_id.clone(),
                    message.role.as_str(),
                    message.content.clone(),
                    optional_text(meta),
                    now.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_message: {e}")))?;

        if let Err(e) = self
            .conn()
            .execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![message.conversation_id.clone(), now.clone()],
            )
            .await
        {
            warn!(conversation_id = %message.conversation_id, error = %e, "Failed to touch conversation");
        }

        Ok(StoredMessage {
            id,
            conversation_id: message.conversation_id,
            user_id: message.user_id,
            role: message.role,
            content: message.content,
            liked: None,
            meta: message.meta,
            created_at: parse_datetime(&now),
        })
    }

    async fn list_conversation_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.query_messages(user_id, conversation_id, None, 0).await
    }

    async fn page_conversation_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.query_messages(user_id, conversation_id, Some(limit), offset)
            .await
    }

    async fn set_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, title, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_conversation_title: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".to_string(),
                id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_user_conversations(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE user_id = ?1 ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
                ),
                params![user_id, limit as i64, offset as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_user_conversations: {e}")))?;

        let mut conversations = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_user_conversations: {e}")))?
        {
            conversations.push(row_to_conversation(&row)?);
        }
        Ok(conversations)
    }

    async fn set_message_feedback(
        &self,
        user_id: &str,
        message_id: &str,
        liked: bool,
    ) -> Result<StoredMessage, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET liked = ?3 WHERE id = ?1 AND user_id = ?2",
                params![message_id, user_id, liked as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_message_feedback: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".to_string(),
                id: message_id.to_string(),
            });
        }

        self.get_message(user_id, message_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".to_string(),
                id: message_id.to_string(),
            })
    }
}

#[async_trait]
impl JobJournal for LibSqlStore {
    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let data =
            serde_json::to_string(job).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO jobs (id, seq, state, data, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET state = ?3, data = ?4, updated_at = ?5",
                params![
                    job.id.to_string(),
                    job.seq as i64,
                    job.state.to_string(),
                    data,
                    now_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_job: {e}")))?;
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT data FROM jobs ORDER BY seq ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("load_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_jobs: {e}")))?
        {
            let data: String = row.get(0).map_err(|e| row_error("job row", e))?;
            match serde_json::from_str::<Job>(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping unreadable job row: {e}"),
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobPayload, JobState};
    use crate::store::traits::Role;

    async fn test_db() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn user_message(conversation_id: &str, content: &str) -> NewMessage {
        NewMessage {
            conversation_id: conversation_id.to_string(),
            user_id: "u1".to_string(),
            role: Role::User,
            content: content.to_string(),
            meta: None,
        }
    }

    #[tokio::test]
    async fn creates_conversation_when_missing() {
        let db = test_db().await;
        let created = db.create_or_get_conversation("u1", None).await.unwrap();
        assert_eq!(created.user_id, "u1");
        assert!(created.title.is_none());

        let same = db
            .create_or_get_conversation("u1", Some(&created.id))
            .await
            .unwrap();
        assert_eq!(same.id, created.id);
    }

    #[tokio::test]
    async fn foreign_conversation_is_not_reused() {
        let db = test_db().await;
        let theirs = db.create_or_get_conversation("u2", None).await.unwrap();
        let mine = db
            .create_or_get_conversation("u1", Some(&theirs.id))
            .await
            .unwrap();
        assert_ne!(mine.id, theirs.id);
        assert_eq!(mine.user_id, "u1");
    }

    #[tokio::test]
    async fn messages_are_chronological() {
        let db = test_db().await;
        let convo = db.create_or_get_conversation("u1", None).await.unwrap();

        db.save_message(user_message(&convo.id, "first")).await.unwrap();
        db.save_assistant_message(&convo.id, "u1", "second", Some(serde_json::json!({"docs": []})))
            .await
            .unwrap();
        db.save_message(user_message(&convo.id, "third")).await.unwrap();

        let messages = db.list_conversation_messages("u1", &convo.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].meta, Some(serde_json::json!({"docs": []})));
        assert!(messages.iter().all(|m| m.liked.is_none()));
    }

    #[tokio::test]
    async fn listing_checks_ownership() {
        let db = test_db().await;
        let convo = db.create_or_get_conversation("u1", None).await.unwrap();
        let err = db
            .list_conversation_messages("u2", &convo.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn title_and_listing() {
        let db = test_db().await;
        let convo = db.create_or_get_conversation("u1", None).await.unwrap();
        db.set_conversation_title(&convo.id, "hello").await.unwrap();

        let listed = db.list_user_conversations("u1", 20, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("hello"));
        assert!(db.list_user_conversations("u2", 20, 0).await.unwrap().is_empty());

        assert!(db.set_conversation_title("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn feedback_round_trip() {
        let db = test_db().await;
        let convo = db.create_or_get_conversation("u1", None).await.unwrap();
        let reply = db
            .save_assistant_message(&convo.id, "u1", "answer", None)
            .await
            .unwrap();

        let rated = db.set_message_feedback("u1", &reply.id, false).await.unwrap();
        assert_eq!(rated.liked, Some(false));
        let rated = db.set_message_feedback("u1", &reply.id, true).await.unwrap();
        assert_eq!(rated.liked, Some(true));

        assert!(db.set_message_feedback("u2", &reply.id, true).await.is_err());
    }

    #[tokio::test]
    async fn journal_upserts_and_deletes() {
        let db = test_db().await;
        let mut job = Job::new(1, JobPayload::chat("u1", "hi"), None);
        db.save_job(&job).await.unwrap();

        job.transition_to(JobState::Active).unwrap();
        db.save_job(&job).await.unwrap();

        let loaded = db.load_jobs().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, JobState::Active);
        assert_eq!(loaded[0].payload.message.as_deref(), Some("hi"));

        db.delete_job(job.id).await.unwrap();
        assert!(db.load_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_pages_follow_creation_order() {
        let db = test_db().await;
        let convo = db.create_or_get_conversation("u1", None).await.unwrap();
        for n in 0..5 {
            db.save_message(user_message(&convo.id, &format!("m{n}")))
                .await
                .unwrap();
        }

        let page = db
            .page_conversation_messages("u1", &convo.id, 2, 1)
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2"]);

        let tail = db
            .page_conversation_messages("u1", &convo.id, 50, 4)
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(db.list_conversation_messages("u1", &convo.id).await.unwrap().len(), 5);
        assert!(
            db.page_conversation_messages("u2", &convo.id, 50, 0)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn queued_jobs_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("relay.db");

        let job_id = {
            let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
            let queue = crate::queue::JobQueue::with_journal(store);
            let id = queue.enqueue(JobPayload::chat("u1", "persist me")).await;
            queue.flush_journal().await;
            id
        };

        let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
        let queue = crate::queue::JobQueue::with_journal(store);
        assert_eq!(queue.restore().await.unwrap(), 1);

        let job = queue.get(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload.message.as_deref(), Some("persist me"));
    }
}
