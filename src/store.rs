//! SQLite persistence for incidents and their follow-up conversations.
//!
//! Each operation opens its own short-lived connection and runs on the
//! blocking pool; the storage engine's own locking is the only serialization.
//! Referential integrity between conversation turns and incidents is enforced
//! with a real foreign key (`PRAGMA foreign_keys = ON` per connection).

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Errors specific to store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Incident not found")]
    IncidentNotFound,

    #[error("store task failed: {0}")]
    Task(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IncidentNotFound => AppError::not_found("Incident not found"),
            other => AppError::internal(other.to_string()),
        }
    }
}

/// Kind of a submitted incident report.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentKind {
    Text,
    Audio,
}

impl IncidentKind {
    /// Column value stored for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }

    fn parse(raw: &str) -> Result<Self, rusqlite::Error> {
        match raw {
            "text" => Ok(Self::Text),
            "audio" => Ok(Self::Audio),
            _ => Err(rusqlite::Error::InvalidColumnType(
                3,
                "kind".to_string(),
                rusqlite::types::Type::Text,
            )),
        }
    }
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

impl Sender {
    /// Column value stored for this sender.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
        }
    }

    fn parse(raw: &str) -> Result<Self, rusqlite::Error> {
        match raw {
            "user" => Ok(Self::User),
            "ai" => Ok(Self::Ai),
            _ => Err(rusqlite::Error::InvalidColumnType(
                2,
                "sender".to_string(),
                rusqlite::types::Type::Text,
            )),
        }
    }
}

/// A stored incident report. Immutable after creation; never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: i64,
    pub user_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: IncidentKind,
}

/// One message in an incident's follow-up thread. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub id: i64,
    #[serde(skip)]
    pub incident_id: i64,
    pub sender: Sender,
    pub text: String,
}

/// Handle to the incidents database. Cloning shares the path, not a
/// connection; every call opens and closes its own session.
#[derive(Clone)]
pub struct Store {
    path: Arc<PathBuf>,
}

impl Store {
    /// Opens the database, creating the schema when absent.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: Arc::new(path.into()),
        };
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS incidents (
                        id      INTEGER PRIMARY KEY AUTOINCREMENT,
                        user_id TEXT NOT NULL,
                        text    TEXT NOT NULL,
                        kind    TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS conversations (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        incident_id INTEGER NOT NULL REFERENCES incidents(id),
                        sender      TEXT NOT NULL,
                        text        TEXT NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    /// Inserts a new incident owned by `user_id`.
    pub async fn create_incident(
        &self,
        user_id: &str,
        text: &str,
        kind: IncidentKind,
    ) -> Result<Incident, StoreError> {
        let user_id = user_id.to_owned();
        let text = text.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO incidents (user_id, text, kind) VALUES (?1, ?2, ?3)",
                params![user_id, text, kind.as_str()],
            )?;
            Ok(Incident {
                id: conn.last_insert_rowid(),
                user_id,
                text,
                kind,
            })
        })
        .await
    }

    /// Lists incidents owned by `user_id`. Owner scoping is mandatory; there
    /// is deliberately no unscoped listing.
    pub async fn list_incidents(&self, user_id: &str) -> Result<Vec<Incident>, StoreError> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, text, kind FROM incidents WHERE user_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![user_id], map_incident_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Fetches a single incident by id.
    pub async fn get_incident(&self, id: i64) -> Result<Option<Incident>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT id, user_id, text, kind FROM incidents WHERE id = ?1")?;
            let mut rows = stmt.query_map(params![id], map_incident_row)?;
            rows.next().transpose().map_err(StoreError::from)
        })
        .await
    }

    /// Appends one turn to an incident's conversation.
    ///
    /// Fails with [`StoreError::IncidentNotFound`] when the incident does not
    /// exist; the foreign key constraint backs this check.
    pub async fn append_turn(
        &self,
        incident_id: i64,
        sender: Sender,
        text: &str,
    ) -> Result<ConversationTurn, StoreError> {
        let text = text.to_owned();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO conversations (incident_id, sender, text) VALUES (?1, ?2, ?3)",
                params![incident_id, sender.as_str(), text],
            );
            match inserted {
                Ok(_) => Ok(ConversationTurn {
                    id: conn.last_insert_rowid(),
                    incident_id,
                    sender,
                    text,
                }),
                Err(err) if is_foreign_key_violation(&err) => Err(StoreError::IncidentNotFound),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    /// Returns an incident's conversation turns in insertion order.
    pub async fn list_conversation(
        &self,
        incident_id: i64,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, incident_id, sender, text FROM conversations
                 WHERE incident_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![incident_id], |row| {
                Ok(ConversationTurn {
                    id: row.get(0)?,
                    incident_id: row.get(1)?,
                    sender: Sender::parse(row.get::<_, String>(2)?.as_str())?,
                    text: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(path.as_path())?;
            conn.pragma_update(None, "foreign_keys", true)?;
            f(&conn)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn map_incident_row(row: &rusqlite::Row) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        kind: IncidentKind::parse(row.get::<_, String>(3)?.as_str())?,
    })
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

#[cfg(test)]
mod tests {
    use super::{IncidentKind, Sender, Store, StoreError};
    use tempfile::TempDir;

    async fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let store = Store::open(dir.path().join("test.db"))
            .await
            .expect("open store");
        (store, dir)
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let (store, _dir) = open_store().await;

        let created = store
            .create_incident("auth0|alice", "stalker near campus", IncidentKind::Text)
            .await
            .expect("create");
        assert_eq!(created.user_id, "auth0|alice");
        assert_eq!(created.kind, IncidentKind::Text);

        let fetched = store
            .get_incident(created.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn get_missing_incident_returns_none() {
        let (store, _dir) = open_store().await;
        assert!(store.get_incident(42).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn listing_is_scoped_to_owner() {
        let (store, _dir) = open_store().await;

        store
            .create_incident("auth0|alice", "report a", IncidentKind::Text)
            .await
            .expect("create");
        store
            .create_incident("auth0|bob", "report b", IncidentKind::Audio)
            .await
            .expect("create");

        let alices = store.list_incidents("auth0|alice").await.expect("list");
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].text, "report a");

        assert!(store
            .list_incidents("auth0|nobody")
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn conversation_preserves_insertion_order() {
        let (store, _dir) = open_store().await;

        let incident = store
            .create_incident("auth0|alice", "harassment on bus", IncidentKind::Text)
            .await
            .expect("create");

        store
            .append_turn(incident.id, Sender::User, "what should I do next?")
            .await
            .expect("append user turn");
        store
            .append_turn(incident.id, Sender::Ai, "document the route and time")
            .await
            .expect("append ai turn");

        let turns = store
            .list_conversation(incident.id)
            .await
            .expect("list conversation");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].sender, Sender::User);
        assert_eq!(turns[0].text, "what should I do next?");
        assert_eq!(turns[1].sender, Sender::Ai);
        assert!(turns[0].id < turns[1].id);
    }

    #[tokio::test]
    async fn turn_for_missing_incident_is_rejected() {
        let (store, _dir) = open_store().await;

        let err = store
            .append_turn(999, Sender::User, "hello?")
            .await
            .expect_err("must fail");
        assert!(matches!(err, StoreError::IncidentNotFound));
    }

    #[test]
    fn only_foreign_key_violations_read_as_missing_incident() {
        let fk = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY),
            None,
        );
        assert!(super::is_foreign_key_violation(&fk));

        let unique = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            None,
        );
        assert!(!super::is_foreign_key_violation(&unique));
    }
}
