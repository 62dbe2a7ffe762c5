//! Durable, append-only conversation log.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::DuckDbPool;
use crate::pipeline::AnswerMode;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("stored record is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    pub response: Option<String>,
    pub mode: AnswerMode,
    pub intent: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_session(&self, session: &ConversationSession) -> Result<(), StoreError>;

    /// Sets `ended_at` if the session is still open. Returns whether this
    /// call ended it.
    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError>;

    /// Turns of a session, oldest first. With `limit`, only the newest
    /// `limit` turns (still oldest first).
    async fn turns(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<ConversationTurn>, StoreError>;

    /// A user's sessions, most recently started first.
    async fn recent_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationSession>, StoreError>;
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed(format!("timestamp '{}': {}", raw, e)))
}

const CONVERSATION_DDL: &str = "
CREATE SEQUENCE IF NOT EXISTS conversation_turn_seq START 1;
CREATE TABLE IF NOT EXISTS conversation_sessions (
    session_id VARCHAR NOT NULL,
    user_id VARCHAR NOT NULL,
    started_at VARCHAR NOT NULL,
    last_activity_at VARCHAR NOT NULL,
    ended_at VARCHAR
);
CREATE TABLE IF NOT EXISTS conversation_turns (
    seq BIGINT DEFAULT nextval('conversation_turn_seq'),
    session_id VARCHAR NOT NULL,
    user_id VARCHAR NOT NULL,
    message VARCHAR NOT NULL,
    response VARCHAR,
    mode VARCHAR NOT NULL,
    intent VARCHAR,
    created_at VARCHAR NOT NULL
);";

const SESSION_COLUMNS: &str = "session_id, user_id, started_at, last_activity_at, ended_at";

pub struct DuckDbConversationStore {
    pool: DuckDbPool,
}

impl DuckDbConversationStore {
    /// Creates the conversation tables when missing.
    pub async fn open(pool: DuckDbPool) -> Result<Self, StoreError> {
        let init = pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            init.get()?.execute_batch(CONVERSATION_DDL)?;
            Ok(())
        })
        .await??;
        info!("Conversation store ready");
        Ok(Self { pool })
    }

    async fn run<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&duckdb::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            work(&conn)
        })
        .await?
    }
}

type RawSession = (String, String, String, String, Option<String>);

fn session_from_raw(raw: RawSession) -> Result<ConversationSession, StoreError> {
    Ok(ConversationSession {
        session_id: raw.0,
        user_id: raw.1,
        started_at: parse_ts(&raw.2)?,
        last_activity_at: parse_ts(&raw.3)?,
        ended_at: raw.4.as_deref().map(parse_ts).transpose()?,
    })
}

#[async_trait]
impl ConversationStore for DuckDbConversationStore {
    async fn create_session(&self, session: &ConversationSession) -> Result<(), StoreError> {
        let s = session.clone();
        self.run(move |conn| {
            conn.execute(
                &format!("INSERT INTO conversation_sessions ({}) VALUES (?, ?, ?, ?, ?)", SESSION_COLUMNS),
                duckdb::params![
                    s.session_id,
                    s.user_id,
                    ts(&s.started_at),
                    ts(&s.last_activity_at),
                    s.ended_at.as_ref().map(ts)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE conversation_sessions SET ended_at = ? WHERE session_id = ? AND ended_at IS NULL",
                duckdb::params![ts(&ended_at), session_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE conversation_sessions SET last_activity_at = ? WHERE session_id = ?",
                duckdb::params![ts(&at), session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError> {
        let t = turn.clone();
        let intent = t
            .intent
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO conversation_turns (session_id, user_id, message, response, mode, intent, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                duckdb::params![
                    t.session_id,
                    t.user_id,
                    t.message,
                    t.response,
                    t.mode.as_str(),
                    intent,
                    ts(&t.created_at)
                ],
            )?;
            debug!("Appended turn to session {}", t.session_id);
            Ok(())
        })
        .await
    }

    async fn turns(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<ConversationTurn>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let limit = limit.map_or(i64::MAX, |n| i64::try_from(n).unwrap_or(i64::MAX));
            let mut stmt = conn.prepare(
                "SELECT session_id, user_id, message, response, mode, intent, created_at FROM (
                     SELECT * FROM conversation_turns WHERE session_id = ? ORDER BY seq DESC LIMIT ?
                 ) ORDER BY seq ASC",
            )?;
            let raw = stmt
                .query_map(duckdb::params![session_id, limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(session_id, user_id, message, response, mode, intent, created_at)| {
                    Ok(ConversationTurn {
                        session_id,
                        user_id,
                        message,
                        response,
                        mode: AnswerMode::parse(&mode),
                        intent: intent.as_deref().and_then(|i| serde_json::from_str(i).ok()),
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn recent_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationSession>, StoreError> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversation_sessions WHERE user_id = ? ORDER BY started_at DESC LIMIT ?",
                SESSION_COLUMNS
            ))?;
            let raw = stmt
                .query_map(duckdb::params![user_id, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<Result<Vec<RawSession>, _>>()?;
            raw.into_iter().map(session_from_raw).collect()
        })
        .await
    }
}

/// Process-local store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryConversationStore {
    sessions: RwLock<HashMap<String, ConversationSession>>,
    turns: RwLock<Vec<ConversationTurn>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_session(&self, session: &ConversationSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.ended_at.is_none() => {
                session.ended_at = Some(ended_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity_at = at;
        }
        Ok(())
    }

    async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError> {
        self.turns.write().await.push(turn.clone());
        Ok(())
    }

    async fn turns(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<ConversationTurn>, StoreError> {
        let turns = self.turns.read().await;
        let matching: Vec<ConversationTurn> = turns
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn recent_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationSession>, StoreError> {
        let mut sessions: Vec<ConversationSession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::build_pool;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn session(id: &str, user: &str, minute: i64) -> ConversationSession {
        ConversationSession {
            session_id: id.into(),
            user_id: user.into(),
            started_at: at(minute),
            last_activity_at: at(minute),
            ended_at: None,
        }
    }

    fn turn(session_id: &str, n: i64) -> ConversationTurn {
        ConversationTurn {
            session_id: session_id.into(),
            user_id: "u1".into(),
            message: format!("question {}", n),
            response: Some(format!("answer {}", n)),
            mode: AnswerMode::Data,
            intent: Some(json!({"category": "DEAL_QUERY"})),
            created_at: at(n),
        }
    }

    async fn exercise(store: &dyn ConversationStore) {
        store.create_session(&session("s1", "u1", 0)).await.unwrap();
        store.create_session(&session("s2", "u1", 10)).await.unwrap();
        store.create_session(&session("s3", "u2", 5)).await.unwrap();

        for n in 1..=4 {
            store.append_turn(&turn("s1", n)).await.unwrap();
        }

        let all = store.turns("s1", None).await.unwrap();
        assert_eq!(
            all.iter().map(|t| t.message.as_str()).collect::<Vec<_>>(),
            vec!["question 1", "question 2", "question 3", "question 4"]
        );
        assert_eq!(all[0].intent, Some(json!({"category": "DEAL_QUERY"})));

        let newest = store.turns("s1", Some(2)).await.unwrap();
        assert_eq!(newest[0].message, "question 3");
        assert_eq!(newest[1].message, "question 4");

        assert!(store.end_session("s1", at(20)).await.unwrap());
        assert!(!store.end_session("s1", at(21)).await.unwrap());

        let recent = store.recent_sessions("u1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "s2");
        assert_eq!(recent[1].ended_at, Some(at(20)));
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryConversationStore::new()).await;
    }

    #[tokio::test]
    async fn duckdb_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.duckdb");
        let pool = build_pool(path.to_str().unwrap(), 2).unwrap();
        let store = DuckDbConversationStore::open(pool).await.unwrap();
        exercise(&store).await;

        store.touch_session("s2", at(30)).await.unwrap();
        let recent = store.recent_sessions("u1", 1).await.unwrap();
        assert_eq!(recent[0].last_activity_at, at(30));
    }
}
