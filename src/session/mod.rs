//! Per-user conversation sessions.
//!
//! One active session per user, ended lazily on the first access after the
//! inactivity window or by the periodic sweep. Every turn goes to the durable
//! store; the active session's turns are mirrored into a small ring for
//! prompt context.

pub mod memory;
pub mod store;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::AnswerMode;
use crate::util::Clock;

pub use memory::ConversationMemory;
pub use store::{
    ConversationSession, ConversationStore, ConversationTurn, DuckDbConversationStore, MemoryConversationStore,
    StoreError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub inactivity_minutes: i64,
    pub memory_turns: usize,
    pub sweep_interval_secs: u64,
    pub history_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inactivity_minutes: 30,
            memory_turns: 20,
            sweep_interval_secs: 300,
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Rebuilds the alternating user/assistant transcript from stored turns.
pub fn transcript(turns: &[ConversationTurn]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(turns.len() * 2);
    for turn in turns {
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: turn.message.clone(),
            at: turn.created_at,
        });
        if let Some(response) = &turn.response {
            messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: response.clone(),
                at: turn.created_at,
            });
        }
    }
    messages
}

pub struct SessionManager {
    store: Arc<dyn ConversationStore>,
    memory: ConversationMemory,
    active: RwLock<HashMap<String, ConversationSession>>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ConversationStore>, clock: Arc<dyn Clock>, settings: SessionSettings) -> Self {
        Self {
            store,
            memory: ConversationMemory::new(settings.memory_turns),
            active: RwLock::new(HashMap::new()),
            clock,
            settings,
        }
    }

    fn window(&self) -> Duration {
        Duration::minutes(self.settings.inactivity_minutes.max(1))
    }

    fn is_expired(&self, session: &ConversationSession, now: DateTime<Utc>) -> bool {
        now - session.last_activity_at > self.window()
    }

    async fn close(&self, session: &ConversationSession, at: DateTime<Utc>) {
        self.memory.forget(&session.session_id).await;
        match self.store.end_session(&session.session_id, at).await {
            Ok(true) => info!("Ended session {} for user {}", session.session_id, session.user_id),
            Ok(false) => debug!("Session {} was already ended", session.session_id),
            Err(e) => warn!("Failed to persist end of session {}: {}", session.session_id, e),
        }
    }

    /// The user's live session, if any. An expired one is ended here.
    pub async fn get_active_session(&self, user_id: &str) -> Option<ConversationSession> {
        let now = self.clock.now();
        {
            let active = self.active.read().await;
            match active.get(user_id) {
                None => return None,
                Some(session) if !self.is_expired(session, now) => return Some(session.clone()),
                Some(_) => {}
            }
        }

        let expired = {
            let mut active = self.active.write().await;
            match active.get(user_id) {
                Some(session) if self.is_expired(session, now) => active.remove(user_id),
                Some(session) => return Some(session.clone()),
                None => None,
            }
        };
        if let Some(session) = expired {
            self.close(&session, now).await;
        }
        None
    }

    /// The store write happens outside the index lock. When two requests race,
    /// the first to claim the slot wins and the other session is ended.
    pub async fn get_or_create_session(&self, user_id: &str) -> Result<ConversationSession, StoreError> {
        if let Some(session) = self.get_active_session(user_id).await {
            return Ok(session);
        }

        let fresh = self.open_session(user_id).await?;
        let now = self.clock.now();
        let (session, loser) = {
            let mut active = self.active.write().await;
            match active.get(user_id) {
                Some(current) if !self.is_expired(current, now) => (current.clone(), Some(fresh)),
                _ => {
                    let replaced = active.insert(user_id.to_string(), fresh.clone());
                    (fresh, replaced)
                }
            }
        };
        if let Some(loser) = loser {
            debug!("Session {} lost the race for user {}", loser.session_id, user_id);
            self.close(&loser, now).await;
        }
        Ok(session)
    }

    async fn open_session(&self, user_id: &str) -> Result<ConversationSession, StoreError> {
        let now = self.clock.now();
        let session = ConversationSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            started_at: now,
            last_activity_at: now,
            ended_at: None,
        };
        self.store.create_session(&session).await?;
        info!("Started session {} for user {}", session.session_id, user_id);
        Ok(session)
    }

    /// Ends the current session, if any, and opens a fresh one. Earlier
    /// history stays in the store.
    pub async fn start_new_session(&self, user_id: &str) -> Result<ConversationSession, StoreError> {
        let session = self.open_session(user_id).await?;
        let previous = self
            .active
            .write()
            .await
            .insert(user_id.to_string(), session.clone());
        if let Some(previous) = previous {
            self.close(&previous, self.clock.now()).await;
        }
        Ok(session)
    }

    /// Returns whether a session was ended. Repeated calls are no-ops.
    pub async fn end_session(&self, user_id: &str) -> bool {
        let removed = self.active.write().await.remove(user_id);
        match removed {
            Some(session) => {
                self.close(&session, self.clock.now()).await;
                true
            }
            None => false,
        }
    }

    /// Appends a turn to the durable store and mirrors it into memory.
    pub async fn record_turn(
        &self,
        user_id: &str,
        message: &str,
        response: Option<&str>,
        mode: AnswerMode,
        intent: Option<serde_json::Value>,
    ) -> Result<ConversationTurn, StoreError> {
        let session = self.get_or_create_session(user_id).await?;
        let now = self.clock.now();
        let turn = ConversationTurn {
            session_id: session.session_id.clone(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            response: response.map(str::to_string),
            mode,
            intent,
            created_at: now,
        };

        self.store.append_turn(&turn).await?;
        self.memory.push(turn.clone()).await;

        if let Some(current) = self.active.write().await.get_mut(user_id) {
            if current.session_id == session.session_id {
                current.last_activity_at = now;
            }
        }
        if let Err(e) = self.store.touch_session(&session.session_id, now).await {
            warn!("Failed to record activity on session {}: {}", session.session_id, e);
        }
        Ok(turn)
    }

    /// Newest in-memory turns of the active session, oldest first.
    pub async fn recent_turns(&self, user_id: &str, limit: usize) -> Vec<ConversationTurn> {
        match self.get_active_session(user_id).await {
            Some(session) => self.memory.recent(&session.session_id, limit).await,
            None => Vec::new(),
        }
    }

    /// Transcript of `session_id`, or of the user's latest session when
    /// none is given. Always read from the durable store.
    pub async fn history(&self, user_id: &str, session_id: Option<&str>) -> Result<Vec<ChatMessage>, StoreError> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => match self.store.recent_sessions(user_id, 1).await?.into_iter().next() {
                Some(session) => session.session_id,
                None => return Ok(Vec::new()),
            },
        };
        let turns = self
            .store
            .turns(&session_id, Some(self.settings.history_limit))
            .await?;
        Ok(transcript(&turns))
    }

    pub async fn sessions(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationSession>, StoreError> {
        self.store.recent_sessions(user_id, limit).await
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Ends every session idle past the window.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<ConversationSession> = {
            let mut active = self.active.write().await;
            let users: Vec<String> = active
                .iter()
                .filter(|(_, s)| self.is_expired(s, now))
                .map(|(u, _)| u.clone())
                .collect();
            users.iter().filter_map(|u| active.remove(u)).collect()
        };
        for session in &expired {
            self.close(session, now).await;
        }
        if !expired.is_empty() {
            info!("Session sweep ended {} idle session(s)", expired.len());
        }
        expired.len()
    }

    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = std::time::Duration::from_secs(self.settings.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_expired().await;
            }
        })
    }
}
