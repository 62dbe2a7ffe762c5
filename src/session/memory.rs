use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use super::store::ConversationTurn;

/// Fixed-size per-session ring of recent turns. Best effort: the durable
/// store stays authoritative.
pub struct ConversationMemory {
    capacity: usize,
    rings: RwLock<HashMap<String, VecDeque<ConversationTurn>>>,
}

impl ConversationMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn push(&self, turn: ConversationTurn) {
        let mut rings = self.rings.write().await;
        let ring = rings
            .entry(turn.session_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(turn);
    }

    /// Up to `limit` newest turns, oldest first.
    pub async fn recent(&self, session_id: &str, limit: usize) -> Vec<ConversationTurn> {
        let rings = self.rings.read().await;
        rings
            .get(session_id)
            .map(|ring| {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub async fn forget(&self, session_id: &str) {
        self.rings.write().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.rings.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AnswerMode;
    use chrono::Utc;

    fn turn(session: &str, n: usize) -> ConversationTurn {
        ConversationTurn {
            session_id: session.into(),
            user_id: "u1".into(),
            message: format!("m{}", n),
            response: None,
            mode: AnswerMode::Coach,
            intent: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ring_keeps_only_newest() {
        let memory = ConversationMemory::new(3);
        for n in 1..=5 {
            memory.push(turn("s1", n)).await;
        }
        let recent: Vec<String> = memory.recent("s1", 10).await.into_iter().map(|t| t.message).collect();
        assert_eq!(recent, vec!["m3", "m4", "m5"]);

        let last_two: Vec<String> = memory.recent("s1", 2).await.into_iter().map(|t| t.message).collect();
        assert_eq!(last_two, vec!["m4", "m5"]);
    }

    #[tokio::test]
    async fn sessions_are_isolated_and_forgettable() {
        let memory = ConversationMemory::new(2);
        memory.push(turn("a", 1)).await;
        memory.push(turn("b", 1)).await;
        assert_eq!(memory.session_count().await, 2);

        memory.forget("a").await;
        assert!(memory.recent("a", 5).await.is_empty());
        assert_eq!(memory.recent("b", 5).await.len(), 1);
    }
}
