use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Embedding of the turn text, filled in lazily for memory lookup.
    pub embedding: Option<Vec<f32>>,
}

/// In-memory state for one conversation. A conversation exclusively
/// owns its turns.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub conversation_id: String,
    pub turns: Vec<ConversationTurn>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl ConversationState {
    pub fn new(conversation_id: String) -> Self {
        let now = Instant::now();
        Self {
            conversation_id,
            turns: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Expired after 6 hours of absolute age, or 1 hour without a new
    /// turn. Idle expiry only drops the in-memory state (turn
    /// embeddings included); the durable turns rehydrate on the next
    /// touch of the conversation.
    pub fn is_expired(&self) -> bool {
        const MAX_AGE_SECS: u64 = 6 * 60 * 60;
        const MAX_IDLE_SECS: u64 = 60 * 60;

        self.created_at.elapsed().as_secs() > MAX_AGE_SECS
            || self.last_activity.elapsed().as_secs() > MAX_IDLE_SECS
    }

    /// Reset the idle clock; called on every appended turn.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("system"), None);
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn test_fresh_state_not_expired() {
        let state = ConversationState::new("c1".to_string());
        assert!(!state.is_expired());
        assert!(state.turns.is_empty());
    }

    #[test]
    fn test_touch_resets_idle_clock() {
        let mut state = ConversationState::new("c1".to_string());
        let before = state.last_activity;
        std::thread::sleep(std::time::Duration::from_millis(2));
        state.touch();
        assert!(state.last_activity > before);
    }
}
