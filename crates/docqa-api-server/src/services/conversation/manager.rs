use super::types::{ConversationState, ConversationTurn, Role};
use crate::database::Repository;
use crate::services::embedding_service::EmbeddingService;
use crate::utils::text::cosine;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns kept in memory per conversation.
const MAX_TURNS_IN_MEMORY: usize = 50;

/// Per-conversation turn store. The DashMap is the hot path; every
/// turn is also appended to Postgres for durability, and a cold
/// conversation is rehydrated from there on first touch.
pub struct ConversationManager {
    sessions: Arc<DashMap<String, ConversationState>>,
    repository: Arc<Repository>,
    embedding_service: Arc<EmbeddingService>,
}

#[derive(Debug, Clone)]
pub struct ConversationStats {
    pub active_conversations: usize,
    pub turns_in_memory: usize,
}

impl ConversationManager {
    pub fn new(repository: Arc<Repository>, embedding_service: Arc<EmbeddingService>) -> Self {
        info!("Initializing conversation manager");
        Self {
            sessions: Arc::new(DashMap::new()),
            repository,
            embedding_service,
        }
    }

    /// Append a turn: memory first, then the durable store. A store
    /// failure degrades to memory-only and must not fail the chat.
    pub async fn record_turn(&self, conversation_id: &str, role: Role, text: &str) {
        let turn = ConversationTurn {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
            embedding: None,
        };

        let turn_index;
        {
            let mut state = self
                .sessions
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationState::new(conversation_id.to_string()));
            state.touch();
            state.turns.push(turn);
            if state.turns.len() > MAX_TURNS_IN_MEMORY {
                let excess = state.turns.len() - MAX_TURNS_IN_MEMORY;
                state.turns.drain(..excess);
            }
            turn_index = state.turns.len() - 1;
        }

        if let Err(e) = self
            .repository
            .append_turn(conversation_id, role.as_str(), text)
            .await
        {
            warn!(conversation_id, "failed to persist turn: {}", e);
        }

        // User turns get an embedding for semantic memory lookup; done
        // off the request path so a slow embed never delays the answer.
        if role == Role::User {
            let embedding_service = self.embedding_service.clone();
            let sessions = self.sessions.clone();
            let conversation_id = conversation_id.to_string();
            let text = text.to_string();

            tokio::spawn(async move {
                match embedding_service.embed(&text).await {
                    Ok(embedding) => {
                        if let Some(mut state) = sessions.get_mut(&conversation_id) {
                            if let Some(turn) = state.turns.get_mut(turn_index) {
                                if turn.text == text {
                                    turn.embedding = Some(embedding);
                                }
                            }
                        }
                    }
                    Err(e) => debug!("turn embedding skipped: {}", e),
                }
            });
        }
    }

    /// Last `limit` turns, oldest first. Rehydrates from the durable
    /// store when the conversation is not in memory (process restart).
    pub async fn recent_turns(&self, conversation_id: &str, limit: usize) -> Vec<ConversationTurn> {
        if let Some(state) = self.sessions.get(conversation_id) {
            if !state.is_expired() {
                let turns = &state.turns;
                let start = turns.len().saturating_sub(limit);
                return turns[start..].to_vec();
            }
        }

        match self
            .repository
            .recent_turns(conversation_id, limit as i64)
            .await
        {
            Ok(rows) => {
                let turns: Vec<ConversationTurn> = rows
                    .into_iter()
                    .filter_map(|row| {
                        Role::parse(&row.role).map(|role| ConversationTurn {
                            role,
                            text: row.content,
                            timestamp: row.created_at,
                            embedding: None,
                        })
                    })
                    .collect();

                if !turns.is_empty() {
                    let mut state = ConversationState::new(conversation_id.to_string());
                    state.turns = turns.clone();
                    self.sessions.insert(conversation_id.to_string(), state);
                    debug!(conversation_id, "rehydrated conversation from store");
                }

                turns
            }
            Err(e) => {
                warn!(conversation_id, "failed to load turns: {}", e);
                Vec::new()
            }
        }
    }

    /// Memory block for prompt assembly: the last `limit` turns, plus up
    /// to two semantically similar older turns when the conversation has
    /// outgrown the window. The query embedding is a cache hit when the
    /// retriever already embedded this query.
    pub async fn memory_turns(
        &self,
        conversation_id: &str,
        query: &str,
        limit: usize,
    ) -> Vec<ConversationTurn> {
        let recent = self.recent_turns(conversation_id, limit).await;

        let total_turns = self
            .sessions
            .get(conversation_id)
            .map(|s| s.turns.len())
            .unwrap_or(0);
        if total_turns <= limit {
            return recent;
        }

        let query_embedding = match self.embedding_service.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                debug!("memory lookup skipped, embed failed: {}", e);
                return recent;
            }
        };

        let older_cutoff = recent.first().map(|t| t.timestamp);
        let mut memory: Vec<ConversationTurn> = self
            .similar_turns(conversation_id, &query_embedding, 2)
            .into_iter()
            .filter(|t| match older_cutoff {
                Some(cutoff) => t.timestamp < cutoff,
                None => true,
            })
            .collect();

        memory.sort_by_key(|t| t.timestamp);
        memory.extend(recent);
        memory
    }

    /// Semantically closest past turns of this conversation, by cosine
    /// similarity between the query embedding and stored turn embeddings.
    pub fn similar_turns(
        &self,
        conversation_id: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Vec<ConversationTurn> {
        let Some(state) = self.sessions.get(conversation_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(f32, ConversationTurn)> = state
            .turns
            .iter()
            .filter_map(|turn| {
                let embedding = turn.embedding.as_ref()?;
                let score = cosine(query_embedding, embedding)?;
                Some((score, turn.clone()))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored.into_iter().map(|(_, turn)| turn).collect()
    }

    /// Remove expired conversations. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, state| !state.is_expired());
        let removed = before.saturating_sub(self.sessions.len());

        if removed > 0 {
            info!("Cleaned up {} expired conversations", removed);
        }

        removed
    }

    pub fn stats(&self) -> ConversationStats {
        let turns_in_memory = self.sessions.iter().map(|s| s.turns.len()).sum();
        ConversationStats {
            active_conversations: self.sessions.len(),
            turns_in_memory,
        }
    }
}
