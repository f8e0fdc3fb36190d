use std::sync::Arc;

use crate::config::Settings;
use crate::database::Repository;
use crate::logging::RequestLogger;
use crate::registry::InstanceRegistry;
use crate::services::{
    conversation::ConversationManager, EmbeddingService, LexicalIndex, ModelRouter, RagService,
    RerankerClient, WebSearchClient,
};
use crate::utils::metrics::Metrics;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub repository: Arc<Repository>,
    pub registry: Arc<InstanceRegistry>,
    pub embedding_service: Arc<EmbeddingService>,
    pub lexical_index: Arc<LexicalIndex>,
    pub router: Arc<ModelRouter>,
    pub reranker: Arc<RerankerClient>,
    pub web_search: Arc<WebSearchClient>,
    pub rag_service: Arc<RagService>,
    pub conversation_manager: Arc<ConversationManager>,
    pub request_logger: RequestLogger,
    pub metrics: Metrics,
}
