pub mod cache;
pub mod confidence;
pub mod conversation;
pub mod embedding_service;
pub mod lexical_index;
pub mod model_client;
pub mod model_router;
pub mod rag_service;
pub mod reranker;
pub mod retriever;
pub mod synthesizer;
pub mod web_search;

pub use embedding_service::EmbeddingService;
pub use lexical_index::LexicalIndex;
pub use model_client::ModelServerClient;
pub use model_router::{ModelRouter, QueryCategory};
pub use rag_service::RagService;
pub use reranker::RerankerClient;
pub use retriever::Retriever;
pub use synthesizer::Synthesizer;
pub use web_search::WebSearchClient;
