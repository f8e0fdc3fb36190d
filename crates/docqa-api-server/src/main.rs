use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

mod config;
mod database;
mod handlers;
mod logging;
mod models;
mod registry;
mod services;
mod state;
mod utils;

use config::Settings;
use database::{DbPool, Repository};
use logging::RequestLogger;
use registry::{HealthMonitor, InstanceRegistry};
use services::cache::TtlLruCache;
use services::conversation::ConversationManager;
use services::{
    EmbeddingService, LexicalIndex, ModelRouter, ModelServerClient, RagService, RerankerClient,
    Retriever, Synthesizer, WebSearchClient,
};
use state::AppState;
use utils::limiters::Limiters;
use utils::metrics::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,docqa_api_server=debug".to_string()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("🚀 Starting DocQA API Server...");

    // Load configuration
    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    // Vector store pool
    let db_pool = DbPool::new(&settings.vector_store).await?;
    info!("✅ Vector store connection established");

    let repository = Arc::new(Repository::new(
        db_pool.clone(),
        settings.vector_store.chunk_table.clone(),
    )?);

    // Instance registry + health monitor
    let registry = Arc::new(InstanceRegistry::from_config(
        &settings.instances,
        settings.health.failure_threshold,
        settings.health.pick_wait_ms,
    ));
    let monitor = HealthMonitor::new(registry.clone(), &settings.health);
    let monitor_handle = monitor.spawn();
    info!("✅ Health monitor started ({} instances)", registry.len());

    // Concurrency limiters. The generation gate is sized from the
    // instances that actually carry generation-capable models.
    let generation_hosts = registry
        .count_hosting_any(&settings.models.generation_models())
        .max(1);
    let limiters = Arc::new(Limiters::new(
        settings.generation.concurrency_cap_per_instance * generation_hosts,
        settings.limits.embedding_concurrency,
        settings.limits.db_search_concurrency,
    ));

    // Shared HTTP client for the model-server fleet
    let model_client = ModelServerClient::new(Duration::from_secs(
        settings.generation.timeout_s.max(60),
    ));

    // Services
    let embedding_service = Arc::new(EmbeddingService::new(
        registry.clone(),
        Arc::new(model_client.clone()),
        limiters.clone(),
        settings.embedding.clone(),
        Duration::from_secs(settings.cache.embedding_ttl_s),
        settings.cache.embedding_max_entries,
    ));

    let lexical_index = Arc::new(LexicalIndex::new(repository.clone()));

    let retriever = Arc::new(Retriever::new(
        repository.clone(),
        embedding_service.clone(),
        lexical_index.clone(),
        limiters.clone(),
        settings.retrieval.candidate_pool,
        settings.vector_store.category_filters_enabled,
    ));

    let router_service = Arc::new(ModelRouter::new(registry.clone(), settings.models.clone()));

    let reranker = Arc::new(RerankerClient::new(
        settings.reranker.url.clone(),
        settings.reranker.timeout_s,
    ));

    let web_search = Arc::new(WebSearchClient::new(
        settings.web_search.url.clone(),
        settings.web_search.timeout_s,
    ));

    let synthesizer = Arc::new(Synthesizer::new(
        model_client,
        registry.clone(),
        limiters.clone(),
        settings.generation.clone(),
    ));

    let conversation_manager = Arc::new(ConversationManager::new(
        repository.clone(),
        embedding_service.clone(),
    ));

    let metrics = Metrics::new();

    let rag_service = Arc::new(RagService::new(
        router_service.clone(),
        retriever,
        reranker.clone(),
        synthesizer,
        web_search.clone(),
        conversation_manager.clone(),
        TtlLruCache::new(
            Duration::from_secs(settings.cache.answer_ttl_s),
            settings.cache.answer_max_entries,
        ),
        metrics.clone(),
        settings.cache.enabled,
        settings.generation.memory_turns,
        settings.retrieval.candidate_pool,
    ));

    let request_logger = RequestLogger::new(db_pool.get_pool().clone(), settings.logging.clone());

    // Warm the lexical index in the background so the first lexical
    // query does not pay the build
    {
        let lexical_index = lexical_index.clone();
        tokio::spawn(async move {
            if let Err(e) = lexical_index.ensure_built().await {
                tracing::warn!("initial lexical index build failed: {}", e);
            }
        });
    }

    // Periodic conversation cleanup
    {
        let conversation_manager = conversation_manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            loop {
                ticker.tick().await;
                conversation_manager.cleanup_expired();
            }
        });
    }

    let state = Arc::new(AppState {
        settings: settings.clone(),
        repository,
        registry,
        embedding_service,
        lexical_index,
        router: router_service,
        reranker,
        web_search,
        rag_service,
        conversation_manager,
        request_logger,
        metrics: metrics.clone(),
    });

    // Optional metrics listener on a separate port
    if let Some(metrics_port) = settings.server.metrics_port {
        let metrics = metrics.clone();
        let host = settings.server.host.clone();
        tokio::spawn(async move {
            let app = Router::new().route(
                "/metrics",
                get(move || {
                    let metrics = metrics.clone();
                    async move { axum::Json(metrics.snapshot()) }
                }),
            );
            let addr = format!("{}:{}", host, metrics_port);
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("📈 Metrics listening on {}", addr);
                    let _ = axum::serve(listener, app).await;
                }
                Err(e) => tracing::error!("metrics listener failed to bind {}: {}", addr, e),
            }
        });
    }

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor_handle.abort();
    info!("Server stopped");

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Public surface
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route("/instances", get(handlers::instances::list_instances))
        .route("/classify", post(handlers::classify::classify_handler))
        .route("/search", post(handlers::search::search_handler))
        .route("/chat", post(handlers::chat::chat_handler))
        // Ingestion-worker surface
        .route("/api/chunks", post(handlers::ingest::ingest_chunks_handler))
        .route("/api/index/refresh", post(handlers::ingest::refresh_index_handler))
        .route(
            "/api/documents/{document_id}",
            delete(handlers::ingest::delete_document_handler),
        )
        .with_state(state)
        // CORS
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
