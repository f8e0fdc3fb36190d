use crate::models::{
    Answer, Candidate, ChatEvent, ChatRequest, ErrorEvent, MetaEvent, Provenance, RouteTag,
    StageTimings,
};
use crate::services::cache::{cache_key, TtlLruCache};
use crate::services::confidence;
use crate::services::conversation::{ConversationManager, ConversationTurn, Role};
use crate::services::model_client::ChatMessage;
use crate::services::model_router::{ModelRouter, RoutingDecision};
use crate::services::reranker::{RerankStatus, RerankerClient};
use crate::services::retriever::Retriever;
use crate::services::synthesizer::Synthesizer;
use crate::services::web_search::{results_to_candidates, WebSearchClient};
use crate::utils::error::ApiError;
use crate::utils::metrics::Metrics;
use crate::utils::text::normalize_query;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Margin below the threshold that triggers the post-synthesis web retry.
const POST_SYNTHESIS_MARGIN: f32 = 0.05;

/// The query-time serving pipeline: classify -> embed -> retrieve ->
/// rerank -> confidence -> synthesize, with the confidence-gated web
/// fallback. Produces the SSE event sequence consumed by the handlers.
pub struct RagService {
    router: Arc<ModelRouter>,
    retriever: Arc<Retriever>,
    reranker: Arc<RerankerClient>,
    synthesizer: Arc<Synthesizer>,
    web_search: Arc<WebSearchClient>,
    conversations: Arc<ConversationManager>,
    answer_cache: TtlLruCache<Answer>,
    metrics: Metrics,
    cache_enabled: bool,
    memory_turns: usize,
    candidate_pool: usize,
}

/// Everything decided before the first byte is streamed.
enum Prepared {
    CacheHit {
        answer: Answer,
        instance_name: String,
    },
    Generate(Box<GenerationPlan>),
}

struct GenerationPlan {
    decision: RoutingDecision,
    route: RouteTag,
    context: Vec<Candidate>,
    messages: Vec<ChatMessage>,
    provenance: Vec<Provenance>,
    conf_retrieval: f32,
    annotations: Vec<String>,
    timings: StageTimings,
    cache_key: String,
    web_available: bool,
}

impl RagService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<ModelRouter>,
        retriever: Arc<Retriever>,
        reranker: Arc<RerankerClient>,
        synthesizer: Arc<Synthesizer>,
        web_search: Arc<WebSearchClient>,
        conversations: Arc<ConversationManager>,
        answer_cache: TtlLruCache<Answer>,
        metrics: Metrics,
        cache_enabled: bool,
        memory_turns: usize,
        candidate_pool: usize,
    ) -> Self {
        Self {
            router,
            retriever,
            reranker,
            synthesizer,
            web_search,
            conversations,
            answer_cache,
            metrics,
            cache_enabled,
            memory_turns,
            candidate_pool,
        }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn answer_cache_len(&self) -> usize {
        self.answer_cache.len()
    }

    /// Drive one chat request. Event order: one `meta`, zero or more
    /// `token`s, then exactly one `final` or `error`. Dropping the
    /// stream cancels the in-flight pipeline; nothing is cached and no
    /// turns are persisted for a cancelled request.
    pub fn answer_stream(
        self: Arc<Self>,
        request: ChatRequest,
        request_id: String,
    ) -> impl Stream<Item = ChatEvent> + Send {
        async_stream::stream! {
            let total_start = Instant::now();

            let prepared = match self.prepare(&request, &request_id).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.metrics.incr_errors();
                    yield ChatEvent::Error(ErrorEvent {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                    return;
                }
            };

            let mut plan = match prepared {
                Prepared::CacheHit {
                    mut answer,
                    instance_name,
                } => {
                    self.metrics.incr_cache_hit();
                    answer.created_at = Utc::now();
                    answer.timings.total_ms = total_start.elapsed().as_millis() as u64;
                    answer.annotations.push("cache=hit".to_string());

                    yield ChatEvent::Meta(MetaEvent {
                        request_id: request_id.clone(),
                        route: answer.route,
                        model: answer.model.clone(),
                        instance: instance_name,
                        annotations: answer.annotations.clone(),
                    });
                    // Cached answers are emitted in a single chunk
                    yield ChatEvent::Token(answer.answer.clone());
                    yield ChatEvent::Final(answer);
                    return;
                }
                Prepared::Generate(plan) => plan,
            };

            yield ChatEvent::Meta(MetaEvent {
                request_id: request_id.clone(),
                route: plan.route,
                model: plan.decision.model.clone(),
                instance: plan.decision.instance.clone(),
                annotations: plan.annotations.clone(),
            });

            // --- synthesize (streamed) --------------------------------
            let synth_start = Instant::now();
            let messages = std::mem::take(&mut plan.messages);
            let mut generation = match self
                .synthesizer
                .synthesize_stream(
                    plan.decision.picked.clone(),
                    &plan.decision.model,
                    messages,
                    request.temperature,
                    request.max_tokens,
                )
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    self.metrics.incr_errors();
                    yield ChatEvent::Error(ErrorEvent {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                    return;
                }
            };

            let mut text = String::new();
            let mut tokens_emitted: u64 = 0;
            let mut generation_error: Option<ApiError> = None;

            while let Some(item) = generation.next().await {
                match item {
                    Ok(token) => {
                        if !token.text.is_empty() {
                            text.push_str(&token.text);
                            tokens_emitted += 1;
                            yield ChatEvent::Token(token.text);
                        }
                        if token.done {
                            break;
                        }
                    }
                    Err(e) => {
                        generation_error = Some(e);
                        break;
                    }
                }
            }
            drop(generation);

            if let Some(e) = generation_error {
                // Partial buffered text is discarded; no cache write
                self.metrics.incr_errors();
                yield ChatEvent::Error(ErrorEvent {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
                return;
            }

            plan.timings.synthesize_ms = synth_start.elapsed().as_millis() as u64;
            self.metrics.add_tokens_streamed(tokens_emitted);

            let post_conf =
                confidence::answer_confidence(plan.conf_retrieval as f64, &text, &plan.context)
                    as f32;

            let mut answer = Answer {
                answer: text,
                confidence: post_conf,
                provenance: plan.provenance.clone(),
                route: plan.route,
                model: plan.decision.model.clone(),
                annotations: plan.annotations.clone(),
                timings: plan.timings.clone(),
                created_at: Utc::now(),
            };

            // Post-synthesis gate: a weak doc answer earns one buffered
            // web retry; the higher-confidence answer wins (tie: doc).
            if plan.route == RouteTag::Doc
                && plan.web_available
                && answer.confidence < request.confidence_threshold - POST_SYNTHESIS_MARGIN
            {
                debug!(
                    request_id = %request_id,
                    confidence = answer.confidence,
                    "doc answer below threshold, retrying via web"
                );

                match self.buffered_web_answer(&request, &plan.decision).await {
                    Ok(web_answer) if web_answer.confidence > answer.confidence => {
                        self.metrics.incr_route_web();
                        answer = Answer {
                            route: RouteTag::Hybrid,
                            ..web_answer
                        };
                        answer.annotations.push("web_retry=used".to_string());
                    }
                    Ok(_) => {
                        answer.annotations.push("web_retry=doc_kept".to_string());
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, "web retry failed: {}", e);
                        answer
                            .annotations
                            .push("doc_with_web_fallback_failed".to_string());
                    }
                }
            }

            answer.timings.total_ms = total_start.elapsed().as_millis() as u64;

            self.finish(&request, &plan.cache_key, &answer).await;
            yield ChatEvent::Final(answer);
        }
    }

    /// Everything up to the first emitted event: routing, cache lookup,
    /// retrieval, reranking, the confidence gate and prompt assembly.
    async fn prepare(
        &self,
        request: &ChatRequest,
        request_id: &str,
    ) -> Result<Prepared, ApiError> {
        let mut timings = StageTimings::default();
        let mut annotations: Vec<String> = Vec::new();

        // --- classify & route -----------------------------------------
        let classify_start = Instant::now();
        let decision = self
            .router
            .route(
                &request.query,
                request.model.as_deref(),
                request.conversation_id.as_deref(),
            )
            .await?;
        timings.classify_ms = classify_start.elapsed().as_millis() as u64;

        if decision.fallback_applied {
            annotations.push("model=fallback".to_string());
        }

        info!(
            request_id,
            category = decision.category.as_str(),
            model = %decision.model,
            instance = %decision.instance,
            "routed chat request"
        );

        // --- answer cache ---------------------------------------------
        let cache_key = self.answer_cache_key(request, &decision.model);
        if self.cache_enabled {
            if let Some(cached) = self.answer_cache.get(&cache_key) {
                debug!(request_id, "answer cache hit");
                return Ok(Prepared::CacheHit {
                    answer: cached,
                    instance_name: decision.instance,
                });
            }
        }

        // --- retrieve -------------------------------------------------
        // The reranker consumes the candidate pool; without it the
        // retriever cuts straight to top_k.
        let rerank_active = request.rerank && self.reranker.is_enabled();
        let retrieve_k = if rerank_active {
            self.candidate_pool.max(request.top_k)
        } else {
            request.top_k
        };

        let retrieval = self
            .retriever
            .retrieve(
                &request.query,
                request.mode,
                retrieve_k,
                request.alpha,
                request.filters.as_ref(),
            )
            .await?;
        timings.embed_ms = retrieval.timings.embed_ms;
        timings.retrieve_ms = retrieval.timings.retrieve_ms;

        // --- rerank ---------------------------------------------------
        let (candidates, rerank_status) = if rerank_active {
            let outcome = self
                .reranker
                .rerank(&request.query, retrieval.candidates, request.top_k)
                .await;
            timings.rerank_ms = outcome.elapsed_ms;
            if outcome.status == RerankStatus::Fallback {
                self.metrics.incr_rerank_fallback();
            }
            (outcome.candidates, outcome.status)
        } else {
            let mut candidates = retrieval.candidates;
            candidates.truncate(request.top_k);
            (candidates, RerankStatus::Disabled)
        };

        if let Some(note) = rerank_status.annotation() {
            annotations.push(note.to_string());
        }

        // --- confidence gate ------------------------------------------
        let conf_retrieval =
            confidence::retrieval_confidence(&request.query, &candidates, rerank_status) as f32;
        debug!(request_id, conf_retrieval, "retrieval confidence");

        let web_available = request.web_search_enabled && self.web_search.is_enabled();
        let go_web = web_available && conf_retrieval < request.confidence_threshold;

        let (route, context) = if go_web {
            self.metrics.incr_route_web();
            let outcome = self.web_search.search(&request.query).await?;
            if outcome.html_fallback {
                annotations.push("web=html_fallback".to_string());
            }
            (RouteTag::Web, results_to_candidates(&outcome.results))
        } else {
            self.metrics.incr_route_doc();
            (RouteTag::Doc, candidates)
        };

        // --- prompt assembly ------------------------------------------
        let history = self.history_for(request).await;
        let plan = self.synthesizer.assemble_prompt(
            &request.query,
            &context,
            &history,
            request.max_context_chunks,
            request.max_tokens,
            go_web,
        )?;
        let provenance = Synthesizer::provenance(&context, &plan.included);

        Ok(Prepared::Generate(Box::new(GenerationPlan {
            decision,
            route,
            context,
            messages: plan.messages,
            provenance,
            conf_retrieval,
            annotations,
            timings,
            cache_key,
            web_available,
        })))
    }

    /// Collect a full event stream into an Answer for `stream=false`
    /// callers. The terminal `error` event becomes the ApiError.
    pub async fn collect_answer(
        stream: impl Stream<Item = ChatEvent> + Send,
    ) -> Result<Answer, ApiError> {
        futures::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                ChatEvent::Final(answer) => return Ok(answer),
                ChatEvent::Error(e) => {
                    return Err(match e.code.as_str() {
                        "overloaded" => ApiError::Overloaded(e.message),
                        "no_available_instance" => ApiError::NoAvailableInstance(e.message),
                        "vector_store_unavailable" => ApiError::VectorStoreUnavailable(e.message),
                        "web_search_unavailable" => ApiError::WebSearchUnavailable(e.message),
                        "embedding_unavailable" => ApiError::EmbeddingUnavailable(e.message),
                        "generation_timeout" => ApiError::GenerationTimeout(e.message),
                        "generation_failed" => ApiError::GenerationFailed(e.message),
                        "deadline_exceeded" => ApiError::DeadlineExceeded(e.message),
                        "context_overflow" => ApiError::ContextOverflow(e.message),
                        "dimension_mismatch" => ApiError::DimensionMismatch(e.message),
                        "empty_corpus" => ApiError::EmptyCorpus,
                        "validation" => ApiError::Validation(e.message),
                        _ => ApiError::Internal(e.message),
                    });
                }
                ChatEvent::Meta(_) | ChatEvent::Token(_) => {}
            }
        }

        Err(ApiError::Internal(
            "pipeline ended without a final event".to_string(),
        ))
    }

    fn answer_cache_key(&self, request: &ChatRequest, model: &str) -> String {
        let filters = request
            .filters
            .as_ref()
            .map(|f| f.cache_key_part())
            .unwrap_or_else(|| "-".to_string());

        cache_key(&[
            &normalize_query(&request.query),
            request.mode.as_str(),
            &request.top_k.to_string(),
            model,
            &format!("{:.4}", request.alpha),
            &filters,
        ])
    }

    async fn history_for(&self, request: &ChatRequest) -> Vec<ConversationTurn> {
        match &request.conversation_id {
            Some(conversation_id) => {
                self.conversations
                    .memory_turns(conversation_id, &request.query, self.memory_turns)
                    .await
            }
            None => Vec::new(),
        }
    }

    /// Fully buffered web-path answer for the post-synthesis retry.
    async fn buffered_web_answer(
        &self,
        request: &ChatRequest,
        decision: &RoutingDecision,
    ) -> Result<Answer, ApiError> {
        let outcome = self.web_search.search(&request.query).await?;
        let web_candidates = results_to_candidates(&outcome.results);

        let history = self.history_for(request).await;
        let plan = self.synthesizer.assemble_prompt(
            &request.query,
            &web_candidates,
            &history,
            request.max_context_chunks,
            request.max_tokens,
            true,
        )?;
        let provenance = Synthesizer::provenance(&web_candidates, &plan.included);

        let mut stream = self
            .synthesizer
            .synthesize_stream(
                decision.picked.clone(),
                &decision.model,
                plan.messages,
                request.temperature,
                request.max_tokens,
            )
            .await?;

        let mut text = String::new();
        while let Some(item) = stream.next().await {
            let token = item?;
            text.push_str(&token.text);
            if token.done {
                break;
            }
        }

        // The web retry scores itself from scratch: its retrieval term
        // comes from the web candidate set with reranking disabled.
        let conf_retrieval = confidence::retrieval_confidence(
            &request.query,
            &web_candidates,
            RerankStatus::Disabled,
        );
        let confidence =
            confidence::answer_confidence(conf_retrieval, &text, &web_candidates) as f32;

        let mut annotations = vec!["web_retry".to_string()];
        if outcome.html_fallback {
            annotations.push("web=html_fallback".to_string());
        }

        Ok(Answer {
            answer: text,
            confidence,
            provenance,
            route: RouteTag::Web,
            model: decision.model.clone(),
            annotations,
            timings: StageTimings::default(),
            created_at: Utc::now(),
        })
    }

    /// Post-success bookkeeping: conversation turns and the answer
    /// cache. Runs only for fully synthesized answers, so a cancelled
    /// request writes nothing.
    async fn finish(&self, request: &ChatRequest, cache_key: &str, answer: &Answer) {
        if let Some(conversation_id) = &request.conversation_id {
            self.conversations
                .record_turn(conversation_id, Role::User, &request.query)
                .await;
            self.conversations
                .record_turn(conversation_id, Role::Assistant, &answer.answer)
                .await;
        }

        if self.cache_enabled && answer.confidence >= request.confidence_threshold {
            self.answer_cache
                .insert(cache_key.to_string(), answer.clone());
            debug!("answer cached");
        }
    }
}
