use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::logging::{Endpoint, RequestLog, RequestLogger};
use crate::models::{Answer, ChatEvent, ChatRequest, TokenEventPayload};
use crate::services::RagService;
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /chat - SSE when `stream=true`, a single JSON body otherwise.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if let Err(message) = request.validate() {
        return ApiError::Validation(message).into_response();
    }

    let request_id = Uuid::new_v4().to_string();
    state.metrics.incr_requests();
    state.metrics.incr_chat();

    info!(
        request_id = %request_id,
        conversation_id = ?request.conversation_id,
        stream = request.stream,
        "chat request"
    );

    if request.stream {
        let stream = sse_events(state.clone(), request, request_id);
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    } else {
        let events = state
            .rag_service
            .clone()
            .answer_stream(request.clone(), request_id.clone());

        let total_start = Instant::now();
        match RagService::collect_answer(events).await {
            Ok(answer) => {
                log_final(&state.request_logger, &request_id, &request, &answer);
                Json(answer).into_response()
            }
            Err(e) => {
                state.request_logger.log(
                    RequestLog::builder(&request_id, Endpoint::Chat)
                        .conversation_id(request.conversation_id.clone())
                        .query_chars(request.query.chars().count())
                        .error(e.code())
                        .total_ms(total_start.elapsed().as_millis() as u64)
                        .build(),
                );
                e.into_response()
            }
        }
    }
}

/// Map pipeline events onto the SSE wire protocol, recording the
/// request log as the terminal event passes through.
fn sse_events(
    state: Arc<AppState>,
    request: ChatRequest,
    request_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let total_start = Instant::now();
        let mut instance: Option<String> = None;

        let events = state
            .rag_service
            .clone()
            .answer_stream(request.clone(), request_id.clone());
        futures::pin_mut!(events);

        use futures::StreamExt;
        while let Some(event) = events.next().await {
            match event {
                ChatEvent::Meta(meta) => {
                    instance = Some(meta.instance.clone());
                    let data = serde_json::to_string(&meta).unwrap_or_default();
                    yield Ok(Event::default().event("meta").data(data));
                }
                ChatEvent::Token(text) => {
                    let data = serde_json::to_string(&TokenEventPayload { text })
                        .unwrap_or_default();
                    yield Ok(Event::default().event("token").data(data));
                }
                ChatEvent::Final(answer) => {
                    let mut log = RequestLog::builder(&request_id, Endpoint::Chat)
                        .conversation_id(request.conversation_id.clone())
                        .query_chars(request.query.chars().count())
                        .route(answer.route.as_str())
                        .model(answer.model.clone())
                        .cache_hit(answer.annotations.iter().any(|a| a == "cache=hit"))
                        .confidence(answer.confidence)
                        .timings(
                            answer.timings.classify_ms,
                            answer.timings.embed_ms,
                            answer.timings.retrieve_ms,
                            answer.timings.rerank_ms,
                            answer.timings.synthesize_ms,
                            answer.timings.total_ms,
                        );
                    if let Some(instance) = instance.take() {
                        log = log.instance(instance);
                    }
                    state.request_logger.log(log.build());

                    let data = serde_json::to_string(&answer).unwrap_or_default();
                    yield Ok(Event::default().event("final").data(data));
                }
                ChatEvent::Error(error) => {
                    state.request_logger.log(
                        RequestLog::builder(&request_id, Endpoint::Chat)
                            .conversation_id(request.conversation_id.clone())
                            .query_chars(request.query.chars().count())
                            .error(error.code.clone())
                            .total_ms(total_start.elapsed().as_millis() as u64)
                            .build(),
                    );

                    let data = serde_json::to_string(&error).unwrap_or_default();
                    yield Ok(Event::default().event("error").data(data));
                    return;
                }
            }
        }
    }
}

fn log_final(logger: &RequestLogger, request_id: &str, request: &ChatRequest, answer: &Answer) {
    logger.log(
        RequestLog::builder(request_id, Endpoint::Chat)
            .conversation_id(request.conversation_id.clone())
            .query_chars(request.query.chars().count())
            .route(answer.route.as_str())
            .model(answer.model.clone())
            .cache_hit(answer.annotations.iter().any(|a| a == "cache=hit"))
            .confidence(answer.confidence)
            .timings(
                answer.timings.classify_ms,
                answer.timings.embed_ms,
                answer.timings.retrieve_ms,
                answer.timings.rerank_ms,
                answer.timings.synthesize_ms,
                answer.timings.total_ms,
            )
            .build(),
    );
}
