use crate::config::GenerationConfig;
use crate::models::{Candidate, Provenance};
use crate::registry::{InstanceRegistry, ModelInstance};
use crate::services::conversation::{ConversationTurn, Role};
use crate::services::model_client::{
    ChatMessage, GenerationOptions, ModelServerClient, TokenStream,
};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use crate::utils::token_estimator::estimate_tokens;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DOC_PREFACE: &str = "You are a technical documentation assistant. Answer the question \
using only the numbered context passages below. Cite the passages you use with their bracketed \
index, e.g. [1]. If the context does not contain the answer, say so plainly; never fabricate \
facts that are absent from the context.";

const WEB_PREFACE: &str = "You are a technical assistant. The numbered context passages below \
are snippets from public web pages, not internal documentation; mention that your sources are \
web results. Cite the passages you use with their bracketed index, e.g. [1]. If the context \
does not contain the answer, say so plainly; never fabricate facts that are absent from the \
context.";

/// Assembled prompt plus the candidate indices that made it into the
/// context block (for provenance).
#[derive(Debug)]
pub struct PromptPlan {
    pub messages: Vec<ChatMessage>,
    pub included: Vec<usize>,
    pub prompt_tokens: usize,
}

/// Answer Synthesizer: grounded prompt assembly and streamed generation
/// through the chosen model instance.
pub struct Synthesizer {
    client: ModelServerClient,
    registry: Arc<InstanceRegistry>,
    limiters: Arc<Limiters>,
    config: GenerationConfig,
}

impl Synthesizer {
    pub fn new(
        client: ModelServerClient,
        registry: Arc<InstanceRegistry>,
        limiters: Arc<Limiters>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            client,
            registry,
            limiters,
            config,
        }
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_s)
    }

    /// Build the grounded prompt. Candidates must arrive in final-score
    /// order; when the token budget is exceeded, the lowest-scored
    /// chunks are dropped first, then the oldest conversation turns.
    /// The top chunk and the question are never dropped; if even they
    /// do not fit, this is a ContextOverflow.
    pub fn assemble_prompt(
        &self,
        query: &str,
        candidates: &[Candidate],
        history: &[ConversationTurn],
        max_context_chunks: usize,
        max_tokens: usize,
        web_route: bool,
    ) -> Result<PromptPlan, ApiError> {
        let preface = if web_route { WEB_PREFACE } else { DOC_PREFACE };
        let budget = self
            .config
            .context_window_tokens
            .saturating_sub(max_tokens.min(self.config.context_window_tokens));

        let mut chunk_count = candidates.len().min(max_context_chunks);
        let mut turns: Vec<&ConversationTurn> = history
            .iter()
            .rev()
            .take(self.config.memory_turns)
            .collect();
        turns.reverse();

        loop {
            let plan = build_messages(preface, query, candidates, chunk_count, &turns);
            if plan.prompt_tokens <= budget {
                if plan.included.is_empty() && !candidates.is_empty() {
                    // Loop invariant: chunk_count only reaches 0 when
                    // even the top chunk alone was over budget.
                    return Err(ApiError::ContextOverflow(
                        "top chunk and question exceed the prompt budget".to_string(),
                    ));
                }
                debug!(
                    chunks = plan.included.len(),
                    turns = turns.len(),
                    tokens = plan.prompt_tokens,
                    "prompt assembled"
                );
                return Ok(plan);
            }

            // Over budget: lowest-scored chunks go first
            if chunk_count > 1 {
                chunk_count -= 1;
                continue;
            }
            // then the oldest conversation turns
            if !turns.is_empty() {
                turns.remove(0);
                continue;
            }

            return Err(ApiError::ContextOverflow(format!(
                "minimal prompt needs {} tokens, budget is {}",
                build_messages(preface, query, candidates, chunk_count, &turns).prompt_tokens,
                budget
            )));
        }
    }

    /// Provenance for the context entries actually used.
    pub fn provenance(candidates: &[Candidate], included: &[usize]) -> Vec<Provenance> {
        included
            .iter()
            .filter_map(|&idx| candidates.get(idx))
            .map(|c| Provenance {
                chunk_id: c.chunk_id,
                score: c.final_score,
                source: c.source.clone(),
            })
            .collect()
    }

    /// Start a streamed generation under the global generation gate.
    /// The permit and the instance in-flight marker live inside the
    /// returned stream, so cancellation releases them.
    pub async fn synthesize_stream(
        &self,
        instance: Arc<ModelInstance>,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<TokenStream, ApiError> {
        let permit = self.limiters.acquire_generation().await?;
        let in_flight = instance.begin_call();

        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.generation_timeout();

        let upstream = match self
            .client
            .chat_stream(
                &instance.url,
                model,
                messages,
                GenerationOptions {
                    temperature,
                    num_predict: max_tokens,
                },
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.registry.record_outcome(
                    &instance,
                    model,
                    start.elapsed().as_millis() as f64,
                    false,
                );
                return Err(e);
            }
        };

        let registry = self.registry.clone();
        let model = model.to_string();

        let stream = async_stream::stream! {
            // Held for the lifetime of the generation; dropped (and
            // released) on every exit path including cancellation.
            let _permit = permit;
            let _in_flight = in_flight;

            let mut upstream = upstream;
            let mut completed = false;

            loop {
                use futures::StreamExt;

                let next = match tokio::time::timeout_at(deadline, upstream.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        warn!(model = %model, "generation exceeded wall-clock timeout");
                        registry.record_outcome(
                            &instance,
                            &model,
                            start.elapsed().as_millis() as f64,
                            false,
                        );
                        yield Err(ApiError::GenerationTimeout(format!(
                            "generation exceeded {}s",
                            start.elapsed().as_secs()
                        )));
                        return;
                    }
                };

                match next {
                    Some(Ok(event)) => {
                        let done = event.done;
                        yield Ok(event);
                        if done {
                            completed = true;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        registry.record_outcome(
                            &instance,
                            &model,
                            start.elapsed().as_millis() as f64,
                            false,
                        );
                        yield Err(e);
                        return;
                    }
                    None => break,
                }
            }

            if completed {
                registry.record_outcome(
                    &instance,
                    &model,
                    start.elapsed().as_millis() as f64,
                    true,
                );
            }
        };

        Ok(Box::pin(stream))
    }
}

fn build_messages(
    preface: &str,
    query: &str,
    candidates: &[Candidate],
    chunk_count: usize,
    turns: &[&ConversationTurn],
) -> PromptPlan {
    let mut system = String::with_capacity(2048);
    system.push_str(preface);

    let mut included = Vec::with_capacity(chunk_count);
    if chunk_count > 0 && !candidates.is_empty() {
        system.push_str("\n\nContext passages:\n");
        for (idx, candidate) in candidates.iter().take(chunk_count).enumerate() {
            let mut header = format!("[{}] {}", idx + 1, candidate.source);
            if let Some(section) = &candidate.section {
                let _ = write!(header, " - {}", section);
            }
            if let Some(page) = candidate.page {
                let _ = write!(header, " (page {})", page);
            }
            let _ = write!(system, "{}\n{}\n\n", header, candidate.content.trim());
            included.push(idx);
        }
    }

    let mut messages = Vec::with_capacity(turns.len() + 2);
    messages.push(ChatMessage {
        role: "system".to_string(),
        content: system,
    });

    for turn in turns {
        messages.push(ChatMessage {
            role: match turn.role {
                Role::User => "user".to_string(),
                Role::Assistant => "assistant".to_string(),
            },
            content: turn.text.clone(),
        });
    }

    messages.push(ChatMessage {
        role: "user".to_string(),
        content: query.to_string(),
    });

    let prompt_tokens = messages.iter().map(|m| estimate_tokens(&m.content)).sum();

    PromptPlan {
        messages,
        included,
        prompt_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentType;
    use chrono::Utc;

    fn synthesizer(window: usize) -> Synthesizer {
        let config = GenerationConfig {
            context_window_tokens: window,
            ..GenerationConfig::default()
        };
        Synthesizer::new(
            ModelServerClient::new(Duration::from_secs(60)),
            Arc::new(InstanceRegistry::new(3, 50)),
            Arc::new(Limiters::new(4, 4, 4)),
            config,
        )
    }

    fn candidate(chunk_id: i64, words: usize, score: f32) -> Candidate {
        Candidate {
            chunk_id,
            document_id: 1,
            source: "manual.pdf".to_string(),
            content: "word ".repeat(words).trim().to_string(),
            section: Some("Security".to_string()),
            page: Some(12),
            category: None,
            privacy_level: None,
            content_type: ContentType::Text,
            vector_score: Some(score),
            bm25_score: None,
            rerank_score: None,
            final_score: score,
        }
    }

    fn turn(role: Role, text: &str) -> ConversationTurn {
        ConversationTurn {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
            embedding: None,
        }
    }

    #[test]
    fn test_prompt_contains_numbered_context_and_question() {
        let synth = synthesizer(8192);
        let candidates = vec![candidate(1, 30, 0.9), candidate(2, 30, 0.7)];

        let plan = synth
            .assemble_prompt("What does RNI need?", &candidates, &[], 5, 1024, false)
            .unwrap();

        assert_eq!(plan.included, vec![0, 1]);
        let system = &plan.messages[0].content;
        assert!(system.contains("[1] manual.pdf"));
        assert!(system.contains("[2] manual.pdf"));
        assert!(system.contains("(page 12)"));
        assert_eq!(plan.messages.last().unwrap().content, "What does RNI need?");
    }

    #[test]
    fn test_memory_block_included() {
        let synth = synthesizer(8192);
        let history = vec![
            turn(Role::User, "My device is RNI 4.16"),
            turn(Role::Assistant, "Noted, RNI 4.16."),
        ];

        let plan = synth
            .assemble_prompt(
                "How do I configure its firewall?",
                &[candidate(1, 20, 0.9)],
                &history,
                5,
                1024,
                false,
            )
            .unwrap();

        assert_eq!(plan.messages.len(), 4);
        assert_eq!(plan.messages[1].content, "My device is RNI 4.16");
        assert_eq!(plan.messages[1].role, "user");
        assert_eq!(plan.messages[2].role, "assistant");
    }

    #[test]
    fn test_lowest_scored_chunks_dropped_first() {
        // Budget fits the top chunk plus question but not all five chunks
        let synth = synthesizer(600);
        let candidates: Vec<Candidate> = (0..5)
            .map(|i| candidate(i, 100, 1.0 - i as f32 * 0.1))
            .collect();

        let plan = synth
            .assemble_prompt("question?", &candidates, &[], 5, 100, false)
            .unwrap();

        assert!(!plan.included.is_empty());
        assert!(plan.included.len() < 5);
        // Kept chunks are the highest scored prefix
        assert_eq!(plan.included[0], 0);
    }

    #[test]
    fn test_turns_dropped_after_chunks() {
        let synth = synthesizer(400);
        let candidates = vec![candidate(1, 80, 0.9), candidate(2, 80, 0.5)];
        let history = vec![
            turn(Role::User, &"old ".repeat(120)),
            turn(Role::User, "recent short turn"),
        ];

        let plan = synth
            .assemble_prompt("question?", &candidates, &history, 5, 100, false)
            .unwrap();

        // Down to the top chunk, and the oldest turn was dropped
        assert_eq!(plan.included, vec![0]);
        let texts: Vec<&str> = plan.messages.iter().map(|m| m.content.as_str()).collect();
        assert!(texts.iter().any(|t| t.contains("recent short turn")));
        assert!(!texts.iter().any(|t| t.starts_with("old old")));
    }

    #[test]
    fn test_context_overflow_when_top_chunk_too_large() {
        let synth = synthesizer(120);
        let candidates = vec![candidate(1, 5000, 0.9)];

        let err = synth
            .assemble_prompt("question?", &candidates, &[], 5, 50, false)
            .unwrap_err();
        assert!(matches!(err, ApiError::ContextOverflow(_)));
    }

    #[test]
    fn test_web_preface_differs() {
        let synth = synthesizer(8192);
        let candidates = vec![candidate(1, 10, 0.9)];

        let doc = synth
            .assemble_prompt("q?", &candidates, &[], 5, 100, false)
            .unwrap();
        let web = synth
            .assemble_prompt("q?", &candidates, &[], 5, 100, true)
            .unwrap();

        assert!(doc.messages[0].content.contains("documentation assistant"));
        assert!(web.messages[0].content.contains("web pages"));
    }

    #[test]
    fn test_provenance_uses_included_indices() {
        let candidates = vec![candidate(11, 10, 0.9), candidate(22, 10, 0.8)];
        let provenance = Synthesizer::provenance(&candidates, &[0, 1]);
        assert_eq!(provenance.len(), 2);
        assert_eq!(provenance[0].chunk_id, 11);
        assert_eq!(provenance[1].chunk_id, 22);
        assert_eq!(provenance[0].source, "manual.pdf");
    }
}
