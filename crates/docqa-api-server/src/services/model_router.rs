/// Query Classifier & Model Router
/// Maps a query to a reasoning category, chooses the specialized model
/// for that category and asks the registry for the healthiest instance.
use crate::config::ModelRolesConfig;
use crate::registry::{InstanceRegistry, ModelInstance, SelectionStrategy};
use crate::utils::error::ApiError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryCategory {
    Code,
    Math,
    Creative,
    Technical,
    Chat,
}

impl QueryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Math => "math",
            Self::Creative => "creative",
            Self::Technical => "technical",
            Self::Chat => "chat",
        }
    }
}

const CODE_PATTERNS: &[&str] = &[
    "code", "function", "script", "debug", "implement", "class", "api",
];

const MATH_PATTERNS: &[&str] = &[
    "calculate", "solve", "equation", "arithmetic", "compute", "sum of",
];

const CREATIVE_PATTERNS: &[&str] = &[
    "write", "story", "poem", "creative", "imagine", "brainstorm",
];

const TECHNICAL_PATTERNS: &[&str] = &[
    "install", "configure", "troubleshoot", "specification", "version", "protocol",
    "documentation", "manual", "firmware",
];

/// Numeric comparator next to a digit, e.g. "5 > 3" or "x <= 10".
static NUMERIC_COMPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d\s*(==|<=|>=|<|>|\+|\-|\*|/|=)|(==|<=|>=|<|>|\+|\-|\*|/|=)\s*\d").unwrap());

/// Routing outcome, recorded for observability.
#[derive(Clone, Debug, Serialize)]
pub struct RoutingDecision {
    pub category: QueryCategory,
    pub model: String,
    pub instance: String,
    pub fallback_applied: bool,
    #[serde(skip)]
    pub picked: Arc<ModelInstance>,
}

pub struct ModelRouter {
    registry: Arc<InstanceRegistry>,
    roles: ModelRolesConfig,
}

impl ModelRouter {
    pub fn new(registry: Arc<InstanceRegistry>, roles: ModelRolesConfig) -> Self {
        Self { registry, roles }
    }

    /// Classification is pure pattern matching; first match wins and it
    /// never fails.
    pub fn classify(query: &str) -> QueryCategory {
        let query_lower = query.to_lowercase();

        if query.contains("```") {
            debug!("detected code category: fenced block");
            return QueryCategory::Code;
        }

        for pattern in CODE_PATTERNS {
            if query_lower.contains(pattern) {
                debug!("detected code category: matched '{}'", pattern);
                return QueryCategory::Code;
            }
        }

        let has_digit = query_lower.chars().any(|c| c.is_ascii_digit());
        if has_digit {
            let keyword = MATH_PATTERNS.iter().any(|p| query_lower.contains(p));
            if keyword || NUMERIC_COMPARATOR.is_match(&query_lower) {
                debug!("detected math category");
                return QueryCategory::Math;
            }
        }

        for pattern in CREATIVE_PATTERNS {
            if query_lower.contains(pattern) {
                debug!("detected creative category: matched '{}'", pattern);
                return QueryCategory::Creative;
            }
        }

        for pattern in TECHNICAL_PATTERNS {
            if query_lower.contains(pattern) {
                debug!("detected technical category: matched '{}'", pattern);
                return QueryCategory::Technical;
            }
        }

        debug!("defaulting to chat category");
        QueryCategory::Chat
    }

    pub fn model_for(&self, category: QueryCategory) -> &str {
        match category {
            QueryCategory::Code => &self.roles.code,
            QueryCategory::Math => &self.roles.math,
            QueryCategory::Creative => &self.roles.creative,
            QueryCategory::Technical => &self.roles.technical,
            QueryCategory::Chat => &self.roles.chat,
        }
    }

    pub fn generation_models(&self) -> Vec<String> {
        self.roles.generation_models()
    }

    /// Choose (model, instance) for a query. Repeated calls have no side
    /// effects beyond the round-robin cursor.
    ///
    /// Fallback chain: preferred model -> general chat model -> any
    /// healthy instance carrying any generation-capable model.
    pub async fn route(
        &self,
        query: &str,
        model_override: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<RoutingDecision, ApiError> {
        let category = Self::classify(query);

        let preferred = model_override
            .map(|m| m.to_string())
            .unwrap_or_else(|| self.model_for(category).to_string());

        let strategy = if conversation_id.is_some() {
            SelectionStrategy::StickyByConversation
        } else {
            SelectionStrategy::LeastLatency
        };

        if let Some(instance) = self.registry.try_pick(&preferred, strategy, conversation_id) {
            return Ok(RoutingDecision {
                category,
                model: preferred,
                instance: instance.name.clone(),
                fallback_applied: false,
                picked: instance,
            });
        }

        // Preferred model has no instance right now; degrade through the chain
        warn!(model = %preferred, "no instance for preferred model, applying fallback chain");

        if preferred != self.roles.chat {
            if let Some(instance) =
                self.registry
                    .try_pick(&self.roles.chat, strategy, conversation_id)
            {
                return Ok(RoutingDecision {
                    category,
                    model: self.roles.chat.clone(),
                    instance: instance.name.clone(),
                    fallback_applied: true,
                    picked: instance,
                });
            }
        }

        for model in self.generation_models() {
            if model == preferred || model == self.roles.chat {
                continue;
            }
            if let Some(instance) = self.registry.try_pick(&model, strategy, conversation_id) {
                return Ok(RoutingDecision {
                    category,
                    model,
                    instance: instance.name.clone(),
                    fallback_applied: true,
                    picked: instance,
                });
            }
        }

        // Last resort: wait out the pick window on the preferred model
        let instance = self
            .registry
            .pick(&preferred, strategy, conversation_id)
            .await?;
        Ok(RoutingDecision {
            category,
            model: preferred,
            instance: instance.name.clone(),
            fallback_applied: false,
            picked: instance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelInstance;

    #[test]
    fn test_code_category() {
        assert_eq!(
            ModelRouter::classify("How do I debug this function?"),
            QueryCategory::Code
        );
        assert_eq!(
            ModelRouter::classify("```\nfn main() {}\n```"),
            QueryCategory::Code
        );
        assert_eq!(
            ModelRouter::classify("What does the REST API expect?"),
            QueryCategory::Code
        );
    }

    #[test]
    fn test_math_category() {
        assert_eq!(
            ModelRouter::classify("Solve 3x + 5 = 20"),
            QueryCategory::Math
        );
        assert_eq!(
            ModelRouter::classify("calculate 15% of 2400"),
            QueryCategory::Math
        );
        // Digit without math keyword or comparator is not math
        assert_eq!(
            ModelRouter::classify("Tell me about RNI 4.16"),
            QueryCategory::Chat
        );
    }

    #[test]
    fn test_creative_category() {
        assert_eq!(
            ModelRouter::classify("Write a poem about routers"),
            QueryCategory::Creative
        );
        assert_eq!(
            ModelRouter::classify("brainstorm some team names"),
            QueryCategory::Creative
        );
    }

    #[test]
    fn test_technical_category() {
        assert_eq!(
            ModelRouter::classify("How do I troubleshoot the LDAP setup?"),
            QueryCategory::Technical
        );
        assert_eq!(
            ModelRouter::classify("Which protocol does the meter use?"),
            QueryCategory::Technical
        );
    }

    #[test]
    fn test_chat_fallthrough() {
        assert_eq!(ModelRouter::classify("hello there"), QueryCategory::Chat);
    }

    #[test]
    fn test_first_match_wins() {
        // "write" (creative) and "function" (code): code is checked first
        assert_eq!(
            ModelRouter::classify("write a function"),
            QueryCategory::Code
        );
    }

    fn router_with_healthy(models_per_instance: &[(&str, &[&str])]) -> ModelRouter {
        let registry = Arc::new(InstanceRegistry::new(3, 50));
        for (name, models) in models_per_instance {
            let instance = ModelInstance::new(
                name.to_string(),
                format!("http://{}:11434", name),
                models.iter().map(|m| m.to_string()).collect(),
            );
            instance.record_outcome(None, None, true, 3);
            registry.register(instance);
        }
        ModelRouter::new(registry, ModelRolesConfig::default())
    }

    #[tokio::test]
    async fn test_route_prefers_specialized_model() {
        let router = router_with_healthy(&[
            ("coder", &["qwen2.5-coder:7b"]),
            ("general", &["llama3.1:8b"]),
        ]);

        let decision = router
            .route("debug this function", None, None)
            .await
            .unwrap();
        assert_eq!(decision.category, QueryCategory::Code);
        assert_eq!(decision.model, "qwen2.5-coder:7b");
        assert_eq!(decision.instance, "coder");
        assert!(!decision.fallback_applied);
    }

    #[tokio::test]
    async fn test_route_falls_back_to_chat_model() {
        // No instance carries the code model
        let router = router_with_healthy(&[("general", &["llama3.1:8b"])]);

        let decision = router
            .route("debug this function", None, None)
            .await
            .unwrap();
        assert_eq!(decision.model, "llama3.1:8b");
        assert!(decision.fallback_applied);
    }

    #[tokio::test]
    async fn test_route_honors_override() {
        let router = router_with_healthy(&[("general", &["llama3.1:8b"])]);

        let decision = router
            .route("debug this function", Some("llama3.1:8b"), None)
            .await
            .unwrap();
        assert_eq!(decision.model, "llama3.1:8b");
        assert!(!decision.fallback_applied);
    }

    #[tokio::test]
    async fn test_route_fails_without_any_instance() {
        let router = router_with_healthy(&[]);
        let err = router.route("hello", None, None).await.unwrap_err();
        assert!(matches!(err, ApiError::NoAvailableInstance(_)));
    }
}
