use chrono::{DateTime, Utc};
use serde::Serialize;

/// Endpoint that produced the log entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Chat,
    Search,
    Classify,
}

impl Endpoint {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::Search => "search",
            Self::Classify => "classify",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Error,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One per-request access-log record with its pipeline metrics.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub endpoint: Endpoint,
    pub status: RequestStatus,

    // Pipeline outcome
    pub category: Option<String>,
    pub route: Option<String>,
    pub model: Option<String>,
    pub instance: Option<String>,
    pub cache_hit: bool,
    pub confidence: Option<f32>,
    pub error_kind: Option<String>,

    // Stage latencies
    pub classify_ms: Option<i32>,
    pub embed_ms: Option<i32>,
    pub retrieve_ms: Option<i32>,
    pub rerank_ms: Option<i32>,
    pub synthesize_ms: Option<i32>,
    pub total_ms: i32,

    pub query_chars: i32,
    pub created_at: DateTime<Utc>,
}

impl RequestLog {
    pub fn builder(request_id: impl Into<String>, endpoint: Endpoint) -> RequestLogBuilder {
        RequestLogBuilder::new(request_id.into(), endpoint)
    }
}

pub struct RequestLogBuilder {
    log: RequestLog,
}

impl RequestLogBuilder {
    pub fn new(request_id: String, endpoint: Endpoint) -> Self {
        Self {
            log: RequestLog {
                request_id,
                conversation_id: None,
                endpoint,
                status: RequestStatus::Success,
                category: None,
                route: None,
                model: None,
                instance: None,
                cache_hit: false,
                confidence: None,
                error_kind: None,
                classify_ms: None,
                embed_ms: None,
                retrieve_ms: None,
                rerank_ms: None,
                synthesize_ms: None,
                total_ms: 0,
                query_chars: 0,
                created_at: Utc::now(),
            },
        }
    }

    pub fn conversation_id(mut self, id: Option<String>) -> Self {
        self.log.conversation_id = id;
        self
    }

    pub fn status(mut self, status: RequestStatus) -> Self {
        self.log.status = status;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.log.category = Some(category.into());
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.log.route = Some(route.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.log.model = Some(model.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.log.instance = Some(instance.into());
        self
    }

    pub fn cache_hit(mut self, hit: bool) -> Self {
        self.log.cache_hit = hit;
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.log.confidence = Some(confidence);
        self
    }

    pub fn error(mut self, kind: impl Into<String>) -> Self {
        self.log.error_kind = Some(kind.into());
        self.log.status = RequestStatus::Error;
        self
    }

    pub fn timings(
        mut self,
        classify_ms: u64,
        embed_ms: u64,
        retrieve_ms: u64,
        rerank_ms: u64,
        synthesize_ms: u64,
        total_ms: u64,
    ) -> Self {
        self.log.classify_ms = Some(classify_ms as i32);
        self.log.embed_ms = Some(embed_ms as i32);
        self.log.retrieve_ms = Some(retrieve_ms as i32);
        self.log.rerank_ms = Some(rerank_ms as i32);
        self.log.synthesize_ms = Some(synthesize_ms as i32);
        self.log.total_ms = total_ms as i32;
        self
    }

    pub fn total_ms(mut self, total_ms: u64) -> Self {
        self.log.total_ms = total_ms as i32;
        self
    }

    pub fn query_chars(mut self, chars: usize) -> Self {
        self.log.query_chars = chars as i32;
        self
    }

    pub fn build(self) -> RequestLog {
        self.log
    }
}
