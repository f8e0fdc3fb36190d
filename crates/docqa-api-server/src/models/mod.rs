pub mod candidate;
pub mod chat;

pub use candidate::{Candidate, CandidateFilters, ContentType};
pub use chat::{
    Answer, ChatEvent, ChatRequest, ErrorEvent, MetaEvent, Provenance, RetrievalMode, RouteTag,
    StageTimings, TokenEventPayload,
};
