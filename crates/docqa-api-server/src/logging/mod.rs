pub mod logger;
pub mod types;

pub use logger::RequestLogger;
pub use types::{Endpoint, RequestLog, RequestStatus};
