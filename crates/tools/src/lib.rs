//! Tool invocation for ConvoFlow.
//!
//! Carries a `CALL-TOOL` step through its six phases: argument assembly,
//! schema checking, rate limiting, dispatch (approved function or HTTP),
//! response mapping, and transaction-event recording.

pub mod http;
pub mod invoker;
pub mod ratelimit;
pub mod registry;
pub mod schema;

pub use http::HttpDispatcher;
pub use invoker::{ToolInvocation, ToolInvoker};
pub use ratelimit::RateLimiter;
pub use registry::ToolCatalog;
pub use schema::validate_arguments;
