//! The ConvoFlow engine: step evaluation, the stack-of-stacks flow
//! scheduler, the intent arbiter, and the host-facing facade.
//!
//! Hosts construct one [`Engine`] per catalog (immutable afterwards),
//! create a [`cf_sessions::Session`] per end-user, and feed every
//! utterance through [`Engine::update_activity`].

mod arbiter;
mod bridge;
mod engine;
mod scheduler;
mod steps;
mod validate;

pub use bridge::AiBridge;
pub use engine::{Engine, EngineBuilder, TurnOutcome};

pub use cf_domain::{
    ContextEntry, EngineConfig, Error, FlowDefinition, MessageRegistry, Result, Role,
    ToolDefinition,
};
pub use cf_script::FunctionRegistry;
pub use cf_sessions::{Session, TransactionEvent};
