//! Shared types for the ConvoFlow engine.
//!
//! Holds the immutable catalog data model (flows, steps, tools, response
//! mappings), the host boundary types (context entries, engine config,
//! message registry), and the workspace-wide error enum. All execution
//! logic lives in the sibling crates.

pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod mapping;
pub mod messages;
pub mod tool;
pub mod trace;

pub use config::EngineConfig;
pub use context::{ContextEntry, Role};
pub use error::{Error, Result};
pub use flow::{
    AppendMode, CallType, FlowDefinition, FlowParameter, IntentStrength, OnFail, Step,
    SwitchBranch, VarScope,
};
pub use mapping::{
    ConditionalArm, Filter, FilterOperator, JsonPathSpec, MappingValue, ResponseMapping,
    Transform, TransformOp,
};
pub use messages::MessageRegistry;
pub use tool::{ContentType, HttpToolConfig, RetryPolicy, ToolAuth, ToolDefinition, ToolImplementation};
pub use trace::TraceEvent;
