//! Session state for ConvoFlow.
//!
//! A session is a stack of stacks of flow frames: each interruption opens
//! a new stack, each `FLOW` call pushes a frame on the active stack.
//! Sessions are plain serializable data owned by the host between turns;
//! the engine mutates them only inside `update_activity`.

pub mod frame;
pub mod session;
pub mod transaction;

pub use frame::{FlowFrame, PendingInterruption};
pub use session::Session;
pub use transaction::{Transaction, TransactionEvent, TransactionState};
