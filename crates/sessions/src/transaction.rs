use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-frame transaction: a log of tool activity plus a terminal state
/// set when the frame finishes or is aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub state: TransactionState,
    pub events: Vec<TransactionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionState {
    Pending,
    Committed,
    RolledBack,
}

/// One tool invocation as recorded in the transaction log. The request
/// signature never includes auth material or bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub tool_name: String,
    /// e.g. `"GET https://api.example.com/items/42"` or `"function lookup"`.
    pub signature: String,
    /// `"ok"` or `"error: <kind>"`.
    pub status: String,
    pub latency_ms: u64,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: TransactionState::Pending,
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, event: TransactionEvent) {
        self.events.push(event);
    }

    pub fn commit(&mut self) {
        if self.state == TransactionState::Pending {
            self.state = TransactionState::Committed;
        }
    }

    pub fn rollback(&mut self) {
        self.state = TransactionState::RolledBack;
    }

    pub fn is_terminal(&self) -> bool {
        self.state != TransactionState::Pending
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}
