use serde::Serialize;

/// Structured trace events emitted across all ConvoFlow crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    TurnStarted {
        session_id: String,
        role: String,
    },
    TurnFinished {
        session_id: String,
        steps_executed: u32,
        terminated: bool,
    },
    StepExecuted {
        flow_id: String,
        step_kind: String,
    },
    FlowStarted {
        flow_id: String,
        call_type: String,
        stack_index: usize,
    },
    FlowReturned {
        flow_id: String,
        had_value: bool,
    },
    FlowInterrupted {
        suspended_flow: String,
        interrupting_flow: String,
        new_stack_index: usize,
    },
    FlowResumed {
        flow_id: String,
        stack_index: usize,
    },
    SessionRebooted {
        session_id: String,
        discarded_stacks: usize,
    },
    ToolCallCompleted {
        tool_name: String,
        status: String,
        duration_ms: u64,
        attempts: u32,
    },
    RateLimited {
        session_id: String,
        tool_name: String,
    },
    TransactionRolledBack {
        transaction_id: String,
        flow_id: String,
    },
    IntentClassified {
        flow_id: Option<String>,
        strength: String,
        source: String,
    },
    CatalogValidated {
        flows: usize,
        tools: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "cf_event");
    }
}
