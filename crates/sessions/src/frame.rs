use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cf_domain::{CallType, ContextEntry, FlowDefinition, IntentStrength, Step};

use crate::transaction::Transaction;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Flow frame
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The runtime activation record of one flow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowFrame {
    pub flow_id: String,
    pub flow_name: String,
    pub flow_version: String,

    /// Remaining steps, stored reversed: the next step is the last
    /// element, so stepping is a pop.
    pub steps_remaining: Vec<Step>,

    /// Append-only record of inputs, outputs, and tool events.
    pub context_history: Vec<ContextEntry>,

    /// User inputs awaiting consumption by a `SAY-GET`.
    pub input_stack: Vec<String>,

    /// Frame-local variables, one flat namespace.
    pub variables: Map<String, Value>,

    pub transaction: Transaction,
    pub user_id: String,
    pub start_time: DateTime<Utc>,

    /// When set, the next user utterance binds to this variable.
    pub pending_variable: Option<String>,

    /// Validator expression for the pending `SAY-GET`, if it declared one.
    pub pending_validator: Option<String>,

    /// Accumulator for non-blocking `SAY` output.
    pub last_say_message: String,

    /// Rendered text of the last blocking prompt, re-emitted when the
    /// frame is resumed after an interruption.
    pub last_prompt: Option<String>,

    /// Variable the last blocking prompt asked for. Survives input
    /// delivery so failed steps can re-ask the prior prompt.
    pub last_prompt_variable: Option<String>,

    /// Pending variable stashed while this frame's stack is suspended by
    /// an interruption; restored on resume.
    #[serde(default)]
    pub suspended_pending: Option<String>,

    /// A proposed flow switch awaiting user confirmation.
    pub pending_interruption: Option<PendingInterruption>,

    /// Where the parent frame wants this frame's `RETURN` value bound.
    pub result_variable: Option<String>,

    /// Snapshot of `category == "financial"` from the definition.
    pub financial: bool,
}

/// A candidate interruption waiting on a yes/no from the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInterruption {
    pub candidate_flow_id: String,
    pub strength: IntentStrength,
    pub call_type: CallType,
    /// Pending variable displaced by the confirmation prompt, restored
    /// when the user declines.
    #[serde(default)]
    pub resume_variable: Option<String>,
}

impl FlowFrame {
    pub fn new(flow: &FlowDefinition, user_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow.id.clone(),
            flow_name: flow.name.clone(),
            flow_version: flow.version.clone(),
            steps_remaining: flow.steps.iter().rev().cloned().collect(),
            context_history: Vec::new(),
            input_stack: Vec::new(),
            variables: Map::new(),
            transaction: Transaction::new(),
            user_id: user_id.into(),
            start_time: Utc::now(),
            pending_variable: None,
            pending_validator: None,
            last_say_message: String::new(),
            last_prompt: None,
            last_prompt_variable: None,
            suspended_pending: None,
            pending_interruption: None,
            result_variable: None,
            financial: flow.is_financial(),
        }
    }

    /// Take the next step to execute.
    pub fn next_step(&mut self) -> Option<Step> {
        self.steps_remaining.pop()
    }

    /// Schedule `steps` to run next, ahead of whatever else remains
    /// (used by `SWITCH` branches and `onFail` handlers).
    pub fn push_steps(&mut self, steps: &[Step]) {
        for step in steps.iter().rev() {
            self.steps_remaining.push(step.clone());
        }
    }

    /// Runnable means: nothing pending from the user and work left to do.
    pub fn is_runnable(&self) -> bool {
        self.pending_variable.is_none() && !self.steps_remaining.is_empty()
    }

    /// Whether the frame should stay alive: steps remain, or it is
    /// waiting on input.
    pub fn is_live(&self) -> bool {
        !self.steps_remaining.is_empty() || self.pending_variable.is_some()
    }

    pub fn record(&mut self, entry: ContextEntry) {
        self.context_history.push(entry);
    }

    /// Drain the SAY accumulator.
    pub fn take_say(&mut self) -> String {
        std::mem::take(&mut self.last_say_message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow_with_steps(steps: Value) -> FlowDefinition {
        serde_json::from_value(json!({
            "id": "f",
            "name": "F",
            "steps": steps
        }))
        .unwrap()
    }

    #[test]
    fn steps_pop_in_declaration_order() {
        let flow = flow_with_steps(json!([
            {"type": "SAY", "message": "one"},
            {"type": "SAY", "message": "two"}
        ]));
        let mut frame = FlowFrame::new(&flow, "u");
        match frame.next_step() {
            Some(Step::Say { message, .. }) => assert_eq!(message, "one"),
            other => panic!("unexpected step {other:?}"),
        }
        match frame.next_step() {
            Some(Step::Say { message, .. }) => assert_eq!(message, "two"),
            other => panic!("unexpected step {other:?}"),
        }
        assert!(frame.next_step().is_none());
    }

    #[test]
    fn pushed_steps_run_before_existing_ones() {
        let flow = flow_with_steps(json!([{"type": "SAY", "message": "later"}]));
        let mut frame = FlowFrame::new(&flow, "u");
        let branch: Vec<Step> = vec![
            serde_json::from_value(json!({"type": "SAY", "message": "first"})).unwrap(),
            serde_json::from_value(json!({"type": "SAY", "message": "second"})).unwrap(),
        ];
        frame.push_steps(&branch);

        let order: Vec<String> = std::iter::from_fn(|| frame.next_step())
            .map(|s| match s {
                Step::Say { message, .. } => message,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, ["first", "second", "later"]);
    }

    #[test]
    fn runnable_and_live_track_pending_input() {
        let flow = flow_with_steps(json!([{"type": "SAY", "message": "x"}]));
        let mut frame = FlowFrame::new(&flow, "u");
        assert!(frame.is_runnable());

        frame.pending_variable = Some("answer".into());
        assert!(!frame.is_runnable());
        assert!(frame.is_live());

        frame.pending_variable = None;
        frame.steps_remaining.clear();
        assert!(!frame.is_live());
    }
}
