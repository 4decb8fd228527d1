use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Flow definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An immutable, versioned flow definition loaded from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "d_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<FlowParameter>,
    pub steps: Vec<Step>,
    /// Literal phrases (or `/regex/` patterns) that start this flow.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Flows tagged `"financial"` get transactional error handling and
    /// interruption confirmation.
    #[serde(default)]
    pub category: Option<String>,
}

impl FlowDefinition {
    pub fn is_financial(&self) -> bool {
        self.category.as_deref() == Some("financial")
    }
}

fn d_version() -> String {
    "1.0".into()
}

/// A declared flow parameter. Missing arguments fall back to `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowParameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The atomic unit of flow execution, tagged by `type` in the catalog JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Step {
    /// Render a message and append it to the turn's output accumulator.
    /// Never blocks.
    #[serde(rename = "SAY")]
    Say {
        message: String,
        #[serde(default, rename = "appendMode")]
        append_mode: AppendMode,
    },

    /// Render a prompt, flush the accumulator, and suspend until the next
    /// user utterance, which binds to `variable`.
    #[serde(rename = "SAY-GET")]
    SayGet {
        message: String,
        variable: String,
        /// Optional expression evaluated with the freshly bound variable in
        /// scope; a falsy result re-asks the prompt.
        #[serde(default)]
        validator: Option<String>,
    },

    /// Write a value into the current frame (or session globals).
    #[serde(rename = "SET")]
    Set {
        variable: String,
        /// Literal value; strings may contain `{{…}}` templates.
        #[serde(default)]
        value: Option<Value>,
        /// Expression evaluated in the current scope. Takes precedence
        /// over `value` when both are present.
        #[serde(default)]
        expression: Option<String>,
        #[serde(default)]
        scope: VarScope,
    },

    /// Invoke a tool and bind the (mapped) result.
    #[serde(rename = "CALL-TOOL")]
    CallTool {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        arguments: HashMap<String, Value>,
        #[serde(rename = "resultVariable")]
        result_variable: String,
        #[serde(default, rename = "onFail")]
        on_fail: Option<OnFail>,
    },

    /// Activate another flow.
    #[serde(rename = "FLOW")]
    Flow {
        #[serde(rename = "flowId")]
        flow_id: String,
        #[serde(default, rename = "callType")]
        call_type: CallType,
        #[serde(default)]
        arguments: HashMap<String, Value>,
        #[serde(default, rename = "resultVariable")]
        result_variable: Option<String>,
    },

    /// Evaluate an expression and run the first matching branch.
    #[serde(rename = "SWITCH")]
    Switch {
        expression: String,
        branches: Vec<SwitchBranch>,
        #[serde(default)]
        default: Option<Vec<Step>>,
    },

    /// Pop the current frame, optionally handing a value to the parent.
    #[serde(rename = "RETURN")]
    Return {
        #[serde(default)]
        value: Option<Value>,
    },
}

impl Step {
    /// Catalog-facing tag of this step, for logs and validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Say { .. } => "SAY",
            Step::SayGet { .. } => "SAY-GET",
            Step::Set { .. } => "SET",
            Step::CallTool { .. } => "CALL-TOOL",
            Step::Flow { .. } => "FLOW",
            Step::Switch { .. } => "SWITCH",
            Step::Return { .. } => "RETURN",
        }
    }
}

/// How a `SAY` interacts with the output accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppendMode {
    #[default]
    Append,
    Replace,
}

/// Where a `SET` writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarScope {
    #[default]
    Frame,
    Global,
}

/// How a child flow is activated relative to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Push a child frame on the current stack; the caller resumes on return.
    #[default]
    Call,
    /// Pop the caller, then push the child on the same stack.
    Replace,
    /// Discard every stack in the session and start fresh.
    Reboot,
}

/// Recovery steps run when a step fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnFail {
    pub steps: Vec<Step>,
}

/// The arbiter's confidence that an utterance should switch flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStrength {
    Weak,
    Medium,
    Strong,
}

/// One arm of a `SWITCH`. Exactly one of `match_value` / `condition`
/// should be present; `match_value` compares by strict equality,
/// `condition` is an expression evaluated as a boolean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchBranch {
    #[serde(default, rename = "match")]
    pub match_value: Option<Value>,
    #[serde(default)]
    pub condition: Option<String>,
    pub steps: Vec<Step>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
