//! The AI bridge seam and the intent-classifier prompt around it.
//!
//! The bridge is one function: given system instructions and a user
//! message, return a response. The engine uses it to classify utterances
//! against the flow menu; everything else about the model is the host's
//! business.

use async_trait::async_trait;
use serde::Deserialize;

use cf_domain::{CallType, FlowDefinition, IntentStrength, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Host-provided AI call. Implementations are adapters over whatever
/// model endpoint the host runs.
#[async_trait]
pub trait AiBridge: Send + Sync {
    async fn ai_fetch(&self, system_instructions: &str, user_message: &str) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A positive intent classification: which flow, how confidently, and
/// how it should be activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentMatch {
    pub flow_id: String,
    pub strength: IntentStrength,
    pub call_type: CallType,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt building & response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// System instructions asking the model to classify one utterance
/// against the flow menu and answer with a single JSON object.
pub(crate) fn classifier_instructions(flows: &[&FlowDefinition]) -> String {
    let menu: Vec<serde_json::Value> = flows
        .iter()
        .map(|flow| {
            serde_json::json!({
                "id": flow.id,
                "name": flow.name,
                "description": flow.description,
                "triggers": flow.triggers,
            })
        })
        .collect();

    format!(
        "You route user messages in a conversational assistant.\n\
         Given the user message, decide whether it asks to start one of the \
         available flows.\n\nAvailable flows:\n{}\n\n\
         Reply with exactly one JSON object, no prose:\n\
         {{\"flowId\": <flow id or null>, \
         \"strength\": \"weak\"|\"medium\"|\"strong\", \
         \"callType\": \"call\"|\"replace\"|\"reboot\"}}\n\
         Use null when the message is an answer to an ongoing question or \
         matches no flow. Use \"strong\" only for explicit requests.",
        serde_json::to_string_pretty(&menu).unwrap_or_default()
    )
}

#[derive(Deserialize)]
struct ClassifierVerdict {
    #[serde(rename = "flowId")]
    flow_id: Option<String>,
    strength: Option<String>,
    #[serde(rename = "callType")]
    call_type: Option<String>,
}

/// Parse a classifier reply. Tolerates code fences and surrounding prose
/// by extracting the first `{…}` block. `None` means "no flow" — either
/// an explicit null verdict or an unusable reply.
pub(crate) fn parse_classifier_response(text: &str) -> Option<IntentMatch> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let verdict: ClassifierVerdict = serde_json::from_str(&text[start..=end]).ok()?;
    let flow_id = verdict.flow_id?;
    if flow_id.is_empty() || flow_id == "null" {
        return None;
    }

    let strength = match verdict.strength.as_deref() {
        Some("weak") => IntentStrength::Weak,
        Some("strong") => IntentStrength::Strong,
        _ => IntentStrength::Medium,
    };
    let call_type = match verdict.call_type.as_deref() {
        Some("replace") => CallType::Replace,
        Some("reboot") => CallType::Reboot,
        _ => CallType::Call,
    };

    Some(IntentMatch {
        flow_id,
        strength,
        call_type,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_verdict() {
        let m = parse_classifier_response(
            r#"{"flowId": "track-order", "strength": "strong", "callType": "call"}"#,
        )
        .unwrap();
        assert_eq!(m.flow_id, "track-order");
        assert_eq!(m.strength, IntentStrength::Strong);
        assert_eq!(m.call_type, CallType::Call);
    }

    #[test]
    fn tolerates_fences_and_prose() {
        let m = parse_classifier_response(
            "Sure. ```json\n{\"flowId\": \"greet\", \"strength\": \"weak\"}\n```",
        )
        .unwrap();
        assert_eq!(m.flow_id, "greet");
        assert_eq!(m.strength, IntentStrength::Weak);
        // Missing callType defaults to call.
        assert_eq!(m.call_type, CallType::Call);
    }

    #[test]
    fn null_flow_is_no_match() {
        assert!(parse_classifier_response(r#"{"flowId": null}"#).is_none());
        assert!(parse_classifier_response("no json at all").is_none());
        assert!(parse_classifier_response(r#"{"strength": "strong"}"#).is_none());
    }

    #[test]
    fn instructions_list_the_menu() {
        let flow: FlowDefinition = serde_json::from_value(serde_json::json!({
            "id": "track-order",
            "name": "Track order",
            "description": "Track a shipment",
            "steps": [],
            "triggers": ["track order"]
        }))
        .unwrap();
        let instructions = classifier_instructions(&[&flow]);
        assert!(instructions.contains("track-order"));
        assert!(instructions.contains("flowId"));
        assert!(instructions.contains("track order"));
    }
}
