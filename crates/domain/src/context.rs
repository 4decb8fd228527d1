use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry at the host boundary: a user/assistant utterance, a system
/// event, or a tool record appended to a frame's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: Role,
    /// Plain text for utterances; structured payloads for tool events.
    pub content: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, rename = "stepId", skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, rename = "toolName", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

// ── Convenience constructors ───────────────────────────────────────

impl ContextEntry {
    pub fn user(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::User,
            content: Value::String(text.into()),
            timestamp,
            step_id: None,
            tool_name: None,
            metadata: None,
        }
    }

    pub fn assistant(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::Assistant,
            content: Value::String(text.into()),
            timestamp,
            step_id: None,
            tool_name: None,
            metadata: None,
        }
    }

    pub fn system(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::System,
            content: Value::String(text.into()),
            timestamp,
            step_id: None,
            tool_name: None,
            metadata: None,
        }
    }

    pub fn tool(tool_name: impl Into<String>, content: Value, timestamp: i64) -> Self {
        Self {
            role: Role::Tool,
            content,
            timestamp,
            step_id: None,
            tool_name: Some(tool_name.into()),
            metadata: None,
        }
    }

    /// The plain-text content, when this entry is an utterance.
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_entry_round_trips() {
        let entry = ContextEntry::user("hello", 1_700_000_000_000);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        let back: ContextEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.text(), Some("hello"));
    }

    #[test]
    fn tool_entry_carries_structured_content() {
        let entry = ContextEntry::tool("lookup", serde_json::json!({"status": 200}), 0);
        assert_eq!(entry.role, Role::Tool);
        assert!(entry.text().is_none());
        assert_eq!(entry.tool_name.as_deref(), Some("lookup"));
    }
}
