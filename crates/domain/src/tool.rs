use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::mapping::ResponseMapping;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An externally-implemented operation callable from `CALL-TOOL` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema-shaped description of the tool's arguments.
    #[serde(rename = "parametersSchema", alias = "parameters", default)]
    pub parameters_schema: Value,
    pub implementation: ToolImplementation,
}

/// How the tool is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolImplementation {
    /// Look up `name` in the host's approved-functions registry.
    Function { name: String },
    /// Call an HTTP endpoint.
    Http(HttpToolConfig),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP tool configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    /// Endpoint URL; `{name}` placeholders are substituted from
    /// `path_params` with percent-encoding.
    pub url: String,
    #[serde(default = "d_method")]
    pub method: String,
    #[serde(default, rename = "contentType")]
    pub content_type: ContentType,
    /// name → argument expression/template producing the path value.
    #[serde(default, rename = "pathParams")]
    pub path_params: HashMap<String, String>,
    #[serde(default, rename = "queryParams")]
    pub query_params: HashMap<String, String>,
    /// Body shape; strings inside are rendered as templates.
    #[serde(default, rename = "bodyTemplate")]
    pub body_template: Option<Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<ToolAuth>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default, rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(default, rename = "responseMapping")]
    pub response_mapping: Option<ResponseMapping>,
}

fn d_method() -> String {
    "GET".into()
}

impl HttpToolConfig {
    /// Whether the method is idempotent (safe to follow redirects for).
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method.to_ascii_uppercase().as_str(),
            "GET" | "HEAD" | "OPTIONS" | "PUT" | "DELETE"
        )
    }
}

/// Request body / response parse format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/x-www-form-urlencoded")]
    Form,
    #[serde(rename = "multipart/form-data")]
    Multipart,
    #[serde(rename = "text/plain")]
    Text,
    #[serde(rename = "application/xml")]
    Xml,
}

/// Authentication attached to an HTTP tool request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolAuth {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        value: String,
    },
    /// HMAC-SHA256 over `METHOD\nURL\nBODY`, hex-encoded into `header`.
    Hmac {
        secret: String,
        #[serde(default = "d_signature_header")]
        header: String,
    },
}

fn d_signature_header() -> String {
    "X-Signature".into()
}

/// Retry policy for transient HTTP failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "d_retry_max")]
    pub max: u32,
    #[serde(default = "d_base_delay_ms", rename = "baseDelayMs")]
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: d_retry_max(),
            base_delay_ms: d_base_delay_ms(),
        }
    }
}

fn d_retry_max() -> u32 {
    2
}

fn d_base_delay_ms() -> u64 {
    250
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_implementation_parses() {
        let json = serde_json::json!({
            "name": "lookup_user",
            "description": "Find a user",
            "parametersSchema": { "type": "object" },
            "implementation": { "type": "function", "name": "lookup_user" }
        });
        let tool: ToolDefinition = serde_json::from_value(json).unwrap();
        assert!(matches!(
            tool.implementation,
            ToolImplementation::Function { ref name } if name == "lookup_user"
        ));
    }

    #[test]
    fn http_implementation_defaults() {
        let json = serde_json::json!({
            "name": "lookup",
            "implementation": {
                "type": "http",
                "url": "https://api.example.com/items/{id}"
            }
        });
        let tool: ToolDefinition = serde_json::from_value(json).unwrap();
        match tool.implementation {
            ToolImplementation::Http(cfg) => {
                assert_eq!(cfg.method, "GET");
                assert_eq!(cfg.content_type, ContentType::Json);
                assert!(cfg.is_idempotent());
                assert!(cfg.response_mapping.is_none());
            }
            _ => panic!("expected http implementation"),
        }
    }

    #[test]
    fn post_is_not_idempotent() {
        let cfg = HttpToolConfig {
            url: "https://api.example.com/orders".into(),
            method: "POST".into(),
            content_type: ContentType::Json,
            path_params: HashMap::new(),
            query_params: HashMap::new(),
            body_template: None,
            headers: HashMap::new(),
            auth: None,
            retry: None,
            timeout_ms: None,
            response_mapping: None,
        };
        assert!(!cfg.is_idempotent());
    }

    #[test]
    fn hmac_auth_defaults_signature_header() {
        let auth: ToolAuth =
            serde_json::from_value(serde_json::json!({ "type": "hmac", "secret": "s3cr3t" }))
                .unwrap();
        match auth {
            ToolAuth::Hmac { header, .. } => assert_eq!(header, "X-Signature"),
            _ => panic!("expected hmac"),
        }
    }
}
