//! The tool invoker: carries a `CALL-TOOL` step end to end and reports a
//! transaction event for every attempt, success or not.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use cf_domain::config::EngineConfig;
use cf_domain::{Error, Result, ToolDefinition, ToolImplementation, TraceEvent};
use cf_mapping::apply_mapping;
use cf_script::{FunctionRegistry, Scope};
use cf_sessions::TransactionEvent;

use crate::http::{resolve_value, HttpDispatcher};
use crate::ratelimit::RateLimiter;
use crate::registry::ToolCatalog;
use crate::schema::validate_arguments;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the step evaluator needs back from one invocation: the
/// outcome to bind (or route to `onFail`) and the transaction event to
/// append.
pub struct ToolInvocation {
    pub outcome: Result<Value>,
    pub event: TransactionEvent,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invoker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolInvoker {
    catalog: ToolCatalog,
    functions: FunctionRegistry,
    limiter: RateLimiter,
    http: HttpDispatcher,
}

impl ToolInvoker {
    pub fn new(
        catalog: ToolCatalog,
        functions: FunctionRegistry,
        config: &EngineConfig,
    ) -> Result<Self> {
        Ok(Self {
            catalog,
            functions,
            limiter: RateLimiter::new(config.rate_limit),
            http: HttpDispatcher::new(config.http.clone())?,
        })
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Run the invocation pipeline:
    /// 1. argument assembly, 2. schema check, 3. rate limit, 4. dispatch,
    /// 5. response mapping. The returned event covers phase 6.
    pub async fn invoke(
        &self,
        session_id: &str,
        tool_name: &str,
        raw_arguments: &HashMap<String, Value>,
        caller_scope: &Scope<'_>,
        cancel: Option<&CancellationToken>,
    ) -> ToolInvocation {
        let started = Instant::now();
        let mut signature = format!("tool {tool_name}");
        let mut attempts = 0;

        let outcome = async {
            let tool = self.catalog.get(tool_name)?;

            // Phase 1: resolve argument templates in the caller's scope.
            let mut args = Map::new();
            for (name, value) in raw_arguments {
                args.insert(
                    name.clone(),
                    resolve_value(value, caller_scope, &self.functions)?,
                );
            }

            // Phase 2: structural schema check.
            validate_arguments(&tool.parameters_schema, &args)?;

            // Phase 3: rate limit per (session, tool).
            if !self.limiter.try_acquire(session_id, tool_name) {
                TraceEvent::RateLimited {
                    session_id: session_id.to_owned(),
                    tool_name: tool_name.to_owned(),
                }
                .emit();
                return Err(Error::Internal(format!(
                    "rate limit exceeded for tool '{tool_name}'"
                )));
            }

            // Phase 4: dispatch.
            let args_value = Value::Object(args);
            let scope = caller_scope.clone().with_args(&args_value);
            let (raw, mapping) = match &tool.implementation {
                ToolImplementation::Function { name } => {
                    signature = format!("function {name}");
                    attempts = 1;
                    let f = self
                        .functions
                        .get(name)
                        .ok_or_else(|| Error::ToolNotFound(format!("approved function '{name}'")))?;
                    (f(&[args_value.clone()])?, None)
                }
                ToolImplementation::Http(http_cfg) => {
                    let (result, info) =
                        self.http.dispatch(http_cfg, &scope, &self.functions, cancel).await;
                    signature = info.signature;
                    attempts = info.attempts;
                    (result?, http_cfg.response_mapping.as_ref())
                }
            };

            // Phase 5: response mapping replaces the raw response.
            match mapping {
                Some(mapping) => {
                    apply_mapping(mapping, &raw, Some(&args_value), &self.functions)
                }
                None => Ok(raw),
            }
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let status = match &outcome {
            Ok(_) => "ok".to_owned(),
            Err(e) => format!("error: {}", e.kind()),
        };

        TraceEvent::ToolCallCompleted {
            tool_name: tool_name.to_owned(),
            status: status.clone(),
            duration_ms: latency_ms,
            attempts,
        }
        .emit();

        ToolInvocation {
            outcome,
            event: TransactionEvent {
                tool_name: tool_name.to_owned(),
                signature,
                status,
                latency_ms,
                attempts,
                timestamp: Utc::now(),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn function_tool(name: &str, schema: Value) -> ToolDefinition {
        serde_json::from_value(json!({
            "name": name,
            "parametersSchema": schema,
            "implementation": {"type": "function", "name": name}
        }))
        .unwrap()
    }

    fn invoker_with(tools: Vec<ToolDefinition>, functions: FunctionRegistry) -> ToolInvoker {
        ToolInvoker::new(ToolCatalog::new(tools), functions, &EngineConfig::default()).unwrap()
    }

    fn raw_args(value: Value) -> HashMap<String, Value> {
        value
            .as_object()
            .cloned()
            .unwrap()
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn function_tool_receives_resolved_arguments() {
        let mut functions = FunctionRegistry::default();
        functions.register("echo", |args| Ok(args[0].clone()));

        let invoker = invoker_with(vec![function_tool("echo", json!(null))], functions);

        let vars: Map<String, Value> = json!({"city": "Lyon"}).as_object().cloned().unwrap();
        let scope = Scope::new(Some(&vars), None);
        let result = invoker
            .invoke(
                "s1",
                "echo",
                &raw_args(json!({"q": "weather in {{city}}", "n": 2})),
                &scope,
                None,
            )
            .await;

        assert_eq!(
            result.outcome.unwrap(),
            json!({"q": "weather in Lyon", "n": 2})
        );
        assert_eq!(result.event.status, "ok");
        assert_eq!(result.event.signature, "function echo");
        assert_eq!(result.event.attempts, 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_hard_error() {
        let invoker = invoker_with(vec![], FunctionRegistry::default());
        let scope = Scope::default();
        let result = invoker
            .invoke("s1", "ghost", &HashMap::new(), &scope, None)
            .await;
        assert!(matches!(result.outcome, Err(Error::ToolNotFound(_))));
        assert!(result.event.status.contains("toolNotFound"));
    }

    #[tokio::test]
    async fn schema_violation_reported_before_dispatch() {
        let mut functions = FunctionRegistry::default();
        functions.register("strict", |_| Ok(Value::Null));
        let invoker = invoker_with(
            vec![function_tool(
                "strict",
                json!({"required": ["id"], "properties": {"id": {"type": "string"}}}),
            )],
            functions,
        );

        let scope = Scope::default();
        let result = invoker
            .invoke("s1", "strict", &HashMap::new(), &scope, None)
            .await;
        assert!(matches!(result.outcome, Err(Error::SchemaValidation(_))));
    }

    #[tokio::test]
    async fn rate_limit_denies_after_burst() {
        let mut functions = FunctionRegistry::default();
        functions.register("ping", |_| Ok(json!("pong")));

        let mut config = EngineConfig::default();
        config.rate_limit.capacity = 2;
        config.rate_limit.refill_per_sec = 0.0;
        let invoker = ToolInvoker::new(
            ToolCatalog::new(vec![function_tool("ping", json!(null))]),
            functions,
            &config,
        )
        .unwrap();

        let scope = Scope::default();
        for _ in 0..2 {
            let ok = invoker
                .invoke("s1", "ping", &HashMap::new(), &scope, None)
                .await;
            assert!(ok.outcome.is_ok());
        }
        let denied = invoker
            .invoke("s1", "ping", &HashMap::new(), &scope, None)
            .await;
        assert!(denied.outcome.is_err());

        // A different session still has a full bucket.
        let other = invoker
            .invoke("s2", "ping", &HashMap::new(), &scope, None)
            .await;
        assert!(other.outcome.is_ok());
    }

    #[tokio::test]
    async fn function_error_becomes_event_status() {
        let mut functions = FunctionRegistry::default();
        functions.register("boom", |_| Err(Error::Internal("nope".into())));
        let invoker = invoker_with(vec![function_tool("boom", json!(null))], functions);

        let scope = Scope::default();
        let result = invoker
            .invoke("s1", "boom", &HashMap::new(), &scope, None)
            .await;
        assert!(result.outcome.is_err());
        assert_eq!(result.event.status, "error: internal");
    }
}
