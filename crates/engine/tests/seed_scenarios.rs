//! End-to-end turns over small catalogs: the linear flow, interruption
//! and resume, HTTP tools with response mapping, sandbox rejection, and
//! the financial interruption protections.

use cf_engine::{ContextEntry, Engine, Error, FunctionRegistry, Session};
use serde_json::{json, Value};

fn flows(spec: Value) -> Vec<cf_engine::FlowDefinition> {
    serde_json::from_value(spec).unwrap()
}

fn tools(spec: Value) -> Vec<cf_engine::ToolDefinition> {
    serde_json::from_value(spec).unwrap()
}

fn user(text: &str) -> ContextEntry {
    ContextEntry::user(text, 1_700_000_000_000)
}

async fn turn(engine: &Engine, session: &mut Session, text: &str) -> cf_engine::TurnOutcome {
    engine.update_activity(&user(text), session).await.unwrap()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Linear flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn linear_flow_runs_to_termination() {
    let engine = Engine::builder(
        flows(json!([{
            "id": "greet",
            "name": "Greet",
            "triggers": ["greet"],
            "steps": [
                {"type": "SAY", "message": "Hi, {{name}}"},
                {"type": "SAY-GET", "message": "How old?", "variable": "age"},
                {"type": "SET", "variable": "older", "expression": "age >= 18"},
                {"type": "SAY", "message": "{{older ? 'adult' : 'minor'}}"}
            ]
        }])),
        vec![],
    )
    .build()
    .unwrap();

    let mut session = engine.init_session("u1", "s1");

    let first = turn(&engine, &mut session, "greet").await;
    assert_eq!(first.output, "Hi, \nHow old?");
    assert_eq!(first.pending_variable.as_deref(), Some("age"));
    assert!(!first.terminated);

    let second = turn(&engine, &mut session, "17").await;
    assert_eq!(second.output, "minor");
    assert!(second.terminated);
    assert!(session.is_idle());
}

#[tokio::test]
async fn adult_branch_of_linear_flow() {
    let engine = Engine::builder(
        flows(json!([{
            "id": "greet",
            "name": "Greet",
            "triggers": ["greet"],
            "steps": [
                {"type": "SAY-GET", "message": "How old?", "variable": "age"},
                {"type": "SAY", "message": "{{age >= 18 ? 'adult' : 'minor'}}"}
            ]
        }])),
        vec![],
    )
    .build()
    .unwrap();

    let mut session = engine.init_session("u1", "s1");
    turn(&engine, &mut session, "greet").await;
    let reply = turn(&engine, &mut session, "44").await;
    assert_eq!(reply.output, "adult");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interruption and resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn order_catalog() -> Vec<cf_engine::FlowDefinition> {
    flows(json!([
        {
            "id": "order",
            "name": "Order",
            "triggers": ["order"],
            "steps": [
                {"type": "SAY-GET", "message": "Item?", "variable": "item"},
                {"type": "SAY", "message": "Ordering {{item}}"}
            ]
        },
        {
            "id": "cancel-order",
            "name": "Cancel order",
            "triggers": ["cancel order"],
            "steps": [
                {"type": "SAY", "message": "Your order was cancelled."}
            ]
        }
    ]))
}

#[tokio::test]
async fn strong_interruption_runs_and_resumes() {
    let engine = Engine::builder(order_catalog(), vec![]).build().unwrap();
    let mut session = engine.init_session("u1", "s1");

    let prompt = turn(&engine, &mut session, "order").await;
    assert_eq!(prompt.output, "Item?");
    assert_eq!(session.stacks.len(), 1);

    // Exact trigger match: strong interruption on a fresh stack, which
    // completes immediately; the order flow re-emits its prompt.
    let interrupted = turn(&engine, &mut session, "cancel order").await;
    assert_eq!(interrupted.output, "Your order was cancelled.\nItem?");
    assert_eq!(session.stacks.len(), 1, "interrupting stack was popped");
    assert_eq!(session.active_frame().unwrap().flow_id, "order");
    assert_eq!(interrupted.pending_variable.as_deref(), Some("item"));

    let done = turn(&engine, &mut session, "a widget").await;
    assert_eq!(done.output, "Ordering a widget");
    assert!(done.terminated);
}

#[tokio::test]
async fn suspended_stack_is_preserved_verbatim_during_interruption() {
    let engine = Engine::builder(
        flows(json!([
            {
                "id": "order",
                "name": "Order",
                "triggers": ["order"],
                "steps": [
                    {"type": "SET", "variable": "basket", "value": ["x", "y"]},
                    {"type": "SAY-GET", "message": "Item?", "variable": "item"},
                    {"type": "SAY", "message": "{{basket.length}} + {{item}}"}
                ]
            },
            {
                "id": "pause",
                "name": "Pause",
                "triggers": ["pause"],
                "steps": [
                    {"type": "SAY-GET", "message": "Paused. Continue?", "variable": "go"}
                ]
            }
        ])),
        vec![],
    )
    .build()
    .unwrap();

    let mut session = engine.init_session("u1", "s1");
    turn(&engine, &mut session, "order").await;
    let paused = turn(&engine, &mut session, "pause").await;
    assert_eq!(paused.output, "Paused. Continue?");
    assert_eq!(session.stacks.len(), 2);

    // The suspended frame kept its variables.
    assert_eq!(session.stacks[0][0].variables["basket"], json!(["x", "y"]));

    // Finish the interrupting flow; the original prompt comes back.
    let resumed = turn(&engine, &mut session, "sure").await;
    assert!(resumed.output.contains("Item?"), "{}", resumed.output);
    let done = turn(&engine, &mut session, "pears").await;
    assert_eq!(done.output, "2 + pears");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP tool with response mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serve one canned JSON response on an ephemeral port.
async fn serve_json_once(body: &'static str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}/lookup")
}

#[tokio::test]
async fn http_tool_response_is_mapped_before_binding() {
    let url = serve_json_once(
        r#"{"results":[{"id":1,"name":"A","active":true},{"id":2,"name":"B","active":false}]}"#,
    )
    .await;

    let engine = Engine::builder(
        flows(json!([{
            "id": "search",
            "name": "Search",
            "triggers": ["search"],
            "steps": [
                {
                    "type": "CALL-TOOL",
                    "toolName": "lookup",
                    "resultVariable": "hits",
                    "arguments": {}
                },
                {"type": "SAY", "message": "found {{hits[0].label}} ({{hits.length}})"}
            ]
        }])),
        tools(json!([{
            "name": "lookup",
            "implementation": {
                "type": "http",
                "url": url,
                "method": "GET",
                "responseMapping": {
                    "type": "array",
                    "source": "results",
                    "filter": {"field": "active", "operator": "equals", "value": true},
                    "itemMapping": {"type": "object", "mappings": {"label": "name"}}
                }
            }
        }])),
    )
    .build()
    .unwrap();

    let mut session = engine.init_session("u1", "s1");
    let outcome = turn(&engine, &mut session, "search").await;

    // [{label:"A"}] — the inactive row was filtered out.
    assert_eq!(outcome.output, "found A (1)");
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].status, "ok");
    assert!(outcome.events[0].signature.starts_with("GET http://127.0.0.1"));
}

#[tokio::test]
async fn function_tool_binds_result_and_logs_event() {
    let mut functions = FunctionRegistry::default();
    functions.register("add_tax", |args| {
        let amount = args[0]["amount"].as_i64().unwrap_or(0);
        Ok(json!({ "total": amount + amount / 5 }))
    });

    let engine = Engine::builder(
        flows(json!([{
            "id": "quote",
            "name": "Quote",
            "triggers": ["quote"],
            "steps": [
                {
                    "type": "CALL-TOOL",
                    "toolName": "add_tax",
                    "arguments": {"amount": 100},
                    "resultVariable": "priced"
                },
                {"type": "SAY", "message": "total {{priced.total}}"}
            ]
        }])),
        tools(json!([{
            "name": "add_tax",
            "implementation": {"type": "function", "name": "add_tax"}
        }])),
    )
    .functions(functions)
    .build()
    .unwrap();

    let mut session = engine.init_session("u1", "s1");
    let outcome = turn(&engine, &mut session, "quote").await;
    assert_eq!(outcome.output, "total 120");
    assert_eq!(outcome.events[0].signature, "function add_tax");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox rejection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn constructor_escape_is_rejected_at_validation() {
    let result = Engine::builder(
        flows(json!([{
            "id": "evil",
            "name": "Evil",
            "steps": [
                {
                    "type": "SET",
                    "variable": "x",
                    "expression": "this.constructor(\"return 1\")()"
                }
            ]
        }])),
        vec![],
    )
    .build();
    assert!(matches!(result, Err(Error::CatalogInvalid(_))));
}

#[tokio::test]
async fn constructor_escape_never_evaluates_at_runtime() {
    // Even with validation off, the static checks run per-expression.
    let engine = Engine::builder(
        flows(json!([{
            "id": "evil",
            "name": "Evil",
            "triggers": ["evil"],
            "steps": [
                {
                    "type": "SET",
                    "variable": "x",
                    "expression": "this.constructor(\"return 1\")()"
                },
                {"type": "SAY", "message": "never reached"}
            ]
        }])),
        vec![],
    )
    .validate_on_init(false)
    .build()
    .unwrap();

    let mut session = engine.init_session("u1", "s1");
    let outcome = turn(&engine, &mut session, "evil").await;
    // The step failed with no prompt to return to; the stack aborted.
    assert!(session.is_idle());
    assert!(!outcome.output.contains("never reached"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Financial protection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn financial_catalog() -> Vec<cf_engine::FlowDefinition> {
    flows(json!([
        {
            "id": "transfer",
            "name": "Transfer",
            "category": "financial",
            "triggers": ["transfer"],
            "steps": [
                {"type": "SAY-GET", "message": "Amount?", "variable": "amount"},
                {"type": "SAY", "message": "Transferring {{amount}}"}
            ]
        },
        {
            "id": "weather",
            "name": "check weather",
            "steps": [{"type": "SAY", "message": "Sunny."}]
        }
    ]))
}

#[tokio::test]
async fn medium_intent_on_financial_flow_requires_confirmation() {
    let engine = Engine::builder(financial_catalog(), vec![]).build().unwrap();
    let mut session = engine.init_session("u1", "s1");

    turn(&engine, &mut session, "transfer").await;

    // Substring match → medium; active flow is financial → confirm.
    let asked = turn(&engine, &mut session, "please check weather now").await;
    assert!(asked.output.contains("check weather"), "{}", asked.output);
    assert!(asked.output.contains("yes"), "{}", asked.output);

    // "no" keeps the transfer on top and re-asks its prompt.
    let declined = turn(&engine, &mut session, "no").await;
    assert_eq!(declined.output, "Amount?");
    assert_eq!(session.active_frame().unwrap().flow_id, "transfer");
    assert_eq!(declined.pending_variable.as_deref(), Some("amount"));

    // Asking again and accepting interrupts; the transfer then resumes.
    turn(&engine, &mut session, "please check weather now").await;
    let accepted = turn(&engine, &mut session, "yes").await;
    assert_eq!(accepted.output, "Sunny.\nAmount?");
    assert_eq!(session.active_frame().unwrap().flow_id, "transfer");
    assert_eq!(accepted.pending_variable.as_deref(), Some("amount"));
}
