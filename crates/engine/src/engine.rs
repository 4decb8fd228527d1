//! The engine facade: construction (immutable afterwards), session
//! creation, and the single per-turn entry point.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use cf_domain::{
    ContextEntry, EngineConfig, Error, FlowDefinition, MessageRegistry, Result, Role,
    ToolDefinition, TraceEvent,
};
use cf_script::{render, FunctionRegistry, Scope};
use cf_sessions::{Session, TransactionEvent};
use cf_tools::{ToolCatalog, ToolInvoker};

use crate::bridge::AiBridge;
use crate::scheduler::Turn;
use crate::validate::validate_catalog;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the host gets back from one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Everything said this turn, newline-joined.
    pub output: String,
    /// Variable the engine is now waiting on, if any.
    pub pending_variable: Option<String>,
    /// `true` when the session has no active flow left.
    pub terminated: bool,
    /// Transaction events appended during this turn.
    pub events: Vec<TransactionEvent>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The flow interpreter. Holds only immutable catalogs after
/// construction; all per-user mutability lives in the [`Session`]
/// objects the host passes in.
pub struct Engine {
    pub(crate) flows: Vec<FlowDefinition>,
    pub(crate) flow_index: HashMap<String, usize>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) invoker: ToolInvoker,
    pub(crate) bridge: Option<Arc<dyn AiBridge>>,
    pub(crate) config: EngineConfig,
    pub(crate) messages: MessageRegistry,
    pub(crate) globals: Map<String, Value>,
}

impl Engine {
    pub fn builder(flows: Vec<FlowDefinition>, tools: Vec<ToolDefinition>) -> EngineBuilder {
        EngineBuilder {
            flows,
            tools,
            functions: FunctionRegistry::default(),
            bridge: None,
            config: EngineConfig::default(),
            messages: MessageRegistry::default(),
            globals: Map::new(),
            validate_on_init: true,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn flow(&self, id: &str) -> Result<&FlowDefinition> {
        self.flow_index
            .get(id)
            .map(|&i| &self.flows[i])
            .ok_or_else(|| Error::FlowNotFound(id.to_owned()))
    }

    /// Render a registry message. Rendering never fails the turn: a bad
    /// override template falls back to its raw text.
    pub(crate) fn message(&self, lang: &str, key: &str, ctx: Value) -> String {
        let template = self.messages.get(lang, key);
        let vars = ctx.as_object().cloned().unwrap_or_default();
        let scope = Scope::new(Some(&vars), None);
        render(template, &scope, &self.functions).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "message template failed to render");
            template.to_owned()
        })
    }

    // ── per session ────────────────────────────────────────────────

    /// Create a fresh session seeded with the engine's default globals.
    pub fn init_session(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Session {
        Session::new(
            user_id,
            session_id,
            self.globals.clone(),
            self.config.language.clone(),
        )
    }

    /// Process one context entry to completion.
    pub async fn update_activity(
        &self,
        entry: &ContextEntry,
        session: &mut Session,
    ) -> Result<TurnOutcome> {
        self.update_activity_cancellable(entry, session, None).await
    }

    /// Like [`Engine::update_activity`], with a host cancellation signal
    /// raced against in-flight tool calls.
    pub async fn update_activity_cancellable(
        &self,
        entry: &ContextEntry,
        session: &mut Session,
        cancel: Option<&CancellationToken>,
    ) -> Result<TurnOutcome> {
        session.touch();
        session.turns += 1;

        TraceEvent::TurnStarted {
            session_id: session.session_id.clone(),
            role: format!("{:?}", entry.role).to_lowercase(),
        }
        .emit();

        let mut turn = Turn::new(self, session, cancel, entry.timestamp);

        match entry.role {
            Role::User => {
                let utterance = entry.text().unwrap_or_default().trim().to_owned();
                let decision = self.arbitrate(&utterance, turn.session).await;
                if turn.apply_decision(decision, &utterance)? {
                    turn.run().await?;
                }
            }
            _ => {
                // Non-user entries just land in the active history and
                // drive the run loop (e.g. a host-injected system event).
                if let Some(frame) = turn.session.active_frame_mut() {
                    frame.record(entry.clone());
                }
                turn.run().await?;
            }
        }

        let outcome = turn.finish();

        TraceEvent::TurnFinished {
            session_id: session.session_id.clone(),
            steps_executed: outcome.1,
            terminated: outcome.0.terminated,
        }
        .emit();

        Ok(outcome.0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EngineBuilder {
    flows: Vec<FlowDefinition>,
    tools: Vec<ToolDefinition>,
    functions: FunctionRegistry,
    bridge: Option<Arc<dyn AiBridge>>,
    config: EngineConfig,
    messages: MessageRegistry,
    globals: Map<String, Value>,
    validate_on_init: bool,
}

impl EngineBuilder {
    /// Host-approved functions, callable from expressions and function
    /// tools.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn ai_bridge(mut self, bridge: Arc<dyn AiBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn messages(mut self, messages: MessageRegistry) -> Self {
        self.messages = messages;
        self
    }

    /// Default globals copied into every new session.
    pub fn globals(mut self, globals: Map<String, Value>) -> Self {
        self.globals = globals;
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.config.language = language.into();
        self
    }

    /// Skip catalog validation. Only for hosts that validated the same
    /// catalogs earlier through other means.
    pub fn validate_on_init(mut self, validate: bool) -> Self {
        self.validate_on_init = validate;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let catalog = ToolCatalog::new(self.tools);

        if self.validate_on_init {
            validate_catalog(&self.flows, &catalog, &self.functions)?;
        }

        let flow_index = self
            .flows
            .iter()
            .enumerate()
            .map(|(i, flow)| (flow.id.clone(), i))
            .collect();

        TraceEvent::CatalogValidated {
            flows: self.flows.len(),
            tools: catalog.len(),
        }
        .emit();

        let invoker = ToolInvoker::new(catalog, self.functions.clone(), &self.config)?;

        Ok(Engine {
            flows: self.flows,
            flow_index,
            functions: self.functions,
            invoker,
            bridge: self.bridge,
            config: self.config,
            messages: self.messages,
            globals: self.globals,
        })
    }
}
