//! The step evaluator: one method per step variant, driven by the
//! scheduler's run loop.

use serde_json::{Map, Value};

use cf_domain::{
    AppendMode, CallType, ContextEntry, Error, OnFail, Result, Step, SwitchBranch, TraceEvent,
    VarScope,
};
use cf_script::{compile, evaluate, parse_path, render, set_path, truthy, Scope};
use cf_tools::http::resolve_value;

use crate::scheduler::{LoopSignal, Turn};

impl Turn<'_> {
    pub(crate) async fn eval_step(&mut self, step: Step) -> Result<LoopSignal> {
        {
            let frame = self
                .session
                .active_frame()
                .ok_or_else(|| Error::Internal("step without active frame".into()))?;
            TraceEvent::StepExecuted {
                flow_id: frame.flow_id.clone(),
                step_kind: step.kind().to_owned(),
            }
            .emit();
        }

        match step {
            Step::Say {
                message,
                append_mode,
            } => self.eval_say(&message, append_mode),
            Step::SayGet {
                message,
                variable,
                validator,
            } => self.eval_say_get(&message, variable, validator),
            Step::Set {
                variable,
                value,
                expression,
                scope,
            } => self.eval_set(&variable, value, expression, scope),
            Step::CallTool {
                tool_name,
                arguments,
                result_variable,
                on_fail,
            } => {
                self.eval_call_tool(&tool_name, &arguments, &result_variable, on_fail)
                    .await
            }
            Step::Flow {
                flow_id,
                call_type,
                arguments,
                result_variable,
            } => self.eval_flow(&flow_id, call_type, &arguments, result_variable),
            Step::Switch {
                expression,
                branches,
                default,
            } => self.eval_switch(&expression, &branches, default),
            Step::Return { value } => self.eval_return(value),
        }
    }

    // ── rendering helpers ──────────────────────────────────────────

    /// Render a template in the active frame's scope.
    fn render_active(&self, text: &str) -> Result<String> {
        let frame = self
            .session
            .active_frame()
            .ok_or_else(|| Error::Internal("render without active frame".into()))?;
        let scope = Scope::new(Some(&frame.variables), Some(&self.session.globals));
        render(text, &scope, &self.engine.functions)
    }

    /// Resolve a literal that may carry templates in its strings.
    fn resolve_active(&self, value: &Value) -> Result<Value> {
        let frame = self
            .session
            .active_frame()
            .ok_or_else(|| Error::Internal("resolve without active frame".into()))?;
        let scope = Scope::new(Some(&frame.variables), Some(&self.session.globals));
        resolve_value(value, &scope, &self.engine.functions)
    }

    fn eval_in_active(&self, source: &str) -> Result<Value> {
        let frame = self
            .session
            .active_frame()
            .ok_or_else(|| Error::Internal("eval without active frame".into()))?;
        let scope = Scope::new(Some(&frame.variables), Some(&self.session.globals));
        let expr = compile(source, &self.engine.functions)?;
        evaluate(&expr, &scope, &self.engine.functions)
    }

    // ── SAY ────────────────────────────────────────────────────────

    fn eval_say(&mut self, message: &str, append_mode: AppendMode) -> Result<LoopSignal> {
        let text = self.render_active(message)?;
        let frame = self.session.active_frame_mut().expect("active frame");
        if append_mode == AppendMode::Replace {
            frame.last_say_message.clear();
        }
        if !frame.last_say_message.is_empty() {
            frame.last_say_message.push('\n');
        }
        frame.last_say_message.push_str(&text);
        Ok(LoopSignal::Continue)
    }

    // ── SAY-GET ────────────────────────────────────────────────────

    fn eval_say_get(
        &mut self,
        message: &str,
        variable: String,
        validator: Option<String>,
    ) -> Result<LoopSignal> {
        let prompt = self.render_active(message)?;
        let timestamp = self.timestamp;

        let frame = self.session.active_frame_mut().expect("active frame");
        let accumulated = frame.take_say();
        let emission = if accumulated.is_empty() {
            prompt
        } else {
            format!("{accumulated}\n{prompt}")
        };

        frame.last_prompt = Some(emission.clone());
        frame.last_prompt_variable = Some(variable.clone());
        frame.pending_variable = Some(variable);
        frame.pending_validator = validator;
        frame.record(ContextEntry::assistant(emission.clone(), timestamp));

        self.push_output(emission);
        Ok(LoopSignal::Suspend)
    }

    // ── SET ────────────────────────────────────────────────────────

    fn eval_set(
        &mut self,
        variable: &str,
        value: Option<Value>,
        expression: Option<String>,
        scope: VarScope,
    ) -> Result<LoopSignal> {
        let computed = if let Some(source) = expression {
            self.eval_in_active(&source)?
        } else if let Some(literal) = value {
            self.resolve_active(&literal)?
        } else {
            Value::Null
        };

        let segments = parse_path(variable)?;
        match scope {
            VarScope::Global => set_path(&mut self.session.globals, &segments, computed)?,
            VarScope::Frame => {
                let frame = self.session.active_frame_mut().expect("active frame");
                set_path(&mut frame.variables, &segments, computed)?;
            }
        }
        Ok(LoopSignal::Continue)
    }

    // ── CALL-TOOL ──────────────────────────────────────────────────

    async fn eval_call_tool(
        &mut self,
        tool_name: &str,
        arguments: &std::collections::HashMap<String, Value>,
        result_variable: &str,
        on_fail: Option<OnFail>,
    ) -> Result<LoopSignal> {
        let invocation = {
            let frame = self
                .session
                .active_frame()
                .ok_or_else(|| Error::Internal("tool call without active frame".into()))?;
            let scope = Scope::new(Some(&frame.variables), Some(&self.session.globals));
            self.engine
                .invoker
                .invoke(
                    &self.session.session_id,
                    tool_name,
                    arguments,
                    &scope,
                    self.cancel,
                )
                .await
        };

        let timestamp = self.timestamp;
        let frame = self.session.active_frame_mut().expect("active frame");
        frame.transaction.record(invocation.event.clone());
        frame.record(ContextEntry::tool(
            tool_name,
            serde_json::json!({
                "signature": invocation.event.signature,
                "status": invocation.event.status,
                "latencyMs": invocation.event.latency_ms,
            }),
            timestamp,
        ));
        self.events.push(invocation.event);

        match invocation.outcome {
            Ok(value) => {
                let frame = self.session.active_frame_mut().expect("active frame");
                set_path(&mut frame.variables, &parse_path(result_variable)?, value)?;
                Ok(LoopSignal::Continue)
            }
            Err(error) => match on_fail {
                Some(handler) => {
                    tracing::debug!(tool = tool_name, error = %error, "tool failed, running onFail");
                    let frame = self.session.active_frame_mut().expect("active frame");
                    frame.push_steps(&handler.steps);
                    Ok(LoopSignal::Continue)
                }
                // No handler: the scheduler applies the smart defaults.
                None => Err(error),
            },
        }
    }

    // ── FLOW ───────────────────────────────────────────────────────

    fn eval_flow(
        &mut self,
        flow_id: &str,
        call_type: CallType,
        arguments: &std::collections::HashMap<String, Value>,
        result_variable: Option<String>,
    ) -> Result<LoopSignal> {
        let flow = self.engine.flow(flow_id)?.clone();

        // Resolve child arguments in the caller's scope before any frame
        // is pushed or popped.
        let mut resolved = Map::new();
        for (name, value) in arguments {
            resolved.insert(name.clone(), self.resolve_active(value)?);
        }
        for parameter in &flow.parameters {
            if parameter.required
                && parameter.default.is_none()
                && !resolved.contains_key(&parameter.name)
            {
                return Err(Error::Internal(format!(
                    "flow '{flow_id}' requires argument '{}'",
                    parameter.name
                )));
            }
        }

        match call_type {
            CallType::Call => {
                if self.session.active_depth() + 1 > self.engine.config.stack_depth_budget {
                    return Err(Error::StepBudgetExceeded(format!(
                        "stack depth would exceed {}",
                        self.engine.config.stack_depth_budget
                    )));
                }
            }
            CallType::Replace => {}
            CallType::Reboot => {
                self.discard_all_stacks();
            }
        }

        let child = self.new_frame(&flow, Some(resolved), result_variable);
        match call_type {
            CallType::Replace => self.replace_active_frame(child),
            _ => self.session.push_frame(child),
        }
        TraceEvent::FlowStarted {
            flow_id: flow.id,
            call_type: format!("{call_type:?}").to_lowercase(),
            stack_index: self.session.active_stack_index,
        }
        .emit();
        Ok(LoopSignal::Continue)
    }

    // ── SWITCH ─────────────────────────────────────────────────────

    fn eval_switch(
        &mut self,
        expression: &str,
        branches: &[SwitchBranch],
        default: Option<Vec<Step>>,
    ) -> Result<LoopSignal> {
        let subject = self.eval_in_active(expression)?;

        for branch in branches {
            let hit = if let Some(expected) = &branch.match_value {
                strict_equal(&subject, expected)
            } else if let Some(condition) = &branch.condition {
                truthy(&self.eval_in_active(condition)?)
            } else {
                false
            };
            if hit {
                let frame = self.session.active_frame_mut().expect("active frame");
                frame.push_steps(&branch.steps);
                return Ok(LoopSignal::Continue);
            }
        }

        if let Some(default_steps) = default {
            let frame = self.session.active_frame_mut().expect("active frame");
            frame.push_steps(&default_steps);
        }
        Ok(LoopSignal::Continue)
    }

    // ── RETURN ─────────────────────────────────────────────────────

    fn eval_return(&mut self, value: Option<Value>) -> Result<LoopSignal> {
        let rendered = match value {
            Some(Value::String(text)) => Some(Value::String(self.render_active(&text)?)),
            Some(other) => Some(self.resolve_active(&other)?),
            None => None,
        };
        self.pop_and_resume(rendered, true)?;
        Ok(LoopSignal::Continue)
    }
}

/// `match` comparison: strict equality with numeric normalization.
fn strict_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
