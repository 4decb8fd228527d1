//! The flow scheduler: the per-turn run loop over the stack-of-stacks
//! activation model, interruption and resume, universal commands, and
//! the error-routing policy.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use cf_domain::messages::keys;
use cf_domain::{CallType, ContextEntry, Error, IntentStrength, Result, TraceEvent};
use cf_script::{compile, evaluate, parse_path, set_path, truthy, Scope};
use cf_sessions::{FlowFrame, PendingInterruption, Session, TransactionEvent};

use crate::arbiter::{Decision, UniversalCommand, CONFIRM_VARIABLE};
use crate::engine::{Engine, TurnOutcome};

pub(crate) enum LoopSignal {
    Continue,
    Suspend,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable state for one `update_activity` call.
pub(crate) struct Turn<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) session: &'a mut Session,
    pub(crate) output: Vec<String>,
    pub(crate) events: Vec<TransactionEvent>,
    pub(crate) steps_executed: u32,
    pub(crate) cancel: Option<&'a CancellationToken>,
    pub(crate) timestamp: i64,
}

impl<'a> Turn<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        session: &'a mut Session,
        cancel: Option<&'a CancellationToken>,
        timestamp: i64,
    ) -> Self {
        Self {
            engine,
            session,
            output: Vec::new(),
            events: Vec::new(),
            steps_executed: 0,
            cancel,
            timestamp,
        }
    }

    pub(crate) fn push_output(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.output.push(text);
        }
    }

    pub(crate) fn msg(&self, key: &str, ctx: Value) -> String {
        self.engine.message(&self.session.lang, key, ctx)
    }

    pub(crate) fn finish(self) -> (TurnOutcome, u32) {
        let outcome = TurnOutcome {
            output: self.output.join("\n"),
            pending_variable: self
                .session
                .active_frame()
                .and_then(|f| f.pending_variable.clone()),
            terminated: self.session.is_idle(),
            events: self.events,
        };
        (outcome, self.steps_executed)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Arbiter decision application
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Set the turn up per the arbiter's verdict. Returns whether the
    /// run loop should drive steps afterwards.
    pub(crate) fn apply_decision(&mut self, decision: Decision, utterance: &str) -> Result<bool> {
        match decision {
            Decision::Universal(UniversalCommand::Cancel) => {
                self.cancel_active();
                Ok(true)
            }
            Decision::Universal(UniversalCommand::Help) => {
                let flows: Vec<Value> = self
                    .engine
                    .flows
                    .iter()
                    .map(|f| json!({"name": f.name, "description": f.description}))
                    .collect();
                let text = self.msg(keys::HELP, json!({ "flows": flows }));
                self.push_output(text);
                Ok(false)
            }
            Decision::Universal(UniversalCommand::Status) => {
                let ctx = match self.session.active_frame() {
                    Some(frame) => json!({
                        "flow": frame.flow_name,
                        "pending": frame.pending_variable,
                        "idle": frame.pending_variable.is_none(),
                        "depth": self.session.active_depth(),
                    }),
                    None => json!({"flow": "idle", "idle": true}),
                };
                let text = self.msg(keys::STATUS, ctx);
                self.push_output(text);
                Ok(false)
            }
            Decision::ResolveConfirmation { accept } => self.resolve_confirmation(accept),
            Decision::Deliver => {
                if let Some(frame) = self.session.active_frame_mut() {
                    frame.input_stack.push(utterance.to_owned());
                }
                Ok(true)
            }
            Decision::Continue => Ok(true),
            Decision::Start { flow_id, call_type } => {
                self.start_flow(&flow_id, call_type)?;
                self.record_trigger(utterance);
                Ok(true)
            }
            Decision::Interrupt { flow_id, call_type } => {
                self.interrupt(&flow_id, call_type)?;
                self.record_trigger(utterance);
                Ok(true)
            }
            Decision::Confirm {
                flow_id,
                strength,
                call_type,
            } => {
                self.request_confirmation(&flow_id, strength, call_type)?;
                Ok(false)
            }
            Decision::NotUnderstood => {
                let key = if self.session.turns <= 1 && self.session.is_idle() {
                    keys::WELCOME
                } else {
                    keys::I_DIDNT_CATCH
                };
                let text = self.msg(key, json!({}));
                self.push_output(text);
                Ok(false)
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Activation operations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Log the utterance that activated a flow into its history.
    fn record_trigger(&mut self, utterance: &str) {
        let timestamp = self.timestamp;
        if let Some(frame) = self.session.active_frame_mut() {
            frame.record(ContextEntry::user(utterance.to_owned(), timestamp));
        }
    }

    /// Build a frame for `flow`, seeding parameter defaults and any
    /// resolved arguments.
    pub(crate) fn new_frame(
        &self,
        flow: &cf_domain::FlowDefinition,
        arguments: Option<serde_json::Map<String, Value>>,
        result_variable: Option<String>,
    ) -> FlowFrame {
        let mut frame = FlowFrame::new(flow, &self.session.user_id);
        for parameter in &flow.parameters {
            if let Some(default) = &parameter.default {
                frame
                    .variables
                    .insert(parameter.name.clone(), default.clone());
            }
        }
        if let Some(arguments) = arguments {
            for (name, value) in arguments {
                frame.variables.insert(name, value);
            }
        }
        frame.result_variable = result_variable;
        frame
    }

    /// Start a flow on an idle session (or reboot into it).
    pub(crate) fn start_flow(&mut self, flow_id: &str, call_type: CallType) -> Result<()> {
        let flow = self.engine.flow(flow_id)?.clone();
        if call_type == CallType::Reboot {
            self.discard_all_stacks();
        }
        let frame = self.new_frame(&flow, None, None);
        self.session.push_frame(frame);
        TraceEvent::FlowStarted {
            flow_id: flow.id,
            call_type: format!("{call_type:?}").to_lowercase(),
            stack_index: self.session.active_stack_index,
        }
        .emit();
        Ok(())
    }

    /// Interrupt the running activity with another flow, honoring the
    /// classified call type.
    pub(crate) fn interrupt(&mut self, flow_id: &str, call_type: CallType) -> Result<()> {
        let flow = self.engine.flow(flow_id)?.clone();

        match call_type {
            CallType::Call => {
                let suspended_flow = match self.session.active_frame_mut() {
                    Some(frame) => {
                        // Park the outstanding prompt; it is restored and
                        // re-emitted when this stack resumes.
                        frame.suspended_pending = frame.pending_variable.take();
                        frame.flow_id.clone()
                    }
                    None => String::new(),
                };
                let frame = self.new_frame(&flow, None, None);
                self.session.push_stack(frame);
                TraceEvent::FlowInterrupted {
                    suspended_flow,
                    interrupting_flow: flow.id,
                    new_stack_index: self.session.active_stack_index,
                }
                .emit();
            }
            CallType::Replace => {
                let frame = self.new_frame(&flow, None, None);
                self.replace_active_frame(frame);
            }
            CallType::Reboot => {
                self.discard_all_stacks();
                let frame = self.new_frame(&flow, None, None);
                self.session.push_frame(frame);
            }
        }
        Ok(())
    }

    /// Swap the top of the active stack for `child`, keeping the child on
    /// its own stack even when the replaced frame was that stack's last
    /// (pop pruning would otherwise merge it into the suspended stack
    /// below).
    pub(crate) fn replace_active_frame(&mut self, child: FlowFrame) {
        let stacks_before = self.session.stacks.len();
        if let Some(mut replaced) = self.session.pop_frame() {
            replaced.transaction.commit();
        }
        if self.session.stacks.len() < stacks_before {
            self.session.push_stack(child);
        } else {
            self.session.push_frame(child);
        }
    }

    /// Roll back and drop every frame in the session.
    pub(crate) fn discard_all_stacks(&mut self) {
        let stacks_before = self.session.stacks.len();
        let discarded = self.session.reboot();
        if discarded.is_empty() {
            return;
        }
        for mut frame in discarded {
            frame.transaction.rollback();
            TraceEvent::TransactionRolledBack {
                transaction_id: frame.transaction.id.clone(),
                flow_id: frame.flow_id.clone(),
            }
            .emit();
        }
        TraceEvent::SessionRebooted {
            session_id: self.session.session_id.clone(),
            discarded_stacks: stacks_before,
        }
        .emit();
    }

    // ── confirmation ───────────────────────────────────────────────

    fn request_confirmation(
        &mut self,
        flow_id: &str,
        strength: IntentStrength,
        call_type: CallType,
    ) -> Result<()> {
        let candidate_name = self.engine.flow(flow_id)?.name.clone();
        let lang = self.session.lang.clone();

        let frame = self
            .session
            .active_frame_mut()
            .ok_or_else(|| Error::Internal("confirmation without active flow".into()))?;

        let displaced = frame.pending_variable.take();
        frame.pending_interruption = Some(PendingInterruption {
            candidate_flow_id: flow_id.to_owned(),
            strength,
            call_type,
            resume_variable: displaced,
        });
        frame.pending_variable = Some(CONFIRM_VARIABLE.to_owned());

        let (key, ctx) = if call_type == CallType::Reboot {
            (
                keys::REBOOT_REQUIRES_CONFIRM,
                json!({"flow": frame.flow_name}),
            )
        } else {
            (keys::CONFIRM_SWITCH, json!({ "flow": candidate_name }))
        };
        let text = self.engine.message(&lang, key, ctx);
        self.push_output(text);
        Ok(())
    }

    fn resolve_confirmation(&mut self, accept: bool) -> Result<bool> {
        let Some(frame) = self.session.active_frame_mut() else {
            return Ok(false);
        };
        let Some(pending) = frame.pending_interruption.take() else {
            return Ok(false);
        };

        // Restore whatever prompt the confirmation displaced; an accepted
        // switch re-parks it via the interruption path.
        frame.pending_variable = pending.resume_variable;

        if accept {
            self.interrupt(&pending.candidate_flow_id, pending.call_type)?;
            return Ok(true);
        }

        let reemit = self
            .session
            .active_frame()
            .filter(|f| f.pending_variable.is_some())
            .and_then(|f| f.last_prompt.clone());
        if let Some(prompt) = reemit {
            self.push_output(prompt);
        }
        Ok(false)
    }

    // ── universal cancel ───────────────────────────────────────────

    fn cancel_active(&mut self) {
        if !self.session.has_active_flow() {
            let text = self.msg(keys::I_DIDNT_CATCH, json!({}));
            self.push_output(text);
            return;
        }

        let depth_before = self.session.active_depth();
        let mut popped = self.session.pop_frame().expect("active flow");
        popped.transaction.rollback();
        TraceEvent::TransactionRolledBack {
            transaction_id: popped.transaction.id.clone(),
            flow_id: popped.flow_id.clone(),
        }
        .emit();

        let text = self.msg(keys::CANCELLED, json!({"flow": popped.flow_name}));
        self.push_output(text);

        if depth_before == 1 {
            self.emit_resume();
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Run loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Drive the active frame until a blocking prompt, an empty session,
    /// or the step budget.
    pub(crate) async fn run(&mut self) -> Result<()> {
        loop {
            match self.consume_pending_input() {
                Ok(LoopSignal::Suspend) => return Ok(()),
                Ok(LoopSignal::Continue) => {}
                Err(e) => {
                    let financial = self.active_financial();
                    match self.handle_step_error(e, financial)? {
                        LoopSignal::Suspend => return Ok(()),
                        LoopSignal::Continue => continue,
                    }
                }
            }

            let Some(frame) = self.session.active_frame() else {
                return Ok(());
            };
            if frame.pending_variable.is_some() {
                return Ok(());
            }

            if frame.steps_remaining.is_empty() {
                // Implicit completion: a frame that ran out of steps pops
                // with no return value.
                self.pop_and_resume(None, true)?;
                continue;
            }

            if self.steps_executed >= self.engine.config.step_budget {
                return Err(Error::StepBudgetExceeded(format!(
                    "turn exceeded {} steps",
                    self.engine.config.step_budget
                )));
            }
            self.steps_executed += 1;

            let financial = frame.financial;
            let step = self
                .session
                .active_frame_mut()
                .expect("frame checked above")
                .next_step()
                .expect("steps checked above");

            match self.eval_step(step).await {
                Ok(LoopSignal::Continue) => {}
                Ok(LoopSignal::Suspend) => return Ok(()),
                Err(e) => match self.handle_step_error(e, financial)? {
                    LoopSignal::Continue => {}
                    LoopSignal::Suspend => return Ok(()),
                },
            }
        }
    }

    /// Bind a queued utterance to the pending variable, running the
    /// prompt's validator first.
    fn consume_pending_input(&mut self) -> Result<LoopSignal> {
        let Some(frame) = self.session.active_frame() else {
            return Ok(LoopSignal::Continue);
        };
        if frame.pending_variable.is_none() || frame.input_stack.is_empty() {
            return Ok(LoopSignal::Continue);
        }

        let variable = frame.pending_variable.clone().expect("checked above");
        let validator = frame.pending_validator.clone();
        let text = self
            .session
            .active_frame_mut()
            .expect("checked above")
            .input_stack
            .remove(0);
        let value = Value::String(text.clone());

        if let Some(source) = validator {
            let valid = {
                let frame = self.session.active_frame().expect("checked above");
                let scope = Scope::new(Some(&frame.variables), Some(&self.session.globals))
                    .with_local(variable.clone(), value.clone());
                let expr = compile(&source, &self.engine.functions)?;
                truthy(&evaluate(&expr, &scope, &self.engine.functions)?)
            };
            if !valid {
                let prompt = self
                    .session
                    .active_frame()
                    .and_then(|f| f.last_prompt.clone())
                    .unwrap_or_default();
                let text = self.msg(keys::RETRY_PROMPT, json!({ "prompt": prompt }));
                self.push_output(text);
                return Ok(LoopSignal::Suspend);
            }
        }

        let timestamp = self.timestamp;
        let frame = self.session.active_frame_mut().expect("checked above");
        set_path(&mut frame.variables, &parse_path(&variable)?, value)?;
        frame.pending_variable = None;
        frame.pending_validator = None;
        frame.record(ContextEntry::user(text, timestamp));
        Ok(LoopSignal::Continue)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Pop / resume
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Pop the active frame, finalize its transaction, route its return
    /// value, and resume whatever lies beneath.
    pub(crate) fn pop_and_resume(
        &mut self,
        return_value: Option<Value>,
        commit: bool,
    ) -> Result<()> {
        let depth_before = self.session.active_depth();
        let mut popped = self
            .session
            .pop_frame()
            .ok_or_else(|| Error::Internal("pop on empty session".into()))?;
        if commit {
            popped.transaction.commit();
        } else {
            popped.transaction.rollback();
        }
        TraceEvent::FlowReturned {
            flow_id: popped.flow_id.clone(),
            had_value: return_value.is_some(),
        }
        .emit();

        if depth_before > 1 {
            // A parent in the same stack resumes.
            let parent = self.session.active_frame_mut().expect("parent frame");
            if let Some(result_variable) = &popped.result_variable {
                let bound = return_value.clone().unwrap_or(Value::Null);
                set_path(&mut parent.variables, &parse_path(result_variable)?, bound)?;
            } else if let Some(Value::Object(map)) = &return_value {
                // Named return values merge into the parent.
                for (name, value) in map {
                    parent.variables.insert(name.clone(), value.clone());
                }
            }
            // A string return joins the parent's say accumulator; any
            // other sub-flow output is discarded.
            if let Some(Value::String(text)) = &return_value {
                if !text.is_empty() {
                    if !parent.last_say_message.is_empty() {
                        parent.last_say_message.push('\n');
                    }
                    parent.last_say_message.push_str(text);
                }
            }
            return Ok(());
        }

        // Last frame of its stack: its accumulated output goes to the
        // host.
        let mut emission = popped.take_say();
        if let Some(Value::String(text)) = &return_value {
            if !text.is_empty() {
                if !emission.is_empty() {
                    emission.push('\n');
                }
                emission.push_str(text);
            }
        }
        self.push_output(emission);

        self.emit_resume();
        Ok(())
    }

    /// After a stack finishes, bring the suspended stack below back to
    /// life: restore its parked prompt and re-emit the last say + prompt.
    fn emit_resume(&mut self) {
        if !self.session.has_active_flow() {
            return;
        }
        let timestamp = self.timestamp;
        let stack_index = self.session.active_stack_index;
        let frame = self.session.active_frame_mut().expect("active flow");
        if let Some(parked) = frame.suspended_pending.take() {
            frame.pending_variable = Some(parked);
        }
        frame.record(ContextEntry::system("resumed from interruption", timestamp));
        TraceEvent::FlowResumed {
            flow_id: frame.flow_id.clone(),
            stack_index,
        }
        .emit();

        let reemit = frame
            .pending_variable
            .is_some()
            .then(|| frame.last_prompt.clone())
            .flatten();
        if let Some(prompt) = reemit {
            self.push_output(prompt);
        }
    }

    /// Abort every frame in the active stack, rolling back transactions,
    /// then resume the stack below.
    pub(crate) fn abort_active_stack(&mut self) {
        let aborted_stack = self.session.active_stack_index;
        while self.session.has_active_flow() && self.session.active_stack_index == aborted_stack
        {
            let Some(mut popped) = self.session.pop_frame() else {
                break;
            };
            popped.transaction.rollback();
            TraceEvent::TransactionRolledBack {
                transaction_id: popped.transaction.id.clone(),
                flow_id: popped.flow_id.clone(),
            }
            .emit();
            if self.session.is_idle() {
                break;
            }
        }
        self.emit_resume();
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Error routing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn active_financial(&self) -> bool {
        self.session.active_frame().is_some_and(|f| f.financial)
    }

    /// Put the pending prompt back and re-emit it. Returns `false` when
    /// there is no prompt to return to.
    fn reprompt(&mut self) -> bool {
        let Some(frame) = self.session.active_frame_mut() else {
            return false;
        };
        let (Some(prompt), Some(variable)) =
            (frame.last_prompt.clone(), frame.last_prompt_variable.clone())
        else {
            return false;
        };
        frame.pending_variable = Some(variable);
        self.push_output(prompt);
        true
    }

    /// The smart-default policy for a failed step: financial flows abort
    /// their transaction and hand off to the recovery flow; transport
    /// failures retry via the user; payload errors re-ask the prior
    /// prompt; everything else kills the stack.
    pub(crate) fn handle_step_error(
        &mut self,
        error: Error,
        financial: bool,
    ) -> Result<LoopSignal> {
        // Budget exhaustion and host cancellation are turn-fatal.
        if matches!(
            error,
            Error::StepBudgetExceeded(_) | Error::Cancelled(_) | Error::CatalogInvalid(_)
        ) {
            return Err(error);
        }

        tracing::warn!(error = %error, kind = error.kind(), financial, "step failed");

        if financial {
            let text = self.msg(keys::FINANCIAL_ABORTED, json!({}));
            self.push_output(text);
            self.abort_active_stack();
            if let Some(recovery) = self.engine.config.recovery_flow.clone() {
                if self.engine.flow(&recovery).is_ok() {
                    if self.session.has_active_flow() {
                        self.interrupt(&recovery, CallType::Call)?;
                    } else {
                        self.start_flow(&recovery, CallType::Call)?;
                    }
                }
            }
            return Ok(LoopSignal::Continue);
        }

        if error.is_transport() {
            let text = self.msg(keys::NETWORK_ERROR, json!({}));
            self.push_output(text);
            if self.reprompt() {
                return Ok(LoopSignal::Suspend);
            }
            self.abort_active_stack();
            return Ok(LoopSignal::Continue);
        }

        match error {
            Error::SchemaValidation(_)
            | Error::ExpressionRejected(_)
            | Error::ExpressionRuntime(_)
            | Error::TemplateSyntax(_)
            | Error::TransformInvalid(_) => {
                let prompt = self
                    .session
                    .active_frame()
                    .and_then(|f| f.last_prompt.clone())
                    .unwrap_or_default();
                let text = self.msg(keys::RETRY_PROMPT, json!({ "prompt": prompt }));
                self.push_output(text);
                if self.reprompt_variable_only() {
                    return Ok(LoopSignal::Suspend);
                }
                self.abort_active_stack();
                Ok(LoopSignal::Continue)
            }
            _ => {
                self.abort_active_stack();
                Ok(LoopSignal::Continue)
            }
        }
    }

    /// Re-arm the prior prompt without re-printing it (the retry message
    /// already contains the prompt text).
    fn reprompt_variable_only(&mut self) -> bool {
        let Some(frame) = self.session.active_frame_mut() else {
            return false;
        };
        let Some(variable) = frame.last_prompt_variable.clone() else {
            return false;
        };
        if frame.last_prompt.is_none() {
            return false;
        }
        frame.pending_variable = Some(variable);
        true
    }
}
