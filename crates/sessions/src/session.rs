use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::frame::FlowFrame;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One end-user's long-lived conversational state.
///
/// `stacks[active_stack_index]` is the executing stack and its last frame
/// is the current activation. Invariants maintained here:
/// - every stack in `stacks` is non-empty (empty stacks are pruned on pop);
/// - the active index always points at the most recent stack;
/// - at most one frame holds a pending variable, and it is the active top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub stacks: Vec<Vec<FlowFrame>>,
    pub active_stack_index: usize,
    pub globals: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub lang: String,
    /// Turns processed so far (the welcome path fires on the first one).
    #[serde(default)]
    pub turns: u64,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        globals: Map<String, Value>,
        lang: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            stacks: Vec::new(),
            active_stack_index: 0,
            globals,
            created_at: now,
            last_activity_at: now,
            lang: lang.into(),
            turns: 0,
        }
    }

    // ── frame access ───────────────────────────────────────────────

    pub fn active_frame(&self) -> Option<&FlowFrame> {
        self.stacks.get(self.active_stack_index)?.last()
    }

    pub fn active_frame_mut(&mut self) -> Option<&mut FlowFrame> {
        self.stacks.get_mut(self.active_stack_index)?.last_mut()
    }

    pub fn has_active_flow(&self) -> bool {
        self.active_frame().is_some()
    }

    /// Depth of the active stack.
    pub fn active_depth(&self) -> usize {
        self.stacks
            .get(self.active_stack_index)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn frame_count(&self) -> usize {
        self.stacks.iter().map(|s| s.len()).sum()
    }

    // ── stack operations ───────────────────────────────────────────

    /// Push a frame on the active stack, creating the first stack when
    /// the session is idle.
    pub fn push_frame(&mut self, frame: FlowFrame) {
        if self.stacks.is_empty() {
            self.stacks.push(Vec::new());
            self.active_stack_index = 0;
        }
        self.stacks[self.active_stack_index].push(frame);
        self.assert_invariants();
    }

    /// Open a new stack for an interrupting activity; the suspended stack
    /// is preserved verbatim underneath.
    pub fn push_stack(&mut self, frame: FlowFrame) {
        self.stacks.push(vec![frame]);
        self.active_stack_index = self.stacks.len() - 1;
        self.assert_invariants();
    }

    /// Pop the active frame. Empty stacks are pruned and the active index
    /// falls back to the most recent surviving stack.
    pub fn pop_frame(&mut self) -> Option<FlowFrame> {
        let stack = self.stacks.get_mut(self.active_stack_index)?;
        let frame = stack.pop()?;
        while matches!(self.stacks.last(), Some(s) if s.is_empty()) {
            self.stacks.pop();
        }
        // Mid-vector stacks never empty (only the active top pops), so
        // the most recent non-empty stack is simply the last one.
        self.active_stack_index = self.stacks.len().saturating_sub(1);
        self.assert_invariants();
        Some(frame)
    }

    /// Whether popping the active frame would resume a different
    /// activation (a frame below it, or a suspended stack).
    pub fn has_resume_target(&self) -> bool {
        self.frame_count() > 1
    }

    /// Discard every stack. Returns the frames that were destroyed, outermost
    /// first, so the caller can roll back their transactions.
    pub fn reboot(&mut self) -> Vec<FlowFrame> {
        let discarded = self.stacks.drain(..).flatten().collect();
        self.active_stack_index = 0;
        discarded
    }

    // ── bookkeeping ────────────────────────────────────────────────

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn is_idle(&self) -> bool {
        self.stacks.is_empty()
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.stacks.iter().all(|s| !s.is_empty()),
            "session {} holds an empty stack",
            self.session_id
        );
        debug_assert!(
            self.stacks.is_empty() || self.active_stack_index < self.stacks.len(),
            "session {} active index out of range",
            self.session_id
        );
        let pending: Vec<(usize, usize)> = self
            .stacks
            .iter()
            .enumerate()
            .flat_map(|(si, stack)| {
                stack
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| f.pending_variable.is_some())
                    .map(move |(fi, _)| (si, fi))
            })
            .collect();
        debug_assert!(
            pending.len() <= 1,
            "session {} has multiple pending variables: {pending:?}",
            self.session_id
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
