//! The intent arbiter: decides how a new user utterance relates to the
//! running activity — universal command, answer to a pending prompt,
//! new flow, or interruption of some strength.

use cf_domain::{CallType, IntentStrength, TraceEvent};
use cf_sessions::Session;

use crate::bridge::{classifier_instructions, parse_classifier_response, IntentMatch};
use crate::engine::Engine;

/// Reserved pending-variable name used by switch confirmations.
pub(crate) const CONFIRM_VARIABLE: &str = "__pending_switch";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    Universal(UniversalCommand),
    /// Answer to an outstanding switch confirmation.
    ResolveConfirmation { accept: bool },
    /// Bind the utterance to the pending variable and keep going.
    Deliver,
    /// No match, but the active frame still has work to do.
    Continue,
    /// No activity: start this flow.
    Start {
        flow_id: String,
        call_type: CallType,
    },
    /// Interrupt the running activity with this flow.
    Interrupt {
        flow_id: String,
        call_type: CallType,
    },
    /// Ask before switching (weak intent, or protections on financial
    /// flows).
    Confirm {
        flow_id: String,
        strength: IntentStrength,
        call_type: CallType,
    },
    /// Nothing matched and nothing was pending.
    NotUnderstood,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UniversalCommand {
    Cancel,
    Help,
    Status,
}

pub(crate) fn is_affirmative(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "yes" | "y" | "yeah" | "yep" | "ok" | "okay" | "sure" | "confirm"
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Arbitration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Engine {
    pub(crate) async fn arbitrate(&self, utterance: &str, session: &Session) -> Decision {
        // Universal commands fire regardless of mode, exact match only —
        // "cancel order" is an intent, "cancel" is a command.
        match utterance.trim().to_lowercase().as_str() {
            "cancel" | "abort" => return Decision::Universal(UniversalCommand::Cancel),
            "help" => return Decision::Universal(UniversalCommand::Help),
            "status" => return Decision::Universal(UniversalCommand::Status),
            _ => {}
        }

        // An outstanding switch confirmation consumes the utterance.
        if let Some(frame) = session.active_frame() {
            if frame.pending_interruption.is_some()
                && frame.pending_variable.as_deref() == Some(CONFIRM_VARIABLE)
            {
                return Decision::ResolveConfirmation {
                    accept: is_affirmative(utterance),
                };
            }
        }

        let matched = self.classify(utterance).await;

        TraceEvent::IntentClassified {
            flow_id: matched.as_ref().map(|m| m.flow_id.clone()),
            strength: matched
                .as_ref()
                .map(|m| format!("{:?}", m.strength).to_lowercase())
                .unwrap_or_else(|| "none".into()),
            source: if self.bridge.is_some() { "ai" } else { "literal" }.into(),
        }
        .emit();

        let active = session.active_frame();

        let Some(matched) = matched else {
            return match active {
                Some(frame) if frame.pending_variable.is_some() => Decision::Deliver,
                Some(frame) if frame.is_runnable() => Decision::Continue,
                _ => Decision::NotUnderstood,
            };
        };

        let Some(active) = active else {
            return Decision::Start {
                flow_id: matched.flow_id,
                call_type: matched.call_type,
            };
        };

        match matched.strength {
            IntentStrength::Weak => Decision::Confirm {
                flow_id: matched.flow_id,
                strength: IntentStrength::Weak,
                call_type: matched.call_type,
            },
            IntentStrength::Medium if active.financial => Decision::Confirm {
                flow_id: matched.flow_id,
                strength: IntentStrength::Medium,
                call_type: matched.call_type,
            },
            IntentStrength::Strong
                if matched.call_type == CallType::Reboot && active.financial =>
            {
                // Financial flows refuse reboot without explicit consent.
                Decision::Confirm {
                    flow_id: matched.flow_id,
                    strength: IntentStrength::Strong,
                    call_type: CallType::Reboot,
                }
            }
            _ => Decision::Interrupt {
                flow_id: matched.flow_id,
                call_type: matched.call_type,
            },
        }
    }

    // ── classification ─────────────────────────────────────────────

    /// Ask the AI bridge when present; fall back to the literal matcher
    /// when it is absent or returns something unusable.
    async fn classify(&self, utterance: &str) -> Option<IntentMatch> {
        if utterance.trim().is_empty() {
            return None;
        }

        if let Some(bridge) = &self.bridge {
            let flows: Vec<_> = self.flows.iter().collect();
            let instructions = classifier_instructions(&flows);
            match bridge.ai_fetch(&instructions, utterance).await {
                Ok(reply) => {
                    let parsed = parse_classifier_response(&reply)
                        .filter(|m| self.flow(&m.flow_id).is_ok());
                    if parsed.is_some() {
                        return parsed;
                    }
                    // A null verdict from the model is authoritative.
                    if reply.contains("flowId") {
                        return None;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ai bridge failed, using literal matcher");
                }
            }
        }

        self.literal_match(utterance)
    }

    /// Literal fallback: case-insensitive exact match of name/id/trigger
    /// is strong; substring match is medium. Ties: exact beats partial,
    /// longer matched token beats shorter, declaration order breaks the
    /// rest.
    pub(crate) fn literal_match(&self, utterance: &str) -> Option<IntentMatch> {
        let needle = utterance.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        let mut best_partial: Option<(usize, usize)> = None; // (token_len, flow index)

        for (order, flow) in self.flows.iter().enumerate() {
            for token in flow_tokens(flow) {
                match token {
                    MatchToken::Literal(text) => {
                        let text = text.to_lowercase();
                        if text == needle {
                            return Some(IntentMatch {
                                flow_id: flow.id.clone(),
                                strength: IntentStrength::Strong,
                                call_type: CallType::Call,
                            });
                        }
                        if needle.contains(&text) {
                            let candidate = (text.len(), order);
                            let better = match best_partial {
                                None => true,
                                Some((len, ord)) => {
                                    text.len() > len || (text.len() == len && order < ord)
                                }
                            };
                            if better {
                                best_partial = Some(candidate);
                            }
                        }
                    }
                    MatchToken::Pattern(pattern) => {
                        // Patterns were validated at construction.
                        let Ok(re) = regex::RegexBuilder::new(pattern)
                            .case_insensitive(true)
                            .build()
                        else {
                            continue;
                        };
                        if let Some(found) = re.find(&needle) {
                            if found.start() == 0 && found.end() == needle.len() {
                                return Some(IntentMatch {
                                    flow_id: flow.id.clone(),
                                    strength: IntentStrength::Strong,
                                    call_type: CallType::Call,
                                });
                            }
                            let matched_len = found.as_str().len();
                            let candidate = (matched_len, order);
                            let better = match best_partial {
                                None => true,
                                Some((len, ord)) => {
                                    matched_len > len || (matched_len == len && order < ord)
                                }
                            };
                            if better {
                                best_partial = Some(candidate);
                            }
                        }
                    }
                }
            }
        }

        best_partial.map(|(_, order)| IntentMatch {
            flow_id: self.flows[order].id.clone(),
            strength: IntentStrength::Medium,
            call_type: CallType::Call,
        })
    }
}

enum MatchToken<'a> {
    Literal(&'a str),
    Pattern(&'a str),
}

/// Name, id, and each trigger. Triggers wrapped in `/…/` are regex
/// patterns; everything else matches literally.
fn flow_tokens(flow: &cf_domain::FlowDefinition) -> impl Iterator<Item = MatchToken<'_>> {
    std::iter::once(MatchToken::Literal(flow.name.as_str()))
        .chain(std::iter::once(MatchToken::Literal(flow.id.as_str())))
        .chain(flow.triggers.iter().map(|trigger| {
            match trigger
                .strip_prefix('/')
                .and_then(|t| t.strip_suffix('/'))
            {
                Some(pattern) if !pattern.is_empty() => MatchToken::Pattern(pattern),
                _ => MatchToken::Literal(trigger.as_str()),
            }
        }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use cf_domain::FlowDefinition;
    use serde_json::json;

    fn flow(id: &str, name: &str, triggers: Vec<&str>) -> FlowDefinition {
        serde_json::from_value(json!({
            "id": id,
            "name": name,
            "steps": [{"type": "SAY", "message": "hi"}],
            "triggers": triggers
        }))
        .unwrap()
    }

    fn engine(flows: Vec<FlowDefinition>) -> Engine {
        Engine::builder(flows, vec![]).build().unwrap()
    }

    #[test]
    fn exact_match_is_strong() {
        let e = engine(vec![
            flow("greet", "Greet", vec!["greet"]),
            flow("order", "Track order", vec!["track order", "rastrear pedido"]),
        ]);
        let m = e.literal_match("Track Order").unwrap();
        assert_eq!(m.flow_id, "order");
        assert_eq!(m.strength, IntentStrength::Strong);
    }

    #[test]
    fn substring_match_is_medium() {
        let e = engine(vec![flow("order", "Track order", vec!["track order"])]);
        let m = e.literal_match("please track order 99 for me").unwrap();
        assert_eq!(m.flow_id, "order");
        assert_eq!(m.strength, IntentStrength::Medium);
    }

    #[test]
    fn longest_partial_token_wins() {
        let e = engine(vec![
            flow("a", "order", vec![]),
            flow("b", "cancel order", vec![]),
        ]);
        let m = e.literal_match("I want to cancel order 5").unwrap();
        assert_eq!(m.flow_id, "b");
    }

    #[test]
    fn declaration_order_breaks_remaining_ties() {
        let e = engine(vec![
            flow("first", "status x", vec![]),
            flow("second", "status y", vec![]),
        ]);
        // Both tokens are 8 chars; the earlier flow wins.
        let m = e.literal_match("tell me status x and status y").unwrap();
        assert_eq!(m.flow_id, "first");
    }

    #[test]
    fn regex_triggers_match() {
        let e = engine(vec![flow("order", "Orders", vec!["/track (my )?order/"])]);
        let full = e.literal_match("track my order").unwrap();
        assert_eq!(full.strength, IntentStrength::Strong);
        let partial = e.literal_match("can you track order now").unwrap();
        assert_eq!(partial.strength, IntentStrength::Medium);
    }

    #[test]
    fn no_match_returns_none() {
        let e = engine(vec![flow("greet", "Greet", vec![])]);
        assert!(e.literal_match("what's the weather").is_none());
        assert!(e.literal_match("   ").is_none());
    }

    #[test]
    fn affirmations_recognized() {
        for yes in ["yes", "Yes", " y ", "OK", "sure"] {
            assert!(is_affirmative(yes), "{yes} should be affirmative");
        }
        for no in ["no", "nope", "cancel", "maybe"] {
            assert!(!is_affirmative(no), "{no} should not be affirmative");
        }
    }

    #[tokio::test]
    async fn universal_commands_win_over_intents() {
        let e = engine(vec![flow("cancel-order", "cancel", vec!["cancel"])]);
        let session = e.init_session("u", "s");
        // Bare "cancel" is the universal command even though a flow
        // matches it literally.
        let decision = e.arbitrate("cancel", &session).await;
        assert_eq!(
            decision,
            Decision::Universal(UniversalCommand::Cancel)
        );
    }

    #[tokio::test]
    async fn idle_session_with_match_starts_flow() {
        let e = engine(vec![flow("greet", "Greet", vec!["greet"])]);
        let session = e.init_session("u", "s");
        let decision = e.arbitrate("greet", &session).await;
        assert_eq!(
            decision,
            Decision::Start {
                flow_id: "greet".into(),
                call_type: CallType::Call
            }
        );
    }

    #[tokio::test]
    async fn idle_session_without_match_is_not_understood() {
        let e = engine(vec![flow("greet", "Greet", vec![])]);
        let session = e.init_session("u", "s");
        assert_eq!(e.arbitrate("gibberish", &session).await, Decision::NotUnderstood);
    }
}
