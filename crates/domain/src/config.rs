use serde::{Deserialize, Serialize};

use crate::tool::RetryPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Host-tunable knobs. Immutable once the engine is constructed; every
/// field has a sane default so `EngineConfig::default()` is a working
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum steps evaluated in a single turn before the run loop aborts
    /// with a step-budget error. Guards against cyclic flow definitions.
    #[serde(default = "d_step_budget")]
    pub step_budget: u32,

    /// Maximum frames on any one stack. Deliberate flow recursion is
    /// allowed up to this depth.
    #[serde(default = "d_stack_depth_budget")]
    pub stack_depth_budget: usize,

    /// Per-`(session, tool)` rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// HTTP tool defaults, overridable per tool in the catalog.
    #[serde(default)]
    pub http: HttpConfig,

    /// Flow dispatched when a financial flow fails and rolls back.
    #[serde(default, rename = "recoveryFlow")]
    pub recovery_flow: Option<String>,

    /// Default language for message-registry lookups.
    #[serde(default = "d_language")]
    pub language: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_budget: d_step_budget(),
            stack_depth_budget: d_stack_depth_budget(),
            rate_limit: RateLimitConfig::default(),
            http: HttpConfig::default(),
            recovery_flow: None,
            language: d_language(),
        }
    }
}

fn d_step_budget() -> u32 {
    1000
}

fn d_stack_depth_budget() -> usize {
    32
}

fn d_language() -> String {
    "en".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token-bucket parameters applied per `(session, tool)` pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (maximum burst).
    #[serde(default = "d_rl_capacity")]
    pub capacity: u32,

    /// Tokens restored per second.
    #[serde(default = "d_rl_refill", rename = "refillPerSec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: d_rl_capacity(),
            refill_per_sec: d_rl_refill(),
        }
    }
}

fn d_rl_capacity() -> u32 {
    5
}

fn d_rl_refill() -> f64 {
    1.0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Applied when a tool declares no `timeoutMs`.
    #[serde(default = "d_timeout_ms", rename = "defaultTimeoutMs")]
    pub default_timeout_ms: u64,

    /// Applied when a tool declares no retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: d_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

fn d_timeout_ms() -> u64 {
    10_000
}
