/// Shared error type used across all ConvoFlow crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An expression failed a static safety check and was never evaluated.
    #[error("expression rejected: {0}")]
    ExpressionRejected(String),

    /// An expression passed static checks but failed during evaluation.
    #[error("expression runtime error: {0}")]
    ExpressionRuntime(String),

    #[error("template syntax: {0}")]
    TemplateSyntax(String),

    #[error("transform invalid: {0}")]
    TransformInvalid(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Transport-level HTTP failure (connect, DNS, protocol).
    #[error("HTTP: {0}")]
    Http(String),

    /// The server answered with a non-success status.
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("step budget exceeded: {0}")]
    StepBudgetExceeded(String),

    /// Construction-time catalog validation failure. Carries every offense
    /// found, not just the first.
    #[error("flow catalog invalid: {}", .0.join("; "))]
    CatalogInvalid(Vec<String>),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether a tool invocation hitting this error may be retried.
    ///
    /// Transport failures, timeouts, 5xx, 408 and 429 are transient.
    /// Every other 4xx is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout(_) => true,
            Error::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }

    /// Whether this error came from the network rather than the payload.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Timeout(_))
    }

    /// Stable short name for logs and transaction events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::ExpressionRejected(_) => "expressionRejected",
            Error::ExpressionRuntime(_) => "expressionRuntime",
            Error::TemplateSyntax(_) => "templateSyntax",
            Error::TransformInvalid(_) => "transformInvalid",
            Error::SchemaValidation(_) => "schemaValidation",
            Error::ToolNotFound(_) => "toolNotFound",
            Error::Http(_) => "httpTransport",
            Error::HttpStatus { .. } => "httpStatus",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::FlowNotFound(_) => "flowNotFound",
            Error::StepBudgetExceeded(_) => "stepBudgetExceeded",
            Error::CatalogInvalid(_) => "catalogInvalid",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
