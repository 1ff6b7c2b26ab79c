//! Tool error types.
//!
//! Every invocation failure surfaces as a [`ToolError`].  Each variant maps
//! deterministically to a [`FailureClass`], which decides both how many
//! times the invoker retries and which default failure handling the engine
//! applies when a step declares none.

use convoflow_expr::EvalError;
use serde::{Deserialize, Serialize};

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, timeout or server-side failure.  Retried up to the tool's
    /// retry budget.
    Recoverable,
    /// The request itself is wrong (bad arguments, 4xx).  Never retried.
    Unrecoverable,
    /// Anything else.  Retried once.
    Generic,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recoverable => write!(f, "recoverable"),
            Self::Unrecoverable => write!(f, "unrecoverable"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Unified error type for tool invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    // -- Resolution errors ---------------------------------------------------
    /// No tool with this id is registered.
    #[error("tool not found: `{tool_id}`")]
    NotFound { tool_id: String },

    /// A tool definition is malformed (bad schema, duplicate id).
    #[error("invalid definition for tool `{tool_id}`: {reason}")]
    Definition { tool_id: String, reason: String },

    /// A `local` tool names a capability the host did not register.
    #[error("capability `{capability}` for tool `{tool_id}` is not registered")]
    CapabilityMissing { tool_id: String, capability: String },

    // -- Argument errors -----------------------------------------------------
    /// An argument template failed to evaluate.
    #[error("argument for tool `{tool_id}` failed to evaluate: {source}")]
    Arguments {
        tool_id: String,
        #[source]
        source: EvalError,
    },

    /// Arguments do not satisfy the tool's parameter schema.
    #[error("invalid arguments for tool `{tool_id}`: {reason}")]
    Validation { tool_id: String, reason: String },

    // -- Policy errors -------------------------------------------------------
    /// The tool requires an authenticated user and none was supplied.
    #[error("tool `{tool_id}` requires an authenticated user")]
    AuthRequired { tool_id: String },

    /// The rate-limit quota is exhausted.  Nothing was dispatched.
    #[error("rate limit exceeded for tool `{tool_id}`: {requests} per {window_ms}ms")]
    RateLimited {
        tool_id: String,
        requests: u32,
        window_ms: u64,
    },

    // -- Dispatch errors -----------------------------------------------------
    /// The request could not be delivered.
    #[error("transport error calling tool `{tool_id}`: {reason}")]
    Transport { tool_id: String, reason: String },

    /// The call exceeded its timeout.
    #[error("tool `{tool_id}` timed out after {timeout_ms}ms")]
    Timeout { tool_id: String, timeout_ms: u64 },

    /// The remote answered with a 5xx status.
    #[error("tool `{tool_id}` failed with server status {status}")]
    Server { tool_id: String, status: u16 },

    /// The remote answered with a 4xx status.
    #[error("tool `{tool_id}` rejected the request with status {status}: {body}")]
    Client {
        tool_id: String,
        status: u16,
        body: String,
    },

    /// A local capability refused the arguments.
    #[error("tool `{tool_id}` rejected the request: {reason}")]
    Rejected { tool_id: String, reason: String },

    /// Any other execution failure.
    #[error("tool `{tool_id}` failed: {reason}")]
    Execution { tool_id: String, reason: String },

    // -- Mapping errors ------------------------------------------------------
    /// The response mapping could not be applied to the payload.
    #[error("response mapping for tool `{tool_id}` failed: {reason}")]
    Mapping { tool_id: String, reason: String },
}

impl ToolError {
    /// The failure class.  Pure: depends only on the variant.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Server { .. } => {
                FailureClass::Recoverable
            }
            Self::Arguments { .. }
            | Self::Validation { .. }
            | Self::AuthRequired { .. }
            | Self::RateLimited { .. }
            | Self::Client { .. }
            | Self::Rejected { .. } => FailureClass::Unrecoverable,
            Self::NotFound { .. }
            | Self::Definition { .. }
            | Self::CapabilityMissing { .. }
            | Self::Execution { .. }
            | Self::Mapping { .. } => FailureClass::Generic,
        }
    }

    /// The id of the tool that failed.
    pub fn tool_id(&self) -> &str {
        match self {
            Self::NotFound { tool_id }
            | Self::Definition { tool_id, .. }
            | Self::CapabilityMissing { tool_id, .. }
            | Self::Arguments { tool_id, .. }
            | Self::Validation { tool_id, .. }
            | Self::AuthRequired { tool_id }
            | Self::RateLimited { tool_id, .. }
            | Self::Transport { tool_id, .. }
            | Self::Timeout { tool_id, .. }
            | Self::Server { tool_id, .. }
            | Self::Client { tool_id, .. }
            | Self::Rejected { tool_id, .. }
            | Self::Execution { tool_id, .. }
            | Self::Mapping { tool_id, .. } => tool_id,
        }
    }

    /// Whether this is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Error returned by a host capability.  The variant chooses the failure
/// class of the resulting [`ToolError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// Temporary failure; the invoker may retry.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// The arguments were rejected; retrying cannot help.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    pub(crate) fn into_tool_error(self, tool_id: &str) -> ToolError {
        let tool_id = tool_id.to_string();
        match self {
            Self::Unavailable(reason) => ToolError::Transport { tool_id, reason },
            Self::Rejected(reason) => ToolError::Rejected { tool_id, reason },
            Self::Failed(reason) => ToolError::Execution { tool_id, reason },
        }
    }
}

/// Convenience alias used throughout the tools crate.
pub type Result<T> = std::result::Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_deterministic() {
        let id = || "t".to_string();
        let cases = [
            (ToolError::Timeout { tool_id: id(), timeout_ms: 5 }, FailureClass::Recoverable),
            (ToolError::Server { tool_id: id(), status: 503 }, FailureClass::Recoverable),
            (
                ToolError::Transport { tool_id: id(), reason: "reset".into() },
                FailureClass::Recoverable,
            ),
            (
                ToolError::Client { tool_id: id(), status: 404, body: String::new() },
                FailureClass::Unrecoverable,
            ),
            (
                ToolError::Validation { tool_id: id(), reason: "x".into() },
                FailureClass::Unrecoverable,
            ),
            (
                ToolError::Execution { tool_id: id(), reason: "x".into() },
                FailureClass::Generic,
            ),
            (
                ToolError::Mapping { tool_id: id(), reason: "x".into() },
                FailureClass::Generic,
            ),
        ];
        for (err, class) in cases {
            assert_eq!(err.class(), class, "{err}");
            assert_eq!(err.tool_id(), "t");
        }
    }

    #[test]
    fn capability_errors_map_to_classes() {
        assert_eq!(
            CapabilityError::Unavailable("down".into()).into_tool_error("t").class(),
            FailureClass::Recoverable
        );
        assert_eq!(
            CapabilityError::Rejected("bad".into()).into_tool_error("t").class(),
            FailureClass::Unrecoverable
        );
        assert_eq!(
            CapabilityError::Failed("boom".into()).into_tool_error("t").class(),
            FailureClass::Generic
        );
    }
}
