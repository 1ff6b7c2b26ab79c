//! Engine error types.
//!
//! Structural errors (unknown flows, unmatched branches, runaway recursion)
//! end the active frame and trigger recovery.  Tool and expression errors
//! normally never reach this type: they are handled in place by the step
//! interpreter.

use convoflow_expr::EvalError;
use convoflow_tools::ToolError;

/// Unified error type for the flow engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Flow structure ------------------------------------------------------
    /// A FLOW step, intent or recovery setting named an unknown flow.
    #[error("flow not found: {flow}")]
    FlowNotFound { flow: String },

    /// A SWITCH or CASE step matched no branch and declares no default.
    #[error("no branch of {step} in flow `{flow}` matched `{value}`")]
    BranchNotMatched {
        flow: String,
        step: String,
        value: String,
    },

    /// A flow appears in the active chain more often than allowed.
    #[error("circular flow reference: {chain}")]
    CircularFlowReference { chain: String },

    /// Pushing another frame would exceed the configured stack depth.
    #[error("flow stack overflow (max depth {max_depth})")]
    StackOverflow { max_depth: usize },

    /// A single turn executed more steps than allowed.
    #[error("step budget of {limit} exceeded in one turn")]
    StepBudgetExceeded { limit: usize },

    // -- Session -------------------------------------------------------------
    /// The session handed back by the host is not in a resumable shape.
    #[error("invalid session: {reason}")]
    InvalidSession { reason: String },

    // -- Configuration -------------------------------------------------------
    /// Flow definitions or engine configuration could not be loaded.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The intent callback failed.
    #[error("intent classification failed: {reason}")]
    Intent { reason: String },

    // -- Upstream crate errors -----------------------------------------------
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("expression error: {0}")]
    Expression(#[from] EvalError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error ends the active frame and triggers recovery.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::FlowNotFound { .. }
                | Self::BranchNotMatched { .. }
                | Self::CircularFlowReference { .. }
                | Self::StackOverflow { .. }
                | Self::StepBudgetExceeded { .. }
                | Self::Expression(_)
        )
    }
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
