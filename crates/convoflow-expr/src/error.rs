//! Expression error types.
//!
//! Every failure in the evaluator surfaces as an [`EvalError`].  Callers that
//! need to branch on the kind of failure (surface it, substitute a fallback,
//! or fail the step) use [`EvalError::code`] rather than matching on message
//! text.

use serde::{Deserialize, Serialize};

/// Stable reason code attached to every [`EvalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalErrorCode {
    /// The expression hit the deny-list or the security policy.
    Blocked,
    /// The expression could not be tokenized or parsed.
    Syntax,
    /// A member was read from `undefined` or `null`.
    UndefinedAccess,
    /// An operator or method was applied to operands of the wrong type.
    TypeMismatch,
    /// A numeric operand failed to parse, or the result was not finite.
    Arithmetic,
    /// Division or remainder by zero.
    DivisionByZero,
    /// A whitelisted function received an argument it cannot accept.
    InvalidArgument,
}

impl std::fmt::Display for EvalErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Blocked => "blocked",
            Self::Syntax => "syntax",
            Self::UndefinedAccess => "undefined_access",
            Self::TypeMismatch => "type_mismatch",
            Self::Arithmetic => "arithmetic",
            Self::DivisionByZero => "division_by_zero",
            Self::InvalidArgument => "invalid_argument",
        };
        f.write_str(s)
    }
}

/// Unified error type for expression evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// The expression matched a deny-list pattern or used a construct the
    /// active security level does not admit.  No partial output is produced.
    #[error("expression blocked: {reason}")]
    Blocked { reason: String },

    /// Tokenizing or parsing failed.
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    /// A property was read from `undefined` or `null`.
    #[error("cannot read property `{property}` of {target}")]
    UndefinedAccess { property: String, target: String },

    /// Operands have types the operator does not accept.
    #[error("type mismatch: {reason}")]
    TypeMismatch { reason: String },

    /// Numeric parsing failed or the result is not a finite number.
    #[error("arithmetic error: {reason}")]
    Arithmetic { reason: String },

    /// Division or remainder with a zero divisor.
    #[error("division by zero")]
    DivisionByZero,

    /// A whitelisted function or method rejected one of its arguments.
    #[error("invalid argument for `{function}`: {reason}")]
    InvalidArgument { function: String, reason: String },
}

impl EvalError {
    /// The stable reason code for this error.
    pub fn code(&self) -> EvalErrorCode {
        match self {
            Self::Blocked { .. } => EvalErrorCode::Blocked,
            Self::Syntax { .. } => EvalErrorCode::Syntax,
            Self::UndefinedAccess { .. } => EvalErrorCode::UndefinedAccess,
            Self::TypeMismatch { .. } => EvalErrorCode::TypeMismatch,
            Self::Arithmetic { .. } => EvalErrorCode::Arithmetic,
            Self::DivisionByZero => EvalErrorCode::DivisionByZero,
            Self::InvalidArgument { .. } => EvalErrorCode::InvalidArgument,
        }
    }

    /// Whether this error came from the security deny-list or policy.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    pub(crate) fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked {
            reason: reason.into(),
        }
    }

    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn type_mismatch(reason: impl Into<String>) -> Self {
        Self::TypeMismatch {
            reason: reason.into(),
        }
    }

    pub(crate) fn arithmetic(reason: impl Into<String>) -> Self {
        Self::Arithmetic {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(function: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the expression crate.
pub type Result<T> = std::result::Result<T, EvalError>;
