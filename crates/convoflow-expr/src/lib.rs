//! Sandboxed template and expression evaluator for Convoflow.
//!
//! Flow definitions embed dynamic values as `{{...}}` templates and as
//! free-standing conditions.  Both are evaluated here, in two phases:
//!
//! 1. **Substitution** ([`template`]): `{{identifier(.identifier)*}}` tokens
//!    are resolved by pure lookup against a [`Scope`] (flow-local, then
//!    global, then session cargo).  Resolved values are spliced as typed
//!    slots, never as source text.
//! 2. **Evaluation** ([`eval`]): the remaining source is screened against a
//!    fixed deny-list ([`security`]), tokenized ([`lexer`]), parsed by a
//!    recursive-descent parser ([`parser`]) into an [`ast::Expr`], checked
//!    against the active [`SecurityLevel`], and interpreted by a
//!    tree-walker restricted to the whitelisted operators and
//!    [`methods`].
//!
//! Nothing here ever hands source text to a host-language evaluator.
//!
//! ## Modules
//!
//! - [`value`] -- The runtime [`Value`] model and the numeric-parse rule.
//! - [`scope`] -- Variable resolution layers.
//! - [`functions`] -- Host-registered pure functions.
//! - [`error`] -- [`EvalError`] and its reason codes.

pub mod ast;
pub mod error;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod methods;
pub mod parser;
pub mod scope;
pub mod security;
pub mod template;
pub mod value;

pub use error::{EvalError, EvalErrorCode, Result};
pub use eval::Evaluator;
pub use functions::{FunctionTable, HostFunction};
pub use scope::{JsonMap, Scope};
pub use security::SecurityLevel;
pub use template::{Segment, Substitution};
pub use value::Value;
