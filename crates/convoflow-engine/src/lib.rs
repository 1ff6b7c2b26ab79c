//! Conversational flow runtime for Convoflow.
//!
//! A [`FlowEngine`] runs declarative [`FlowDefinition`]s as a stack of
//! frames kept in a host-owned [`Session`].  Each user [`Turn`] may start a
//! flow (by trigger phrase, classifier or explicit intent), answer a pending
//! SAY-GET, or interrupt the active flow with another one.  The interrupted
//! flow resumes with its pending prompt once the interrupting flow ends.
//!
//! ## Modules
//!
//! - [`flow`] -- Flow and step definitions.
//! - [`registry`] -- Lookup of flows by id or name.
//! - [`session`] -- Sessions and flow frames.
//! - [`interpreter`] -- Per-step semantics.
//! - [`engine`] -- The flow stack controller.
//! - [`intent`] -- Trigger phrases and the classifier seam.
//! - [`messages`] -- Localized engine messages.
//! - [`validation`] -- Static checks over definitions.
//! - [`config`] -- Limits and switches.
//! - [`error`] -- Engine error types.

pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod intent;
pub mod interpreter;
pub mod messages;
pub mod registry;
pub mod session;
pub mod turn;
pub mod validation;

pub use config::{ControlCommand, ControlCommands, EngineConfig};
pub use engine::{FlowEngine, FlowEngineBuilder};
pub use error::{EngineError, Result};
pub use flow::{
    CallType, FlowDefinition, FlowMetadata, LocalizedText, RiskLevel, StepDefinition, VariableScope, VariableSpec,
};
pub use intent::{DetectedIntent, IntentClassifier, IntentDetector, IntentSource, NoClassifier};
pub use messages::Messages;
pub use registry::FlowRegistry;
pub use session::{FlowFrame, FrameState, Session};
pub use turn::{ActivityResult, Role, Turn};
pub use validation::{Issue, Severity, ValidationReport, validate};
