//! Tool invocation for Convoflow.
//!
//! A tool is declared by a [`ToolDefinition`] and executed by a
//! [`ToolInvoker`] as either a host [`Capability`], an HTTP call through an
//! [`HttpTransport`], or a canned mock payload.  Raw results are reshaped by
//! the declarative [`ResponseMapping`] DSL.  Every failure is a
//! [`ToolError`] with a deterministic [`FailureClass`] that drives retries
//! and the engine's default failure handling.

pub mod capability;
pub mod definition;
pub mod error;
pub mod http;
pub mod invoker;
pub mod mapping;
pub mod rate_limit;
pub mod retry;
pub mod schema;

pub use capability::{Capability, CapabilityTable, FnCapability, InvocationContext};
pub use definition::{
    AuditLevel, HttpDescriptor, Implementation, RateLimitScope, RateLimitSpec, SecurityPolicy,
    ToolDefinition, ToolRegistry,
};
pub use error::{CapabilityError, FailureClass, Result, ToolError};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use invoker::ToolInvoker;
pub use mapping::{FieldMapping, Mapper, ResponseMapping, Transform};
pub use rate_limit::RateLimiter;
pub use retry::RetryConfig;
