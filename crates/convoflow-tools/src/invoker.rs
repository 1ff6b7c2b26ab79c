//! Tool invocation.
//!
//! [`ToolInvoker::invoke`] runs the full pipeline for one call:
//!
//! 1. resolve the definition,
//! 2. check the auth requirement,
//! 3. evaluate argument templates (or infer arguments from the scope),
//! 4. fill defaults and validate against the parameter schema,
//! 5. enforce the rate limit (nothing is dispatched when it is exceeded),
//! 6. dispatch with timeout and class-dependent retry,
//! 7. apply the response mapping,
//! 8. write the audit record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use convoflow_expr::{Evaluator, JsonMap, Scope, Value};

use crate::capability::{CapabilityTable, InvocationContext};
use crate::definition::{AuditLevel, Implementation, RegisteredTool, ToolRegistry};
use crate::error::{Result, ToolError};
use crate::http::{self, DEFAULT_TIMEOUT_MS, HttpTransport, ReqwestTransport, TransportError};
use crate::mapping::Mapper;
use crate::rate_limit::{QuotaSubject, RateLimiter};
use crate::retry::{RetryConfig, run_with_retry};

/// Executes tools from a [`ToolRegistry`].
#[derive(Clone)]
pub struct ToolInvoker {
    registry: ToolRegistry,
    capabilities: CapabilityTable,
    transport: Arc<dyn HttpTransport>,
    limiter: RateLimiter,
    evaluator: Evaluator,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl std::fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("tools", &self.registry.ids())
            .field("capabilities", &self.capabilities)
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ToolInvoker {
    /// An invoker using the `reqwest` transport and default retry policy.
    pub fn new(registry: ToolRegistry, capabilities: CapabilityTable, evaluator: Evaluator) -> Self {
        Self {
            registry,
            capabilities,
            transport: Arc::new(ReqwestTransport::new()),
            limiter: RateLimiter::new(),
            evaluator,
            retry: RetryConfig::default(),
            call_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Share rate-limit windows with another invoker.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Timeout for `local` and `mock` calls and for HTTP calls that declare
    /// none.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Invoke `tool_id`.
    ///
    /// `raw_args` values may be `{{...}}` templates evaluated against
    /// `scope`.  When `raw_args` is `None`, arguments are inferred: every
    /// declared parameter whose name resolves in `scope` is passed.
    pub async fn invoke(
        &self,
        tool_id: &str,
        raw_args: Option<&JsonMap>,
        scope: &Scope<'_>,
        ctx: &InvocationContext,
    ) -> Result<serde_json::Value> {
        let tool = self.registry.get(tool_id).ok_or_else(|| ToolError::NotFound {
            tool_id: tool_id.to_string(),
        })?;
        let start = Instant::now();
        let mut audited_args = None;
        let mut attempts = 0;

        let result: Result<serde_json::Value> = async {
            let security = &tool.definition.security;
            if security.auth_required && ctx.user_id.is_none() {
                return Err(ToolError::AuthRequired {
                    tool_id: tool_id.to_string(),
                });
            }

            let args = match raw_args {
                Some(raw) => self.evaluate_arguments(tool_id, raw, scope)?,
                None => self.infer_arguments(tool, scope),
            };
            let args = tool.schema.prepare(tool_id, args)?;
            audited_args = Some(args.clone());

            if let Some(limit) = &security.rate_limit {
                let subject = QuotaSubject {
                    session_id: &ctx.session_id,
                    user_id: ctx.user_id.as_deref(),
                };
                if !self.limiter.check(tool_id, limit, subject) {
                    return Err(ToolError::RateLimited {
                        tool_id: tool_id.to_string(),
                        requests: limit.requests,
                        window_ms: limit.window_ms,
                    });
                }
            }

            let budget = match &tool.definition.implementation {
                Implementation::Http(d) => d.retries.unwrap_or(self.retry.max_retries),
                _ => self.retry.max_retries,
            };
            let (payload, n) = run_with_retry(&self.retry, budget, |attempt| {
                tracing::debug!(tool = %tool_id, attempt, "dispatching tool call");
                self.dispatch(tool, &args, scope, ctx)
            })
            .await;
            attempts = n;
            let payload = payload?;

            match &tool.definition.response_mapping {
                Some(mapping) => Mapper::new(&self.evaluator)
                    .apply(mapping, &payload)
                    .map_err(|e| ToolError::Mapping {
                        tool_id: tool_id.to_string(),
                        reason: e.0,
                    }),
                None => Ok(payload),
            }
        }
        .await;

        audit(tool, ctx, audited_args.as_ref(), &result, attempts, start.elapsed());
        result
    }

    /// Evaluate argument templates against the scope.
    fn evaluate_arguments(&self, tool_id: &str, raw: &JsonMap, scope: &Scope<'_>) -> Result<JsonMap> {
        let mut args = JsonMap::with_capacity(raw.len());
        for (name, value) in raw {
            let evaluated = self
                .evaluator
                .evaluate_json(value, scope)
                .map_err(|source| ToolError::Arguments {
                    tool_id: tool_id.to_string(),
                    source,
                })?;
            if !matches!(evaluated, Value::Undefined) {
                args.insert(name.clone(), evaluated.to_json());
            }
        }
        Ok(args)
    }

    /// Pass every declared parameter that the scope defines.
    pub fn infer_arguments(&self, tool: &RegisteredTool, scope: &Scope<'_>) -> JsonMap {
        tool.schema
            .property_names()
            .into_iter()
            .filter_map(|name| {
                scope
                    .lookup(name)
                    .filter(|v| !v.is_nullish())
                    .map(|v| (name.to_string(), v.to_json()))
            })
            .collect()
    }

    async fn dispatch(
        &self,
        tool: &RegisteredTool,
        args: &JsonMap,
        scope: &Scope<'_>,
        ctx: &InvocationContext,
    ) -> Result<serde_json::Value> {
        let tool_id = tool.definition.id.as_str();
        match &tool.definition.implementation {
            Implementation::Local { capability } => {
                let cap = self
                    .capabilities
                    .get(capability)
                    .ok_or_else(|| ToolError::CapabilityMissing {
                        tool_id: tool_id.to_string(),
                        capability: capability.clone(),
                    })?;
                let call = cap.call(serde_json::Value::Object(args.clone()), ctx);
                match tokio::time::timeout(self.call_timeout, call).await {
                    Ok(result) => result.map_err(|e| e.into_tool_error(tool_id)),
                    Err(_elapsed) => Err(self.timeout_error(tool_id, self.call_timeout)),
                }
            }
            Implementation::Http(descriptor) => {
                let request = http::build_request(tool_id, descriptor, args, scope, &self.evaluator)?;
                let timeout = request.timeout;
                tracing::debug!(tool = %tool_id, method = %request.method, url = %request.url, "http tool call");
                let response = match tokio::time::timeout(timeout, self.transport.send(request)).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(TransportError::Timeout)) | Err(_) => {
                        return Err(self.timeout_error(tool_id, timeout));
                    }
                    Ok(Err(TransportError::Failed(reason))) => {
                        return Err(ToolError::Transport {
                            tool_id: tool_id.to_string(),
                            reason,
                        });
                    }
                };
                http::check_status(tool_id, response)
            }
            Implementation::Mock { payload } => {
                let scope = scope
                    .clone()
                    .bind("args", Value::from(serde_json::Value::Object(args.clone())));
                self.evaluator
                    .evaluate_json(payload, &scope)
                    .map(|v| v.to_json())
                    .map_err(|e| ToolError::Execution {
                        tool_id: tool_id.to_string(),
                        reason: e.to_string(),
                    })
            }
        }
    }

    fn timeout_error(&self, tool_id: &str, timeout: Duration) -> ToolError {
        ToolError::Timeout {
            tool_id: tool_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Emit the audit record for one invocation.
fn audit(
    tool: &RegisteredTool,
    ctx: &InvocationContext,
    args: Option<&JsonMap>,
    result: &Result<serde_json::Value>,
    attempts: u32,
    elapsed: Duration,
) {
    let level = tool.definition.security.audit_level;
    if level == AuditLevel::None {
        return;
    }
    let outcome = match result {
        Ok(_) => "success".to_string(),
        Err(e) => format!("{} ({})", e, e.class()),
    };
    let transaction = ctx.transaction_id.as_deref().unwrap_or("-");
    let user = ctx.user_id.as_deref().unwrap_or("-");
    let elapsed_ms = elapsed.as_millis() as u64;
    if level == AuditLevel::Full {
        let args = args
            .map(|a| serde_json::Value::Object(a.clone()).to_string())
            .unwrap_or_default();
        tracing::info!(
            target: "convoflow::audit",
            tool = %tool.definition.id,
            session = %ctx.session_id,
            user,
            transaction,
            attempts,
            elapsed_ms,
            args = %args,
            outcome = %outcome,
            "tool invoked"
        );
    } else {
        tracing::info!(
            target: "convoflow::audit",
            tool = %tool.definition.id,
            session = %ctx.session_id,
            user,
            transaction,
            attempts,
            elapsed_ms,
            outcome = %outcome,
            "tool invoked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use serde_json::json;

    fn invoker(tools: serde_json::Value, caps: CapabilityTable) -> ToolInvoker {
        let registry = ToolRegistry::from_json(&tools.to_string()).unwrap();
        ToolInvoker::new(registry, caps, Evaluator::default()).with_retry(RetryConfig::immediate(2))
    }

    #[tokio::test]
    async fn local_tool_with_template_args() {
        let caps = CapabilityTable::new().with_fn("greet", |args| {
            Ok(json!({"text": format!("hi {}", args["name"].as_str().unwrap_or("?"))}))
        });
        let inv = invoker(
            json!([{"id": "greet", "implementation": {"type": "local", "capability": "greet"},
                    "responseMapping": {"type": "jsonPath", "path": "text"}}]),
            caps,
        );
        let locals = json!({"first": "Ada"}).as_object().cloned().unwrap();
        let scope = Scope::new().with_locals(&locals);
        let raw = json!({"name": "{{first}}"}).as_object().cloned().unwrap();
        let out = inv
            .invoke("greet", Some(&raw), &scope, &InvocationContext::new("s1"))
            .await
            .unwrap();
        assert_eq!(out, json!("hi Ada"));
    }

    #[tokio::test]
    async fn arguments_are_inferred_from_scope() {
        let caps = CapabilityTable::new().with_fn("echo", Ok);
        let inv = invoker(
            json!([{"id": "echo", "implementation": {"type": "local", "capability": "echo"},
                    "parameters": {"type": "object", "properties": {"orderId": {"type": "string"}, "other": {}}}}]),
            caps,
        );
        let locals = json!({"orderId": "A1", "unrelated": 1}).as_object().cloned().unwrap();
        let scope = Scope::new().with_locals(&locals);
        let out = inv
            .invoke("echo", None, &scope, &InvocationContext::new("s1"))
            .await
            .unwrap();
        assert_eq!(out, json!({"orderId": "A1"}));
    }

    #[tokio::test]
    async fn unknown_tool_and_missing_capability() {
        let inv = invoker(
            json!([{"id": "x", "implementation": {"type": "local", "capability": "nope"}}]),
            CapabilityTable::new(),
        );
        let ctx = InvocationContext::new("s1");
        let err = inv.invoke("missing", None, &Scope::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
        let err = inv.invoke("x", None, &Scope::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::CapabilityMissing { .. }));
    }

    #[tokio::test]
    async fn auth_required_needs_a_user() {
        let inv = invoker(
            json!([{"id": "m", "implementation": {"type": "mock", "payload": 1},
                    "security": {"authRequired": true}}]),
            CapabilityTable::new(),
        );
        let err = inv
            .invoke("m", None, &Scope::new(), &InvocationContext::new("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::AuthRequired { .. }));
        let ok = inv
            .invoke("m", None, &Scope::new(), &InvocationContext::new("s1").with_user("u1"))
            .await
            .unwrap();
        assert_eq!(ok, json!(1));
    }

    #[tokio::test]
    async fn rejected_capability_is_not_retried() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let caps = CapabilityTable::new().with_fn("strict", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Rejected("bad input".into()))
        });
        let inv = invoker(
            json!([{"id": "strict", "implementation": {"type": "local", "capability": "strict"}}]),
            caps,
        );
        let err = inv
            .invoke("strict", None, &Scope::new(), &InvocationContext::new("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Rejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
