//! Integration tests for the convoflow-tools crate.
//!
//! HTTP tools run against a scripted in-memory transport, so retry, rate
//! limiting and failure classification are checked without any network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoflow_expr::{Evaluator, JsonMap, Scope};
use convoflow_tools::{
    CapabilityTable, FailureClass, HttpRequest, HttpResponse, HttpTransport, InvocationContext,
    RetryConfig, ToolError, ToolInvoker, ToolRegistry, TransportError,
};
use serde_json::json;

/// Replays scripted responses and records every request.
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn ok(body: serde_json::Value) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse { status: 200, body })
    }

    fn status(status: u16) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            body: json!({"error": "x"}),
        })
    }

    fn sent(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse { status: 200, body: json!({}) }))
    }
}

fn invoker(tools: serde_json::Value, transport: Arc<ScriptedTransport>) -> ToolInvoker {
    let registry = ToolRegistry::from_json(&tools.to_string()).unwrap();
    ToolInvoker::new(registry, CapabilityTable::new(), Evaluator::default())
        .with_transport(transport)
        .with_retry(RetryConfig::immediate(2))
}

fn args(v: serde_json::Value) -> JsonMap {
    v.as_object().cloned().unwrap()
}

fn order_tool(extra: serde_json::Value) -> serde_json::Value {
    let mut tool = json!({
        "id": "order_status",
        "parameters": {
            "type": "object",
            "properties": {"orderId": {"type": "string", "pattern": "^[0-9]+$"}},
            "required": ["orderId"]
        },
        "implementation": {
            "type": "http",
            "url": "https://shop.test/orders/{orderId}",
            "headers": {"Authorization": "Bearer {{apiToken}}"}
        },
        "responseMapping": {
            "type": "object",
            "fields": {
                "status": "$.order.status",
                "total": {"path": "order.lines", "transform": {"type": "sum", "field": "amount"}}
            }
        }
    });
    if let (Some(tool), Some(extra)) = (tool.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            tool.insert(k.clone(), v.clone());
        }
    }
    json!([tool])
}

// ═══════════════════════════════════════════════════════════════════════
//  Dispatch and mapping
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn http_tool_end_to_end() {
    let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(json!({
        "order": {"status": "shipped", "lines": [{"amount": 10}, {"amount": 5.5}]}
    }))]);
    let inv = invoker(order_tool(json!({})), Arc::clone(&transport));
    let globals = args(json!({"apiToken": "secret"}));
    let scope = Scope::new().with_globals(&globals);

    let out = inv
        .invoke(
            "order_status",
            Some(&args(json!({"orderId": "1042"}))),
            &scope,
            &InvocationContext::new("s1"),
        )
        .await
        .unwrap();

    assert_eq!(out, json!({"status": "shipped", "total": 15.5}));
    let requests = transport.requests.lock().unwrap();
    assert_eq!(requests[0].url.as_str(), "https://shop.test/orders/1042");
    assert_eq!(
        requests[0].headers,
        vec![("Authorization".to_string(), "Bearer secret".to_string())]
    );
}

#[tokio::test]
async fn schema_violation_is_unrecoverable_and_not_dispatched() {
    let transport = ScriptedTransport::new(vec![]);
    let inv = invoker(order_tool(json!({})), Arc::clone(&transport));
    let err = inv
        .invoke(
            "order_status",
            Some(&args(json!({"orderId": "abc"}))),
            &Scope::new(),
            &InvocationContext::new("s1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Validation { .. }));
    assert_eq!(err.class(), FailureClass::Unrecoverable);
    assert_eq!(transport.sent(), 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Rate limiting
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn third_call_within_window_is_rate_limited_without_dispatch() {
    let transport = ScriptedTransport::new(vec![]);
    let inv = invoker(
        order_tool(json!({
            "responseMapping": null,
            "security": {"rateLimit": {"requests": 2, "window": 60000}}
        })),
        Arc::clone(&transport),
    );
    let ctx = InvocationContext::new("s1");
    let a = args(json!({"orderId": "1"}));

    inv.invoke("order_status", Some(&a), &Scope::new(), &ctx).await.unwrap();
    inv.invoke("order_status", Some(&a), &Scope::new(), &ctx).await.unwrap();
    let err = inv
        .invoke("order_status", Some(&a), &Scope::new(), &ctx)
        .await
        .unwrap_err();

    assert!(err.is_rate_limited());
    assert_eq!(transport.sent(), 2);
}

// ═══════════════════════════════════════════════════════════════════════
//  Failure classification and retry
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn server_errors_are_retried_then_surface_as_recoverable() {
    let transport = ScriptedTransport::new(vec![
        ScriptedTransport::status(503),
        ScriptedTransport::status(502),
        ScriptedTransport::status(500),
    ]);
    let inv = invoker(order_tool(json!({})), Arc::clone(&transport));
    let err = inv
        .invoke(
            "order_status",
            Some(&args(json!({"orderId": "1"}))),
            &Scope::new(),
            &InvocationContext::new("s1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Server { status: 500, .. }));
    assert_eq!(err.class(), FailureClass::Recoverable);
    // One attempt plus two retries.
    assert_eq!(transport.sent(), 3);
}

#[tokio::test]
async fn transient_failure_recovers() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Timeout),
        ScriptedTransport::ok(json!({"order": {"status": "ok", "lines": []}})),
    ]);
    let inv = invoker(order_tool(json!({})), Arc::clone(&transport));
    let out = inv
        .invoke(
            "order_status",
            Some(&args(json!({"orderId": "1"}))),
            &Scope::new(),
            &InvocationContext::new("s1"),
        )
        .await
        .unwrap();
    assert_eq!(out["status"], json!("ok"));
    assert_eq!(transport.sent(), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let transport = ScriptedTransport::new(vec![ScriptedTransport::status(404)]);
    let inv = invoker(order_tool(json!({})), Arc::clone(&transport));
    let err = inv
        .invoke(
            "order_status",
            Some(&args(json!({"orderId": "1"}))),
            &Scope::new(),
            &InvocationContext::new("s1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Client { status: 404, .. }));
    assert_eq!(err.class(), FailureClass::Unrecoverable);
    assert_eq!(transport.sent(), 1);
}

/// A transport that never answers in time.
struct SlowTransport;

#[async_trait]
impl HttpTransport for SlowTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(HttpResponse {
            status: 200,
            body: json!({}),
        })
    }
}

#[tokio::test]
async fn slow_calls_time_out() {
    let tools = json!([{
        "id": "slow",
        "implementation": {"type": "http", "url": "https://slow.test/", "timeoutMs": 20, "retries": 0}
    }]);
    let registry = ToolRegistry::from_json(&tools.to_string()).unwrap();
    let inv = ToolInvoker::new(registry, CapabilityTable::new(), Evaluator::default())
        .with_transport(Arc::new(SlowTransport))
        .with_retry(RetryConfig::immediate(0));
    let err = inv
        .invoke("slow", None, &Scope::new(), &InvocationContext::new("s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Timeout { timeout_ms: 20, .. }));
    assert_eq!(err.class(), FailureClass::Recoverable);
}
