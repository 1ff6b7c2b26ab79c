//! HTTP dispatch for `http` tools.
//!
//! Request building is separate from sending: [`build_request`] turns an
//! [`HttpDescriptor`] plus evaluated arguments into an [`HttpRequest`], and
//! an [`HttpTransport`] performs it.  The default transport uses `reqwest`;
//! tests and hosts with their own networking supply another implementation.
//!
//! Two placeholder syntaxes coexist in the URL: `{name}` is a path
//! parameter (percent-encoded), `{{expr}}` is an ordinary template.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use convoflow_expr::{Evaluator, JsonMap, Scope, Value};

use crate::definition::HttpDescriptor;
use crate::error::{Result, ToolError};

/// Default request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Maximum response body size read by [`ReqwestTransport`] (1 MB).
const MAX_BODY_BYTES: usize = 1_024 * 1_024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A fully built request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: reqwest::Method,
    pub url: url::Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

/// A received response.  `body` is parsed JSON, or a JSON string when the
/// payload is not JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Delivery failure before any status was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

/// Sends HTTP requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

/// Build a request from a descriptor.
///
/// Templates see the flow scope plus every argument as a top-level name and
/// the whole argument object as `args`.
pub fn build_request(
    tool_id: &str,
    descriptor: &HttpDescriptor,
    args: &JsonMap,
    scope: &Scope<'_>,
    evaluator: &Evaluator,
) -> Result<HttpRequest> {
    let mut scope = scope
        .clone()
        .bind("args", Value::from(serde_json::Value::Object(args.clone())));
    for (name, value) in args {
        scope = scope.bind(name.clone(), Value::from(value));
    }
    let eval_err = |source| ToolError::Arguments {
        tool_id: tool_id.to_string(),
        source,
    };
    let invalid = |reason: String| ToolError::Validation {
        tool_id: tool_id.to_string(),
        reason,
    };

    let method = parse_method(&descriptor.method)
        .ok_or_else(|| invalid(format!("unsupported HTTP method `{}`", descriptor.method)))?;

    // Path parameters first, so substituted values never pass through the
    // template engine.
    let with_path = substitute_path_params(&descriptor.url, |name| {
        let value = match descriptor.path_params.get(name) {
            Some(template) => evaluator.evaluate(template, &scope).map_err(eval_err)?,
            None => args.get(name).map(Value::from).unwrap_or_default(),
        };
        if value.is_nullish() {
            return Err(invalid(format!("missing path parameter `{name}`")));
        }
        Ok(urlencoding::encode(&value.display()).into_owned())
    })?;
    let rendered = evaluator
        .evaluate_template(&with_path, &scope)
        .map_err(eval_err)?;
    let mut url = url::Url::parse(&rendered).map_err(|e| invalid(format!("invalid URL `{rendered}`: {e}")))?;

    if !descriptor.query_params.is_empty() {
        let mut pairs = Vec::new();
        for (key, template) in &descriptor.query_params {
            match evaluator.evaluate(template, &scope).map_err(eval_err)? {
                Value::Undefined | Value::Null => {}
                Value::Array(items) => {
                    pairs.extend(items.iter().map(|v| (key.clone(), v.display())));
                }
                other => pairs.push((key.clone(), other.display())),
            }
        }
        url.query_pairs_mut().extend_pairs(pairs);
    }
    if let Some(custom) = &descriptor.custom_query {
        let custom = evaluator.evaluate_template(custom, &scope).map_err(eval_err)?;
        let custom = custom.trim_start_matches(['?', '&']);
        if !custom.is_empty() {
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{custom}"),
                _ => custom.to_string(),
            };
            url.set_query(Some(&query));
        }
    }

    let mut headers = Vec::with_capacity(descriptor.headers.len());
    for (name, template) in &descriptor.headers {
        let value = evaluator.evaluate_template(template, &scope).map_err(eval_err)?;
        headers.push((name.clone(), value));
    }

    let body = descriptor
        .body
        .as_ref()
        .map(|b| evaluator.evaluate_json(b, &scope).map(|v| v.to_json()))
        .transpose()
        .map_err(eval_err)?;

    Ok(HttpRequest {
        method,
        url,
        headers,
        body,
        timeout: Duration::from_millis(descriptor.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
    })
}

/// Replace `{name}` placeholders, leaving `{{...}}` templates intact.
fn substitute_path_params<F>(template: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(inner) = tail.strip_prefix("{{") {
            let end = inner.find("}}").map_or(inner.len(), |i| i + 2);
            out.push_str("{{");
            out.push_str(&inner[..end]);
            rest = &inner[end..];
            continue;
        }
        match tail[1..].find('}') {
            Some(close) if is_param_name(&tail[1..=close]) => {
                out.push_str(&resolve(&tail[1..=close])?);
                rest = &tail[close + 2..];
            }
            _ => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_param_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse an HTTP method string into a `reqwest::Method`.
/// Returns `None` if the method is not supported.
fn parse_method(method: &str) -> Option<reqwest::Method> {
    match method.to_uppercase().as_str() {
        "GET" => Some(reqwest::Method::GET),
        "POST" => Some(reqwest::Method::POST),
        "PUT" => Some(reqwest::Method::PUT),
        "PATCH" => Some(reqwest::Method::PATCH),
        "DELETE" => Some(reqwest::Method::DELETE),
        "HEAD" => Some(reqwest::Method::HEAD),
        _ => None,
    }
}

/// Map a response to the payload or a classified error.
pub fn check_status(tool_id: &str, response: HttpResponse) -> Result<serde_json::Value> {
    match response.status {
        200..=299 => Ok(response.body),
        400..=499 => Err(ToolError::Client {
            tool_id: tool_id.to_string(),
            status: response.status,
            body: truncate(&Value::from(&response.body).display(), 200),
        }),
        500..=599 => Err(ToolError::Server {
            tool_id: tool_id.to_string(),
            status: response.status,
        }),
        other => Err(ToolError::Execution {
            tool_id: tool_id.to_string(),
            reason: format!("unexpected HTTP status {other}"),
        }),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

// ---------------------------------------------------------------------------
// reqwest transport
// ---------------------------------------------------------------------------

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("convoflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let start = Instant::now();
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let mut response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Failed(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Failed(format!("failed to read response body: {e}"))
            }
        })? {
            if !append_capped(&mut buffer, &chunk, MAX_BODY_BYTES) {
                tracing::warn!(url = %request.url, limit = MAX_BODY_BYTES, "response body truncated");
                break;
            }
        }
        let bytes = buffer.as_slice();
        let body = serde_json::from_slice(bytes)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()));

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "HTTP request completed"
        );
        Ok(HttpResponse { status, body })
    }
}

/// Append `chunk` without letting `buffer` grow past `cap`.  Returns
/// `false` once the cap is reached.
fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buffer.len());
    buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
    buffer.len() < cap
}
