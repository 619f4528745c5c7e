// src/trace.rs
//! Task-scoped trace context. One context is established per logical unit
//! of work (one pipeline item, one inbound HTTP request) and carried to
//! every outbound collaborator call as `x-trace-id` / `x-request-id`
//! headers. Scopes nest; leaving a scope restores the outer context on
//! every exit path, including panics unwinding through the future.

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::future::Future;
use tracing::Instrument;

pub const TRACE_HEADER: &str = "x-trace-id";
pub const REQUEST_HEADER: &str = "x-request-id";

tokio::task_local! {
    static CURRENT: TraceContext;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub request_id: String,
}

impl TraceContext {
    pub fn new(trace_id: impl AsRef<str>) -> Self {
        Self {
            trace_id: normalize_id(trace_id.as_ref()),
            request_id: String::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl AsRef<str>) -> Self {
        self.request_id = normalize_id(request_id.as_ref());
        self
    }
}

/// Strip anything outside `[A-Za-z0-9_-]` and cap at 64 chars, so ids are
/// safe to echo into headers and log fields verbatim.
pub fn normalize_id(value: &str) -> String {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_\-]").unwrap());
    let cleaned = re.replace_all(value, "");
    cleaned.chars().take(64).collect()
}

/// Fresh short id for units of work that arrive without one.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Run `fut` inside `ctx`. The previous context (if any) is restored when
/// the future completes.
pub async fn with_trace<F: Future>(ctx: TraceContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// The active context, if any. Empty outside any scope.
pub fn current() -> Option<TraceContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// Headers for outbound collaborator calls made under the active context.
pub fn outbound_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(ctx) = current() {
        if !ctx.trace_id.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&ctx.trace_id) {
                headers.insert(TRACE_HEADER, v);
            }
        }
        if !ctx.request_id.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
                headers.insert(REQUEST_HEADER, v);
            }
        }
    }
    headers
}

/// Axum middleware: adopt the caller's trace/request ids (or mint fresh
/// ones), scope the handler, and echo the ids back on the response.
pub async fn trace_middleware(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(normalize_id)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(new_id);
    let request_id = request
        .headers()
        .get(REQUEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(normalize_id)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(new_id);

    let ctx = TraceContext::new(&trace_id).with_request_id(&request_id);
    let span = tracing::info_span!("request", trace_id = %trace_id, request_id = %request_id);
    let mut response = with_trace(ctx, next.run(request)).instrument(span).await;

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&trace_id) {
        headers.insert(TRACE_HEADER, v);
    }
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_HEADER, v);
    }
    response
}
