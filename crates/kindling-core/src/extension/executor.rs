//! Tool and service execution pipeline.
//!
//! Handlers run behind an optional timeout and a panic guard. Nothing that
//! goes wrong inside a handler escapes as an `Err` or a panic; every outcome
//! is folded into a [`ToolResult`].

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::contribution::{Service, ServiceContext, Tool, ToolContext};

/// Why a call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No such tool
    NotFound,
    /// Validator rejected the arguments
    Validation,
    /// Handler returned an error
    Execution,
    /// Handler exceeded the configured bound
    Timeout,
    /// Handler panicked
    Panicked,
}

/// Outcome of a tool execution or service invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            failure: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

// ============================================================================
// Guarded execution
// ============================================================================

/// A guarded future did not produce its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GuardError {
    TimedOut(Duration),
    Panicked(String),
}

/// Run `fut` with an optional time bound, catching panics.
pub(crate) async fn guarded<F>(fut: F, limit: Option<Duration>) -> Result<F::Output, GuardError>
where
    F: Future,
{
    let fut = AssertUnwindSafe(fut).catch_unwind();
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(GuardError::TimedOut(limit)),
        },
        None => fut.await,
    };
    outcome.map_err(|payload| GuardError::Panicked(panic_message(payload.as_ref())))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn fold(
    subject: &str,
    outcome: Result<anyhow::Result<Value>, GuardError>,
) -> ToolResult {
    match outcome {
        Ok(Ok(data)) => ToolResult::ok(data),
        // `{:#}` keeps the anyhow context chain on one line
        Ok(Err(e)) => ToolResult::failed(FailureKind::Execution, format!("{:#}", e)),
        Err(GuardError::TimedOut(limit)) => ToolResult::failed(
            FailureKind::Timeout,
            format!("{} timed out after {}ms", subject, limit.as_millis()),
        ),
        Err(GuardError::Panicked(msg)) => {
            ToolResult::failed(FailureKind::Panicked, format!("{} panicked: {}", subject, msg))
        }
    }
}

// ============================================================================
// Pipelines
// ============================================================================

/// Validate then run a tool.
pub(crate) async fn run_tool(
    tool: &Tool,
    args: Value,
    ctx: ToolContext,
    limit: Option<Duration>,
) -> ToolResult {
    let name = tool.name();

    if let Some(validator) = &tool.validator {
        if let Err(message) = validator.validate(&args) {
            debug!(tool = name, error = %message, "Tool arguments rejected");
            return ToolResult::failed(FailureKind::Validation, message);
        }
    }

    let start = Instant::now();
    let extension_id = ctx.extension_id.clone();
    let outcome = guarded(tool.handler.call(args, ctx), limit).await;
    let result = fold(&format!("tool '{}'", name), outcome);

    if result.success {
        debug!(
            tool = name,
            extension_id = %extension_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Tool executed"
        );
    } else {
        warn!(
            tool = name,
            extension_id = %extension_id,
            duration_ms = start.elapsed().as_millis() as u64,
            error = result.error.as_deref().unwrap_or_default(),
            "Tool execution failed"
        );
    }
    result
}

/// Run a service handler. Services have no validator stage.
pub(crate) async fn run_service(
    service: &Service,
    payload: Value,
    ctx: ServiceContext,
    limit: Option<Duration>,
) -> ToolResult {
    let extension_id = ctx.extension_id.clone();
    let outcome = guarded(service.handler.call(payload, ctx), limit).await;
    let result = fold(&format!("service '{}'", service.name), outcome);
    if !result.success {
        warn!(
            service = %service.name,
            extension_id = %extension_id,
            error = result.error.as_deref().unwrap_or_default(),
            "Service invocation failed"
        );
    }
    result
}
