//! Domain error types for codescout.
//!
//! Typed errors at module boundaries replace string-encoded errors and
//! enable structured error handling via pattern matching.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Errors from LLM provider operations.
///
/// Embedded in `anyhow::Error` so the `LLMClient` trait signature
/// (`-> anyhow::Result<CompletionResponse>`) stays unchanged while callers
/// can downcast: `e.downcast_ref::<ProviderError>()`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited (status {status}): retry after {retry_after_secs}s")]
    RateLimit { status: u16, retry_after_secs: u64 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("service unavailable (status {status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    #[error("invalid request (status {status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("authentication failed (status {status}): {message}")]
    AuthError { status: u16, message: String },

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Whether the request may succeed if retried.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit { .. }
                | ProviderError::Timeout(_)
                | ProviderError::ServiceUnavailable { .. }
        )
    }

    /// Server-requested minimum delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimit {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool error classification
// ---------------------------------------------------------------------------

/// Categorised tool failure reasons.
///
/// Produced by [`classify_tool_error`] from the error string a tool returns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolErrorKind {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("tool error: {0}")]
    Unknown(String),
}

impl ToolErrorKind {
    /// Only timeouts are worth retrying with the same arguments.
    pub fn recoverable(&self) -> bool {
        matches!(self, ToolErrorKind::Timeout(_))
    }
}

/// Classify a tool error string into a structured [`ToolErrorKind`].
///
/// Matches on known substrings (English and Chinese) in the error message.
pub fn classify_tool_error(error_msg: &str) -> ToolErrorKind {
    let lower = error_msg.to_lowercase();

    if lower.contains("timed out") || lower.contains("timeout") || error_msg.contains("超时") {
        let secs = extract_timeout_secs(&lower).unwrap_or(0);
        return ToolErrorKind::Timeout(secs);
    }

    if lower.contains("permission denied") || error_msg.contains("权限") {
        return ToolErrorKind::PermissionDenied(error_msg.to_string());
    }

    if lower.contains("no such file")
        || lower.contains("not found")
        || lower.contains("does not exist")
        || error_msg.contains("未找到")
        || error_msg.contains("不存在")
    {
        return ToolErrorKind::NotFound(error_msg.to_string());
    }

    if lower.contains("invalid")
        || lower.contains("missing required")
        || error_msg.contains("参数")
        || error_msg.contains("缺少")
    {
        return ToolErrorKind::InvalidParams(error_msg.to_string());
    }

    if lower.contains("failed") || error_msg.contains("失败") {
        return ToolErrorKind::ExecutionFailed(error_msg.to_string());
    }

    ToolErrorKind::Unknown(error_msg.to_string())
}

/// Try to extract a numeric timeout value from an error message.
fn extract_timeout_secs(msg: &str) -> Option<u64> {
    // Pattern: "timed out after 30 seconds" or "timeout after 30s"
    let patterns = ["after ", "timeout "];
    for pat in &patterns {
        if let Some(pos) = msg.find(pat) {
            let after = &msg[pos + pat.len()..];
            let num_str: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = num_str.parse::<u64>() {
                return Some(n);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Context errors
// ---------------------------------------------------------------------------

/// Errors from the context manager and session storage.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no active session")]
    NoActiveSession,

    #[error("context window overflow: {0}")]
    Overflow(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("recall error: {0}")]
    Recall(String),
}

impl ContextError {
    /// Overflow is the only non-recoverable context error: the manager
    /// handles storage, compression, and recall failures internally.
    pub fn recoverable(&self) -> bool {
        !matches!(self, ContextError::Overflow(_))
    }
}

// ---------------------------------------------------------------------------
// Agent errors
// ---------------------------------------------------------------------------

/// Terminal agent failure reasons. Max-iterations and stuck-loop conditions
/// never surface here: the loop handles both with feedback.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool error: {0}")]
    ToolError(String),

    #[error("llm error: {0}")]
    LlmError(String),

    #[error("agent error: {0}")]
    Unknown(String),
}
