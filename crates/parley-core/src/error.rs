//! Error taxonomy for transport, protocol, and caller misuse.
//!
//! Cancellation is deliberately absent from `AgentError`: an aborted exchange
//! resolves to `ExchangeOutcome::Cancelled`. `TransportError::Cancelled` only
//! exists at the frame-stream boundary, where the exchange converts it.

use serde_json::Value;
use thiserror::Error;

use crate::exchange::ExchangeKind;

/// Failures raised by a `Transport` before or during frame delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// HTTP 401: the session credential is missing or expired.
    #[error("unauthorized: session is missing or expired")]
    Unauthorized,
    /// Any other non-success status returned before streaming began.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// Connection refused, DNS failure, TLS failure, etc.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The response body failed mid-read.
    #[error("response body error: {0}")]
    Body(String),
    /// The caller signalled the cancellation token.
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Builds a status error, pulling a readable message out of a JSON body when possible.
    ///
    /// Recognises `{"error": "..."}`, `{"error": {"message": "..."}}` and `{"message": "..."}`.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 401 {
            return Self::Unauthorized;
        }

        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| extract_error_message(&json))
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    "request failed".to_string()
                } else {
                    trimmed.to_string()
                }
            });

        Self::Status { status, message }
    }
}

fn extract_error_message(json: &Value) -> Option<String> {
    let error = json.get("error");
    error
        .and_then(Value::as_str)
        .or_else(|| error.and_then(|e| e.get("message")).and_then(Value::as_str))
        .or_else(|| json.get("message").and_then(Value::as_str))
        .map(str::to_string)
}

/// Errors surfaced by session operations and exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Backend `error` event, or a frame the decoder could not parse.
    #[error("agent error: {message}")]
    Protocol { message: String },

    /// The server closed the stream before a terminal event.
    #[error("stream closed before the exchange finished")]
    StreamClosed,

    /// A non-streamed JSON response could not be parsed.
    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("backend refused to delete thread '{thread_id}'")]
    DeleteRejected { thread_id: String },

    #[error("a {active} exchange is already in progress")]
    ExchangeInProgress { active: ExchangeKind },

    #[error("thread '{thread_id}' has no pending interrupt")]
    NoPendingInterrupt { thread_id: String },

    #[error("ticket belongs to thread '{found}', not '{expected}'")]
    TicketThreadMismatch { expected: String, found: String },

    #[error("interrupt on thread '{thread_id}' is no longer resumable")]
    TicketExpired { thread_id: String },
}

impl AgentError {
    /// True when the host should re-authenticate instead of retrying.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AgentError::Transport(TransportError::Unauthorized))
    }

    /// True for errors raised synchronously because the caller used the API out of order.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            AgentError::ExchangeInProgress { .. }
                | AgentError::NoPendingInterrupt { .. }
                | AgentError::TicketThreadMismatch { .. }
                | AgentError::TicketExpired { .. }
        )
    }
}

/// Result type for session and exchange operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
