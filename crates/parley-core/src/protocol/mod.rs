//! Wire types shared by the transport, decoder, and session.
//!
//! Request bodies and thread records use camelCase field names to match the
//! backend's JSON. Absent optional fields are omitted, never sent as `null`.

mod decoder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use decoder::{EventDecoder, parse_frame};

pub(crate) const THREADS_PATH: &str = "threads";
pub(crate) const MESSAGE_PATH: [&str; 2] = ["agent", "message"];
pub(crate) const CONFIRM_PATH: [&str; 2] = ["agent", "confirm"];
pub(crate) const CANCEL_PATH: [&str; 2] = ["agent", "cancel"];

/// A persistent conversation context owned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Advanced by the server on every exchange.
    pub updated_at: DateTime<Utc>,
}

/// Opaque approval request emitted when the agent halts mid-exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptTicket {
    /// Thread the interrupt belongs to. Filled from the exchange target when the frame omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub content: Value,
    #[serde(default = "default_resumable")]
    pub resumable: bool,
}

fn default_resumable() -> bool {
    true
}

impl InterruptTicket {
    pub fn new(thread_id: impl Into<String>, content: Value) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            content,
            resumable: true,
        }
    }
}

/// Typed event decoded from one stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Incremental reply chunk.
    Progress { content: String },
    /// Exchange finished; carries the (possibly newly assigned) thread id.
    Complete {
        #[serde(rename = "threadId")]
        thread_id: String,
    },
    /// Exchange halted pending human approval.
    Interrupt(InterruptTicket),
    /// Backend-reported failure, or a frame that failed to decode.
    Error { message: String },
}

impl ProtocolEvent {
    /// True for the events that end an exchange.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProtocolEvent::Progress { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::Progress { .. } => "progress",
            ProtocolEvent::Complete { .. } => "complete",
            ProtocolEvent::Interrupt(_) => "interrupt",
            ProtocolEvent::Error { .. } => "error",
        }
    }
}

/// Body of `POST {prefix}/agent/message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub message: String,
    /// Omit to ask the backend to create a thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
}

impl SendMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }
}

/// Arguments for resuming an interrupted exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmAction {
    pub thread_id: String,
    /// Caller-supplied data for the approved action (e.g. edited parameters).
    pub payload: Option<Value>,
    /// Ticket from the interrupt; when absent the session's recorded ticket is used.
    pub ticket: Option<InterruptTicket>,
}

impl ConfirmAction {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            payload: None,
            ticket: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_ticket(mut self, ticket: InterruptTicket) -> Self {
        self.ticket = Some(ticket);
        self
    }
}

/// Wire body for `POST {prefix}/agent/confirm`. The ticket travels as its opaque content.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfirmBody<'a> {
    pub thread_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CancelBody<'a> {
    pub thread_id: &'a str,
}

/// `DELETE {prefix}/threads/{id}` answers with a bare boolean or `{"success": bool}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DeleteResponse {
    Flag(bool),
    Object { success: bool },
}

impl DeleteResponse {
    pub fn succeeded(&self) -> bool {
        match self {
            DeleteResponse::Flag(ok) | DeleteResponse::Object { success: ok } => *ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_send_message_omits_absent_fields() {
        let body = serde_json::to_value(SendMessage::new("hi")).unwrap();
        assert_eq!(body, json!({ "message": "hi" }));

        let body =
            serde_json::to_value(SendMessage::new("hi").with_thread("t-1").with_project(7)).unwrap();
        assert_eq!(
            body,
            json!({ "message": "hi", "threadId": "t-1", "projectId": 7 })
        );
    }

    #[test]
    fn test_confirm_body_sends_ticket_content() {
        let content = json!({ "action": "delete" });
        let body = ConfirmBody {
            thread_id: "t-123",
            payload: None,
            ticket: Some(&content),
        };
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({ "threadId": "t-123", "ticket": { "action": "delete" } })
        );
    }

    #[test]
    fn test_thread_parses_camel_case() {
        let thread: Thread = serde_json::from_value(json!({
            "id": "t-1",
            "projectId": 3,
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(thread.id, "t-1");
        assert_eq!(thread.project_id, Some(3));
        assert!(thread.updated_at > thread.created_at);
    }

    #[test]
    fn test_thread_without_project() {
        let thread: Thread = serde_json::from_value(json!({
            "id": "t-2",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(thread.project_id, None);
    }

    #[test]
    fn test_delete_response_shapes() {
        let flag: DeleteResponse = serde_json::from_str("true").unwrap();
        assert!(flag.succeeded());
        let object: DeleteResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(!object.succeeded());
    }

    #[test]
    fn test_interrupt_ticket_defaults_resumable() {
        let ticket: InterruptTicket =
            serde_json::from_value(json!({ "content": { "action": "delete" } })).unwrap();
        assert!(ticket.resumable);
        assert_eq!(ticket.thread_id, None);
    }
}
