//! Public facade over the transport and the exchange state machine.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Config;
use crate::error::{AgentError, AgentResult};
use crate::exchange::{Exchange, ExchangeKind, ExchangeSlot, ExchangeState};
use crate::protocol::{
    CANCEL_PATH, CONFIRM_PATH, CancelBody, ConfirmAction, ConfirmBody, DeleteResponse,
    InterruptTicket, MESSAGE_PATH, SendMessage, THREADS_PATH, Thread,
};
use crate::transport::{HttpTransport, Transport, TransportRequest};

/// One client session against the agent backend.
///
/// Holds at most one non-terminal exchange. Starting another while one is in
/// flight fails immediately with `AgentError::ExchangeInProgress`. Separate
/// sessions share nothing and may run exchanges concurrently.
pub struct AgentSession {
    transport: Arc<dyn Transport>,
    slot: Arc<ExchangeSlot>,
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

/// Aborts a session's active exchange from elsewhere (signal handlers, other tasks).
#[derive(Debug, Clone)]
pub struct AbortHandle {
    slot: Arc<ExchangeSlot>,
}

impl AbortHandle {
    /// Same as `AgentSession::abort_current_stream`.
    pub fn abort(&self) -> bool {
        self.slot.abort()
    }
}

impl AgentSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            slot: Arc::new(ExchangeSlot::default()),
        }
    }

    /// Builds a session over HTTP from resolved configuration.
    ///
    /// # Errors
    /// Returns an error if the configured base URL is invalid.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Lists the caller's threads in server order.
    ///
    /// # Errors
    /// Transport failures (including `Unauthorized`) or an undecodable body.
    pub async fn list_threads(&self) -> AgentResult<Vec<Thread>> {
        let body = self
            .transport
            .fetch(TransportRequest::get([THREADS_PATH]))
            .await?;
        decode(&body)
    }

    /// Deletes a thread.
    ///
    /// # Errors
    /// `DeleteRejected` when the backend answers `false`; transport errors
    /// for HTTP failures such as an unknown thread.
    pub async fn delete_thread(&self, thread_id: &str) -> AgentResult<()> {
        let body = self
            .transport
            .fetch(TransportRequest::delete([THREADS_PATH, thread_id]))
            .await?;
        let response: DeleteResponse = decode(&body)?;
        if response.succeeded() {
            tracing::debug!(thread = thread_id, "thread deleted");
            Ok(())
        } else {
            Err(AgentError::DeleteRejected {
                thread_id: thread_id.to_string(),
            })
        }
    }

    /// Starts a `Send` exchange. Omit `thread_id` to start a new thread.
    ///
    /// # Errors
    /// `ExchangeInProgress` if another exchange is active.
    pub fn send_message(&self, message: SendMessage) -> AgentResult<Exchange> {
        let body = to_body(&message)?;
        let thread_id = message.thread_id;
        self.start(
            ExchangeKind::Send,
            thread_id,
            TransportRequest::post(MESSAGE_PATH, body),
        )
    }

    /// Starts a `Confirm` exchange resuming the interrupt pending on `action.thread_id`.
    ///
    /// Uses `action.ticket` when given, otherwise the ticket this session
    /// recorded for the thread.
    ///
    /// # Errors
    /// `NoPendingInterrupt`, `TicketThreadMismatch` or `TicketExpired` when
    /// there is nothing valid to resume; `ExchangeInProgress` if busy.
    pub fn confirm_action(&self, action: ConfirmAction) -> AgentResult<Exchange> {
        let ticket = match action.ticket {
            Some(ticket) => {
                check_ticket(&action.thread_id, &ticket)?;
                ticket
            }
            None => self.recorded_ticket(&action.thread_id)?,
        };

        let body = to_body(&ConfirmBody {
            thread_id: &action.thread_id,
            payload: action.payload.as_ref(),
            ticket: Some(&ticket.content),
        })?;
        self.start(
            ExchangeKind::Confirm,
            Some(action.thread_id),
            TransportRequest::post(CONFIRM_PATH, body),
        )
    }

    /// Starts a `Cancel` exchange telling the server to abandon the pending interrupt.
    ///
    /// Unlike `abort_current_stream`, this informs the backend.
    ///
    /// # Errors
    /// `NoPendingInterrupt` when the thread has no recorded interrupt;
    /// `ExchangeInProgress` if busy.
    pub fn cancel_action(&self, thread_id: &str) -> AgentResult<Exchange> {
        self.recorded_ticket(thread_id)?;

        let body = to_body(&CancelBody { thread_id })?;
        self.start(
            ExchangeKind::Cancel,
            Some(thread_id.to_string()),
            TransportRequest::post(CANCEL_PATH, body),
        )
    }

    /// Stops listening to the active exchange, which ends as `Cancelled`.
    ///
    /// Client-side only: the server is not told. Returns false when idle.
    pub fn abort_current_stream(&self) -> bool {
        self.slot.abort()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            slot: Arc::clone(&self.slot),
        }
    }

    /// State of the active exchange, or `Idle`.
    pub fn current_state(&self) -> ExchangeState {
        self.slot.state()
    }

    /// Ticket recorded for `thread_id` by the last resumable interrupt seen.
    pub fn pending_interrupt(&self, thread_id: &str) -> Option<InterruptTicket> {
        self.slot.pending_interrupt(thread_id)
    }

    /// Registers a ticket received outside this session, e.g. by another process.
    ///
    /// # Errors
    /// `TicketThreadMismatch` or `TicketExpired` if the ticket cannot resume `thread_id`.
    pub fn adopt_interrupt(&self, thread_id: &str, mut ticket: InterruptTicket) -> AgentResult<()> {
        check_ticket(thread_id, &ticket)?;
        ticket.thread_id = Some(thread_id.to_string());
        self.slot.record_interrupt(&ticket);
        Ok(())
    }

    fn recorded_ticket(&self, thread_id: &str) -> AgentResult<InterruptTicket> {
        self.slot
            .pending_interrupt(thread_id)
            .ok_or_else(|| AgentError::NoPendingInterrupt {
                thread_id: thread_id.to_string(),
            })
    }

    fn start(
        &self,
        kind: ExchangeKind,
        thread_id: Option<String>,
        request: TransportRequest,
    ) -> AgentResult<Exchange> {
        Exchange::start(&self.slot, &self.transport, kind, thread_id, request)
    }
}

fn check_ticket(thread_id: &str, ticket: &InterruptTicket) -> AgentResult<()> {
    if let Some(found) = &ticket.thread_id
        && found != thread_id
    {
        return Err(AgentError::TicketThreadMismatch {
            expected: thread_id.to_string(),
            found: found.clone(),
        });
    }
    if !ticket.resumable {
        return Err(AgentError::TicketExpired {
            thread_id: thread_id.to_string(),
        });
    }
    Ok(())
}

fn to_body<T: Serialize>(body: &T) -> AgentResult<Value> {
    serde_json::to_value(body).map_err(|e| AgentError::Decode(e.to_string()))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> AgentResult<T> {
    serde_json::from_slice(body).map_err(|e| AgentError::Decode(e.to_string()))
}
