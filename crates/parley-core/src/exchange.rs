//! Exchange state machine.
//!
//! An exchange is one send/confirm/cancel request and its streamed reply:
//!
//! ```text
//! Idle -> Sending -> Streaming -> Completed | Interrupted | Errored | Cancelled
//! ```
//!
//! Each `AgentSession` owns one `ExchangeSlot`. Claiming the slot is
//! synchronous and fails with `AgentError::ExchangeInProgress` while another
//! exchange is non-terminal; reaching any terminal state frees it. The slot
//! also remembers resumable interrupts per thread so confirm/cancel can be
//! validated before any request is made.
//!
//! Events can be consumed three ways, all driving the same machine:
//! `Exchange::next_event` (pull), `Exchange::into_stream`, or
//! `Exchange::run` with an `ExchangeHandler`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, AgentResult, TransportError};
use crate::protocol::{EventDecoder, InterruptTicket, ProtocolEvent};
use crate::transport::{FrameStream, Transport, TransportRequest};

/// Operation that started an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Send,
    Confirm,
    Cancel,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Send => write!(f, "send"),
            ExchangeKind::Confirm => write!(f, "confirm"),
            ExchangeKind::Cancel => write!(f, "cancel"),
        }
    }
}

/// Lifecycle state of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// No exchange is active.
    Idle,
    /// Request issued, no frame received yet.
    Sending,
    /// At least one frame received.
    Streaming,
    Completed,
    /// Halted for approval. Terminal for this exchange, not for the thread.
    Interrupted,
    Errored,
    Cancelled,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Completed
                | ExchangeState::Interrupted
                | ExchangeState::Errored
                | ExchangeState::Cancelled
        )
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeState::Idle => "idle",
            ExchangeState::Sending => "sending",
            ExchangeState::Streaming => "streaming",
            ExchangeState::Completed => "completed",
            ExchangeState::Interrupted => "interrupted",
            ExchangeState::Errored => "errored",
            ExchangeState::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// How a successful (non-error) exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed { thread_id: String },
    /// The caller should confirm or cancel using this ticket.
    Interrupted(InterruptTicket),
    /// Aborted by the client. Not a failure.
    Cancelled,
}

impl ExchangeOutcome {
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            ExchangeOutcome::Completed { thread_id } => Some(thread_id),
            ExchangeOutcome::Interrupted(ticket) => ticket.thread_id.as_deref(),
            ExchangeOutcome::Cancelled => None,
        }
    }
}

/// Callback sink for `Exchange::run`. Every method defaults to a no-op.
///
/// No method is invoked after the exchange is cancelled, and cancellation
/// itself is never reported through `on_error`.
pub trait ExchangeHandler {
    fn on_progress(&mut self, _chunk: &str) {}
    fn on_complete(&mut self, _thread_id: &str) {}
    fn on_interrupt(&mut self, _ticket: &InterruptTicket) {}
    fn on_error(&mut self, _error: &AgentError) {}
}

impl ExchangeHandler for () {}

/// Per-session record of the single active exchange and pending interrupts.
#[derive(Debug, Default)]
pub(crate) struct ExchangeSlot {
    inner: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    next_id: u64,
    active: Option<ActiveExchange>,
    pending: HashMap<String, InterruptTicket>,
}

#[derive(Debug)]
struct ActiveExchange {
    id: u64,
    kind: ExchangeKind,
    state: ExchangeState,
    cancel: CancellationToken,
}

impl ExchangeSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the slot for a new exchange, or rejects if one is in flight.
    pub(crate) fn claim(&self, kind: ExchangeKind) -> AgentResult<(u64, CancellationToken)> {
        let mut slot = self.lock();
        // A token cancelled from outside frees the slot even before the exchange notices.
        if let Some(active) = slot.active.as_ref().filter(|a| !a.cancel.is_cancelled()) {
            return Err(AgentError::ExchangeInProgress {
                active: active.kind,
            });
        }
        slot.next_id += 1;
        let id = slot.next_id;
        let cancel = CancellationToken::new();
        slot.active = Some(ActiveExchange {
            id,
            kind,
            state: ExchangeState::Sending,
            cancel: cancel.clone(),
        });
        Ok((id, cancel))
    }

    /// Mirrors an exchange's state; terminal states free the slot.
    fn update(&self, id: u64, state: ExchangeState) {
        let mut slot = self.lock();
        if !slot.active.as_ref().is_some_and(|active| active.id == id) {
            return;
        }
        if state.is_terminal() {
            slot.active = None;
        } else if let Some(active) = slot.active.as_mut() {
            active.state = state;
        }
    }

    /// Cancels whatever exchange is active. Returns false when idle.
    pub(crate) fn abort(&self) -> bool {
        let Some(active) = self.lock().active.take() else {
            return false;
        };
        let live = !active.cancel.is_cancelled();
        active.cancel.cancel();
        tracing::debug!(exchange = active.id, kind = %active.kind, "exchange aborted");
        live
    }

    /// Cancels and frees the slot only if `id` still owns it.
    fn release(&self, id: u64) {
        let mut slot = self.lock();
        if slot.active.as_ref().is_some_and(|active| active.id == id)
            && let Some(active) = slot.active.take()
        {
            active.cancel.cancel();
        }
    }

    pub(crate) fn state(&self) -> ExchangeState {
        self.lock()
            .active
            .as_ref()
            .filter(|active| !active.cancel.is_cancelled())
            .map_or(ExchangeState::Idle, |active| active.state)
    }

    pub(crate) fn record_interrupt(&self, ticket: &InterruptTicket) {
        if let Some(thread_id) = &ticket.thread_id {
            self.lock()
                .pending
                .insert(thread_id.clone(), ticket.clone());
        }
    }

    pub(crate) fn clear_interrupt(&self, thread_id: &str) {
        self.lock().pending.remove(thread_id);
    }

    pub(crate) fn pending_interrupt(&self, thread_id: &str) -> Option<InterruptTicket> {
        self.lock().pending.get(thread_id).cloned()
    }
}

/// One in-flight exchange. The transport is opened lazily on first poll.
///
/// Dropping a non-terminal exchange cancels it and frees the session slot.
pub struct Exchange {
    id: u64,
    kind: ExchangeKind,
    thread_id: Option<String>,
    state: ExchangeState,
    cancel: CancellationToken,
    slot: Arc<ExchangeSlot>,
    transport: Arc<dyn Transport>,
    request: Option<TransportRequest>,
    events: Option<EventDecoder<FrameStream>>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("thread_id", &self.thread_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Exchange {
    pub(crate) fn start(
        slot: &Arc<ExchangeSlot>,
        transport: &Arc<dyn Transport>,
        kind: ExchangeKind,
        thread_id: Option<String>,
        request: TransportRequest,
    ) -> AgentResult<Self> {
        let (id, cancel) = slot.claim(kind)?;
        tracing::debug!(
            exchange = id,
            %kind,
            thread = thread_id.as_deref().unwrap_or("<new>"),
            "exchange started"
        );

        Ok(Self {
            id,
            kind,
            thread_id,
            state: ExchangeState::Sending,
            cancel,
            slot: Arc::clone(slot),
            transport: Arc::clone(transport),
            request: Some(request),
            events: None,
        })
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Target thread; set from the terminal event for new threads.
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Current state. Reports `Cancelled` as soon as the token fires.
    pub fn state(&self) -> ExchangeState {
        if !self.state.is_terminal() && self.cancel.is_cancelled() {
            ExchangeState::Cancelled
        } else {
            self.state
        }
    }

    /// Token that aborts this exchange when cancelled.
    ///
    /// Hosts can layer timeouts on top of it; the core imposes none.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Aborts this exchange and frees the session slot immediately.
    pub fn abort(&self) {
        self.slot.release(self.id);
        self.cancel.cancel();
    }

    /// Pulls the next event.
    ///
    /// Yields `Ok` for progress, complete, and interrupt events and `Err` for
    /// failures (backend `error` events included). Returns `None` once the
    /// exchange has ended or was cancelled.
    pub async fn next_event(&mut self) -> Option<AgentResult<ProtocolEvent>> {
        self.next_reply()
            .await
            .map(|item| item.map(ProtocolEvent::from))
    }

    async fn next_reply(&mut self) -> Option<AgentResult<Reply>> {
        if self.state.is_terminal() {
            return None;
        }

        let cancel = self.cancel.clone();
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            item = self.advance() => Some(item),
        };

        // Anything that raced with cancellation is discarded.
        let Some(item) = item.filter(|_| !self.cancel.is_cancelled()) else {
            self.transition(ExchangeState::Cancelled);
            return None;
        };

        match item {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => Some(Err(self.fail(AgentError::StreamClosed))),
            Err(TransportError::Cancelled) => {
                self.transition(ExchangeState::Cancelled);
                None
            }
            Err(err) => Some(Err(self.fail(err.into()))),
        }
    }

    /// Drives the exchange to its end, invoking `handler` along the way.
    ///
    /// # Errors
    /// Returns the transport, protocol, or premature-close error that ended the
    /// exchange, after passing it to `handler.on_error`.
    pub async fn run<H>(mut self, handler: &mut H) -> AgentResult<ExchangeOutcome>
    where
        H: ExchangeHandler + ?Sized,
    {
        while let Some(item) = self.next_reply().await {
            match item {
                Ok(Reply::Progress(content)) => handler.on_progress(&content),
                Ok(Reply::Complete(thread_id)) => {
                    handler.on_complete(&thread_id);
                    return Ok(ExchangeOutcome::Completed { thread_id });
                }
                Ok(Reply::Interrupt(ticket)) => {
                    handler.on_interrupt(&ticket);
                    return Ok(ExchangeOutcome::Interrupted(ticket));
                }
                Err(err) => {
                    handler.on_error(&err);
                    return Err(err);
                }
            }
        }
        Ok(ExchangeOutcome::Cancelled)
    }

    /// Converts the exchange into a stream of events (same items as `next_event`).
    pub fn into_stream(self) -> BoxStream<'static, AgentResult<ProtocolEvent>> {
        stream::unfold(self, |mut exchange| async move {
            exchange.next_event().await.map(|item| (item, exchange))
        })
        .boxed()
    }

    async fn advance(&mut self) -> Result<Option<ProtocolEvent>, TransportError> {
        if self.events.is_none() {
            let Some(request) = self.request.take() else {
                return Ok(None);
            };
            let frames = self.transport.open(request, self.cancel.clone()).await?;
            self.events = Some(EventDecoder::new(frames));
        }

        match self.events.as_mut() {
            Some(events) => events.next().await.transpose(),
            None => Ok(None),
        }
    }

    fn dispatch(&mut self, event: ProtocolEvent) -> Option<AgentResult<Reply>> {
        if self.state == ExchangeState::Sending {
            self.transition(ExchangeState::Streaming);
        }

        match event {
            ProtocolEvent::Progress { content } => Some(Ok(Reply::Progress(content))),
            ProtocolEvent::Complete { thread_id } => {
                self.slot.clear_interrupt(&thread_id);
                self.thread_id = Some(thread_id.clone());
                self.transition(ExchangeState::Completed);
                Some(Ok(Reply::Complete(thread_id)))
            }
            ProtocolEvent::Interrupt(mut ticket) => {
                match &ticket.thread_id {
                    Some(thread_id) => self.thread_id = Some(thread_id.clone()),
                    None => ticket.thread_id.clone_from(&self.thread_id),
                }
                if ticket.resumable {
                    self.slot.record_interrupt(&ticket);
                } else if let Some(thread_id) = &ticket.thread_id {
                    self.slot.clear_interrupt(thread_id);
                }
                self.transition(ExchangeState::Interrupted);
                Some(Ok(Reply::Interrupt(ticket)))
            }
            ProtocolEvent::Error { message } => {
                Some(Err(self.fail(AgentError::Protocol { message })))
            }
        }
    }

    fn fail(&mut self, err: AgentError) -> AgentError {
        tracing::debug!(exchange = self.id, kind = %self.kind, "exchange failed");
        self.transition(ExchangeState::Errored);
        err
    }

    fn transition(&mut self, to: ExchangeState) {
        let from = self.state;
        self.state = to;
        self.slot.update(self.id, to);
        if to.is_terminal() {
            // Release the connection as soon as nothing more will be read.
            self.events = None;
            self.request = None;
        }
        tracing::trace!(exchange = self.id, kind = %self.kind, %from, %to, "exchange transition");
    }
}

/// Events that end up as `Ok` items; backend errors become `Err`.
enum Reply {
    Progress(String),
    Complete(String),
    Interrupt(InterruptTicket),
}

impl From<Reply> for ProtocolEvent {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Progress(content) => ProtocolEvent::Progress { content },
            Reply::Complete(thread_id) => ProtocolEvent::Complete { thread_id },
            Reply::Interrupt(ticket) => ProtocolEvent::Interrupt(ticket),
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.slot.release(self.id);
        }
    }
}
