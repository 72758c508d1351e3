//! Client-side protocol engine for conversational agent backends.
//!
//! - `transport`: HTTP requests and cancellable raw frame streams
//! - `protocol`: wire types and the frame-to-event decoder
//! - `exchange`: lifecycle of one send/confirm/cancel exchange
//! - `session`: the public facade (threads + exchange operations)
//! - `config`: `${PARLEY_HOME}/config.toml` loading

pub mod config;
pub mod error;
pub mod exchange;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{AgentError, AgentResult, TransportError};
pub use exchange::{Exchange, ExchangeHandler, ExchangeKind, ExchangeOutcome, ExchangeState};
pub use protocol::{ConfirmAction, InterruptTicket, ProtocolEvent, SendMessage, Thread};
pub use session::{AbortHandle, AgentSession};
pub use transport::{Frame, FrameStream, HttpTransport, Method, Transport, TransportRequest};
