use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{InterruptTicket, ProtocolEvent};
use crate::error::TransportError;
use crate::transport::Frame;

/// Stream adapter that turns raw frames into `ProtocolEvent`s.
///
/// Ends after the first terminal event, the first malformed frame (reported
/// as `ProtocolEvent::Error`), or the first transport error.
pub struct EventDecoder<S> {
    inner: S,
    finished: bool,
}

impl<S> EventDecoder<S> {
    pub fn new(frames: S) -> Self {
        Self {
            inner: frames,
            finished: false,
        }
    }
}

impl<S> Stream for EventDecoder<S>
where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    type Item = Result<ProtocolEvent, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                let event = parse_frame(&frame.event, &frame.data).unwrap_or_else(|message| {
                    ProtocolEvent::Error {
                        message: format!("malformed frame: {message}"),
                    }
                });
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Parses one frame into a `ProtocolEvent`.
///
/// Named events (`progress`, `complete`, `interrupt`, `error`) carry their
/// fields directly in `data`. Unnamed (`message`) events carry an internally
/// tagged object: `{"type": "progress", "content": "..."}`.
///
/// # Errors
/// Returns a description of the problem if the frame is not one of the four kinds.
pub fn parse_frame(event_type: &str, data: &str) -> Result<ProtocolEvent, String> {
    let event = match event_type {
        "progress" => {
            let parsed: ProgressData = parse_data(event_type, data)?;
            ProtocolEvent::Progress {
                content: parsed.content,
            }
        }
        "complete" => {
            let parsed: CompleteData = parse_data(event_type, data)?;
            ProtocolEvent::Complete {
                thread_id: parsed.thread_id,
            }
        }
        "interrupt" => ProtocolEvent::Interrupt(parse_data::<InterruptTicket>(event_type, data)?),
        "error" => {
            let parsed: ErrorData = parse_data(event_type, data)?;
            ProtocolEvent::Error {
                message: parsed.message,
            }
        }
        "message" => parse_data::<ProtocolEvent>(event_type, data)?,
        other => return Err(format!("unknown event type: {other}")),
    };

    if let ProtocolEvent::Complete { thread_id } = &event
        && thread_id.trim().is_empty()
    {
        return Err("complete event has an empty threadId".to_string());
    }

    Ok(event)
}

fn parse_data<T: DeserializeOwned>(event_type: &str, data: &str) -> Result<T, String> {
    if data.trim().is_empty() {
        return Err(format!("missing data for {event_type}"));
    }
    serde_json::from_str(data).map_err(|err| format!("failed to parse {event_type}: {err}"))
}

#[derive(Debug, Deserialize)]
struct ProgressData {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteData {
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    message: String,
}
