//! In-memory transport and handlers for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, TransportError};
use crate::exchange::ExchangeHandler;
use crate::protocol::InterruptTicket;
use crate::transport::{Frame, FrameStream, Transport, TransportRequest, cancellable};

pub(crate) type FrameTx = mpsc::UnboundedSender<Result<Frame, TransportError>>;

/// What the next `open` call returns.
pub(crate) enum Script {
    /// A finite stream that ends after the listed frames.
    Frames(Vec<Frame>),
    /// A stream fed by the test through the paired sender.
    Channel(mpsc::UnboundedReceiver<Result<Frame, TransportError>>),
    /// Fail before any frame.
    Fail(TransportError),
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    fetches: Mutex<VecDeque<Result<Bytes, TransportError>>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn push_frames(&self, frames: Vec<Frame>) {
        self.push(Script::Frames(frames));
    }

    /// Queues a hand-fed stream and returns its sender.
    pub fn push_channel(&self) -> FrameTx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Script::Channel(rx));
        tx
    }

    pub fn push_fetch(&self, response: Result<&'static str, TransportError>) {
        self.fetches
            .lock()
            .unwrap()
            .push_back(response.map(|body| Bytes::from_static(body.as_bytes())));
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<FrameStream, TransportError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front();
        let frames: FrameStream = match script {
            Some(Script::Frames(frames)) => stream::iter(frames.into_iter().map(Ok)).boxed(),
            Some(Script::Channel(mut rx)) => stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed(),
            Some(Script::Fail(err)) => return Err(err),
            None => {
                return Err(TransportError::Connection(
                    "no scripted response".to_string(),
                ));
            }
        };
        Ok(cancellable(frames, cancel))
    }

    async fn fetch(&self, request: TransportRequest) -> Result<Bytes, TransportError> {
        self.requests.lock().unwrap().push(request);
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connection("no scripted fetch".to_string())))
    }
}

pub(crate) fn progress(content: &str) -> Frame {
    Frame::new("progress", json!({ "content": content }).to_string())
}

pub(crate) fn complete(thread_id: &str) -> Frame {
    Frame::new("complete", json!({ "threadId": thread_id }).to_string())
}

pub(crate) fn interrupt(content: Value, thread_id: Option<&str>, resumable: bool) -> Frame {
    let mut data = json!({ "content": content, "resumable": resumable });
    if let Some(thread_id) = thread_id {
        data["threadId"] = json!(thread_id);
    }
    Frame::new("interrupt", data.to_string())
}

pub(crate) fn error(message: &str) -> Frame {
    Frame::new("error", json!({ "message": message }).to_string())
}

/// Records every callback as a short string, in order.
#[derive(Debug, Default)]
pub(crate) struct RecordingHandler {
    pub calls: Vec<String>,
}

impl ExchangeHandler for RecordingHandler {
    fn on_progress(&mut self, chunk: &str) {
        self.calls.push(format!("progress:{chunk}"));
    }

    fn on_complete(&mut self, thread_id: &str) {
        self.calls.push(format!("complete:{thread_id}"));
    }

    fn on_interrupt(&mut self, ticket: &InterruptTicket) {
        self.calls.push(format!("interrupt:{}", ticket.content));
    }

    fn on_error(&mut self, error: &AgentError) {
        self.calls.push(format!("error:{error}"));
    }
}
