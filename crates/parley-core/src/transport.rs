//! Network boundary: one request in, a cancellable stream of raw frames out.
//!
//! Streamed endpoints speak Server-Sent Events; each SSE event is one `Frame`.
//! Non-streamed endpoints (thread listing and deletion) go through `fetch`.

use std::fmt::Display;
use std::mem;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, COOKIE, USER_AGENT as USER_AGENT_HEADER};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::error::TransportError;

/// Standard User-Agent header for parley requests.
pub const USER_AGENT: &str = concat!("parley/", env!("CARGO_PKG_VERSION"));

/// One undecoded unit of the response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// SSE event name (`message` when the server sent none).
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Lazy, ordered, non-restartable sequence of frames.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// A request relative to the configured API root.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    /// Path segments below the API prefix; each is percent-encoded on the wire.
    pub segments: Vec<String>,
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn get<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::Get, segments, None)
    }

    pub fn delete<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::Delete, segments, None)
    }

    pub fn post<I, S>(segments: I, body: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::Post, segments, Some(body))
    }

    fn new<I, S>(method: Method, segments: I, body: Option<Value>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            body,
        }
    }

    /// Slash-joined path, e.g. `/agent/message`. Used for logging and test matching.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

/// Issues requests against the agent backend.
///
/// Implementations must stop producing frames promptly once `cancel` fires,
/// yielding a single `TransportError::Cancelled` and then ending.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a streamed exchange.
    ///
    /// # Errors
    /// Fails before any frame is produced on connection errors or non-success
    /// status codes (`Unauthorized` for 401).
    async fn open(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<FrameStream, TransportError>;

    /// Performs a non-streamed request and returns the full body.
    ///
    /// # Errors
    /// Same status mapping as `open`.
    async fn fetch(&self, request: TransportRequest) -> Result<Bytes, TransportError>;
}

/// reqwest-backed transport carrying the configured session cookie.
pub struct HttpTransport {
    http: reqwest::Client,
    root: Url,
    cookie: Option<String>,
}

impl HttpTransport {
    /// Builds a transport from resolved configuration.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or cannot carry a path.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let base_url = config.resolve_base_url()?;
        let root = api_root(&base_url, &config.api_prefix)?;
        let cookie = config
            .resolve_session_token()
            .map(|token| format!("{}={token}", config.cookie_name));

        Ok(Self {
            http: reqwest::Client::new(),
            root,
            cookie,
        })
    }

    fn url(&self, segments: &[String]) -> Result<Url, TransportError> {
        let mut url = self.root.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Connection(format!("invalid API root: {}", self.root)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        request: &TransportRequest,
        streaming: bool,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.url(&request.segments)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let accept = if streaming {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut builder = self
            .http
            .request(method, url)
            .header(ACCEPT, accept)
            .header(USER_AGENT_HEADER, USER_AGENT);
        if let Some(cookie) = &self.cookie {
            builder = builder.header(COOKIE, cookie);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!(method = ?request.method, path = %request.path(), "sending request");
        let response = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;
        check_status(response).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<FrameStream, TransportError> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = self.send(&request, true) => response?,
        };
        Ok(cancellable(sse_frames(response.bytes_stream()), cancel))
    }

    async fn fetch(&self, request: TransportRequest) -> Result<Bytes, TransportError> {
        let response = self.send(&request, false).await?;
        response
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))
    }
}

fn api_root(base_url: &str, prefix: &str) -> anyhow::Result<Url> {
    let mut root =
        Url::parse(base_url).with_context(|| format!("Invalid base URL: {base_url}"))?;
    {
        let Ok(mut segments) = root.path_segments_mut() else {
            anyhow::bail!("Base URL '{base_url}' cannot carry an API path");
        };
        segments
            .pop_if_empty()
            .extend(prefix.split('/').filter(|s| !s.is_empty()));
    }
    Ok(root)
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Connection(format!("request timed out: {err}"))
    } else if err.is_connect() {
        TransportError::Connection(format!("could not connect: {err}"))
    } else {
        TransportError::Connection(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransportError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::from_status(status.as_u16(), &body))
}

/// Splits an SSE byte stream into frames.
pub(crate) fn sse_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    DatalessEventMarker::new(bytes.boxed())
        .eventsource()
        .map(|item| match item {
            Ok(event) => Ok(Frame {
                event: event.event,
                data: event.data,
            }),
            Err(e) => Err(TransportError::Body(format!("SSE stream error: {e}"))),
        })
        .boxed()
}

/// Gives named SSE events that have no `data:` line an empty one.
///
/// `eventsource-stream` discards events whose data buffer is empty, so a bare
/// `event: complete` block would never reach the decoder. With the marker it
/// arrives as a frame with empty `data` and is reported as malformed.
struct DatalessEventMarker<S> {
    inner: S,
    /// Bytes of the current, unterminated line.
    line: Vec<u8>,
    after_cr: bool,
    named: bool,
    has_data: bool,
    finished: bool,
}

impl<S> DatalessEventMarker<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            line: Vec::new(),
            after_cr: false,
            named: false,
            has_data: false,
            finished: false,
        }
    }

    /// Passes complete lines through; a partial line waits for its terminator.
    fn mark(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for &byte in chunk {
            if mem::take(&mut self.after_cr) && byte == b'\n' {
                out.push(byte);
                continue;
            }
            if byte == b'\n' || byte == b'\r' {
                self.end_line(&mut out);
                out.push(byte);
                self.after_cr = byte == b'\r';
            } else {
                self.line.push(byte);
            }
        }
        out
    }

    fn end_line(&mut self, out: &mut Vec<u8>) {
        if self.line.is_empty() {
            if self.named && !self.has_data {
                out.extend_from_slice(b"data:\n");
            }
            self.named = false;
            self.has_data = false;
            return;
        }

        let (field, value) = match self.line.iter().position(|&b| b == b':') {
            Some(colon) => (&self.line[..colon], &self.line[colon + 1..]),
            None => (self.line.as_slice(), &[][..]),
        };
        match field {
            b"event" => self.named = !matches!(value, [] | [b' ']),
            b"data" => self.has_data = true,
            _ => {}
        }
        out.append(&mut self.line);
    }
}

impl<S, B, E> Stream for DatalessEventMarker<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let marked = self.mark(chunk.as_ref());
                    if !marked.is_empty() {
                        return Poll::Ready(Some(Ok(Bytes::from(marked))));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.finished = true;
                    if self.line.is_empty() {
                        return Poll::Ready(None);
                    }
                    let rest = mem::take(&mut self.line);
                    return Poll::Ready(Some(Ok(Bytes::from(rest))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Ends `frames` with `TransportError::Cancelled` as soon as `cancel` fires.
///
/// The inner stream (and the connection behind it) is dropped at that point.
pub fn cancellable(frames: FrameStream, cancel: CancellationToken) -> FrameStream {
    stream::unfold(Some((frames, cancel)), |state| async move {
        let (mut frames, cancel) = state?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Some((Err(TransportError::Cancelled), None)),
            next = frames.next() => next.map(|item| (item, Some((frames, cancel)))),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn transport_for(server: &MockServer, token: Option<&str>) -> HttpTransport {
        let config = Config {
            base_url: server.uri(),
            session_token: token.map(str::to_string),
            ..Config::default()
        };
        HttpTransport::new(&config).unwrap()
    }

    #[test]
    fn test_api_root_joins_prefix() {
        let root = api_root("http://localhost:3000/", "/api/").unwrap();
        assert_eq!(root.as_str(), "http://localhost:3000/api");

        let root = api_root("http://example.com/base", "v1/api").unwrap();
        assert_eq!(root.as_str(), "http://example.com/base/v1/api");
    }

    #[test]
    fn test_api_root_rejects_opaque_urls() {
        assert!(api_root("mailto:someone@example.com", "/api").is_err());
        assert!(api_root("not a url", "/api").is_err());
    }

    #[test]
    fn test_request_path() {
        let request = TransportRequest::delete(["threads", "t-1"]);
        assert_eq!(request.path(), "/threads/t-1");
        assert_eq!(request.method, Method::Delete);
    }

    #[tokio::test]
    async fn test_open_streams_frames_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/message"))
            .and(header("cookie", "session=abc"))
            .and(body_json(json!({ "message": "hi" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(
                        "event: progress\ndata: {\"content\":\"a\"}\n\n\
                         event: complete\ndata: {\"threadId\":\"t-1\"}\n\n",
                    ),
            )
            .mount(&server)
            .await;

        let transport = transport_for(&server, Some("abc"));
        let request = TransportRequest::post(["agent", "message"], json!({ "message": "hi" }));
        let frames: Vec<_> = transport
            .open(request, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                Ok(Frame::new("progress", r#"{"content":"a"}"#)),
                Ok(Frame::new("complete", r#"{"threadId":"t-1"}"#)),
            ]
        );
    }

    #[tokio::test]
    async fn test_open_maps_401_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = transport_for(&server, None);
        let request = TransportRequest::post(["agent", "message"], json!({ "message": "hi" }));
        let result = transport.open(request, CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_fetch_maps_other_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/threads"))
            .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"error":"db down"}"#))
            .mount(&server)
            .await;

        let transport = transport_for(&server, None);
        let err = transport
            .fetch(TransportRequest::get(["threads"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Status {
                status: 500,
                message: "db down".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_open_after_cancel_returns_cancelled() {
        let server = MockServer::start().await;
        let transport = transport_for(&server, None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = TransportRequest::post(["agent", "message"], json!({ "message": "hi" }));
        let result = transport.open(request, cancel).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellable_stops_after_signal() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let frames = channel_frames(rx);
        let cancel = CancellationToken::new();
        let mut stream = cancellable(frames, cancel.clone());

        tx.send(Ok(Frame::new("progress", "{}"))).unwrap();
        assert_eq!(
            stream.next().await,
            Some(Ok(Frame::new("progress", "{}")))
        );

        cancel.cancel();
        tx.send(Ok(Frame::new("progress", "{}"))).unwrap();
        assert_eq!(stream.next().await, Some(Err(TransportError::Cancelled)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_sse_frames_keeps_named_event_without_data() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"event: comp")),
            Ok(Bytes::from_static(b"lete\r")),
            Ok(Bytes::from_static(
                b"\n\r\nevent: progress\ndata: {}\n\n: keep-alive\n\nevent: error\ndata:\n\n",
            )),
        ];
        let frames: Vec<_> = sse_frames(stream::iter(chunks)).collect().await;

        assert_eq!(
            frames,
            vec![
                Ok(Frame::new("complete", "")),
                Ok(Frame::new("progress", "{}")),
                Ok(Frame::new("error", "")),
            ]
        );
    }

    #[tokio::test]
    async fn test_sse_frames_flushes_unterminated_tail() {
        let chunks = vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"event: progress\ndata: {\"content\":\"a\"}",
        ))];
        let mut marker = DatalessEventMarker::new(stream::iter(chunks));

        let mut out = Vec::new();
        while let Some(chunk) = marker.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"event: progress\ndata: {\"content\":\"a\"}");
    }

    fn channel_frames(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    ) -> FrameStream {
        stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }
}
