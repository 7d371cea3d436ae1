//! Stream connection: one signed HTTP(S) request whose body is consumed
//! line by line.
//!
//! The handshake runs synchronously in [`Connector::open`]. The response body
//! is then owned by a pump thread that splits it into lines and feeds a
//! bounded channel, so a reader can wait on a line, the caller's cancel token
//! and the connection's own release signal at the same time. Releasing the
//! connection disconnects that channel and runs the transport's closer, which
//! shuts the socket even while the pump is blocked in a read.
//!
//! State machine:
//!
//! ```text
//! Unopened ──open──> ConnectedValid ──EOF / read error──> ConnectedInvalid
//!     │                    │                                   │
//!     └──open (status ≥ 400)──> ConnectedInvalid               │
//!                          └──────────release──────> Released <┘
//! ```

#![allow(missing_docs)]

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvError, Sender, bounded, select};
use parking_lot::Mutex;
use reqwest::Url;

use crate::core::config::{HttpMethod, StreamConfig};
use crate::core::errors::{Result, TwsError};
use crate::stream::auth::OAuthSigner;
use crate::stream::cancel::CancelToken;

/// Lines buffered between the pump thread and the reader.
const LINE_BUFFER: usize = 256;
/// Body chunks buffered between the runtime task and the pump thread.
const CHUNK_BUFFER: usize = 16;

// ──────────────────── transport seam ────────────────────

/// A fully prepared stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub method: HttpMethod,
    pub url: String,
    /// `Authorization` header value, when the request is signed.
    pub authorization: Option<String>,
}

/// Closes the transport under a body from outside the reading thread.
pub type BodyCloser = Box<dyn FnOnce() + Send>;

/// Status and body of a completed handshake.
pub struct RawResponse {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
    closer: Option<BodyCloser>,
}

impl RawResponse {
    pub fn new(status: u16, body: Box<dyn Read + Send>) -> Self {
        Self {
            status,
            body,
            closer: None,
        }
    }

    /// Attach a hook that shuts the underlying socket even while a read is blocked.
    #[must_use]
    pub fn with_closer(mut self, closer: BodyCloser) -> Self {
        self.closer = Some(closer);
        self
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("closable", &self.closer.is_some())
            .finish_non_exhaustive()
    }
}

/// Performs the blocking HTTP handshake for a stream request.
pub trait Transport: Send + Sync {
    fn open(&self, request: &StreamRequest) -> Result<RawResponse>;
}

/// `reqwest` transport. Requests run on a private runtime; each body is read
/// by a runtime task that can be aborted, which drops the response and closes
/// its socket.
pub struct HttpTransport {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl HttpTransport {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone());
        if let Some(max_age) = config.connection_max_age() {
            builder = builder.timeout(max_age);
        }
        let client = builder.build()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tws-http")
            .enable_all()
            .build()
            .map_err(|e| TwsError::Runtime {
                details: format!("failed to start http runtime: {e}"),
            })?;
        Ok(Self { client, runtime })
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: &StreamRequest) -> Result<RawResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        if let Some(auth) = &request.authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        let mut response = self
            .runtime
            .block_on(builder.send())
            .map_err(|e| TwsError::transport(&endpoint_label(&request.url), e))?;
        let status = response.status().as_u16();

        let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_BUFFER);
        let reader = self.runtime.spawn(async move {
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => Ok(chunk.to_vec()),
                    Ok(None) => break,
                    Err(e) => Err(io::Error::other(e)),
                };
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
            // `response` drops here; an unfinished body closes the connection.
        });
        let abort = reader.abort_handle();

        let body = ChunkBody {
            chunks: rx,
            pending: io::Cursor::new(Vec::new()),
        };
        Ok(RawResponse::new(status, Box::new(body)).with_closer(Box::new(move || abort.abort())))
    }
}

/// Blocking view over chunks produced by a runtime task.
struct ChunkBody {
    chunks: tokio::sync::mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: io::Cursor<Vec<u8>>,
}

impl Read for ChunkBody {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.pending.read(out)?;
            if n > 0 {
                return Ok(n);
            }
            match self.chunks.blocking_recv() {
                Some(Ok(chunk)) => self.pending = io::Cursor::new(chunk),
                Some(Err(e)) => return Err(e),
                // Body finished or its reader task was aborted.
                None => return Ok(0),
            }
        }
    }
}

// ──────────────────── connector ────────────────────

/// Builds signed requests and opens [`StreamConnection`]s over a [`Transport`].
#[derive(Clone)]
pub struct Connector {
    transport: Arc<dyn Transport>,
    signer: Option<OAuthSigner>,
    method: HttpMethod,
    allow_insecure_http: bool,
}

impl Connector {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Option<OAuthSigner>,
        method: HttpMethod,
        allow_insecure_http: bool,
    ) -> Self {
        Self {
            transport,
            signer,
            method,
            allow_insecure_http,
        }
    }

    /// Validate the endpoint, sign, and perform the handshake. Blocks.
    pub fn open(&self, url: &str) -> Result<StreamConnection> {
        self.check_endpoint(url)?;
        let authorization = match &self.signer {
            Some(signer) => Some(signer.authorization(self.method.as_str(), url, &[])?),
            None => None,
        };
        let request = StreamRequest {
            method: self.method,
            url: url.to_string(),
            authorization,
        };
        let response = self.transport.open(&request)?;
        StreamConnection::attach(url, response)
    }

    fn check_endpoint(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| TwsError::InvalidEndpoint {
            url: endpoint_label(url),
            details: e.to_string(),
        })?;
        match parsed.scheme() {
            "https" => Ok(()),
            "http" if self.allow_insecure_http => Ok(()),
            other => Err(TwsError::InvalidEndpoint {
                url: endpoint_label(url),
                details: format!("scheme {other:?} is not allowed for streaming"),
            }),
        }
    }
}

// ──────────────────── connection ────────────────────

/// Lifecycle of a stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    ConnectedValid,
    ConnectedInvalid,
    Released,
}

/// Result of waiting for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    Eof,
    TimedOut,
    Cancelled,
}

enum PumpEvent {
    Line(String),
    Eof,
    Failed(io::Error),
}

/// An open stream with a line-oriented reader.
///
/// Only the owning ingestion task reads from it; `release` may be called
/// from any thread.
pub struct StreamConnection {
    url: String,
    status: u16,
    state: Mutex<ConnectionState>,
    lines: Mutex<Option<Receiver<PumpEvent>>>,
    closer: Mutex<Option<BodyCloser>>,
    closed: CancelToken,
}

impl StreamConnection {
    /// Classify the handshake and start pumping the body.
    fn attach(url: &str, response: RawResponse) -> Result<Self> {
        let state = if (200..400).contains(&response.status) {
            ConnectionState::ConnectedValid
        } else {
            ConnectionState::ConnectedInvalid
        };
        let (tx, rx) = bounded(LINE_BUFFER);
        let closed = CancelToken::new();
        let pump_closed = closed.clone();
        let RawResponse {
            status,
            body,
            closer,
        } = response;
        thread::Builder::new()
            .name("tws-stream-pump".to_string())
            .spawn(move || pump_lines(body, &tx, &pump_closed))
            .map_err(|e| TwsError::Runtime {
                details: format!("failed to spawn stream pump thread: {e}"),
            })?;

        Ok(Self {
            url: url.to_string(),
            status,
            state: Mutex::new(state),
            lines: Mutex::new(Some(rx)),
            closer: Mutex::new(closer),
            closed,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Still attached to a live, successful stream.
    pub fn is_valid(&self) -> bool {
        self.state() == ConnectionState::ConnectedValid
    }

    /// Wait up to `timeout` for the next line of a valid stream.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires. End of stream and read
    /// failures mark the connection invalid so it is never reused.
    pub fn read_line(&self, timeout: Duration, cancel: &CancelToken) -> Result<LineRead> {
        match self.state() {
            ConnectionState::ConnectedValid => {}
            ConnectionState::Released => return Err(released_error()),
            state => {
                return Err(TwsError::StreamRead {
                    source: io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("connection is {state:?}; its body must not be decoded"),
                    ),
                });
            }
        }
        self.next_line(timeout, cancel)
    }

    /// Read one line of the error body of a rejected stream, for logging.
    pub fn diagnostic_line(&self, timeout: Duration, cancel: &CancelToken) -> Option<String> {
        if self.state() == ConnectionState::ConnectedValid {
            return None;
        }
        match self.next_line(timeout, cancel) {
            Ok(LineRead::Line(line)) => Some(line),
            _ => None,
        }
    }

    /// Close the stream. Idempotent; returns `true` for the call that released it.
    pub fn release(&self) -> bool {
        if !self.closed.cancel() {
            return false;
        }
        *self.state.lock() = ConnectionState::Released;
        // Dropping the receiver makes the pump's next send fail.
        self.lines.lock().take();
        // The pump may sit in a blocking read; shut the socket under it.
        if let Some(close) = self.closer.lock().take() {
            close();
        }
        true
    }

    fn next_line(&self, timeout: Duration, cancel: &CancelToken) -> Result<LineRead> {
        // Clone so `release` never waits behind a blocked reader.
        let Some(rx) = self.lines.lock().clone() else {
            return Err(released_error());
        };

        let event = select! {
            recv(rx) -> msg => msg,
            recv(cancel.signal()) -> _ => return Ok(LineRead::Cancelled),
            recv(self.closed.signal()) -> _ => return Err(released_error()),
            default(timeout) => return Ok(LineRead::TimedOut),
        };

        match event {
            Ok(PumpEvent::Line(line)) => Ok(LineRead::Line(line)),
            Ok(PumpEvent::Eof) | Err(RecvError) => {
                self.invalidate();
                Ok(LineRead::Eof)
            }
            Ok(PumpEvent::Failed(source)) => {
                self.invalidate();
                Err(TwsError::StreamRead { source })
            }
        }
    }

    fn invalidate(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::ConnectedValid {
            *state = ConnectionState::ConnectedInvalid;
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("endpoint", &endpoint_label(&self.url))
            .field("status", &self.status)
            .field("state", &self.state())
            .finish()
    }
}

fn released_error() -> TwsError {
    TwsError::StreamRead {
        source: io::Error::new(io::ErrorKind::NotConnected, "connection released"),
    }
}

// ──────────────────── pump thread ────────────────────

fn pump_lines(body: Box<dyn Read + Send>, tx: &Sender<PumpEvent>, closed: &CancelToken) {
    let mut reader = BufReader::new(body);
    let mut buf = Vec::new();
    loop {
        if closed.is_cancelled() {
            break;
        }
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                if !buf.is_empty() {
                    let _ = tx.send(PumpEvent::Line(take_line(&mut buf)));
                }
                let _ = tx.send(PumpEvent::Eof);
                break;
            }
            Ok(_) if buf.ends_with(b"\n") => {
                if tx.send(PumpEvent::Line(take_line(&mut buf))).is_err() {
                    break;
                }
            }
            // Partial line before EOF; the next read returns 0.
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                let _ = tx.send(PumpEvent::Failed(e));
                break;
            }
        }
    }
    // `reader` drops here, closing the underlying socket.
}

fn take_line(buf: &mut Vec<u8>) -> String {
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

/// Endpoint without its query string, safe to log.
pub fn endpoint_label(url: &str) -> String {
    url.split_once('?')
        .map_or(url, |(base, _)| base)
        .to_string()
}

// ──────────────────── tests ────────────────────
