//! Ingestion task: one bounded run over a stream connection.
//!
//! A run obtains a connection (reusing the client's if it is still valid for
//! the same endpoint), reads lines under a rolling per-line deadline and an
//! optional overall cap, decodes them, and delivers the batch exactly once
//! unless it was cancelled. Every failure is folded into a [`RunOutcome`];
//! nothing is raised across the thread boundary.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::core::config::IngestConfig;
use crate::core::errors::{Result, TwsError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::tweet::{Tweet, decode_line};
use crate::stream::cancel::CancelToken;
use crate::stream::client::StreamKind;
use crate::stream::connection::{Connector, LineRead, StreamConnection, endpoint_label};

/// Connection shared between a client and its runs.
pub type ConnectionSlot = Arc<Mutex<Option<Arc<StreamConnection>>>>;

// ──────────────────── states and outcomes ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Why a delivered run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `max_batch_size` records decoded.
    BatchFull,
    EndOfStream,
    /// No line within the per-line deadline.
    ReadTimeout,
    /// The overall run cap elapsed.
    RunTimeout,
    /// The stream failed mid-read; the batch holds what arrived before.
    ReadError,
    ConnectFailed,
    /// The endpoint answered with a non-success status.
    Rejected { status: u16 },
}

impl RunOutcome {
    pub const fn label(self) -> &'static str {
        match self {
            Self::BatchFull => "batch_full",
            Self::EndOfStream => "end_of_stream",
            Self::ReadTimeout => "read_timeout",
            Self::RunTimeout => "run_timeout",
            Self::ReadError => "read_error",
            Self::ConnectFailed => "connect_failed",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// The run never reached a readable stream.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::ConnectFailed | Self::Rejected { .. })
    }
}

/// A finished run, delivered once to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReady {
    pub run_id: u64,
    pub stream: StreamKind,
    /// Arrival order. Empty means nothing new.
    pub tweets: Vec<Tweet>,
    pub outcome: RunOutcome,
}

// ──────────────────── spawn ────────────────────

/// Everything a run needs.
pub struct TaskSpec {
    pub run_id: u64,
    pub stream: StreamKind,
    pub url: String,
    pub connector: Connector,
    pub slot: ConnectionSlot,
    pub ingest: IngestConfig,
    pub activity: ActivityLoggerHandle,
    pub listener: Sender<BatchReady>,
}

/// Caller-side view of a running task.
pub struct IngestionHandle {
    run_id: u64,
    state: Arc<AtomicU8>,
    cancel: CancelToken,
    done: Receiver<()>,
}

impl IngestionHandle {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// False once the run finished or cancellation was requested.
    pub fn is_running(&self) -> bool {
        !self.state().is_terminal() && !self.cancel.is_cancelled()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Wait for the task thread to finish. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

/// Start a run on its own thread.
pub fn spawn(spec: TaskSpec) -> Result<IngestionHandle> {
    let state = Arc::new(AtomicU8::new(TaskState::Pending as u8));
    let cancel = CancelToken::new();
    let (done_tx, done_rx) = bounded::<()>(0);

    let handle = IngestionHandle {
        run_id: spec.run_id,
        state: Arc::clone(&state),
        cancel: cancel.clone(),
        done: done_rx,
    };

    thread::Builder::new()
        .name(format!("tws-ingest-{}", spec.stream.as_str()))
        .spawn(move || {
            let _done = done_tx;
            state.store(TaskState::Running as u8, Ordering::SeqCst);
            let terminal = IngestionRun::new(spec, cancel).execute();
            state.store(terminal as u8, Ordering::SeqCst);
        })
        .map_err(|e| TwsError::Runtime {
            details: format!("failed to spawn ingestion thread: {e}"),
        })?;

    Ok(handle)
}

// ──────────────────── run ────────────────────

enum Acquired {
    Connection(Arc<StreamConnection>),
    Cancelled,
    Failed,
}

struct IngestionRun {
    spec: TaskSpec,
    cancel: CancelToken,
    started: Instant,
    tweets: Vec<Tweet>,
}

impl IngestionRun {
    fn new(spec: TaskSpec, cancel: CancelToken) -> Self {
        Self {
            spec,
            cancel,
            started: Instant::now(),
            tweets: Vec::new(),
        }
    }

    fn execute(mut self) -> TaskState {
        let conn = match self.acquire() {
            Acquired::Connection(conn) => conn,
            Acquired::Cancelled => return self.finish_cancelled(),
            Acquired::Failed => return self.deliver(RunOutcome::ConnectFailed),
        };

        if !conn.is_valid() {
            let status = conn.status();
            let diagnostic = conn
                .diagnostic_line(self.spec.ingest.read_timeout(), &self.cancel)
                .unwrap_or_default();
            self.spec.activity.send(ActivityEvent::ProtocolError {
                stream: self.spec.stream.as_str(),
                run_id: self.spec.run_id,
                status,
                diagnostic,
            });
            self.release(&conn);
            if self.cancel.is_cancelled() {
                return self.finish_cancelled();
            }
            return self.deliver(RunOutcome::Rejected { status });
        }

        match self.read_loop(&conn) {
            Some(outcome) => {
                if matches!(outcome, RunOutcome::EndOfStream | RunOutcome::ReadError) {
                    self.release(&conn);
                }
                self.deliver(outcome)
            }
            None => {
                self.release(&conn);
                self.finish_cancelled()
            }
        }
    }

    /// Reuse the slot's connection when it is still valid for this endpoint,
    /// otherwise open a new one and publish it in the slot.
    fn acquire(&self) -> Acquired {
        if self.cancel.is_cancelled() {
            return Acquired::Cancelled;
        }
        {
            let slot = self.spec.slot.lock();
            if let Some(existing) = slot.as_ref()
                && existing.is_valid()
                && existing.url() == self.spec.url
            {
                self.opened(existing, true);
                return Acquired::Connection(Arc::clone(existing));
            }
        }

        // Handshake outside the lock so teardown can always get in.
        let conn = match self.spec.connector.open(&self.spec.url) {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                self.spec.activity.send(ActivityEvent::StreamFailed {
                    stream: self.spec.stream.as_str(),
                    run_id: self.spec.run_id,
                    code: err.code().to_string(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                });
                return if self.cancel.is_cancelled() {
                    Acquired::Cancelled
                } else {
                    Acquired::Failed
                };
            }
        };

        let mut slot = self.spec.slot.lock();
        if self.cancel.is_cancelled() {
            conn.release();
            return Acquired::Cancelled;
        }
        if let Some(previous) = slot.replace(Arc::clone(&conn)) {
            previous.release();
        }
        self.opened(&conn, false);
        Acquired::Connection(conn)
    }

    fn opened(&self, conn: &StreamConnection, reused: bool) {
        self.spec.activity.send(ActivityEvent::StreamOpened {
            stream: self.spec.stream.as_str(),
            run_id: self.spec.run_id,
            endpoint: endpoint_label(conn.url()),
            status: conn.status(),
            reused,
        });
    }

    /// `None` means the run was cancelled.
    fn read_loop(&mut self, conn: &StreamConnection) -> Option<RunOutcome> {
        let read_timeout = self.spec.ingest.read_timeout();
        let max_run = self.spec.ingest.max_run();
        let max_batch = self.spec.ingest.max_batch_size;
        let mut last_line = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let now = Instant::now();
            let mut wait = (last_line + read_timeout).saturating_duration_since(now);
            let mut limit = RunOutcome::ReadTimeout;
            if let Some(max_run) = max_run {
                let run_left = (self.started + max_run).saturating_duration_since(now);
                if run_left < wait {
                    wait = run_left;
                    limit = RunOutcome::RunTimeout;
                }
            }
            if wait.is_zero() {
                return Some(limit);
            }

            let line = match conn.read_line(wait, &self.cancel) {
                Ok(LineRead::Line(line)) => line,
                Ok(LineRead::TimedOut) => continue,
                Ok(LineRead::Cancelled) => return None,
                Ok(LineRead::Eof) => return Some(RunOutcome::EndOfStream),
                Err(err) => {
                    self.spec.activity.send(ActivityEvent::StreamFailed {
                        stream: self.spec.stream.as_str(),
                        run_id: self.spec.run_id,
                        code: err.code().to_string(),
                        message: err.to_string(),
                        retryable: err.is_retryable(),
                    });
                    return Some(RunOutcome::ReadError);
                }
            };

            if self.cancel.is_cancelled() {
                return None;
            }
            last_line = Instant::now();

            match decode_line(&line) {
                Ok(Some(tweet)) => {
                    self.tweets.push(tweet);
                    if self.tweets.len() >= max_batch {
                        return Some(RunOutcome::BatchFull);
                    }
                }
                Ok(None) => {}
                Err(err) => self.spec.activity.send(ActivityEvent::LineSkipped {
                    stream: self.spec.stream.as_str(),
                    run_id: self.spec.run_id,
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            }
        }
    }

    /// Release `conn` and clear the slot if it still holds it.
    fn release(&self, conn: &Arc<StreamConnection>) {
        conn.release();
        let mut slot = self.spec.slot.lock();
        if slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, conn)) {
            slot.take();
        }
    }

    fn deliver(self, outcome: RunOutcome) -> TaskState {
        if self.cancel.is_cancelled() {
            return self.finish_cancelled();
        }
        let records = self.tweets.len();
        self.spec.activity.send(ActivityEvent::RunFinished {
            stream: self.spec.stream.as_str(),
            run_id: self.spec.run_id,
            records,
            outcome: outcome.label(),
            duration_ms: elapsed_ms(self.started),
        });
        let _ = self.spec.listener.send(BatchReady {
            run_id: self.spec.run_id,
            stream: self.spec.stream,
            tweets: self.tweets,
            outcome,
        });
        if outcome.is_failure() {
            TaskState::Failed
        } else {
            TaskState::Completed
        }
    }

    fn finish_cancelled(self) -> TaskState {
        self.spec.activity.send(ActivityEvent::RunCancelled {
            stream: self.spec.stream.as_str(),
            run_id: self.spec.run_id,
            discarded: self.tweets.len(),
            duration_ms: elapsed_ms(self.started),
        });
        TaskState::Cancelled
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HttpMethod;
    use crate::stream::connection::{RawResponse, StreamRequest, Transport};
    use std::io::{self, Cursor, Read};
    use std::sync::atomic::AtomicUsize;

    /// Serves fixed bodies and counts handshakes.
    struct FixedTransport {
        status: u16,
        body: String,
        opens: AtomicUsize,
    }

    impl Transport for FixedTransport {
        fn open(&self, _: &StreamRequest) -> Result<RawResponse> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(RawResponse::new(
                self.status,
                Box::new(Cursor::new(self.body.clone().into_bytes())),
            ))
        }
    }

    /// Body that yields its lines and then stays silent until dropped.
    struct QuietAfter(Cursor<Vec<u8>>);

    impl Read for QuietAfter {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.0.read(out)?;
            if n > 0 {
                return Ok(n);
            }
            thread::sleep(Duration::from_millis(10));
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    struct QuietTransport(String);

    impl Transport for QuietTransport {
        fn open(&self, _: &StreamRequest) -> Result<RawResponse> {
            Ok(RawResponse::new(
                200,
                Box::new(QuietAfter(Cursor::new(self.0.clone().into_bytes()))),
            ))
        }
    }

    struct Refused;

    impl Transport for Refused {
        fn open(&self, request: &StreamRequest) -> Result<RawResponse> {
            Err(TwsError::transport(&request.url, "connection refused"))
        }
    }

    fn ingest(read_timeout_ms: u64, max_batch_size: usize) -> IngestConfig {
        IngestConfig {
            read_timeout_ms,
            max_batch_size,
            max_run_ms: 0,
        }
    }

    fn run(
        transport: Arc<dyn Transport>,
        ingest: IngestConfig,
    ) -> (IngestionHandle, Receiver<BatchReady>, ConnectionSlot) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let slot: ConnectionSlot = Arc::new(Mutex::new(None));
        let handle = spawn(TaskSpec {
            run_id: 1,
            stream: StreamKind::Live,
            url: "https://stream.example/sample.json".to_string(),
            connector: Connector::new(transport, None, HttpMethod::Post, false),
            slot: Arc::clone(&slot),
            ingest,
            activity: ActivityLoggerHandle::disabled(),
            listener: tx,
        })
        .unwrap();
        (handle, rx, slot)
    }

    fn fixed(status: u16, body: &str) -> Arc<FixedTransport> {
        Arc::new(FixedTransport {
            status,
            body: body.to_string(),
            opens: AtomicUsize::new(0),
        })
    }

    fn texts(batch: &BatchReady) -> Vec<&str> {
        batch.tweets.iter().map(Tweet::text).collect()
    }

    const RECV: Duration = Duration::from_secs(5);

    #[test]
    fn malformed_line_is_skipped() {
        let (handle, rx, _) = run(
            fixed(200, "{\"text\":\"a\"}\nnot-json\n{\"text\":\"b\"}\n"),
            ingest(2_000, 50),
        );
        let batch = rx.recv_timeout(RECV).unwrap();
        assert_eq!(texts(&batch), vec!["a", "b"]);
        assert_eq!(batch.outcome, RunOutcome::EndOfStream);
        assert!(handle.wait(RECV));
        assert_eq!(handle.state(), TaskState::Completed);
    }

    #[test]
    fn batch_stops_at_max_size() {
        let body: String = (0..10).map(|i| format!("{{\"text\":\"t{i}\"}}\n")).collect();
        let (_handle, rx, slot) = run(fixed(200, &body), ingest(2_000, 4));
        let batch = rx.recv_timeout(RECV).unwrap();
        assert_eq!(texts(&batch), vec!["t0", "t1", "t2", "t3"]);
        assert_eq!(batch.outcome, RunOutcome::BatchFull);
        assert!(slot.lock().is_some(), "full batch keeps the connection");
    }

    #[test]
    fn silence_ends_run_with_partial_batch() {
        let (_handle, rx, _) = run(
            Arc::new(QuietTransport(
                "{\"text\":\"1\"}\n\n{\"text\":\"2\"}\n{\"text\":\"3\"}\n".to_string(),
            )),
            ingest(150, 50),
        );
        let batch = rx.recv_timeout(RECV).unwrap();
        assert_eq!(texts(&batch), vec!["1", "2", "3"]);
        assert_eq!(batch.outcome, RunOutcome::ReadTimeout);
    }

    #[test]
    fn run_cap_bounds_a_trickling_stream() {
        let mut cfg = ingest(5_000, 50);
        cfg.max_run_ms = 100;
        let (_handle, rx, _) = run(Arc::new(QuietTransport(String::new())), cfg);
        let batch = rx.recv_timeout(RECV).unwrap();
        assert!(batch.tweets.is_empty());
        assert_eq!(batch.outcome, RunOutcome::RunTimeout);
    }

    #[test]
    fn rejected_status_yields_no_records() {
        let (handle, rx, slot) = run(
            fixed(503, "{\"text\":\"should not appear\"}\n"),
            ingest(500, 50),
        );
        let batch = rx.recv_timeout(RECV).unwrap();
        assert!(batch.tweets.is_empty());
        assert_eq!(batch.outcome, RunOutcome::Rejected { status: 503 });
        assert!(handle.wait(RECV));
        assert_eq!(handle.state(), TaskState::Failed);
        assert!(slot.lock().is_none());
    }

    #[test]
    fn connect_failure_still_delivers_empty() {
        let (handle, rx, _) = run(Arc::new(Refused), ingest(500, 50));
        let batch = rx.recv_timeout(RECV).unwrap();
        assert!(batch.tweets.is_empty());
        assert_eq!(batch.outcome, RunOutcome::ConnectFailed);
        assert!(handle.wait(RECV));
        assert_eq!(handle.state(), TaskState::Failed);
    }

    #[test]
    fn cancellation_suppresses_delivery() {
        let (handle, rx, slot) = run(Arc::new(QuietTransport(String::new())), ingest(5_000, 50));
        thread::sleep(Duration::from_millis(50));
        assert!(handle.cancel());
        assert!(!handle.is_running());
        assert!(handle.wait(RECV));
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(rx.try_recv().is_err());
        assert!(slot.lock().is_none(), "cancelled run releases its connection");
    }

    #[test]
    fn valid_connection_is_reused() {
        let transport = fixed(200, "{\"text\":\"a\"}\n{\"text\":\"b\"}\n");
        let (tx, rx) = crossbeam_channel::unbounded();
        let slot: ConnectionSlot = Arc::new(Mutex::new(None));
        let connector = Connector::new(transport.clone(), None, HttpMethod::Post, false);
        for run_id in 1..=2 {
            let handle = spawn(TaskSpec {
                run_id,
                stream: StreamKind::Live,
                url: "https://stream.example/sample.json".to_string(),
                connector: connector.clone(),
                slot: Arc::clone(&slot),
                ingest: ingest(2_000, 1),
                activity: ActivityLoggerHandle::disabled(),
                listener: tx.clone(),
            })
            .unwrap();
            assert!(handle.wait(RECV));
        }
        let first = rx.recv_timeout(RECV).unwrap();
        let second = rx.recv_timeout(RECV).unwrap();
        assert_eq!(texts(&first), vec!["a"]);
        assert_eq!(texts(&second), vec!["b"]);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decode_errors_are_logged() {
        let (activity, events) = ActivityLoggerHandle::channel(64);
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = spawn(TaskSpec {
            run_id: 9,
            stream: StreamKind::Search,
            url: "https://stream.example/filter.json?track=x".to_string(),
            connector: Connector::new(fixed(200, "oops\n"), None, HttpMethod::Post, false),
            slot: Arc::new(Mutex::new(None)),
            ingest: ingest(2_000, 50),
            activity,
            listener: tx,
        })
        .unwrap();
        assert!(handle.wait(RECV));
        assert!(rx.recv_timeout(RECV).unwrap().tweets.is_empty());
        let skipped = events
            .try_iter()
            .filter(|e| matches!(e, ActivityEvent::LineSkipped { run_id: 9, .. }))
            .count();
        assert_eq!(skipped, 1);
    }
}
