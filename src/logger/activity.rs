//! Activity logger: a dedicated thread owns the `JsonlWriter`.
//!
//! Ingestion tasks, the persistence pool and the engine send `ActivityEvent`s
//! over a bounded crossbeam channel. `try_send()` keeps producers from ever
//! blocking on logging; events that do not fit are counted and reported in
//! the log once the backlog clears.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, TwsError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

// ──────────────────── channel capacity ────────────────────

const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── public event type ────────────────────

/// Events recorded in the activity log.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    EngineStarted {
        version: String,
        config_hash: String,
    },
    EngineStopped {
        reason: String,
        uptime_secs: u64,
    },
    StreamOpened {
        stream: &'static str,
        run_id: u64,
        endpoint: String,
        status: u16,
        reused: bool,
    },
    /// A request was dropped because a run is already in flight.
    StreamRejected {
        stream: &'static str,
        reason: String,
    },
    StreamFailed {
        stream: &'static str,
        run_id: u64,
        code: String,
        message: String,
        /// Logged as a warning when a later attempt may succeed.
        retryable: bool,
    },
    ProtocolError {
        stream: &'static str,
        run_id: u64,
        status: u16,
        diagnostic: String,
    },
    LineSkipped {
        stream: &'static str,
        run_id: u64,
        code: String,
        message: String,
    },
    RunFinished {
        stream: &'static str,
        run_id: u64,
        records: usize,
        outcome: &'static str,
        duration_ms: u64,
    },
    RunCancelled {
        stream: &'static str,
        run_id: u64,
        discarded: usize,
        duration_ms: u64,
    },
    BatchPersisted {
        destination: &'static str,
        mode: &'static str,
        rows: usize,
        duration_ms: u64,
    },
    PersistFailed {
        destination: &'static str,
        mode: &'static str,
        code: String,
        message: String,
        retryable: bool,
    },
    QueueSaturated {
        destination: &'static str,
        capacity: usize,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

// ──────────────────── public handle ────────────────────

/// Cheaply cloneable handle for sending log events. Never blocks.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Handle plus the raw receiving end, for embedders that consume events
    /// themselves instead of writing a JSONL file.
    pub fn channel(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A handle whose events go nowhere.
    pub fn disabled() -> Self {
        let (handle, _rx) = Self::channel(1);
        handle
    }

    /// Send an event to the logger thread.
    ///
    /// If the channel is full the event is dropped and counted.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine: logging disabled or shutting down.
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

// ──────────────────── configuration ────────────────────

/// Options for the activity logger thread.
pub struct ActivityLoggerConfig {
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            jsonl_config: JsonlConfig::at(path),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread and return a handle.
///
/// The thread runs until `handle.shutdown()` is called or every handle is dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (handle, rx) = ActivityLoggerHandle::channel(config.channel_capacity);
    let dropped = Arc::clone(&handle.dropped_events);

    let join = thread::Builder::new()
        .name("tws-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl_config, &dropped))
        .map_err(|e| TwsError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(config);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::QueueSaturate, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        if let Some(entry) = event_to_log_entry(&event) {
            jsonl.write_entry(&entry);
        }
    }

    jsonl.flush();
}

// ──────────────────── event conversion ────────────────────

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> Option<LogEntry> {
    let entry = match event {
        ActivityEvent::EngineStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::EngineStart, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e
        }
        ActivityEvent::EngineStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::EngineStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e
        }
        ActivityEvent::StreamOpened {
            stream,
            run_id,
            endpoint,
            status,
            reused,
        } => {
            let mut e = LogEntry::new(EventType::StreamOpen, Severity::Info);
            e.stream = Some((*stream).to_string());
            e.run_id = Some(*run_id);
            e.endpoint = Some(endpoint.clone());
            e.status = Some(*status);
            e.details = Some(format!("reused={reused}"));
            e
        }
        ActivityEvent::StreamRejected { stream, reason } => {
            let mut e = LogEntry::new(EventType::StreamReject, Severity::Info);
            e.stream = Some((*stream).to_string());
            e.details = Some(reason.clone());
            e
        }
        ActivityEvent::StreamFailed {
            stream,
            run_id,
            code,
            message,
            retryable,
        } => {
            let mut e = LogEntry::new(EventType::StreamFail, failure_severity(*retryable));
            e.stream = Some((*stream).to_string());
            e.run_id = Some(*run_id);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::ProtocolError {
            stream,
            run_id,
            status,
            diagnostic,
        } => {
            let mut e = LogEntry::new(EventType::ProtocolError, Severity::Error);
            e.stream = Some((*stream).to_string());
            e.run_id = Some(*run_id);
            e.status = Some(*status);
            e.error_code = Some("TWS-2003".to_string());
            e.error_message = Some(diagnostic.clone());
            e
        }
        ActivityEvent::LineSkipped {
            stream,
            run_id,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::LineSkip, Severity::Warning);
            e.stream = Some((*stream).to_string());
            e.run_id = Some(*run_id);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::RunFinished {
            stream,
            run_id,
            records,
            outcome,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::RunFinish, Severity::Info);
            e.stream = Some((*stream).to_string());
            e.run_id = Some(*run_id);
            e.records = Some(*records as u64);
            e.outcome = Some((*outcome).to_string());
            e.duration_ms = Some(*duration_ms);
            e
        }
        ActivityEvent::RunCancelled {
            stream,
            run_id,
            discarded,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::RunCancel, Severity::Info);
            e.stream = Some((*stream).to_string());
            e.run_id = Some(*run_id);
            e.records = Some(*discarded as u64);
            e.duration_ms = Some(*duration_ms);
            e
        }
        ActivityEvent::BatchPersisted {
            destination,
            mode,
            rows,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::BatchPersist, Severity::Info);
            e.destination = Some((*destination).to_string());
            e.records = Some(*rows as u64);
            e.duration_ms = Some(*duration_ms);
            e.details = Some(format!("mode={mode}"));
            e
        }
        ActivityEvent::PersistFailed {
            destination,
            mode,
            code,
            message,
            retryable,
        } => {
            let mut e = LogEntry::new(EventType::PersistFail, failure_severity(*retryable));
            e.destination = Some((*destination).to_string());
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.details = Some(format!("mode={mode}"));
            e
        }
        ActivityEvent::QueueSaturated {
            destination,
            capacity,
        } => {
            let mut e = LogEntry::new(EventType::QueueSaturate, Severity::Warning);
            e.destination = Some((*destination).to_string());
            e.details = Some(format!("capacity={capacity}"));
            e
        }
        ActivityEvent::Shutdown => return None,
    };
    Some(entry)
}

const fn failure_severity(retryable: bool) -> Severity {
    if retryable {
        Severity::Warning
    } else {
        Severity::Error
    }
}

// ──────────────────── tests ────────────────────
