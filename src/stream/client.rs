//! Stream client: single-flight ingestion runs over one logical stream.
//!
//! A client owns at most one running [`IngestionHandle`] and the connection
//! slot its runs share. Continuous requests reuse a still-valid connection to
//! the sample endpoint; filtered requests build the filter URL from
//! percent-encoded track text.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::core::config::{IngestConfig, StreamConfig};
use crate::core::errors::{Result, TwsError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::stream::auth::percent_encode;
use crate::stream::connection::{ConnectionState, Connector};
use crate::stream::task::{self, BatchReady, ConnectionSlot, IngestionHandle, TaskSpec};

/// Logical stream a client serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Unfiltered sample stream feeding the live table.
    Live,
    /// Track-filtered stream feeding the search table.
    Search,
}

impl StreamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Search => "search",
        }
    }
}

/// Whether a request started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Started { run_id: u64 },
    /// Dropped: a run is already in flight.
    AlreadyRunning,
}

pub struct StreamClient {
    kind: StreamKind,
    sample_url: String,
    filter_url: String,
    connector: Connector,
    ingest: IngestConfig,
    activity: ActivityLoggerHandle,
    slot: ConnectionSlot,
    current: Mutex<Option<IngestionHandle>>,
    next_run: AtomicU64,
}

impl StreamClient {
    pub fn new(
        kind: StreamKind,
        stream: &StreamConfig,
        ingest: IngestConfig,
        connector: Connector,
        activity: ActivityLoggerHandle,
    ) -> Self {
        Self {
            kind,
            sample_url: stream.sample_url.clone(),
            filter_url: stream.filter_url.clone(),
            connector,
            ingest,
            activity,
            slot: Arc::new(Mutex::new(None)),
            current: Mutex::new(None),
            next_run: AtomicU64::new(1),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Start a run on the sample endpoint unless one is already running.
    pub fn request_continuous_stream(&self, listener: Sender<BatchReady>) -> Result<RequestOutcome> {
        let url = self.sample_url.clone();
        self.start(url, false, listener)
    }

    /// Start a run on the filter endpoint for `text`.
    ///
    /// With `reset_existing` a running task is cancelled and its connection
    /// released first; without it the request is dropped while one runs.
    pub fn request_filtered_stream(
        &self,
        text: &str,
        reset_existing: bool,
        listener: Sender<BatchReady>,
    ) -> Result<RequestOutcome> {
        let url = self.filter_url_for(text)?;
        self.start(url, reset_existing, listener)
    }

    /// Filter endpoint with the encoded track text appended.
    pub fn filter_url_for(&self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TwsError::InvalidFilter {
                details: "filter text is empty".to_string(),
            });
        }
        Ok(format!("{}{}", self.filter_url, percent_encode(text)))
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(IngestionHandle::is_running)
    }

    /// State of the held connection; `Unopened` when none is held.
    pub fn connection_state(&self) -> ConnectionState {
        self.slot
            .lock()
            .as_ref()
            .map_or(ConnectionState::Unopened, |conn| conn.state())
    }

    /// Cancel any running task and release the connection. Safe to repeat.
    pub fn teardown(&self) {
        if let Some(handle) = self.current.lock().as_ref() {
            handle.cancel();
        }
        self.release_connection();
    }

    /// Wait for the most recent run's thread to exit.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.wait(timeout))
    }

    fn start(
        &self,
        url: String,
        reset_existing: bool,
        listener: Sender<BatchReady>,
    ) -> Result<RequestOutcome> {
        let mut current = self.current.lock();
        if let Some(running) = current.as_ref().filter(|h| h.is_running()) {
            if !reset_existing {
                self.activity.send(ActivityEvent::StreamRejected {
                    stream: self.kind.as_str(),
                    reason: format!("run {} still in flight", running.run_id()),
                });
                return Ok(RequestOutcome::AlreadyRunning);
            }
            running.cancel();
            self.release_connection();
        }

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let handle = task::spawn(TaskSpec {
            run_id,
            stream: self.kind,
            url,
            connector: self.connector.clone(),
            slot: Arc::clone(&self.slot),
            ingest: self.ingest.clone(),
            activity: self.activity.clone(),
            listener,
        })?;
        *current = Some(handle);
        Ok(RequestOutcome::Started { run_id })
    }

    fn release_connection(&self) {
        let held = self.slot.lock().take();
        if let Some(conn) = held {
            conn.release();
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.teardown();
    }
}
