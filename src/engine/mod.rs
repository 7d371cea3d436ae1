//! Ingestion engine: two single-flight stream clients feeding one bounded
//! persistence queue.
//!
//! Architecture: each [`StreamClient`] runs at most one ingestion task. Tasks
//! hand finished batches to a dispatcher thread over a bounded channel; the
//! dispatcher routes them into the [`PersistenceQueue`] and forwards an
//! [`EngineEvent`] to the embedder. Search sessions are ordered: a new search
//! clears the search table before its fetch starts, and its first batch is
//! written as a replace that commits before any later append.

#![allow(missing_docs)]

pub mod connectivity;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::Mutex;

use crate::core::config::Config;
use crate::core::errors::{Result, TwsError};
use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use crate::model::tweet::Tweet;
use crate::store::notify::{ChangeEvent, ChangeNotifier};
use crate::store::queue::{JobTicket, PersistenceQueue};
use crate::store::sqlite::{Destination, StoredTweet, TweetRepository, TweetStore};
use crate::stream::auth::OAuthSigner;
use crate::stream::cancel::CancelToken;
use crate::stream::client::{RequestOutcome, StreamClient, StreamKind};
use crate::stream::connection::{ConnectionState, Connector, HttpTransport, Transport};
use crate::stream::task::BatchReady;

pub use connectivity::{AlwaysOnline, Connectivity, TcpProbe};

/// Task → dispatcher. Each run delivers at most once.
const BATCH_CHANNEL_CAP: usize = 16;

// ──────────────────── public types ────────────────────

/// Result of a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// No fetch was attempted.
    NoNetwork,
    Started,
    /// A run for this stream is already in flight.
    AlreadyRunning,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    NoNetwork { stream: StreamKind },
    /// A run finished. Stop any loading indicator for `stream`.
    BatchReady(BatchReady),
}

/// Collaborators injected into the engine.
pub struct EngineParts {
    pub transport: Arc<dyn Transport>,
    pub signer: Option<OAuthSigner>,
    pub connectivity: Arc<dyn Connectivity>,
    pub repository: Arc<dyn TweetRepository>,
    pub activity: ActivityLoggerHandle,
}

/// Search-table ordering state. Every search write is submitted and
/// awaited under this lock, so clears, replaces and appends commit in the
/// order they were decided.
#[derive(Debug, Default)]
struct SearchSession {
    /// First run of the current new-search session. Older runs are stale.
    first_run: u64,
    /// The session's first non-empty batch still has to replace the table.
    pending_replace: bool,
    /// A search write that outlived its wait. Nothing else touches the
    /// search table until it finishes.
    in_flight: Option<JobTicket>,
}

impl SearchSession {
    /// Wait for the outstanding search write. Its own failure is reported by
    /// the worker; only a stall is an error here.
    fn settle(&mut self, timeout: Duration) -> Result<()> {
        let Some(ticket) = self.in_flight.take() else {
            return Ok(());
        };
        if ticket.wait(timeout).is_some() {
            return Ok(());
        }
        self.in_flight = Some(ticket);
        Err(TwsError::Runtime {
            details: format!("search write still running after {}ms", timeout.as_millis()),
        })
    }
}

// ──────────────────── engine ────────────────────

pub struct IngestionEngine {
    config: Config,
    live: StreamClient,
    search: StreamClient,
    queue: Arc<PersistenceQueue>,
    repository: Arc<dyn TweetRepository>,
    notifier: Arc<ChangeNotifier>,
    connectivity: Arc<dyn Connectivity>,
    activity: ActivityLoggerHandle,
    logger: Mutex<Option<JoinHandle<()>>>,
    batches: Mutex<Option<Sender<BatchReady>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stop: CancelToken,
    session: Arc<Mutex<SearchSession>>,
    event_rx: Receiver<EngineEvent>,
    event_tx: Sender<EngineEvent>,
    stopped: AtomicBool,
    started_at: Instant,
}

impl IngestionEngine {
    /// Production wiring: HTTPS transport, OAuth signing, on-disk store and
    /// a JSONL activity log. Fails if any credential is missing.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let signer = OAuthSigner::from_credentials(&config.credentials)?;
        let transport = Arc::new(HttpTransport::new(&config.stream)?);
        let connectivity = Arc::new(TcpProbe::for_url(
            &config.stream.sample_url,
            config.stream.connect_timeout(),
        )?);
        let repository = Arc::new(TweetStore::open(&config.paths.database)?);
        let (activity, logger) =
            spawn_logger(ActivityLoggerConfig::at(config.paths.activity_log.clone()))?;

        let engine = Self::with_parts(
            config,
            EngineParts {
                transport,
                signer: Some(signer),
                connectivity,
                repository,
                activity,
            },
        )?;
        *engine.logger.lock() = Some(logger);
        Ok(engine)
    }

    pub fn with_parts(config: Config, parts: EngineParts) -> Result<Self> {
        config.validate()?;
        let EngineParts {
            transport,
            signer,
            connectivity,
            repository,
            activity,
        } = parts;

        let connector = Connector::new(
            transport,
            signer,
            config.stream.method,
            config.stream.allow_insecure_http,
        );
        let live = StreamClient::new(
            StreamKind::Live,
            &config.stream,
            config.ingest.clone(),
            connector.clone(),
            activity.clone(),
        );
        let search = StreamClient::new(
            StreamKind::Search,
            &config.stream,
            config.ingest.clone(),
            connector,
            activity.clone(),
        );

        let notifier = Arc::new(ChangeNotifier::new());
        let queue = Arc::new(PersistenceQueue::start(
            Arc::clone(&repository),
            Arc::clone(&notifier),
            &config.persistence,
            activity.clone(),
        )?);

        let (batch_tx, batch_rx) = bounded(BATCH_CHANNEL_CAP);
        let (event_tx, event_rx) = unbounded();
        let session = Arc::new(Mutex::new(SearchSession::default()));
        let stop = CancelToken::new();

        let dispatcher = Dispatcher {
            batches: batch_rx,
            stop: stop.clone(),
            queue: Arc::clone(&queue),
            session: Arc::clone(&session),
            ordering_wait: config.persistence.ordering_timeout(),
            events: event_tx.clone(),
            activity: activity.clone(),
        };
        let dispatcher = thread::Builder::new()
            .name("tws-dispatch".to_string())
            .spawn(move || dispatcher.run())
            .map_err(|e| TwsError::Runtime {
                details: format!("failed to spawn dispatcher thread: {e}"),
            })?;

        activity.send(ActivityEvent::EngineStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: config.stable_hash()?,
        });

        Ok(Self {
            config,
            live,
            search,
            queue,
            repository,
            notifier,
            connectivity,
            activity,
            logger: Mutex::new(None),
            batches: Mutex::new(Some(batch_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            stop,
            session,
            event_rx,
            event_tx,
            stopped: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Refresh the live table from the sample stream.
    pub fn start_continuous_refresh(&self) -> Result<RefreshStatus> {
        let listener = self.listener()?;
        if !self.check_network(StreamKind::Live) {
            return Ok(RefreshStatus::NoNetwork);
        }
        Ok(status(self.live.request_continuous_stream(listener)?))
    }

    /// Refresh the search table from the filter stream.
    ///
    /// A new search cancels any running search, clears the search table and
    /// only then starts fetching. Otherwise the request is dropped while a
    /// search run is in flight.
    pub fn start_filtered_refresh(&self, text: &str, is_new_search: bool) -> Result<RefreshStatus> {
        let listener = self.listener()?;
        self.search.filter_url_for(text)?;
        if !self.check_network(StreamKind::Search) {
            return Ok(RefreshStatus::NoNetwork);
        }

        // Held until the new run id is recorded so the dispatcher cannot
        // classify its batch against the previous session. The dispatcher
        // holds it across each search write, so the clear lands after any
        // write already decided for the previous session.
        let mut session = self.session.lock();
        if is_new_search {
            self.search.teardown();
            self.clear_search(&mut session)?;
        }
        let outcome = self
            .search
            .request_filtered_stream(text, is_new_search, listener)?;
        if is_new_search && let RequestOutcome::Started { run_id } = outcome {
            session.first_run = run_id;
            session.pending_replace = true;
        }
        Ok(status(outcome))
    }

    /// Notifications for the embedder. All clones share one queue.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.event_rx.clone()
    }

    /// Newest rows first, up to the configured query limit.
    pub fn recent(&self, destination: Destination) -> Result<Vec<StoredTweet>> {
        self.repository
            .query_recent(destination, self.config.persistence.query_limit)
    }

    pub fn subscribe(&self, destination: Destination) -> Receiver<ChangeEvent> {
        self.notifier.subscribe(destination)
    }

    pub fn is_refreshing(&self, stream: StreamKind) -> bool {
        self.client(stream).is_running()
    }

    pub fn connection_state(&self, stream: StreamKind) -> ConnectionState {
        self.client(stream).connection_state()
    }

    /// Wait for both clients' task threads to exit.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.live.wait_idle(timeout)
            && self
                .search
                .wait_idle(deadline.saturating_duration_since(Instant::now()))
    }

    pub fn dropped_log_events(&self) -> u64 {
        self.activity.dropped_events()
    }

    /// Cancel both streams, release their connections, drain the queue and
    /// stop background threads. Safe to repeat.
    pub fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.live.teardown();
        self.search.teardown();

        self.stop.cancel();
        drop(self.batches.lock().take());
        if let Some(join) = self.dispatcher.lock().take() {
            let _ = join.join();
        }
        self.queue.shutdown();

        self.activity.send(ActivityEvent::EngineStopped {
            reason: "teardown".to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        });
        if let Some(join) = self.logger.lock().take() {
            self.activity.shutdown();
            let _ = join.join();
        }
    }

    fn client(&self, stream: StreamKind) -> &StreamClient {
        match stream {
            StreamKind::Live => &self.live,
            StreamKind::Search => &self.search,
        }
    }

    fn listener(&self) -> Result<Sender<BatchReady>> {
        self.batches
            .lock()
            .clone()
            .ok_or(TwsError::ChannelClosed { component: "engine" })
    }

    fn check_network(&self, stream: StreamKind) -> bool {
        if self.connectivity.is_online() {
            return true;
        }
        let _ = self.event_tx.send(EngineEvent::NoNetwork { stream });
        self.activity.send(ActivityEvent::StreamRejected {
            stream: stream.as_str(),
            reason: "network unavailable".to_string(),
        });
        false
    }

    fn clear_search(&self, session: &mut SearchSession) -> Result<()> {
        let wait = self.config.persistence.ordering_timeout();
        session.settle(wait)?;
        let ticket = self.queue.clear_destination(Destination::Search)?;
        match ticket.wait(wait) {
            Some(result) => result.map(drop),
            None => {
                session.in_flight = Some(ticket);
                Err(TwsError::Runtime {
                    details: "timed out clearing search results".to_string(),
                })
            }
        }
    }
}

impl Drop for IngestionEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

const fn status(outcome: RequestOutcome) -> RefreshStatus {
    match outcome {
        RequestOutcome::Started { .. } => RefreshStatus::Started,
        RequestOutcome::AlreadyRunning => RefreshStatus::AlreadyRunning,
    }
}

// ──────────────────── dispatcher ────────────────────

struct Dispatcher {
    batches: Receiver<BatchReady>,
    stop: CancelToken,
    queue: Arc<PersistenceQueue>,
    session: Arc<Mutex<SearchSession>>,
    ordering_wait: Duration,
    events: Sender<EngineEvent>,
    activity: ActivityLoggerHandle,
}

impl Dispatcher {
    fn run(self) {
        loop {
            select! {
                recv(self.batches) -> msg => match msg {
                    Ok(batch) => self.handle(batch),
                    Err(_) => break,
                },
                recv(self.stop.signal()) -> _ => break,
            }
        }
        // Batches delivered before stop still get persisted.
        while let Ok(batch) = self.batches.try_recv() {
            self.handle(batch);
        }
    }

    fn handle(&self, batch: BatchReady) {
        if !batch.tweets.is_empty() {
            self.persist(&batch);
        }
        let _ = self.events.send(EngineEvent::BatchReady(batch));
    }

    fn persist(&self, batch: &BatchReady) {
        let destination = Destination::from(batch.stream);
        let records = batch.tweets.clone();

        let result = match batch.stream {
            StreamKind::Live => self.queue.enqueue_append(records, destination).map(drop),
            StreamKind::Search => {
                let mut session = self.session.lock();
                if batch.run_id < session.first_run {
                    self.activity.send(ActivityEvent::StreamRejected {
                        stream: batch.stream.as_str(),
                        reason: format!("stale batch from run {}", batch.run_id),
                    });
                    return;
                }
                self.persist_search(&mut session, records)
            }
        };

        if let Err(err) = result {
            self.activity.send(ActivityEvent::PersistFailed {
                destination: destination.as_str(),
                mode: "dispatch",
                code: err.code().to_string(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            });
        }
    }

    /// Submit one search write and wait for it to commit. The first batch of
    /// a session replaces the table.
    fn persist_search(&self, session: &mut SearchSession, records: Vec<Tweet>) -> Result<()> {
        session.settle(self.ordering_wait)?;
        let ticket = if session.pending_replace {
            self.queue.enqueue_replace(records, Destination::Search)?
        } else {
            self.queue.enqueue_append(records, Destination::Search)?
        };
        session.pending_replace = false;
        session.in_flight = Some(ticket);
        session.settle(self.ordering_wait)
    }
}
