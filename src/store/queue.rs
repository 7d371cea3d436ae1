//! Bounded persistence queue drained by a fixed pool of writer threads.
//!
//! Submissions return immediately with a [`JobTicket`]; workers apply each job
//! as a single repository transaction, notify observers on commit, and report
//! the row count (or the failure) through the ticket. A full queue either
//! blocks the submitter for a bounded time or rejects outright, depending on
//! [`SaturationPolicy`].

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::core::config::{PersistenceConfig, SaturationPolicy};
use crate::core::errors::{Result, TwsError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::tweet::Tweet;
use crate::store::notify::{ChangeEvent, ChangeKind, ChangeNotifier};
use crate::store::sqlite::{Destination, TweetRepository};

// ──────────────────── jobs ────────────────────

enum JobKind {
    Append(Vec<Tweet>),
    Replace(Vec<Tweet>),
    Clear,
}

impl JobKind {
    const fn label(&self) -> &'static str {
        match self {
            Self::Append(_) => "append",
            Self::Replace(_) => "replace",
            Self::Clear => "clear",
        }
    }
}

struct Job {
    destination: Destination,
    kind: JobKind,
    reply: Sender<Result<usize>>,
}

/// Completion handle for a submitted job.
#[derive(Debug)]
pub struct JobTicket {
    reply: Receiver<Result<usize>>,
}

impl JobTicket {
    /// Rows affected, once the job has committed or failed.
    ///
    /// Returns `None` if the job has not finished within `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<Result<usize>> {
        match self.reply.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(TwsError::ChannelClosed {
                component: "persistence-worker",
            })),
        }
    }
}

// ──────────────────── queue ────────────────────

pub struct PersistenceQueue {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    capacity: usize,
    policy: SaturationPolicy,
    block_timeout: Duration,
    activity: ActivityLoggerHandle,
}

impl PersistenceQueue {
    /// Spawn the worker pool.
    pub fn start(
        repository: Arc<dyn TweetRepository>,
        notifier: Arc<ChangeNotifier>,
        config: &PersistenceConfig,
        activity: ActivityLoggerHandle,
    ) -> Result<Self> {
        let capacity = config.queue_capacity.max(1);
        let worker_count = config.effective_workers().max(1);
        let (tx, rx) = crossbeam_channel::bounded::<Job>(capacity);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let rx = rx.clone();
            let repository = Arc::clone(&repository);
            let notifier = Arc::clone(&notifier);
            let activity = activity.clone();
            let join = thread::Builder::new()
                .name(format!("tws-persist-{index}"))
                .spawn(move || worker_main(&rx, repository.as_ref(), &notifier, &activity))
                .map_err(|e| TwsError::Runtime {
                    details: format!("failed to spawn persistence worker: {e}"),
                })?;
            workers.push(join);
        }

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            worker_count,
            capacity,
            policy: config.saturation,
            block_timeout: config.block_timeout(),
            activity,
        })
    }

    pub fn enqueue_append(&self, batch: Vec<Tweet>, destination: Destination) -> Result<JobTicket> {
        self.submit(destination, JobKind::Append(batch))
    }

    /// Clear `destination` and write `batch` as one transaction.
    pub fn enqueue_replace(&self, batch: Vec<Tweet>, destination: Destination) -> Result<JobTicket> {
        self.submit(destination, JobKind::Replace(batch))
    }

    pub fn clear_destination(&self, destination: Destination) -> Result<JobTicket> {
        self.submit(destination, JobKind::Clear)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, Sender::len)
    }

    /// Stop accepting work, let workers drain what is queued, and join them.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for join in workers {
            let _ = join.join();
        }
    }

    fn submit(&self, destination: Destination, kind: JobKind) -> Result<JobTicket> {
        let closed = TwsError::ChannelClosed {
            component: "persistence-queue",
        };
        // Clone out so a blocked submitter does not hold the lock against shutdown.
        let Some(sender) = self.sender.lock().clone() else {
            return Err(closed);
        };

        let (reply, ticket) = crossbeam_channel::bounded(1);
        let job = Job {
            destination,
            kind,
            reply,
        };

        let sent = match self.policy {
            SaturationPolicy::Reject => match sender.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(None),
                Err(TrySendError::Disconnected(_)) => Err(Some(closed)),
            },
            SaturationPolicy::Block => match sender.send_timeout(job, self.block_timeout) {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(None),
                Err(SendTimeoutError::Disconnected(_)) => Err(Some(closed)),
            },
        };

        match sent {
            Ok(()) => Ok(JobTicket { reply: ticket }),
            Err(Some(err)) => Err(err),
            Err(None) => {
                self.activity.send(ActivityEvent::QueueSaturated {
                    destination: destination.as_str(),
                    capacity: self.capacity,
                });
                Err(TwsError::QueueSaturated {
                    capacity: self.capacity,
                })
            }
        }
    }
}

impl Drop for PersistenceQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ──────────────────── worker ────────────────────

fn worker_main(
    rx: &Receiver<Job>,
    repository: &dyn TweetRepository,
    notifier: &ChangeNotifier,
    activity: &ActivityLoggerHandle,
) {
    while let Ok(job) = rx.recv() {
        let started = Instant::now();
        let mode = job.kind.label();
        let destination = job.destination;

        let (result, change) = match &job.kind {
            JobKind::Append(batch) => (
                repository.insert_batch(destination, batch),
                ChangeKind::Inserted,
            ),
            JobKind::Replace(batch) => (
                repository.replace_batch(destination, batch),
                ChangeKind::Replaced,
            ),
            JobKind::Clear => (repository.delete_all(destination), ChangeKind::Cleared),
        };

        match &result {
            Ok(rows) => {
                activity.send(ActivityEvent::BatchPersisted {
                    destination: destination.as_str(),
                    mode,
                    rows: *rows,
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
                if *rows > 0 || change != ChangeKind::Inserted {
                    notifier.notify(ChangeEvent {
                        destination,
                        kind: change,
                        rows: *rows,
                    });
                }
            }
            Err(err) => {
                activity.send(ActivityEvent::PersistFailed {
                    destination: destination.as_str(),
                    mode,
                    code: err.code().to_string(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                });
            }
        }

        // Submitter may have stopped waiting.
        let _ = job.reply.send(result);
    }
}
