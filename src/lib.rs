#![forbid(unsafe_code)]

//! Tweet stream ingestion engine.
//!
//! Two long-lived streaming clients pull records from an OAuth1-signed
//! streaming API:
//! 1. **Live**: the unfiltered sample stream, appended to the `tweets` table
//! 2. **Search**: the track-filtered stream, feeding the `tweet_search` table
//!
//! Each client runs at most one ingestion task at a time. A task reads
//! newline-delimited records under a rolling per-line deadline, batches them,
//! and hands the batch to a bounded persistence queue that writes it to
//! SQLite in one transaction.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use tweet_stream_ingest::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let engine = IngestionEngine::new(Config::load(None)?)?;
//! engine.start_continuous_refresh()?;
//! for event in engine.events() {
//!     if let EngineEvent::BatchReady(batch) = event {
//!         println!("{} records from run {}", batch.tweets.len(), batch.run_id);
//!         break;
//!     }
//! }
//! let rows = engine.recent(Destination::Live)?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
pub mod engine;
pub mod logger;
pub mod model;
pub mod store;
pub mod stream;
