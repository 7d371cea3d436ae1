//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use tweet_stream_ingest::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, SaturationPolicy};
pub use crate::core::errors::{Result, TwsError};

// Model
pub use crate::model::tweet::{Tweet, User, decode_line};

// Stream
pub use crate::stream::client::{RequestOutcome, StreamClient, StreamKind};
pub use crate::stream::connection::{
    ConnectionState, Connector, HttpTransport, StreamConnection, Transport,
};
pub use crate::stream::task::{BatchReady, RunOutcome, TaskState};

// Store
pub use crate::store::notify::{ChangeEvent, ChangeKind, ChangeNotifier};
pub use crate::store::queue::{JobTicket, PersistenceQueue};
pub use crate::store::sqlite::{Destination, StoredTweet, TweetRepository, TweetStore};

// Engine
pub use crate::engine::{
    AlwaysOnline, Connectivity, EngineEvent, EngineParts, IngestionEngine, RefreshStatus,
    TcpProbe,
};
