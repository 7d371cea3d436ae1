//! Streaming side of the engine: request signing, connections, ingestion
//! runs and the single-flight client that drives them.

pub mod auth;
pub mod cancel;
pub mod client;
pub mod connection;
pub mod task;
