//! TWS-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, TwsError>;

/// Top-level error type for the ingestion engine.
#[derive(Debug, Error)]
pub enum TwsError {
    #[error("[TWS-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[TWS-1002] missing configuration: {details}")]
    MissingConfig { details: String },

    #[error("[TWS-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[TWS-1101] invalid stream endpoint {url}: {details}")]
    InvalidEndpoint { url: String, details: String },

    #[error("[TWS-1102] invalid filter text: {details}")]
    InvalidFilter { details: String },

    #[error("[TWS-2001] request signing failure: {details}")]
    Signing { details: String },

    #[error("[TWS-2002] transport failure for {endpoint}: {details}")]
    Transport { endpoint: String, details: String },

    #[error("[TWS-2003] stream rejected with status {status}: {diagnostic}")]
    Protocol { status: u16, diagnostic: String },

    #[error("[TWS-2004] stream read failure: {source}")]
    StreamRead {
        #[source]
        source: std::io::Error,
    },

    #[error("[TWS-2101] malformed record: {details}")]
    Decode { details: String },

    #[error("[TWS-2102] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[TWS-2201] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[TWS-2202] persistence queue saturated (capacity {capacity})")]
    QueueSaturated { capacity: usize },

    #[error("[TWS-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[TWS-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[TWS-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl TwsError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "TWS-1001",
            Self::MissingConfig { .. } => "TWS-1002",
            Self::ConfigParse { .. } => "TWS-1003",
            Self::InvalidEndpoint { .. } => "TWS-1101",
            Self::InvalidFilter { .. } => "TWS-1102",
            Self::Signing { .. } => "TWS-2001",
            Self::Transport { .. } => "TWS-2002",
            Self::Protocol { .. } => "TWS-2003",
            Self::StreamRead { .. } => "TWS-2004",
            Self::Decode { .. } => "TWS-2101",
            Self::Serialization { .. } => "TWS-2102",
            Self::Sql { .. } => "TWS-2201",
            Self::QueueSaturated { .. } => "TWS-2202",
            Self::Io { .. } => "TWS-3002",
            Self::ChannelClosed { .. } => "TWS-3003",
            Self::Runtime { .. } => "TWS-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::StreamRead { .. }
                | Self::Sql { .. }
                | Self::QueueSaturated { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for transport errors against an endpoint.
    #[must_use]
    pub fn transport(endpoint: &str, details: impl ToString) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<rusqlite::Error> for TwsError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for TwsError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for TwsError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for TwsError {
    fn from(value: reqwest::Error) -> Self {
        let endpoint = value
            .url()
            .map_or_else(|| "<unknown>".to_string(), |url| url.as_str().to_string());
        Self::Transport {
            endpoint,
            details: value.to_string(),
        }
    }
}
