//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TwsError};

/// Public streaming "sample" endpoint.
pub const DEFAULT_SAMPLE_URL: &str =
    "https://stream.twitter.com/1.1/statuses/sample.json?filter_level=low";

/// Public streaming "filter" endpoint; the encoded track text is appended.
pub const DEFAULT_FILTER_URL: &str =
    "https://stream.twitter.com/1.1/statuses/filter.json?filter_level=low&track=";

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub credentials: CredentialsConfig,
    pub ingest: IngestConfig,
    pub persistence: PersistenceConfig,
    pub paths: PathsConfig,
}

/// HTTP method used to open a stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Streaming endpoint and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_url: String,
    pub filter_url: String,
    pub method: HttpMethod,
    pub connect_timeout_ms: u64,
    /// Upper bound on the lifetime of one HTTP connection, reads included.
    /// Zero means unbounded. The per-line deadline in [`IngestConfig`] is
    /// the primary liveness guard; this only caps socket and thread lifetime.
    pub connection_max_age_ms: u64,
    /// Permit `http://` endpoints. Meant for local relays and tests.
    pub allow_insecure_http: bool,
    pub user_agent: String,
}

/// OAuth 1.0a consumer and access-token credentials.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CredentialsConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

/// Bounds applied to each ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    /// Rolling per-line deadline, reset on every line read.
    pub read_timeout_ms: u64,
    pub max_batch_size: usize,
    /// Overall cap for one run. Zero disables the cap.
    pub max_run_ms: u64,
}

/// What a submission does when the persistence queue is full.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    /// Wait for space, up to `block_timeout_ms`, then reject.
    #[default]
    Block,
    /// Reject immediately with `QueueSaturated`.
    Reject,
}

/// Persistence worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Worker thread count. Zero means `available_parallelism + 2`.
    pub workers: usize,
    pub queue_capacity: usize,
    pub saturation: SaturationPolicy,
    pub block_timeout_ms: u64,
    /// How long a search write may take before later search writes are held back.
    pub ordering_timeout_ms: u64,
    /// Row limit for recent-record queries.
    pub query_limit: usize,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub database: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_url: DEFAULT_SAMPLE_URL.to_string(),
            filter_url: DEFAULT_FILTER_URL.to_string(),
            method: HttpMethod::Post,
            connect_timeout_ms: 10_000,
            connection_max_age_ms: 300_000,
            allow_insecure_http: false,
            user_agent: format!("tweet-stream-ingest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 2_000,
            max_batch_size: 50,
            max_run_ms: 10_000,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 10,
            saturation: SaturationPolicy::Block,
            block_timeout_ms: 5_000,
            ordering_timeout_ms: 10_000,
            query_limit: 400,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[TWS-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir
            .join(".config")
            .join("tweetstream")
            .join("config.toml");
        let data = home_dir.join(".local").join("share").join("tweetstream");
        Self {
            config_file: cfg,
            database: data.join("tweets.sqlite3"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &redact(&self.consumer_secret))
            .field("access_token", &self.access_token)
            .field("access_token_secret", &redact(&self.access_token_secret))
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}

impl CredentialsConfig {
    /// Fail with `MissingConfig` naming the first absent credential.
    pub fn ensure_complete(&self) -> Result<()> {
        for (name, value) in [
            ("consumer_key", &self.consumer_key),
            ("consumer_secret", &self.consumer_secret),
            ("access_token", &self.access_token),
            ("access_token_secret", &self.access_token_secret),
        ] {
            if value.trim().is_empty() {
                return Err(TwsError::MissingConfig {
                    details: format!("credentials.{name} is not set"),
                });
            }
        }
        Ok(())
    }
}

impl StreamConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn connection_max_age(&self) -> Option<Duration> {
        (self.connection_max_age_ms > 0).then(|| Duration::from_millis(self.connection_max_age_ms))
    }
}

impl IngestConfig {
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn max_run(&self) -> Option<Duration> {
        (self.max_run_ms > 0).then(|| Duration::from_millis(self.max_run_ms))
    }
}

impl PersistenceConfig {
    /// Effective worker count after resolving the zero default.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get) + 2
    }

    #[must_use]
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    #[must_use]
    pub fn ordering_timeout(&self) -> Duration {
        Duration::from_millis(self.ordering_timeout_ms)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| TwsError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(TwsError::MissingConfig {
                details: format!("config file {} does not exist", path_buf.display()),
            });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form. Credentials are excluded so the
    /// hash can be written to the activity log.
    pub fn stable_hash(&self) -> Result<String> {
        let mut redacted = self.clone();
        redacted.credentials = CredentialsConfig::default();
        let canonical = serde_json::to_string(&redacted)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // stream
        if let Some(raw) = lookup("TWS_STREAM_SAMPLE_URL") {
            self.stream.sample_url = raw;
        }
        if let Some(raw) = lookup("TWS_STREAM_FILTER_URL") {
            self.stream.filter_url = raw;
        }
        if let Some(raw) = lookup("TWS_STREAM_METHOD") {
            self.stream.method = parse_method(&raw)?;
        }
        set_u64(&mut lookup, "TWS_STREAM_CONNECT_TIMEOUT_MS", &mut self.stream.connect_timeout_ms)?;
        set_u64(
            &mut lookup,
            "TWS_STREAM_CONNECTION_MAX_AGE_MS",
            &mut self.stream.connection_max_age_ms,
        )?;
        set_bool(
            &mut lookup,
            "TWS_STREAM_ALLOW_INSECURE_HTTP",
            &mut self.stream.allow_insecure_http,
        )?;

        // credentials
        for (name, slot) in [
            ("TWS_CONSUMER_KEY", &mut self.credentials.consumer_key),
            ("TWS_CONSUMER_SECRET", &mut self.credentials.consumer_secret),
            ("TWS_ACCESS_TOKEN", &mut self.credentials.access_token),
            (
                "TWS_ACCESS_TOKEN_SECRET",
                &mut self.credentials.access_token_secret,
            ),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = raw;
            }
        }

        // ingest
        set_u64(&mut lookup, "TWS_INGEST_READ_TIMEOUT_MS", &mut self.ingest.read_timeout_ms)?;
        set_usize(&mut lookup, "TWS_INGEST_MAX_BATCH_SIZE", &mut self.ingest.max_batch_size)?;
        set_u64(&mut lookup, "TWS_INGEST_MAX_RUN_MS", &mut self.ingest.max_run_ms)?;

        // persistence
        set_usize(&mut lookup, "TWS_PERSIST_WORKERS", &mut self.persistence.workers)?;
        set_usize(
            &mut lookup,
            "TWS_PERSIST_QUEUE_CAPACITY",
            &mut self.persistence.queue_capacity,
        )?;
        if let Some(raw) = lookup("TWS_PERSIST_SATURATION") {
            self.persistence.saturation = parse_saturation(&raw)?;
        }
        set_usize(&mut lookup, "TWS_PERSIST_QUERY_LIMIT", &mut self.persistence.query_limit)?;
        set_u64(
            &mut lookup,
            "TWS_PERSIST_ORDERING_TIMEOUT_MS",
            &mut self.persistence.ordering_timeout_ms,
        )?;

        // paths
        if let Some(raw) = lookup("TWS_DATABASE") {
            self.paths.database = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("TWS_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Check structural invariants. Credentials are checked separately by
    /// the network transport so offline tooling can load a config without them.
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("sample_url", &self.stream.sample_url),
            ("filter_url", &self.stream.filter_url),
        ] {
            let secure = url.starts_with("https://");
            let plain = url.starts_with("http://");
            if !secure && !(plain && self.stream.allow_insecure_http) {
                return Err(TwsError::InvalidConfig {
                    details: format!(
                        "stream.{name} must be an https:// URL (allow_insecure_http permits http://), got {url:?}"
                    ),
                });
            }
        }

        if self.stream.connect_timeout_ms == 0 {
            return Err(TwsError::InvalidConfig {
                details: "stream.connect_timeout_ms must be > 0".to_string(),
            });
        }
        if self.stream.connection_max_age_ms > 0
            && self.stream.connection_max_age_ms < self.ingest.read_timeout_ms
        {
            return Err(TwsError::InvalidConfig {
                details: format!(
                    "stream.connection_max_age_ms ({}) must be 0 or >= ingest.read_timeout_ms ({})",
                    self.stream.connection_max_age_ms, self.ingest.read_timeout_ms
                ),
            });
        }

        if self.ingest.read_timeout_ms == 0 {
            return Err(TwsError::InvalidConfig {
                details: "ingest.read_timeout_ms must be > 0".to_string(),
            });
        }
        if self.ingest.max_batch_size == 0 {
            return Err(TwsError::InvalidConfig {
                details: "ingest.max_batch_size must be > 0".to_string(),
            });
        }

        if self.persistence.queue_capacity == 0 {
            return Err(TwsError::InvalidConfig {
                details: "persistence.queue_capacity must be > 0".to_string(),
            });
        }
        if self.persistence.query_limit == 0 {
            return Err(TwsError::InvalidConfig {
                details: "persistence.query_limit must be > 0".to_string(),
            });
        }
        if self.persistence.ordering_timeout_ms == 0 {
            return Err(TwsError::InvalidConfig {
                details: "persistence.ordering_timeout_ms must be > 0".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse::<u64>().map_err(|error| TwsError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse::<usize>()
            .map_err(|error| TwsError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

fn set_bool<F>(lookup: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse::<bool>()
            .map_err(|error| TwsError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

fn parse_method(raw: &str) -> Result<HttpMethod> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "get" => Ok(HttpMethod::Get),
        "post" => Ok(HttpMethod::Post),
        other => Err(TwsError::ConfigParse {
            context: "env",
            details: format!("TWS_STREAM_METHOD={other:?}: expected get or post"),
        }),
    }
}

fn parse_saturation(raw: &str) -> Result<SaturationPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "block" => Ok(SaturationPolicy::Block),
        "reject" => Ok(SaturationPolicy::Reject),
        other => Err(TwsError::ConfigParse {
            context: "env",
            details: format!("TWS_PERSIST_SATURATION={other:?}: expected block or reject"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, HttpMethod, SaturationPolicy, TwsError};
    use std::time::Duration;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ingest.max_batch_size, 50);
        assert_eq!(cfg.persistence.queue_capacity, 10);
        assert_eq!(cfg.stream.method, HttpMethod::Post);
    }

    #[test]
    fn plain_http_rejected_unless_allowed() {
        let mut cfg = Config::default();
        cfg.stream.sample_url = "http://127.0.0.1:8080/sample".to_string();
        let err = cfg.validate().expect_err("plain http should be rejected");
        assert!(err.to_string().contains("sample_url"));

        cfg.stream.allow_insecure_http = true;
        cfg.stream.filter_url = "http://127.0.0.1:8080/filter?track=".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_http_scheme_always_rejected() {
        let mut cfg = Config::default();
        cfg.stream.allow_insecure_http = true;
        cfg.stream.filter_url = "ftp://stream.example/filter".to_string();
        let err = cfg.validate().expect_err("ftp should be rejected");
        assert!(matches!(err, TwsError::InvalidConfig { .. }));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = Config::default();
        cfg.ingest.max_batch_size = 0;
        let err = cfg.validate().expect_err("expected batch size error");
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn connection_age_must_cover_line_deadline() {
        let mut cfg = Config::default();
        cfg.stream.connection_max_age_ms = 500;
        let err = cfg.validate().expect_err("expected timeout ordering error");
        assert!(err.to_string().contains("connection_max_age_ms"));

        cfg.stream.connection_max_age_ms = 0;
        assert!(cfg.validate().is_ok());
        assert!(cfg.stream.connection_max_age().is_none());
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        let mut cfg = Config::default();
        cfg.persistence.queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_ordering_timeout_rejected() {
        let mut cfg = Config::default();
        assert_eq!(cfg.persistence.ordering_timeout(), Duration::from_secs(10));
        cfg.persistence.ordering_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_run_zero_disables_cap() {
        let mut cfg = Config::default();
        assert!(cfg.ingest.max_run().is_some());
        cfg.ingest.max_run_ms = 0;
        assert!(cfg.ingest.max_run().is_none());
    }

    #[test]
    fn effective_workers_resolves_zero() {
        let mut cfg = Config::default();
        assert!(cfg.persistence.effective_workers() >= 3);
        cfg.persistence.workers = 2;
        assert_eq!(cfg.persistence.effective_workers(), 2);
    }

    #[test]
    fn missing_credentials_are_named() {
        let cfg = Config::default();
        let err = cfg
            .credentials
            .ensure_complete()
            .expect_err("empty credentials");
        assert!(matches!(err, TwsError::MissingConfig { .. }));
        assert!(err.to_string().contains("consumer_key"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut cfg = Config::default();
        cfg.credentials.consumer_key = "ck".to_string();
        cfg.credentials.consumer_secret = "very-secret".to_string();
        let rendered = format!("{:?}", cfg.credentials);
        assert!(rendered.contains("ck"));
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("TWS_STREAM_METHOD", "get"),
            ("TWS_INGEST_READ_TIMEOUT_MS", "3000"),
            ("TWS_INGEST_MAX_BATCH_SIZE", "7"),
            ("TWS_PERSIST_SATURATION", "reject"),
            ("TWS_CONSUMER_KEY", "key-from-env"),
            ("TWS_DATABASE", "/tmp/tws/custom.sqlite3"),
        ]);

        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("env overrides should parse");

        assert_eq!(cfg.stream.method, HttpMethod::Get);
        assert_eq!(cfg.ingest.read_timeout_ms, 3_000);
        assert_eq!(cfg.ingest.max_batch_size, 7);
        assert_eq!(cfg.persistence.saturation, SaturationPolicy::Reject);
        assert_eq!(cfg.credentials.consumer_key, "key-from-env");
        assert_eq!(
            cfg.paths.database,
            PathBuf::from("/tmp/tws/custom.sqlite3")
        );
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("TWS_INGEST_MAX_RUN_MS", "soon")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("non-numeric should fail");
        assert!(matches!(err, TwsError::ConfigParse { context: "env", .. }));
    }

    #[test]
    fn env_invalid_method_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("TWS_STREAM_METHOD", "PATCH")]);
        assert!(
            cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
                .is_err()
        );
    }

    #[test]
    fn toml_sections_parse_with_defaults() {
        let raw = r#"
            [stream]
            method = "get"

            [ingest]
            read_timeout_ms = 2500

            [persistence]
            saturation = "reject"
        "#;
        let cfg: Config = toml::from_str(raw).expect("toml should parse");
        assert_eq!(cfg.stream.method, HttpMethod::Get);
        assert_eq!(cfg.stream.connect_timeout_ms, 10_000);
        assert_eq!(cfg.ingest.read_timeout_ms, 2_500);
        assert_eq!(cfg.ingest.max_batch_size, 50);
        assert_eq!(cfg.persistence.saturation, SaturationPolicy::Reject);
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ingest]\nmax_batch_size = 12\n").expect("write config");
        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.ingest.max_batch_size, 12);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/tws/config.toml")));
        let err = result.expect_err("missing file should fail");
        assert!(matches!(err, TwsError::MissingConfig { .. }));
    }

    #[test]
    fn stable_hash_ignores_credentials() {
        let cfg = Config::default();
        let mut with_secret = Config::default();
        with_secret.credentials.consumer_secret = "s3cret".to_string();
        assert_eq!(
            cfg.stable_hash().expect("hash"),
            with_secret.stable_hash().expect("hash")
        );

        let mut modified = Config::default();
        modified.ingest.max_batch_size += 1;
        assert_ne!(
            cfg.stable_hash().expect("hash"),
            modified.stable_hash().expect("hash")
        );
    }
}
