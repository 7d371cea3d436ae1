//! SQLite tweet store: WAL-mode database with one table per destination.
//!
//! Every write is a single transaction. A failed insert rolls back the whole
//! batch, and a replace never leaves the destination half-cleared.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{Result, TwsError};
use crate::model::tweet::Tweet;
use crate::stream::client::StreamKind;

/// Logical table a batch is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Live,
    Search,
}

impl Destination {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Search => "search",
        }
    }

    const fn table(self) -> &'static str {
        match self {
            Self::Live => "tweets",
            Self::Search => "tweet_search",
        }
    }
}

impl From<StreamKind> for Destination {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Live => Self::Live,
            StreamKind::Search => Self::Search,
        }
    }
}

/// A persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTweet {
    pub id: i64,
    pub screen_name: String,
    pub name: String,
    pub image_url: String,
    pub tweet: String,
}

/// Storage primitives the persistence queue relies on.
pub trait TweetRepository: Send + Sync {
    /// Append `records` in one transaction. Returns rows written.
    fn insert_batch(&self, destination: Destination, records: &[Tweet]) -> Result<usize>;
    /// Delete everything, then append `records`, in one transaction.
    fn replace_batch(&self, destination: Destination, records: &[Tweet]) -> Result<usize>;
    /// Returns rows deleted.
    fn delete_all(&self, destination: Destination) -> Result<usize>;
    /// Newest first.
    fn query_recent(&self, destination: Destination, limit: usize) -> Result<Vec<StoredTweet>>;
    fn count(&self, destination: Destination) -> Result<usize>;
}

/// rusqlite-backed [`TweetRepository`].
pub struct TweetStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl TweetStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| TwsError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }
}

impl TweetRepository for TweetStore {
    fn insert_batch(&self, destination: Destination, records: &[Tweet]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = insert_rows(&tx, destination, records)?;
        tx.commit()?;
        Ok(rows)
    }

    fn replace_batch(&self, destination: Destination, records: &[Tweet]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", destination.table()), [])?;
        let rows = insert_rows(&tx, destination, records)?;
        tx.commit()?;
        Ok(rows)
    }

    fn delete_all(&self, destination: Destination) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(&format!("DELETE FROM {}", destination.table()), [])?)
    }

    fn query_recent(&self, destination: Destination, limit: usize) -> Result<Vec<StoredTweet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, screen_name, name, image_url, tweet
             FROM {} ORDER BY id DESC LIMIT ?1",
            destination.table()
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(StoredTweet {
                    id: row.get(0)?,
                    screen_name: row.get(1)?,
                    name: row.get(2)?,
                    image_url: row.get(3)?,
                    tweet: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self, destination: Destination) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", destination.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

fn insert_rows(conn: &Connection, destination: Destination, records: &[Tweet]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {} (screen_name, name, image_url, tweet) VALUES (?1, ?2, ?3, ?4)",
        destination.table()
    ))?;
    for tweet in records {
        let user = tweet.user();
        stmt.execute(params![
            user.screen_name,
            user.name,
            user.profile_image_url,
            tweet.text()
        ])?;
    }
    Ok(records.len())
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[TWS-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tweets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            screen_name TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT '',
            image_url TEXT NOT NULL DEFAULT '',
            tweet TEXT NOT NULL CHECK (length(tweet) > 0)
        );

        CREATE TABLE IF NOT EXISTS tweet_search (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            screen_name TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT '',
            image_url TEXT NOT NULL DEFAULT '',
            tweet TEXT NOT NULL CHECK (length(tweet) > 0)
        );",
    )?;
    Ok(())
}
