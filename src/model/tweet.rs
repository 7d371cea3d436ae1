//! Stream record model and line decoding.
//!
//! A streaming endpoint interleaves status objects with keep-alive blank
//! lines and control messages (`delete`, `limit`, `warning`, ...). Only
//! objects carrying a non-empty `text` become a [`Tweet`].

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TwsError};

/// Author of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub screen_name: String,
    pub name: String,
    pub profile_image_url: String,
}

/// A decoded stream record. The text body is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tweet {
    text: String,
    user: User,
}

impl Tweet {
    /// Build a record, refusing an empty or whitespace-only text body.
    pub fn new(text: impl Into<String>, user: User) -> Option<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return None;
        }
        Some(Self { text, user })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn user(&self) -> &User {
        &self.user
    }
}

/// Shape of a status object on the wire. Unknown fields are ignored.
#[derive(Deserialize)]
struct WireStatus {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    user: Option<WireUser>,
}

/// Wire user; `null` values decode as empty strings.
#[derive(Deserialize)]
struct WireUser {
    #[serde(default)]
    screen_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile_image_url: Option<String>,
}

impl From<WireUser> for User {
    fn from(raw: WireUser) -> Self {
        Self {
            screen_name: raw.screen_name.unwrap_or_default(),
            name: raw.name.unwrap_or_default(),
            profile_image_url: raw.profile_image_url.unwrap_or_default(),
        }
    }
}

/// Decode one line from the stream.
///
/// * blank line (keep-alive) -> `Ok(None)`
/// * JSON object without a usable `text` -> `Ok(None)`
/// * anything that is not a JSON object -> `Err(TwsError::Decode)`
pub fn decode_line(line: &str) -> Result<Option<Tweet>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if !trimmed.starts_with('{') {
        return Err(TwsError::Decode {
            details: format!("expected a JSON object, got {}", preview(trimmed)),
        });
    }

    let status: WireStatus = serde_json::from_str(trimmed).map_err(|e| TwsError::Decode {
        details: format!("{e} in {}", preview(trimmed)),
    })?;

    let user = status.user.map(User::from).unwrap_or_default();
    Ok(status.text.and_then(|text| Tweet::new(text, user)))
}

/// First 80 characters of a line, for log messages.
fn preview(line: &str) -> String {
    const LIMIT: usize = 80;
    match line.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{:?}...", &line[..idx]),
        None => format!("{line:?}"),
    }
}
