//! Filename grammar for stored records.
//!
//! A record filename has the shape
//! `{status}-{username}-{var_1}-...-{var_n}-{timestamp}-{shortid}.json`:
//! - `status` is `draft` or `final`
//! - `username` and every `var_i` are normalized (see [`normalize`])
//! - `timestamp` is `YYYYMMDD_HHMMSS` in UTC
//! - `shortid` is 8 lowercase hex characters

use serde::{Deserialize, Serialize};

use crate::document::Status;
use crate::error::{IdentityError, IdentityResult};

/// Placeholder used for a blank filename variable with no fallback.
pub const EMPTY_COMPONENT: &str = "empty";

/// Maximum number of characters kept from a normalized component.
pub const MAX_COMPONENT_LEN: usize = 50;

/// Extension carried by every record filename.
pub const RECORD_EXTENSION: &str = ".json";

/// Length of the short id embedded in a filename.
pub const SHORT_ID_LEN: usize = 8;

/// Normalize a value for use as a filename component.
///
/// Trims whitespace, maps every character outside `[A-Za-z0-9_.]` (Unicode
/// letters and digits included) to `_`, collapses runs of `_`, trims `_`
/// from both ends, keeps the first 50 characters and lower-cases the result.
/// Hyphens never survive, so the output is always safe next to the `-`
/// delimiter.
///
/// ```
/// use eln_types::normalize;
///
/// assert_eq!(normalize("PROJ-001"), "proj_001");
/// assert_eq!(normalize("  Patient  #7 "), "patient_7");
/// assert_eq!(normalize(""), "");
/// ```
pub fn normalize(value: &str) -> String {
    let mut collapsed = String::with_capacity(value.len());
    let mut previous_underscore = false;
    for ch in value.trim().chars() {
        let mapped = if ch.is_alphanumeric() || ch == '_' || ch == '.' {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if previous_underscore {
                continue;
            }
            previous_underscore = true;
        } else {
            previous_underscore = false;
        }
        collapsed.push(mapped);
    }

    collapsed
        .trim_matches('_')
        .chars()
        .take(MAX_COMPONENT_LEN)
        .collect::<String>()
        .to_lowercase()
}

/// Join already-normalized components into a record filename.
pub fn compose_filename(
    status: Status,
    username: &str,
    variables: &[String],
    timestamp: &str,
    short_id: &str,
) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(variables.len() + 4);
    parts.push(status.as_str());
    parts.push(username);
    parts.extend(variables.iter().map(String::as_str));
    parts.push(timestamp);
    parts.push(short_id);
    format!("{}{RECORD_EXTENSION}", parts.join("-"))
}

/// Components recovered from a record filename.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFilename {
    pub status: Status,
    pub username: String,
    pub variables: Vec<String>,
    pub timestamp: String,
    pub short_id: String,
}

impl ParsedFilename {
    /// The filename this was parsed from.
    pub fn filename(&self) -> String {
        compose_filename(
            self.status,
            &self.username,
            &self.variables,
            &self.timestamp,
            &self.short_id,
        )
    }

    /// The filename without its `.json` extension.
    pub fn basename(&self) -> String {
        let mut name = self.filename();
        name.truncate(name.len() - RECORD_EXTENSION.len());
        name
    }
}

/// Parse a record filename back into its components.
///
/// The input may be a bare filename or a full key; only the final path
/// segment is considered.
pub fn parse_filename(name: &str) -> IdentityResult<ParsedFilename> {
    let file = name.rsplit('/').next().unwrap_or(name);
    let malformed = |reason: &str| IdentityError::MalformedFilename {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let stem = file
        .strip_suffix(RECORD_EXTENSION)
        .ok_or_else(|| malformed("missing .json extension"))?;
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() < 4 {
        return Err(malformed("expected at least 4 dash-separated components"));
    }

    let status: Status = parts[0]
        .parse()
        .map_err(|_| malformed("status must be draft or final"))?;
    let timestamp = parts[parts.len() - 2];
    let short_id = parts[parts.len() - 1];

    if !is_compact_timestamp(timestamp) {
        return Err(malformed("timestamp must be YYYYMMDD_HHMMSS"));
    }
    if !is_short_id(short_id) {
        return Err(malformed("short id must be 8 lowercase hex characters"));
    }

    Ok(ParsedFilename {
        status,
        username: parts[1].to_string(),
        variables: parts[2..parts.len() - 2]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        timestamp: timestamp.to_string(),
        short_id: short_id.to_string(),
    })
}

/// Whether `value` matches `^\d{8}_\d{6}$`.
pub fn is_compact_timestamp(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..].iter().all(u8::is_ascii_digit)
}

/// Whether `value` matches `^[a-f0-9]{8}$`.
pub fn is_short_id(value: &str) -> bool {
    value.len() == SHORT_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
