//! Domain identifiers (strongly-typed IDs).
//!
//! Work orders and workers are both named by plain strings on disk (they end up
//! as file names inside the shared repository), so both IDs share one
//! implementation: `Id<T>` wraps a validated `String` and `T` is a zero-sized
//! marker that keeps `WorkId` and `WorkerId` from being mixed up.
//!
//! ## Accepted characters
//! `[A-Za-z0-9._-]`, non-empty, not starting with `.`. Anything else could
//! escape the bucket directory or break on a case-folding filesystem.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use super::errors::IdError;

/// Marker trait for each ID flavour.
pub trait IdMarker: Send + Sync + 'static {
    /// Human readable kind, used in error messages.
    fn kind() -> &'static str;
}

/// Validated, file-name safe identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Parse and validate an identifier.
    pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdError::Empty { kind: T::kind() });
        }
        if value.starts_with('.') {
            return Err(IdError::InvalidCharacter {
                kind: T::kind(),
                value,
                character: '.',
            });
        }
        if let Some(character) = value.chars().find(|c| !is_file_safe(*c)) {
            return Err(IdError::InvalidCharacter {
                kind: T::kind(),
                value,
                character,
            });
        }
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", T::kind(), self.value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

impl<T: IdMarker> std::str::FromStr for Id<T> {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_file_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Replace every character outside the accepted set with `-`.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if is_file_safe(c) { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

// ========================================
// Marker types
// ========================================

/// Marker for work order IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Work {}

impl IdMarker for Work {
    fn kind() -> &'static str {
        "WorkId"
    }
}

/// Marker for worker IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn kind() -> &'static str {
        "WorkerId"
    }
}

/// Identifier of a work order; stable across retries.
pub type WorkId = Id<Work>;

/// Identifier of one worker process run.
pub type WorkerId = Id<Worker>;

impl Id<Work> {
    /// Fresh `wo-<ulid>` identifier. ULIDs sort by creation time, so the
    /// `available/` listing comes back roughly oldest first.
    pub fn generate() -> Self {
        Self {
            value: format!("wo-{}", Ulid::new().to_string().to_lowercase()),
            _marker: PhantomData,
        }
    }
}

impl Id<Worker> {
    /// `<hostname>_<pid>_<8 hex chars>`, unique per process run.
    pub fn for_this_process() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::from_parts(&host, std::process::id(), rand::random::<u32>())
    }

    /// Build a worker ID from its parts; the host name is sanitised.
    pub fn from_parts(host: &str, pid: u32, suffix: u32) -> Self {
        Self {
            value: format!("{}_{}_{:08x}", sanitize(host), pid, suffix),
            _marker: PhantomData,
        }
    }
}
