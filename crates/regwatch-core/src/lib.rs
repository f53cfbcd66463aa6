//! Core domain model for regwatch: records, identity and retention.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod identity;
pub mod retention;

pub use identity::{normalize_name, IdentityPolicy, KeyField};
pub use retention::{RetentionConfig, RetentionMerger};

/// Opaque attribute bag carried verbatim through merges.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A single entity snapshot as emitted by one source.
///
/// Records are never mutated after production; merges only decide which
/// snapshots survive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub source_id: String,
    #[serde(default)]
    pub natural_key: String,
    #[serde(default)]
    pub fallback_key: String,
    pub display_name: String,
    pub observed_at: DateTime<Utc>,
    pub event_date: NaiveDate,
    #[serde(default)]
    pub payload: Payload,
}

/// Short content hash identifying a real-world entity across restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-source scheduling bookkeeping persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    /// Lifetime count of produced records; seeds synthetic sequence numbers.
    #[serde(default)]
    pub total_produced: u64,
    #[serde(default)]
    pub seen_fingerprints: BTreeSet<Fingerprint>,
}

impl RunState {
    pub fn has_seen(&self, fingerprint: &Fingerprint) -> bool {
        self.seen_fingerprints.contains(fingerprint)
    }

    pub fn is_first_run(&self) -> bool {
        self.last_run_at.is_none()
    }
}
