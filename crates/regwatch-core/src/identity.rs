//! Dedup key and fingerprint resolution.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Fingerprint, Record};

const FINGERPRINT_HEX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyField {
    NaturalKey,
    FallbackKey,
    DisplayName,
}

pub const DEFAULT_PRECEDENCE: [KeyField; 3] = [
    KeyField::NaturalKey,
    KeyField::FallbackKey,
    KeyField::DisplayName,
];

/// Ordered list of record fields consulted when deriving a dedup key.
///
/// Fields missing from a custom order are appended in default order, so
/// every policy can fall all the way through to the display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPolicy {
    precedence: Vec<KeyField>,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            precedence: DEFAULT_PRECEDENCE.to_vec(),
        }
    }
}

impl IdentityPolicy {
    pub fn new(precedence: &[KeyField]) -> Self {
        let mut order = Vec::with_capacity(DEFAULT_PRECEDENCE.len());
        for field in precedence.iter().chain(DEFAULT_PRECEDENCE.iter()) {
            if !order.contains(field) {
                order.push(*field);
            }
        }
        Self { precedence: order }
    }

    pub fn precedence(&self) -> &[KeyField] {
        &self.precedence
    }

    /// Returns the first non-empty identifier in precedence order. Never empty.
    pub fn dedup_key(&self, record: &Record) -> String {
        self.precedence
            .iter()
            .find_map(|field| field_value(record, *field))
            .unwrap_or_else(|| anonymous_key(record))
    }

    pub fn fingerprint(&self, record: &Record) -> Fingerprint {
        let name = record.display_name.trim().to_lowercase();
        let key = self.dedup_key(record);
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Fingerprint::from_hex(&digest[..FINGERPRINT_HEX_LEN])
    }
}

/// Lowercases and collapses punctuation/whitespace runs into single spaces.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn field_value(record: &Record, field: KeyField) -> Option<String> {
    let value = match field {
        KeyField::NaturalKey => record.natural_key.trim().to_string(),
        KeyField::FallbackKey => record.fallback_key.trim().to_string(),
        KeyField::DisplayName => normalize_name(&record.display_name),
    };
    (!value.is_empty()).then_some(value)
}

// Nameless, keyless records still need a stable key; hash what is left.
fn anonymous_key(record: &Record) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.source_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(record.event_date.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(serde_json::Value::Object(record.payload.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("anon:{}", &digest[..FINGERPRINT_HEX_LEN])
}
