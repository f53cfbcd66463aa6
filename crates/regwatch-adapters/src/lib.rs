//! Producer contracts + fixture and synthetic producer implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regwatch_core::{Payload, Record};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod synthetic;

pub use synthetic::{SyntheticProducer, SyntheticProfile};

/// How a source's records are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMode {
    Synthetic,
    Fixture,
}

/// Everything a producer may use for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub run_id: Uuid,
    pub source_id: String,
    /// Records wanted this run. Fixture sources read everything when zero.
    pub limit: usize,
    /// Lifetime produced count for the source, for collision-free sequence numbers.
    pub sequence_base: u64,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("source '{source_id}' is unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },
    #[error("source '{source_id}' returned invalid data: {reason}")]
    InvalidData { source_id: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// External record acquisition for one source.
///
/// Must be safe to call repeatedly. An empty result is a valid answer, not an error.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Record>, ProducerError>;
}

/// On-disk record shape accepted by [`FixtureProducer`]; omitted fields are filled in.
#[derive(Debug, Clone, Deserialize)]
struct FixtureRecord {
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    natural_key: String,
    #[serde(default)]
    fallback_key: String,
    display_name: String,
    #[serde(default)]
    observed_at: Option<DateTime<Utc>>,
    event_date: chrono::NaiveDate,
    #[serde(default)]
    payload: Payload,
}

/// Reads a JSON array of records from `<root>/<source_id>.json`.
#[derive(Debug, Clone)]
pub struct FixtureProducer {
    root: PathBuf,
}

impl FixtureProducer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, source_id: &str) -> PathBuf {
        self.root.join(format!("{source_id}.json"))
    }
}

#[async_trait]
impl Producer for FixtureProducer {
    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Record>, ProducerError> {
        let path = self.path_for(&request.source_id);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| ProducerError::Unavailable {
                source_id: request.source_id.clone(),
                reason: format!("reading {}: {err}", path.display()),
            })?;
        let fixtures: Vec<FixtureRecord> =
            serde_json::from_str(&text).map_err(|err| ProducerError::InvalidData {
                source_id: request.source_id.clone(),
                reason: format!("parsing {}: {err}", path.display()),
            })?;

        let take = if request.limit == 0 { fixtures.len() } else { request.limit };
        fixtures
            .into_iter()
            .take(take)
            .map(|fixture| fixture_to_record(fixture, request))
            .collect()
    }
}

fn fixture_to_record(
    fixture: FixtureRecord,
    request: &ProduceRequest,
) -> Result<Record, ProducerError> {
    let source_id = match fixture.source_id {
        Some(id) if id != request.source_id => {
            return Err(ProducerError::InvalidData {
                source_id: request.source_id.clone(),
                reason: format!("fixture record belongs to source '{id}'"),
            })
        }
        _ => request.source_id.clone(),
    };
    Ok(Record {
        source_id,
        natural_key: fixture.natural_key,
        fallback_key: fixture.fallback_key,
        display_name: fixture.display_name,
        observed_at: fixture.observed_at.unwrap_or(request.now),
        event_date: fixture.event_date,
        payload: fixture.payload,
    })
}

/// Builds the producer for one configured source.
pub fn producer_for_mode(
    mode: ProducerMode,
    profile: &SyntheticProfile,
    fixtures_root: &Path,
) -> Arc<dyn Producer> {
    match mode {
        ProducerMode::Synthetic => Arc::new(SyntheticProducer::new(profile.clone())),
        ProducerMode::Fixture => Arc::new(FixtureProducer::new(fixtures_root)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn request(source_id: &str, limit: usize) -> ProduceRequest {
        ProduceRequest {
            run_id: Uuid::nil(),
            source_id: source_id.to_string(),
            limit,
            sequence_base: 0,
            now: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn fixture_producer_fills_defaults_and_respects_limit() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("florida.json"),
            r#"[
              {"natural_key": "L26000001", "display_name": "Sunshine Holdings LLC", "event_date": "2026-02-28",
               "payload": {"county": "Dade"}},
              {"display_name": "Gulf Breeze Inc", "event_date": "2026-02-27",
               "observed_at": "2026-03-01T00:00:00Z"},
              {"display_name": "Third Co", "event_date": "2026-02-26"}
            ]"#,
        )
        .unwrap();

        let producer = FixtureProducer::new(dir.path());
        let records = producer.produce(&request("florida", 2)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_id, "florida");
        assert_eq!(records[0].observed_at, request("florida", 2).now);
        assert_eq!(records[0].payload["county"], serde_json::json!("Dade"));
        assert_eq!(
            records[1].observed_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_fixture_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let producer = FixtureProducer::new(dir.path());
        let err = producer.produce(&request("ohio", 0)).await.unwrap_err();
        assert!(matches!(err, ProducerError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn foreign_source_records_are_rejected() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("iowa.json"),
            r#"[{"source_id": "kansas", "display_name": "X", "event_date": "2026-02-01"}]"#,
        )
        .unwrap();
        let err = FixtureProducer::new(dir.path())
            .produce(&request("iowa", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::InvalidData { .. }));
    }

    #[tokio::test]
    async fn empty_fixture_is_a_valid_empty_result() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("maine.json"), "[]").unwrap();
        let records = FixtureProducer::new(dir.path())
            .produce(&request("maine", 10))
            .await
            .unwrap();
        assert!(records.is_empty());
    }
}
