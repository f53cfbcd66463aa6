//! Cross-source aggregate export: JSON records, parquet snapshot and manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use regwatch_core::{Record, RetentionMerger};
use regwatch_storage::{write_atomic, RetentionStore, TempPath};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const RECORDS_FILE: &str = "records.json";
pub const PARQUET_FILE: &str = "records.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct AggregateManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub record_count: usize,
    pub sources: Vec<String>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub out_dir: PathBuf,
    pub records: Vec<Record>,
    pub manifest: AggregateManifest,
}

/// Reads every source's retention set and writes the deduplicated union.
#[derive(Clone)]
pub struct AggregateExporter {
    source_ids: Arc<Vec<String>>,
    retention: RetentionStore,
    merger: RetentionMerger,
    out_dir: PathBuf,
    max_size: usize,
}

impl AggregateExporter {
    pub fn new(
        source_ids: Vec<String>,
        retention: RetentionStore,
        merger: RetentionMerger,
        out_dir: impl Into<PathBuf>,
        max_size: usize,
    ) -> Self {
        Self {
            source_ids: Arc::new(source_ids),
            retention,
            merger,
            out_dir: out_dir.into(),
            max_size,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub async fn collect(&self) -> Vec<Record> {
        let mut sets = Vec::with_capacity(self.source_ids.len());
        for source_id in self.source_ids.iter() {
            sets.push(self.retention.load(source_id).await);
        }
        self.merger.merge_union(sets, self.max_size)
    }

    /// Each file is replaced atomically; callers serialize exports so the
    /// manifest hashes describe the files beside it.
    pub async fn export(&self, now: DateTime<Utc>) -> Result<ExportSummary> {
        let records = self.collect().await;
        fs::create_dir_all(&self.out_dir)
            .await
            .with_context(|| format!("creating {}", self.out_dir.display()))?;

        let json_path = self.out_dir.join(RECORDS_FILE);
        let json = serde_json::to_vec_pretty(&records).context("serializing aggregate records")?;
        write_atomic(&json_path, &json)
            .await
            .with_context(|| format!("writing {}", json_path.display()))?;

        let parquet_path = self.out_dir.join(PARQUET_FILE);
        let parquet_tmp = TempPath::next_to(&parquet_path);
        write_records_parquet(parquet_tmp.path(), &records)?;
        parquet_tmp
            .persist(&parquet_path)
            .await
            .with_context(|| format!("replacing {}", parquet_path.display()))?;

        let manifest = AggregateManifest {
            schema_version: 1,
            generated_at: now,
            record_count: records.len(),
            sources: self.source_ids.as_ref().clone(),
            files: vec![
                manifest_entry("records", &self.out_dir, &json_path)?,
                manifest_entry("records_parquet", &self.out_dir, &parquet_path)?,
            ],
        };
        let manifest_path = self.out_dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing aggregate manifest")?;
        write_atomic(&manifest_path, &bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(
            records = records.len(),
            out_dir = %self.out_dir.display(),
            "aggregate exported"
        );
        Ok(ExportSummary {
            out_dir: self.out_dir.clone(),
            records,
            manifest,
        })
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_records_parquet(path: &Path, records: &[Record]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("natural_key", DataType::Utf8, true),
        ArrowField::new("fallback_key", DataType::Utf8, true),
        ArrowField::new("display_name", DataType::Utf8, false),
        ArrowField::new("observed_at", DataType::Utf8, false),
        ArrowField::new("event_date", DataType::Utf8, false),
        ArrowField::new("payload", DataType::Utf8, false),
    ]));

    let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
    let source_ids = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let natural_keys = StringArray::from(
        records
            .iter()
            .map(|r| non_empty(&r.natural_key))
            .collect::<Vec<_>>(),
    );
    let fallback_keys = StringArray::from(
        records
            .iter()
            .map(|r| non_empty(&r.fallback_key))
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.display_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let observed = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.observed_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let event_dates = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.event_date.to_string()))
            .collect::<Vec<_>>(),
    );
    let payloads = StringArray::from(
        records
            .iter()
            .map(|r| Some(serde_json::Value::Object(r.payload.clone()).to_string()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(natural_keys),
            Arc::new(fallback_keys),
            Arc::new(names),
            Arc::new(observed),
            Arc::new(event_dates),
            Arc::new(payloads),
        ],
    )
    .context("building aggregate record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
