use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use regwatch_adapters::{ProducerMode, SyntheticProfile};
use regwatch_core::{IdentityPolicy, KeyField, RetentionConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::Job;

pub const DEFAULT_RECORDS_PER_RUN: usize = 25;
/// Longest accepted cycle or per-source interval (one year).
pub const MAX_INTERVAL_HOURS: i64 = 24 * 366;
/// Longest accepted producer timeout (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;
/// Largest opt-in due-check slack.
pub const MAX_DUE_SLACK_MINUTES: i64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Converts a configured hour count, rejecting anything outside `1..=MAX_INTERVAL_HOURS`.
pub fn interval(hours: i64) -> Result<Duration, ConfigError> {
    if !(1..=MAX_INTERVAL_HOURS).contains(&hours) {
        return Err(invalid(format!(
            "interval must be between 1 and {MAX_INTERVAL_HOURS} hours, got {hours}"
        )));
    }
    Duration::try_hours(hours).ok_or_else(|| invalid(format!("interval of {hours} hours overflows")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub mode: String,
    #[serde(default)]
    pub stagger_minutes: u64,
    #[serde(default = "default_records_per_run")]
    pub records_per_run: usize,
    #[serde(default)]
    pub window_days: u32,
    #[serde(default)]
    pub max_size: usize,
    #[serde(default)]
    pub interval_hours: Option<i64>,
    /// Lets a run count as due this many minutes early. Off unless set.
    #[serde(default)]
    pub due_slack_minutes: i64,
    #[serde(default)]
    pub key_precedence: Vec<KeyField>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub synthetic: SyntheticProfile,
}

fn default_enabled() -> bool {
    true
}

fn default_records_per_run() -> usize {
    DEFAULT_RECORDS_PER_RUN
}

impl SourceConfig {
    pub fn producer_mode(&self) -> Result<ProducerMode, ConfigError> {
        match self.mode.as_str() {
            "synthetic" => Ok(ProducerMode::Synthetic),
            "fixture" => Ok(ProducerMode::Fixture),
            other => Err(invalid(format!(
                "source '{}' has unknown producer mode '{other}'",
                self.source_id
            ))),
        }
    }

    pub fn retention(&self) -> RetentionConfig {
        RetentionConfig::new(self.window_days, self.max_size)
    }

    pub fn identity(&self) -> IdentityPolicy {
        IdentityPolicy::new(&self.key_precedence)
    }
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                return Err(invalid("source_id must not be empty"));
            }
            if !ids.insert(source.source_id.as_str()) {
                return Err(invalid(format!("duplicate source_id '{}'", source.source_id)));
            }
            source.producer_mode()?;
            if let Some(hours) = source.interval_hours {
                interval(hours).map_err(|err| {
                    invalid(format!("source '{}' interval_hours: {err}", source.source_id))
                })?;
            }
            if let Some(secs) = source.timeout_secs {
                if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
                    return Err(invalid(format!(
                        "source '{}' timeout_secs must be between 1 and {MAX_TIMEOUT_SECS}, got {secs}",
                        source.source_id
                    )));
                }
            }
            if source.stagger_minutes > MAX_INTERVAL_HOURS as u64 * 60 {
                return Err(invalid(format!(
                    "source '{}' stagger_minutes {} exceeds the longest interval",
                    source.source_id, source.stagger_minutes
                )));
            }
            if !(0..=MAX_DUE_SLACK_MINUTES).contains(&source.due_slack_minutes) {
                return Err(invalid(format!(
                    "source '{}' due_slack_minutes must be between 0 and {MAX_DUE_SLACK_MINUTES}",
                    source.source_id
                )));
            }
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        for source in &mut self.sources {
            if let Some(hours) = overrides.cycle_interval_hours {
                source.interval_hours = Some(hours);
            }
            if let Some(records) = overrides.records_per_run {
                source.records_per_run = records;
            }
            if let Some(max_size) = overrides.max_retention_size {
                source.max_size = max_size;
            }
        }
    }
}

/// Per-invocation values from the command line; they win over env and registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overrides {
    pub cycle_interval_hours: Option<i64>,
    pub records_per_run: Option<usize>,
    pub max_retention_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub sources_path: PathBuf,
    pub cycle_interval_hours: i64,
    pub producer_timeout_secs: u64,
    pub max_concurrency: usize,
    pub aggregate_max: usize,
    pub export_cron: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub alert_batch: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("REGWATCH_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let sources_path = std::env::var("REGWATCH_SOURCES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("sources.yaml"));
        Self {
            data_dir: std::env::var("REGWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            sources_path: workspace_root.join(sources_path),
            workspace_root,
            cycle_interval_hours: env_parse("REGWATCH_CYCLE_INTERVAL_HOURS").unwrap_or(24),
            producer_timeout_secs: env_parse("REGWATCH_PRODUCER_TIMEOUT_SECS").unwrap_or(300),
            max_concurrency: env_parse("REGWATCH_MAX_CONCURRENCY").unwrap_or(1),
            aggregate_max: env_parse("REGWATCH_AGGREGATE_MAX").unwrap_or(5000),
            export_cron: env_non_empty("REGWATCH_EXPORT_CRON"),
            alert_webhook_url: env_non_empty("REGWATCH_ALERT_WEBHOOK_URL"),
            alert_batch: env_parse("REGWATCH_ALERT_BATCH").unwrap_or(10),
        }
    }

    /// Defaults rooted at `workspace_root`, ignoring the environment.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            data_dir: workspace_root.join("data"),
            sources_path: workspace_root.join("sources.yaml"),
            workspace_root,
            cycle_interval_hours: 24,
            producer_timeout_secs: 300,
            max_concurrency: 1,
            aggregate_max: 5000,
            export_cron: None,
            alert_webhook_url: None,
            alert_batch: 10,
        }
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(hours) = overrides.cycle_interval_hours {
            self.cycle_interval_hours = hours;
        }
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn aggregate_dir(&self) -> PathBuf {
        self.data_dir.join("aggregate")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        interval(self.cycle_interval_hours)
            .map_err(|err| invalid(format!("cycle interval: {err}")))?;
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.producer_timeout_secs) {
            return Err(invalid(format!(
                "producer timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds"
            )));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max concurrency must be at least 1"));
        }
        if let Some(cron) = &self.export_cron {
            Job::new_async(cron, |_uuid, _l| Box::pin(async {}))
                .map_err(|err| invalid(format!("invalid export cron '{cron}': {err:?}")))?;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
