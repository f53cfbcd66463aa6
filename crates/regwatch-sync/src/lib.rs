//! Scheduled refresh engine: per-source schedulers, the multi-source
//! orchestrator, cycle reports and aggregate publishing.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use regwatch_adapters::{producer_for_mode, Producer};
use regwatch_core::RetentionMerger;
use regwatch_storage::{FileBackend, RetentionStore, RunStateStore, StorageBackend};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod aggregate;
pub mod alerts;
pub mod clock;
pub mod config;
pub mod orchestrator;
pub mod scheduler;

pub use aggregate::{AggregateExporter, AggregateManifest, ExportSummary};
pub use alerts::AlertSink;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Overrides, SourceConfig, SourceRegistry, SyncConfig};
pub use orchestrator::{CycleCounts, CycleReport, Orchestrator, SourceReport, SourceSlot, SourceStatus};
pub use scheduler::{Phase, RunFailure, RunOutcome, RunSummary, SchedulerSettings, SourceScheduler};

/// Producer built from the source's configured mode.
pub fn default_producer(
    config: &SyncConfig,
    source: &SourceConfig,
) -> Result<Arc<dyn Producer>, ConfigError> {
    let mode = source.producer_mode()?;
    Ok(producer_for_mode(mode, &source.synthetic, &config.fixtures_dir()))
}

/// Wires one scheduler per registry entry, in declaration order.
pub fn build_orchestrator<F>(
    config: &SyncConfig,
    registry: &SourceRegistry,
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    mut producer_for: F,
) -> Result<Orchestrator, ConfigError>
where
    F: FnMut(&SourceConfig) -> Result<Arc<dyn Producer>, ConfigError>,
{
    config.validate()?;
    registry.validate()?;

    let state_store = RunStateStore::new(backend.clone());
    let retention_store = RetentionStore::new(backend);
    let mut orchestrator = Orchestrator::new(
        clock.clone(),
        config::interval(config.cycle_interval_hours)?,
        config.max_concurrency,
    );
    for source in &registry.sources {
        let interval_hours = source.interval_hours.unwrap_or(config.cycle_interval_hours);
        let timeout_secs = source.timeout_secs.unwrap_or(config.producer_timeout_secs);
        let mut settings = SchedulerSettings::new(
            config::interval(interval_hours)?,
            StdDuration::from_secs(timeout_secs),
        );
        settings.due_slack = Duration::minutes(source.due_slack_minutes);
        settings.records_per_run = source.records_per_run;
        settings.retention = source.retention();

        let scheduler = SourceScheduler::new(
            source.source_id.clone(),
            settings,
            producer_for(source)?,
            RetentionMerger::new(source.identity()),
            state_store.clone(),
            retention_store.clone(),
            clock.clone(),
        );
        orchestrator.add_source(SourceSlot::new(
            scheduler,
            source.enabled,
            StdDuration::from_secs(source.stagger_minutes.saturating_mul(60)),
        ));
    }
    Ok(orchestrator)
}

/// Aggregate export followed by the optional webhook alert.
///
/// Clones share one lock, so the post-cycle export and the cron export never overlap.
#[derive(Clone)]
pub struct Publisher {
    exporter: AggregateExporter,
    alerts: Option<Arc<AlertSink>>,
    clock: Arc<dyn Clock>,
    exclusive: Arc<Mutex<()>>,
}

impl Publisher {
    pub fn new(
        exporter: AggregateExporter,
        alerts: Option<Arc<AlertSink>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            exporter,
            alerts,
            clock,
            exclusive: Arc::new(Mutex::new(())),
        }
    }

    pub async fn publish(&self) -> Result<ExportSummary> {
        let _exclusive = self.exclusive.lock().await;
        let summary = self.exporter.export(self.clock.now()).await?;
        if let Some(alerts) = &self.alerts {
            alerts.notify(&summary.records, self.clock.now()).await;
        }
        Ok(summary)
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    registry: SourceRegistry,
    orchestrator: Orchestrator,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    /// File-backed engine on the system clock.
    pub fn new(config: SyncConfig, registry: SourceRegistry) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(config.data_dir.clone()));
        let producer_config = config.clone();
        Self::from_parts(config, registry, backend, Arc::new(SystemClock), move |source| {
            default_producer(&producer_config, source)
        })
    }

    pub fn from_parts<F>(
        config: SyncConfig,
        registry: SourceRegistry,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        producer_for: F,
    ) -> Result<Self>
    where
        F: FnMut(&SourceConfig) -> Result<Arc<dyn Producer>, ConfigError>,
    {
        let orchestrator =
            build_orchestrator(&config, &registry, backend.clone(), clock.clone(), producer_for)?;
        let exporter = AggregateExporter::new(
            registry.sources.iter().map(|s| s.source_id.clone()).collect(),
            RetentionStore::new(backend),
            RetentionMerger::default(),
            config.aggregate_dir(),
            config.aggregate_max,
        );
        let alerts = match &config.alert_webhook_url {
            Some(url) => Some(Arc::new(AlertSink::new(url, config.alert_batch)?)),
            None => None,
        };
        Ok(Self {
            publisher: Publisher::new(exporter, alerts, clock.clone()),
            config,
            registry,
            orchestrator,
            clock,
        })
    }

    pub async fn from_env(overrides: &Overrides) -> Result<Self> {
        let mut config = SyncConfig::from_env();
        config.apply_overrides(overrides);
        let mut registry = SourceRegistry::load(&config.sources_path).await?;
        registry.apply_overrides(overrides);
        let engine = Self::new(config, registry)?;
        FileBackend::new(engine.config.data_dir.clone())
            .sweep_temp_files()
            .await
            .context("sweeping stale temp files")?;
        regwatch_storage::remove_stale_temp_files(&engine.config.aggregate_dir())
            .await
            .context("sweeping stale aggregate temp files")?;
        Ok(engine)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// One cycle (optionally a single source), its reports, then the aggregate export.
    pub async fn run_once(&self, only: Option<&str>) -> Result<CycleReport> {
        if let Some(source_id) = only {
            if self.registry.get(source_id).is_none() {
                bail!("unknown source '{source_id}'");
            }
        }
        let report = self.orchestrator.run_cycle(only).await;
        let reports_dir = self.write_reports(&report).await?;
        info!(reports_dir = %reports_dir.display(), "cycle reports written");
        if let Err(err) = self.publisher.publish().await {
            warn!(error = %format!("{err:#}"), "aggregate export failed");
        }
        Ok(report)
    }

    pub async fn export(&self) -> Result<ExportSummary> {
        self.publisher.publish().await
    }

    /// Repeats cycles until `shutdown` resolves; stops only between cycles.
    pub async fn run_forever<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let next_cycle_at = match self.run_once(None).await {
                Ok(report) => report.next_cycle_at,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "cycle bookkeeping failed");
                    clock::saturating_add(self.clock.now(), self.orchestrator.cycle_interval())
                }
            };
            let wait = (next_cycle_at - self.clock.now())
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            info!(%next_cycle_at, wait_secs = wait.as_secs(), "sleeping until next cycle");
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping between cycles");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub async fn maybe_build_export_scheduler(&self) -> Result<Option<JobScheduler>> {
        let Some(cron) = &self.config.export_cron else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let publisher = self.publisher.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let publisher = publisher.clone();
            Box::pin(async move {
                if let Err(err) = publisher.publish().await {
                    warn!(error = %format!("{err:#}"), "scheduled aggregate export failed");
                }
            })
        })
        .with_context(|| format!("creating export job for cron {cron}"))?;
        sched.add(job).await.context("adding export job")?;
        Ok(Some(sched))
    }

    async fn write_reports(&self, report: &CycleReport) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir().join(report.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(reports_dir.join("cycle_brief.md"), cycle_brief_markdown(report))
            .await
            .context("writing cycle_brief.md")?;

        let json = serde_json::to_vec_pretty(report).context("serializing cycle report")?;
        fs::write(reports_dir.join("cycle_report.json"), json)
            .await
            .context("writing cycle_report.json")?;

        Ok(reports_dir)
    }
}

pub fn cycle_brief_markdown(report: &CycleReport) -> String {
    let rows = report
        .sources
        .iter()
        .map(|s| {
            format!(
                "| {} | {:?} | {} | {} | {} | {} |",
                s.source_id,
                s.status,
                s.produced_count,
                s.new_count,
                s.surviving_count,
                s.detail.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# regwatch Cycle Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Next cycle: {}\n- Ok: {} / Skipped: {} / Failed: {} / Disabled: {}\n\n## Sources\n| source | status | produced | new | surviving | detail |\n|---|---|---|---|---|---|\n{}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.next_cycle_at,
        report.counts.ok,
        report.counts.skipped,
        report.counts.failed,
        report.counts.disabled,
        rows
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use regwatch_storage::MemoryBackend;
    use tempfile::tempdir;

    const REGISTRY: &str = r#"
sources:
  - source_id: texas
    display_name: Texas
    mode: synthetic
    records_per_run: 5
  - source_id: alabama
    display_name: Alabama
    mode: synthetic
    records_per_run: 3
    stagger_minutes: 1
    synthetic:
      state_code: AL
      entity_number_base: 500000
"#;

    fn engine(root: &std::path::Path) -> SyncEngine {
        let config = SyncConfig::for_workspace(root);
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()));
        let producer_config = config.clone();
        SyncEngine::from_parts(
            config,
            registry,
            Arc::new(MemoryBackend::new()),
            clock,
            move |source| default_producer(&producer_config, source),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_writes_reports_and_aggregate() {
        let dir = tempdir().expect("tempdir");
        let engine = engine(dir.path());
        let report = engine.run_once(None).await.unwrap();
        assert_eq!(report.counts.ok, 2);

        let run_dir = dir.path().join("reports").join(report.run_id.to_string());
        let brief = std::fs::read_to_string(run_dir.join("cycle_brief.md")).unwrap();
        assert!(brief.contains("| texas | Ok | 5 | 5 | 5 |"));
        assert!(run_dir.join("cycle_report.json").exists());

        let aggregate: Vec<regwatch_core::Record> = serde_json::from_slice(
            &std::fs::read(dir.path().join("data/aggregate/records.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(aggregate.len(), 8);
    }

    #[tokio::test]
    async fn unknown_single_source_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let engine = engine(dir.path());
        assert!(engine.run_once(Some("atlantis")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_forever_stops_on_shutdown_between_cycles() {
        let dir = tempdir().expect("tempdir");
        let engine = engine(dir.path());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            engine
                .run_forever(async {
                    let _ = rx.await;
                })
                .await
        });
        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn interval_flag_overrides_registry_intervals() {
        let mut config = SyncConfig::for_workspace(".");
        let mut registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        registry.sources[0].interval_hours = Some(24);
        let overrides = Overrides {
            cycle_interval_hours: Some(1),
            ..Overrides::default()
        };
        config.apply_overrides(&overrides);
        registry.apply_overrides(&overrides);

        let producer_config = config.clone();
        let orchestrator = build_orchestrator(
            &config,
            &registry,
            Arc::new(MemoryBackend::new()),
            Arc::new(SystemClock),
            |source| default_producer(&producer_config, source),
        )
        .unwrap();
        for id in ["texas", "alabama"] {
            let slot = orchestrator.slot(id).unwrap();
            assert_eq!(slot.scheduler.settings().interval, Duration::hours(1));
        }
        assert_eq!(orchestrator.cycle_interval(), Duration::hours(1));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_exports_are_serialized() {
        let dir = tempdir().expect("tempdir");
        let engine = engine(dir.path());
        engine.run_once(Some("texas")).await.unwrap();
        let (first, second) = tokio::join!(engine.export(), engine.export());
        assert_eq!(first.unwrap().records.len(), 5);
        assert_eq!(second.unwrap().records.len(), 5);

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("data/aggregate/manifest.json")).unwrap(),
        )
        .unwrap();
        let parquet = std::fs::read(dir.path().join("data/aggregate/records.parquet")).unwrap();
        assert_eq!(manifest["files"][1]["bytes"], serde_json::json!(parquet.len()));
    }

    #[test]
    fn invalid_registry_fails_construction() {
        let config = SyncConfig::for_workspace(".");
        let mut registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        registry.sources[1].source_id = "texas".into();
        let producer_config = config.clone();
        let result = SyncEngine::from_parts(
            config,
            registry,
            Arc::new(MemoryBackend::new()),
            Arc::new(SystemClock),
            move |source| default_producer(&producer_config, source),
        );
        assert!(result.is_err());
    }
}
