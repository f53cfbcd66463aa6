//! Runs every configured source scheduler once per cycle with stagger,
//! hard timeouts and panic isolation.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{saturating_add, Clock};
use crate::scheduler::{RunFailure, RunOutcome, SkipReason, SourceScheduler};

/// Headroom beyond the producer timeout for loading, merging and saving.
pub const RUN_GRACE: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Skipped,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub status: SourceStatus,
    pub produced_count: usize,
    pub new_count: usize,
    pub surviving_count: usize,
    pub next_due_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

impl SourceReport {
    fn empty(source_id: &str, status: SourceStatus) -> Self {
        Self {
            source_id: source_id.to_string(),
            status,
            produced_count: 0,
            new_count: 0,
            surviving_count: 0,
            next_due_at: None,
            detail: None,
            elapsed_ms: 0,
        }
    }

    fn failed(source_id: &str, failure: &RunFailure) -> Self {
        Self {
            detail: Some(failure.to_string()),
            ..Self::empty(source_id, SourceStatus::Failed)
        }
    }

    fn from_outcome(source_id: &str, outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Ok(summary) => Self {
                produced_count: summary.produced_count,
                new_count: summary.new_count,
                surviving_count: summary.surviving_count,
                next_due_at: Some(summary.next_due_at),
                ..Self::empty(source_id, SourceStatus::Ok)
            },
            RunOutcome::Skipped {
                reason,
                next_due_at,
            } => Self {
                next_due_at: Some(next_due_at),
                detail: Some(
                    match reason {
                        SkipReason::NotDue => "not due",
                        SkipReason::Backoff => "failure backoff",
                    }
                    .to_string(),
                ),
                ..Self::empty(source_id, SourceStatus::Skipped)
            },
            RunOutcome::Failed(failure) => Self::failed(source_id, &failure),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounts {
    pub ok: usize,
    pub skipped: usize,
    pub failed: usize,
    pub disabled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub next_cycle_at: DateTime<Utc>,
    pub counts: CycleCounts,
    pub sources: Vec<SourceReport>,
}

impl CycleReport {
    pub fn source(&self, source_id: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

fn tally(sources: &[SourceReport]) -> CycleCounts {
    let mut counts = CycleCounts::default();
    for source in sources {
        match source.status {
            SourceStatus::Ok => counts.ok += 1,
            SourceStatus::Skipped => counts.skipped += 1,
            SourceStatus::Failed => counts.failed += 1,
            SourceStatus::Disabled => counts.disabled += 1,
        }
    }
    counts
}

/// One configured source as the orchestrator sees it.
#[derive(Clone)]
pub struct SourceSlot {
    pub source_id: String,
    pub enabled: bool,
    pub stagger: StdDuration,
    pub hard_timeout: StdDuration,
    pub scheduler: Arc<SourceScheduler>,
}

impl SourceSlot {
    pub fn new(scheduler: SourceScheduler, enabled: bool, stagger: StdDuration) -> Self {
        let hard_timeout = scheduler.settings().producer_timeout.saturating_add(RUN_GRACE);
        Self {
            source_id: scheduler.source_id().to_string(),
            enabled,
            stagger,
            hard_timeout,
            scheduler: Arc::new(scheduler),
        }
    }

    pub fn with_hard_timeout(mut self, hard_timeout: StdDuration) -> Self {
        self.hard_timeout = hard_timeout;
        self
    }

    /// Wall-clock time this slot opens in a cycle that started at `cycle_started_at`.
    fn opens_at(&self, cycle_started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::from_std(self.stagger)
            .ok()
            .map(|stagger| saturating_add(cycle_started_at, stagger))
    }
}

pub struct Orchestrator {
    slots: Vec<SourceSlot>,
    clock: Arc<dyn Clock>,
    cycle_interval: Duration,
    max_concurrency: usize,
}

impl Orchestrator {
    pub fn new(clock: Arc<dyn Clock>, cycle_interval: Duration, max_concurrency: usize) -> Self {
        Self {
            slots: Vec::new(),
            clock,
            cycle_interval,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn add_source(&mut self, slot: SourceSlot) {
        self.slots.push(slot);
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.source_id.as_str())
    }

    pub fn slot(&self, source_id: &str) -> Option<&SourceSlot> {
        self.slots.iter().find(|s| s.source_id == source_id)
    }

    pub fn cycle_interval(&self) -> Duration {
        self.cycle_interval
    }

    /// Runs one cycle over all sources, or only `only` with stagger ignored.
    ///
    /// Never fails: every per-source error, timeout or panic becomes a report entry.
    pub async fn run_cycle(&self, only: Option<&str>) -> CycleReport {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let cycle_start = Instant::now();
        info!(%run_id, sources = self.slots.len(), "cycle started");

        let selected = self
            .slots
            .iter()
            .filter(|slot| only.map_or(true, |id| slot.source_id == id))
            .cloned()
            .collect::<Vec<_>>();
        let honor_stagger = only.is_none();

        let sources = if self.max_concurrency > 1 {
            self.run_concurrent(selected, run_id, started_at, cycle_start, honor_stagger)
                .await
        } else {
            let mut reports = Vec::with_capacity(selected.len());
            for slot in selected {
                let report = if slot.enabled {
                    let mut scheduled_at = None;
                    if honor_stagger {
                        tokio::time::sleep_until(cycle_start + slot.stagger).await;
                        scheduled_at = slot.opens_at(started_at);
                    }
                    run_slot(slot, self.clock.clone(), run_id, scheduled_at).await
                } else {
                    SourceReport::empty(&slot.source_id, SourceStatus::Disabled)
                };
                reports.push(report);
            }
            reports
        };

        let counts = tally(&sources);
        let report = CycleReport {
            run_id,
            started_at,
            finished_at: self.clock.now(),
            next_cycle_at: saturating_add(started_at, self.cycle_interval),
            counts,
            sources,
        };
        info!(
            %run_id,
            ok = counts.ok,
            skipped = counts.skipped,
            failed = counts.failed,
            disabled = counts.disabled,
            next_cycle_at = %report.next_cycle_at,
            "cycle finished"
        );
        report
    }

    async fn run_concurrent(
        &self,
        selected: Vec<SourceSlot>,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cycle_start: Instant,
        honor_stagger: bool,
    ) -> Vec<SourceReport> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut reports: Vec<Option<SourceReport>> = vec![None; selected.len()];
        let mut tasks = JoinSet::new();

        for (index, slot) in selected.iter().enumerate() {
            if !slot.enabled {
                reports[index] = Some(SourceReport::empty(&slot.source_id, SourceStatus::Disabled));
                continue;
            }
            let slot = slot.clone();
            let permits = permits.clone();
            let clock = self.clock.clone();
            tasks.spawn(async move {
                let mut scheduled_at = None;
                if honor_stagger {
                    tokio::time::sleep_until(cycle_start + slot.stagger).await;
                    scheduled_at = slot.opens_at(started_at);
                }
                let report = match permits.acquire_owned().await {
                    Ok(_permit) => run_slot(slot, clock, run_id, scheduled_at).await,
                    Err(_) => SourceReport::failed(
                        &slot.source_id,
                        &RunFailure::Panicked("concurrency limiter closed".into()),
                    ),
                };
                (index, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(err) => warn!(error = %err, "source wrapper task failed"),
            }
        }

        reports
            .into_iter()
            .zip(selected.iter())
            .map(|(report, slot)| {
                report.unwrap_or_else(|| {
                    SourceReport::failed(
                        &slot.source_id,
                        &RunFailure::Panicked("source task vanished".into()),
                    )
                })
            })
            .collect()
    }
}

/// Runs one source as its own task under the slot's hard timeout.
async fn run_slot(
    slot: SourceSlot,
    clock: Arc<dyn Clock>,
    run_id: Uuid,
    scheduled_at: Option<DateTime<Utc>>,
) -> SourceReport {
    let started = Instant::now();
    let scheduler = slot.scheduler.clone();
    let mut handle = tokio::spawn(async move { scheduler.run_scheduled(run_id, scheduled_at).await });

    let mut report = match tokio::time::timeout(slot.hard_timeout, &mut handle).await {
        Ok(Ok(outcome)) => SourceReport::from_outcome(&slot.source_id, outcome),
        Ok(Err(join_err)) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                join_err.to_string()
            };
            slot.scheduler.note_failure(clock.now());
            warn!(source_id = %slot.source_id, %message, "source run panicked");
            SourceReport::failed(&slot.source_id, &RunFailure::Panicked(message))
        }
        Err(_) => {
            handle.abort();
            slot.scheduler.note_failure(clock.now());
            warn!(source_id = %slot.source_id, timeout = ?slot.hard_timeout, "source run exceeded hard timeout; aborted");
            SourceReport::failed(&slot.source_id, &RunFailure::Timeout(slot.hard_timeout))
        }
    };
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    report
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::SchedulerSettings;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use regwatch_adapters::{ProduceRequest, Producer, ProducerError, SyntheticProducer, SyntheticProfile};
    use regwatch_core::{Record, RetentionMerger};
    use regwatch_storage::{MemoryBackend, RetentionStore, RunStateStore, StorageBackend};

    struct PanickingProducer;

    #[async_trait]
    impl Producer for PanickingProducer {
        async fn produce(&self, _request: &ProduceRequest) -> Result<Vec<Record>, ProducerError> {
            panic!("parser exploded");
        }
    }

    /// Sleeps far past any hard timeout.
    struct HangingProducer;

    #[async_trait]
    impl Producer for HangingProducer {
        async fn produce(&self, _request: &ProduceRequest) -> Result<Vec<Record>, ProducerError> {
            tokio::time::sleep(StdDuration::from_secs(86_400)).await;
            Ok(Vec::new())
        }
    }

    struct RecordingProducer {
        inner: SyntheticProducer,
        started: Arc<std::sync::Mutex<Vec<(String, Instant)>>>,
    }

    #[async_trait]
    impl Producer for RecordingProducer {
        async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Record>, ProducerError> {
            self.started
                .lock()
                .unwrap()
                .push((request.source_id.clone(), Instant::now()));
            self.inner.produce(request).await
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()))
    }

    fn scheduler(
        id: &str,
        producer: Arc<dyn Producer>,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<ManualClock>,
    ) -> SourceScheduler {
        SourceScheduler::new(
            id,
            SchedulerSettings::new(Duration::hours(24), StdDuration::from_secs(30)),
            producer,
            RetentionMerger::default(),
            RunStateStore::new(backend.clone()),
            RetentionStore::new(backend),
            clock,
        )
    }

    fn synthetic() -> Arc<dyn Producer> {
        Arc::new(SyntheticProducer::new(SyntheticProfile::default()))
    }

    #[tokio::test]
    async fn panic_in_one_source_is_contained() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = clock();
        let mut orchestrator = Orchestrator::new(clock.clone(), Duration::hours(24), 1);
        orchestrator.add_source(SourceSlot::new(
            scheduler("alabama", Arc::new(PanickingProducer), backend.clone(), clock.clone()),
            true,
            StdDuration::ZERO,
        ));
        orchestrator.add_source(SourceSlot::new(
            scheduler("tennessee", synthetic(), backend, clock.clone()),
            true,
            StdDuration::ZERO,
        ));

        let report = orchestrator.run_cycle(None).await;
        let alabama = report.source("alabama").unwrap();
        assert_eq!(alabama.status, SourceStatus::Failed);
        assert!(alabama.detail.as_deref().unwrap().contains("parser exploded"));
        assert_eq!(report.source("tennessee").unwrap().status, SourceStatus::Ok);
        assert_eq!(report.counts, CycleCounts { ok: 1, skipped: 0, failed: 1, disabled: 0 });
        assert_eq!(report.next_cycle_at, report.started_at + Duration::hours(24));
        assert!(orchestrator.slot("alabama").unwrap().scheduler.retry_not_before().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stagger_offsets_are_measured_from_cycle_start() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = clock();
        let started = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut orchestrator = Orchestrator::new(clock.clone(), Duration::hours(24), 1);
        for (id, minutes) in [("texas", 0), ("michigan", 5), ("alabama", 10)] {
            let producer = Arc::new(RecordingProducer {
                inner: SyntheticProducer::default(),
                started: started.clone(),
            });
            orchestrator.add_source(SourceSlot::new(
                scheduler(id, producer, backend.clone(), clock.clone()),
                true,
                StdDuration::from_secs(minutes * 60),
            ));
        }

        let origin = Instant::now();
        let report = orchestrator.run_cycle(None).await;
        assert_eq!(report.counts.ok, 3);
        let offsets = started
            .lock()
            .unwrap()
            .iter()
            .map(|(id, at)| (id.clone(), (*at - origin).as_secs() / 60))
            .collect::<Vec<_>>();
        assert_eq!(
            offsets,
            vec![("texas".into(), 0), ("michigan".into(), 5), ("alabama".into(), 10)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_source_filter_ignores_stagger() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = clock();
        let mut orchestrator = Orchestrator::new(clock.clone(), Duration::hours(24), 1);
        orchestrator.add_source(SourceSlot::new(
            scheduler("texas", synthetic(), backend.clone(), clock.clone()),
            true,
            StdDuration::ZERO,
        ));
        orchestrator.add_source(SourceSlot::new(
            scheduler("michigan", synthetic(), backend, clock.clone()),
            true,
            StdDuration::from_secs(3600),
        ));

        let origin = Instant::now();
        let report = orchestrator.run_cycle(Some("michigan")).await;
        assert_eq!(report.sources.len(), 1);
        assert_eq!(report.sources[0].status, SourceStatus::Ok);
        assert!(origin.elapsed() < StdDuration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_mode_keeps_declaration_order() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = clock();
        let mut orchestrator = Orchestrator::new(clock.clone(), Duration::hours(24), 3);
        for (id, minutes, enabled) in [("a", 20, true), ("b", 0, false), ("c", 0, true)] {
            orchestrator.add_source(SourceSlot::new(
                scheduler(id, synthetic(), backend.clone(), clock.clone()),
                enabled,
                StdDuration::from_secs(minutes * 60),
            ));
        }
        let report = orchestrator.run_cycle(None).await;
        let statuses = report
            .sources
            .iter()
            .map(|s| (s.source_id.as_str(), s.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("a", SourceStatus::Ok),
                ("b", SourceStatus::Disabled),
                ("c", SourceStatus::Ok)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_do_not_cancel_siblings() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = clock();
        let mut orchestrator = Orchestrator::new(clock.clone(), Duration::hours(24), 2);
        let hanging = SourceScheduler::new(
            "tennessee",
            SchedulerSettings::new(Duration::hours(24), StdDuration::from_secs(86_400)),
            Arc::new(HangingProducer),
            RetentionMerger::default(),
            RunStateStore::new(backend.clone()),
            RetentionStore::new(backend.clone()),
            clock.clone(),
        );
        orchestrator.add_source(
            SourceSlot::new(hanging, true, StdDuration::ZERO).with_hard_timeout(StdDuration::from_secs(10)),
        );
        orchestrator.add_source(SourceSlot::new(
            scheduler("alabama", Arc::new(PanickingProducer), backend.clone(), clock.clone()),
            true,
            StdDuration::ZERO,
        ));
        orchestrator.add_source(SourceSlot::new(
            scheduler("texas", synthetic(), backend, clock.clone()),
            true,
            StdDuration::ZERO,
        ));

        let origin = Instant::now();
        let report = orchestrator.run_cycle(None).await;
        let statuses = report
            .sources
            .iter()
            .map(|s| (s.source_id.as_str(), s.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("tennessee", SourceStatus::Failed),
                ("alabama", SourceStatus::Failed),
                ("texas", SourceStatus::Ok)
            ]
        );
        assert!(report.source("tennessee").unwrap().detail.as_deref().unwrap().contains("timed out"));
        assert!(report.source("alabama").unwrap().detail.as_deref().unwrap().contains("parser exploded"));
        assert_eq!(report.source("texas").unwrap().produced_count, 25);
        assert!(origin.elapsed() < StdDuration::from_secs(60));
    }

    #[tokio::test]
    async fn second_cycle_skips_sources_that_are_not_due() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let clock = clock();
        let mut orchestrator = Orchestrator::new(clock.clone(), Duration::hours(24), 1);
        orchestrator.add_source(SourceSlot::new(
            scheduler("texas", synthetic(), backend, clock.clone()),
            true,
            StdDuration::ZERO,
        ));
        assert_eq!(orchestrator.run_cycle(None).await.counts.ok, 1);
        clock.advance(Duration::hours(2));
        let report = orchestrator.run_cycle(None).await;
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(report.sources[0].detail.as_deref(), Some("not due"));
    }
}
