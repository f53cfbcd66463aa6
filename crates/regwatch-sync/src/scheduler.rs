//! Per-source refresh state machine: due-check, produce, merge, persist.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use regwatch_adapters::{ProduceRequest, Producer, ProducerError};
use regwatch_core::{RetentionConfig, RetentionMerger, RunState};
use regwatch_storage::{BackoffPolicy, RetentionStore, RunStateStore, StorageError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::clock::{saturating_add, Clock};
use crate::config::DEFAULT_RECORDS_PER_RUN;

/// Failed sources wait 5 minutes, doubling per consecutive failure, up to an hour.
pub fn failure_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: usize::MAX,
        base_delay: StdDuration::from_secs(5 * 60),
        max_delay: StdDuration::from_secs(60 * 60),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    DueCheck,
    Producing,
    Merging,
    Persisting,
    Failed,
}

#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error("producer timed out after {0:?}")]
    Timeout(StdDuration),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("run panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotDue,
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub source_id: String,
    pub produced_count: usize,
    pub new_count: usize,
    pub surviving_count: usize,
    pub next_due_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Ok(RunSummary),
    Skipped {
        reason: SkipReason,
        next_due_at: DateTime<Utc>,
    },
    Failed(RunFailure),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// How early a run may still count as due; zero means `now - last_run_at >= interval`.
    pub due_slack: Duration,
    pub producer_timeout: StdDuration,
    pub records_per_run: usize,
    pub retention: RetentionConfig,
    pub backoff: BackoffPolicy,
}

impl SchedulerSettings {
    pub fn new(interval: Duration, producer_timeout: StdDuration) -> Self {
        Self {
            interval,
            due_slack: Duration::zero(),
            producer_timeout,
            records_per_run: DEFAULT_RECORDS_PER_RUN,
            retention: RetentionConfig::default(),
            backoff: failure_backoff(),
        }
    }
}

#[derive(Debug)]
struct Status {
    phase: Phase,
    consecutive_failures: usize,
    retry_not_before: Option<DateTime<Utc>>,
}

/// Owns one source's refresh cycle.
///
/// `RunState` and the retention set only change after a fully successful
/// merge and save, so any failure leaves the previous cycle's output intact.
pub struct SourceScheduler {
    source_id: String,
    settings: SchedulerSettings,
    producer: Arc<dyn Producer>,
    merger: RetentionMerger,
    state_store: RunStateStore,
    retention_store: RetentionStore,
    clock: Arc<dyn Clock>,
    status: Mutex<Status>,
}

impl SourceScheduler {
    pub fn new(
        source_id: impl Into<String>,
        settings: SchedulerSettings,
        producer: Arc<dyn Producer>,
        merger: RetentionMerger,
        state_store: RunStateStore,
        retention_store: RetentionStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
            producer,
            merger,
            state_store,
            retention_store,
            clock,
            status: Mutex::new(Status {
                phase: Phase::Idle,
                consecutive_failures: 0,
                retry_not_before: None,
            }),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.with_status(|s| s.phase)
    }

    pub fn consecutive_failures(&self) -> usize {
        self.with_status(|s| s.consecutive_failures)
    }

    pub fn retry_not_before(&self) -> Option<DateTime<Utc>> {
        self.with_status(|s| s.retry_not_before)
    }

    pub fn is_due(&self, state: &RunState, now: DateTime<Utc>) -> bool {
        match state.last_run_at {
            None => true,
            Some(last) => now - last >= self.settings.interval - self.settings.due_slack,
        }
    }

    pub async fn run_once(&self, run_id: Uuid) -> RunOutcome {
        self.run_scheduled(run_id, None).await
    }

    /// Like `run_once`, but a successful run records `scheduled_at` (when not in
    /// the future) as `last_run_at`, so slot times do not drift cycle to cycle.
    pub async fn run_scheduled(
        &self,
        run_id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> RunOutcome {
        let span = info_span!("source_run", source_id = %self.source_id, run_id = %run_id);
        self.run_inner(run_id, scheduled_at).instrument(span).await
    }

    /// Records a failure observed outside `run_once` (hard timeout, panic).
    pub fn note_failure(&self, now: DateTime<Utc>) {
        let mut status = self.lock_status();
        status.phase = Phase::Failed;
        status.consecutive_failures += 1;
        let delay = self
            .settings
            .backoff
            .delay_for_attempt(status.consecutive_failures - 1);
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::hours(1));
        status.retry_not_before = Some(saturating_add(now, delay));
    }

    async fn run_inner(&self, run_id: Uuid, scheduled_at: Option<DateTime<Utc>>) -> RunOutcome {
        let now = self.clock.now();
        self.set_phase(Phase::DueCheck);

        if let Some(retry_at) = self.retry_not_before() {
            if now < retry_at {
                self.set_phase(Phase::Failed);
                info!(%retry_at, "source in failure backoff; skipping");
                return RunOutcome::Skipped {
                    reason: SkipReason::Backoff,
                    next_due_at: retry_at,
                };
            }
        }

        let state = self.state_store.load(&self.source_id).await;
        if !self.is_due(&state, now) {
            self.set_phase(Phase::Idle);
            let next_due_at = state
                .last_run_at
                .map(|last| saturating_add(last, self.settings.interval))
                .unwrap_or(now);
            info!(%next_due_at, "source not due; skipping");
            return RunOutcome::Skipped {
                reason: SkipReason::NotDue,
                next_due_at,
            };
        }

        let ran_at = scheduled_at.map_or(now, |at| at.min(now));
        match self.refresh(run_id, state, now, ran_at).await {
            Ok(summary) => {
                let mut status = self.lock_status();
                status.phase = Phase::Idle;
                status.consecutive_failures = 0;
                status.retry_not_before = None;
                drop(status);
                info!(
                    produced = summary.produced_count,
                    new = summary.new_count,
                    surviving = summary.surviving_count,
                    "source refreshed"
                );
                RunOutcome::Ok(summary)
            }
            Err(failure) => {
                self.note_failure(now);
                warn!(error = %failure, "source run failed; previous output kept");
                RunOutcome::Failed(failure)
            }
        }
    }

    async fn refresh(
        &self,
        run_id: Uuid,
        state: RunState,
        now: DateTime<Utc>,
        ran_at: DateTime<Utc>,
    ) -> Result<RunSummary, RunFailure> {
        self.set_phase(Phase::Producing);
        let request = ProduceRequest {
            run_id,
            source_id: self.source_id.clone(),
            limit: self.settings.records_per_run,
            sequence_base: state.total_produced,
            now,
        };
        let incoming = tokio::time::timeout(
            self.settings.producer_timeout,
            self.producer.produce(&request),
        )
        .await
        .map_err(|_| RunFailure::Timeout(self.settings.producer_timeout))??;
        let produced_count = incoming.len();

        self.set_phase(Phase::Merging);
        let identity = self.merger.identity();
        let mut batch = HashSet::with_capacity(incoming.len());
        let new_count = incoming
            .iter()
            .map(|record| identity.fingerprint(record))
            .filter(|fp| !state.has_seen(fp) && batch.insert(fp.clone()))
            .count();

        let existing = self.retention_store.load(&self.source_id).await;
        let merged = self
            .merger
            .merge(existing, incoming, &self.settings.retention, now);
        // Fingerprints of evicted records are dropped so the set tracks the retention set.
        let seen_fingerprints = merged
            .iter()
            .map(|record| identity.fingerprint(record))
            .collect::<BTreeSet<_>>();

        self.set_phase(Phase::Persisting);
        self.retention_store.save(&self.source_id, &merged).await?;
        let next_state = RunState {
            last_run_at: Some(ran_at),
            run_count: state.run_count + 1,
            total_produced: state.total_produced + produced_count as u64,
            seen_fingerprints,
        };
        self.state_store.save(&self.source_id, &next_state).await?;

        Ok(RunSummary {
            source_id: self.source_id.clone(),
            produced_count,
            new_count,
            surviving_count: merged.len(),
            next_due_at: saturating_add(ran_at, self.settings.interval),
        })
    }

    fn set_phase(&self, phase: Phase) {
        self.lock_status().phase = phase;
    }

    fn with_status<T>(&self, f: impl FnOnce(&Status) -> T) -> T {
        f(&self.lock_status())
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
