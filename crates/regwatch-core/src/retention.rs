//! Deduplicating, windowed, size-capped merge of record sets.

use std::collections::HashSet;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{IdentityPolicy, Record};

/// Retention policy for one record set. Zero disables either limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub window_days: u32,
    #[serde(default)]
    pub max_size: usize,
}

impl RetentionConfig {
    pub fn new(window_days: u32, max_size: usize) -> Self {
        Self {
            window_days,
            max_size,
        }
    }

    /// Oldest `event_date` still inside the window, if a window is set.
    pub fn window_cutoff(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        if self.window_days == 0 {
            return None;
        }
        now.date_naive()
            .checked_sub_days(Days::new(u64::from(self.window_days)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionMerger {
    identity: IdentityPolicy,
}

impl RetentionMerger {
    pub fn new(identity: IdentityPolicy) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &IdentityPolicy {
        &self.identity
    }

    /// Merges `incoming` into `existing`.
    ///
    /// At most one record survives per dedup key and it is always the most
    /// recently observed one; on equal `observed_at` the incoming record wins.
    /// The window is applied after dedup so an aged-out key cannot come back
    /// through an older duplicate. Output is ordered by `event_date` descending.
    pub fn merge(
        &self,
        existing: Vec<Record>,
        incoming: Vec<Record>,
        config: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> Vec<Record> {
        let mut combined = incoming;
        combined.extend(existing);

        let mut survivors = self.freshest_per_key(combined);
        if let Some(cutoff) = config.window_cutoff(now) {
            survivors.retain(|(_, record)| record.event_date >= cutoff);
        }
        finish(survivors, config.max_size)
    }

    /// Union of several sets under the same identity rule, capped to `max_size`.
    pub fn merge_union<I>(&self, sets: I, max_size: usize) -> Vec<Record>
    where
        I: IntoIterator<Item = Vec<Record>>,
    {
        let combined = sets.into_iter().flatten().collect::<Vec<_>>();
        finish(self.freshest_per_key(combined), max_size)
    }

    fn freshest_per_key(&self, mut records: Vec<Record>) -> Vec<(String, Record)> {
        // stable: equal observed_at keeps concatenation order
        records.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));

        let mut seen = HashSet::with_capacity(records.len());
        let mut survivors = Vec::with_capacity(records.len());
        for record in records {
            let key = self.identity.dedup_key(&record);
            if seen.insert(key.clone()) {
                survivors.push((key, record));
            }
        }
        survivors
    }
}

fn finish(mut survivors: Vec<(String, Record)>, max_size: usize) -> Vec<Record> {
    survivors.sort_by(|(key_a, a), (key_b, b)| {
        b.event_date
            .cmp(&a.event_date)
            .then_with(|| b.observed_at.cmp(&a.observed_at))
            .then_with(|| key_a.cmp(key_b))
    });
    if max_size > 0 {
        survivors.truncate(max_size);
    }
    survivors.into_iter().map(|(_, record)| record).collect()
}
