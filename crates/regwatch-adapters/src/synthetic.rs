//! Deterministic generator of plausible business registrations.
//!
//! Every choice is drawn from `sha256(source_id:sequence)`, so one
//! `(source, sequence)` pair always yields the same record.

use async_trait::async_trait;
use chrono::Days;
use regwatch_core::{Payload, Record};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::{ProduceRequest, Producer, ProducerError};

const BUSINESS_TYPES: &[&str] = &[
    "Tech Solutions",
    "Digital Ventures",
    "Innovation Labs",
    "Consulting Group",
    "Capital Partners",
    "Marketing Services",
    "Business Solutions",
    "Enterprises",
    "Technology Group",
    "Services International",
    "Investment Holdings",
    "Business Development",
    "Ventures Group",
    "Management",
    "Advisors",
    "Strategic Partners",
    "Development Group",
    "Resources",
    "Analytics",
    "Software Solutions",
    "Cloud Services",
    "Data Systems",
    "Networks",
];

const INDUSTRIES: &[&str] = &[
    "Healthcare",
    "Energy",
    "Technology",
    "Finance",
    "Real Estate",
    "Construction",
    "Manufacturing",
    "Logistics",
    "Retail",
    "Hospitality",
    "Professional Services",
    "Renewable Energy",
    "Aerospace",
    "Transportation",
    "Agriculture",
    "Education",
    "Telecommunications",
];

const SUFFIXES: &[&str] = &["LLC", "Inc", "Corp", "LP", "LLP"];

const MAX_DAYS_AGO: u64 = 30;
const MEAN_DAYS_AGO: f64 = 10.0;

/// Per-jurisdiction vocabulary for [`SyntheticProducer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticProfile {
    pub state_code: String,
    pub prefixes: Vec<String>,
    pub cities: Vec<String>,
    pub entity_number_base: u64,
    pub zip_low: u32,
    pub zip_high: u32,
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        Self {
            state_code: "US".to_string(),
            prefixes: ["Summit", "Heritage", "Pioneer", "Keystone", "Liberty"]
                .into_iter()
                .map(String::from)
                .collect(),
            cities: ["Springfield", "Franklin", "Greenville", "Madison", "Clinton"]
                .into_iter()
                .map(String::from)
                .collect(),
            entity_number_base: 1_000_000,
            zip_low: 10000,
            zip_high: 99999,
        }
    }
}

pub fn entity_type_for_suffix(suffix: &str) -> &'static str {
    match suffix {
        "Inc" | "Corp" => "Corporation",
        "LP" => "Limited Partnership",
        "LLP" => "Limited Liability Partnership",
        _ => "Limited Liability Company",
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticProducer {
    profile: SyntheticProfile,
}

impl SyntheticProducer {
    pub fn new(profile: SyntheticProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &SyntheticProfile {
        &self.profile
    }

    fn generate(&self, request: &ProduceRequest, sequence: u64) -> Record {
        let mut seed = Seed::new(&request.source_id, sequence);

        let business_type = seed.pick(BUSINESS_TYPES);
        let suffix = seed.pick(SUFFIXES);
        let name = if seed.next_u8() >= 128 {
            let city = seed.pick_owned(&self.profile.cities, "Central");
            format!("{city} {business_type} {suffix}")
        } else {
            let prefix = seed.pick_owned(&self.profile.prefixes, "First");
            let industry = seed.pick(INDUSTRIES);
            format!("{prefix} {industry} {business_type} {suffix}")
        };

        let entity_number = self.profile.entity_number_base.wrapping_add(sequence).to_string();
        let days_ago = seed.days_ago();
        let event_date = request
            .now
            .date_naive()
            .checked_sub_days(Days::new(days_ago))
            .unwrap_or_else(|| request.now.date_naive());

        let agent_no = 100 + seed.next_u16() % 900;
        // an inverted range collapses to zip_low
        let zip_span = self
            .profile
            .zip_high
            .saturating_sub(self.profile.zip_low)
            .saturating_add(1);
        let zip = self
            .profile
            .zip_low
            .saturating_add(u32::from(seed.next_u16()) % zip_span);
        let city = seed.pick_owned(&self.profile.cities, "Central");
        let state = &self.profile.state_code;

        let mut payload = Payload::new();
        payload.insert("state".into(), json!(state));
        payload.insert("entity_type".into(), json!(entity_type_for_suffix(suffix)));
        payload.insert("status".into(), json!("In Existence"));
        payload.insert(
            "registered_agent".into(),
            json!(format!("Registered Agent Services of {state} #{agent_no}")),
        );
        payload.insert("address".into(), json!(format!("{city}, {state} {zip:05}")));
        payload.insert("sequence".into(), json!(sequence));
        payload.insert("run_id".into(), json!(request.run_id.to_string()));

        Record {
            source_id: request.source_id.clone(),
            fallback_key: business_id(&name, &entity_number),
            natural_key: entity_number,
            display_name: name,
            observed_at: request.now,
            event_date,
            payload,
        }
    }
}

#[async_trait]
impl Producer for SyntheticProducer {
    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Record>, ProducerError> {
        let records = (0..request.limit as u64)
            .map(|i| self.generate(request, request.sequence_base.wrapping_add(i)))
            .collect();
        Ok(records)
    }
}

fn business_id(name: &str, entity_number: &str) -> String {
    let digest = Sha256::digest(format!("{name}_{entity_number}").to_lowercase().as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Byte stream drawn from a sha256 digest, re-hashed when exhausted.
struct Seed {
    block: [u8; 32],
    pos: usize,
}

impl Seed {
    fn new(source_id: &str, sequence: u64) -> Self {
        let digest = Sha256::digest(format!("{source_id}:{sequence}").as_bytes());
        Self {
            block: digest.into(),
            pos: 0,
        }
    }

    fn next_u8(&mut self) -> u8 {
        if self.pos == self.block.len() {
            self.block = Sha256::digest(self.block).into();
            self.pos = 0;
        }
        let byte = self.block[self.pos];
        self.pos += 1;
        byte
    }

    fn next_u16(&mut self) -> u16 {
        u16::from_be_bytes([self.next_u8(), self.next_u8()])
    }

    fn next_unit(&mut self) -> f64 {
        let raw = u32::from_be_bytes([self.next_u8(), self.next_u8(), self.next_u8(), self.next_u8()]);
        f64::from(raw) / (f64::from(u32::MAX) + 1.0)
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[usize::from(self.next_u16()) % items.len()]
    }

    fn pick_owned<'a>(&mut self, items: &'a [String], fallback: &'a str) -> &'a str {
        if items.is_empty() {
            return fallback;
        }
        &items[usize::from(self.next_u16()) % items.len()]
    }

    // exponential with mean MEAN_DAYS_AGO, skewed toward today
    fn days_ago(&mut self) -> u64 {
        let u = self.next_unit();
        let days = (-MEAN_DAYS_AGO * (1.0 - u).ln()).floor();
        (days as u64).min(MAX_DAYS_AGO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use regwatch_core::IdentityPolicy;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn request(limit: usize, sequence_base: u64) -> ProduceRequest {
        ProduceRequest {
            run_id: Uuid::nil(),
            source_id: "texas".to_string(),
            limit,
            sequence_base,
            now: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        }
    }

    fn texas() -> SyntheticProfile {
        SyntheticProfile {
            state_code: "TX".into(),
            prefixes: vec!["Lone Star".into(), "Alamo".into()],
            cities: vec!["Austin".into(), "Houston".into()],
            entity_number_base: 32_000_000_000,
            zip_low: 75000,
            zip_high: 79999,
        }
    }

    #[tokio::test]
    async fn same_sequence_yields_same_record() {
        let producer = SyntheticProducer::new(texas());
        let a = producer.produce(&request(5, 10)).await.unwrap();
        let b = producer.produce(&request(5, 10)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].natural_key, "32000000010");
        assert_eq!(a[4].natural_key, "32000000014");
    }

    #[tokio::test]
    async fn consecutive_runs_do_not_reuse_entity_numbers() {
        let producer = SyntheticProducer::new(texas());
        let first = producer.produce(&request(25, 0)).await.unwrap();
        let second = producer.produce(&request(25, 25)).await.unwrap();
        let policy = IdentityPolicy::default();
        let fingerprints = first
            .iter()
            .chain(second.iter())
            .map(|r| policy.fingerprint(r))
            .collect::<HashSet<_>>();
        assert_eq!(fingerprints.len(), 50);
    }

    #[tokio::test]
    async fn records_are_plausible() {
        let producer = SyntheticProducer::new(texas());
        let req = request(40, 0);
        let today = req.now.date_naive();
        for record in producer.produce(&req).await.unwrap() {
            let suffix = record.display_name.rsplit(' ').next().unwrap();
            assert!(SUFFIXES.contains(&suffix));
            assert_eq!(record.payload["entity_type"], json!(entity_type_for_suffix(suffix)));
            assert_eq!(record.payload["state"], json!("TX"));
            assert!(record.event_date <= today);
            assert!(record.event_date >= today - chrono::Duration::days(30));
            assert_eq!(record.fallback_key.len(), 12);
            let address = record.payload["address"].as_str().unwrap();
            let zip: u32 = address.rsplit(' ').next().unwrap().parse().unwrap();
            assert!((75000..=79999).contains(&zip));
        }
    }

    #[tokio::test]
    async fn extreme_zip_ranges_do_not_overflow() {
        let mut profile = texas();
        profile.zip_low = 0;
        profile.zip_high = u32::MAX;
        let wide = SyntheticProducer::new(profile.clone());
        assert_eq!(wide.produce(&request(10, 0)).await.unwrap().len(), 10);

        profile.zip_low = u32::MAX;
        profile.zip_high = 5;
        let inverted = SyntheticProducer::new(profile);
        for record in inverted.produce(&request(5, 0)).await.unwrap() {
            let address = record.payload["address"].as_str().unwrap();
            assert!(address.ends_with(&u32::MAX.to_string()));
        }
    }

    #[tokio::test]
    async fn zero_limit_produces_nothing() {
        let producer = SyntheticProducer::default();
        assert!(producer.produce(&request(0, 0)).await.unwrap().is_empty());
    }

    #[test]
    fn suffix_maps_to_entity_type() {
        assert_eq!(entity_type_for_suffix("Corp"), "Corporation");
        assert_eq!(entity_type_for_suffix("LLP"), "Limited Liability Partnership");
        assert_eq!(entity_type_for_suffix("LLC"), "Limited Liability Company");
    }
}
