// Ingestion boundary: field rows, pivoting, sanitization, traffic sources

use crate::observation::{self, Observation};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// One `(timestamp, field, value)` tuple as delivered by the telemetry
/// transport, before pivoting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRow {
    pub timestamp: SystemTime,
    pub field: String,
    pub value: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum TransportError {
    #[error("ingestion fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection to telemetry source failed: {0}")]
    Connection(String),
    #[error("telemetry source rejected credentials: {0}")]
    Auth(String),
}

/// The ingestion collaborator. Zero rows is a valid result, not an error.
/// Implementations talk to whatever transport holds the traffic measurements;
/// the engine only sees field rows.
#[async_trait]
pub trait TrafficSource: Send {
    async fn fetch_recent(
        &mut self,
        range: Duration,
        measurement: &str,
        fields: &[String],
    ) -> Result<Vec<FieldRow>, TransportError>;
}

/// Maps a transport field name onto the canonical feature vocabulary. The
/// probe fleet reports under two naming conventions; the second one is
/// rewritten here and nowhere else. Unknown fields map to `None` and are
/// ignored during the pivot.
pub fn canonical_field(name: &str) -> Option<&'static str> {
    match name {
        "packet_length" => Some(observation::PACKET_LENGTH),
        "inter_arrival_time" | "inter_request_time" => Some(observation::INTER_ARRIVAL_TIME),
        "dns_rate" | "query_rate" => Some(observation::DNS_RATE),
        _ => None,
    }
}

/// One pivoted sample: all fields reported for a single timestamp.
#[derive(Debug, Clone)]
pub struct PivotedSample {
    pub timestamp: SystemTime,
    pub packet_length: Option<f64>,
    pub inter_arrival_time: Option<f64>,
    pub dns_rate: Option<f64>,
}

impl PivotedSample {
    fn empty(timestamp: SystemTime) -> Self {
        PivotedSample { timestamp, packet_length: None, inter_arrival_time: None, dns_rate: None }
    }
}

/// Pivots field rows into per-timestamp samples, one column per canonical
/// field, ordered by timestamp. Unknown field names are tolerated and
/// dropped.
pub fn pivot_rows(rows: Vec<FieldRow>) -> Vec<PivotedSample> {
    let mut table: BTreeMap<SystemTime, PivotedSample> = BTreeMap::new();
    for row in rows {
        let field = match canonical_field(&row.field) {
            Some(f) => f,
            None => continue,
        };
        let entry = table
            .entry(row.timestamp)
            .or_insert_with(|| PivotedSample::empty(row.timestamp));
        match field {
            observation::PACKET_LENGTH => entry.packet_length = Some(row.value),
            observation::INTER_ARRIVAL_TIME => entry.inter_arrival_time = Some(row.value),
            observation::DNS_RATE => entry.dns_rate = Some(row.value),
            _ => {}
        }
    }
    table.into_values().collect()
}

/// Turns pivoted samples into window-ready observations. Policy, applied only
/// here and never mid-window:
/// - rows lacking a finite `inter_arrival_time` are dropped (it derives the
///   request rate and cannot be reconstructed);
/// - rows with a non-finite value in any other *selected* raw feature are
///   dropped;
/// - a non-finite derived `request_rate` (zero inter-arrival time) is
///   forward-filled from the nearest preceding valid rate — first within the
///   batch, then from `seed_rate` (the window's tail). A leading row with
///   nothing to fill from is dropped.
pub fn sanitize_batch(
    samples: Vec<PivotedSample>,
    feature_set: &[String],
    seed_rate: Option<f64>,
) -> Vec<Observation> {
    let selected = |name: &str| feature_set.iter().any(|f| f == name);
    let mut last_rate = seed_rate.filter(|r| r.is_finite());
    let mut out = Vec::with_capacity(samples.len());

    for sample in samples {
        let inter_arrival_time = match sample.inter_arrival_time {
            Some(v) if v.is_finite() => v,
            _ => {
                log::debug!("dropping sample without inter_arrival_time at ingestion");
                continue;
            }
        };

        let packet_length = sample.packet_length.unwrap_or(f64::NAN);
        let dns_rate = sample.dns_rate.unwrap_or(f64::NAN);
        if selected(observation::PACKET_LENGTH) && !packet_length.is_finite() {
            continue;
        }
        if selected(observation::DNS_RATE) && !dns_rate.is_finite() {
            continue;
        }

        let raw_rate = 1.0 / inter_arrival_time;
        let request_rate = if raw_rate.is_finite() {
            last_rate = Some(raw_rate);
            raw_rate
        } else {
            match last_rate {
                Some(rate) => rate,
                None => continue,
            }
        };

        out.push(Observation::with_request_rate(
            sample.timestamp,
            packet_length,
            inter_arrival_time,
            dns_rate,
            request_rate,
        ));
    }
    out
}

/// Self-contained traffic source for demos and tests: draws inter-arrival
/// times and rates from the same uniform ranges the live probes report, with
/// an optional chance per sample of emitting an attack-shaped burst. The
/// internal clock advances by each sample's inter-arrival time so timestamps
/// stay strictly increasing across fetches.
pub struct SimulatedSource {
    rng: StdRng,
    clock: SystemTime,
    batch_size: usize,
    attack_probability: f64,
}

impl SimulatedSource {
    pub fn new(seed: u64, batch_size: usize) -> Self {
        SimulatedSource {
            rng: StdRng::seed_from_u64(seed),
            clock: SystemTime::now(),
            batch_size,
            attack_probability: 0.0,
        }
    }

    /// Chance per sample of generating attack-shaped traffic (tiny
    /// inter-arrival time, oversized packets, very high rate).
    pub fn with_attack_probability(mut self, probability: f64) -> Self {
        self.attack_probability = probability;
        self
    }
}

#[async_trait]
impl TrafficSource for SimulatedSource {
    async fn fetch_recent(
        &mut self,
        _range: Duration,
        _measurement: &str,
        fields: &[String],
    ) -> Result<Vec<FieldRow>, TransportError> {
        let mut rows = Vec::with_capacity(self.batch_size * fields.len());
        for _ in 0..self.batch_size {
            let attack = self.rng.gen_bool(self.attack_probability);
            let (inter_arrival_time, dns_rate, packet_length) = if attack {
                (
                    self.rng.gen_range(0.0001..0.001),
                    self.rng.gen_range(500.0..1000.0),
                    self.rng.gen_range(4000.0..6000.0),
                )
            } else {
                (
                    self.rng.gen_range(0.001..1.0),
                    self.rng.gen_range(0.0..100.0),
                    self.rng.gen_range(64.0..1500.0),
                )
            };
            self.clock += Duration::from_secs_f64(inter_arrival_time);

            for field in fields {
                let value = match canonical_field(field) {
                    Some(observation::PACKET_LENGTH) => packet_length,
                    Some(observation::INTER_ARRIVAL_TIME) => inter_arrival_time,
                    Some(observation::DNS_RATE) => dns_rate,
                    _ => continue,
                };
                rows.push(FieldRow { timestamp: self.clock, field: field.clone(), value });
            }
        }
        Ok(rows)
    }
}
