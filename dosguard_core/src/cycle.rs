// Detection cycle orchestration: fetch -> score -> publish

use crate::config::{ConfigError, DetectorConfig};
use crate::forest::{IsolationForest, ScoreError};
use crate::health::{HealthEventKind, HealthTracker, PassTimer};
use crate::ingest::{pivot_rows, sanitize_batch, TrafficSource, TransportError};
use crate::normalize::Normalizer;
use crate::observation::{self, CycleReport, Observation, PredictionRecord, Verdict};
use crate::window::{feature_matrix_from, DataShapeError, ObservationWindow};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Bound on the manual-prediction history ring.
pub const PREDICTION_HISTORY: usize = 100;

/// Where the orchestrator currently is in its cycle. `Error` is transient:
/// the failure is surfaced as a health event and the state settles back to
/// `Idle`, so the next trigger resumes fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleState {
    Idle,
    Fetching,
    Scoring,
    Publishing,
    Error,
}

#[derive(Debug, Error, PartialEq)]
pub enum CycleError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("data shape failure: {0}")]
    Shape(#[from] DataShapeError),
    #[error("scoring failure: {0}")]
    Scoring(ScoreError),
}

impl From<ScoreError> for CycleError {
    fn from(err: ScoreError) -> Self {
        // Shape failures keep their own classification even when the scorer
        // raised them, so health events stay accurate.
        match err {
            ScoreError::Shape(shape) => CycleError::Shape(shape),
            other => CycleError::Scoring(other),
        }
    }
}

/// The presentation collaborator. Receives one report per completed cycle and
/// must not block the orchestrator — queue or drop, never wait.
#[async_trait]
pub trait VerdictSink: Send + Sync {
    async fn publish(&self, report: CycleReport);
}

/// Bounded-queue handoff to a consumer task. When the consumer lags the
/// report is dropped rather than stalling the detection loop.
pub struct ChannelSink {
    tx: mpsc::Sender<CycleReport>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<CycleReport>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelSink { tx }, rx)
    }
}

#[async_trait]
impl VerdictSink for ChannelSink {
    async fn publish(&self, report: CycleReport) {
        if let Err(err) = self.tx.try_send(report) {
            log::debug!("verdict report dropped: {}", err);
        }
    }
}

/// What one `run_cycle` call amounted to.
#[derive(Debug)]
pub enum CycleOutcome {
    Published { window_len: usize, anomalies: usize },
    /// Fetch produced no usable rows; window unchanged, nothing published.
    EmptyBatch,
    /// The failure was recorded as a health event; published verdicts are
    /// untouched.
    Failed(CycleError),
}

/// Owns the window, the scorer, and all per-cycle state. Exactly one task
/// drives a detector (`&mut` on every cycle entry point), which is what
/// enforces the single-writer discipline on the window: a new fetch cannot
/// begin until the previous publish has completed or errored.
pub struct Detector {
    config: DetectorConfig,
    window: ObservationWindow,
    normalizer: Normalizer,
    forest: IsolationForest,
    health: HealthTracker,
    state: CycleState,
    cycles_completed: u64,
    last_report: Option<CycleReport>,
    predictions: VecDeque<PredictionRecord>,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let window = ObservationWindow::new(config.window_capacity);
        let normalizer = Normalizer::new(config.normalization);
        let forest = IsolationForest::from_config(&config);
        Ok(Detector {
            window,
            normalizer,
            forest,
            health: HealthTracker::new(),
            state: CycleState::Idle,
            cycles_completed: 0,
            last_report: None,
            predictions: VecDeque::with_capacity(PREDICTION_HISTORY),
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// The most recent good verdict set. Failed cycles leave this untouched,
    /// so the presentation side can keep showing it with a stale indicator
    /// instead of blanking the display.
    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// The most recent `n` manual predictions, oldest first.
    pub fn recent_predictions(&self, n: usize) -> Vec<PredictionRecord> {
        self.predictions
            .iter()
            .skip(self.predictions.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    /// Runs one full FETCH -> SCORE -> PUBLISH round. Failures are caught
    /// here, recorded as health events, and folded into the outcome — the
    /// cycle never panics the process and the next call starts clean.
    pub async fn run_cycle(
        &mut self,
        source: &mut dyn TrafficSource,
        sink: &dyn VerdictSink,
    ) -> CycleOutcome {
        match self.execute_cycle(source, sink).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.state = CycleState::Error;
                let (kind, detail) = match &err {
                    CycleError::Transport(e) => (HealthEventKind::TransportFailure, e.to_string()),
                    CycleError::Shape(e) => (HealthEventKind::DataShape, e.to_string()),
                    CycleError::Scoring(e) => (HealthEventKind::ScoringFailure, e.to_string()),
                };
                self.health.record_event(kind, detail);
                self.state = CycleState::Idle;
                CycleOutcome::Failed(err)
            }
        }
    }

    async fn execute_cycle(
        &mut self,
        source: &mut dyn TrafficSource,
        sink: &dyn VerdictSink,
    ) -> Result<CycleOutcome, CycleError> {
        self.state = CycleState::Fetching;
        let fields = self.config.raw_fields();
        let fetch = source.fetch_recent(self.config.fetch_range(), &self.config.measurement, &fields);
        let rows = match tokio::time::timeout(self.config.fetch_timeout(), fetch).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(self.config.fetch_timeout()).into()),
        };

        if rows.is_empty() {
            // Zero rows is a valid fetch, not an error; the window stays as it
            // was and nothing is published this cycle.
            self.health.record_event(HealthEventKind::EmptyBatch, "fetch returned zero rows");
            self.state = CycleState::Idle;
            return Ok(CycleOutcome::EmptyBatch);
        }

        let seed_rate = self.window.last().map(|o| o.request_rate);
        let batch = sanitize_batch(pivot_rows(rows), &self.config.feature_set, seed_rate);
        if batch.is_empty() {
            self.health.record_event(
                HealthEventKind::EmptyBatch,
                "every fetched row was dropped at ingestion",
            );
            self.state = CycleState::Idle;
            return Ok(CycleOutcome::EmptyBatch);
        }

        self.state = CycleState::Scoring;
        self.window.extend(batch);
        // A failed pass is not rolled back: the window keeps the batch, only
        // the published verdicts stay untouched.
        let snapshot = self.window.snapshot();
        let matrix = self.window.as_feature_matrix(&self.config.feature_set)?;
        let normalized = self.normalizer.fit_transform(&matrix);

        let timer = PassTimer::start();
        let scored = self.forest.fit_predict(&normalized);
        let sample = timer.stop();
        let (scores, labels) = scored?;
        let latency_seconds = sample.duration.as_secs_f64();
        self.health.record_latency(sample);

        // Fresh verdicts for the whole window; the previous pass's verdicts
        // are discarded wholesale, never merged.
        let verdicts: Vec<Verdict> = scores
            .iter()
            .zip(labels.iter())
            .map(|(score, label)| Verdict { anomaly_score: *score, is_anomaly: *label })
            .collect();

        self.state = CycleState::Publishing;
        let report = CycleReport {
            cycle: self.cycles_completed,
            observations: snapshot,
            verdicts,
            latency_seconds,
        };
        let window_len = report.observations.len();
        let anomalies = report.anomaly_count();
        sink.publish(report.clone()).await;
        self.last_report = Some(report);
        self.cycles_completed += 1;
        self.state = CycleState::Idle;
        log::info!(
            "cycle {}: scored {} observations, {} anomalous, pass took {:.4}s",
            self.cycles_completed,
            window_len,
            anomalies,
            latency_seconds
        );
        Ok(CycleOutcome::Published { window_len, anomalies })
    }

    /// Manual single-point prediction: scores one ad-hoc
    /// `(inter_arrival_time, dns_rate)` pair against the current window using
    /// the same scorer path as the cycle. The window itself is not mutated;
    /// the outcome lands in the bounded prediction history.
    pub fn predict_single(
        &mut self,
        inter_arrival_time: f64,
        dns_rate: f64,
    ) -> Result<PredictionRecord, CycleError> {
        // The manual interface only carries this pair, so a feature set that
        // needs packet_length cannot score it.
        if self.config.feature_set.iter().any(|f| f == observation::PACKET_LENGTH) {
            return Err(DataShapeError::MissingFeature(observation::PACKET_LENGTH.to_string()).into());
        }

        let raw_rate = 1.0 / inter_arrival_time;
        let request_rate = if raw_rate.is_finite() {
            raw_rate
        } else {
            // Same forward-fill policy as ingestion, seeded from the window tail.
            match self.window.last().map(|o| o.request_rate).filter(|r| r.is_finite()) {
                Some(rate) => rate,
                None => {
                    return Err(
                        DataShapeError::MissingFeature(observation::REQUEST_RATE.to_string()).into()
                    )
                }
            }
        };

        let candidate = Observation::with_request_rate(
            SystemTime::now(),
            f64::NAN,
            inter_arrival_time,
            dns_rate,
            request_rate,
        );
        let mut rows = self.window.snapshot();
        rows.push(candidate);
        if rows.len() < 2 {
            return Err(DataShapeError::InsufficientData(rows.len()).into());
        }

        let matrix = feature_matrix_from(rows.iter(), rows.len(), &self.config.feature_set)?;
        let normalized = self.normalizer.fit_transform(&matrix);
        let (scores, labels) = self.forest.fit_predict(&normalized)?;

        let last = rows.len() - 1;
        let record = PredictionRecord {
            timestamp: rows[last].timestamp,
            inter_arrival_time,
            dns_rate,
            request_rate,
            anomaly_score: scores[last],
            is_anomaly: labels[last],
        };
        if self.predictions.len() >= PREDICTION_HISTORY {
            self.predictions.pop_front();
        }
        self.predictions.push_back(record.clone());
        Ok(record)
    }
}

/// Timer-driven orchestration loop. Holding the detector by `&mut` means
/// cycles can never overlap; flip the shutdown watch to `true` to stop.
/// Cancellation takes effect between cycles, so the window is always left in
/// the state the last completed transition produced.
pub async fn run_detection_loop(
    detector: &mut Detector,
    source: &mut dyn TrafficSource,
    sink: &dyn VerdictSink,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = tokio::time::interval(detector.config().refresh_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if let CycleOutcome::Failed(err) = detector.run_cycle(source, sink).await {
                    log::error!("detection cycle failed: {}", err);
                }
            }
        }
    }
    detector.cycles_completed()
}
