// Latency and health bookkeeping for scoring passes

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

/// Bound on both the latency ring and the health-event log.
pub const HISTORY_CAPACITY: usize = 100;

/// Wall-clock cost of one scoring pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySample {
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub duration: Duration,
}

/// Times a single scoring pass. Monotonic time drives the duration; the wall
/// clock is only recorded for display.
#[derive(Debug)]
pub struct PassTimer {
    started_wall: SystemTime,
    started: Instant,
}

impl PassTimer {
    pub fn start() -> Self {
        PassTimer { started_wall: SystemTime::now(), started: Instant::now() }
    }

    pub fn stop(self) -> LatencySample {
        let duration = self.started.elapsed();
        LatencySample {
            started_at: self.started_wall,
            ended_at: self.started_wall + duration,
            duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthEventKind {
    /// Fetch returned zero rows; the cycle completed without scoring.
    EmptyBatch,
    /// Ingestion fetch failed (network/auth/timeout).
    TransportFailure,
    /// Window projection failed (missing feature, empty window, too few rows).
    DataShape,
    /// Numeric failure inside the ensemble.
    ScoringFailure,
}

/// One recorded health incident. Failed cycles are skipped, never retried;
/// the event log is how they surface to the operator view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub timestamp: SystemTime,
    pub kind: HealthEventKind,
    pub detail: String,
}

impl fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?}: {}",
            humantime::format_rfc3339_seconds(self.timestamp),
            self.kind,
            self.detail
        )
    }
}

/// Records the wall-clock cost of each scoring pass and every health incident,
/// keeping the most recent `HISTORY_CAPACITY` of each for trend display.
#[derive(Debug, Default)]
pub struct HealthTracker {
    latencies: VecDeque<LatencySample>,
    events: VecDeque<HealthEvent>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_latency(&mut self, sample: LatencySample) {
        if self.latencies.len() >= HISTORY_CAPACITY {
            self.latencies.pop_front();
        }
        self.latencies.push_back(sample);
    }

    pub fn record_event(&mut self, kind: HealthEventKind, detail: impl Into<String>) {
        let event = HealthEvent { timestamp: SystemTime::now(), kind, detail: detail.into() };
        // Empty batches are routine; everything else is a failure.
        if event.kind == HealthEventKind::EmptyBatch {
            log::info!("health event {}", event);
        } else {
            log::warn!("health event {}", event);
        }
        if self.events.len() >= HISTORY_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn pass_count(&self) -> usize {
        self.latencies.len()
    }

    pub fn latest_latency(&self) -> Option<Duration> {
        self.latencies.back().map(|s| s.duration)
    }

    /// The most recent `n` latencies, oldest first.
    pub fn last_latencies(&self, n: usize) -> Vec<Duration> {
        self.latencies
            .iter()
            .skip(self.latencies.len().saturating_sub(n))
            .map(|s| s.duration)
            .collect()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().map(|s| s.duration).sum();
        Some(total / self.latencies.len() as u32)
    }

    /// The most recent `n` health events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<HealthEvent> {
        self.events
            .iter()
            .skip(self.events.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(millis: u64) -> LatencySample {
        let started = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        LatencySample {
            started_at: started,
            ended_at: started + Duration::from_millis(millis),
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_latency_ring_is_bounded() {
        let mut tracker = HealthTracker::new();
        for i in 0..(HISTORY_CAPACITY + 20) {
            tracker.record_latency(sample(i as u64));
        }
        assert_eq!(tracker.pass_count(), HISTORY_CAPACITY);
        // Oldest entries were evicted first.
        let last = tracker.last_latencies(HISTORY_CAPACITY);
        assert_eq!(last[0], Duration::from_millis(20));
        assert_eq!(tracker.latest_latency(), Some(Duration::from_millis(119)));
    }

    #[test]
    fn test_last_latencies_returns_most_recent() {
        let mut tracker = HealthTracker::new();
        for millis in [10, 20, 30, 40] {
            tracker.record_latency(sample(millis));
        }
        assert_eq!(
            tracker.last_latencies(2),
            vec![Duration::from_millis(30), Duration::from_millis(40)]
        );
        // Asking for more than recorded returns everything.
        assert_eq!(tracker.last_latencies(100).len(), 4);
    }

    #[test]
    fn test_average_latency() {
        let mut tracker = HealthTracker::new();
        assert!(tracker.average_latency().is_none());
        tracker.record_latency(sample(10));
        tracker.record_latency(sample(30));
        assert_eq!(tracker.average_latency(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_event_log_is_bounded() {
        let mut tracker = HealthTracker::new();
        for i in 0..(HISTORY_CAPACITY + 5) {
            tracker.record_event(HealthEventKind::EmptyBatch, format!("batch {}", i));
        }
        assert_eq!(tracker.event_count(), HISTORY_CAPACITY);
        let recent = tracker.recent_events(1);
        assert_eq!(recent[0].detail, format!("batch {}", HISTORY_CAPACITY + 4));
    }

    #[test]
    fn test_pass_timer_measures_elapsed() {
        let timer = PassTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        let sample = timer.stop();
        assert!(sample.duration >= Duration::from_millis(5));
        assert!(sample.ended_at > sample.started_at);
    }
}
