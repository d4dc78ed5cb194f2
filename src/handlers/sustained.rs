//! Sustained threshold detection for resource pressure samples
//!
//! One generic detector covers CPU issues, memory issues and the mobile
//! app-not-responding watchdog; they differ only in the sampled metric and
//! the bound.

use super::MessageHandler;
use crate::pipeline::types::{Incident, IncidentKind, Payload, RawEvent};
use serde_json::json;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    CpuPercent,
    MemoryPercent,
    MainThreadLagMs,
}

impl Metric {
    /// Extract this metric from a payload, if it carries one
    pub fn sample(&self, payload: &Payload) -> Option<f64> {
        match self {
            Metric::CpuPercent => payload.cpu_pct(),
            Metric::MemoryPercent => payload.memory_pct(),
            Metric::MainThreadLagMs => match payload {
                Payload::MainThreadLag { lag_ms } => Some(*lag_ms as f64),
                _ => None,
            },
        }
    }

    pub fn incident_kind(&self) -> IncidentKind {
        match self {
            Metric::CpuPercent => IncidentKind::CpuIssue,
            Metric::MemoryPercent => IncidentKind::MemoryIssue,
            Metric::MainThreadLagMs => IncidentKind::AppNotResponding,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::CpuPercent => "cpu_pct",
            Metric::MemoryPercent => "memory_pct",
            Metric::MainThreadLagMs => "main_thread_lag_ms",
        }
    }
}

#[derive(Debug, Clone)]
struct Run {
    start_ts: i64,
    last_ts: i64,
    samples: usize,
    peak: f64,
    sum: f64,
    reported: bool,
}

/// Reports a run of consecutive samples above `bound`
///
/// The run is ready once it holds `min_samples` breaching samples spanning at
/// least `min_duration_ms`. Each run reports once; a sample at or below the
/// bound ends the run and re-arms the detector.
#[derive(Debug)]
pub struct SustainedThresholdDetector {
    metric: Metric,
    bound: f64,
    min_samples: usize,
    min_duration_ms: i64,
    run: Option<Run>,
    ready: VecDeque<Incident>,
}

impl SustainedThresholdDetector {
    pub fn new(metric: Metric, bound: f64, min_samples: usize) -> Self {
        Self {
            metric,
            bound,
            min_samples: min_samples.max(1),
            min_duration_ms: 0,
            run: None,
            ready: VecDeque::new(),
        }
    }

    pub fn with_min_duration(mut self, min_duration_ms: i64) -> Self {
        self.min_duration_ms = min_duration_ms;
        self
    }

    fn incident(&self, run: &Run) -> Incident {
        Incident::new(
            self.metric.incident_kind(),
            run.start_ts,
            json!({
                "metric": self.metric.as_str(),
                "bound": self.bound,
                "samples": run.samples,
                "peak": run.peak,
                "avg": run.sum / run.samples as f64,
                "duration_ms": run.last_ts.saturating_sub(run.start_ts),
            }),
        )
    }
}

impl MessageHandler for SustainedThresholdDetector {
    fn name(&self) -> &'static str {
        match self.metric {
            Metric::CpuPercent => "cpu_issue",
            Metric::MemoryPercent => "memory_issue",
            Metric::MainThreadLagMs => "app_not_responding",
        }
    }

    fn handle(&mut self, event: &RawEvent) {
        let Some(value) = self.metric.sample(&event.payload) else {
            return;
        };

        if value <= self.bound {
            self.run = None;
            return;
        }

        let run = self.run.get_or_insert(Run {
            start_ts: event.timestamp,
            last_ts: event.timestamp,
            samples: 0,
            peak: value,
            sum: 0.0,
            reported: false,
        });
        run.samples += 1;
        run.sum += value;
        run.peak = run.peak.max(value);
        run.last_ts = event.timestamp;

        let due = !run.reported
            && run.samples >= self.min_samples
            && run.last_ts.saturating_sub(run.start_ts) >= self.min_duration_ms;
        if due {
            run.reported = true;
            let snapshot = run.clone();
            let incident = self.incident(&snapshot);
            self.ready.push_back(incident);
        }
    }

    fn finish(&mut self, _end_timestamp: i64) {
        self.run = None;
    }

    fn take_ready(&mut self) -> Option<Incident> {
        self.ready.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(index: u64, ts: i64, cpu_pct: f64) -> RawEvent {
        RawEvent::new(3, index, ts, Payload::CpuSample { cpu_pct })
    }

    #[test]
    fn test_n_minus_one_breaches_then_normal() {
        let mut detector = SustainedThresholdDetector::new(Metric::CpuPercent, 70.0, 3);
        detector.handle(&cpu(0, 1_000, 95.0));
        detector.handle(&cpu(1, 2_000, 90.0));
        detector.handle(&cpu(2, 3_000, 20.0));
        detector.handle(&cpu(3, 4_000, 99.0));

        assert!(detector.take_ready().is_none());
    }

    #[test]
    fn test_n_breaches_report_once() {
        let mut detector = SustainedThresholdDetector::new(Metric::CpuPercent, 70.0, 3);
        for i in 0..5 {
            detector.handle(&cpu(i, 1_000 + i as i64 * 1_000, 80.0 + i as f64));
        }

        let incident = detector.take_ready().expect("cpu issue");
        assert_eq!(incident.kind, IncidentKind::CpuIssue);
        assert_eq!(incident.timestamp, 1_000);
        assert_eq!(incident.details["samples"], 3);
        assert_eq!(incident.details["peak"], 82.0);
        assert!(detector.take_ready().is_none());
    }

    #[test]
    fn test_new_run_reports_again() {
        let mut detector = SustainedThresholdDetector::new(Metric::CpuPercent, 70.0, 2);
        detector.handle(&cpu(0, 0, 90.0));
        detector.handle(&cpu(1, 1, 90.0));
        detector.handle(&cpu(2, 2, 10.0));
        detector.handle(&cpu(3, 3, 90.0));
        detector.handle(&cpu(4, 4, 90.0));

        assert_eq!(std::iter::from_fn(|| detector.take_ready()).count(), 2);
    }

    #[test]
    fn test_min_duration_delays_report() {
        let mut detector = SustainedThresholdDetector::new(Metric::CpuPercent, 70.0, 2).with_min_duration(5_000);
        detector.handle(&cpu(0, 0, 90.0));
        detector.handle(&cpu(1, 1_000, 90.0));
        assert!(detector.take_ready().is_none());

        detector.handle(&cpu(2, 5_000, 90.0));
        let incident = detector.take_ready().expect("sustained for 5s");
        assert_eq!(incident.details["duration_ms"], 5_000);
    }

    #[test]
    fn test_memory_from_performance_track() {
        let mut detector = SustainedThresholdDetector::new(Metric::MemoryPercent, 80.0, 1);
        detector.handle(&RawEvent::new(3, 0, 10, Payload::PerformanceTrack {
            fps: 30.0,
            cpu_pct: 10.0,
            used_heap: 95,
            total_heap: 100,
        }));

        let incident = detector.take_ready().expect("memory issue");
        assert_eq!(incident.kind, IncidentKind::MemoryIssue);
    }

    #[test]
    fn test_app_not_responding() {
        let mut detector = SustainedThresholdDetector::new(Metric::MainThreadLagMs, 5_000.0, 1);
        detector.handle(&RawEvent::new(3, 0, 10, Payload::MainThreadLag { lag_ms: 1_200 }));
        assert!(detector.take_ready().is_none());

        detector.handle(&RawEvent::new(3, 1, 20, Payload::MainThreadLag { lag_ms: 6_500 }));
        let incident = detector.take_ready().expect("anr");
        assert_eq!(incident.kind, IncidentKind::AppNotResponding);
        assert_eq!(detector.name(), "app_not_responding");
    }

    #[test]
    fn test_unrelated_events_do_not_break_run() {
        let mut detector = SustainedThresholdDetector::new(Metric::CpuPercent, 70.0, 2);
        detector.handle(&cpu(0, 0, 90.0));
        detector.handle(&RawEvent::new(3, 1, 1, Payload::Click { target: "#x".to_string(), label: None }));
        detector.handle(&cpu(2, 2, 90.0));

        assert!(detector.take_ready().is_some());
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut detector = SustainedThresholdDetector::new(Metric::CpuPercent, 70.0, 2).with_min_duration(5_000);
        detector.handle(&cpu(0, i64::MIN, 90.0));
        detector.handle(&cpu(1, i64::MAX, 90.0));

        let incident = detector.take_ready().expect("sustained run");
        assert_eq!(incident.details["duration_ms"], i64::MAX);
    }
}
