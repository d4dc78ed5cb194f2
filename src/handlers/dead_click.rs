//! Dead click: a click the page never visibly reacted to

use super::MessageHandler;
use crate::pipeline::types::{Incident, IncidentKind, Payload, RawEvent};
use serde_json::json;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct PendingClick {
    target: String,
    label: Option<String>,
    timestamp: i64,
    index: u64,
}

/// Arms a timer on each click and reports the click if nothing answers it
///
/// A mutation, navigation or network request within `timeout_ms` of the click
/// answers it, as does input on the clicked target. Time is event time: the
/// click turns dead when a later event arrives past the timeout, or when the
/// session ends with the click still pending. A newer click replaces an
/// unanswered one that is still inside its timeout.
#[derive(Debug)]
pub struct DeadClickDetector {
    timeout_ms: i64,
    pending: Option<PendingClick>,
    ready: VecDeque<Incident>,
}

impl DeadClickDetector {
    pub fn new(timeout_ms: i64) -> Self {
        Self {
            timeout_ms,
            pending: None,
            ready: VecDeque::new(),
        }
    }

    fn report(&mut self, click: PendingClick, observed_until: i64) {
        self.ready.push_back(Incident::new(
            IncidentKind::DeadClick,
            click.timestamp,
            json!({
                "target": click.target,
                "label": click.label,
                "index": click.index,
                "waited_ms": observed_until.saturating_sub(click.timestamp),
            }),
        ));
    }

    fn answers(click: &PendingClick, payload: &Payload) -> bool {
        match payload {
            Payload::Mutation { .. } | Payload::Navigation { .. } | Payload::NetworkRequest { .. } => true,
            Payload::Input { target } => *target == click.target,
            _ => false,
        }
    }
}

impl MessageHandler for DeadClickDetector {
    fn name(&self) -> &'static str {
        "dead_click"
    }

    fn handle(&mut self, event: &RawEvent) {
        if let Some(click) = self.pending.take() {
            if event.timestamp.saturating_sub(click.timestamp) > self.timeout_ms {
                self.report(click, event.timestamp);
            } else if !Self::answers(&click, &event.payload) {
                self.pending = Some(click);
            }
        }

        if let Payload::Click { target, label } = &event.payload {
            self.pending = Some(PendingClick {
                target: target.clone(),
                label: label.clone(),
                timestamp: event.timestamp,
                index: event.index,
            });
        }
    }

    fn finish(&mut self, end_timestamp: i64) {
        if let Some(click) = self.pending.take() {
            let observed_until = end_timestamp.max(click.timestamp);
            self.report(click, observed_until);
        }
    }

    fn take_ready(&mut self) -> Option<Incident> {
        self.ready.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(index: u64, ts: i64, payload: Payload) -> RawEvent {
        RawEvent::new(9, index, ts, payload)
    }

    fn click(index: u64, ts: i64, target: &str) -> RawEvent {
        event(index, ts, Payload::Click {
            target: target.to_string(),
            label: None,
        })
    }

    #[test]
    fn test_unanswered_click_after_timeout() {
        let mut detector = DeadClickDetector::new(1_000);
        detector.handle(&click(0, 1_000, "#save"));
        assert!(detector.take_ready().is_none());

        detector.handle(&event(1, 2_500, Payload::CpuSample { cpu_pct: 5.0 }));

        let incident = detector.take_ready().expect("dead click");
        assert_eq!(incident.kind, IncidentKind::DeadClick);
        assert_eq!(incident.timestamp, 1_000);
        assert_eq!(incident.details["target"], "#save");
        assert_eq!(incident.details["waited_ms"], 1_500);
        assert!(detector.take_ready().is_none());
    }

    #[test]
    fn test_mutation_answers_click() {
        let mut detector = DeadClickDetector::new(1_000);
        detector.handle(&click(0, 1_000, "#save"));
        detector.handle(&event(1, 1_300, Payload::Mutation { target: Some("#list".to_string()) }));
        detector.handle(&event(2, 5_000, Payload::CpuSample { cpu_pct: 5.0 }));
        detector.finish(5_000);

        assert!(detector.take_ready().is_none());
    }

    #[test]
    fn test_input_on_other_target_does_not_answer() {
        let mut detector = DeadClickDetector::new(1_000);
        detector.handle(&click(0, 1_000, "#save"));
        detector.handle(&event(1, 1_100, Payload::Input { target: "#name".to_string() }));
        detector.handle(&event(2, 2_100, Payload::Unknown));

        assert!(detector.take_ready().is_some());
    }

    #[test]
    fn test_late_response_does_not_rescue_click() {
        let mut detector = DeadClickDetector::new(1_000);
        detector.handle(&click(0, 1_000, "#save"));
        detector.handle(&event(1, 2_001, Payload::Navigation { url: "/next".to_string() }));

        assert!(detector.take_ready().is_some());
    }

    #[test]
    fn test_session_end_reports_pending_click() {
        let mut detector = DeadClickDetector::new(1_000);
        detector.handle(&click(0, 1_000, "#save"));
        detector.finish(1_200);

        let incident = detector.take_ready().expect("dead click on session end");
        assert_eq!(incident.details["waited_ms"], 200);
    }

    #[test]
    fn test_newer_click_replaces_pending() {
        let mut detector = DeadClickDetector::new(1_000);
        detector.handle(&click(0, 1_000, "#a"));
        detector.handle(&click(1, 1_500, "#b"));
        detector.handle(&event(2, 1_600, Payload::Mutation { target: None }));
        detector.handle(&event(3, 9_000, Payload::Unknown));

        assert!(detector.take_ready().is_none());
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut detector = DeadClickDetector::new(1_000);
        detector.handle(&click(0, i64::MIN, "#save"));
        detector.handle(&event(1, i64::MAX, Payload::Unknown));

        let incident = detector.take_ready().expect("dead click");
        assert_eq!(incident.details["waited_ms"], i64::MAX);
    }
}
