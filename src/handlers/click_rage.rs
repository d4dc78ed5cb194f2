//! Click rage: repeated clicks on the same target within a short window

use super::MessageHandler;
use crate::pipeline::types::{Incident, IncidentKind, Payload, RawEvent};
use serde_json::json;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct Burst {
    target: String,
    label: Option<String>,
    first_ts: i64,
    last_ts: i64,
    first_index: u64,
    count: usize,
}

impl Burst {
    fn to_incident(&self) -> Incident {
        Incident::new(
            IncidentKind::ClickRage,
            self.first_ts,
            json!({
                "target": self.target,
                "label": self.label,
                "count": self.count,
                "first_index": self.first_index,
                "duration_ms": self.last_ts.saturating_sub(self.first_ts),
            }),
        )
    }
}

/// Counts same-target clicks in a window anchored at the first click of a burst
///
/// A burst that reaches `min_clicks` is ready. It stays one incident however
/// many more clicks land in it. Emission resets the window: later clicks on the
/// same target start a new burst.
#[derive(Debug)]
pub struct ClickRageDetector {
    min_clicks: usize,
    window_ms: i64,
    burst: Option<Burst>,
    completed: VecDeque<Incident>,
}

impl ClickRageDetector {
    pub fn new(min_clicks: usize, window_ms: i64) -> Self {
        Self {
            min_clicks,
            window_ms,
            burst: None,
            completed: VecDeque::new(),
        }
    }

    fn qualifies(&self, burst: &Burst) -> bool {
        burst.count >= self.min_clicks
    }

    /// Close the current burst, keeping its incident if it qualified
    fn close_burst(&mut self) {
        if let Some(burst) = self.burst.take() {
            if self.qualifies(&burst) {
                self.completed.push_back(burst.to_incident());
            }
        }
    }
}

impl MessageHandler for ClickRageDetector {
    fn name(&self) -> &'static str {
        "click_rage"
    }

    fn handle(&mut self, event: &RawEvent) {
        let Payload::Click { target, label } = &event.payload else {
            return;
        };

        let continues = self.burst.as_ref().map_or(false, |b| {
            b.target == *target && event.timestamp.saturating_sub(b.first_ts) <= self.window_ms
        });

        if continues {
            if let Some(burst) = self.burst.as_mut() {
                burst.count += 1;
                burst.last_ts = event.timestamp;
            }
            return;
        }

        self.close_burst();
        self.burst = Some(Burst {
            target: target.clone(),
            label: label.clone(),
            first_ts: event.timestamp,
            last_ts: event.timestamp,
            first_index: event.index,
            count: 1,
        });
    }

    fn finish(&mut self, _end_timestamp: i64) {
        self.close_burst();
    }

    fn take_ready(&mut self) -> Option<Incident> {
        if let Some(incident) = self.completed.pop_front() {
            return Some(incident);
        }

        match self.burst.as_ref() {
            Some(burst) if self.qualifies(burst) => {
                let incident = burst.to_incident();
                self.burst = None;
                Some(incident)
            }
            _ => None,
        }
    }
}
