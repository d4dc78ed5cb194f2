//! Performance rollup: periodic fps/cpu/memory summaries per session

use super::MessageHandler;
use crate::pipeline::types::{Incident, IncidentKind, Payload, RawEvent};
use serde_json::{json, Value};
use std::collections::VecDeque;

#[derive(Debug, Clone, Default)]
struct Stat {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl Stat {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    fn to_json(&self) -> Value {
        if self.count == 0 {
            return Value::Null;
        }
        json!({
            "min": self.min,
            "max": self.max,
            "avg": self.sum / self.count as f64,
            "samples": self.count,
        })
    }
}

#[derive(Debug, Clone)]
struct Window {
    start_ts: i64,
    end_ts: i64,
    fps: Stat,
    cpu: Stat,
    memory: Stat,
}

impl Window {
    fn new(start_ts: i64) -> Self {
        Self {
            start_ts,
            end_ts: start_ts,
            fps: Stat::default(),
            cpu: Stat::default(),
            memory: Stat::default(),
        }
    }
}

/// Summarises performance samples over fixed event-time windows
///
/// A window opens on the first sample and is ready once an event arrives
/// `window_ms` or more after its start, or when the session ends. The summary
/// is emitted regardless of values; the next sample opens a new window.
#[derive(Debug)]
pub struct PerformanceAggregator {
    window_ms: i64,
    window: Option<Window>,
    ready: VecDeque<Incident>,
}

impl PerformanceAggregator {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            window: None,
            ready: VecDeque::new(),
        }
    }

    fn roll_over(&mut self) {
        if let Some(window) = self.window.take() {
            self.ready.push_back(Incident::new(
                IncidentKind::PerformanceSummary,
                window.start_ts,
                json!({
                    "start": window.start_ts,
                    "end": window.end_ts,
                    "fps": window.fps.to_json(),
                    "cpu_pct": window.cpu.to_json(),
                    "memory_pct": window.memory.to_json(),
                }),
            ));
        }
    }
}

impl MessageHandler for PerformanceAggregator {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn handle(&mut self, event: &RawEvent) {
        let expired = self
            .window
            .as_ref()
            .map_or(false, |w| event.timestamp.saturating_sub(w.start_ts) >= self.window_ms);
        if expired {
            self.roll_over();
        }

        let fps = match &event.payload {
            Payload::PerformanceTrack { fps, .. } => Some(*fps),
            _ => None,
        };
        let cpu = event.payload.cpu_pct();
        let memory = event.payload.memory_pct();
        if fps.is_none() && cpu.is_none() && memory.is_none() {
            return;
        }

        let window = self.window.get_or_insert_with(|| Window::new(event.timestamp));
        window.end_ts = event.timestamp;
        if let Some(fps) = fps {
            window.fps.add(fps);
        }
        if let Some(cpu) = cpu {
            window.cpu.add(cpu);
        }
        if let Some(memory) = memory {
            window.memory.add(memory);
        }
    }

    fn finish(&mut self, _end_timestamp: i64) {
        self.roll_over();
    }

    fn take_ready(&mut self) -> Option<Incident> {
        self.ready.pop_front()
    }
}
