//! Session handlers: detectors and aggregators applied to every session
//!
//! Each handler instance belongs to exactly one session and its fields are
//! that session's accumulator. The registry builds one instance per handler
//! per session from the [`HandlerSet`] injected at startup, so no state is
//! ever shared between handlers or between sessions.
//!
//! ## Contract
//!
//! - `handle` observes one message; kinds a handler does not understand are
//!   ignored
//! - `take_ready` returns the next pending incident and applies the handler's
//!   reset policy; calling it when nothing is ready has no effect
//! - `finish` is called once when the session ends or is evicted, so pending
//!   evaluations can be settled
//! - no method blocks or touches anything outside `self`

pub mod click_rage;
pub mod dead_click;
pub mod performance;
pub mod sustained;

use crate::pipeline::config::DetectorConfig;
use crate::pipeline::types::{Incident, RawEvent};

pub use click_rage::ClickRageDetector;
pub use dead_click::DeadClickDetector;
pub use performance::PerformanceAggregator;
pub use sustained::{Metric, SustainedThresholdDetector};

/// Per-session detector or aggregator
pub trait MessageHandler: Send {
    /// Stable name used in logs
    fn name(&self) -> &'static str;

    /// Observe one message of this handler's session
    fn handle(&mut self, event: &RawEvent);

    /// The session is over; `end_timestamp` is the last known event time
    fn finish(&mut self, end_timestamp: i64);

    /// Pop the next ready incident, applying the post-emission reset policy
    fn take_ready(&mut self) -> Option<Incident>;
}

pub type HandlerFactory = Box<dyn Fn() -> Box<dyn MessageHandler> + Send + Sync>;

/// Ordered collection of handler factories
///
/// Order is the dispatch order within a session.
#[derive(Default)]
pub struct HandlerSet {
    factories: Vec<(&'static str, HandlerFactory)>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn MessageHandler> + Send + Sync + 'static,
    {
        self.factories.push((name, Box::new(factory)));
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(name, _)| *name).collect()
    }

    /// Fresh accumulators for a new session
    pub fn instantiate(&self) -> Vec<Box<dyn MessageHandler>> {
        self.factories.iter().map(|(_, factory)| factory()).collect()
    }
}

/// The reference handler set, in dispatch order
pub fn default_handlers(config: &DetectorConfig) -> HandlerSet {
    let c = config.clone();
    let click_rage = move || -> Box<dyn MessageHandler> {
        Box::new(ClickRageDetector::new(c.click_rage_min_clicks, c.click_rage_window_ms))
    };

    let c = config.clone();
    let cpu_issue = move || -> Box<dyn MessageHandler> {
        Box::new(
            SustainedThresholdDetector::new(Metric::CpuPercent, c.cpu_issue_threshold_pct, c.cpu_issue_min_samples)
                .with_min_duration(c.cpu_issue_min_duration_ms),
        )
    };

    let c = config.clone();
    let dead_click = move || -> Box<dyn MessageHandler> { Box::new(DeadClickDetector::new(c.dead_click_timeout_ms)) };

    let c = config.clone();
    let memory_issue = move || -> Box<dyn MessageHandler> {
        Box::new(SustainedThresholdDetector::new(
            Metric::MemoryPercent,
            c.memory_issue_threshold_pct,
            c.memory_issue_min_samples,
        ))
    };

    let c = config.clone();
    let performance = move || -> Box<dyn MessageHandler> { Box::new(PerformanceAggregator::new(c.performance_window_ms)) };

    let c = config.clone();
    let app_not_responding = move || -> Box<dyn MessageHandler> {
        Box::new(SustainedThresholdDetector::new(
            Metric::MainThreadLagMs,
            c.anr_threshold_ms,
            c.anr_min_samples,
        ))
    };

    HandlerSet::new()
        .with("click_rage", click_rage)
        .with("cpu_issue", cpu_issue)
        .with("dead_click", dead_click)
        .with("memory_issue", memory_issue)
        .with("performance", performance)
        .with("app_not_responding", app_not_responding)
}
