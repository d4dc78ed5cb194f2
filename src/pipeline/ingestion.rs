//! Engine loop: consume, dispatch, and the tick that emits, flushes, commits
//!
//! One task drives everything. Each iteration of [`HeuristicsEngine::run`]
//! checks, in priority order:
//!
//! 1. shutdown requested: drain and stop
//! 2. tick interval elapsed: evict idle sessions, produce ready derived
//!    events, flush, then commit
//! 3. otherwise: consume at most one message and route it to its session
//!
//! Commit only ever follows a successful flush. If flushing still fails after
//! the configured retries the engine returns an error without committing, and
//! a restart re-consumes everything since the last commit.

use super::config::EngineConfig;
use super::engine::{Dispatch, SessionRegistry};
use super::stats::StatsCollector;
use super::types::{DerivedEvent, RawEvent};
use crate::bus_core::{BusError, Consumer, ExponentialBackoff, Producer};
use std::future::Future;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};

/// Consecutive messages handled before the loop yields to the runtime so the
/// timer and signal drivers get to run under sustained traffic
const YIELD_EVERY: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    IdlePoll,
    TickFlush,
    Draining,
    Stopped,
}

#[derive(Debug)]
pub enum EngineError {
    Consume(BusError),
    Produce(BusError),
    Flush(BusError),
    Commit(BusError),
    Close(BusError),
    Encode(serde_json::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Consume(e) => write!(f, "Consume failed: {}", e),
            EngineError::Produce(e) => write!(f, "Produce failed: {}", e),
            EngineError::Flush(e) => write!(f, "Flush failed: {}", e),
            EngineError::Commit(e) => write!(f, "Commit failed: {}", e),
            EngineError::Close(e) => write!(f, "Close failed: {}", e),
            EngineError::Encode(e) => write!(f, "Encoding derived event failed: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

/// Running totals since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub consumed: u64,
    pub dispatched: u64,
    pub out_of_order: u64,
    pub ignored: u64,
    pub undecodable: u64,
    pub produced: u64,
    pub ticks: u64,
    pub flush_failures: u64,
}

pub struct HeuristicsEngine<C, P, S> {
    config: EngineConfig,
    consumer: C,
    producer: P,
    stats: S,
    registry: SessionRegistry,
    state: EngineState,
    counters: EngineCounters,
}

impl<C, P, S> HeuristicsEngine<C, P, S>
where
    C: Consumer,
    P: Producer,
    S: StatsCollector,
{
    pub fn new(config: EngineConfig, consumer: C, producer: P, stats: S, registry: SessionRegistry) -> Self {
        Self {
            config,
            consumer,
            producer,
            stats,
            registry,
            state: EngineState::IdlePoll,
            counters: EngineCounters::default(),
        }
    }

    /// Run until `shutdown` resolves, then drain
    ///
    /// Returns an error on any fatal condition; nothing is drained or
    /// committed in that case.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        log::info!("🚀 Heuristics engine started");
        log::info!("   ├─ Group: {}", self.config.group_events);
        log::info!("   ├─ Topics: {}", self.config.input_topics().join(", "));
        log::info!(
            "   ├─ Handlers ({}): {}",
            self.registry.handler_count(),
            self.registry.handler_names().join(", ")
        );
        log::info!("   └─ Tick interval: {}ms", self.config.tick_interval_ms);

        let mut streak = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    log::info!("🛑 Shutdown requested");
                    return self.drain().await;
                }

                _ = ticker.tick() => {
                    self.tick().await?;
                }

                _ = std::future::ready(()) => {
                    if self.poll_once()? {
                        streak += 1;
                        if streak % YIELD_EVERY == 0 {
                            tokio::task::yield_now().await;
                        }
                    } else {
                        streak = 0;
                        tokio::time::sleep(self.config.idle_pause()).await;
                    }
                }
            }
        }
    }

    /// Consume and route at most one message; `false` when nothing was available
    ///
    /// An empty poll means every topic is drained, so sessions holding a
    /// `session_end` have seen all of their telemetry and are finished.
    pub fn poll_once(&mut self) -> Result<bool, EngineError> {
        self.state = EngineState::IdlePoll;

        let Some(message) = self.consumer.consume_next().map_err(EngineError::Consume)? else {
            if self.registry.pending_ends() > 0 {
                self.registry.settle_pending_ends();
            }
            return Ok(false);
        };
        self.counters.consumed += 1;

        let event = match RawEvent::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("⚠️  Skipping undecodable message {}: {}", message.meta, e);
                self.counters.undecodable += 1;
                self.stats.collect_undecodable(&message.meta);
                return Ok(true);
            }
        };

        self.stats.collect(event.session_id, &message.meta);

        match self.registry.handle_message(event.session_id, &event, event.index) {
            Dispatch::Accepted => self.counters.dispatched += 1,
            Dispatch::OutOfOrder { last_index } => {
                log::debug!(
                    "Rejected {} index {} for session {} (last accepted {})",
                    message.meta,
                    event.index,
                    event.session_id,
                    last_index
                );
                self.counters.out_of_order += 1;
            }
            Dispatch::Ignored => self.counters.ignored += 1,
        }

        Ok(true)
    }

    /// Evict idle sessions, produce everything ready, flush, commit
    pub async fn tick(&mut self) -> Result<usize, EngineError> {
        self.state = EngineState::TickFlush;
        let started = Instant::now();

        let evicted = self.registry.evict_idle();
        let produced = self.produce_ready()?;
        self.flush_with_retry().await?;
        self.consumer.commit().map_err(EngineError::Commit)?;

        self.counters.ticks += 1;
        self.state = EngineState::IdlePoll;

        if produced > 0 || evicted > 0 {
            log::info!(
                "📤 Tick: {} derived events, {} evicted, {} live sessions | {}ms",
                produced,
                evicted,
                self.registry.live_sessions(),
                started.elapsed().as_millis()
            );
        } else {
            log::debug!("Tick: nothing ready, {} live sessions", self.registry.live_sessions());
        }

        Ok(produced)
    }

    /// Emit what is ready, close the producer, commit, close the consumer
    ///
    /// Accumulators that are not ready yet are dropped with the process.
    pub async fn drain(&mut self) -> Result<(), EngineError> {
        self.state = EngineState::Draining;
        log::info!("🔄 Draining...");

        let produced = self.produce_ready()?;
        self.producer
            .close(self.config.producer_timeout())
            .await
            .map_err(EngineError::Close)?;
        self.consumer.commit().map_err(EngineError::Commit)?;
        self.consumer.close().map_err(EngineError::Close)?;

        self.state = EngineState::Stopped;
        log::info!(
            "✅ Drain complete: {} derived events, {} messages consumed in total",
            produced,
            self.counters.consumed
        );
        Ok(())
    }

    fn produce_ready(&mut self) -> Result<usize, EngineError> {
        let mut ready: Vec<DerivedEvent> = Vec::new();
        self.registry.iterate_ready_messages(|_, event| ready.push(event));

        for event in &ready {
            let payload = event.encode().map_err(EngineError::Encode)?;
            self.producer
                .produce(&self.config.topic_trigger, &event.session_id.to_string(), payload)
                .map_err(EngineError::Produce)?;
            log::debug!("Session {} ready: {}", event.session_id, event.kind.as_str());
        }

        self.counters.produced += ready.len() as u64;
        Ok(ready.len())
    }

    async fn flush_with_retry(&mut self) -> Result<(), EngineError> {
        let mut backoff = ExponentialBackoff::new(
            self.config.flush_retry_initial_ms,
            self.config.flush_retry_max_ms,
            self.config.flush_retries,
        );

        loop {
            match self.producer.flush(self.config.producer_timeout()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.counters.flush_failures += 1;
                    log::warn!("⚠️  Flush failed with {} pending: {}", self.producer.pending(), e);
                    if backoff.sleep().await.is_err() {
                        log::error!("❌ Flush still failing after {} retries, not committing", backoff.attempts());
                        return Err(EngineError::Flush(e));
                    }
                }
            }
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &S {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_core::{BusOp, MemoryBus, MemoryConsumer, MemoryProducer};
    use crate::handlers::default_handlers;
    use crate::pipeline::config::DetectorConfig;
    use crate::pipeline::stats::QueueStats;
    use crate::pipeline::types::Payload;
    use std::time::Duration;

    type TestEngine = HeuristicsEngine<MemoryConsumer, MemoryProducer, QueueStats>;

    fn engine(bus: &MemoryBus) -> TestEngine {
        let config = EngineConfig {
            flush_retry_initial_ms: 1,
            flush_retry_max_ms: 2,
            ..EngineConfig::default()
        };
        let registry = SessionRegistry::new(default_handlers(&DetectorConfig::default()), 60_000, 1_000);
        HeuristicsEngine::new(
            config.clone(),
            bus.consumer(&config.input_topics()),
            bus.producer(),
            QueueStats::new(Duration::from_secs(3600)),
            registry,
        )
    }

    #[test]
    fn test_poll_once_counts_outcomes() {
        let bus = MemoryBus::new();
        let click = |index| {
            RawEvent::new(1, index, 1_000, Payload::Click {
                target: "#a".to_string(),
                label: None,
            })
        };
        bus.push_event("raw", &click(2)).unwrap();
        bus.push_event("raw", &click(1)).unwrap();
        bus.push("raw", "1", b"not json".to_vec());

        let mut engine = engine(&bus);
        while engine.poll_once().unwrap() {}

        let counters = engine.counters();
        assert_eq!(counters.consumed, 3);
        assert_eq!(counters.dispatched, 1);
        assert_eq!(counters.out_of_order, 1);
        assert_eq!(counters.undecodable, 1);
        assert_eq!(engine.stats().snapshot().undecodable, 1);
    }

    #[test]
    fn test_empty_poll_settles_pending_ends() {
        let bus = MemoryBus::new();
        bus.push_event("raw", &RawEvent::new(3, 0, 1_000, Payload::Unknown)).unwrap();
        bus.push_event("trigger", &RawEvent::new(3, 0, 9_000, Payload::SessionEnd))
            .unwrap();

        let mut engine = engine(&bus);
        assert!(engine.poll_once().unwrap());
        assert!(engine.poll_once().unwrap());
        assert_eq!(engine.registry().pending_ends(), 1);
        assert_eq!(engine.registry().live_sessions(), 1);

        assert!(!engine.poll_once().unwrap());
        assert_eq!(engine.registry().pending_ends(), 0);
        assert_eq!(engine.registry().live_sessions(), 0);
    }

    #[test]
    fn test_consume_failure_is_fatal() {
        let bus = MemoryBus::new();
        let mut engine = engine(&bus);
        bus.fail_consume(true);

        assert!(matches!(engine.poll_once(), Err(EngineError::Consume(_))));
    }

    #[tokio::test]
    async fn test_flush_retried_before_commit() {
        let bus = MemoryBus::new();
        let mut engine = engine(&bus);
        bus.fail_next_flushes(2);

        engine.tick().await.unwrap();

        let ops = bus.ops();
        assert_eq!(
            ops.iter().filter(|op| matches!(op, BusOp::Flush { ok: false, .. })).count(),
            2
        );
        assert!(matches!(ops.last(), Some(BusOp::Commit { .. })));
        assert_eq!(engine.counters().flush_failures, 2);
        assert_eq!(engine.state(), EngineState::IdlePoll);
    }

    #[tokio::test]
    async fn test_drain_stops_engine() {
        let bus = MemoryBus::new();
        let mut engine = engine(&bus);

        engine.drain().await.unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(
            bus.ops(),
            vec![
                BusOp::Flush { ok: true, delivered: 0 },
                BusOp::ProducerClose,
                BusOp::Commit {
                    offsets: vec![
                        ("raw".to_string(), 0),
                        ("raw-mobile".to_string(), 0),
                        ("trigger".to_string(), 0)
                    ]
                },
                BusOp::ConsumerClose,
            ]
        );
    }
}
