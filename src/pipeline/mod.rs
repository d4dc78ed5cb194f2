//! # Session heuristics pipeline
//!
//! Raw telemetry flows from the bus into a per-session registry of
//! detectors; on every tick the registry yields the derived events that
//! became ready, which are produced back to the bus before offsets are
//! committed.
//!
//! ```text
//! consumer ──► HeuristicsEngine::poll_once ──► SessionRegistry ──► handlers
//!                      │                                              │
//!                 (on tick)  ◄──────── iterate_ready_messages ◄───────┘
//!                      │
//!                      ▼
//!              produce ──► flush ──► commit
//! ```
//!
//! ## Module Organization
//!
//! - `types` - Event envelope, payload kinds, incidents
//! - `config` - Engine and detector configuration from the environment
//! - `state` - Per-session handler instances and ordering bookkeeping
//! - `engine` - Session registry: routing, readiness, eviction
//! - `ingestion` - The engine loop and its tick/drain sequencing
//! - `stats` - Consumption statistics

pub mod config;
pub mod engine;
pub mod ingestion;
pub mod state;
pub mod stats;
pub mod types;

pub use config::{ConfigError, DetectorConfig, EngineConfig};
pub use engine::{Dispatch, SessionRegistry};
pub use ingestion::{EngineCounters, EngineError, EngineState, HeuristicsEngine};
pub use stats::{QueueStats, StatsCollector};
pub use types::{DerivedEvent, Incident, IncidentKind, Payload, RawEvent, SessionId};
