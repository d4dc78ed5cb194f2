//! Core event types for the session heuristics pipeline
//!
//! Raw telemetry and derived incidents share one JSON envelope so that the
//! trigger topic can carry both session-end signals coming from upstream and
//! the incidents this engine produces.
//!
//! ```json
//! {"session_id":42,"index":7,"timestamp":1700000000123,"payload":{"kind":"click","target":"#buy"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of one client session
pub type SessionId = u64;

/// One telemetry message as received from the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub session_id: SessionId,

    /// Per-session monotonically increasing sequence index
    pub index: u64,

    /// Client-side event time in milliseconds since the Unix epoch
    pub timestamp: i64,

    pub payload: Payload,
}

/// Typed payload, tagged by `kind`
///
/// Kinds this build does not know decode as [`Payload::Unknown`] so upstream
/// producers can roll out new event types without breaking the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Click {
        target: String,
        #[serde(default)]
        label: Option<String>,
    },
    Input {
        target: String,
    },
    Mutation {
        #[serde(default)]
        target: Option<String>,
    },
    Navigation {
        url: String,
    },
    NetworkRequest {
        url: String,
        #[serde(default)]
        status: u16,
        #[serde(default)]
        duration_ms: u64,
    },
    ResourceTiming {
        url: String,
        duration_ms: u64,
    },
    CpuSample {
        cpu_pct: f64,
    },
    MemorySample {
        used_bytes: u64,
        total_bytes: u64,
    },
    PerformanceTrack {
        fps: f64,
        cpu_pct: f64,
        used_heap: u64,
        total_heap: u64,
    },
    /// Mobile watchdog sample: how long the main thread was blocked
    MainThreadLag {
        lag_ms: u64,
    },
    SessionEnd,
    /// A derived event echoed back from the trigger topic
    Incident {
        incident: IncidentKind,
        details: Value,
    },
    #[serde(other)]
    Unknown,
}

impl Payload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Click { .. } => "click",
            Payload::Input { .. } => "input",
            Payload::Mutation { .. } => "mutation",
            Payload::Navigation { .. } => "navigation",
            Payload::NetworkRequest { .. } => "network_request",
            Payload::ResourceTiming { .. } => "resource_timing",
            Payload::CpuSample { .. } => "cpu_sample",
            Payload::MemorySample { .. } => "memory_sample",
            Payload::PerformanceTrack { .. } => "performance_track",
            Payload::MainThreadLag { .. } => "main_thread_lag",
            Payload::SessionEnd => "session_end",
            Payload::Incident { .. } => "incident",
            Payload::Unknown => "unknown",
        }
    }

    /// Memory usage in percent, when the payload carries a usable sample
    pub fn memory_pct(&self) -> Option<f64> {
        let (used, total) = match self {
            Payload::MemorySample { used_bytes, total_bytes } => (*used_bytes, *total_bytes),
            Payload::PerformanceTrack { used_heap, total_heap, .. } => (*used_heap, *total_heap),
            _ => return None,
        };
        if total == 0 {
            return None;
        }
        Some(used as f64 * 100.0 / total as f64)
    }

    pub fn cpu_pct(&self) -> Option<f64> {
        match self {
            Payload::CpuSample { cpu_pct } | Payload::PerformanceTrack { cpu_pct, .. } => Some(*cpu_pct),
            _ => None,
        }
    }
}

impl RawEvent {
    pub fn new(session_id: SessionId, index: u64, timestamp: i64, payload: Payload) -> Self {
        Self {
            session_id,
            index,
            timestamp,
            payload,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Incident families produced by the reference handler set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    ClickRage,
    DeadClick,
    CpuIssue,
    MemoryIssue,
    AppNotResponding,
    PerformanceSummary,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::ClickRage => "click_rage",
            IncidentKind::DeadClick => "dead_click",
            IncidentKind::CpuIssue => "cpu_issue",
            IncidentKind::MemoryIssue => "memory_issue",
            IncidentKind::AppNotResponding => "app_not_responding",
            IncidentKind::PerformanceSummary => "performance_summary",
        }
    }
}

/// What a handler hands over when it becomes ready
///
/// The registry attaches the session id when turning it into a [`DerivedEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub kind: IncidentKind,
    /// Event time the incident refers to (start of the burst, run, or window)
    pub timestamp: i64,
    pub details: Value,
}

impl Incident {
    pub fn new(kind: IncidentKind, timestamp: i64, details: Value) -> Self {
        Self {
            kind,
            timestamp,
            details,
        }
    }
}

/// Output of a handler transitioning to ready, keyed by session
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedEvent {
    pub session_id: SessionId,
    pub kind: IncidentKind,
    pub timestamp: i64,
    pub payload: Value,
}

impl DerivedEvent {
    pub fn from_incident(session_id: SessionId, incident: Incident) -> Self {
        Self {
            session_id,
            kind: incident.kind,
            timestamp: incident.timestamp,
            payload: incident.details,
        }
    }

    /// Encode using the shared envelope (`kind: incident`)
    ///
    /// Derived events carry index 0; the registry never orders or routes them.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        RawEvent::new(
            self.session_id,
            0,
            self.timestamp,
            Payload::Incident {
                incident: self.kind,
                details: self.payload.clone(),
            },
        )
        .encode()
    }
}
