//! Engine and detector configuration from environment variables
//!
//! Loaded once at startup (after `dotenv`), read-only afterwards.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Read `name` and parse it, falling back to `default` when unset
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={:?} cannot be parsed", name, raw))),
        Err(_) => Ok(default),
    }
}

/// Configuration for the heuristics engine loop and its bus
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consumer group identifying this engine
    pub group_events: String,

    pub topic_raw_web: String,
    pub topic_raw_mobile: String,

    /// Consumed for session-end signals, produced to with derived events
    pub topic_trigger: String,

    /// Tick interval: emit, flush, commit
    pub tick_interval_ms: u64,

    /// Bound for a single producer flush (and for the flush done by close)
    pub producer_timeout_ms: u64,

    /// Extra flush attempts before a tick is declared fatal
    pub flush_retries: u32,
    pub flush_retry_initial_ms: u64,
    pub flush_retry_max_ms: u64,

    /// Pause after an idle poll so the loop does not spin a core
    pub idle_pause_ms: u64,

    /// Sessions without traffic for this long are finished and dropped
    pub session_idle_timeout_ms: u64,

    /// Upper bound on live sessions, oldest activity evicted first
    pub max_sessions: usize,

    /// Queue stats log cadence
    pub stats_interval_ms: u64,

    /// Directory holding one JSONL log per topic
    pub bus_dir: PathBuf,

    /// SQLite database for committed consumer offsets
    pub offsets_db_path: PathBuf,
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `GROUP_HEURISTICS` (default: heuristics)
    /// - `TOPIC_RAW_WEB` (default: raw)
    /// - `TOPIC_RAW_MOBILE` (default: raw-mobile)
    /// - `TOPIC_TRIGGER` (default: trigger)
    /// - `EVENTS_COMMIT_INTERVAL_MS` (default: 30000)
    /// - `PRODUCER_TIMEOUT_MS` (default: 2000)
    /// - `FLUSH_RETRIES` (default: 2)
    /// - `FLUSH_RETRY_INITIAL_MS` (default: 100)
    /// - `FLUSH_RETRY_MAX_MS` (default: 1000)
    /// - `IDLE_PAUSE_MS` (default: 1)
    /// - `SESSION_IDLE_TIMEOUT_MS` (default: 300000)
    /// - `MAX_SESSIONS` (default: 100000)
    /// - `QUEUE_STATS_INTERVAL_MS` (default: 60000)
    /// - `BUS_DIR` (default: /var/lib/sessionflow/bus)
    /// - `OFFSETS_DB_PATH` (default: $BUS_DIR/offsets.db)
    pub fn from_env() -> Result<Self, ConfigError> {
        let bus_dir: PathBuf = env::var("BUS_DIR")
            .unwrap_or_else(|_| "/var/lib/sessionflow/bus".to_string())
            .into();
        let offsets_db_path = env::var("OFFSETS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| bus_dir.join("offsets.db"));

        let config = Self {
            group_events: env::var("GROUP_HEURISTICS").unwrap_or_else(|_| "heuristics".to_string()),
            topic_raw_web: env::var("TOPIC_RAW_WEB").unwrap_or_else(|_| "raw".to_string()),
            topic_raw_mobile: env::var("TOPIC_RAW_MOBILE").unwrap_or_else(|_| "raw-mobile".to_string()),
            topic_trigger: env::var("TOPIC_TRIGGER").unwrap_or_else(|_| "trigger".to_string()),
            tick_interval_ms: env_or("EVENTS_COMMIT_INTERVAL_MS", 30_000)?,
            producer_timeout_ms: env_or("PRODUCER_TIMEOUT_MS", 2_000)?,
            flush_retries: env_or("FLUSH_RETRIES", 2)?,
            flush_retry_initial_ms: env_or("FLUSH_RETRY_INITIAL_MS", 100)?,
            flush_retry_max_ms: env_or("FLUSH_RETRY_MAX_MS", 1_000)?,
            idle_pause_ms: env_or("IDLE_PAUSE_MS", 1)?,
            session_idle_timeout_ms: env_or("SESSION_IDLE_TIMEOUT_MS", 300_000)?,
            max_sessions: env_or("MAX_SESSIONS", 100_000)?,
            stats_interval_ms: env_or("QUEUE_STATS_INTERVAL_MS", 60_000)?,
            bus_dir,
            offsets_db_path,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "EVENTS_COMMIT_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        if self.producer_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "PRODUCER_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidValue("MAX_SESSIONS must be greater than zero".to_string()));
        }

        let topics = self.input_topics();
        for (i, topic) in topics.iter().enumerate() {
            if topic.is_empty() {
                return Err(ConfigError::InvalidValue("topic names cannot be empty".to_string()));
            }
            if topics[i + 1..].contains(topic) {
                return Err(ConfigError::InvalidValue(format!("topic {} configured twice", topic)));
            }
        }

        Ok(())
    }

    /// Topics the engine subscribes to, in subscription order
    pub fn input_topics(&self) -> Vec<String> {
        vec![
            self.topic_raw_web.clone(),
            self.topic_raw_mobile.clone(),
            self.topic_trigger.clone(),
        ]
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_timeout_ms)
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_millis(self.idle_pause_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let bus_dir = PathBuf::from("/var/lib/sessionflow/bus");
        Self {
            group_events: "heuristics".to_string(),
            topic_raw_web: "raw".to_string(),
            topic_raw_mobile: "raw-mobile".to_string(),
            topic_trigger: "trigger".to_string(),
            tick_interval_ms: 30_000,
            producer_timeout_ms: 2_000,
            flush_retries: 2,
            flush_retry_initial_ms: 100,
            flush_retry_max_ms: 1_000,
            idle_pause_ms: 1,
            session_idle_timeout_ms: 300_000,
            max_sessions: 100_000,
            stats_interval_ms: 60_000,
            offsets_db_path: bus_dir.join("offsets.db"),
            bus_dir,
        }
    }
}

/// Detector thresholds
///
/// Business parameters rather than engine mechanics; defaults are tuned for
/// typical web sessions.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub click_rage_min_clicks: usize,
    pub click_rage_window_ms: i64,

    pub dead_click_timeout_ms: i64,

    pub cpu_issue_threshold_pct: f64,
    pub cpu_issue_min_samples: usize,
    pub cpu_issue_min_duration_ms: i64,

    pub memory_issue_threshold_pct: f64,
    pub memory_issue_min_samples: usize,

    pub anr_threshold_ms: f64,
    pub anr_min_samples: usize,

    pub performance_window_ms: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            click_rage_min_clicks: 3,
            click_rage_window_ms: 1_000,
            dead_click_timeout_ms: 1_000,
            cpu_issue_threshold_pct: 70.0,
            cpu_issue_min_samples: 3,
            cpu_issue_min_duration_ms: 0,
            memory_issue_threshold_pct: 80.0,
            memory_issue_min_samples: 3,
            anr_threshold_ms: 5_000.0,
            anr_min_samples: 1,
            performance_window_ms: 20_000,
        }
    }
}

impl DetectorConfig {
    /// Defaults overridden by `CLICK_RAGE_MIN_CLICKS`, `CLICK_RAGE_WINDOW_MS`,
    /// `DEAD_CLICK_TIMEOUT_MS`, `CPU_ISSUE_THRESHOLD_PCT`, `CPU_ISSUE_MIN_SAMPLES`,
    /// `CPU_ISSUE_MIN_DURATION_MS`, `MEMORY_ISSUE_THRESHOLD_PCT`,
    /// `MEMORY_ISSUE_MIN_SAMPLES`, `ANR_THRESHOLD_MS`, `ANR_MIN_SAMPLES` and
    /// `PERFORMANCE_WINDOW_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            click_rage_min_clicks: env_or("CLICK_RAGE_MIN_CLICKS", d.click_rage_min_clicks)?,
            click_rage_window_ms: env_or("CLICK_RAGE_WINDOW_MS", d.click_rage_window_ms)?,
            dead_click_timeout_ms: env_or("DEAD_CLICK_TIMEOUT_MS", d.dead_click_timeout_ms)?,
            cpu_issue_threshold_pct: env_or("CPU_ISSUE_THRESHOLD_PCT", d.cpu_issue_threshold_pct)?,
            cpu_issue_min_samples: env_or("CPU_ISSUE_MIN_SAMPLES", d.cpu_issue_min_samples)?,
            cpu_issue_min_duration_ms: env_or("CPU_ISSUE_MIN_DURATION_MS", d.cpu_issue_min_duration_ms)?,
            memory_issue_threshold_pct: env_or("MEMORY_ISSUE_THRESHOLD_PCT", d.memory_issue_threshold_pct)?,
            memory_issue_min_samples: env_or("MEMORY_ISSUE_MIN_SAMPLES", d.memory_issue_min_samples)?,
            anr_threshold_ms: env_or("ANR_THRESHOLD_MS", d.anr_threshold_ms)?,
            anr_min_samples: env_or("ANR_MIN_SAMPLES", d.anr_min_samples)?,
            performance_window_ms: env_or("PERFORMANCE_WINDOW_MS", d.performance_window_ms)?,
        };

        if config.click_rage_min_clicks < 2 {
            return Err(ConfigError::InvalidValue("CLICK_RAGE_MIN_CLICKS must be at least 2".to_string()));
        }
        if config.cpu_issue_min_samples == 0 || config.memory_issue_min_samples == 0 || config.anr_min_samples == 0 {
            return Err(ConfigError::InvalidValue("*_MIN_SAMPLES must be at least 1".to_string()));
        }
        if config.performance_window_ms <= 0 || config.dead_click_timeout_ms <= 0 || config.click_rage_window_ms <= 0 {
            return Err(ConfigError::InvalidValue("window and timeout values must be positive".to_string()));
        }

        Ok(config)
    }
}
