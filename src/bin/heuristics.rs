//! Heuristics engine runtime
//!
//! Consumes raw web/mobile telemetry and session-end signals from the file
//! bus, runs the session detectors, and produces derived incidents to the
//! trigger topic.
//!
//! Usage:
//!   cargo run --release --bin heuristics
//!
//! Configuration comes from the environment (a `.env` file is honoured); see
//! `EngineConfig::from_env` and `DetectorConfig::from_env`. SIGINT/SIGTERM
//! drain and exit cleanly; any fatal engine error exits with status 1 without
//! committing, so a restart re-consumes from the last commit.

use dotenv::dotenv;
use env_logger::{Env, Target};
use log::{error, info};
use sessionflow::bus_core::{FileConsumer, FileProducer};
use sessionflow::handlers::default_handlers;
use sessionflow::pipeline::{DetectorConfig, EngineConfig, HeuristicsEngine, QueueStats, SessionRegistry};
use std::time::Duration;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("🛑 Received SIGINT"),
                    _ = sigterm.recv() => info!("🛑 Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("❌ Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("🛑 Received Ctrl-C");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();

    info!("🚀 Session heuristics");

    let config = EngineConfig::from_env()?;
    let detectors = DetectorConfig::from_env()?;

    info!("   ├─ Bus directory: {}", config.bus_dir.display());
    info!("   ├─ Offsets database: {}", config.offsets_db_path.display());
    info!("   ├─ Session idle timeout: {}ms", config.session_idle_timeout_ms);
    info!("   ├─ Max sessions: {}", config.max_sessions);
    info!("   └─ Producer timeout: {}ms", config.producer_timeout_ms);

    let consumer = FileConsumer::open(
        &config.bus_dir,
        &config.group_events,
        &config.input_topics(),
        &config.offsets_db_path,
    )?;
    let producer = FileProducer::new(&config.bus_dir)?;
    let stats = QueueStats::new(Duration::from_millis(config.stats_interval_ms));
    let registry = SessionRegistry::new(
        default_handlers(&detectors),
        config.session_idle_timeout_ms,
        config.max_sessions,
    );

    let mut engine = HeuristicsEngine::new(config, consumer, producer, stats, registry);

    if let Err(e) = engine.run(shutdown_signal()).await {
        error!("❌ Fatal: {}", e);
        std::process::exit(1);
    }

    info!("✅ Heuristics engine stopped");
    Ok(())
}
