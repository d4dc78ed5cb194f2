//! Append raw events to a topic log
//!
//! Reads one JSON event per line, validates it, and appends it to the topic
//! keyed by its session id. Handy for replaying captured sessions into a
//! local engine.
//!
//! Usage:
//!   bus_inject <events.jsonl> [topic]
//!
//! The topic defaults to `TOPIC_RAW_WEB`; the bus directory is `BUS_DIR`.

use dotenv::dotenv;
use env_logger::{Env, Target};
use log::{info, warn};
use sessionflow::bus_core::{FileProducer, Producer};
use sessionflow::pipeline::{EngineConfig, RawEvent};
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <events.jsonl> [topic]", args[0]);
        std::process::exit(2);
    }

    let config = EngineConfig::from_env()?;
    let topic = args.get(2).cloned().unwrap_or_else(|| config.topic_raw_web.clone());
    let mut producer = FileProducer::new(&config.bus_dir)?;

    let reader = BufReader::new(File::open(&args[1])?);
    let mut appended = 0usize;
    let mut skipped = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match RawEvent::decode(line.as_bytes()) {
            Ok(event) => {
                // Re-encode so the record is a single compact line
                producer.produce(&topic, &event.session_id.to_string(), event.encode()?)?;
                appended += 1;
            }
            Err(e) => {
                warn!("⚠️  Line {}: {}", line_no + 1, e);
                skipped += 1;
            }
        }
    }

    producer.close(config.producer_timeout()).await?;
    info!("✅ Appended {} events to {} ({} skipped)", appended, topic, skipped);
    Ok(())
}
