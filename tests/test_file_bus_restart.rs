//! Engine over the file bus: committed offsets survive a restart
//!
//! Offsets live in SQLite next to the topic logs, so a second engine opened
//! on the same directory picks up exactly where the last commit left it.

#[cfg(test)]
mod file_bus_restart_tests {
    use sessionflow::bus_core::file_bus::topic_path;
    use sessionflow::bus_core::{FileConsumer, FileProducer, Producer};
    use sessionflow::handlers::default_handlers;
    use sessionflow::pipeline::{
        DetectorConfig, EngineConfig, HeuristicsEngine, Payload, QueueStats, RawEvent, SessionRegistry,
    };
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    type Engine = HeuristicsEngine<FileConsumer, FileProducer, QueueStats>;

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            bus_dir: dir.to_path_buf(),
            offsets_db_path: dir.join("offsets.db"),
            ..EngineConfig::default()
        }
    }

    fn start(config: &EngineConfig) -> Engine {
        let consumer = FileConsumer::open(
            &config.bus_dir,
            &config.group_events,
            &config.input_topics(),
            &config.offsets_db_path,
        )
        .unwrap();
        let producer = FileProducer::new(&config.bus_dir).unwrap();
        let registry = SessionRegistry::new(default_handlers(&DetectorConfig::default()), 60_000, 1_000);
        HeuristicsEngine::new(
            config.clone(),
            consumer,
            producer,
            QueueStats::new(Duration::from_secs(3600)),
            registry,
        )
    }

    async fn inject(dir: &Path, topic: &str, events: &[RawEvent]) {
        let mut producer = FileProducer::new(dir).unwrap();
        for event in events {
            producer
                .produce(topic, &event.session_id.to_string(), event.encode().unwrap())
                .unwrap();
        }
        producer.close(Duration::from_secs(5)).await.unwrap();
    }

    fn rage(session: u64, first_index: u64, start_ts: i64) -> Vec<RawEvent> {
        (0..3)
            .map(|i| {
                RawEvent::new(session, first_index + i, start_ts + i as i64 * 100, Payload::Click {
                    target: "#buy".to_string(),
                    label: Some("Buy".to_string()),
                })
            })
            .collect()
    }

    fn trigger_lines(dir: &Path) -> usize {
        std::fs::read_to_string(topic_path(dir, "trigger"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_restart_resumes_after_commit() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        inject(dir.path(), "raw", &rage(42, 0, 1_000)).await;

        {
            let mut engine = start(&config);
            while engine.poll_once().unwrap() {}
            assert_eq!(engine.tick().await.unwrap(), 1);
            engine.drain().await.unwrap();
        }
        assert_eq!(trigger_lines(dir.path()), 1);

        inject(dir.path(), "raw", &rage(43, 0, 9_000)).await;

        let mut engine = start(&config);
        while engine.poll_once().unwrap() {}
        // Session 43's clicks plus the trigger echo; session 42 is not replayed
        assert_eq!(engine.counters().dispatched, 3);
        assert_eq!(engine.counters().ignored, 1);
        assert_eq!(engine.tick().await.unwrap(), 1);
        assert_eq!(trigger_lines(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_uncommitted_messages_redelivered() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        inject(dir.path(), "raw", &rage(42, 0, 1_000)).await;

        {
            // Crash before any tick: nothing produced, nothing committed
            let mut engine = start(&config);
            while engine.poll_once().unwrap() {}
            assert_eq!(engine.counters().consumed, 3);
        }

        let mut engine = start(&config);
        while engine.poll_once().unwrap() {}
        assert_eq!(engine.counters().consumed, 3);
        assert_eq!(engine.tick().await.unwrap(), 1);
        assert_eq!(trigger_lines(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_written_incident_envelope() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        inject(dir.path(), "raw", &rage(7, 0, 1_000)).await;

        let mut engine = start(&config);
        while engine.poll_once().unwrap() {}
        engine.tick().await.unwrap();

        let log = std::fs::read_to_string(topic_path(dir.path(), "trigger")).unwrap();
        let line = log.lines().next().expect("one record");
        let (key, payload) = line.split_once('\t').expect("key and payload");
        assert_eq!(key, "7");

        let event = RawEvent::decode(payload.as_bytes()).unwrap();
        assert_eq!(event.session_id, 7);
        match event.payload {
            Payload::Incident { details, .. } => {
                assert_eq!(details["count"], 3);
                assert_eq!(details["label"], "Buy");
            }
            other => panic!("expected incident, got {:?}", other),
        }
    }
}
