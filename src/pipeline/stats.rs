//! Consumption statistics
//!
//! The engine reports every consumed message and never reads anything back.
//! [`QueueStats`] logs a summary on its own cadence and starts over.

use crate::bus_core::BusMeta;
use crate::pipeline::types::SessionId;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

pub trait StatsCollector: Send {
    fn collect(&mut self, session_id: SessionId, meta: &BusMeta);

    /// A consumed message could not be decoded
    fn collect_undecodable(&mut self, _meta: &BusMeta) {}
}

/// Offsets observed on one topic partition during the current interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    pub messages: u64,
    pub min_offset: u64,
    pub max_offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages: u64,
    pub undecodable: u64,
    pub sessions: usize,
    pub partitions: BTreeMap<(String, i32), PartitionStats>,
}

pub struct QueueStats {
    interval: Duration,
    last_log: Instant,
    messages: u64,
    undecodable: u64,
    sessions: HashSet<SessionId>,
    partitions: BTreeMap<(String, i32), PartitionStats>,
}

impl QueueStats {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_log: Instant::now(),
            messages: 0,
            undecodable: 0,
            sessions: HashSet::new(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages: self.messages,
            undecodable: self.undecodable,
            sessions: self.sessions.len(),
            partitions: self.partitions.clone(),
        }
    }

    fn observe(&mut self, meta: &BusMeta) {
        self.partitions
            .entry((meta.topic.clone(), meta.partition))
            .and_modify(|p| {
                p.messages += 1;
                p.min_offset = p.min_offset.min(meta.offset);
                p.max_offset = p.max_offset.max(meta.offset);
            })
            .or_insert(PartitionStats {
                messages: 1,
                min_offset: meta.offset,
                max_offset: meta.offset,
            });
    }

    fn maybe_log(&mut self) {
        let elapsed = self.last_log.elapsed();
        if elapsed < self.interval {
            return;
        }

        let rate = self.messages as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        log::info!(
            "📊 Consumed {} messages ({:.1}/sec) from {} sessions, {} undecodable",
            self.messages,
            rate,
            self.sessions.len(),
            self.undecodable
        );
        for ((topic, partition), stats) in &self.partitions {
            log::info!(
                "   ├─ {}[{}]: {} messages, offsets {}..={}",
                topic,
                partition,
                stats.messages,
                stats.min_offset,
                stats.max_offset
            );
        }

        self.messages = 0;
        self.undecodable = 0;
        self.sessions.clear();
        self.partitions.clear();
        self.last_log = Instant::now();
    }
}

impl StatsCollector for QueueStats {
    fn collect(&mut self, session_id: SessionId, meta: &BusMeta) {
        self.messages += 1;
        self.sessions.insert(session_id);
        self.observe(meta);
        self.maybe_log();
    }

    fn collect_undecodable(&mut self, meta: &BusMeta) {
        self.undecodable += 1;
        self.observe(meta);
        self.maybe_log();
    }
}
