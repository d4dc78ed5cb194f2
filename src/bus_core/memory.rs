//! In-process broker with a single consumer group
//!
//! Messages produced here are appended to the same topic logs consumers read,
//! exactly like the file bus. Every client call is recorded as a [`BusOp`] so
//! tests can assert on ordering, and flush or consume failures can be
//! injected.

use super::{BusError, BusMeta, ConsumedMessage, Consumer, Producer};
use crate::pipeline::types::RawEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const PARTITION: i32 = 0;

/// One recorded client call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Produce { topic: String, key: String },
    Flush { ok: bool, delivered: usize },
    Commit { offsets: Vec<(String, u64)> },
    ProducerClose,
    ConsumerClose,
}

#[derive(Default)]
struct Broker {
    logs: HashMap<String, Vec<(String, Vec<u8>)>>,
    committed: HashMap<String, u64>,
    ops: Vec<BusOp>,
    failing_flushes: u32,
    failing_consume: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Broker>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message as an upstream producer would
    pub fn push(&self, topic: &str, key: &str, payload: Vec<u8>) {
        self.broker()
            .logs
            .entry(topic.to_string())
            .or_default()
            .push((key.to_string(), payload));
    }

    /// Append a raw event keyed by its session id
    pub fn push_event(&self, topic: &str, event: &RawEvent) -> Result<(), serde_json::Error> {
        let payload = event.encode()?;
        self.push(topic, &event.session_id.to_string(), payload);
        Ok(())
    }

    pub fn consumer(&self, topics: &[String]) -> MemoryConsumer {
        let committed = {
            let broker = self.broker();
            topics
                .iter()
                .map(|t| (t.clone(), broker.committed.get(t).copied().unwrap_or(0)))
                .collect()
        };

        MemoryConsumer {
            bus: self.clone(),
            topics: topics.to_vec(),
            positions: committed,
            next_topic: 0,
            closed: false,
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            bus: self.clone(),
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Make the next `count` flushes fail without delivering anything
    pub fn fail_next_flushes(&self, count: u32) {
        self.broker().failing_flushes = count;
    }

    pub fn fail_consume(&self, failing: bool) {
        self.broker().failing_consume = failing;
    }

    pub fn ops(&self) -> Vec<BusOp> {
        self.broker().ops.clone()
    }

    /// Everything in a topic log, upstream and produced messages alike
    pub fn messages(&self, topic: &str) -> Vec<(String, Vec<u8>)> {
        self.broker().logs.get(topic).cloned().unwrap_or_default()
    }

    pub fn committed_offset(&self, topic: &str) -> u64 {
        self.broker().committed.get(topic).copied().unwrap_or(0)
    }
}

pub struct MemoryConsumer {
    bus: MemoryBus,
    topics: Vec<String>,
    positions: HashMap<String, u64>,
    next_topic: usize,
    closed: bool,
}

impl Consumer for MemoryConsumer {
    fn consume_next(&mut self) -> Result<Option<ConsumedMessage>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        let broker = self.bus.broker();
        if broker.failing_consume {
            return Err(BusError::Injected("consume".to_string()));
        }

        for _ in 0..self.topics.len() {
            let topic = &self.topics[self.next_topic];
            self.next_topic = (self.next_topic + 1) % self.topics.len();

            let position = self.positions.entry(topic.clone()).or_insert(0);
            let Some((key, payload)) = broker.logs.get(topic).and_then(|log| log.get(*position as usize)) else {
                continue;
            };

            let message = ConsumedMessage {
                key: key.clone(),
                payload: payload.clone(),
                meta: BusMeta {
                    topic: topic.clone(),
                    partition: PARTITION,
                    offset: *position,
                },
            };
            *position += 1;
            return Ok(Some(message));
        }

        Ok(None)
    }

    fn commit(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        let mut broker = self.bus.broker();
        let mut offsets: Vec<(String, u64)> = self.positions.iter().map(|(t, p)| (t.clone(), *p)).collect();
        offsets.sort();

        for (topic, position) in &offsets {
            let committed = broker.committed.entry(topic.clone()).or_insert(0);
            *committed = (*committed).max(*position);
        }
        broker.ops.push(BusOp::Commit { offsets });
        Ok(())
    }

    fn close(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        self.closed = true;
        self.bus.broker().ops.push(BusOp::ConsumerClose);
        Ok(())
    }
}

pub struct MemoryProducer {
    bus: MemoryBus,
    pending: Vec<(String, String, Vec<u8>)>,
    closed: bool,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn produce(&mut self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        self.bus.broker().ops.push(BusOp::Produce {
            topic: topic.to_string(),
            key: key.to_string(),
        });
        self.pending.push((topic.to_string(), key.to_string(), payload));
        Ok(())
    }

    async fn flush(&mut self, _timeout: Duration) -> Result<(), BusError> {
        let mut broker = self.bus.broker();

        if broker.failing_flushes > 0 {
            broker.failing_flushes -= 1;
            broker.ops.push(BusOp::Flush { ok: false, delivered: 0 });
            return Err(BusError::Injected("flush".to_string()));
        }

        let delivered = self.pending.len();
        for (topic, key, payload) in self.pending.drain(..) {
            broker.logs.entry(topic).or_default().push((key, payload));
        }
        broker.ops.push(BusOp::Flush { ok: true, delivered });
        Ok(())
    }

    async fn close(&mut self, timeout: Duration) -> Result<(), BusError> {
        if self.closed {
            return Ok(());
        }
        self.flush(timeout).await?;
        self.closed = true;
        self.bus.broker().ops.push(BusOp::ProducerClose);
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}
