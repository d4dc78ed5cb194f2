//! File-backed bus: one append-only JSONL log per topic
//!
//! Record layout, one per line:
//!
//! ```text
//! <key>\t<payload>\n
//! ```
//!
//! A topic has a single partition (0) and a message's offset is its line
//! number. The consumer tails the logs without blocking and never hands out
//! a line before its newline has been written. Group positions live in an
//! [`OffsetStore`].

use super::offsets::OffsetStore;
use super::{BusError, BusMeta, ConsumedMessage, Consumer, Producer};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const PARTITION: i32 = 0;

/// Log file backing `topic` under `dir`
pub fn topic_path(dir: &Path, topic: &str) -> PathBuf {
    dir.join(format!("{}.jsonl", topic))
}

/// Encode one record line, rejecting keys or payloads that would break framing
pub fn encode_record(key: &str, payload: &[u8]) -> Result<Vec<u8>, BusError> {
    if key.contains('\t') || key.contains('\n') {
        return Err(BusError::InvalidRecord(format!("key {:?} contains a tab or newline", key)));
    }
    if payload.contains(&b'\n') {
        return Err(BusError::InvalidRecord("payload contains a newline".to_string()));
    }

    let mut line = Vec::with_capacity(key.len() + payload.len() + 2);
    line.extend_from_slice(key.as_bytes());
    line.push(b'\t');
    line.extend_from_slice(payload);
    line.push(b'\n');
    Ok(line)
}

struct TopicCursor {
    topic: String,
    path: PathBuf,
    reader: Option<BufReader<File>>,

    /// Complete lines read so far; the offset of the next line
    lines_read: u64,

    /// Offset the group will resume from
    committed: u64,
}

impl TopicCursor {
    /// Next complete line without its newline, or `None` if there is none yet
    fn next_line(&mut self) -> Result<Option<Vec<u8>>, BusError> {
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.reader = Some(BufReader::new(file)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(None);
        }

        if line.last() != Some(&b'\n') {
            // Writer is mid-append; leave the fragment for the next poll
            reader.seek_relative(-(read as i64))?;
            return Ok(None);
        }

        line.pop();
        self.lines_read += 1;
        Ok(Some(line))
    }
}

/// Consumer group member reading a set of topic logs round-robin
pub struct FileConsumer {
    cursors: Vec<TopicCursor>,
    offsets: OffsetStore,
    next_topic: usize,
    closed: bool,
}

impl FileConsumer {
    /// Join `group` on `topics`, resuming from the group's committed offsets
    pub fn open(
        dir: impl AsRef<Path>,
        group: &str,
        topics: &[String],
        offsets_path: impl AsRef<Path>,
    ) -> Result<Self, BusError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let offsets = OffsetStore::open(offsets_path, group)?;

        let mut cursors = Vec::with_capacity(topics.len());
        for topic in topics {
            let committed = offsets.load(topic, PARTITION)?;
            log::info!("📖 {} resuming {} at offset {}", group, topic, committed);
            cursors.push(TopicCursor {
                topic: topic.clone(),
                path: topic_path(dir, topic),
                reader: None,
                lines_read: 0,
                committed,
            });
        }

        Ok(Self {
            cursors,
            offsets,
            next_topic: 0,
            closed: false,
        })
    }
}

impl Consumer for FileConsumer {
    fn consume_next(&mut self) -> Result<Option<ConsumedMessage>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        let topic_count = self.cursors.len();
        for _ in 0..topic_count {
            let cursor = &mut self.cursors[self.next_topic];
            self.next_topic = (self.next_topic + 1) % topic_count;

            while let Some(line) = cursor.next_line()? {
                let offset = cursor.lines_read - 1;
                if offset < cursor.committed || line.is_empty() {
                    continue;
                }

                let Some(split) = line.iter().position(|b| *b == b'\t') else {
                    log::warn!("⚠️  Skipping malformed record {}[{}]@{}", cursor.topic, PARTITION, offset);
                    continue;
                };

                return Ok(Some(ConsumedMessage {
                    key: String::from_utf8_lossy(&line[..split]).into_owned(),
                    payload: line[split + 1..].to_vec(),
                    meta: BusMeta {
                        topic: cursor.topic.clone(),
                        partition: PARTITION,
                        offset,
                    },
                }));
            }
        }

        Ok(None)
    }

    fn commit(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        let positions: Vec<(String, i32, u64)> = self
            .cursors
            .iter()
            .filter(|c| c.lines_read > c.committed)
            .map(|c| (c.topic.clone(), PARTITION, c.lines_read))
            .collect();

        self.offsets.commit(&positions)?;

        for cursor in &mut self.cursors {
            cursor.committed = cursor.committed.max(cursor.lines_read);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        self.closed = true;
        for cursor in &mut self.cursors {
            cursor.reader = None;
        }
        Ok(())
    }
}

/// Buffered producer appending to topic logs on flush
pub struct FileProducer {
    dir: PathBuf,
    pending: Vec<(String, Vec<u8>)>,
    closed: bool,
}

impl FileProducer {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, BusError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            pending: Vec::new(),
            closed: false,
        })
    }
}

/// Append each topic's lines and sync them to disk
fn append_batch(dir: &Path, batch: &[(String, Vec<u8>)]) -> Result<(), BusError> {
    let mut by_topic: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
    for (topic, line) in batch {
        by_topic.entry(topic.as_str()).or_default().extend_from_slice(line);
    }

    for (topic, bytes) in by_topic {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(topic_path(dir, topic))?;
        file.write_all(&bytes)?;
        file.sync_data()?;
    }
    Ok(())
}

#[async_trait]
impl Producer for FileProducer {
    fn produce(&mut self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        let line = encode_record(key, &payload)?;
        self.pending.push((topic.to_string(), line));
        Ok(())
    }

    async fn flush(&mut self, timeout: Duration) -> Result<(), BusError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        // A timed-out write may still land; a retry then duplicates it, which
        // at-least-once delivery allows.
        let batch = self.pending.clone();
        let dir = self.dir.clone();
        let write = tokio::task::spawn_blocking(move || append_batch(&dir, &batch));

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(Ok(()))) => {
                log::debug!("✅ Flushed {} records", self.pending.len());
                self.pending.clear();
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_error)) => Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                join_error.to_string(),
            ))),
            Err(_) => Err(BusError::FlushTimeout {
                pending: self.pending.len(),
            }),
        }
    }

    async fn close(&mut self, timeout: Duration) -> Result<(), BusError> {
        if self.closed {
            return Ok(());
        }
        self.flush(timeout).await?;
        self.closed = true;
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}
