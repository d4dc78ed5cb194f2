//! Committed consumer group offsets in SQLite
//!
//! One row per (group, topic, partition) holding the offset of the next
//! message to read. Commits only ever move offsets forward.

use super::BusError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct OffsetStore {
    conn: Connection,
    group_id: String,
}

impl OffsetStore {
    pub fn open(db_path: impl AsRef<Path>, group_id: &str) -> Result<Self, BusError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS consumer_offsets (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition INTEGER NOT NULL,
                next_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, topic, partition)
            )",
            [],
        )?;

        Ok(Self {
            conn,
            group_id: group_id.to_string(),
        })
    }

    /// Next offset to read, 0 when the group never committed
    pub fn load(&self, topic: &str, partition: i32) -> Result<u64, BusError> {
        let stored: Option<i64> = self
            .conn
            .query_row(
                "SELECT next_offset FROM consumer_offsets
                 WHERE group_id = ?1 AND topic = ?2 AND partition = ?3",
                params![self.group_id, topic, partition],
                |row| row.get(0),
            )
            .optional()?;

        Ok(stored.map_or(0, |offset| offset.max(0) as u64))
    }

    /// Persist every `(topic, partition, next_offset)` in one transaction
    pub fn commit(&mut self, positions: &[(String, i32, u64)]) -> Result<(), BusError> {
        if positions.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let tx = self.conn.transaction()?;
        for (topic, partition, next_offset) in positions {
            tx.execute(
                "INSERT INTO consumer_offsets (group_id, topic, partition, next_offset, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(group_id, topic, partition) DO UPDATE SET
                    next_offset = MAX(next_offset, excluded.next_offset),
                    updated_at = excluded.updated_at",
                params![self.group_id, topic, partition, *next_offset as i64, now],
            )?;
        }
        tx.commit()?;

        log::debug!("✅ Committed {} offsets for group {}", positions.len(), self.group_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_offsets_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.db");

        {
            let mut store = OffsetStore::open(&path, "heuristics").unwrap();
            assert_eq!(store.load("raw", 0).unwrap(), 0);
            store.commit(&[("raw".to_string(), 0, 42)]).unwrap();
        }

        let store = OffsetStore::open(&path, "heuristics").unwrap();
        assert_eq!(store.load("raw", 0).unwrap(), 42);
    }

    #[test]
    fn test_offsets_never_move_backwards() {
        let dir = TempDir::new().unwrap();
        let mut store = OffsetStore::open(dir.path().join("offsets.db"), "g").unwrap();

        store.commit(&[("raw".to_string(), 0, 10)]).unwrap();
        store.commit(&[("raw".to_string(), 0, 4)]).unwrap();
        assert_eq!(store.load("raw", 0).unwrap(), 10);
    }

    #[test]
    fn test_groups_are_independent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.db");

        let mut first = OffsetStore::open(&path, "first").unwrap();
        first.commit(&[("raw".to_string(), 0, 7)]).unwrap();

        let second = OffsetStore::open(&path, "second").unwrap();
        assert_eq!(second.load("raw", 0).unwrap(), 0);
    }
}
