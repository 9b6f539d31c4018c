use crate::error::{BrokerError, Result};
use crate::log::LogStore;
use anyhow::Context;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use townhall_protocol::{Record, TopicConfig, TopicSpec};

/// Topic log persisted in a single SQLite file.
#[derive(Debug)]
pub struct SqliteLog {
    db_path: PathBuf,
    conn: Connection,
}

impl SqliteLog {
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = db_path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // Durable + fast defaults.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(Self {
            db_path: path,
            conn,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl LogStore for SqliteLog {
    fn create_topic(&mut self, name: &str, config: &TopicConfig) -> Result<()> {
        let res = self.conn.execute(
            "INSERT INTO topics (name, partitions, replication_factor, ignore_rack_assignment, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                name,
                config.partitions,
                config.replication_factor,
                config.ignore_rack_assignment,
                townhall_protocol::now_ms(),
            ),
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(BrokerError::TopicAlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn topic(&self, name: &str) -> Result<Option<TopicConfig>> {
        let config = self
            .conn
            .query_row(
                "SELECT partitions, replication_factor, ignore_rack_assignment FROM topics WHERE name = ?1",
                [name],
                |row| {
                    Ok(TopicConfig {
                        partitions: row.get(0)?,
                        replication_factor: row.get(1)?,
                        ignore_rack_assignment: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    fn topics(&self) -> Result<Vec<TopicSpec>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, partitions, replication_factor, ignore_rack_assignment FROM topics ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TopicSpec {
                name: row.get(0)?,
                config: TopicConfig {
                    partitions: row.get(1)?,
                    replication_factor: row.get(2)?,
                    ignore_rack_assignment: row.get(3)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append(
        &mut self,
        topic: &str,
        partition: u32,
        key: &str,
        value: &str,
        timestamp_ms: i64,
    ) -> Result<u64> {
        let tx = self.conn.transaction()?;
        let offset: i64 = tx.query_row(
            "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM records WHERE topic = ?1 AND partition_id = ?2",
            (topic, partition),
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO records (topic, partition_id, log_offset, record_key, value, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (topic, partition, offset, key, value, timestamp_ms),
        )?;
        tx.commit()?;
        Ok(offset as u64)
    }

    fn read_from(&self, topic: &str, partition: u32, from: u64) -> Result<Vec<Record>> {
        let from = i64::try_from(from).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT log_offset, record_key, value, timestamp_ms FROM records
             WHERE topic = ?1 AND partition_id = ?2 AND log_offset >= ?3
             ORDER BY log_offset",
        )?;
        let rows = stmt.query_map((topic, partition, from), |row| {
            let offset: i64 = row.get(0)?;
            Ok(Record {
                topic: topic.to_string(),
                partition,
                offset: offset as u64,
                key: row.get(1)?,
                value: row.get(2)?,
                timestamp_ms: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn next_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        let next: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM records WHERE topic = ?1 AND partition_id = ?2",
            (topic, partition),
            |row| row.get(0),
        )?;
        Ok(next as u64)
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS topics (
  name TEXT PRIMARY KEY,
  partitions INTEGER NOT NULL,
  replication_factor INTEGER NOT NULL DEFAULT 1,
  ignore_rack_assignment INTEGER NOT NULL DEFAULT 1,
  created_at_ms INTEGER NOT NULL
);

-- One row per appended record; (topic, partition_id, log_offset) is the cursor.
CREATE TABLE IF NOT EXISTS records (
  topic TEXT NOT NULL REFERENCES topics(name),
  partition_id INTEGER NOT NULL,
  log_offset INTEGER NOT NULL,
  record_key TEXT NOT NULL DEFAULT '',
  value TEXT NOT NULL,
  timestamp_ms INTEGER NOT NULL,
  PRIMARY KEY (topic, partition_id, log_offset)
);

CREATE INDEX IF NOT EXISTS idx_records_ts ON records(timestamp_ms);
"#,
        )
        .context("create broker schema")?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}
