//! Optional durable event sink.
//!
//! Append-only: the pipeline writes events and periodic count snapshots,
//! external analytics read them out of band. Sink failures are logged by
//! the caller and never stall the pipeline.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};

use crate::event::{CountSnapshot, EventRecord};

pub trait EventSink: Send {
    fn append_event(&mut self, event: &EventRecord) -> Result<()>;

    /// Record an aggregate counts snapshot at `timestamp_ms`.
    fn append_snapshot(&mut self, timestamp_ms: u64, snapshot: &CountSnapshot) -> Result<()>;
}

pub struct SqliteEventSink {
    conn: Connection,
}

impl SqliteEventSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let sink = Self { conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              stream_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS count_snapshots (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              snapshot_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
            CREATE INDEX IF NOT EXISTS idx_events_stream ON events(stream_id, created_at);
            "#,
        )?;
        Ok(())
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl EventSink for SqliteEventSink {
    fn append_event(&mut self, event: &EventRecord) -> Result<()> {
        let created_at = i64::try_from(event.timestamp_ms)
            .map_err(|_| anyhow!("event timestamp exceeds i64 range"))?;
        let payload = serde_json::to_string(event)?;
        let kind = serde_json::to_value(event.kind)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("event kind did not serialize to a string"))?;
        self.conn.execute(
            "INSERT INTO events (created_at, stream_id, kind, payload_json) VALUES (?1, ?2, ?3, ?4)",
            params![created_at, event.stream_id, kind, payload],
        )?;
        Ok(())
    }

    fn append_snapshot(&mut self, timestamp_ms: u64, snapshot: &CountSnapshot) -> Result<()> {
        let created_at = i64::try_from(timestamp_ms)
            .map_err(|_| anyhow!("snapshot timestamp exceeds i64 range"))?;
        let json = serde_json::to_string(snapshot)?;
        self.conn.execute(
            "INSERT INTO count_snapshots (created_at, snapshot_json) VALUES (?1, ?2)",
            params![created_at, json],
        )?;
        Ok(())
    }
}

/// Test and demo sink.
#[derive(Default)]
pub struct InMemoryEventSink {
    pub events: Vec<EventRecord>,
    pub snapshots: Vec<(u64, CountSnapshot)>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for InMemoryEventSink {
    fn append_event(&mut self, event: &EventRecord) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn append_snapshot(&mut self, timestamp_ms: u64, snapshot: &CountSnapshot) -> Result<()> {
        self.snapshots.push((timestamp_ms, snapshot.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::frame::{BoundingBox, ObjectClass};

    fn sample_event(track_id: u64) -> EventRecord {
        EventRecord {
            kind: EventKind::Enter,
            stream_id: "cam_a".into(),
            track_id,
            timestamp_ms: 1_700_000_000_000,
            class: Some(ObjectClass::Person),
            bbox: Some(BoundingBox::new(10.0, 10.0, 40.0, 60.0)),
            confidence: Some(0.9),
            zone: Some("desk_1".into()),
            counts: None,
            anomaly: None,
        }
    }

    #[test]
    fn sqlite_sink_appends_and_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("events.db");
        let mut sink = SqliteEventSink::open(db_path.to_str().unwrap()).expect("open");

        sink.append_event(&sample_event(1)).expect("append");
        sink.append_event(&sample_event(2)).expect("append");
        assert_eq!(sink.event_count().unwrap(), 2);

        let mut snapshot = CountSnapshot::default();
        snapshot.per_class.insert(ObjectClass::Person, 2);
        sink.append_snapshot(1_700_000_000_500, &snapshot)
            .expect("snapshot");
    }

    #[test]
    fn sqlite_sink_reopens_existing_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("events.db");
        {
            let mut sink = SqliteEventSink::open(db_path.to_str().unwrap()).expect("open");
            sink.append_event(&sample_event(1)).expect("append");
        }
        let sink = SqliteEventSink::open(db_path.to_str().unwrap()).expect("reopen");
        assert_eq!(sink.event_count().unwrap(), 1);
    }

    #[test]
    fn sqlite_round_trips_the_wire_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("events.db");
        let mut sink = SqliteEventSink::open(db_path.to_str().unwrap()).expect("open");
        sink.append_event(&sample_event(7)).expect("append");

        let payload: String = sink
            .conn
            .query_row("SELECT payload_json FROM events", [], |row| row.get(0))
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "enter");
        assert_eq!(json["track_id"], 7);
    }
}
