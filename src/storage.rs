//! Append-only event stores.
//!
//! One logical stream per business type. Within a stream every record is
//! chained to its predecessor (`entry_hash = sha256(prev_hash || payload)`),
//! so deleted, edited or reordered rows show up in `verify_stream`. Record
//! timestamps within a stream never decrease.

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::LogWriteError;
use crate::events::{Event, EventFilter};
use crate::profile::BusinessType;

/// Hashes a log entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Result of walking one stream's hash chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainReport {
    pub stream: BusinessType,
    pub entries: u64,
    pub head: [u8; 32],
}

pub trait EventStore: Send {
    /// Append one record. Durable when this returns `Ok`.
    fn append(&mut self, event: &Event) -> Result<(), LogWriteError>;

    /// Records of `stream` matching `filter`, most recent first.
    fn read(&self, stream: BusinessType, filter: &EventFilter) -> Result<Vec<Event>, LogWriteError>;

    /// Walk the hash chain of `stream` from the first record.
    fn verify_stream(&self, stream: BusinessType) -> Result<ChainReport, LogWriteError>;
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteEventStore {
    conn: Connection,
    heads: HashMap<BusinessType, [u8; 32]>,
}

impl SqliteEventStore {
    pub fn open(db_path: &str) -> Result<Self, LogWriteError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self {
            conn,
            heads: HashMap::new(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<(), LogWriteError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              stream TEXT NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              kind TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_stream_ts ON events(stream, timestamp_ms);
            "#,
        )?;
        Ok(())
    }

    fn chain_head(&mut self, stream: BusinessType) -> Result<[u8; 32], LogWriteError> {
        if let Some(head) = self.heads.get(&stream) {
            return Ok(*head);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT entry_hash FROM events WHERE stream = ?1 ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query(params![stream.as_str()])?;
        let head = match rows.next()? {
            Some(row) => to_hash(row.get(0)?, "entry_hash")?,
            None => [0u8; 32],
        };
        self.heads.insert(stream, head);
        Ok(head)
    }
}

impl EventStore for SqliteEventStore {
    fn append(&mut self, event: &Event) -> Result<(), LogWriteError> {
        let stream = event.business_type;
        let timestamp_ms = i64::try_from(event.timestamp_ms)
            .map_err(|_| LogWriteError::Corrupt("timestamp exceeds i64 range".to_string()))?;
        let prev_hash = self.chain_head(stream)?;
        let payload_json = serde_json::to_string(event)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());

        self.conn.execute(
            r#"
            INSERT INTO events(stream, timestamp_ms, kind, payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                stream.as_str(),
                timestamp_ms,
                event.kind.name(),
                payload_json,
                prev_hash.to_vec(),
                entry_hash.to_vec()
            ],
        )?;
        self.heads.insert(stream, entry_hash);
        Ok(())
    }

    fn read(&self, stream: BusinessType, filter: &EventFilter) -> Result<Vec<Event>, LogWriteError> {
        let since = filter.since_ms.map_or(0, |v| v.min(i64::MAX as u64) as i64);
        let until = filter
            .until_ms
            .map_or(i64::MAX, |v| v.min(i64::MAX as u64) as i64);
        let limit = filter.limit.map_or(-1, |v| v.min(i64::MAX as usize) as i64);

        let mut stmt = self.conn.prepare(
            r#"
            SELECT payload_json FROM events
            WHERE stream = ?1 AND timestamp_ms >= ?2 AND timestamp_ms <= ?3
              AND (?4 IS NULL OR kind = ?4)
            ORDER BY id DESC
            LIMIT ?5
            "#,
        )?;
        let mut rows = stmt.query(params![
            stream.as_str(),
            since,
            until,
            filter.kind.as_deref(),
            limit
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    fn verify_stream(&self, stream: BusinessType) -> Result<ChainReport, LogWriteError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload_json, prev_hash, entry_hash FROM events WHERE stream = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![stream.as_str()])?;
        let mut walker = ChainWalker::new(stream);
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let prev = to_hash(row.get(2)?, "prev_hash")?;
            let entry = to_hash(row.get(3)?, "entry_hash")?;
            walker.step(&id.to_string(), &payload, prev, entry)?;
        }
        Ok(walker.finish())
    }
}

fn to_hash(bytes: Vec<u8>, column: &str) -> Result<[u8; 32], LogWriteError> {
    bytes
        .try_into()
        .map_err(|_| LogWriteError::Corrupt(format!("{} size", column)))
}

// ----------------------------------------------------------------------------
// Chain verification
// ----------------------------------------------------------------------------

struct ChainWalker {
    stream: BusinessType,
    head: [u8; 32],
    entries: u64,
    last_timestamp_ms: u64,
}

impl ChainWalker {
    fn new(stream: BusinessType) -> Self {
        Self {
            stream,
            head: [0u8; 32],
            entries: 0,
            last_timestamp_ms: 0,
        }
    }

    fn step(
        &mut self,
        id: &str,
        payload: &str,
        prev: [u8; 32],
        entry: [u8; 32],
    ) -> Result<(), LogWriteError> {
        if prev != self.head {
            return Err(LogWriteError::Corrupt(format!(
                "{} entry {}: prev_hash does not match chain head",
                self.stream, id
            )));
        }
        if hash_entry(&prev, payload.as_bytes()) != entry {
            return Err(LogWriteError::Corrupt(format!(
                "{} entry {}: entry_hash mismatch",
                self.stream, id
            )));
        }
        let event: Event = serde_json::from_str(payload)?;
        if event.business_type != self.stream {
            return Err(LogWriteError::Corrupt(format!(
                "{} entry {}: record belongs to {}",
                self.stream, id, event.business_type
            )));
        }
        if event.timestamp_ms < self.last_timestamp_ms {
            return Err(LogWriteError::Corrupt(format!(
                "{} entry {}: timestamp {} precedes {}",
                self.stream, id, event.timestamp_ms, self.last_timestamp_ms
            )));
        }
        self.last_timestamp_ms = event.timestamp_ms;
        self.head = entry;
        self.entries += 1;
        Ok(())
    }

    fn finish(self) -> ChainReport {
        ChainReport {
            stream: self.stream,
            entries: self.entries,
            head: self.head,
        }
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct InMemoryEntry {
    stream: BusinessType,
    payload_json: String,
    prev_hash: [u8; 32],
    entry_hash: [u8; 32],
}

#[derive(Debug, Default)]
struct InMemoryState {
    entries: Vec<InMemoryEntry>,
    offline: bool,
}

/// In-memory store. Clones share the same records, so a test can keep a
/// handle while the logger owns another.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While offline every append fails, simulating a storage outage.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn len(&self, stream: BusinessType) -> usize {
        self.state()
            .entries
            .iter()
            .filter(|e| e.stream == stream)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// All records of `stream`, oldest first.
    pub fn events(&self, stream: BusinessType) -> Vec<Event> {
        self.state()
            .entries
            .iter()
            .filter(|e| e.stream == stream)
            .filter_map(|e| serde_json::from_str(&e.payload_json).ok())
            .collect()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&mut self, event: &Event) -> Result<(), LogWriteError> {
        let mut state = self.state();
        if state.offline {
            return Err(LogWriteError::Closed(format!(
                "{} (store offline)",
                event.business_type
            )));
        }
        let stream = event.business_type;
        let prev_hash = state
            .entries
            .iter()
            .rev()
            .find(|e| e.stream == stream)
            .map_or([0u8; 32], |e| e.entry_hash);
        let payload_json = serde_json::to_string(event)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());
        state.entries.push(InMemoryEntry {
            stream,
            payload_json,
            prev_hash,
            entry_hash,
        });
        Ok(())
    }

    fn read(&self, stream: BusinessType, filter: &EventFilter) -> Result<Vec<Event>, LogWriteError> {
        let mut out = Vec::new();
        for entry in self.state().entries.iter().rev().filter(|e| e.stream == stream) {
            let event: Event = serde_json::from_str(&entry.payload_json)?;
            if filter.matches(&event) {
                out.push(event);
                if filter.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn verify_stream(&self, stream: BusinessType) -> Result<ChainReport, LogWriteError> {
        let state = self.state();
        let mut walker = ChainWalker::new(stream);
        for (index, entry) in state.entries.iter().enumerate() {
            if entry.stream != stream {
                continue;
            }
            walker.step(
                &index.to_string(),
                &entry.payload_json,
                entry.prev_hash,
                entry.entry_hash,
            )?;
        }
        Ok(walker.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::tracking::TrackId;

    fn event(business: BusinessType, ts: u64, kind: EventKind) -> Event {
        Event {
            timestamp_ms: ts,
            business_type: business,
            object_type: "person".to_string(),
            confidence: 0.8,
            zone: Some("queue".to_string()),
            track_id: Some(TrackId(1)),
            kind,
        }
    }

    #[test]
    fn sqlite_streams_are_chained_separately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let mut store = SqliteEventStore::open(path.to_str().unwrap()).unwrap();

        store.append(&event(BusinessType::Pharmacy, 1_000, EventKind::TrackCreated)).unwrap();
        store.append(&event(BusinessType::Retail, 1_100, EventKind::TrackCreated)).unwrap();
        let retired = EventKind::TrackRetired {
            dwell_secs: 45.0,
            last_seen_ms: 45_000,
        };
        store.append(&event(BusinessType::Pharmacy, 46_000, retired)).unwrap();

        let pharmacy = store.verify_stream(BusinessType::Pharmacy).unwrap();
        assert_eq!(pharmacy.entries, 2);
        assert_eq!(store.verify_stream(BusinessType::Retail).unwrap().entries, 1);
        assert_eq!(store.verify_stream(BusinessType::Residential).unwrap().entries, 0);

        // Reopen: chain head is recovered from disk.
        drop(store);
        let mut store = SqliteEventStore::open(path.to_str().unwrap()).unwrap();
        store.append(&event(BusinessType::Pharmacy, 47_000, EventKind::TrackCreated)).unwrap();
        assert_eq!(store.verify_stream(BusinessType::Pharmacy).unwrap().entries, 3);
    }

    #[test]
    fn sqlite_read_filters_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let mut store = SqliteEventStore::open(path.to_str().unwrap()).unwrap();
        for ts in [1_000, 2_000, 3_000] {
            store.append(&event(BusinessType::Retail, ts, EventKind::TrackCreated)).unwrap();
        }
        let retired = EventKind::TrackRetired {
            dwell_secs: 1.0,
            last_seen_ms: 3_000,
        };
        store.append(&event(BusinessType::Retail, 4_000, retired)).unwrap();

        let all = store.read(BusinessType::Retail, &EventFilter::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].timestamp_ms, 4_000);

        let created = EventFilter {
            kind: Some("track_created".to_string()),
            since_ms: Some(2_000),
            limit: Some(1),
            ..EventFilter::default()
        };
        let got = store.read(BusinessType::Retail, &created).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp_ms, 3_000);
    }

    #[test]
    fn sqlite_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let mut store = SqliteEventStore::open(path.to_str().unwrap()).unwrap();
        for ts in [1_000, 2_000, 3_000] {
            store.append(&event(BusinessType::Pharmacy, ts, EventKind::TrackCreated)).unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE events SET payload_json = replace(payload_json, 'queue', 'counter') WHERE id = 2",
            [],
        )
        .unwrap();
        assert!(matches!(
            store.verify_stream(BusinessType::Pharmacy),
            Err(LogWriteError::Corrupt(_))
        ));
    }

    #[test]
    fn backwards_timestamp_fails_verification() {
        let mut store = InMemoryEventStore::new();
        store.append(&event(BusinessType::Pharmacy, 6_000, EventKind::TrackCreated)).unwrap();
        store.append(&event(BusinessType::Pharmacy, 6_000, EventKind::TrackCreated)).unwrap();
        assert_eq!(store.verify_stream(BusinessType::Pharmacy).unwrap().entries, 2);

        store.append(&event(BusinessType::Pharmacy, 3_000, EventKind::TrackCreated)).unwrap();
        assert!(matches!(
            store.verify_stream(BusinessType::Pharmacy),
            Err(LogWriteError::Corrupt(_))
        ));
    }

    #[test]
    fn in_memory_store_goes_offline() {
        let handle = InMemoryEventStore::new();
        let mut store = handle.clone();
        store.append(&event(BusinessType::Retail, 1, EventKind::TrackCreated)).unwrap();
        handle.set_offline(true);
        assert!(store.append(&event(BusinessType::Retail, 2, EventKind::TrackCreated)).is_err());
        handle.set_offline(false);
        store.append(&event(BusinessType::Retail, 3, EventKind::TrackCreated)).unwrap();

        assert_eq!(handle.len(BusinessType::Retail), 2);
        assert_eq!(handle.verify_stream(BusinessType::Retail).unwrap().entries, 2);
    }
}
