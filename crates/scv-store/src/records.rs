//! Keyed durable store for stream records, plus the append-only stats log.

use crate::StoreError;
use crate::jsonl::{append_row, read_rows_from_path, write_rows_to_path};
use crate::record::{LeaseStats, StreamRecord};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const RECORDS_FILE: &str = "streams.jsonl";
pub const STATS_FILE: &str = "stats.jsonl";

/// Record store contract used by the session layer.
pub trait RecordStore: Send + Sync {
    /// Insert a new record; an existing id is an error.
    fn insert(&self, record: StreamRecord) -> Result<(), StoreError>;

    fn find(&self, id: &str) -> Result<Option<StreamRecord>, StoreError>;

    /// Apply `mutate` to the stored record and persist it. Nothing changes
    /// if persisting fails.
    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut StreamRecord),
    ) -> Result<StreamRecord, StoreError>;

    /// Drop a record; returns it if it existed.
    fn remove(&self, id: &str) -> Result<Option<StreamRecord>, StoreError>;

    /// Every record in id order.
    fn records(&self) -> Result<Vec<StreamRecord>, StoreError>;

    fn append_stats(&self, stats: &LeaseStats) -> Result<(), StoreError>;

    fn stats(&self) -> Result<Vec<LeaseStats>, StoreError>;
}

/// `RecordStore` over two JSONL files in one directory: a rewritten record
/// file and an appended stats log. Records are cached in memory; the file
/// is the source of truth across restarts.
#[derive(Debug)]
pub struct JsonlRecordStore {
    records_path: PathBuf,
    stats_path: PathBuf,
    records: Mutex<BTreeMap<String, StreamRecord>>,
}

impl JsonlRecordStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let records_path = dir.join(RECORDS_FILE);
        let stats_path = dir.join(STATS_FILE);
        let rows: Vec<StreamRecord> = read_rows_from_path(&records_path)?;
        let records: BTreeMap<String, StreamRecord> = rows
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        debug!(path = %records_path.display(), records = records.len(), "record store opened");
        Ok(Self {
            records_path,
            stats_path,
            records: Mutex::new(records),
        })
    }

    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StreamRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, records: &BTreeMap<String, StreamRecord>) -> Result<(), StoreError> {
        let rows: Vec<&StreamRecord> = records.values().collect();
        write_rows_to_path(&self.records_path, &rows)?;
        Ok(())
    }
}

impl RecordStore for JsonlRecordStore {
    fn insert(&self, record: StreamRecord) -> Result<(), StoreError> {
        let mut records = self.lock();
        if records.contains_key(&record.id) {
            return Err(StoreError::RecordExists(record.id));
        }
        let id = record.id.clone();
        records.insert(id.clone(), record);
        if let Err(err) = self.persist(&records) {
            records.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    fn find(&self, id: &str) -> Result<Option<StreamRecord>, StoreError> {
        Ok(self.lock().get(id).cloned())
    }

    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut StreamRecord),
    ) -> Result<StreamRecord, StoreError> {
        let mut records = self.lock();
        let previous = records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
        let mut next = previous.clone();
        mutate(&mut next);
        next.id = previous.id.clone();
        records.insert(id.to_string(), next.clone());
        if let Err(err) = self.persist(&records) {
            records.insert(id.to_string(), previous);
            return Err(err);
        }
        Ok(next)
    }

    fn remove(&self, id: &str) -> Result<Option<StreamRecord>, StoreError> {
        let mut records = self.lock();
        let Some(previous) = records.remove(id) else {
            return Ok(None);
        };
        if let Err(err) = self.persist(&records) {
            records.insert(id.to_string(), previous);
            return Err(err);
        }
        Ok(Some(previous))
    }

    fn records(&self) -> Result<Vec<StreamRecord>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    fn append_stats(&self, stats: &LeaseStats) -> Result<(), StoreError> {
        append_row(&self.stats_path, stats)?;
        Ok(())
    }

    fn stats(&self) -> Result<Vec<LeaseStats>, StoreError> {
        Ok(read_rows_from_path(&self.stats_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LeaseOutcome;
    use chrono::Utc;
    use scv_core::StreamStatus;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "scv-records-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("temp dir should be created");
        root
    }

    #[test]
    fn insert_find_update_survive_reopen() {
        let dir = temp_dir("reopen");
        let store = JsonlRecordStore::open(&dir).expect("open");
        store
            .insert(StreamRecord::new("s-1", "t-1", Utc::now()))
            .expect("insert");
        let updated = store
            .update("s-1", &mut |record| {
                record.frames = 4;
                record.status = StreamStatus::Disabled;
            })
            .expect("update");
        assert_eq!(updated.frames, 4);

        let reopened = JsonlRecordStore::open(&dir).expect("reopen");
        let record = reopened.find("s-1").expect("find").expect("present");
        assert_eq!(record.frames, 4);
        assert!(!record.is_enabled());
        assert_eq!(record.target_id, "t-1");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn duplicate_insert_and_missing_update_fail() {
        let dir = temp_dir("dupe");
        let store = JsonlRecordStore::open(&dir).expect("open");
        store
            .insert(StreamRecord::new("s-1", "t-1", Utc::now()))
            .expect("insert");
        assert!(matches!(
            store.insert(StreamRecord::new("s-1", "t-2", Utc::now())),
            Err(StoreError::RecordExists(id)) if id == "s-1"
        ));
        assert!(matches!(
            store.update("nope", &mut |_| {}),
            Err(StoreError::RecordNotFound(id)) if id == "nope"
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn removed_record_is_gone_after_reopen() {
        let dir = temp_dir("remove");
        let store = JsonlRecordStore::open(&dir).expect("open");
        store
            .insert(StreamRecord::new("s-1", "t-1", Utc::now()))
            .expect("insert");
        store
            .insert(StreamRecord::new("s-2", "t-1", Utc::now()))
            .expect("insert");

        let removed = store.remove("s-1").expect("remove").expect("present");
        assert_eq!(removed.id, "s-1");
        assert!(store.remove("s-1").expect("remove").is_none());

        let reopened = JsonlRecordStore::open(&dir).expect("reopen");
        let ids: Vec<String> = reopened
            .records()
            .expect("records")
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["s-2"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn status_is_persisted_as_a_word() {
        let mut record = StreamRecord::new("s-1", "t-1", Utc::now());
        record.status = StreamStatus::Disabled;
        let line = serde_json::to_string(&record).expect("serialize");
        assert!(line.contains("\"status\":\"disabled\""), "{line}");

        let legacy: StreamRecord =
            serde_json::from_str(r#"{"id":"s-2","target_id":"t-1","creation_date":0}"#)
                .expect("status defaults");
        assert!(legacy.is_enabled());
    }

    #[test]
    fn update_cannot_rename_a_record() {
        let dir = temp_dir("rename");
        let store = JsonlRecordStore::open(&dir).expect("open");
        store
            .insert(StreamRecord::new("s-1", "t-1", Utc::now()))
            .expect("insert");
        let updated = store
            .update("s-1", &mut |record| record.id = "other".to_string())
            .expect("update");
        assert_eq!(updated.id, "s-1");
        assert!(store.find("other").expect("find").is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stats_are_appended_in_order() {
        let dir = temp_dir("stats");
        let store = JsonlRecordStore::open(&dir).expect("open");
        for (i, outcome) in [LeaseOutcome::Stopped, LeaseOutcome::Expired]
            .into_iter()
            .enumerate()
        {
            store
                .append_stats(&LeaseStats {
                    stream_id: "s-1".to_string(),
                    target_id: "t-1".to_string(),
                    user: "donor".to_string(),
                    engine: "openmm".to_string(),
                    frames: i as f64,
                    start_time: 10,
                    end_time: 20,
                    outcome,
                    error: None,
                })
                .expect("append");
        }
        let stats = store.stats().expect("read");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].outcome, LeaseOutcome::Expired);
        let _ = fs::remove_dir_all(dir);
    }
}
