use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{PreconditionFailed, RecordOp, RecordStore, RecordWrite, ScanDirection, StoredRecord};

type Collection = BTreeMap<String, StoredRecord>;

/// In-process [`RecordStore`]. Nothing survives the process; used as the
/// volatile fallback when the host has no durable storage.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert_into(
    collections: &mut BTreeMap<String, Collection>,
    collection: &str,
    record: RecordWrite,
) {
    let now = Utc::now();
    let records = collections.entry(collection.to_string()).or_default();
    let created_at = records
        .get(&record.key)
        .map(|existing| existing.created_at)
        .unwrap_or(now);
    records.insert(
        record.key.clone(),
        StoredRecord {
            key: record.key,
            partition: record.partition,
            position: record.position,
            value: record.value,
            created_at,
            updated_at: now,
        },
    );
}

fn remove_from(
    collections: &mut BTreeMap<String, Collection>,
    collection: &str,
    key: &str,
) -> bool {
    collections
        .get_mut(collection)
        .map(|records| records.remove(key).is_some())
        .unwrap_or(false)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, collection: &str, record: RecordWrite) -> Result<()> {
        upsert_into(&mut *self.collections.lock().await, collection, record);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        Ok(remove_from(&mut *self.collections.lock().await, collection, key))
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<StoredRecord>> {
        let guard = self.collections.lock().await;
        Ok(guard
            .get(collection)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn scan_partition(
        &self,
        collection: &str,
        partition: &str,
        direction: ScanDirection,
    ) -> Result<Vec<StoredRecord>> {
        let guard = self.collections.lock().await;
        let mut records: Vec<StoredRecord> = guard
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.partition == partition)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| (a.position, &a.key).cmp(&(b.position, &b.key)));
        if direction == ScanDirection::Descending {
            records.reverse();
        }
        Ok(records)
    }

    async fn delete_partition(&self, collection: &str, partition: &str) -> Result<u64> {
        let mut guard = self.collections.lock().await;
        let Some(records) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|_, record| record.partition != partition);
        Ok((before - records.len()) as u64)
    }

    async fn clear_collection(&self, collection: &str) -> Result<u64> {
        let mut guard = self.collections.lock().await;
        Ok(guard
            .remove(collection)
            .map(|records| records.len() as u64)
            .unwrap_or(0))
    }

    async fn purge_older_than(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.collections.lock().await;
        let Some(records) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|_, record| record.created_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn apply_batch(&self, ops: Vec<RecordOp>) -> Result<()> {
        let mut guard = self.collections.lock().await;

        // Check every precondition before mutating so a failure leaves nothing behind.
        for op in &ops {
            if let RecordOp::ExpectPosition {
                collection,
                key,
                position,
            } = op
            {
                let found = guard
                    .get(collection)
                    .and_then(|records| records.get(key))
                    .map(|record| record.position);
                if found != *position {
                    return Err(PreconditionFailed {
                        collection: collection.clone(),
                        key: key.clone(),
                        expected: *position,
                        found,
                    }
                    .into());
                }
            }
        }

        for op in ops {
            match op {
                RecordOp::Upsert { collection, record } => {
                    upsert_into(&mut guard, &collection, record);
                }
                RecordOp::Delete { collection, key } => {
                    remove_from(&mut guard, &collection, &key);
                }
                RecordOp::ExpectPosition { .. } => {}
            }
        }
        Ok(())
    }
}
