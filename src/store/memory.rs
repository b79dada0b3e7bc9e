use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crossbeam_skiplist::SkipMap;

use super::{
    Batch, BatchedSetter, Getter, KvEngine, RangeScanner, ScanIterator, Setter, TimestampedGetter,
    INIT_KEY,
};
use crate::error::Result;

/// An ordered in-memory key-value backend.
///
/// Values carry their last modification time, so the store advertises the
/// timestamped-get capability. Batches are applied atomically with respect
/// to other batches by serializing commits through a single lock; point
/// writes remain lock-free on the skiplist.
pub struct MemoryStore {
    data: Arc<SkipMap<Vec<u8>, (Vec<u8>, SystemTime)>>,
    commit_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self {
            data: Arc::new(SkipMap::new()),
            commit_lock: Arc::new(Mutex::new(())),
        };
        // First-run marker, mirroring bucket backends.
        store.data.insert(INIT_KEY.to_vec(), (vec![], SystemTime::now()));
        store
    }

    /// Number of keys currently stored, excluding the first-run marker.
    pub fn len(&self) -> usize {
        self.data.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Getter for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|entry| entry.value().0.clone()))
    }
}

impl Setter for MemoryStore {
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), (value, SystemTime::now()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }
}

impl RangeScanner for MemoryStore {
    fn scan(&self, lo: &[u8], hi: &[u8]) -> Result<ScanIterator> {
        // Snapshot the range so the iterator owns its data.
        let range = (
            Bound::Included(lo.to_vec()),
            Bound::Included(hi.to_vec()),
        );
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .range(range)
            .map(|entry| (entry.key().clone(), entry.value().0.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn keys_in_range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<Vec<u8>>> {
        let range = (
            Bound::Included(lo.to_vec()),
            Bound::Included(hi.to_vec()),
        );
        Ok(self.data.range(range).map(|entry| entry.key().clone()).collect())
    }
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub struct MemoryBatch {
    data: Arc<SkipMap<Vec<u8>, (Vec<u8>, SystemTime)>>,
    commit_lock: Arc<Mutex<()>>,
    ops: Vec<BatchOp>,
}

impl Batch for MemoryBatch {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let _guard = self.commit_lock.lock().unwrap();
        let now = SystemTime::now();
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    self.data.insert(key, (value, now));
                }
                BatchOp::Delete(key) => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

impl BatchedSetter for MemoryStore {
    fn batch(&self) -> Box<dyn Batch> {
        Box::new(MemoryBatch {
            data: Arc::clone(&self.data),
            commit_lock: Arc::clone(&self.commit_lock),
            ops: Vec::new(),
        })
    }
}

impl TimestampedGetter for MemoryStore {
    fn get_with_timestamp(&self, key: &[u8]) -> Result<Option<(Vec<u8>, SystemTime)>> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }
}

impl KvEngine for MemoryStore {
    fn supports_timestamps(&self) -> bool {
        true
    }

    fn timestamped(&self) -> Option<&dyn TimestampedGetter> {
        Some(self)
    }
}
