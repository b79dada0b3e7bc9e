use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::encoding::IndexZYX;
use crate::version::VersionId;

/// Maximum frequency a cached block can accumulate.
const MAX_FREQUENCY_LIMIT: u8 = 3;

type BlockKey = (VersionId, IndexZYX);

struct Entry {
    value: Arc<Vec<u64>>,
    freq: u8,
}

/// S3-FIFO cache for decoded label blocks.
///
/// New blocks enter the small queue; blocks read at least twice before
/// eviction are promoted to the main queue. Keys of recently evicted
/// entries linger in a ghost queue so a quick re-insert lands directly in
/// main. Capacity is a block count derived from the configured byte budget.
pub struct BlockCache {
    max_entries: usize,
    max_main: usize,
    small: VecDeque<BlockKey>,
    main: VecDeque<BlockKey>,
    ghost: VecDeque<BlockKey>,
    ghost_keys: HashSet<BlockKey>,
    entries: HashMap<BlockKey, Entry>,
    hits: usize,
    misses: usize,
}

impl BlockCache {
    /// Creates a cache bounded by `budget_bytes` of decoded blocks of
    /// `block_bytes` each. At least one block is always cacheable.
    pub fn new(budget_bytes: usize, block_bytes: usize) -> Self {
        let max_entries = (budget_bytes / block_bytes.max(1)).max(1);
        let max_small = (max_entries / 10).max(1);
        Self {
            max_entries,
            max_main: max_entries - max_small,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_keys: HashSet::new(),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, version: VersionId, zyx: IndexZYX) -> Option<Arc<Vec<u64>>> {
        match self.entries.get_mut(&(version, zyx)) {
            Some(entry) => {
                entry.freq = (entry.freq + 1).min(MAX_FREQUENCY_LIMIT);
                self.hits += 1;
                Some(Arc::clone(&entry.value))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, version: VersionId, zyx: IndexZYX, value: Arc<Vec<u64>>) {
        let key = (version, zyx);
        if self.entries.contains_key(&key) {
            // Refresh in place; queue position is unchanged.
            self.entries.insert(key, Entry { value, freq: 0 });
            return;
        }
        self.evict();
        if self.ghost_keys.remove(&key) {
            self.main.push_back(key);
        } else {
            self.small.push_back(key);
        }
        self.entries.insert(key, Entry { value, freq: 0 });
    }

    /// Drops a block, e.g. after its voxels were rewritten.
    pub fn remove(&mut self, version: VersionId, zyx: IndexZYX) {
        self.entries.remove(&(version, zyx));
    }

    /// (hits, misses) counters.
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    fn evict(&mut self) {
        while self.entries.len() >= self.max_entries {
            let before = self.entries.len();
            let main_full = self.main.len() >= self.max_main && !self.main.is_empty();
            if main_full || self.small.is_empty() {
                self.evict_main();
            } else {
                self.evict_small();
            }
            if self.entries.len() == before {
                // Every queued key was stale; nothing left to evict.
                break;
            }
        }
    }

    fn evict_small(&mut self) {
        while let Some(key) = self.small.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue; // removed out of band
            };
            if entry.freq > 1 {
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.push_ghost(key);
                return;
            }
        }
    }

    fn evict_main(&mut self) {
        // One full rotation at most; second-chance on nonzero frequency.
        for _ in 0..self.main.len() {
            let Some(key) = self.main.pop_front() else {
                return;
            };
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.freq > 0 {
                entry.freq -= 1;
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.push_ghost(key);
                return;
            }
        }
        // All of main had nonzero frequency; drop the oldest anyway.
        while let Some(key) = self.main.pop_front() {
            if self.entries.remove(&key).is_some() {
                self.push_ghost(key);
                return;
            }
        }
    }

    fn push_ghost(&mut self, key: BlockKey) {
        if self.ghost.len() >= self.max_entries {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_keys.remove(&old);
            }
        }
        self.ghost.push_back(key);
        self.ghost_keys.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: i32) -> IndexZYX {
        IndexZYX::new(i, 0, 0)
    }

    fn block(label: u64) -> Arc<Vec<u64>> {
        Arc::new(vec![label; 8])
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = BlockCache::new(1024, 64);
        cache.insert(0, key(1), block(1));
        cache.insert(0, key(2), block(2));

        assert_eq!(cache.get(0, key(1)).unwrap()[0], 1);
        assert_eq!(cache.get(0, key(2)).unwrap()[0], 2);
        assert!(cache.get(0, key(3)).is_none());
        assert_eq!(cache.stats(), (2, 1));
    }

    #[test]
    fn test_version_scopes_keys() {
        let mut cache = BlockCache::new(1024, 64);
        cache.insert(0, key(1), block(10));
        cache.insert(1, key(1), block(11));
        assert_eq!(cache.get(0, key(1)).unwrap()[0], 10);
        assert_eq!(cache.get(1, key(1)).unwrap()[0], 11);
    }

    #[test]
    fn test_eviction_bounds_entries() {
        // Capacity of 4 blocks.
        let mut cache = BlockCache::new(4 * 64, 64);
        for i in 0..50 {
            cache.insert(0, key(i), block(i as u64));
        }
        let cached = (0..50).filter(|i| cache.get(0, key(*i)).is_some()).count();
        assert!(cached <= 4);
        // The most recent insert always survives.
        assert!(cache.get(0, key(49)).is_some());
    }

    #[test]
    fn test_frequent_blocks_survive() {
        let mut cache = BlockCache::new(4 * 64, 64);
        cache.insert(0, key(0), block(0));
        for _ in 0..3 {
            cache.get(0, key(0));
        }
        for i in 1..20 {
            cache.insert(0, key(i), block(i as u64));
        }
        assert!(cache.get(0, key(0)).is_some(), "hot block was evicted");
    }

    #[test]
    fn test_remove_invalidates() {
        let mut cache = BlockCache::new(1024, 64);
        cache.insert(0, key(1), block(1));
        cache.remove(0, key(1));
        assert!(cache.get(0, key(1)).is_none());
    }

    #[test]
    fn test_minimum_capacity() {
        // A budget smaller than one block still caches one block.
        let mut cache = BlockCache::new(1, 64);
        cache.insert(0, key(1), block(1));
        assert!(cache.get(0, key(1)).is_some());
    }
}
