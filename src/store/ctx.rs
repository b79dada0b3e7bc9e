use std::time::SystemTime;

use super::{Batch, KvStore};
use crate::encoding::keycode::{
    construct_key, max_version_key, min_version_key, tkey_from_key, tombstone_key,
    versioned_key_value, InstanceId,
};
use crate::error::Result;
use crate::version::{AncestryProvider, VersionId};

/// A store handle bound to one data instance at one version.
///
/// Reads resolve the most-recent-visible record along the version's
/// ancestry; writes land at the bound version and deletes leave a tombstone
/// so descendants stop seeing ancestor data. The ancestry is resolved once
/// at construction, which is sound because ancestors are immutable.
pub struct VersionedCtx {
    store: KvStore,
    instance: InstanceId,
    version: VersionId,
    ancestry: Vec<VersionId>,
}

impl VersionedCtx {
    pub fn new(
        store: KvStore,
        instance: InstanceId,
        version: VersionId,
        dag: &dyn AncestryProvider,
    ) -> Result<Self> {
        let ancestry = dag.ancestry(version)?;
        Ok(Self {
            store,
            instance,
            version,
            ancestry,
        })
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Most-recent-visible value for a type key, or None.
    pub fn get(&self, tk: &[u8]) -> Result<Option<Vec<u8>>> {
        let rows = self.version_rows(tk)?;
        Ok(versioned_key_value(&rows, &self.ancestry)?.map(|i| rows[i].1.clone()))
    }

    /// Like `get`, but reports the record's modification time when the
    /// backend can provide one; falls back to the current time otherwise.
    pub fn get_with_timestamp(&self, tk: &[u8]) -> Result<Option<(Vec<u8>, SystemTime)>> {
        let rows = self.version_rows(tk)?;
        let Some(i) = versioned_key_value(&rows, &self.ancestry)? else {
            return Ok(None);
        };
        if let Some(getter) = self.store.timestamped() {
            if let Some(found) = getter.get_with_timestamp(&rows[i].0)? {
                return Ok(Some(found));
            }
        }
        Ok(Some((rows[i].1.clone(), SystemTime::now())))
    }

    pub fn put(&self, tk: &[u8], value: Vec<u8>) -> Result<()> {
        // Clear any same-version tombstone so the write is visible.
        self.store
            .delete(&tombstone_key(self.instance, tk, self.version))?;
        self.store
            .put(&construct_key(self.instance, tk, self.version), value)
    }

    pub fn delete(&self, tk: &[u8]) -> Result<()> {
        self.store
            .delete(&construct_key(self.instance, tk, self.version))?;
        self.store
            .put(&tombstone_key(self.instance, tk, self.version), vec![])
    }

    /// Resolved (type key, value) pairs across a type-key range, in key
    /// order. Type keys within one scan must be fixed-length so that all
    /// versions of a type key are adjacent in the raw scan.
    pub fn scan(&self, lo_tk: &[u8], hi_tk: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let lo = min_version_key(self.instance, lo_tk);
        let hi = max_version_key(self.instance, hi_tk);
        let mut out = Vec::new();
        let mut group: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut group_tk: Vec<u8> = Vec::new();
        for kv in self.store.scan(&lo, &hi)? {
            let (key, value) = kv?;
            let tk = tkey_from_key(&key)?.to_vec();
            if tk != group_tk && !group.is_empty() {
                if let Some(i) = versioned_key_value(&group, &self.ancestry)? {
                    out.push((group_tk.clone(), std::mem::take(&mut group[i].1)));
                }
                group.clear();
            }
            group_tk = tk;
            group.push((key, value));
        }
        if !group.is_empty() {
            if let Some(i) = versioned_key_value(&group, &self.ancestry)? {
                out.push((group_tk, std::mem::take(&mut group[i].1)));
            }
        }
        Ok(out)
    }

    /// Type keys with a visible, non-tombstoned record in the range.
    pub fn keys_in_range(&self, lo_tk: &[u8], hi_tk: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.scan(lo_tk, hi_tk)?.into_iter().map(|(tk, _)| tk).collect())
    }

    /// A batched writer bound to this context's instance and version.
    pub fn batch(&self) -> CtxBatch {
        CtxBatch {
            inner: self.store.batch(),
            instance: self.instance,
            version: self.version,
            pending: 0,
        }
    }

    // All stored rows for one type key, across versions and tombstones.
    fn version_rows(&self, tk: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let lo = min_version_key(self.instance, tk);
        let hi = max_version_key(self.instance, tk);
        self.store.scan(&lo, &hi)?.collect()
    }
}

/// Batched writes at a fixed instance and version. Single-threaded; each
/// worker that writes batches allocates its own.
pub struct CtxBatch {
    inner: Box<dyn Batch>,
    instance: InstanceId,
    version: VersionId,
    pending: usize,
}

impl CtxBatch {
    pub fn put(&mut self, tk: &[u8], value: Vec<u8>) {
        self.inner
            .delete(tombstone_key(self.instance, tk, self.version));
        self.inner
            .put(construct_key(self.instance, tk, self.version), value);
        self.pending += 1;
    }

    pub fn delete(&mut self, tk: &[u8]) {
        self.inner
            .delete(construct_key(self.instance, tk, self.version));
        self.inner
            .put(tombstone_key(self.instance, tk, self.version), vec![]);
        self.pending += 1;
    }

    /// Number of buffered puts and deletes.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn commit(self) -> Result<()> {
        self.inner.commit()
    }
}
