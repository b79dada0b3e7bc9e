//! Version-aware supervoxel→label equivalence maps.
//!
//! Each instance keeps one [`SvMap`] mapping supervoxels to their aggregated
//! label per version. Versions are aliased to one-byte short ids so a
//! supervoxel's history packs into 9-byte records; lookups walk the
//! version's ancestry and return the first record found. Every mutation is
//! appended to the durable mapping log before the in-memory map changes.

pub mod log;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::encoding::keycode::{forward_map_tkey, inverse_map_tkey};
use crate::encoding::InstanceId;
use crate::error::{Error, Result};
use crate::store::KvStore;
use crate::version::{AncestryProvider, VersionId};

pub use log::{MappingLog, MappingOp};

const VMAP_ENTRY_SIZE: usize = 9;

/// Packed per-supervoxel mapping history: 9-byte records of a short version
/// id followed by the mapped label, little-endian, in insertion order.
/// There is at most one record per short id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Vmap(Vec<u8>);

impl Vmap {
    /// The mapping visible from the given short-id ancestry, leaf first.
    fn value(&self, ancestry: &[u8]) -> Option<u64> {
        if self.0.is_empty() {
            return None;
        }
        for vid in ancestry {
            for rec in self.0.chunks_exact(VMAP_ENTRY_SIZE) {
                if rec[0] == *vid {
                    return Some(LittleEndian::read_u64(&rec[1..9]));
                }
            }
        }
        None
    }

    /// Overwrites the record for a short id, or appends a new one.
    fn modify(&mut self, vid: u8, label: u64) {
        for rec in self.0.chunks_exact_mut(VMAP_ENTRY_SIZE) {
            if rec[0] == vid {
                LittleEndian::write_u64(&mut rec[1..9], label);
                return;
            }
        }
        let mut rec = [0u8; VMAP_ENTRY_SIZE];
        rec[0] = vid;
        LittleEndian::write_u64(&mut rec[1..9], label);
        self.0.extend_from_slice(&rec);
    }

    fn num_records(&self) -> usize {
        self.0.len() / VMAP_ENTRY_SIZE
    }
}

/// Cleave of a set of supervoxels out of a body into a new label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleaveOp {
    pub mut_id: u64,
    pub target: u64,
    pub cleaved_label: u64,
    pub cleaved_supervoxels: Vec<u64>,
}

/// Split of one supervoxel into a split-off and a remainder id, both
/// inheriting the original's mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSupervoxelOp {
    pub mut_id: u64,
    pub supervoxel: u64,
    pub split_supervoxel: u64,
    pub remain_supervoxel: u64,
}

struct Mappings {
    fm: HashMap<u64, Vmap>,
    versions: HashMap<VersionId, u8>,
    versions_rev: HashMap<u8, VersionId>,
    num_versions: u8,
    loaded: HashSet<VersionId>,
}

/// A version-aware supervoxel map for one instance, allowing up to 256
/// short version ids for the lifetime of the process.
pub struct SvMap {
    dag: Arc<dyn AncestryProvider>,
    log: MappingLog,
    persist: Option<(KvStore, InstanceId)>,
    inner: RwLock<Mappings>,
    // Cached short-id chains per queried leaf. Ancestors are immutable, so
    // entries only go stale when a new short id is allocated; allocation
    // clears the whole cache.
    ancestry_cache: Mutex<HashMap<VersionId, Vec<u8>>>,
}

impl SvMap {
    pub fn open(dir: impl Into<PathBuf>, dag: Arc<dyn AncestryProvider>) -> Result<Self> {
        Ok(Self {
            dag,
            log: MappingLog::open(dir)?,
            persist: None,
            inner: RwLock::new(Mappings {
                fm: HashMap::new(),
                versions: HashMap::new(),
                versions_rev: HashMap::new(),
                num_versions: 0,
                loaded: HashSet::new(),
            }),
            ancestry_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Like `open`, but also writes forward/inverse mapping records through
    /// to the given store on every mutation.
    pub fn open_with_store(
        dir: impl Into<PathBuf>,
        dag: Arc<dyn AncestryProvider>,
        store: KvStore,
        instance: InstanceId,
    ) -> Result<Self> {
        let mut svmap = Self::open(dir, dag)?;
        svmap.persist = Some((store, instance));
        Ok(svmap)
    }

    /// Replays mapping logs for every not-yet-loaded ancestor of `v`, root
    /// toward leaf. Replay order matters within a version because later ops
    /// overwrite earlier records.
    pub fn init_to_version(&self, v: VersionId) -> Result<()> {
        let chain = self.dag.ancestry(v)?;
        let mut m = self.inner.write().unwrap();
        for ancestor in chain.iter().rev() {
            if m.loaded.contains(ancestor) {
                continue;
            }
            // Read the whole log first so a corrupt one leaves the map
            // untouched for a later retry.
            let ops = self.log.read(*ancestor)?;
            if ops.is_empty() {
                m.loaded.insert(*ancestor);
                continue;
            }
            let vid = self.create_short_version(&mut m, *ancestor)?;
            for op in &ops {
                for supervoxel in &op.originals {
                    m.fm.entry(*supervoxel).or_default().modify(vid, op.mapped);
                }
            }
            m.loaded.insert(*ancestor);
            debug!(version = *ancestor, ops = ops.len(), "replayed mapping log");
        }
        Ok(())
    }

    /// Sets the mapping for a supervoxel at a version.
    pub fn map_supervoxel(&self, v: VersionId, supervoxel: u64, label: u64) -> Result<()> {
        if label == 0 {
            return Err(Error::BadRequest(
                "label 0 is protected background value and cannot be used".into(),
            ));
        }
        self.mutate(
            v,
            MappingOp {
                mut_id: 0,
                mapped: label,
                originals: BTreeSet::from([supervoxel]),
            },
        )
    }

    /// Resolves a supervoxel's mapped label at a version. Returns
    /// `(supervoxel, false)` when no record is visible in the ancestry:
    /// an unmapped supervoxel maps to itself.
    pub fn mapped_label(&self, v: VersionId, supervoxel: u64) -> Result<(u64, bool)> {
        let m = self.inner.read().unwrap();
        let Some(vm) = m.fm.get(&supervoxel) else {
            return Ok((supervoxel, false));
        };
        let ancestry = self.short_ancestry(&m, v)?;
        Ok(match vm.value(&ancestry) {
            Some(label) => (label, true),
            None => (supervoxel, false),
        })
    }

    /// Batched forward resolution; unknown supervoxels pass through.
    pub fn get_mapped_labels(&self, v: VersionId, supervoxels: &[u64]) -> Result<Vec<u64>> {
        let m = self.inner.read().unwrap();
        if m.fm.is_empty() {
            return Ok(supervoxels.to_vec());
        }
        let ancestry = self.short_ancestry(&m, v)?;
        Ok(supervoxels
            .iter()
            .map(|sv| {
                m.fm
                    .get(sv)
                    .and_then(|vm| vm.value(&ancestry))
                    .unwrap_or(*sv)
            })
            .collect())
    }

    /// All supervoxels mapped to `label` at a version. A supervoxel with no
    /// visible record resolves to itself, so an id known to the map but
    /// never remapped belongs to its own label's set. Labels the map has
    /// never seen yield an empty set.
    pub fn get_supervoxels(&self, v: VersionId, label: u64) -> Result<BTreeSet<u64>> {
        let m = self.inner.read().unwrap();
        if m.fm.is_empty() {
            return Ok(BTreeSet::new());
        }
        let ancestry = self.short_ancestry(&m, v)?;
        let mut set = BTreeSet::new();
        for (supervoxel, vm) in &m.fm {
            let resolved = vm.value(&ancestry).unwrap_or(*supervoxel);
            if resolved == label {
                set.insert(*supervoxel);
            }
        }
        Ok(set)
    }

    /// Applies a batch of mapping ops under one write-lock acquisition,
    /// appending each to the log.
    pub fn ingest_mappings(&self, v: VersionId, ops: &[MappingOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        for op in ops {
            if op.originals.contains(&0) {
                return Err(Error::BadRequest(
                    "supervoxel 0 is reserved and cannot be mapped".into(),
                ));
            }
        }
        let mut m = self.inner.write().unwrap();
        let vid = self.create_short_version(&mut m, v)?;
        for op in ops {
            self.log.append(v, op)?;
            for supervoxel in &op.originals {
                m.fm.entry(*supervoxel).or_default().modify(vid, op.mapped);
            }
        }
        drop(m);
        for op in ops {
            self.persist_op(v, op)?;
        }
        Ok(())
    }

    /// Records a merge: every supervoxel of the merged bodies maps to
    /// `to_label` at this version.
    pub fn add_merge(
        &self,
        v: VersionId,
        mut_id: u64,
        to_label: u64,
        merge_supervoxels: &BTreeSet<u64>,
    ) -> Result<()> {
        if merge_supervoxels.is_empty() {
            return Ok(());
        }
        debug!(version = v, to_label, count = merge_supervoxels.len(), "merge mapping");
        self.mutate(
            v,
            MappingOp {
                mut_id,
                mapped: to_label,
                originals: merge_supervoxels.clone(),
            },
        )
    }

    /// Records a cleave: the cleaved supervoxels map to the cleaved label.
    pub fn add_cleave(&self, v: VersionId, op: &CleaveOp) -> Result<()> {
        if op.cleaved_supervoxels.is_empty() {
            return Ok(());
        }
        debug!(
            version = v,
            target = op.target,
            cleaved = op.cleaved_label,
            count = op.cleaved_supervoxels.len(),
            "cleave mapping"
        );
        self.mutate(
            v,
            MappingOp {
                mut_id: op.mut_id,
                mapped: op.cleaved_label,
                originals: op.cleaved_supervoxels.iter().copied().collect(),
            },
        )
    }

    /// Records a supervoxel split: both halves inherit the original's
    /// current mapping.
    pub fn add_supervoxel_split(&self, v: VersionId, op: &SplitSupervoxelOp) -> Result<()> {
        let (target, _) = self.mapped_label(v, op.supervoxel)?;
        self.mutate(
            v,
            MappingOp {
                mut_id: op.mut_id,
                mapped: target,
                originals: BTreeSet::from([op.split_supervoxel, op.remain_supervoxel]),
            },
        )
    }

    /// True if the version's ancestry carries any mappings.
    pub fn exists(&self, v: VersionId) -> Result<bool> {
        let m = self.inner.read().unwrap();
        if m.fm.is_empty() {
            return Ok(false);
        }
        Ok(!self.short_ancestry(&m, v)?.is_empty())
    }

    /// Number of versions holding a short id.
    pub fn num_versions(&self) -> usize {
        self.inner.read().unwrap().num_versions as usize
    }

    // The single mutation discipline: the write lock is held across the log
    // append and the in-memory update, and the append happens first, so the
    // log is never behind the observable map.
    fn mutate(&self, v: VersionId, op: MappingOp) -> Result<()> {
        if op.originals.contains(&0) {
            return Err(Error::BadRequest(
                "supervoxel 0 is reserved and cannot be mapped".into(),
            ));
        }
        if op.originals.is_empty() {
            return Ok(());
        }
        let mut m = self.inner.write().unwrap();
        let vid = self.create_short_version(&mut m, v)?;
        self.log.append(v, &op)?;
        for supervoxel in &op.originals {
            m.fm.entry(*supervoxel).or_default().modify(vid, op.mapped);
        }
        drop(m);
        self.persist_op(v, &op)
    }

    fn persist_op(&self, v: VersionId, op: &MappingOp) -> Result<()> {
        let Some((store, instance)) = &self.persist else {
            return Ok(());
        };
        let mut batch = store.batch();
        for supervoxel in &op.originals {
            batch.put(
                crate::encoding::keycode::construct_key(
                    *instance,
                    &forward_map_tkey(*supervoxel, op.mapped),
                    v,
                ),
                vec![],
            );
            batch.put(
                crate::encoding::keycode::construct_key(
                    *instance,
                    &inverse_map_tkey(op.mapped, *supervoxel),
                    v,
                ),
                vec![],
            );
        }
        batch.commit()
    }

    fn create_short_version(&self, m: &mut Mappings, v: VersionId) -> Result<u8> {
        if let Some(&vid) = m.versions.get(&v) {
            return Ok(vid);
        }
        if m.num_versions == u8::MAX {
            return Err(Error::VersionLimit);
        }
        let vid = m.num_versions;
        m.versions.insert(v, vid);
        m.versions_rev.insert(vid, v);
        m.num_versions += 1;
        // New allocation may extend any cached chain.
        self.ancestry_cache.lock().unwrap().clear();
        Ok(vid)
    }

    /// Short-id chain for a version, leaf→root, restricted to versions that
    /// actually carry mappings.
    fn short_ancestry(&self, m: &Mappings, v: VersionId) -> Result<Vec<u8>> {
        if let Some(ids) = self.ancestry_cache.lock().unwrap().get(&v) {
            return Ok(ids.clone());
        }
        let chain = self.dag.ancestry(v)?;
        let ids: Vec<u8> = chain
            .iter()
            .filter_map(|ancestor| m.versions.get(ancestor).copied())
            .collect();
        self.ancestry_cache.lock().unwrap().insert(v, ids.clone());
        Ok(ids)
    }
}
