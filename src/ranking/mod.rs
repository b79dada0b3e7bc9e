//! Per-label element-count ranking.
//!
//! Annotation elements (pre/postsynaptic points) are stored per block and
//! tallied against the label of the voxel they sit on. Counts live in two
//! key families: a point-lookup tally per (kind, label), and a ranking
//! family keyed `kind · count · label` so ordered scans answer top-N and
//! threshold queries. Merges fold counts; splits re-attribute the elements
//! inside the split region.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::denorm::mutate::clip_runs_to_blocks;
use crate::encoding::keycode::{element_count_tkey, element_count_tkey_parse, element_tally_tkey, elements_tkey};
use crate::encoding::rle::{contains, Run};
use crate::encoding::IndexZYX;
use crate::error::{Error, Result};
use crate::store::VersionedCtx;
use crate::svmap::SvMap;
use crate::version::VersionId;
use crate::volume::Volume;

const ELEMENT_SIZE: usize = 13;

const KIND_ALL: u8 = 0;
const KIND_PRE: u8 = 1;
const KIND_POST: u8 = 2;

/// Kind of a stored annotation element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    PreSyn,
    PostSyn,
}

impl ElementKind {
    fn code(self) -> u8 {
        match self {
            ElementKind::PreSyn => KIND_PRE,
            ElementKind::PostSyn => KIND_POST,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            KIND_PRE => Ok(ElementKind::PreSyn),
            KIND_POST => Ok(ElementKind::PostSyn),
            other => Err(Error::Corrupt(format!("unknown element kind {other}"))),
        }
    }
}

/// Kind selector for count queries; AllSyn aggregates both element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    AllSyn,
    PreSyn,
    PostSyn,
}

impl CountKind {
    fn code(self) -> u8 {
        match self {
            CountKind::AllSyn => KIND_ALL,
            CountKind::PreSyn => KIND_PRE,
            CountKind::PostSyn => KIND_POST,
        }
    }
}

/// A point annotation at an absolute voxel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub kind: ElementKind,
}

/// One ranking entry. Serializes as `{"Label": .., "Size": ..}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSize {
    #[serde(rename = "Label")]
    pub label: u64,
    #[serde(rename = "Size")]
    pub size: u64,
}

/// Maintains element counts per label for one label-volume instance.
pub struct ElementRanking {
    volume: Arc<Volume>,
    svmap: Arc<SvMap>,
}

impl ElementRanking {
    pub fn new(volume: Arc<Volume>, svmap: Arc<SvMap>) -> Self {
        Self { volume, svmap }
    }

    /// Stores elements and credits each to the label under its position.
    /// Elements on background or outside the stored volume are kept but
    /// not counted.
    pub fn post_elements(&self, v: VersionId, elements: &[Element]) -> Result<()> {
        let bs = self.volume.config().block_size;
        let ctx = self.volume.ctx(v)?;

        let mut by_block: BTreeMap<IndexZYX, Vec<Element>> = BTreeMap::new();
        for element in elements {
            let zyx = IndexZYX::of_voxel(element.x, element.y, element.z, bs);
            by_block.entry(zyx).or_default().push(*element);
        }
        let mut deltas: HashMap<(u64, u8), i64> = HashMap::new();
        for (zyx, new_elements) in by_block {
            let mut list = match ctx.get(&elements_tkey(zyx))? {
                Some(buf) => decode_elements(&buf)?,
                None => Vec::new(),
            };
            for element in &new_elements {
                if let Some(label) = self.label_at(v, element.x, element.y, element.z)? {
                    *deltas.entry((label, element.kind.code())).or_default() += 1;
                    *deltas.entry((label, KIND_ALL)).or_default() += 1;
                }
            }
            list.extend(new_elements);
            ctx.put(&elements_tkey(zyx), encode_elements(&list))?;
        }
        self.apply_deltas(&ctx, deltas)?;
        debug!(version = v, count = elements.len(), "posted elements");
        Ok(())
    }

    /// Moves one element; its count follows the label at the destination.
    pub fn move_element(
        &self,
        v: VersionId,
        from: (i32, i32, i32),
        to: (i32, i32, i32),
    ) -> Result<()> {
        let ctx = self.volume.ctx(v)?;
        let kind = self.remove_stored_element(&ctx, from)?;

        let mut deltas: HashMap<(u64, u8), i64> = HashMap::new();
        if let Some(label) = self.label_at(v, from.0, from.1, from.2)? {
            *deltas.entry((label, kind.code())).or_default() -= 1;
            *deltas.entry((label, KIND_ALL)).or_default() -= 1;
        }

        let bs = self.volume.config().block_size;
        let zyx = IndexZYX::of_voxel(to.0, to.1, to.2, bs);
        let mut list = match ctx.get(&elements_tkey(zyx))? {
            Some(buf) => decode_elements(&buf)?,
            None => Vec::new(),
        };
        list.push(Element {
            x: to.0,
            y: to.1,
            z: to.2,
            kind,
        });
        ctx.put(&elements_tkey(zyx), encode_elements(&list))?;
        if let Some(label) = self.label_at(v, to.0, to.1, to.2)? {
            *deltas.entry((label, kind.code())).or_default() += 1;
            *deltas.entry((label, KIND_ALL)).or_default() += 1;
        }
        self.apply_deltas(&ctx, deltas)
    }

    /// Deletes the element at a position and uncounts it.
    pub fn delete_element(&self, v: VersionId, pos: (i32, i32, i32)) -> Result<()> {
        let ctx = self.volume.ctx(v)?;
        let kind = self.remove_stored_element(&ctx, pos)?;
        let mut deltas: HashMap<(u64, u8), i64> = HashMap::new();
        if let Some(label) = self.label_at(v, pos.0, pos.1, pos.2)? {
            *deltas.entry((label, kind.code())).or_default() -= 1;
            *deltas.entry((label, KIND_ALL)).or_default() -= 1;
        }
        self.apply_deltas(&ctx, deltas)
    }

    /// Top `n` labels by element count, largest first, ties by ascending
    /// label.
    pub fn top_n(&self, v: VersionId, kind: CountKind, n: usize) -> Result<Vec<LabelSize>> {
        let mut all = self.ranked(v, kind, 0)?;
        all.truncate(n);
        Ok(all)
    }

    /// Labels with at least `min_size` elements, largest first, with
    /// offset/limit paging.
    pub fn threshold(
        &self,
        v: VersionId,
        kind: CountKind,
        min_size: u64,
        offset: usize,
        n: Option<usize>,
    ) -> Result<Vec<LabelSize>> {
        let ranked = self.ranked(v, kind, min_size)?;
        let mut page: Vec<LabelSize> = ranked.into_iter().skip(offset).collect();
        if let Some(n) = n {
            page.truncate(n);
        }
        Ok(page)
    }

    /// Folds source label counts into the merge target.
    pub fn on_merge(&self, v: VersionId, to_label: u64, from_labels: &[u64]) -> Result<()> {
        let ctx = self.volume.ctx(v)?;
        for code in [KIND_ALL, KIND_PRE, KIND_POST] {
            let mut total = read_tally(&ctx, code, to_label)?;
            for label in from_labels {
                let count = read_tally(&ctx, code, *label)?;
                total += count;
                write_tally(&ctx, code, *label, count, 0)?;
            }
            write_tally(&ctx, code, to_label, read_tally(&ctx, code, to_label)?, total)?;
        }
        Ok(())
    }

    /// Re-attributes elements covered by a voxel-space split region from
    /// the original label to the new one. Call after the split has
    /// rewritten the region's voxels.
    pub fn on_split(
        &self,
        v: VersionId,
        orig_label: u64,
        new_label: u64,
        region: &[Run],
    ) -> Result<()> {
        let bs = self.volume.config().block_size;
        let blocks: Vec<IndexZYX> = clip_runs_to_blocks(region, bs).into_keys().collect();
        self.reattribute(v, orig_label, new_label, &blocks, Some(region))
    }

    /// Re-attributes elements in whole blocks moved by a coarse split.
    pub fn on_split_coarse(
        &self,
        v: VersionId,
        orig_label: u64,
        new_label: u64,
        blocks: &[IndexZYX],
    ) -> Result<()> {
        self.reattribute(v, orig_label, new_label, blocks, None)
    }

    fn reattribute(
        &self,
        v: VersionId,
        orig_label: u64,
        new_label: u64,
        blocks: &[IndexZYX],
        region: Option<&[Run]>,
    ) -> Result<()> {
        let ctx = self.volume.ctx(v)?;
        let mut moved: HashMap<u8, i64> = HashMap::new();
        for zyx in blocks {
            let Some(buf) = ctx.get(&elements_tkey(*zyx))? else {
                continue;
            };
            for element in decode_elements(&buf)? {
                if let Some(runs) = region {
                    if !contains(runs, element.x, element.y, element.z) {
                        continue;
                    }
                }
                if self.label_at(v, element.x, element.y, element.z)? == Some(new_label) {
                    *moved.entry(element.kind.code()).or_default() += 1;
                    *moved.entry(KIND_ALL).or_default() += 1;
                }
            }
        }
        let mut deltas: HashMap<(u64, u8), i64> = HashMap::new();
        for (code, count) in moved {
            deltas.insert((orig_label, code), -count);
            deltas.insert((new_label, code), count);
        }
        self.apply_deltas(&ctx, deltas)
    }

    // Label under a voxel: None for background or positions outside the
    // stored volume.
    fn label_at(&self, v: VersionId, x: i32, y: i32, z: i32) -> Result<Option<u64>> {
        match self.volume.get_label_at_point(v, x, y, z, &self.svmap) {
            Ok(0) => Ok(None),
            Ok(label) => Ok(Some(label)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove_stored_element(&self, ctx: &VersionedCtx, pos: (i32, i32, i32)) -> Result<ElementKind> {
        let bs = self.volume.config().block_size;
        let zyx = IndexZYX::of_voxel(pos.0, pos.1, pos.2, bs);
        let Some(buf) = ctx.get(&elements_tkey(zyx))? else {
            return Err(Error::NotFound);
        };
        let mut list = decode_elements(&buf)?;
        let idx = list
            .iter()
            .position(|e| (e.x, e.y, e.z) == pos)
            .ok_or(Error::NotFound)?;
        let removed = list.remove(idx);
        if list.is_empty() {
            ctx.delete(&elements_tkey(zyx))?;
        } else {
            ctx.put(&elements_tkey(zyx), encode_elements(&list))?;
        }
        Ok(removed.kind)
    }

    fn ranked(&self, v: VersionId, kind: CountKind, min_size: u64) -> Result<Vec<LabelSize>> {
        let ctx = self.volume.ctx(v)?;
        let code = kind.code();
        let rows = ctx.scan(
            &element_count_tkey(code, min_size, 0),
            &element_count_tkey(code, u64::MAX, u64::MAX),
        )?;
        let mut entries = Vec::with_capacity(rows.len());
        for (tk, _) in rows {
            let (_, count, label) = element_count_tkey_parse(&tk)?;
            entries.push(LabelSize { label, size: count });
        }
        // Largest first, ties broken by ascending label.
        entries.sort_by(|a, b| b.size.cmp(&a.size).then(a.label.cmp(&b.label)));
        Ok(entries)
    }

    fn apply_deltas(&self, ctx: &VersionedCtx, deltas: HashMap<(u64, u8), i64>) -> Result<()> {
        for ((label, code), delta) in deltas {
            if delta == 0 {
                continue;
            }
            let old = read_tally(ctx, code, label)?;
            let new = (old as i64 + delta).max(0) as u64;
            write_tally(ctx, code, label, old, new)?;
        }
        Ok(())
    }
}

fn read_tally(ctx: &VersionedCtx, code: u8, label: u64) -> Result<u64> {
    match ctx.get(&element_tally_tkey(code, label))? {
        Some(buf) if buf.len() == 8 => Ok(LittleEndian::read_u64(&buf)),
        Some(buf) => Err(Error::Corrupt(format!("bad tally value length {}", buf.len()))),
        None => Ok(0),
    }
}

// Moves a label's tally from `old` to `new`, keeping the ranking family in
// step. A zero `new` removes the label from both families.
fn write_tally(ctx: &VersionedCtx, code: u8, label: u64, old: u64, new: u64) -> Result<()> {
    if old == new {
        return Ok(());
    }
    if old > 0 {
        ctx.delete(&element_count_tkey(code, old, label))?;
    }
    if new > 0 {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, new);
        ctx.put(&element_tally_tkey(code, label), buf.to_vec())?;
        ctx.put(&element_count_tkey(code, new, label), vec![])?;
    } else {
        ctx.delete(&element_tally_tkey(code, label))?;
    }
    Ok(())
}

fn encode_elements(elements: &[Element]) -> Vec<u8> {
    let mut buf = vec![0u8; elements.len() * ELEMENT_SIZE];
    for (i, element) in elements.iter().enumerate() {
        let rec = &mut buf[i * ELEMENT_SIZE..(i + 1) * ELEMENT_SIZE];
        LittleEndian::write_i32(&mut rec[0..4], element.x);
        LittleEndian::write_i32(&mut rec[4..8], element.y);
        LittleEndian::write_i32(&mut rec[8..12], element.z);
        rec[12] = element.kind.code();
    }
    buf
}

fn decode_elements(buf: &[u8]) -> Result<Vec<Element>> {
    if buf.len() % ELEMENT_SIZE != 0 {
        return Err(Error::Corrupt(format!(
            "element list has invalid length {}",
            buf.len()
        )));
    }
    let mut elements = Vec::with_capacity(buf.len() / ELEMENT_SIZE);
    for rec in buf.chunks_exact(ELEMENT_SIZE) {
        elements.push(Element {
            x: LittleEndian::read_i32(&rec[0..4]),
            y: LittleEndian::read_i32(&rec[4..8]),
            z: LittleEndian::read_i32(&rec[8..12]),
            kind: ElementKind::from_code(rec[12])?,
        });
    }
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::denorm::SpatialIndexer;
    use crate::encoding::rle::encode_sparse_vol;
    use crate::encoding::InstanceId;
    use crate::store::{KvStore, MemoryStore};
    use crate::version::VersionDag;
    use tempfile::TempDir;

    struct Fixture {
        dag: Arc<VersionDag>,
        indexer: SpatialIndexer,
        ranking: ElementRanking,
        _dir: TempDir,
    }

    fn fixture(block_size: i32) -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let dag = Arc::new(VersionDag::new());
        let store: KvStore = Arc::new(MemoryStore::new());
        let config = Config::new(dir.path()).block_size(block_size);
        let volume = Arc::new(Volume::new(store, InstanceId(1), dag.clone(), config));
        let svmap = Arc::new(SvMap::open(dir.path().join("mapping"), dag.clone()).unwrap());
        Fixture {
            dag,
            indexer: SpatialIndexer::new(Arc::clone(&volume), Arc::clone(&svmap)),
            ranking: ElementRanking::new(volume, svmap),
            _dir: dir,
        }
    }

    fn ls(label: u64, size: u64) -> LabelSize {
        LabelSize { label, size }
    }

    #[test]
    fn test_element_roundtrip() {
        let elements = vec![
            Element { x: 1, y: 2, z: 3, kind: ElementKind::PreSyn },
            Element { x: -4, y: 0, z: 127, kind: ElementKind::PostSyn },
        ];
        let buf = encode_elements(&elements);
        assert_eq!(buf.len(), 2 * ELEMENT_SIZE);
        assert_eq!(decode_elements(&buf).unwrap(), elements);
        assert!(decode_elements(&buf[..12]).is_err());
    }

    #[tokio::test]
    async fn test_counts_and_moves_small() {
        let f = fixture(4);
        let v = f.dag.root();
        let volume = f.indexer.volume();
        // Two labels side by side in one 8x4x4 volume.
        let mut buf = vec![0u64; 8 * 4 * 4];
        crate::denorm::tests::paint(&mut buf, 8, 4, 1, 0, 0, 0, 4, 4, 4);
        crate::denorm::tests::paint(&mut buf, 8, 4, 2, 4, 0, 0, 4, 4, 4);
        volume.put_dense_volume(v, 8, 4, 4, &buf).unwrap();

        f.ranking
            .post_elements(
                v,
                &[
                    Element { x: 0, y: 0, z: 0, kind: ElementKind::PreSyn },
                    Element { x: 1, y: 1, z: 1, kind: ElementKind::PreSyn },
                    Element { x: 5, y: 0, z: 0, kind: ElementKind::PostSyn },
                ],
            )
            .unwrap();

        assert_eq!(f.ranking.top_n(v, CountKind::PreSyn, 5).unwrap(), vec![ls(1, 2)]);
        assert_eq!(f.ranking.top_n(v, CountKind::PostSyn, 5).unwrap(), vec![ls(2, 1)]);
        assert_eq!(
            f.ranking.top_n(v, CountKind::AllSyn, 5).unwrap(),
            vec![ls(1, 2), ls(2, 1)]
        );

        // Moving an element across labels moves its count.
        f.ranking.move_element(v, (1, 1, 1), (6, 1, 1)).unwrap();
        assert_eq!(f.ranking.top_n(v, CountKind::PreSyn, 5).unwrap(), vec![ls(1, 1), ls(2, 1)]);

        // Deleting removes the count.
        f.ranking.delete_element(v, (6, 1, 1)).unwrap();
        assert_eq!(f.ranking.top_n(v, CountKind::PreSyn, 5).unwrap(), vec![ls(1, 1)]);

        // Deleting a nonexistent element is NotFound.
        assert_eq!(f.ranking.delete_element(v, (7, 3, 3)), Err(Error::NotFound));
    }

    /// The connectomics testbed: a 128³ volume with three bodies, a grid of
    /// postsynaptic points at multiples of 4 and presynaptic points offset
    /// by 2, then a merge, a sparse-volume split, and a coarse split.
    #[tokio::test]
    async fn test_label_ranking_through_mutations() {
        let f = fixture(32);
        let v = f.dag.root();
        let volume = f.indexer.volume();

        // Label 100: x [0,64). Label 200: x [64,128), z [0,64).
        // Label 300: x [64,128), z [64,128).
        let (nx, ny, nz) = (128, 128, 128);
        let mut buf = vec![0u64; (nx * ny * nz) as usize];
        crate::denorm::tests::paint(&mut buf, nx, ny, 100, 0, 0, 0, 64, 128, 128);
        crate::denorm::tests::paint(&mut buf, nx, ny, 200, 64, 0, 0, 64, 128, 64);
        crate::denorm::tests::paint(&mut buf, nx, ny, 300, 64, 0, 64, 64, 128, 64);
        volume.put_dense_volume(v, nx, ny, nz, &buf).unwrap();
        f.indexer.process_spatially(v).await.unwrap();

        // 31³ = 29,791 PostSyn on the multiples-of-4 grid.
        let mut elements = Vec::new();
        for z in (4..128).step_by(4) {
            for y in (4..128).step_by(4) {
                for x in (4..128).step_by(4) {
                    elements.push(Element { x, y, z, kind: ElementKind::PostSyn });
                }
            }
        }
        // 32³ = 32,768 PreSyn offset by 2.
        for z in (2..128).step_by(4) {
            for y in (2..128).step_by(4) {
                for x in (2..128).step_by(4) {
                    elements.push(Element { x, y, z, kind: ElementKind::PreSyn });
                }
            }
        }
        assert_eq!(elements.len(), 29_791 + 32_768);
        f.ranking.post_elements(v, &elements).unwrap();

        // S1: initial ranking.
        assert_eq!(
            f.ranking.top_n(v, CountKind::PreSyn, 3).unwrap(),
            vec![ls(100, 16384), ls(200, 8192), ls(300, 8192)]
        );
        assert_eq!(
            f.ranking.top_n(v, CountKind::PostSyn, 3).unwrap(),
            vec![ls(100, 14415), ls(300, 7936), ls(200, 7440)]
        );
        assert_eq!(
            f.ranking.top_n(v, CountKind::AllSyn, 3).unwrap(),
            vec![ls(100, 30799), ls(300, 16128), ls(200, 15632)]
        );
        assert_eq!(
            f.ranking
                .threshold(v, CountKind::AllSyn, 15_633, 0, None)
                .unwrap(),
            vec![ls(100, 30799), ls(300, 16128)]
        );
        assert_eq!(
            f.ranking
                .threshold(v, CountKind::AllSyn, 1000, 1, Some(2))
                .unwrap(),
            vec![ls(300, 16128), ls(200, 15632)]
        );

        // Two PostSyn moves into label 300 territory, then their deletion.
        f.ranking.move_element(v, (32, 32, 32), (75, 21, 69)).unwrap();
        f.ranking.move_element(v, (68, 20, 20), (77, 21, 69)).unwrap();
        assert_eq!(
            f.ranking.top_n(v, CountKind::PostSyn, 3).unwrap(),
            vec![ls(100, 14414), ls(300, 7938), ls(200, 7439)]
        );
        f.ranking.delete_element(v, (75, 21, 69)).unwrap();
        f.ranking.delete_element(v, (77, 21, 69)).unwrap();
        assert_eq!(
            f.ranking.top_n(v, CountKind::PostSyn, 3).unwrap(),
            vec![ls(100, 14414), ls(300, 7936), ls(200, 7439)]
        );

        // S2: merge 300 into 200.
        f.indexer.merge(v, 1, 200, &[300]).unwrap();
        f.ranking.on_merge(v, 200, &[300]).unwrap();
        assert_eq!(
            f.ranking.top_n(v, CountKind::PostSyn, 3).unwrap(),
            vec![ls(200, 15375), ls(100, 14414)]
        );
        assert_eq!(
            f.ranking.top_n(v, CountKind::PreSyn, 3).unwrap(),
            vec![ls(100, 16384), ls(200, 16384)]
        );
        assert_eq!(
            f.ranking
                .threshold(v, CountKind::PostSyn, 15_000, 0, None)
                .unwrap(),
            vec![ls(200, 15375)]
        );
        assert_eq!(
            f.ranking
                .threshold(v, CountKind::PostSyn, 0, 1, Some(1))
                .unwrap(),
            vec![ls(100, 14414)]
        );

        // S3: split the [0,19)³ corner of label 100 into new label 150.
        let mut region = Vec::new();
        for z in 0..19 {
            for y in 0..19 {
                region.push(Run::new(0, y, z, 19));
            }
        }
        f.indexer
            .split(v, 2, 100, 150, &encode_sparse_vol(&region))
            .unwrap();
        f.ranking.on_split(v, 100, 150, &region).unwrap();

        assert_eq!(
            f.ranking.top_n(v, CountKind::PreSyn, 3).unwrap(),
            vec![ls(200, 16384), ls(100, 16259), ls(150, 125)]
        );
        assert_eq!(
            f.ranking.top_n(v, CountKind::PostSyn, 3).unwrap(),
            vec![ls(200, 15375), ls(100, 14350), ls(150, 64)]
        );

        // S4: coarse split of blocks (2,3,3)-(3,3,3) from 200 into 250.
        let coarse = encode_sparse_vol(&[Run::new(2, 3, 3, 2)]);
        f.indexer.split_coarse(v, 3, 200, 250, &coarse).unwrap();
        f.ranking
            .on_split_coarse(
                v,
                200,
                250,
                &[IndexZYX::new(2, 3, 3), IndexZYX::new(3, 3, 3)],
            )
            .unwrap();

        assert_eq!(
            f.ranking.top_n(v, CountKind::PreSyn, 5).unwrap(),
            vec![ls(100, 16259), ls(200, 15360), ls(250, 1024), ls(150, 125)]
        );
        assert_eq!(
            f.ranking.top_n(v, CountKind::PostSyn, 5).unwrap(),
            vec![ls(200, 14351), ls(100, 14350), ls(250, 1024), ls(150, 64)]
        );
        assert_eq!(
            f.ranking.top_n(v, CountKind::AllSyn, 5).unwrap(),
            vec![ls(100, 30609), ls(200, 29711), ls(250, 2048), ls(150, 189)]
        );
    }

    #[test]
    fn test_label_size_json_shape() {
        let json = serde_json::to_string(&vec![ls(100, 16384), ls(200, 8192)]).unwrap();
        assert_eq!(json, r#"[{"Label":100,"Size":16384},{"Label":200,"Size":8192}]"#);
    }
}
