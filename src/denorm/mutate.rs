//! Incremental index maintenance for merge, cleave, and split mutations.
//!
//! Each mutator updates the supervoxel mapping (when the mutation changes
//! it), migrates label-spatial records, and rewrites the affected size
//! records. Writes go through batches; a partially applied mutation is
//! reconstructible from the mapping log plus a spatial reprocess.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::info;

use crate::encoding::keycode::{label_sizes_tkey, label_spatial_tkey, label_spatial_tkey_parse};
use crate::encoding::rle::{decode_runs, encode_runs, parse_sparse_vol, subtract, Run};
use crate::encoding::IndexZYX;
use crate::error::{Error, Result};
use crate::store::VersionedCtx;
use crate::svmap::CleaveOp;
use crate::version::VersionId;

use super::SpatialIndexer;

impl SpatialIndexer {
    /// Merges the `from_labels` bodies into `to_label`: their supervoxels
    /// remap, their label-spatial records migrate under the target, and the
    /// size records are rewritten for every label involved.
    pub fn merge(
        &self,
        v: VersionId,
        mut_id: u64,
        to_label: u64,
        from_labels: &[u64],
    ) -> Result<()> {
        if to_label == 0 || from_labels.contains(&0) {
            return Err(Error::BadRequest(
                "label 0 is protected background value and cannot be used".into(),
            ));
        }
        if from_labels.contains(&to_label) {
            return Err(Error::BadRequest(format!(
                "can't merge label {to_label} into itself"
            )));
        }

        let mut merged_supervoxels = BTreeSet::new();
        for label in from_labels {
            merged_supervoxels.insert(*label);
            merged_supervoxels.extend(self.svmap().get_supervoxels(v, *label)?);
        }
        self.svmap().add_merge(v, mut_id, to_label, &merged_supervoxels)?;

        let ctx = self.volume().ctx(v)?;
        let to_old = self.label_size(v, to_label)?;
        let mut from_old = Vec::with_capacity(from_labels.len());
        for label in from_labels {
            from_old.push(self.label_size(v, *label)?);
        }

        // Union each source's records into the target, block by block.
        let mut target_values: BTreeMap<IndexZYX, Vec<u8>> = BTreeMap::new();
        let mut batch = ctx.batch();
        for label in from_labels {
            let rows = ctx.scan(
                &label_spatial_tkey(*label, IndexZYX::MIN),
                &label_spatial_tkey(*label, IndexZYX::MAX),
            )?;
            for (tk, value) in rows {
                let (_, zyx) = label_spatial_tkey_parse(&tk)?;
                if !target_values.contains_key(&zyx) {
                    let existing = ctx
                        .get(&label_spatial_tkey(to_label, zyx))?
                        .unwrap_or_default();
                    target_values.insert(zyx, existing);
                }
                target_values.get_mut(&zyx).unwrap().extend_from_slice(&value);
                batch.delete(&tk);
            }
        }
        for (zyx, value) in target_values {
            batch.put(&label_spatial_tkey(to_label, zyx), value);
        }

        let moved: u64 = from_old.iter().sum();
        delete_size_record(&ctx, &mut batch, to_old, to_label)?;
        for (label, old) in from_labels.iter().zip(&from_old) {
            delete_size_record(&ctx, &mut batch, *old, *label)?;
        }
        if to_old + moved > 0 {
            batch.put(&label_sizes_tkey(to_old + moved, to_label), vec![]);
        }
        batch.commit()?;

        info!(version = v, mut_id, to_label, ?from_labels, "merged labels");
        Ok(())
    }

    /// Cleaves a supervoxel set out of a body into a new label. Touched
    /// blocks are re-read so exactly the cleaved supervoxels' runs migrate.
    pub fn cleave(&self, v: VersionId, op: &CleaveOp) -> Result<()> {
        if op.cleaved_label == 0 || op.target == 0 {
            return Err(Error::BadRequest(
                "label 0 is protected background value and cannot be used".into(),
            ));
        }
        let cleaved_set: BTreeSet<u64> = op.cleaved_supervoxels.iter().copied().collect();
        if cleaved_set.contains(&0) {
            return Err(Error::BadRequest(
                "supervoxel 0 is reserved and cannot be cleaved".into(),
            ));
        }

        self.svmap().add_cleave(v, op)?;

        let ctx = self.volume().ctx(v)?;
        let bs = self.volume().config().block_size;
        let target_old = self.label_size(v, op.target)?;
        let cleaved_old = self.label_size(v, op.cleaved_label)?;

        let rows = ctx.scan(
            &label_spatial_tkey(op.target, IndexZYX::MIN),
            &label_spatial_tkey(op.target, IndexZYX::MAX),
        )?;
        let mut batch = ctx.batch();
        let mut moved = 0u64;
        for (tk, value) in rows {
            let (_, zyx) = label_spatial_tkey_parse(&tk)?;
            let Some(block) = self.volume().get_block(v, zyx)? else {
                continue;
            };
            let cleaved_runs = runs_where(&block, zyx, bs, |sv| cleaved_set.contains(&sv));
            if cleaved_runs.is_empty() {
                continue;
            }
            moved += cleaved_runs.iter().map(|r| r.length as u64).sum::<u64>();

            let remaining = subtract(&decode_runs(&value)?, &cleaved_runs);
            if remaining.is_empty() {
                batch.delete(&tk);
            } else {
                batch.put(&tk, encode_runs(&remaining));
            }

            let mut migrated = ctx
                .get(&label_spatial_tkey(op.cleaved_label, zyx))?
                .unwrap_or_default();
            migrated.extend_from_slice(&encode_runs(&cleaved_runs));
            batch.put(&label_spatial_tkey(op.cleaved_label, zyx), migrated);
        }

        delete_size_record(&ctx, &mut batch, target_old, op.target)?;
        delete_size_record(&ctx, &mut batch, cleaved_old, op.cleaved_label)?;
        if target_old > moved {
            batch.put(&label_sizes_tkey(target_old - moved, op.target), vec![]);
        }
        if cleaved_old + moved > 0 {
            batch.put(&label_sizes_tkey(cleaved_old + moved, op.cleaved_label), vec![]);
        }
        batch.commit()?;

        info!(
            version = v,
            mut_id = op.mut_id,
            target = op.target,
            cleaved_label = op.cleaved_label,
            moved,
            "cleaved supervoxels"
        );
        Ok(())
    }

    /// Splits the voxels of `orig_label` covered by an RLE region into
    /// `new_label`. Covered voxels are rewritten in the block layer, so
    /// reprocessing the volume reproduces the mutated indexes.
    pub fn split(
        &self,
        v: VersionId,
        mut_id: u64,
        orig_label: u64,
        new_label: u64,
        region: &[u8],
    ) -> Result<u64> {
        if orig_label == 0 || new_label == 0 {
            return Err(Error::BadRequest(
                "label 0 is protected background value and cannot be used".into(),
            ));
        }
        let runs = parse_sparse_vol(region)?;
        let bs = self.volume().config().block_size;
        let orig_old = self.label_size(v, orig_label)?;
        let new_old = self.label_size(v, new_label)?;

        for (zyx, clipped) in clip_runs_to_blocks(&runs, bs) {
            self.split_block_voxels(v, zyx, &clipped, orig_label, new_label)?;
        }

        self.rewrite_size_records(v, orig_label, orig_old, new_label, new_old)?;
        info!(version = v, mut_id, orig_label, new_label, "split label by sparse volume");
        Ok(new_label)
    }

    /// Coarse split: the region's runs are in block coordinates and whole
    /// label-spatial records move from `orig_label` to `new_label`.
    pub fn split_coarse(
        &self,
        v: VersionId,
        mut_id: u64,
        orig_label: u64,
        new_label: u64,
        region: &[u8],
    ) -> Result<u64> {
        if orig_label == 0 || new_label == 0 {
            return Err(Error::BadRequest(
                "label 0 is protected background value and cannot be used".into(),
            ));
        }
        let block_runs = parse_sparse_vol(region)?;
        let ctx = self.volume().ctx(v)?;
        let orig_old = self.label_size(v, orig_label)?;
        let new_old = self.label_size(v, new_label)?;

        let mut batch = ctx.batch();
        for run in &block_runs {
            for bx in run.x..run.end() {
                let zyx = IndexZYX::new(bx, run.y, run.z);
                let orig_tk = label_spatial_tkey(orig_label, zyx);
                if let Some(value) = ctx.get(&orig_tk)? {
                    batch.delete(&orig_tk);
                    let mut merged = ctx
                        .get(&label_spatial_tkey(new_label, zyx))?
                        .unwrap_or_default();
                    merged.extend_from_slice(&value);
                    batch.put(&label_spatial_tkey(new_label, zyx), merged);
                }
                self.rewrite_block_voxels(v, zyx, orig_label, new_label, None)?;
            }
        }
        batch.commit()?;

        self.rewrite_size_records(v, orig_label, orig_old, new_label, new_old)?;
        info!(version = v, mut_id, orig_label, new_label, blocks = ?block_runs, "coarse split");
        Ok(new_label)
    }

    // Rewrites region voxels of one block and recomputes the block's
    // label-spatial records for both labels.
    fn split_block_voxels(
        &self,
        v: VersionId,
        zyx: IndexZYX,
        region: &[Run],
        orig_label: u64,
        new_label: u64,
    ) -> Result<()> {
        let changed = self.rewrite_block_voxels(v, zyx, orig_label, new_label, Some(region))?;
        if !changed {
            return Ok(());
        }
        let bs = self.volume().config().block_size;
        let ctx = self.volume().ctx(v)?;
        let block = self
            .volume()
            .get_block(v, zyx)?
            .ok_or(Error::NotFound)?;
        let resolved = self.resolve_block(v, &block)?;

        let orig_runs = runs_where(&block, zyx, bs, |sv| resolved[&sv] == orig_label);
        let new_runs = runs_where(&block, zyx, bs, |sv| resolved[&sv] == new_label);

        let mut batch = ctx.batch();
        if orig_runs.is_empty() {
            batch.delete(&label_spatial_tkey(orig_label, zyx));
        } else {
            batch.put(&label_spatial_tkey(orig_label, zyx), encode_runs(&orig_runs));
        }
        if !new_runs.is_empty() {
            batch.put(&label_spatial_tkey(new_label, zyx), encode_runs(&new_runs));
        }
        batch.commit()
    }

    // Rewrites voxels of `orig_label` to `new_label` within a block,
    // restricted to `region` when given. Returns whether anything changed.
    fn rewrite_block_voxels(
        &self,
        v: VersionId,
        zyx: IndexZYX,
        orig_label: u64,
        new_label: u64,
        region: Option<&[Run]>,
    ) -> Result<bool> {
        let bs = self.volume().config().block_size;
        let Some(block) = self.volume().get_block(v, zyx)? else {
            return Ok(false);
        };
        let resolved = self.resolve_block(v, &block)?;
        let (x0, y0, z0) = zyx.min_point(bs);

        let mut rewritten = (*block).clone();
        let mut changed = false;
        let mut i = 0usize;
        for z in 0..bs {
            for y in 0..bs {
                for x in 0..bs {
                    let sv = rewritten[i];
                    if sv != 0 && resolved[&sv] == orig_label {
                        let inside = match region {
                            Some(runs) => {
                                crate::encoding::rle::contains(runs, x0 + x, y0 + y, z0 + z)
                            }
                            None => true,
                        };
                        if inside {
                            rewritten[i] = new_label;
                            changed = true;
                        }
                    }
                    i += 1;
                }
            }
        }
        if changed {
            self.volume().put_block(v, zyx, &rewritten)?;
        }
        Ok(changed)
    }

    fn resolve_block(&self, v: VersionId, block: &[u64]) -> Result<HashMap<u64, u64>> {
        let mut distinct: Vec<u64> = Vec::new();
        let mut seen = BTreeSet::new();
        for sv in block {
            if *sv != 0 && seen.insert(*sv) {
                distinct.push(*sv);
            }
        }
        let mapped = self.svmap().get_mapped_labels(v, &distinct)?;
        Ok(distinct.into_iter().zip(mapped).collect())
    }

    // Replaces the size records of both labels after a split, recomputing
    // sizes from the migrated label-spatial records.
    fn rewrite_size_records(
        &self,
        v: VersionId,
        orig_label: u64,
        orig_old: u64,
        new_label: u64,
        new_old: u64,
    ) -> Result<()> {
        let ctx = self.volume().ctx(v)?;
        let orig_now = self.label_size(v, orig_label)?;
        let new_now = self.label_size(v, new_label)?;
        let mut batch = ctx.batch();
        delete_size_record(&ctx, &mut batch, orig_old, orig_label)?;
        delete_size_record(&ctx, &mut batch, new_old, new_label)?;
        if orig_now > 0 {
            batch.put(&label_sizes_tkey(orig_now, orig_label), vec![]);
        }
        if new_now > 0 {
            batch.put(&label_sizes_tkey(new_now, new_label), vec![]);
        }
        batch.commit()
    }
}

fn delete_size_record(
    ctx: &VersionedCtx,
    batch: &mut crate::store::ctx::CtxBatch,
    size: u64,
    label: u64,
) -> Result<()> {
    let tk = label_sizes_tkey(size, label);
    if ctx.get(&tk)?.is_some() {
        batch.delete(&tk);
    }
    Ok(())
}

/// X-runs over voxels satisfying a predicate, with absolute coordinates.
fn runs_where<F: Fn(u64) -> bool>(
    labels: &[u64],
    zyx: IndexZYX,
    block_size: i32,
    pred: F,
) -> Vec<Run> {
    let bs = block_size;
    let (x0, y0, z0) = zyx.min_point(bs);
    let mut out = Vec::new();
    let mut i = 0usize;
    for z in 0..bs {
        for y in 0..bs {
            let mut run_start = 0i32;
            let mut run_len = 0i32;
            for x in 0..bs {
                let hit = labels[i] != 0 && pred(labels[i]);
                i += 1;
                if hit {
                    if run_len == 0 {
                        run_start = x;
                    }
                    run_len += 1;
                } else if run_len > 0 {
                    out.push(Run::new(x0 + run_start, y0 + y, z0 + z, run_len));
                    run_len = 0;
                }
            }
            if run_len > 0 {
                out.push(Run::new(x0 + run_start, y0 + y, z0 + z, run_len));
            }
        }
    }
    out
}

/// Splits voxel-space runs at block boundaries and groups them per block.
pub(crate) fn clip_runs_to_blocks(runs: &[Run], block_size: i32) -> BTreeMap<IndexZYX, Vec<Run>> {
    let bs = block_size;
    let mut map: BTreeMap<IndexZYX, Vec<Run>> = BTreeMap::new();
    for run in runs {
        let by = run.y.div_euclid(bs);
        let bz = run.z.div_euclid(bs);
        let mut x = run.x;
        while x < run.end() {
            let bx = x.div_euclid(bs);
            let seg_end = run.end().min((bx + 1) * bs);
            map.entry(IndexZYX::new(bx, by, bz))
                .or_default()
                .push(Run::new(x, run.y, run.z, seg_end - x));
            x = seg_end;
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, paint};
    use super::*;
    use crate::encoding::rle::encode_sparse_vol;

    #[tokio::test]
    async fn test_merge_moves_index_and_sizes() {
        let f = fixture(4);
        let v = f.dag.root();
        let volume = f.indexer.volume();
        let (nx, ny, nz) = (8, 8, 8);
        let mut buf = vec![0u64; (nx * ny * nz) as usize];
        paint(&mut buf, nx, ny, 1, 0, 0, 0, 4, 8, 8);
        paint(&mut buf, nx, ny, 2, 4, 0, 0, 4, 8, 8);
        volume.put_dense_volume(v, nx, ny, nz, &buf).unwrap();
        f.indexer.process_spatially(v).await.unwrap();

        f.indexer.merge(v, 1, 1, &[2]).unwrap();

        assert_eq!(f.indexer.label_size(v, 1).unwrap(), 512);
        assert_eq!(f.indexer.label_size(v, 2).unwrap(), 0);
        // The mapping records the merge.
        assert_eq!(f.indexer.svmap().mapped_label(v, 2).unwrap(), (1, true));
        // The size index has exactly one surviving record.
        assert_eq!(f.indexer.get_size_range(v, 0, u64::MAX).unwrap(), vec![1]);

        // The merged sparse volume covers the whole 8x8x8 box.
        let sparse = f.indexer.get_sparse_vol(v, 1).unwrap();
        let runs = crate::encoding::rle::parse_sparse_vol(&sparse).unwrap();
        let voxels: i64 = runs.iter().map(|r| r.length as i64).sum();
        assert_eq!(voxels, 512);
    }

    #[tokio::test]
    async fn test_merge_rejects_background_and_self() {
        let f = fixture(4);
        let v = f.dag.root();
        assert!(f.indexer.merge(v, 1, 0, &[2]).is_err());
        assert!(f.indexer.merge(v, 1, 1, &[0]).is_err());
        assert!(f.indexer.merge(v, 1, 1, &[1]).is_err());
    }

    #[tokio::test]
    async fn test_cleave_migrates_supervoxel_runs() {
        let f = fixture(4);
        let v = f.dag.root();
        let volume = f.indexer.volume();
        // Supervoxels 11 and 12 merged into body 100, then 12 cleaved out.
        let (nx, ny, nz) = (8, 4, 4);
        let mut buf = vec![0u64; (nx * ny * nz) as usize];
        paint(&mut buf, nx, ny, 11, 0, 0, 0, 4, 4, 4);
        paint(&mut buf, nx, ny, 12, 4, 0, 0, 4, 4, 4);
        volume.put_dense_volume(v, nx, ny, nz, &buf).unwrap();
        f.indexer
            .svmap()
            .add_merge(v, 1, 100, &[11u64, 12].into_iter().collect())
            .unwrap();
        f.indexer.process_spatially(v).await.unwrap();
        assert_eq!(f.indexer.label_size(v, 100).unwrap(), 128);

        f.indexer
            .cleave(
                v,
                &CleaveOp {
                    mut_id: 2,
                    target: 100,
                    cleaved_label: 150,
                    cleaved_supervoxels: vec![12],
                },
            )
            .unwrap();

        assert_eq!(f.indexer.label_size(v, 100).unwrap(), 64);
        assert_eq!(f.indexer.label_size(v, 150).unwrap(), 64);
        assert_eq!(f.indexer.svmap().mapped_label(v, 12).unwrap(), (150, true));
        assert_eq!(f.indexer.svmap().mapped_label(v, 11).unwrap(), (100, true));

        let mut sizes = f.indexer.get_size_range(v, 0, u64::MAX).unwrap();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![100, 150]);
    }

    #[tokio::test]
    async fn test_split_rewrites_voxels_and_indexes() {
        let f = fixture(4);
        let v = f.dag.root();
        let volume = f.indexer.volume();
        let (nx, ny, nz) = (8, 8, 8);
        let buf = vec![7u64; (nx * ny * nz) as usize];
        volume.put_dense_volume(v, nx, ny, nz, &buf).unwrap();
        f.indexer.process_spatially(v).await.unwrap();
        assert_eq!(f.indexer.label_size(v, 7).unwrap(), 512);

        // Split a 3x3x3 corner into label 9.
        let mut region = Vec::new();
        for z in 0..3 {
            for y in 0..3 {
                region.push(Run::new(0, y, z, 3));
            }
        }
        f.indexer
            .split(v, 5, 7, 9, &encode_sparse_vol(&region))
            .unwrap();

        assert_eq!(f.indexer.label_size(v, 9).unwrap(), 27);
        assert_eq!(f.indexer.label_size(v, 7).unwrap(), 512 - 27);
        // Voxels themselves were rewritten.
        assert_eq!(volume.get_supervoxel_at_point(v, 0, 0, 0).unwrap(), 9);
        assert_eq!(volume.get_supervoxel_at_point(v, 2, 2, 2).unwrap(), 9);
        assert_eq!(volume.get_supervoxel_at_point(v, 3, 0, 0).unwrap(), 7);

        // Reprocessing from the rewritten blocks reproduces the same sizes.
        f.indexer.process_spatially(v).await.unwrap();
        assert_eq!(f.indexer.label_size(v, 9).unwrap(), 27);
        assert_eq!(f.indexer.label_size(v, 7).unwrap(), 485);
    }

    #[tokio::test]
    async fn test_split_coarse_moves_whole_blocks() {
        let f = fixture(4);
        let v = f.dag.root();
        let volume = f.indexer.volume();
        let (nx, ny, nz) = (16, 4, 4);
        let buf = vec![3u64; (nx * ny * nz) as usize];
        volume.put_dense_volume(v, nx, ny, nz, &buf).unwrap();
        f.indexer.process_spatially(v).await.unwrap();
        assert_eq!(f.indexer.label_size(v, 3).unwrap(), 256);

        // Move two of the four blocks (block x 1..3) to label 4.
        let region = encode_sparse_vol(&[Run::new(1, 0, 0, 2)]);
        f.indexer.split_coarse(v, 6, 3, 4, &region).unwrap();

        assert_eq!(f.indexer.label_size(v, 3).unwrap(), 128);
        assert_eq!(f.indexer.label_size(v, 4).unwrap(), 128);
        // Whole-block voxel rewrite.
        assert_eq!(volume.get_supervoxel_at_point(v, 4, 0, 0).unwrap(), 4);
        assert_eq!(volume.get_supervoxel_at_point(v, 11, 3, 3).unwrap(), 4);
        assert_eq!(volume.get_supervoxel_at_point(v, 3, 0, 0).unwrap(), 3);
        assert_eq!(volume.get_supervoxel_at_point(v, 12, 0, 0).unwrap(), 3);
    }

    #[test]
    fn test_clip_runs_to_blocks() {
        // A run crossing two blocks of size 4.
        let clipped = clip_runs_to_blocks(&[Run::new(2, 1, 5, 5)], 4);
        assert_eq!(clipped.len(), 2);
        assert_eq!(clipped[&IndexZYX::new(0, 0, 1)], vec![Run::new(2, 1, 5, 2)]);
        assert_eq!(clipped[&IndexZYX::new(1, 0, 1)], vec![Run::new(4, 1, 5, 3)]);
    }

    #[test]
    fn test_runs_where_skips_background() {
        let labels = vec![0, 5, 5, 0, 5, 0, 0, 5];
        let runs = runs_where(&labels, IndexZYX::new(0, 0, 0), 2, |sv| sv == 5);
        assert_eq!(
            runs,
            vec![
                Run::new(1, 0, 0, 1),
                Run::new(0, 1, 0, 1),
                Run::new(0, 0, 1, 1),
                Run::new(1, 1, 1, 1),
            ]
        );
    }
}
