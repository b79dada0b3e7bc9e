//! Spatial denormalization of label volumes.
//!
//! Streams a version's blocks and emits two derived indexes on the ordered
//! store: label→block runs (one RLE record per label per touched block) and
//! size→label (one record per label, keyed so a range scan ranks labels by
//! voxel count). Chunk processing fans out over a bounded handler pool; the
//! size generator is a single sequential scan.

pub mod mutate;

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::encoding::keycode::{
    block_tkey, block_tkey_parse, label_sizes_tkey, label_sizes_tkey_parse, label_spatial_tkey,
    label_spatial_tkey_parse, MAX_LABEL,
};
use crate::encoding::rle::{
    encode_runs, patch_run_count, sparse_vol_header, stats_runs, Run, RUN_SIZE,
};
use crate::encoding::IndexZYX;
use crate::error::{Error, Result};
use crate::svmap::SvMap;
use crate::version::VersionId;
use crate::volume::Volume;

/// Builds and maintains the spatial indexes of one label-volume instance.
pub struct SpatialIndexer {
    volume: Arc<Volume>,
    svmap: Arc<SvMap>,
}

impl SpatialIndexer {
    pub fn new(volume: Arc<Volume>, svmap: Arc<SvMap>) -> Self {
        Self { volume, svmap }
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn svmap(&self) -> &Arc<SvMap> {
        &self.svmap
    }

    /// Iterates the label volume one Z layer at a time, dispatching each
    /// block to the bounded handler pool and waiting for the layer to
    /// finish before advancing. A failed block logs and abandons its layer;
    /// rerunning reconstructs the indexes.
    pub async fn process_spatially(&self, v: VersionId) -> Result<()> {
        let Some(extents) = self.volume.extents(v)? else {
            return Ok(());
        };
        info!(version = v, "adding spatial information from label volume");
        let semaphore = Arc::new(Semaphore::new(self.volume.config().num_block_handlers));

        for z in extents.min_z..=extents.max_z {
            let ctx = self.volume.ctx(v)?;
            let lo = block_tkey(IndexZYX {
                z,
                y: i32::MIN,
                x: i32::MIN,
            });
            let hi = block_tkey(IndexZYX {
                z,
                y: i32::MAX,
                x: i32::MAX,
            });
            let mut tasks = JoinSet::new();
            for (tk, value) in ctx.scan(&lo, &hi)? {
                let zyx = block_tkey_parse(&tk)?;
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Backend(e.to_string()))?;
                let volume = Arc::clone(&self.volume);
                let svmap = Arc::clone(&self.svmap);
                tasks.spawn(async move {
                    let result = process_block(&volume, &svmap, v, zyx, &value);
                    drop(permit);
                    result
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(layer = z, error = %e, "block processing failed, layer aborted")
                    }
                    Err(e) => error!(layer = z, error = %e, "block handler panicked"),
                }
            }
            debug!(layer = z, version = v, "processed label blocks for layer");
        }

        self.compute_sizes(v)
    }

    /// Streams the label-spatial index in key order, which groups records
    /// per label, and emits one size record per label. Must stay a single
    /// sequential scan: per-label grouping is the only thing that makes the
    /// accumulator correct.
    pub fn compute_sizes(&self, v: VersionId) -> Result<()> {
        let ctx = self.volume.ctx(v)?;
        let batch_size = self.volume.config().size_batch;
        let rows = ctx.scan(
            &label_spatial_tkey(0, IndexZYX::MIN),
            &label_spatial_tkey(MAX_LABEL, IndexZYX::MAX),
        )?;

        let mut batch = ctx.batch();
        let mut puts = 0usize;
        let mut cur_label = 0u64;
        let mut cur_size = 0u64;
        let mut seen_any = false;
        for (tk, value) in rows {
            let (label, _) = label_spatial_tkey_parse(&tk)?;
            let (voxels, _) = stats_runs(&value)?;
            if seen_any && label != cur_label {
                batch.put(&label_sizes_tkey(cur_size, cur_label), vec![]);
                puts += 1;
                if puts % batch_size == 0 {
                    batch.commit()?;
                    batch = ctx.batch();
                }
                cur_size = 0;
            }
            seen_any = true;
            cur_label = label;
            cur_size += voxels;
        }
        if seen_any {
            batch.put(&label_sizes_tkey(cur_size, cur_label), vec![]);
        }
        batch.commit()?;
        debug!(version = v, "created size index for labels");
        Ok(())
    }

    /// Assembles the sparse-volume encoding for a label: the 12-byte header
    /// followed by every 16-byte run of the label, concatenated in block
    /// key order, with the run count patched in afterwards.
    pub fn get_sparse_vol(&self, v: VersionId, label: u64) -> Result<Vec<u8>> {
        let ctx = self.volume.ctx(v)?;
        let rows = ctx.scan(
            &label_spatial_tkey(label, IndexZYX::MIN),
            &label_spatial_tkey(label, IndexZYX::MAX),
        )?;

        let mut buf = sparse_vol_header();
        let mut num_runs = 0u32;
        let mut num_blocks = 0u32;
        for (_, value) in rows {
            if value.len() % RUN_SIZE != 0 {
                return Err(Error::MalformedRle(value.len()));
            }
            num_blocks += 1;
            num_runs += (value.len() / RUN_SIZE) as u32;
            buf.extend_from_slice(&value);
        }
        patch_run_count(&mut buf, num_runs);
        debug!(label, num_blocks, num_runs, "assembled sparse volume");
        Ok(buf)
    }

    /// Labels whose voxel count lies within `[min_size, max_size]`, in
    /// ascending size order.
    pub fn get_size_range(&self, v: VersionId, min_size: u64, max_size: u64) -> Result<Vec<u64>> {
        let ctx = self.volume.ctx(v)?;
        let rows = ctx.scan(
            &label_sizes_tkey(min_size, 0),
            &label_sizes_tkey(max_size, MAX_LABEL),
        )?;
        rows.iter()
            .map(|(tk, _)| label_sizes_tkey_parse(tk).map(|(_, label)| label))
            .collect()
    }

    /// Voxel count of a label, summed over its label-spatial records.
    pub fn label_size(&self, v: VersionId, label: u64) -> Result<u64> {
        let ctx = self.volume.ctx(v)?;
        let rows = ctx.scan(
            &label_spatial_tkey(label, IndexZYX::MIN),
            &label_spatial_tkey(label, IndexZYX::MAX),
        )?;
        let mut size = 0u64;
        for (_, value) in rows {
            let (voxels, _) = stats_runs(&value)?;
            size += voxels;
        }
        Ok(size)
    }
}

/// Single-pass X-run extraction over one block, keyed by the voxel's mapped
/// label, with all of the block's index records landing in one batch.
fn process_block(
    volume: &Volume,
    svmap: &SvMap,
    v: VersionId,
    zyx: IndexZYX,
    value: &[u8],
) -> Result<()> {
    let bs = volume.config().block_size;
    if value.len() != volume.config().block_bytes() {
        return Err(Error::Corrupt(format!(
            "block {zyx:?} is wrong size: {} bytes",
            value.len()
        )));
    }
    let mut labels = vec![0u64; value.len() / 8];
    LittleEndian::read_u64_into(value, &mut labels);

    let runs = extract_runs(&labels, zyx, bs);
    if runs.is_empty() {
        return Ok(());
    }

    // Resolve each distinct supervoxel once, then regroup runs by mapped label.
    let supervoxels: Vec<u64> = runs.iter().map(|(sv, _)| *sv).collect();
    let mapped = svmap.get_mapped_labels(v, &supervoxels)?;

    let mut by_label: HashMap<u64, Vec<Run>> = HashMap::new();
    let mut order: Vec<u64> = Vec::new();
    for ((_, sv_runs), label) in runs.into_iter().zip(mapped) {
        let entry = by_label.entry(label).or_insert_with(|| {
            order.push(label);
            Vec::new()
        });
        entry.extend(sv_runs);
    }

    let ctx = volume.ctx(v)?;
    let mut batch = ctx.batch();
    for label in order {
        let label_runs = &by_label[&label];
        batch.put(&label_spatial_tkey(label, zyx), encode_runs(label_runs));
    }
    batch.commit()
}

/// X-runs per raw supervoxel in first-seen order, with absolute voxel
/// coordinates. Background (id 0) is not indexed.
fn extract_runs(labels: &[u64], zyx: IndexZYX, block_size: i32) -> Vec<(u64, Vec<Run>)> {
    let bs = block_size;
    let (x0, y0, z0) = zyx.min_point(bs);
    let mut by_sv: HashMap<u64, usize> = HashMap::new();
    let mut out: Vec<(u64, Vec<Run>)> = Vec::new();
    let mut i = 0usize;

    let mut push_run = |out: &mut Vec<(u64, Vec<Run>)>, sv: u64, run: Run| {
        let idx = *by_sv.entry(sv).or_insert_with(|| {
            out.push((sv, Vec::new()));
            out.len() - 1
        });
        out[idx].1.push(run);
    };

    for z in 0..bs {
        for y in 0..bs {
            let mut cur_sv = 0u64;
            let mut run_start = 0i32;
            let mut run_len = 0i32;
            for x in 0..bs {
                let sv = labels[i];
                i += 1;
                if run_len > 0 && sv == cur_sv {
                    run_len += 1;
                    continue;
                }
                if run_len > 0 && cur_sv != 0 {
                    push_run(
                        &mut out,
                        cur_sv,
                        Run::new(x0 + run_start, y0 + y, z0 + z, run_len),
                    );
                }
                cur_sv = sv;
                run_start = x;
                run_len = 1;
            }
            // Runs never cross a row boundary.
            if run_len > 0 && cur_sv != 0 {
                push_run(
                    &mut out,
                    cur_sv,
                    Run::new(x0 + run_start, y0 + y, z0 + z, run_len),
                );
            }
        }
    }
    out
}
