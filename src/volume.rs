use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::badreq;
use crate::cache::BlockCache;
use crate::config::Config;
use crate::encoding::keycode::{block_tkey, meta_tkey};
use crate::encoding::{IndexZYX, InstanceId};
use crate::error::{Error, Result};
use crate::store::{KvStore, VersionedCtx};
use crate::svmap::SvMap;
use crate::version::{AncestryProvider, VersionId};

const EXTENTS_META: &str = "extents";

/// Block-coordinate bounding box of a version's stored label blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extents {
    pub min_x: i32,
    pub min_y: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_y: i32,
    pub max_z: i32,
}

impl Extents {
    fn of_block(zyx: IndexZYX) -> Self {
        Self {
            min_x: zyx.x,
            min_y: zyx.y,
            min_z: zyx.z,
            max_x: zyx.x,
            max_y: zyx.y,
            max_z: zyx.z,
        }
    }

    fn extend(&mut self, zyx: IndexZYX) {
        self.min_x = self.min_x.min(zyx.x);
        self.min_y = self.min_y.min(zyx.y);
        self.min_z = self.min_z.min(zyx.z);
        self.max_x = self.max_x.max(zyx.x);
        self.max_y = self.max_y.max(zyx.y);
        self.max_z = self.max_z.max(zyx.z);
    }
}

/// Dense block storage for a label volume instance.
///
/// Blocks hold `block_size³` supervoxel ids as little-endian u64s, row-major
/// with X fastest. Reads resolve through the version ancestry and are
/// fronted by the decoded-block cache.
pub struct Volume {
    store: KvStore,
    instance: InstanceId,
    dag: Arc<dyn AncestryProvider>,
    config: Config,
    cache: Mutex<BlockCache>,
}

impl Volume {
    pub fn new(
        store: KvStore,
        instance: InstanceId,
        dag: Arc<dyn AncestryProvider>,
        config: Config,
    ) -> Self {
        let cache = BlockCache::new(config.block_cache_bytes, config.block_bytes());
        Self {
            store,
            instance,
            dag,
            config,
            cache: Mutex::new(cache),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn ctx(&self, v: VersionId) -> Result<VersionedCtx> {
        VersionedCtx::new(Arc::clone(&self.store), self.instance, v, self.dag.as_ref())
    }

    /// Stores one dense block of supervoxel ids at a version.
    pub fn put_block(&self, v: VersionId, zyx: IndexZYX, labels: &[u64]) -> Result<()> {
        let expected = self.config.block_bytes() / 8;
        if labels.len() != expected {
            return Err(badreq!("block must hold {expected} voxels, got {}", labels.len()));
        }
        let mut buf = vec![0u8; labels.len() * 8];
        LittleEndian::write_u64_into(labels, &mut buf);

        let ctx = self.ctx(v)?;
        ctx.put(&block_tkey(zyx), buf)?;
        self.extend_extents(&ctx, zyx)?;
        self.cache.lock().unwrap().remove(v, zyx);
        Ok(())
    }

    /// Decoded block of supervoxel ids, or None outside the stored volume.
    pub fn get_block(&self, v: VersionId, zyx: IndexZYX) -> Result<Option<Arc<Vec<u64>>>> {
        if let Some(block) = self.cache.lock().unwrap().get(v, zyx) {
            return Ok(Some(block));
        }
        let ctx = self.ctx(v)?;
        let Some(buf) = ctx.get(&block_tkey(zyx))? else {
            return Ok(None);
        };
        let block = Arc::new(decode_block(&buf)?);
        self.cache.lock().unwrap().insert(v, zyx, Arc::clone(&block));
        Ok(Some(block))
    }

    pub fn extents(&self, v: VersionId) -> Result<Option<Extents>> {
        let ctx = self.ctx(v)?;
        match ctx.get(&meta_tkey(EXTENTS_META))? {
            Some(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
            None => Ok(None),
        }
    }

    /// Splits a dense label buffer anchored at the voxel origin into blocks
    /// and stores them. Each dimension must be a multiple of the block size.
    pub fn put_dense_volume(
        &self,
        v: VersionId,
        nx: i32,
        ny: i32,
        nz: i32,
        labels: &[u64],
    ) -> Result<()> {
        let bs = self.config.block_size;
        if nx % bs != 0 || ny % bs != 0 || nz % bs != 0 {
            return Err(badreq!(
                "volume dims {nx}x{ny}x{nz} must be multiples of block size {bs}"
            ));
        }
        if labels.len() != (nx as usize) * (ny as usize) * (nz as usize) {
            return Err(badreq!(
                "volume buffer holds {} voxels, expected {}",
                labels.len(),
                nx * ny * nz
            ));
        }
        let voxels_per_block = (bs * bs * bs) as usize;
        let mut block = vec![0u64; voxels_per_block];
        for bz in 0..nz / bs {
            for by in 0..ny / bs {
                for bx in 0..nx / bs {
                    let mut i = 0;
                    for z in 0..bs {
                        for y in 0..bs {
                            let row = ((bz * bs + z) as usize * ny as usize
                                + (by * bs + y) as usize)
                                * nx as usize
                                + (bx * bs) as usize;
                            block[i..i + bs as usize]
                                .copy_from_slice(&labels[row..row + bs as usize]);
                            i += bs as usize;
                        }
                    }
                    self.put_block(v, IndexZYX::new(bx, by, bz), &block)?;
                }
            }
        }
        Ok(())
    }

    /// Raw supervoxel id at a voxel coordinate.
    pub fn get_supervoxel_at_point(&self, v: VersionId, x: i32, y: i32, z: i32) -> Result<u64> {
        let bs = self.config.block_size;
        let zyx = IndexZYX::of_voxel(x, y, z, bs);
        let Some(block) = self.get_block(v, zyx)? else {
            return Err(Error::NotFound);
        };
        let (x0, y0, z0) = zyx.min_point(bs);
        let i = (((z - z0) * bs + (y - y0)) * bs + (x - x0)) as usize;
        Ok(block[i])
    }

    /// Mapped label at a voxel coordinate, resolved through the supervoxel map.
    pub fn get_label_at_point(
        &self,
        v: VersionId,
        x: i32,
        y: i32,
        z: i32,
        svmap: &SvMap,
    ) -> Result<u64> {
        let supervoxel = self.get_supervoxel_at_point(v, x, y, z)?;
        if supervoxel == 0 {
            return Ok(0);
        }
        let (label, _) = svmap.mapped_label(v, supervoxel)?;
        Ok(label)
    }

    fn extend_extents(&self, ctx: &VersionedCtx, zyx: IndexZYX) -> Result<()> {
        let merged = match ctx.get(&meta_tkey(EXTENTS_META))? {
            Some(buf) => {
                let mut extents: Extents = serde_json::from_slice(&buf)?;
                extents.extend(zyx);
                extents
            }
            None => Extents::of_block(zyx),
        };
        ctx.put(&meta_tkey(EXTENTS_META), serde_json::to_vec(&merged)?)
    }
}

fn decode_block(buf: &[u8]) -> Result<Vec<u64>> {
    if buf.len() % 8 != 0 {
        return Err(Error::Corrupt(format!(
            "block value is wrong size: {} bytes",
            buf.len()
        )));
    }
    let mut labels = vec![0u64; buf.len() / 8];
    LittleEndian::read_u64_into(buf, &mut labels);
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::version::VersionDag;

    fn setup(block_size: i32) -> (Arc<VersionDag>, Volume) {
        let dag = Arc::new(VersionDag::new());
        let store: KvStore = Arc::new(MemoryStore::new());
        let config = Config::default().block_size(block_size);
        let volume = Volume::new(store, InstanceId(1), dag.clone(), config);
        (dag, volume)
    }

    #[test]
    fn test_put_get_block() {
        let (dag, volume) = setup(4);
        let v = dag.root();
        let labels: Vec<u64> = (0..64).collect();
        volume.put_block(v, IndexZYX::new(0, 0, 0), &labels).unwrap();

        let block = volume.get_block(v, IndexZYX::new(0, 0, 0)).unwrap().unwrap();
        assert_eq!(&*block, &labels);
        assert!(volume.get_block(v, IndexZYX::new(5, 5, 5)).unwrap().is_none());
    }

    #[test]
    fn test_block_size_enforced() {
        let (dag, volume) = setup(4);
        assert!(volume
            .put_block(dag.root(), IndexZYX::new(0, 0, 0), &[1, 2, 3])
            .is_err());
    }

    #[test]
    fn test_extents_track_blocks() {
        let (dag, volume) = setup(4);
        let v = dag.root();
        let block = vec![0u64; 64];
        volume.put_block(v, IndexZYX::new(1, 2, 3), &block).unwrap();
        volume.put_block(v, IndexZYX::new(-1, 0, 5), &block).unwrap();

        let extents = volume.extents(v).unwrap().unwrap();
        assert_eq!(
            extents,
            Extents {
                min_x: -1,
                min_y: 0,
                min_z: 3,
                max_x: 1,
                max_y: 2,
                max_z: 5,
            }
        );
    }

    #[test]
    fn test_dense_volume_layout() {
        let (dag, volume) = setup(4);
        let v = dag.root();
        // 8x4x4 volume: left 4x4x4 is label 1, right is label 2.
        let mut labels = vec![0u64; 8 * 4 * 4];
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..8 {
                    labels[(z * 4 + y) * 8 + x] = if x < 4 { 1 } else { 2 };
                }
            }
        }
        volume.put_dense_volume(v, 8, 4, 4, &labels).unwrap();

        assert_eq!(volume.get_supervoxel_at_point(v, 0, 0, 0).unwrap(), 1);
        assert_eq!(volume.get_supervoxel_at_point(v, 3, 3, 3).unwrap(), 1);
        assert_eq!(volume.get_supervoxel_at_point(v, 4, 0, 0).unwrap(), 2);
        assert_eq!(volume.get_supervoxel_at_point(v, 7, 3, 3).unwrap(), 2);
    }

    #[test]
    fn test_child_version_inherits_blocks() {
        let (dag, volume) = setup(4);
        let root = dag.root();
        let child = dag.new_child(root).unwrap();
        let labels = vec![9u64; 64];
        volume.put_block(root, IndexZYX::new(0, 0, 0), &labels).unwrap();

        // Child resolves to the parent's block until it writes its own.
        let block = volume.get_block(child, IndexZYX::new(0, 0, 0)).unwrap().unwrap();
        assert_eq!(block[0], 9);

        let rewritten = vec![7u64; 64];
        volume.put_block(child, IndexZYX::new(0, 0, 0), &rewritten).unwrap();
        assert_eq!(volume.get_block(child, IndexZYX::new(0, 0, 0)).unwrap().unwrap()[0], 7);
        assert_eq!(volume.get_block(root, IndexZYX::new(0, 0, 0)).unwrap().unwrap()[0], 9);
    }

    #[test]
    fn test_label_at_point_maps_supervoxel() {
        use tempfile::TempDir;

        let (dag, volume) = setup(4);
        let v = dag.root();
        volume.put_block(v, IndexZYX::new(0, 0, 0), &vec![55u64; 64]).unwrap();

        let dir = TempDir::new().unwrap();
        let svmap = SvMap::open(dir.path(), dag.clone()).unwrap();
        assert_eq!(volume.get_label_at_point(v, 1, 1, 1, &svmap).unwrap(), 55);

        svmap.map_supervoxel(v, 55, 500).unwrap();
        assert_eq!(volume.get_label_at_point(v, 1, 1, 1, &svmap).unwrap(), 500);
    }
}
