//! Order-preserving key construction.
//!
//! Physical keys are `instance (u32 BE) · type key · version (u32 BE) ·
//! marker (u8)`, so all versions of one type key are adjacent and a range
//! scan over a type-key interval visits keys in byte-lexical order that
//! matches the numeric order of the encoded fields. Numeric fields inside
//! type keys are big-endian; signed block coordinates get their sign bit
//! flipped so negative coordinates sort before positive ones.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::version::VersionId;

// Type-key family tags. Order matters only insofar as families must not
// collide; scans never cross a family boundary.
pub const TAG_BLOCK: u8 = 0x01;
pub const TAG_INVERSE_MAP: u8 = 0x02;
pub const TAG_FORWARD_MAP: u8 = 0x03;
pub const TAG_LABEL_SPATIAL: u8 = 0x04;
pub const TAG_LABEL_SIZES: u8 = 0x05;
pub const TAG_ELEMENTS: u8 = 0x06;
pub const TAG_ELEMENT_COUNT: u8 = 0x07;
pub const TAG_ELEMENT_TALLY: u8 = 0x08;
pub const TAG_BLOB: u8 = 0x09;
pub const TAG_META: u8 = 0x0a;

const MARKER_DATA: u8 = 0x00;
const MARKER_TOMBSTONE: u8 = 0x01;

/// Number of bytes appended after the type key: version id plus marker.
const VERSION_SUFFIX_SIZE: usize = 5;
const INSTANCE_PREFIX_SIZE: usize = 4;

/// Maximum label sentinel for range endpoints.
pub const MAX_LABEL: u64 = u64::MAX;

/// Per-process identifier of a data instance, scoping its keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u32);

/// Lexicographically ordered block address. Encoded as three sign-flipped
/// big-endian i32 coordinates in z, y, x order, so iterating keys walks
/// blocks by Z, then Y, then X.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexZYX {
    pub z: i32,
    pub y: i32,
    pub x: i32,
}

impl IndexZYX {
    pub const SIZE: usize = 12;

    pub const MIN: IndexZYX = IndexZYX {
        z: i32::MIN,
        y: i32::MIN,
        x: i32::MIN,
    };

    pub const MAX: IndexZYX = IndexZYX {
        z: i32::MAX,
        y: i32::MAX,
        x: i32::MAX,
    };

    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { z, y, x }
    }

    pub fn bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        BigEndian::write_i32(&mut buf[0..4], self.z ^ i32::MIN);
        BigEndian::write_i32(&mut buf[4..8], self.y ^ i32::MIN);
        BigEndian::write_i32(&mut buf[8..12], self.x ^ i32::MIN);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::SIZE {
            return Err(Error::Corrupt(format!(
                "block index must be {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            z: BigEndian::read_i32(&buf[0..4]) ^ i32::MIN,
            y: BigEndian::read_i32(&buf[4..8]) ^ i32::MIN,
            x: BigEndian::read_i32(&buf[8..12]) ^ i32::MIN,
        })
    }

    /// Voxel coordinate of the block's first (minimum) corner.
    pub fn min_point(&self, block_size: i32) -> (i32, i32, i32) {
        (
            self.x * block_size,
            self.y * block_size,
            self.z * block_size,
        )
    }

    /// Block address containing the given voxel coordinate.
    pub fn of_voxel(x: i32, y: i32, z: i32, block_size: i32) -> Self {
        Self {
            z: z.div_euclid(block_size),
            y: y.div_euclid(block_size),
            x: x.div_euclid(block_size),
        }
    }
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    BigEndian::write_u64(&mut b, v);
    buf.extend_from_slice(&b);
}

// --- type keys per family ---

pub fn block_tkey(zyx: IndexZYX) -> Vec<u8> {
    let mut tk = Vec::with_capacity(1 + IndexZYX::SIZE);
    tk.push(TAG_BLOCK);
    tk.extend_from_slice(&zyx.bytes());
    tk
}

pub fn block_tkey_parse(tk: &[u8]) -> Result<IndexZYX> {
    expect_tag(tk, TAG_BLOCK)?;
    IndexZYX::from_bytes(&tk[1..])
}

/// KLSM: `tag · label · IndexZYX`, enumerating blocks touched by a label.
pub fn label_spatial_tkey(label: u64, zyx: IndexZYX) -> Vec<u8> {
    let mut tk = Vec::with_capacity(1 + 8 + IndexZYX::SIZE);
    tk.push(TAG_LABEL_SPATIAL);
    push_u64(&mut tk, label);
    tk.extend_from_slice(&zyx.bytes());
    tk
}

pub fn label_spatial_tkey_parse(tk: &[u8]) -> Result<(u64, IndexZYX)> {
    expect_tag(tk, TAG_LABEL_SPATIAL)?;
    if tk.len() != 1 + 8 + IndexZYX::SIZE {
        return Err(Error::Corrupt(format!("bad label-spatial key length {}", tk.len())));
    }
    let label = BigEndian::read_u64(&tk[1..9]);
    let zyx = IndexZYX::from_bytes(&tk[9..])?;
    Ok((label, zyx))
}

/// KLS: `tag · size · label`, ranking labels by voxel count.
pub fn label_sizes_tkey(size: u64, label: u64) -> Vec<u8> {
    let mut tk = Vec::with_capacity(17);
    tk.push(TAG_LABEL_SIZES);
    push_u64(&mut tk, size);
    push_u64(&mut tk, label);
    tk
}

pub fn label_sizes_tkey_parse(tk: &[u8]) -> Result<(u64, u64)> {
    expect_tag(tk, TAG_LABEL_SIZES)?;
    if tk.len() != 17 {
        return Err(Error::Corrupt(format!("bad label-sizes key length {}", tk.len())));
    }
    Ok((BigEndian::read_u64(&tk[1..9]), BigEndian::read_u64(&tk[9..17])))
}

/// Forward map: `tag · supervoxel · label`.
pub fn forward_map_tkey(supervoxel: u64, label: u64) -> Vec<u8> {
    let mut tk = Vec::with_capacity(17);
    tk.push(TAG_FORWARD_MAP);
    push_u64(&mut tk, supervoxel);
    push_u64(&mut tk, label);
    tk
}

/// Inverse map: `tag · label · supervoxel`.
pub fn inverse_map_tkey(label: u64, supervoxel: u64) -> Vec<u8> {
    let mut tk = Vec::with_capacity(17);
    tk.push(TAG_INVERSE_MAP);
    push_u64(&mut tk, label);
    push_u64(&mut tk, supervoxel);
    tk
}

pub fn elements_tkey(zyx: IndexZYX) -> Vec<u8> {
    let mut tk = Vec::with_capacity(1 + IndexZYX::SIZE);
    tk.push(TAG_ELEMENTS);
    tk.extend_from_slice(&zyx.bytes());
    tk
}

pub fn elements_tkey_parse(tk: &[u8]) -> Result<IndexZYX> {
    expect_tag(tk, TAG_ELEMENTS)?;
    IndexZYX::from_bytes(&tk[1..])
}

/// Element ranking: `tag · kind · count · label`, empty value.
pub fn element_count_tkey(kind: u8, count: u64, label: u64) -> Vec<u8> {
    let mut tk = Vec::with_capacity(18);
    tk.push(TAG_ELEMENT_COUNT);
    tk.push(kind);
    push_u64(&mut tk, count);
    push_u64(&mut tk, label);
    tk
}

pub fn element_count_tkey_parse(tk: &[u8]) -> Result<(u8, u64, u64)> {
    expect_tag(tk, TAG_ELEMENT_COUNT)?;
    if tk.len() != 18 {
        return Err(Error::Corrupt(format!("bad element-count key length {}", tk.len())));
    }
    Ok((
        tk[1],
        BigEndian::read_u64(&tk[2..10]),
        BigEndian::read_u64(&tk[10..18]),
    ))
}

/// Element tally point-lookup: `tag · kind · label`, value is the count.
pub fn element_tally_tkey(kind: u8, label: u64) -> Vec<u8> {
    let mut tk = Vec::with_capacity(10);
    tk.push(TAG_ELEMENT_TALLY);
    tk.push(kind);
    push_u64(&mut tk, label);
    tk
}

/// Per-supervoxel blob: `tag · supervoxel · extension`.
pub fn blob_tkey(supervoxel: u64, extension: &str) -> Vec<u8> {
    let mut tk = Vec::with_capacity(9 + extension.len());
    tk.push(TAG_BLOB);
    push_u64(&mut tk, supervoxel);
    tk.extend_from_slice(extension.as_bytes());
    tk
}

pub fn meta_tkey(name: &str) -> Vec<u8> {
    let mut tk = Vec::with_capacity(1 + name.len());
    tk.push(TAG_META);
    tk.extend_from_slice(name.as_bytes());
    tk
}

fn expect_tag(tk: &[u8], tag: u8) -> Result<()> {
    match tk.first() {
        Some(&t) if t == tag => Ok(()),
        Some(&t) => Err(Error::Corrupt(format!("expected key tag {tag:#04x}, got {t:#04x}"))),
        None => Err(Error::Corrupt("empty type key".into())),
    }
}

// --- versioned physical keys ---

/// Composes the physical key for a type key at a version.
pub fn construct_key(instance: InstanceId, tk: &[u8], v: VersionId) -> Vec<u8> {
    physical_key(instance, tk, v, MARKER_DATA)
}

/// Composes the tombstone key for a type key at a version. Tombstones sort
/// directly after their data key and are honored during version resolution.
pub fn tombstone_key(instance: InstanceId, tk: &[u8], v: VersionId) -> Vec<u8> {
    physical_key(instance, tk, v, MARKER_TOMBSTONE)
}

fn physical_key(instance: InstanceId, tk: &[u8], v: VersionId, marker: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(INSTANCE_PREFIX_SIZE + tk.len() + VERSION_SUFFIX_SIZE);
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, instance.0);
    key.extend_from_slice(&b);
    key.extend_from_slice(tk);
    BigEndian::write_u32(&mut b, v);
    key.extend_from_slice(&b);
    key.push(marker);
    key
}

/// Lowest physical key for a type key across all versions.
pub fn min_version_key(instance: InstanceId, tk: &[u8]) -> Vec<u8> {
    physical_key(instance, tk, 0, MARKER_DATA)
}

/// Highest physical key for a type key across all versions.
pub fn max_version_key(instance: InstanceId, tk: &[u8]) -> Vec<u8> {
    physical_key(instance, tk, VersionId::MAX, 0xff)
}

/// Recovers the type key from a physical key.
pub fn tkey_from_key(key: &[u8]) -> Result<&[u8]> {
    if key.len() < INSTANCE_PREFIX_SIZE + VERSION_SUFFIX_SIZE + 1 {
        return Err(Error::Corrupt(format!("physical key too short: {} bytes", key.len())));
    }
    Ok(&key[INSTANCE_PREFIX_SIZE..key.len() - VERSION_SUFFIX_SIZE])
}

/// Recovers the version id and tombstone flag from a physical key.
pub fn version_from_key(key: &[u8]) -> Result<(VersionId, bool)> {
    if key.len() < INSTANCE_PREFIX_SIZE + VERSION_SUFFIX_SIZE + 1 {
        return Err(Error::Corrupt(format!("physical key too short: {} bytes", key.len())));
    }
    let suffix = &key[key.len() - VERSION_SUFFIX_SIZE..];
    let v = BigEndian::read_u32(&suffix[0..4]);
    Ok((v, suffix[4] == MARKER_TOMBSTONE))
}

/// Selects the most-recent-visible record from rows sharing one type key.
///
/// Rows are `(physical key, value)` pairs for the same type key across
/// versions. Resolution walks the ancestry leaf→root and returns the index
/// of the first version that has any row; `None` if that row is a tombstone
/// or no ancestry version has one.
pub fn versioned_key_value(rows: &[(Vec<u8>, Vec<u8>)], ancestry: &[VersionId]) -> Result<Option<usize>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let mut by_version = std::collections::HashMap::with_capacity(rows.len());
    for (i, (key, _)) in rows.iter().enumerate() {
        let (v, tombstone) = version_from_key(key)?;
        // A tombstone and data row at the same version shouldn't coexist,
        // but if they do the tombstone wins.
        by_version
            .entry(v)
            .and_modify(|e: &mut (usize, bool)| {
                if tombstone {
                    *e = (i, true);
                }
            })
            .or_insert((i, tombstone));
    }
    for v in ancestry {
        if let Some(&(i, tombstone)) = by_version.get(v) {
            return Ok(if tombstone { None } else { Some(i) });
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_zyx_ordering() {
        let blocks = [
            IndexZYX::new(-2, 0, -1),
            IndexZYX::new(5, 0, -1),
            IndexZYX::new(0, 1, -1),
            IndexZYX::new(0, 0, 0),
            IndexZYX::new(1, 0, 0),
            IndexZYX::new(0, 3, 2),
        ];
        let encoded: Vec<_> = blocks.iter().map(|b| b.bytes()).collect();
        for i in 1..encoded.len() {
            assert!(
                encoded[i - 1] < encoded[i],
                "key order broken between {:?} and {:?}",
                blocks[i - 1],
                blocks[i]
            );
        }
        // Byte order equals tuple order.
        for (block, bytes) in blocks.iter().zip(&encoded) {
            assert_eq!(IndexZYX::from_bytes(bytes).unwrap(), *block);
        }
    }

    #[test]
    fn test_index_zyx_of_voxel() {
        assert_eq!(IndexZYX::of_voxel(0, 0, 0, 32), IndexZYX::new(0, 0, 0));
        assert_eq!(IndexZYX::of_voxel(31, 32, 95, 32), IndexZYX::new(0, 1, 2));
        assert_eq!(IndexZYX::of_voxel(-1, -32, -33, 32), IndexZYX::new(-1, -1, -2));
    }

    #[test]
    fn test_label_spatial_key_ordering() {
        // Same label: byte order follows (z, y, x).
        let a = label_spatial_tkey(7, IndexZYX::new(3, 0, 0));
        let b = label_spatial_tkey(7, IndexZYX::new(0, 0, 1));
        assert!(a < b);
        // Label is the primary sort key.
        let c = label_spatial_tkey(8, IndexZYX::MIN);
        assert!(b < c);

        let (label, zyx) = label_spatial_tkey_parse(&a).unwrap();
        assert_eq!(label, 7);
        assert_eq!(zyx, IndexZYX::new(3, 0, 0));
    }

    #[test]
    fn test_label_sizes_key_ordering() {
        let small = label_sizes_tkey(10, MAX_LABEL);
        let large = label_sizes_tkey(11, 0);
        assert!(small < large);
        assert_eq!(label_sizes_tkey_parse(&small).unwrap(), (10, MAX_LABEL));
    }

    #[test]
    fn test_physical_key_roundtrip() {
        let instance = InstanceId(3);
        let tk = block_tkey(IndexZYX::new(1, 2, 3));
        let key = construct_key(instance, &tk, 9);
        assert_eq!(tkey_from_key(&key).unwrap(), &tk[..]);
        assert_eq!(version_from_key(&key).unwrap(), (9, false));

        let tomb = tombstone_key(instance, &tk, 9);
        assert_eq!(version_from_key(&tomb).unwrap(), (9, true));
        assert!(key < tomb);
    }

    #[test]
    fn test_version_bounds_cover_all_versions() {
        let instance = InstanceId(1);
        let tk = label_sizes_tkey(5, 5);
        let lo = min_version_key(instance, &tk);
        let hi = max_version_key(instance, &tk);
        for v in [0u32, 1, 255, u32::MAX] {
            let key = construct_key(instance, &tk, v);
            assert!(lo <= key && key <= hi);
            let tomb = tombstone_key(instance, &tk, v);
            assert!(lo <= tomb && tomb <= hi);
        }
    }

    #[test]
    fn test_versioned_key_value_resolution() {
        let instance = InstanceId(1);
        let tk = meta_tkey("x");
        let rows = vec![
            (construct_key(instance, &tk, 1), b"root".to_vec()),
            (construct_key(instance, &tk, 3), b"leafier".to_vec()),
        ];

        // Leaf 5 with ancestry [5, 3, 1]: version 3 wins.
        assert_eq!(versioned_key_value(&rows, &[5, 3, 1]).unwrap(), Some(1));
        // Sibling branch [4, 1] only sees the root row.
        assert_eq!(versioned_key_value(&rows, &[4, 1]).unwrap(), Some(0));
        // Unrelated branch sees nothing.
        assert_eq!(versioned_key_value(&rows, &[9, 8]).unwrap(), None);
    }

    #[test]
    fn test_versioned_key_value_tombstone() {
        let instance = InstanceId(1);
        let tk = meta_tkey("x");
        let rows = vec![
            (construct_key(instance, &tk, 1), b"root".to_vec()),
            (tombstone_key(instance, &tk, 3), vec![]),
        ];

        // The tombstone at 3 hides the root value from its descendants.
        assert_eq!(versioned_key_value(&rows, &[3, 1]).unwrap(), None);
        // The root itself still sees its value.
        assert_eq!(versioned_key_value(&rows, &[1]).unwrap(), Some(0));
    }
}
