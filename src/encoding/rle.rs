//! Run-length encoding for sparse label volumes.
//!
//! A run covers voxels along X at a fixed (y, z). The wire format is 16
//! little-endian bytes per run: start x, start y, start z, length, each an
//! i32. Sparse-volume payloads prepend a 12-byte header.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub const RUN_SIZE: usize = 16;

/// Sparse-volume payload descriptor for binary-only encodings.
pub const PAYLOAD_BINARY: u8 = 0x00;

/// Byte length of the sparse-volume header preceding the runs.
pub const SPARSE_VOL_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub length: i32,
}

impl Run {
    pub fn new(x: i32, y: i32, z: i32, length: i32) -> Self {
        Self { x, y, z, length }
    }

    /// Exclusive end of the run along X.
    pub fn end(&self) -> i32 {
        self.x + self.length
    }

    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        self.y == y && self.z == z && x >= self.x && x < self.end()
    }
}

/// Encodes runs as concatenated 16-byte records.
pub fn encode_runs(runs: &[Run]) -> Vec<u8> {
    let mut buf = vec![0u8; runs.len() * RUN_SIZE];
    for (i, run) in runs.iter().enumerate() {
        let rec = &mut buf[i * RUN_SIZE..(i + 1) * RUN_SIZE];
        LittleEndian::write_i32(&mut rec[0..4], run.x);
        LittleEndian::write_i32(&mut rec[4..8], run.y);
        LittleEndian::write_i32(&mut rec[8..12], run.z);
        LittleEndian::write_i32(&mut rec[12..16], run.length);
    }
    buf
}

/// Decodes concatenated 16-byte records, rejecting misaligned input.
pub fn decode_runs(buf: &[u8]) -> Result<Vec<Run>> {
    if buf.len() % RUN_SIZE != 0 {
        return Err(Error::MalformedRle(buf.len()));
    }
    let mut runs = Vec::with_capacity(buf.len() / RUN_SIZE);
    for rec in buf.chunks_exact(RUN_SIZE) {
        runs.push(Run {
            x: LittleEndian::read_i32(&rec[0..4]),
            y: LittleEndian::read_i32(&rec[4..8]),
            z: LittleEndian::read_i32(&rec[8..12]),
            length: LittleEndian::read_i32(&rec[12..16]),
        });
    }
    Ok(runs)
}

/// Total voxel and run counts of an encoded value, without a full decode.
pub fn stats_runs(buf: &[u8]) -> Result<(u64, u32)> {
    if buf.len() % RUN_SIZE != 0 {
        return Err(Error::MalformedRle(buf.len()));
    }
    let mut voxels = 0u64;
    let mut runs = 0u32;
    for rec in buf.chunks_exact(RUN_SIZE) {
        voxels += LittleEndian::read_i32(&rec[12..16]) as u64;
        runs += 1;
    }
    Ok((voxels, runs))
}

/// The 12-byte sparse-volume header with zero placeholders for the voxel
/// and run counts.
pub fn sparse_vol_header() -> Vec<u8> {
    let mut buf = Vec::with_capacity(SPARSE_VOL_HEADER_SIZE);
    buf.push(PAYLOAD_BINARY);
    buf.push(3); // # dimensions
    buf.push(0); // dimension of run (X)
    buf.push(0); // reserved
    buf.extend_from_slice(&[0u8; 4]); // # voxels placeholder
    buf.extend_from_slice(&[0u8; 4]); // # runs, patched after the scan
    buf
}

/// Patches the run count into a sparse-volume payload's header.
pub fn patch_run_count(buf: &mut [u8], num_runs: u32) {
    LittleEndian::write_u32(&mut buf[8..12], num_runs);
}

/// Builds a complete sparse-volume payload from runs.
pub fn encode_sparse_vol(runs: &[Run]) -> Vec<u8> {
    let mut buf = sparse_vol_header();
    patch_run_count(&mut buf, runs.len() as u32);
    buf.extend_from_slice(&encode_runs(runs));
    buf
}

/// Parses a sparse-volume payload, returning its runs. Consumers tolerate
/// zero placeholders in the voxel count.
pub fn parse_sparse_vol(buf: &[u8]) -> Result<Vec<Run>> {
    if buf.len() < SPARSE_VOL_HEADER_SIZE {
        return Err(Error::MalformedRle(buf.len()));
    }
    if buf[0] != PAYLOAD_BINARY {
        return Err(Error::BadRequest(format!(
            "unsupported sparse volume payload descriptor {:#04x}",
            buf[0]
        )));
    }
    if buf[1] != 3 || buf[2] != 0 {
        return Err(Error::BadRequest(format!(
            "unsupported sparse volume geometry: {} dims, run dim {}",
            buf[1], buf[2]
        )));
    }
    decode_runs(&buf[SPARSE_VOL_HEADER_SIZE..])
}

/// True if any run covers the given voxel.
pub fn contains(runs: &[Run], x: i32, y: i32, z: i32) -> bool {
    runs.iter().any(|r| r.contains(x, y, z))
}

/// Subtracts `minus` from `base`, splitting runs where intervals overlap.
/// Runs only interact within the same (y, z) row.
pub fn subtract(base: &[Run], minus: &[Run]) -> Vec<Run> {
    let mut out = Vec::with_capacity(base.len());
    for run in base {
        let mut pieces = vec![(run.x, run.end())];
        for m in minus.iter().filter(|m| m.y == run.y && m.z == run.z) {
            let mut next = Vec::with_capacity(pieces.len() + 1);
            for (lo, hi) in pieces {
                if m.end() <= lo || m.x >= hi {
                    next.push((lo, hi));
                    continue;
                }
                if m.x > lo {
                    next.push((lo, m.x));
                }
                if m.end() < hi {
                    next.push((m.end(), hi));
                }
            }
            pieces = next;
        }
        for (lo, hi) in pieces {
            out.push(Run::new(lo, run.y, run.z, hi - lo));
        }
    }
    out
}

/// Intersects two run sets row-wise.
pub fn intersect(a: &[Run], b: &[Run]) -> Vec<Run> {
    let mut out = Vec::new();
    for run in a {
        for other in b.iter().filter(|o| o.y == run.y && o.z == run.z) {
            let lo = run.x.max(other.x);
            let hi = run.end().min(other.end());
            if lo < hi {
                out.push(Run::new(lo, run.y, run.z, hi - lo));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_bytes() {
        let runs = vec![
            Run::new(0, 0, 0, 19),
            Run::new(-5, 3, 7, 1),
            Run::new(64, 127, 127, 64),
        ];
        let encoded = encode_runs(&runs);
        assert_eq!(encoded.len(), runs.len() * RUN_SIZE);
        let decoded = decode_runs(&encoded).unwrap();
        assert_eq!(decoded, runs);
        assert_eq!(encode_runs(&decoded), encoded);
    }

    #[test]
    fn test_malformed_length_rejected() {
        let err = decode_runs(&[0u8; 17]).unwrap_err();
        assert_eq!(err, Error::MalformedRle(17));
        assert_eq!(stats_runs(&[0u8; 15]).unwrap_err(), Error::MalformedRle(15));
    }

    #[test]
    fn test_stats() {
        let runs = vec![Run::new(0, 0, 0, 10), Run::new(5, 1, 0, 7)];
        let (voxels, n) = stats_runs(&encode_runs(&runs)).unwrap();
        assert_eq!(voxels, 17);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_sparse_vol_header_layout() {
        let runs = vec![Run::new(1, 2, 3, 4)];
        let buf = encode_sparse_vol(&runs);
        assert_eq!(buf.len(), SPARSE_VOL_HEADER_SIZE + RUN_SIZE);
        assert_eq!(buf[0], PAYLOAD_BINARY);
        assert_eq!(buf[1], 3);
        assert_eq!(buf[2], 0);
        assert_eq!(buf[3], 0);
        // Voxel count stays a zero placeholder.
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(LittleEndian::read_u32(&buf[8..12]), 1);
        assert_eq!(parse_sparse_vol(&buf).unwrap(), runs);
    }

    #[test]
    fn test_subtract_splits_runs() {
        let base = vec![Run::new(0, 0, 0, 10)];
        let minus = vec![Run::new(3, 0, 0, 4)];
        assert_eq!(
            subtract(&base, &minus),
            vec![Run::new(0, 0, 0, 3), Run::new(7, 0, 0, 3)]
        );

        // Different row: untouched.
        let minus = vec![Run::new(3, 1, 0, 4)];
        assert_eq!(subtract(&base, &minus), base);

        // Full coverage removes the run.
        let minus = vec![Run::new(0, 0, 0, 10)];
        assert!(subtract(&base, &minus).is_empty());
    }

    #[test]
    fn test_intersect() {
        let a = vec![Run::new(0, 0, 0, 10), Run::new(0, 1, 0, 10)];
        let b = vec![Run::new(5, 0, 0, 10)];
        assert_eq!(intersect(&a, &b), vec![Run::new(5, 0, 0, 5)]);
        assert!(intersect(&[Run::new(0, 0, 0, 3)], &[Run::new(3, 0, 0, 3)]).is_empty());
    }

    #[test]
    fn test_contains() {
        let runs = vec![Run::new(2, 1, 1, 5)];
        assert!(contains(&runs, 2, 1, 1));
        assert!(contains(&runs, 6, 1, 1));
        assert!(!contains(&runs, 7, 1, 1));
        assert!(!contains(&runs, 3, 0, 1));
    }
}
