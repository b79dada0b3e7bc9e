//! Durable mapping log.
//!
//! Each version of an instance gets an append-only log file of mapping
//! operations. Replaying a version's log in order reproduces its
//! contribution to the in-memory supervoxel map. Records are framed as a
//! big-endian length prefix, the payload, and a CRC-64 of the payload;
//! payload integers are little-endian, matching the in-memory vmap layout.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::hasher::Hasher;
use crate::version::VersionId;

const LOCK_FILE: &str = "mapping.lock";

/// One mutation of the supervoxel map: every supervoxel in `originals` is
/// mapped to `mapped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingOp {
    pub mut_id: u64,
    pub mapped: u64,
    pub originals: BTreeSet<u64>,
}

impl MappingOp {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.originals.len() * 8);
        buf.write_u64::<LittleEndian>(self.mut_id).unwrap();
        buf.write_u64::<LittleEndian>(self.mapped).unwrap();
        buf.write_u32::<LittleEndian>(self.originals.len() as u32).unwrap();
        for supervoxel in &self.originals {
            buf.write_u64::<LittleEndian>(*supervoxel).unwrap();
        }
        buf
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = payload;
        let mut_id = r
            .read_u64::<LittleEndian>()
            .map_err(|_| errcorrupt!("truncated mapping op"))?;
        let mapped = r
            .read_u64::<LittleEndian>()
            .map_err(|_| errcorrupt!("truncated mapping op"))?;
        let count = r
            .read_u32::<LittleEndian>()
            .map_err(|_| errcorrupt!("truncated mapping op"))? as usize;
        if r.len() != count * 8 {
            return Err(errcorrupt!(
                "mapping op claims {count} supervoxels but carries {} bytes",
                r.len()
            ));
        }
        let mut originals = BTreeSet::new();
        for _ in 0..count {
            originals.insert(r.read_u64::<LittleEndian>().unwrap());
        }
        Ok(Self {
            mut_id,
            mapped,
            originals,
        })
    }
}

/// Per-version append-only log files for one instance.
pub struct MappingLog {
    dir: PathBuf,
    _lock: FileLock,
    writers: Mutex<HashMap<VersionId, BufWriter<File>>>,
}

impl MappingLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join(LOCK_FILE))
            .map_err(|e| Error::Io(format!("can't lock mapping log dir: {e}")))?;
        Ok(Self {
            dir,
            _lock: lock,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self, v: VersionId) -> PathBuf {
        self.dir.join(format!("{v:08}.mlog"))
    }

    /// Appends one op to a version's log and flushes it. The caller holds
    /// the SVMap write lock, so log order matches mutation order.
    pub fn append(&self, v: VersionId, op: &MappingOp) -> Result<()> {
        let mut writers = self.writers.lock().unwrap();
        let writer = match writers.entry(v) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let file = File::options()
                    .create(true)
                    .append(true)
                    .open(self.path(v))?;
                e.insert(BufWriter::new(file))
            }
        };

        let payload = op.encode();
        let mut hasher = Hasher::new();
        hasher.write(&payload);

        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        writer.write_u64::<BigEndian>(hasher.checksum())?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a version's full log. A missing file is an empty log.
    pub fn read(&self, v: VersionId) -> Result<Vec<MappingOp>> {
        let path = self.path(v);
        if !path.exists() {
            return Ok(Vec::new());
        }
        // Anything buffered must be visible to the reader.
        if let Some(writer) = self.writers.lock().unwrap().get_mut(&v) {
            writer.flush()?;
        }
        let mut reader = BufReader::new(File::open(&path)?);
        let mut ops = Vec::new();
        while let Some(op) = Self::read_record(&mut reader, &path)? {
            ops.push(op);
        }
        Ok(ops)
    }

    fn read_record<R: Read>(reader: &mut R, path: &Path) -> Result<Option<MappingOp>> {
        let len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::Corrupt(format!("short mapping record in {}", path.display()))
            }
            _ => e.into(),
        })?;
        let stored = reader.read_u64::<BigEndian>().map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::Corrupt(format!("missing record checksum in {}", path.display()))
            }
            _ => e.into(),
        })?;

        let mut hasher = Hasher::new();
        hasher.write(&payload);
        if hasher.checksum() != stored {
            return Err(Error::Corrupt(format!(
                "record checksum mismatch in {}: stored={stored}, computed={}",
                path.display(),
                hasher.checksum()
            )));
        }
        MappingOp::decode(&payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn op(mut_id: u64, mapped: u64, originals: &[u64]) -> MappingOp {
        MappingOp {
            mut_id,
            mapped,
            originals: originals.iter().copied().collect(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = MappingLog::open(dir.path()).expect("Failed to open log");

        log.append(4, &op(1, 10, &[1, 2])).unwrap();
        log.append(4, &op(2, 20, &[2])).unwrap();
        log.append(7, &op(3, 30, &[5])).unwrap();

        assert_eq!(log.read(4).unwrap(), vec![op(1, 10, &[1, 2]), op(2, 20, &[2])]);
        assert_eq!(log.read(7).unwrap(), vec![op(3, 30, &[5])]);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = MappingLog::open(dir.path()).expect("Failed to open log");
        assert!(log.read(99).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let log = MappingLog::open(dir.path()).unwrap();
            log.append(1, &op(9, 100, &[3, 4, 5])).unwrap();
        }
        let log = MappingLog::open(dir.path()).unwrap();
        assert_eq!(log.read(1).unwrap(), vec![op(9, 100, &[3, 4, 5])]);
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = {
            let log = MappingLog::open(dir.path()).unwrap();
            log.append(2, &op(1, 10, &[1])).unwrap();
            log.path(2)
        };

        // Flip a payload byte past the length prefix.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let log = MappingLog::open(dir.path()).unwrap();
        match log.read(2) {
            Err(Error::Corrupt(_)) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn test_op_encoding_is_little_endian() {
        let encoded = op(1, 0x0102030405060708, &[0x11]).encode();
        // mut_id, then mapped label in little-endian order.
        assert_eq!(&encoded[0..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&encoded[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&encoded[16..20], &[1, 0, 0, 0]);
        assert_eq!(MappingOp::decode(&encoded).unwrap(), op(1, 0x0102030405060708, &[0x11]));
    }
}
