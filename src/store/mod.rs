pub mod ctx;
pub mod memory;

use std::sync::Arc;
use std::time::SystemTime;

use crate::error::Result;

pub use ctx::VersionedCtx;
pub use memory::MemoryStore;

/// Reserved key written by bucket-style backends on first open so a later
/// open can distinguish a fresh store from an emptied one.
pub const INIT_KEY: &[u8] = b"initialized";

/// An ordered stream of key-value pairs from a range scan.
pub type ScanIterator = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send>;

/// Point reads. `Ok(None)` means the key does not exist, which is distinct
/// from a key holding an empty value.
pub trait Getter: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Point writes and deletes.
pub trait Setter: Send + Sync {
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// A transactional writer. Writes are buffered until `commit`; a successful
/// commit is durable. A `Batch` is single-threaded and must not be shared.
pub trait Batch: Send {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);

    fn delete(&mut self, key: Vec<u8>);

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Batched writes. Backends that cannot provide atomic batches must still
/// guarantee per-key atomicity.
pub trait BatchedSetter: Send + Sync {
    fn batch(&self) -> Box<dyn Batch>;
}

/// Ordered range scans. Bounds are inclusive on both ends and results are
/// ordered by byte-lexical key.
pub trait RangeScanner: Send + Sync {
    fn scan(&self, lo: &[u8], hi: &[u8]) -> Result<ScanIterator>;

    fn keys_in_range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// Optional capability: point reads that also report the key's last
/// modification time.
pub trait TimestampedGetter: Getter {
    fn get_with_timestamp(&self, key: &[u8]) -> Result<Option<(Vec<u8>, SystemTime)>>;
}

/// The full facade over an ordered key-value backend. Individual backends
/// implement a subset of the capability traits; the facade advertises which
/// optional ones are available.
pub trait KvEngine: Getter + Setter + BatchedSetter + RangeScanner {
    /// Whether `timestamped()` returns a usable getter.
    fn supports_timestamps(&self) -> bool {
        false
    }

    fn timestamped(&self) -> Option<&dyn TimestampedGetter> {
        None
    }
}

/// Shared handle to a key-value backend.
pub type KvStore = Arc<dyn KvEngine + Send + Sync>;
