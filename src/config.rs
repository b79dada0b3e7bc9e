use std::path::PathBuf;

/// Configuration for a label-volume instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the instance's mapping logs.
    pub dir: PathBuf,

    /// Voxel extent of a cubic block along each axis (default: 32)
    pub block_size: i32,

    /// Number of concurrent block handlers for spatial processing (default: 8)
    pub num_block_handlers: usize,

    /// Memory budget for the decoded-block cache in bytes (default: 512MB)
    pub block_cache_bytes: usize,

    /// Number of label-size records per batch commit (default: 10,000)
    pub size_batch: usize,

    /// Number of parallel fetchers for tar assembly (default: 256)
    pub tar_fetchers: usize,

    /// Write forward/inverse mapping records through to the store (default: false)
    pub persist_mapping: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./voxdb"),
            block_size: 32,
            num_block_handlers: 8,
            block_cache_bytes: 512 * 1024 * 1024, // 512MB
            size_batch: 10_000,
            tar_fetchers: 256,
            persist_mapping: false,
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the cubic block extent
    pub fn block_size(mut self, size: i32) -> Self {
        self.block_size = size;
        self
    }

    /// Set the block handler pool size
    pub fn num_block_handlers(mut self, n: usize) -> Self {
        self.num_block_handlers = n;
        self
    }

    /// Set the decoded-block cache budget
    pub fn block_cache_bytes(mut self, bytes: usize) -> Self {
        self.block_cache_bytes = bytes;
        self
    }

    /// Set the label-size batch size
    pub fn size_batch(mut self, n: usize) -> Self {
        self.size_batch = n;
        self
    }

    /// Set the tar fan-out width
    pub fn tar_fetchers(mut self, n: usize) -> Self {
        self.tar_fetchers = n;
        self
    }

    /// Enable persisted forward/inverse mapping records
    pub fn persist_mapping(mut self, enabled: bool) -> Self {
        self.persist_mapping = enabled;
        self
    }

    /// Number of bytes in one dense label block.
    pub fn block_bytes(&self) -> usize {
        let bs = self.block_size as usize;
        bs * bs * bs * 8
    }
}
