use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CACHE_SIZE: u32 = 2000;
pub const DEFAULT_PAGE_SIZE: u32 = 1024;
pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;
pub const DEFAULT_BUSY_RETRY_COUNT: u32 = 100;
pub const DEFAULT_BULK_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// Backed by a database file and its environment directory.
    Named,
    /// Private to one connection, kept in the shared temporary environment.
    InMemory,
    /// Ephemeral tables for intermediate results, not transactional.
    Transient,
}

/// How a table clear removes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncateMode {
    /// Delete all rows of the table.
    InPlace,
    /// Rename the table away and create an empty one under the old name.
    /// The renamed table is removed once the transaction commits.
    RenameRecreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Database file, required by named storage.
    pub path: Option<PathBuf>,
    pub storage: StorageMode,
    pub read_only: bool,
    pub create: bool,
    /// Cache size in pages.
    pub cache_size: u32,
    pub page_size: u32,
    /// Maximum pages per table, zero means unlimited.
    pub max_page_count: u32,
    pub truncate_mode: TruncateMode,
    /// Retry bound for table opens failing on lock contention.
    pub busy_retry_count: u32,
    pub read_uncommitted: bool,
    /// Checkpoint on commit once the log grows beyond this many KiB.
    pub log_file_size: u32,
    /// Byte capacity of the bulk-load buffer, zero disables it.
    pub bulk_buffer_size: usize,
    /// Buffer inserts into the results table of transient storage.
    pub results_buffer: bool,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Config {
            path: None,
            storage: StorageMode::InMemory,
            read_only: false,
            create: true,
            cache_size: DEFAULT_CACHE_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            max_page_count: 0,
            truncate_mode: TruncateMode::InPlace,
            busy_retry_count: DEFAULT_BUSY_RETRY_COUNT,
            read_uncommitted: false,
            log_file_size: 0,
            bulk_buffer_size: DEFAULT_BULK_BUFFER_SIZE,
            results_buffer: true,
        }
    }
}

impl Config {
    #[inline]
    pub fn named(path: impl AsRef<Path>) -> Self {
        Config {
            path: Some(path.as_ref().to_path_buf()),
            storage: StorageMode::Named,
            ..Default::default()
        }
    }

    #[inline]
    pub fn in_memory() -> Self {
        Config::default()
    }

    #[inline]
    pub fn transient() -> Self {
        Config {
            storage: StorageMode::Transient,
            ..Default::default()
        }
    }

    #[inline]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[inline]
    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    #[inline]
    pub fn with_cache_size(mut self, cache_size: u32) -> Self {
        self.cache_size = cache_size;
        self
    }

    #[inline]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[inline]
    pub fn with_max_page_count(mut self, max_page_count: u32) -> Self {
        self.max_page_count = max_page_count;
        self
    }

    #[inline]
    pub fn with_truncate_mode(mut self, truncate_mode: TruncateMode) -> Self {
        self.truncate_mode = truncate_mode;
        self
    }

    #[inline]
    pub fn with_busy_retry_count(mut self, count: u32) -> Self {
        self.busy_retry_count = count;
        self
    }

    #[inline]
    pub fn with_read_uncommitted(mut self, read_uncommitted: bool) -> Self {
        self.read_uncommitted = read_uncommitted;
        self
    }

    #[inline]
    pub fn with_log_file_size(mut self, kb: u32) -> Self {
        self.log_file_size = kb;
        self
    }

    #[inline]
    pub fn with_bulk_buffer_size(mut self, size: usize) -> Self {
        self.bulk_buffer_size = size;
        self
    }

    #[inline]
    pub fn with_results_buffer(mut self, enabled: bool) -> Self {
        self.results_buffer = enabled;
        self
    }

    #[inline]
    pub fn is_transactional(&self) -> bool {
        self.storage != StorageMode::Transient
    }

    /// Environment directory of named storage.
    #[inline]
    pub fn env_dir(&self) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        let mut dir = path.as_os_str().to_owned();
        dir.push("-journal");
        Some(PathBuf::from(dir))
    }

    /// Whether a page size is acceptable.
    #[inline]
    pub fn valid_page_size(page_size: u32) -> bool {
        page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
    }
}
