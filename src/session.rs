//! A cache session: one backing file, its allocator and its eviction buffer
//!
//! Sessions wire the three components together from a [`CacheConfig`] and
//! carry the free-space map across process restarts:
//!
//! ```rust,no_run
//! use boxcache::{CacheConfig, CacheSession};
//!
//! # fn main() -> boxcache::Result<()> {
//! let session = CacheSession::create("/tmp/boxcache/cache.bin", CacheConfig::new(64 << 20))?;
//! // ... touch, pin and mutate units through session.buffer() ...
//! let manifest = session.close()?;
//! manifest.save_to_file("/tmp/boxcache/cache.space.toml")?;
//! # Ok(())
//! # }
//! ```

use crate::cache::EvictionBuffer;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::storage::{BackingFile, FileSpaceAllocator};
use crate::types::FileRange;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Persisted allocator state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceManifest {
    /// Logical end of the backing file
    pub end_of_file: u64,
    /// Free ranges in offset order
    #[serde(default)]
    pub free: Vec<FileRange>,
}

impl SpaceManifest {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to parse space manifest {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Write to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize space manifest: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Backing file, allocator and eviction buffer for one cache
#[derive(Debug)]
pub struct CacheSession {
    config: CacheConfig,
    buffer: Arc<EvictionBuffer>,
}

impl CacheSession {
    /// Start a session on a new, empty backing file
    pub fn create(path: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let file = Arc::new(BackingFile::create(path)?);
        let allocator = Arc::new(FileSpaceAllocator::new(config.shrink_policy));
        Ok(Self::assemble(config, file, allocator))
    }

    /// Reopen a backing file written by an earlier session
    ///
    /// Units that still live in the file must be reconstructed by the caller
    /// from their own records of `(offset, length)`; the manifest only carries
    /// which space is free.
    pub fn open(
        path: impl AsRef<Path>,
        config: CacheConfig,
        manifest: &SpaceManifest,
    ) -> Result<Self> {
        config.validate()?;
        let file = BackingFile::open(path)?;
        if file.len() > manifest.end_of_file {
            return Err(Error::Configuration(format!(
                "backing file is {} bytes but the manifest ends at {}",
                file.len(),
                manifest.end_of_file
            )));
        }
        let allocator = FileSpaceAllocator::restore(
            config.shrink_policy,
            manifest.end_of_file,
            &manifest.free,
        )?;
        Ok(Self::assemble(config, Arc::new(file), Arc::new(allocator)))
    }

    fn assemble(
        config: CacheConfig,
        file: Arc<BackingFile>,
        allocator: Arc<FileSpaceAllocator>,
    ) -> Self {
        info!(
            path = %file.path().display(),
            budget = config.memory_budget_bytes,
            end_of_file = allocator.end_of_file(),
            "Opened cache session"
        );
        let buffer = Arc::new(EvictionBuffer::new(&config, file, allocator));
        Self { config, buffer }
    }

    /// The configuration this session was built from
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The eviction buffer
    pub fn buffer(&self) -> &Arc<EvictionBuffer> {
        &self.buffer
    }

    /// The allocator
    pub fn allocator(&self) -> &Arc<FileSpaceAllocator> {
        self.buffer.allocator()
    }

    /// The backing file
    pub fn file(&self) -> &Arc<BackingFile> {
        self.buffer.file()
    }

    /// Current allocator state
    pub fn manifest(&self) -> SpaceManifest {
        let allocator = self.allocator();
        SpaceManifest {
            end_of_file: allocator.end_of_file(),
            free: allocator.free_space_map(),
        }
    }

    /// Flush every dirty unit, sync the file, and return the allocator state
    ///
    /// Fails if a worker still has a dirty unit pinned; see
    /// [`EvictionBuffer::shutdown`].
    pub fn close(self) -> Result<SpaceManifest> {
        self.buffer.shutdown()?;
        let manifest = self.manifest();
        info!(
            end_of_file = manifest.end_of_file,
            free_ranges = manifest.free.len(),
            "Closed cache session"
        );
        Ok(manifest)
    }
}
