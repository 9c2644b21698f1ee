//! Image locators.
//!
//! An [`ImageLocator`] turns a logical [`ImageRef`] into readable bytes or a
//! local file path, independent of the storage medium. The set of variants is
//! small and closed, selected from configuration by [`build_locator`]:
//!
//! - [`LocalLocator`] - files under a root directory
//! - [`RemoteLocator`] - objects in an S3-compatible bucket over HTTP
//! - [`CachingLocator`] - decorator keeping local copies of another locator's
//!   images under an LRU byte budget
//!
//! # Example
//!
//! ```rust,no_run
//! use specimen_cache::locator::{ImageLocator, LocalLocator};
//! use specimen_cache::ImageRef;
//!
//! # async fn example() -> specimen_cache::Result<()> {
//! let locator = LocalLocator::new("/srv/scans")?;
//! let image = locator.resolve(&ImageRef::new("batch-7/IMG_0001.jpg")?).await?;
//! println!("{} ({} bytes)", image.path().display(), image.size());
//! # Ok(())
//! # }
//! ```

pub mod local;
pub mod remote;

pub use local::LocalLocator;
pub use remote::{RemoteLocator, RemoteOptions};

pub use crate::cache::{CachingLocator, LocalCacheStats};

use crate::Result;
use crate::cache::CacheLease;
use crate::core::config::{BackendKind, StorageConfig};
use crate::types::ImageRef;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Locator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorKind {
    Local,
    Remote,
    Caching,
}

/// Capability to resolve logical image references.
///
/// Implementations must be `Send + Sync`: one locator is shared by every
/// worker of a batch.
#[async_trait]
pub trait ImageLocator: Send + Sync {
    fn kind(&self) -> LocatorKind;

    /// Resolve a reference to a readable local file.
    ///
    /// # Errors
    ///
    /// - `SpecimenError::NotFound` - the image does not exist
    /// - `SpecimenError::Transient` - network or auth failure, retryable
    /// - `SpecimenError::Io` - local I/O errors
    async fn resolve(&self, reference: &ImageRef) -> Result<ResolvedImage>;

    /// Read the full image bytes.
    async fn read_bytes(&self, reference: &ImageRef) -> Result<Vec<u8>>;

    /// List every available image reference, sorted.
    async fn list(&self) -> Result<Vec<ImageRef>>;

    /// Local copy cache statistics, for locators that keep one.
    fn cache_stats(&self) -> Option<LocalCacheStats> {
        None
    }
}

enum Hold {
    Direct,
    Staged(#[allow(dead_code)] tempfile::TempPath),
    Leased(#[allow(dead_code)] CacheLease),
}

/// A resolved image: a local path plus whatever keeps it valid.
///
/// Staged downloads are deleted and cache leases released when the value is
/// dropped, so callers keep it alive for as long as they use [`path`](Self::path).
/// The path is ephemeral and must never be stored as an identifier.
pub struct ResolvedImage {
    path: PathBuf,
    size: u64,
    hold: Hold,
}

impl ResolvedImage {
    /// A file that exists independently of this value.
    pub fn direct(path: PathBuf, size: u64) -> Self {
        Self {
            path,
            size,
            hold: Hold::Direct,
        }
    }

    /// A temporary download, removed on drop.
    pub fn staged(path: tempfile::TempPath, size: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            size,
            hold: Hold::Staged(path),
        }
    }

    pub(crate) fn leased(path: PathBuf, size: u64, lease: CacheLease) -> Self {
        Self {
            path,
            size,
            hold: Hold::Leased(lease),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.hold, Hold::Leased(_))
    }
}

impl std::fmt::Debug for ResolvedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hold = match self.hold {
            Hold::Direct => "direct",
            Hold::Staged(_) => "staged",
            Hold::Leased(_) => "leased",
        };
        f.debug_struct("ResolvedImage")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("hold", &hold)
            .finish()
    }
}

/// Build the locator described by `config`, wrapped in the caching decorator
/// when a cache section is present.
pub fn build_locator(config: &StorageConfig) -> Result<Arc<dyn ImageLocator>> {
    config.validate()?;

    match (config.kind, &config.cache) {
        (BackendKind::Local, None) => Ok(Arc::new(LocalLocator::from_config(config)?)),
        (BackendKind::Local, Some(cache)) => Ok(Arc::new(CachingLocator::open(
            LocalLocator::from_config(config)?,
            cache,
        )?)),
        (BackendKind::Remote, None) => Ok(Arc::new(RemoteLocator::from_config(config)?)),
        (BackendKind::Remote, Some(cache)) => Ok(Arc::new(CachingLocator::open(
            RemoteLocator::from_config(config)?,
            cache,
        )?)),
    }
}
