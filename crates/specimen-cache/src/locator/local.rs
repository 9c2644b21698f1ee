//! Local filesystem locator.

use super::{ImageLocator, LocatorKind, ResolvedImage};
use crate::core::config::StorageConfig;
use crate::types::ImageRef;
use crate::{Result, SpecimenError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Resolves references against a root directory.
#[derive(Debug, Clone)]
pub struct LocalLocator {
    root: PathBuf,
}

impl LocalLocator {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(SpecimenError::validation("local locator root is empty"));
        }
        Ok(Self { root })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let root = config
            .root
            .clone()
            .ok_or_else(|| SpecimenError::validation("storage.root is required for the local backend"))?;
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &ImageRef) -> PathBuf {
        let mut path = self.root.clone();
        for component in reference.components() {
            path.push(component);
        }
        path
    }
}

fn map_not_found(err: std::io::Error, reference: &ImageRef) -> SpecimenError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SpecimenError::not_found(reference.as_str())
    } else {
        SpecimenError::Io(err)
    }
}

#[async_trait]
impl ImageLocator for LocalLocator {
    fn kind(&self) -> LocatorKind {
        LocatorKind::Local
    }

    async fn resolve(&self, reference: &ImageRef) -> Result<ResolvedImage> {
        let path = self.path_for(reference);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(e, reference))?;

        if !metadata.is_file() {
            return Err(SpecimenError::not_found(reference.as_str()));
        }

        Ok(ResolvedImage::direct(path, metadata.len()))
    }

    async fn read_bytes(&self, reference: &ImageRef) -> Result<Vec<u8>> {
        let image = self.resolve(reference).await?;
        tokio::fs::read(image.path())
            .await
            .map_err(|e| map_not_found(e, reference))
    }

    async fn list(&self) -> Result<Vec<ImageRef>> {
        let root = self.root.clone();
        let mut references = tokio::task::spawn_blocking(move || {
            let mut references = Vec::new();
            collect_references(&root, &mut Vec::new(), &mut references)?;
            Ok::<_, SpecimenError>(references)
        })
        .await
        .map_err(|e| SpecimenError::Other(format!("Directory listing task failed: {}", e)))??;

        references.sort();
        Ok(references)
    }
}

fn collect_references(dir: &Path, prefix: &mut Vec<String>, out: &mut Vec<ImageRef>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::debug!("Skipping non UTF-8 file name under {}", dir.display());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        if file_type.is_dir() {
            prefix.push(name);
            collect_references(&entry.path(), prefix, out)?;
            prefix.pop();
        } else if file_type.is_file() {
            let mut key = prefix.join("/");
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(&name);

            match ImageRef::new(key) {
                Ok(reference) => out.push(reference),
                Err(e) => tracing::debug!("Skipping unrepresentable path: {}", e),
            }
        }
    }

    Ok(())
}
