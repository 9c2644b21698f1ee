//! Content addressing.
//!
//! A specimen is identified solely by the SHA-256 digest of its image bytes.
//! Identical bytes are the same specimen regardless of file name, location or
//! the run that encountered them.

use crate::{Result, SpecimenError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Hex digest width (SHA-256 → 32 bytes → 64 hex digits).
const CONTENT_HASH_HEX_WIDTH: usize = 64;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 digest of an image's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a hex digest produced by [`hash_bytes`] or printed by the CLI.
    ///
    /// Uppercase input is normalised to lowercase.
    ///
    /// # Errors
    ///
    /// Returns `SpecimenError::InvalidArgument` when the input is not 64 hex
    /// digits.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != CONTENT_HASH_HEX_WIDTH || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SpecimenError::invalid_argument(format!(
                "content hash must be {} hex digits, got {:?}",
                CONTENT_HASH_HEX_WIDTH, value
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ContentHash {
    type Err = SpecimenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = SpecimenError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

/// Hash an in-memory byte sequence.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_digest(Sha256::digest(data))
}

/// Hash a string key (cache keys derived from references, row file names).
pub(crate) fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Hash a file asynchronously, streaming it in fixed-size chunks.
///
/// # Errors
///
/// Returns `SpecimenError::Io` for I/O errors (these always bubble up).
pub async fn hash_file(path: impl AsRef<Path>) -> Result<ContentHash> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(ContentHash::from_digest(hasher.finalize()))
}

/// Blocking variant of [`hash_file`].
pub fn hash_file_sync(path: impl AsRef<Path>) -> Result<ContentHash> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(ContentHash::from_digest(hasher.finalize()))
}
