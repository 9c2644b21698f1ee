use crate::core::io::{is_temp_file, read_optional, write_atomic};
use crate::hash::{ContentHash, hash_key};
use crate::types::OcrResult;
use crate::{Result, SpecimenError};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persistent store of OCR results keyed by (content hash, engine, engine version).
///
/// Each row lives in its own msgpack file named after a hash of its key, so
/// upserts to different keys never touch the same file. Writes go through a
/// temp file and a rename under a key-scoped lock: concurrent readers see
/// either the previous row or the new one.
pub struct OcrResultCache {
    cache_dir: PathBuf,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OcrResultCache {
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| {
            SpecimenError::cache_with_source(
                format!("Failed to create OCR cache directory {}", cache_dir.display()),
                e,
            )
        })?;

        Ok(Self {
            cache_dir,
            key_locks: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn row_key(specimen_hash: &ContentHash, engine: &str, engine_version: &str) -> String {
        hash_key(&format!("{}\0{}\0{}", specimen_hash, engine, engine_version))
    }

    fn row_path(&self, row_key: &str) -> PathBuf {
        self.cache_dir.join(&row_key[..2]).join(format!("{}.msgpack", row_key))
    }

    fn lock_for(&self, row_key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(row_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current result for the key, if any.
    pub fn get(&self, specimen_hash: &ContentHash, engine: &str, engine_version: &str) -> Result<Option<OcrResult>> {
        let row_key = Self::row_key(specimen_hash, engine, engine_version);
        let Some(bytes) = read_optional(&self.row_path(&row_key))? else {
            return Ok(None);
        };

        let row: OcrResult = rmp_serde::from_slice(&bytes)?;
        if row.specimen_hash != *specimen_hash || row.engine != engine || row.engine_version != engine_version {
            tracing::warn!(
                "OCR cache row {} holds a different key ({} / {} / {}), ignoring it",
                row_key,
                row.specimen_hash.short(),
                row.engine,
                row.engine_version
            );
            return Ok(None);
        }

        Ok(Some(row))
    }

    /// Insert or replace the result for the key.
    ///
    /// Writing the same values twice leaves the store unchanged apart from
    /// `updated_at`.
    ///
    /// # Errors
    ///
    /// - `SpecimenError::InvalidArgument` - confidence outside `[0.0, 1.0]`
    ///   (or NaN), empty engine or engine version
    /// - `SpecimenError::Io` - the row could not be written
    pub fn put(
        &self,
        specimen_hash: &ContentHash,
        engine: &str,
        engine_version: &str,
        text: &str,
        confidence: f64,
        error: bool,
    ) -> Result<()> {
        self.put_result(&OcrResult {
            specimen_hash: specimen_hash.clone(),
            engine: engine.to_string(),
            engine_version: engine_version.to_string(),
            text: text.to_string(),
            confidence,
            error,
            error_message: None,
            updated_at: Utc::now(),
        })
    }

    /// Insert or replace a full row.
    pub fn put_result(&self, result: &OcrResult) -> Result<()> {
        validate_row(result)?;

        let row_key = Self::row_key(&result.specimen_hash, &result.engine, &result.engine_version);
        let path = self.row_path(&row_key);
        let serialized = rmp_serde::to_vec(result)?;

        let lock = self.lock_for(&row_key);
        {
            let _guard = lock.lock();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomic(&path, &serialized)?;
        }
        drop(lock);
        self.key_locks.remove_if(&row_key, |_, lock| Arc::strong_count(lock) == 1);

        tracing::debug!(
            "Stored OCR result for {} ({} {}, error={})",
            result.specimen_hash.short(),
            result.engine,
            result.engine_version,
            result.error
        );
        Ok(())
    }

    fn row_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for shard in fs::read_dir(&self.cache_dir)?.flatten() {
            if !shard.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            for entry in fs::read_dir(shard.path())?.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".msgpack") && !is_temp_file(&name) {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn stats(&self) -> Result<OcrCacheStats> {
        let mut stats = OcrCacheStats::default();
        for path in self.row_files()? {
            stats.total_entries += 1;
            if let Ok(metadata) = fs::metadata(&path) {
                stats.total_bytes += metadata.len();
            }
        }
        Ok(stats)
    }

    /// Snapshot of every stored row, ordered by specimen, engine and version.
    pub fn entries(&self) -> Result<Vec<OcrResult>> {
        let mut rows = Vec::new();
        for path in self.row_files()? {
            match read_optional(&path)? {
                Some(bytes) => rows.push(rmp_serde::from_slice::<OcrResult>(&bytes)?),
                None => continue,
            }
        }
        rows.sort_by(|a, b| {
            (a.specimen_hash.as_str(), &a.engine, &a.engine_version).cmp(&(
                b.specimen_hash.as_str(),
                &b.engine,
                &b.engine_version,
            ))
        });
        Ok(rows)
    }
}

fn validate_row(result: &OcrResult) -> Result<()> {
    if result.engine.is_empty() {
        return Err(SpecimenError::invalid_argument("engine must not be empty"));
    }
    if result.engine_version.is_empty() {
        return Err(SpecimenError::invalid_argument("engine version must not be empty"));
    }
    if !(0.0..=1.0).contains(&result.confidence) {
        return Err(SpecimenError::invalid_argument(format!(
            "confidence {} is outside [0.0, 1.0]",
            result.confidence
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrCacheStats {
    pub total_entries: usize,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn setup() -> (tempfile::TempDir, OcrResultCache) {
        let temp_dir = tempfile::tempdir().unwrap();
        let cache = OcrResultCache::open(temp_dir.path().join("ocr")).unwrap();
        (temp_dir, cache)
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, cache) = setup();
        let h1 = hash_bytes(b"specimen one");

        cache.put(&h1, "vision", "1", "Aster sp.", 0.9, false).unwrap();

        let row = cache.get(&h1, "vision", "1").unwrap().unwrap();
        assert_eq!(row.summary(), ("Aster sp.", 0.9, false));
        assert_eq!(row.specimen_hash, h1);
    }

    #[test]
    fn test_miss() {
        let (_dir, cache) = setup();
        assert!(cache.get(&hash_bytes(b"nothing"), "vision", "1").unwrap().is_none());
    }

    #[test]
    fn test_versions_coexist() {
        let (_dir, cache) = setup();
        let h1 = hash_bytes(b"specimen one");

        cache.put(&h1, "vision", "1", "Aster sp.", 0.9, false).unwrap();
        assert!(cache.get(&h1, "vision", "2").unwrap().is_none());

        cache.put(&h1, "vision", "2", "Aster alpinus", 0.95, false).unwrap();
        assert_eq!(cache.get(&h1, "vision", "1").unwrap().unwrap().text, "Aster sp.");
        assert_eq!(cache.get(&h1, "vision", "2").unwrap().unwrap().text, "Aster alpinus");
        assert!(cache.get(&h1, "tesseract", "1").unwrap().is_none());
    }

    #[test]
    fn test_put_is_idempotent_upsert() {
        let (_dir, cache) = setup();
        let h1 = hash_bytes(b"specimen one");

        cache.put(&h1, "vision", "1", "first", 0.5, false).unwrap();
        cache.put(&h1, "vision", "1", "Aster sp.", 0.9, false).unwrap();
        cache.put(&h1, "vision", "1", "Aster sp.", 0.9, false).unwrap();

        assert_eq!(cache.get(&h1, "vision", "1").unwrap().unwrap().text, "Aster sp.");
        assert_eq!(cache.stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_error_rows() {
        let (_dir, cache) = setup();
        let h1 = hash_bytes(b"specimen one");

        cache
            .put_result(&OcrResult {
                specimen_hash: h1.clone(),
                engine: "vision".to_string(),
                engine_version: "1".to_string(),
                text: String::new(),
                confidence: 0.0,
                error: true,
                error_message: Some("engine crashed".to_string()),
                updated_at: Utc::now(),
            })
            .unwrap();

        let row = cache.get(&h1, "vision", "1").unwrap().unwrap();
        assert!(row.error);
        assert_eq!(row.error_message.as_deref(), Some("engine crashed"));
    }

    #[test]
    fn test_invalid_arguments() {
        let (_dir, cache) = setup();
        let h1 = hash_bytes(b"specimen one");

        for confidence in [-0.1, 1.01, f64::NAN] {
            let err = cache.put(&h1, "vision", "1", "x", confidence, false).unwrap_err();
            assert!(matches!(err, SpecimenError::InvalidArgument { .. }));
        }
        assert!(cache.put(&h1, "", "1", "x", 0.5, false).is_err());
        assert!(cache.put(&h1, "vision", "", "x", 0.5, false).is_err());
        assert!(cache.put(&h1, "vision", "1", "edge", 1.0, false).is_ok());
        assert!(cache.put(&h1, "vision", "0", "edge", 0.0, false).is_ok());
    }

    #[test]
    fn test_key_components_do_not_collide() {
        let (_dir, cache) = setup();
        let h1 = hash_bytes(b"specimen one");

        cache.put(&h1, "vision1", "2", "a", 0.5, false).unwrap();
        cache.put(&h1, "vision", "12", "b", 0.5, false).unwrap();

        assert_eq!(cache.get(&h1, "vision1", "2").unwrap().unwrap().text, "a");
        assert_eq!(cache.get(&h1, "vision", "12").unwrap().unwrap().text, "b");
    }

    #[test]
    fn test_stats_and_entries() {
        let (_dir, cache) = setup();
        assert_eq!(cache.stats().unwrap(), OcrCacheStats::default());

        let h1 = hash_bytes(b"one");
        let h2 = hash_bytes(b"two");
        cache.put(&h1, "vision", "1", "one", 0.5, false).unwrap();
        cache.put(&h2, "vision", "1", "two", 0.5, false).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 2);
        assert!(stats.total_bytes > 0);

        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].specimen_hash.as_str() < entries[1].specimen_hash.as_str());
    }

    #[test]
    fn test_persists_across_instances() {
        let temp_dir = tempfile::tempdir().unwrap();
        let h1 = hash_bytes(b"specimen one");
        {
            let cache = OcrResultCache::open(temp_dir.path()).unwrap();
            cache.put(&h1, "vision", "1", "Aster sp.", 0.9, false).unwrap();
        }

        let cache = OcrResultCache::open(temp_dir.path()).unwrap();
        assert_eq!(cache.get(&h1, "vision", "1").unwrap().unwrap().text, "Aster sp.");
    }

    #[test]
    fn test_concurrent_puts_same_key() {
        let (_dir, cache) = setup();
        let cache = Arc::new(cache);
        let h1 = hash_bytes(b"specimen one");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let h1 = h1.clone();
                std::thread::spawn(move || {
                    let text = format!("writer-{}", i);
                    for _ in 0..20 {
                        cache.put(&h1, "vision", "1", &text, 0.5, false).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let row = cache.get(&h1, "vision", "1").unwrap().unwrap();
        assert!(row.text.starts_with("writer-"));
        assert_eq!(cache.stats().unwrap().total_entries, 1);
    }
}
