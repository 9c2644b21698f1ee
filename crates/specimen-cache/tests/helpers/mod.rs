//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use specimen_cache::dispatch::Dispatcher;
use specimen_cache::locator::{CachingLocator, ImageLocator, LocalLocator};
use specimen_cache::{DispatchConfig, ExtractError, Extraction, ImageRef, OcrEngine, OcrResultCache, RunLedger};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Engine answering from a table keyed by the image's bytes.
///
/// Images not in the table fail with "unreadable scan". Every call is
/// counted, and the peak number of concurrent calls is tracked.
pub struct ScriptedEngine {
    name: String,
    version: String,
    answers: HashMap<Vec<u8>, Extraction>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            answers: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn answer(mut self, image: &[u8], text: &str, confidence: f64) -> Self {
        self.answers.insert(
            image.to_vec(),
            Extraction {
                text: text.to_string(),
                confidence,
            },
        );
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    async fn extract(&self, path: &Path) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = match tokio::fs::read(path).await {
            Ok(bytes) => self
                .answers
                .get(&bytes)
                .cloned()
                .ok_or_else(|| ExtractError::new("unreadable scan")),
            Err(e) => Err(ExtractError::with_source("image vanished", e)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Temporary scans directory plus persistent state directories.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("scans")).expect("scans dir");
        Self { dir }
    }

    pub fn scans(&self) -> PathBuf {
        self.dir.path().join("scans")
    }

    pub fn write(&self, reference: &str, bytes: &[u8]) -> ImageRef {
        let path = self.scans().join(reference);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(path, bytes).expect("write scan");
        ImageRef::new(reference).expect("valid reference")
    }

    pub fn remove(&self, reference: &str) {
        std::fs::remove_file(self.scans().join(reference)).expect("remove scan");
    }

    pub fn ocr_cache(&self) -> Arc<OcrResultCache> {
        Arc::new(OcrResultCache::open(self.dir.path().join("state").join("ocr")).expect("ocr cache"))
    }

    pub fn ledger(&self) -> Arc<RunLedger> {
        Arc::new(RunLedger::open(self.dir.path().join("state").join("ledger")).expect("ledger"))
    }

    pub fn local_locator(&self) -> Arc<dyn ImageLocator> {
        Arc::new(LocalLocator::new(self.scans()).expect("local locator"))
    }

    pub fn caching_locator(&self, max_bytes: u64) -> Arc<CachingLocator<LocalLocator>> {
        Arc::new(
            CachingLocator::with_budget(
                LocalLocator::new(self.scans()).expect("local locator"),
                self.dir.path().join("copies"),
                max_bytes,
            )
            .expect("caching locator"),
        )
    }

    /// Dispatcher over freshly opened stores, as a new process would build it.
    pub fn dispatcher(
        &self,
        locator: Arc<dyn ImageLocator>,
        engine: Arc<dyn OcrEngine>,
        config: DispatchConfig,
    ) -> Dispatcher {
        Dispatcher::new(locator, self.ocr_cache(), self.ledger(), engine, config)
    }
}

pub fn refs(keys: &[&str]) -> Vec<ImageRef> {
    keys.iter().map(|key| ImageRef::new(*key).expect("valid reference")).collect()
}

/// Route library logs to the test harness (`RUST_LOG=specimen_cache=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
