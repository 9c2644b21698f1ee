//! Cache-aware dispatch of OCR work.
//!
//! For each specimen in a run the [`Dispatcher`] resolves the image, hashes
//! its bytes, consults the result cache and only calls the engine on a miss.
//! Every specimen ends with exactly one lineage entry:
//!
//! | situation                               | status      | cache hit |
//! |-----------------------------------------|-------------|-----------|
//! | image could not be resolved or hashed   | `failed`    | no        |
//! | cached result                           | `cached`    | yes       |
//! | cached error, retries disabled          | `skipped`   | yes       |
//! | fresh extraction succeeded              | `completed` | no        |
//! | fresh extraction failed                 | `failed`    | no        |
//!
//! Failures of the result cache or the ledger are not per-specimen outcomes:
//! they abort the batch.

use crate::core::config::{DispatchConfig, SpecimenCacheConfig};
use crate::hash::{ContentHash, hash_file};
use crate::ledger::RunLedger;
use crate::locator::{ImageLocator, ResolvedImage, build_locator};
use crate::ocr::{OcrEngine, OcrResultCache};
use crate::stats::RunStats;
use crate::types::{ImageRef, LineageEntry, LineageStatus, OcrResult};
use crate::{Result, SpecimenError};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// What happened to one specimen within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecimenOutcome {
    pub reference: ImageRef,
    pub specimen_hash: Option<ContentHash>,
    pub status: LineageStatus,
    pub cache_hit: bool,
    pub text: Option<String>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

impl SpecimenOutcome {
    fn failed(reference: &ImageRef, specimen_hash: Option<ContentHash>, error: String) -> Self {
        Self {
            reference: reference.clone(),
            specimen_hash,
            status: LineageStatus::Failed,
            cache_hit: false,
            text: None,
            confidence: None,
            error: Some(error),
        }
    }

    fn from_row(reference: &ImageRef, status: LineageStatus, cache_hit: bool, row: &OcrResult) -> Self {
        Self {
            reference: reference.clone(),
            specimen_hash: Some(row.specimen_hash.clone()),
            status,
            cache_hit,
            text: (!row.error).then(|| row.text.clone()),
            confidence: (!row.error).then_some(row.confidence),
            error: row.error_message.clone().or_else(|| row.error.then(|| "extraction failed".to_string())),
        }
    }
}

/// Result of [`Dispatcher::process_batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    /// Outcomes of every processed specimen, in input order. Specimens never
    /// submitted because of cancellation are absent.
    pub outcomes: Vec<SpecimenOutcome>,
    pub stats: RunStats,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn count(&self, status: LineageStatus) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.status == status).count()
    }

    pub fn summary(&self) -> BatchSummary<'_> {
        BatchSummary(self)
    }
}

/// Human-readable batch summary.
pub struct BatchSummary<'a>(&'a BatchReport);

impl fmt::Display for BatchSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        writeln!(
            f,
            "Run {}{}: {} specimens (completed {}, cached {}, skipped {}, failed {})",
            report.run_id,
            if report.cancelled { " (cancelled)" } else { "" },
            report.outcomes.len(),
            report.count(LineageStatus::Completed),
            report.count(LineageStatus::Cached),
            report.count(LineageStatus::Skipped),
            report.count(LineageStatus::Failed),
        )?;
        write!(f, "{}", report.stats)
    }
}

/// Routes specimens through the locator, result cache, engine and ledger.
///
/// Cloning is cheap; clones share every component and the lifetime counters.
#[derive(Clone)]
pub struct Dispatcher {
    locator: Arc<dyn ImageLocator>,
    ocr_cache: Arc<OcrResultCache>,
    ledger: Arc<RunLedger>,
    engine: Arc<dyn OcrEngine>,
    config: DispatchConfig,
    cumulative: Arc<Mutex<RunStats>>,
    evictions_at_start: u64,
}

impl Dispatcher {
    pub fn new(
        locator: Arc<dyn ImageLocator>,
        ocr_cache: Arc<OcrResultCache>,
        ledger: Arc<RunLedger>,
        engine: Arc<dyn OcrEngine>,
        config: DispatchConfig,
    ) -> Self {
        let evictions_at_start = eviction_total(locator.as_ref());
        Self {
            locator,
            ocr_cache,
            ledger,
            engine,
            config,
            cumulative: Arc::new(Mutex::new(RunStats::default())),
            evictions_at_start,
        }
    }

    /// Wire up the locator, result cache and ledger described by `config`.
    pub fn from_config(config: &SpecimenCacheConfig, engine: Arc<dyn OcrEngine>) -> Result<Self> {
        let locator = build_locator(&config.storage)?;
        let ocr_cache = Arc::new(OcrResultCache::open(config.ocr_cache_dir())?);
        let ledger = Arc::new(RunLedger::open(config.ledger_dir())?);
        Ok(Self::new(locator, ocr_cache, ledger, engine, config.dispatch.clone()))
    }

    pub fn locator(&self) -> &Arc<dyn ImageLocator> {
        &self.locator
    }

    pub fn ocr_cache(&self) -> &Arc<OcrResultCache> {
        &self.ocr_cache
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    /// Statistics over every specimen this dispatcher (and its clones) processed.
    pub fn cumulative_stats(&self) -> RunStats {
        let mut stats = *self.cumulative.lock();
        stats.eviction_count = eviction_total(self.locator.as_ref()).saturating_sub(self.evictions_at_start);
        stats
    }

    async fn resolve_with_retry(&self, reference: &ImageRef) -> Result<ResolvedImage> {
        let attempts = self.config.resolve_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.locator.resolve(reference).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        "Resolving {} failed (attempt {}/{}): {}",
                        reference,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Process one specimen within a started run.
    ///
    /// Resolution, hashing and extraction failures are outcomes, recorded in
    /// the lineage with status `failed`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the result cache or the ledger cannot be
    /// read or written (including `SpecimenError::UnknownRun`).
    #[cfg_attr(feature = "otel", tracing::instrument(
        skip(self),
        fields(engine = %self.engine.name()),
    ))]
    pub async fn process_specimen(&self, run_id: &str, reference: &ImageRef) -> Result<SpecimenOutcome> {
        let engine = self.engine.name().to_string();
        let engine_version = self.engine.version();
        let lineage = |status: LineageStatus, cache_hit: bool| {
            LineageEntry::new(run_id, status, cache_hit)
                .with_reference(reference)
                .with_engine(engine.clone(), engine_version.clone())
        };

        let resolved = match self.resolve_with_retry(reference).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!("Could not resolve {}: {}", reference, e);
                self.ledger
                    .append(lineage(LineageStatus::Failed, false).with_detail(e.to_string()))?;
                return Ok(self.finish(SpecimenOutcome::failed(reference, None, e.to_string())));
            }
        };

        let specimen_hash = match hash_file(resolved.path()).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::debug!("Could not hash {}: {}", reference, e);
                self.ledger
                    .append(lineage(LineageStatus::Failed, false).with_detail(e.to_string()))?;
                return Ok(self.finish(SpecimenOutcome::failed(reference, None, e.to_string())));
            }
        };

        if let Some(row) = self.ocr_cache.get(&specimen_hash, &engine, &engine_version)? {
            if !row.error {
                tracing::debug!("Cache hit for {} ({})", reference, specimen_hash.short());
                self.ledger
                    .append(lineage(LineageStatus::Cached, true).with_specimen(specimen_hash))?;
                return Ok(self.finish(SpecimenOutcome::from_row(reference, LineageStatus::Cached, true, &row)));
            }
            if !self.config.retry_failed {
                tracing::debug!("Skipping {} ({}): cached failure", reference, specimen_hash.short());
                let mut entry = lineage(LineageStatus::Skipped, true).with_specimen(specimen_hash);
                if let Some(message) = &row.error_message {
                    entry = entry.with_detail(message.clone());
                }
                self.ledger.append(entry)?;
                return Ok(self.finish(SpecimenOutcome::from_row(reference, LineageStatus::Skipped, true, &row)));
            }
            tracing::debug!("Retrying failed extraction for {}", reference);
        }

        let extraction = self
            .engine
            .extract(resolved.path())
            .await
            .map_err(|e| e.to_string())
            .and_then(|extraction| {
                if (0.0..=1.0).contains(&extraction.confidence) {
                    Ok(extraction)
                } else {
                    Err(format!(
                        "engine reported confidence {} outside [0.0, 1.0]",
                        extraction.confidence
                    ))
                }
            });
        drop(resolved);

        let (row, status) = match extraction {
            Ok(extraction) => (
                OcrResult {
                    specimen_hash: specimen_hash.clone(),
                    engine: engine.clone(),
                    engine_version: engine_version.clone(),
                    text: extraction.text,
                    confidence: extraction.confidence,
                    error: false,
                    error_message: None,
                    updated_at: Utc::now(),
                },
                LineageStatus::Completed,
            ),
            Err(message) => {
                tracing::warn!("Extraction failed for {} ({}): {}", reference, specimen_hash.short(), message);
                (
                    OcrResult {
                        specimen_hash: specimen_hash.clone(),
                        engine: engine.clone(),
                        engine_version: engine_version.clone(),
                        text: String::new(),
                        confidence: 0.0,
                        error: true,
                        error_message: Some(message),
                        updated_at: Utc::now(),
                    },
                    LineageStatus::Failed,
                )
            }
        };

        self.ocr_cache.put_result(&row)?;
        let mut entry = lineage(status, false).with_specimen(specimen_hash);
        if let Some(message) = &row.error_message {
            entry = entry.with_detail(message.clone());
        }
        self.ledger.append(entry)?;

        Ok(self.finish(SpecimenOutcome::from_row(reference, status, false, &row)))
    }

    fn finish(&self, outcome: SpecimenOutcome) -> SpecimenOutcome {
        self.cumulative.lock().record(&outcome);
        outcome
    }

    /// Process specimens concurrently within a started run.
    ///
    /// At most `max_concurrent` specimens are in flight. Cancelling `cancel`
    /// stops submission; specimens already in flight finish and are recorded.
    /// A fatal error stops submission the same way, then the first such error
    /// is returned once in-flight work has drained.
    #[cfg_attr(feature = "otel", tracing::instrument(
        skip(self, references, cancel),
        fields(specimens = references.len()),
    ))]
    pub async fn process_batch(
        &self,
        run_id: &str,
        references: Vec<ImageRef>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let evictions_before = eviction_total(self.locator.as_ref());
        let total = references.len();
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count()));
        let halt = cancel.child_token();

        let mut slots: Vec<Option<SpecimenOutcome>> = vec![None; total];
        let mut fatal: Option<SpecimenError> = None;
        let mut stopped_early = false;
        let mut tasks = JoinSet::new();

        tracing::info!("Processing {} specimens in run {}", total, run_id);

        for (index, reference) in references.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => {
                    stopped_early = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        stopped_early = true;
                        break;
                    }
                },
            };

            let dispatcher = self.clone();
            let run_id = run_id.to_string();
            let halt = halt.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = dispatcher.process_specimen(&run_id, &reference).await;
                if result.is_err() {
                    halt.cancel();
                }
                (index, result)
            });

            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut slots, &mut fatal);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut slots, &mut fatal);
        }

        if let Some(e) = fatal {
            tracing::error!("Run {} aborted: {}", run_id, e);
            return Err(e);
        }

        let outcomes: Vec<SpecimenOutcome> = slots.into_iter().flatten().collect();
        let mut stats = RunStats::default();
        for outcome in &outcomes {
            stats.record(outcome);
        }
        stats.eviction_count = eviction_total(self.locator.as_ref()).saturating_sub(evictions_before);

        if stopped_early {
            tracing::info!("Run {} cancelled after {} of {} specimens", run_id, outcomes.len(), total);
        }
        tracing::info!("Run {}: {}", run_id, stats);

        Ok(BatchReport {
            run_id: run_id.to_string(),
            outcomes,
            stats,
            cancelled: stopped_early,
        })
    }

    /// Start a run, process the batch and complete the run.
    ///
    /// The run stays open when the batch is cancelled or aborted, so it is
    /// visible as incomplete in the ledger.
    pub async fn run_batch(
        &self,
        run_id: &str,
        references: Vec<ImageRef>,
        config_snapshot: serde_json::Value,
        operator: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.ledger.start_run(run_id, config_snapshot, operator)?;
        let report = self.process_batch(run_id, references, cancel).await?;
        if !report.cancelled {
            self.ledger.complete_run_with_stats(run_id, Some(report.stats))?;
        }
        Ok(report)
    }
}

fn collect(
    joined: std::result::Result<(usize, Result<SpecimenOutcome>), JoinError>,
    slots: &mut [Option<SpecimenOutcome>],
    fatal: &mut Option<SpecimenError>,
) {
    let error = match joined {
        Ok((index, Ok(outcome))) => {
            slots[index] = Some(outcome);
            return;
        }
        Ok((_, Err(e))) => e,
        Err(e) => SpecimenError::Other(format!("Specimen task failed: {}", e)),
    };
    if fatal.is_none() {
        *fatal = Some(error);
    }
}

fn eviction_total(locator: &dyn ImageLocator) -> u64 {
    locator.cache_stats().map(|stats| stats.evictions).unwrap_or(0)
}
