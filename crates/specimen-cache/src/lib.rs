//! specimen-cache - content-addressed OCR caching for specimen digitisation
//!
//! Digitisation batches re-run over the same images again and again. This
//! crate makes the repeated work cheap and traceable:
//!
//! - images are addressed by the SHA-256 of their bytes, not by where they live
//! - OCR results are cached per (content hash, engine, engine version)
//! - images are read through a pluggable locator (local directory or
//!   S3-compatible bucket), optionally behind a local LRU copy cache
//! - every run records which specimens it touched and with what outcome
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use specimen_cache::dispatch::Dispatcher;
//! use specimen_cache::ocr::ProcessEngine;
//! use specimen_cache::{ImageRef, SpecimenCacheConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> specimen_cache::Result<()> {
//! let config = SpecimenCacheConfig::discover()?.unwrap_or_default();
//! let engine = Arc::new(ProcessEngine::from_config(&config.engine)?);
//! let dispatcher = Dispatcher::from_config(&config, engine)?;
//!
//! let references = dispatcher.locator().list().await?;
//! let report = dispatcher
//!     .run_batch("2026-10-17-a", references, config.snapshot(), None, &CancellationToken::new())
//!     .await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`hash`] - content addressing
//! - [`locator`] - where images live, and how they are read
//! - [`cache`] - local copy cache decorator with LRU eviction
//! - [`ocr`] - engine interface and the result cache
//! - [`ledger`] - processing runs and lineage
//! - [`dispatch`] - cache-aware batch processing
//! - [`stats`] - hit/miss/eviction counters

#![deny(unsafe_code)]

pub mod cache;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod locator;
pub mod ocr;
pub mod stats;
pub mod types;

pub use error::{ExtractError, Result, SpecimenError};
pub use types::*;

pub use core::config::{
    BackendKind, Credentials, CredentialsRef, DispatchConfig, EngineConfig, LocalCacheConfig, SpecimenCacheConfig,
    StorageConfig,
};

pub use hash::{ContentHash, hash_bytes, hash_file, hash_file_sync};

pub use locator::{ImageLocator, LocatorKind, ResolvedImage, build_locator};

pub use cache::{CachingLocator, LocalCacheStats};

pub use ocr::{OcrCacheStats, OcrEngine, OcrResultCache, ProcessEngine};

pub use ledger::{LineageCounts, RunLedger};

pub use dispatch::{BatchReport, Dispatcher, SpecimenOutcome};

pub use stats::RunStats;
