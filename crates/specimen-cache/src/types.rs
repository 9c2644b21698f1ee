//! Core record types shared by the locators, caches, ledger and dispatcher.

use crate::hash::ContentHash;
use crate::stats::RunStats;
use crate::{Result, SpecimenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical reference to an image, independent of where it is stored.
///
/// References are relative, `/`-separated keys such as
/// `batch-7/IMG_0001.jpg`. The same reference resolves against a local root
/// directory or a remote bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef(String);

impl ImageRef {
    /// Validate and wrap a reference.
    ///
    /// # Errors
    ///
    /// Returns `SpecimenError::InvalidArgument` for empty references, absolute
    /// paths, backslashes and `.`/`..`/empty path components.
    pub fn new(reference: impl Into<String>) -> Result<Self> {
        let reference = reference.into();

        if reference.is_empty() {
            return Err(SpecimenError::invalid_argument("image reference is empty"));
        }
        if reference.starts_with('/') || reference.contains('\\') {
            return Err(SpecimenError::invalid_argument(format!(
                "image reference must be a relative '/'-separated key: {}",
                reference
            )));
        }
        if reference
            .split('/')
            .any(|component| component.is_empty() || component == "." || component == "..")
        {
            return Err(SpecimenError::invalid_argument(format!(
                "image reference contains an empty, '.' or '..' component: {}",
                reference
            )));
        }

        Ok(Self(reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = SpecimenError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.0
    }
}

impl std::str::FromStr for ImageRef {
    type Err = SpecimenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Text and confidence returned by an OCR engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub text: String,
    pub confidence: f64,
}

/// Current OCR result for one (specimen, engine, engine version) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub specimen_hash: ContentHash,
    pub engine: String,
    pub engine_version: String,
    pub text: String,
    /// Always within `[0.0, 1.0]`.
    pub confidence: f64,
    /// Set when the extraction failed; `text` is empty in that case.
    pub error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OcrResult {
    /// The `(text, confidence, error)` tuple downstream mapping consumes.
    pub fn summary(&self) -> (&str, f64, bool) {
        (&self.text, self.confidence, self.error)
    }
}

/// One invocation of the batch pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque snapshot of the configuration the run used.
    pub config_snapshot: serde_json::Value,
    #[serde(default)]
    pub operator: Option<String>,
    /// Batch counters, stored when the run completes.
    #[serde(default)]
    pub stats: Option<RunStats>,
}

impl ProcessingRun {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Outcome of a specimen within a run, as recorded in the lineage log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineageStatus {
    Completed,
    Failed,
    Skipped,
    Cached,
}

impl LineageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineageStatus::Completed => "completed",
            LineageStatus::Failed => "failed",
            LineageStatus::Skipped => "skipped",
            LineageStatus::Cached => "cached",
        }
    }
}

impl fmt::Display for LineageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record linking a run to a specimen it touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub run_id: String,
    /// `None` only when the image could not be resolved or hashed.
    pub specimen_hash: Option<ContentHash>,
    #[serde(default)]
    pub reference: Option<String>,
    pub status: LineageStatus,
    pub cache_hit: bool,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl LineageEntry {
    pub fn new(run_id: impl Into<String>, status: LineageStatus, cache_hit: bool) -> Self {
        Self {
            run_id: run_id.into(),
            specimen_hash: None,
            reference: None,
            status,
            cache_hit,
            engine: None,
            engine_version: None,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_specimen(mut self, specimen_hash: ContentHash) -> Self {
        self.specimen_hash = Some(specimen_hash);
        self
    }

    pub fn with_reference(mut self, reference: &ImageRef) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>, engine_version: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self.engine_version = Some(engine_version.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
