//! OCR engine interface.

use crate::error::ExtractError;
use crate::types::Extraction;
use async_trait::async_trait;
use std::path::Path;

/// An OCR or vision backend.
///
/// The dispatcher only relies on the engine's identity and on
/// `extract(path) -> (text, confidence)`. Everything else (models, languages,
/// network calls) is the engine's business.
///
/// # Thread Safety
///
/// Engines must be `Send + Sync`: one instance is shared by every worker of a
/// batch.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use specimen_cache::ocr::OcrEngine;
/// use specimen_cache::{ExtractError, Extraction};
/// use std::path::Path;
///
/// struct FixedEngine;
///
/// #[async_trait]
/// impl OcrEngine for FixedEngine {
///     fn name(&self) -> &str { "fixed" }
///     fn version(&self) -> String { "1".to_string() }
///
///     async fn extract(&self, _path: &Path) -> Result<Extraction, ExtractError> {
///         Ok(Extraction { text: "Aster sp.".to_string(), confidence: 0.9 })
///     }
/// }
/// ```
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine identifier used in the result cache key (e.g. `"vision"`).
    fn name(&self) -> &str;

    /// Engine version. Bumping it makes every cached result a miss.
    fn version(&self) -> String;

    /// Extract text from the image at `path`.
    ///
    /// The path is only valid for the duration of the call.
    async fn extract(&self, path: &Path) -> Result<Extraction, ExtractError>;
}
