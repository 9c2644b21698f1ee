//! Error types for specimen-cache.
//!
//! All fallible operations return [`SpecimenError`]. The variants follow the
//! failure taxonomy the dispatcher acts on:
//!
//! - `NotFound` - the image reference does not exist (permanent, never retried)
//! - `Transient` - network or auth failure (the caller may retry)
//! - `InvalidArgument` - malformed confidence, hash or reference (programmer error)
//! - `DuplicateRunId` / `UnknownRun` - run ledger misuse
//! - `Extract` - opaque failure forwarded from an OCR engine
//!
//! **System errors bubble up unchanged:** `SpecimenError::Io` (from
//! `std::io::Error`) is never wrapped or suppressed.
//!
//! # Example
//!
//! ```rust
//! use specimen_cache::{Result, SpecimenError};
//!
//! fn check_confidence(confidence: f64) -> Result<f64> {
//!     if !(0.0..=1.0).contains(&confidence) {
//!         return Err(SpecimenError::invalid_argument(format!(
//!             "confidence {} is outside [0.0, 1.0]",
//!             confidence
//!         )));
//!     }
//!     Ok(confidence)
//! }
//! # assert!(check_confidence(1.5).is_err());
//! ```
use thiserror::Error;

/// Result type alias using `SpecimenError`.
pub type Result<T> = std::result::Result<T, SpecimenError>;

/// Opaque failure reported by an OCR engine.
///
/// The dispatcher does not interpret it beyond "the extraction failed"; the
/// message is stored on the error-flagged cache row for later inspection.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExtractError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ExtractError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(message: S, source: E) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Main error type for all specimen-cache operations.
#[derive(Debug, Error)]
pub enum SpecimenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image not found: {reference}")]
    NotFound { reference: String },

    #[error("Transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Run '{0}' already exists")]
    DuplicateRunId(String),

    #[error("Run '{0}' was never started")]
    UnknownRun(String),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for SpecimenError {
    fn from(err: serde_json::Error) -> Self {
        SpecimenError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<rmp_serde::encode::Error> for SpecimenError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        SpecimenError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<rmp_serde::decode::Error> for SpecimenError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        SpecimenError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

macro_rules! error_constructor {
    ($name:ident, $variant:ident) => {
        pastey::paste! {
            #[doc = "Create a " $variant " error"]
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: None,
                }
            }

            #[doc = "Create a " $variant " error with source"]
            pub fn [<$name _with_source>]<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
                message: S,
                source: E,
            ) -> Self {
                Self::$variant {
                    message: message.into(),
                    source: Some(Box::new(source)),
                }
            }
        }
    };
}

impl SpecimenError {
    error_constructor!(transient, Transient);
    error_constructor!(invalid_argument, InvalidArgument);
    error_constructor!(cache, Cache);
    error_constructor!(serialization, Serialization);
    error_constructor!(validation, Validation);

    pub fn not_found<S: Into<String>>(reference: S) -> Self {
        Self::NotFound {
            reference: reference.into(),
        }
    }

    /// Whether a retry policy may reasonably try the same operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpecimenError::Transient { .. })
    }
}
