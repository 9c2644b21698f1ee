//! OCR engine interface and the content-addressed result cache.
//!
//! Results are keyed on what was read (the image's [`ContentHash`]) and who
//! read it (engine name and version), never on where the image is stored.
//! Moving an image between backends or renaming it keeps its results; bumping
//! the engine version starts a fresh set of rows next to the old ones.
//!
//! [`ContentHash`]: crate::hash::ContentHash

mod cache;
mod engine;
mod process;

pub use cache::{OcrCacheStats, OcrResultCache};
pub use engine::OcrEngine;
pub use process::ProcessEngine;
