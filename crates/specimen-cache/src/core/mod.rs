//! Configuration and shared file utilities.
//!
//! - **Configuration**: loading `specimen-cache.toml` (or YAML/JSON) into
//!   [`SpecimenCacheConfig`]
//! - **I/O**: atomic file replacement used by every persistent store

pub mod config;
pub mod io;

pub use config::{
    BackendKind, Credentials, CredentialsRef, DispatchConfig, EngineConfig, LocalCacheConfig, SpecimenCacheConfig,
    StorageConfig,
};
