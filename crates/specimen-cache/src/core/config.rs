//! Configuration loading and management.
//!
//! Configuration can be loaded from TOML, YAML or JSON files, discovered in the
//! directory hierarchy (`specimen-cache.toml`), or built programmatically.
//! Secrets never appear in configuration: remote credentials are referenced by
//! the names of the environment variables holding them.

use crate::{Result, SpecimenError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name searched for by [`SpecimenCacheConfig::discover`].
pub const CONFIG_FILE_NAME: &str = "specimen-cache.toml";

/// Top-level configuration.
///
/// # Example
///
/// ```rust
/// use specimen_cache::core::config::{BackendKind, SpecimenCacheConfig};
///
/// let config: SpecimenCacheConfig = toml::from_str(r#"
///     state_dir = "/var/lib/herbarium"
///
///     [storage]
///     kind = "local"
///     root = "/srv/scans"
///
///     [engine]
///     name = "vision"
///     version = "1"
/// "#).unwrap();
///
/// assert_eq!(config.storage.kind, BackendKind::Local);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecimenCacheConfig {
    /// Root of the persistent state (OCR result cache and run ledger).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Default for SpecimenCacheConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Storage backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

/// Where images live and how they are cached locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Root directory for the local backend.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Object store endpoint for the remote backend, e.g. `https://s3.example.org`.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix prepended to every reference (remote backend).
    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub credentials: Option<CredentialsRef>,

    /// Network fetch timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Directory for in-flight remote downloads (defaults to the system temp dir).
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Local copy cache (None = no caching decorator).
    #[serde(default)]
    pub cache: Option<LocalCacheConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            root: None,
            endpoint: None,
            bucket: None,
            prefix: None,
            credentials: None,
            timeout_secs: default_timeout_secs(),
            staging_dir: None,
            cache: None,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check that the fields required by the selected backend are present.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            BackendKind::Local => {
                if self.root.is_none() {
                    return Err(SpecimenError::validation("storage.root is required for the local backend"));
                }
            }
            BackendKind::Remote => {
                if self.endpoint.as_deref().is_none_or(str::is_empty) {
                    return Err(SpecimenError::validation(
                        "storage.endpoint is required for the remote backend",
                    ));
                }
                if self.bucket.as_deref().is_none_or(str::is_empty) {
                    return Err(SpecimenError::validation("storage.bucket is required for the remote backend"));
                }
                if self.timeout_secs == 0 {
                    return Err(SpecimenError::validation("storage.timeout_secs must be greater than zero"));
                }
            }
        }

        if let Some(cache) = &self.cache
            && cache.max_bytes == 0
        {
            return Err(SpecimenError::validation("storage.cache.max_bytes must be greater than zero"));
        }

        Ok(())
    }
}

/// Local copy cache wrapped around the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    pub dir: PathBuf,
    /// Hard ceiling on the bytes held in `dir`.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
}

/// Reference to remote credentials: the names of environment variables, not
/// the secrets themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CredentialsRef {
    Bearer { token_env: String },
    Basic { username_env: String, password_env: String },
}

/// Resolved credentials, injected into the remote locator.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Credentials::Bearer(<redacted>)"),
            Credentials::Basic { username, .. } => {
                write!(f, "Credentials::Basic {{ username: {:?}, password: <redacted> }}", username)
            }
        }
    }
}

impl CredentialsRef {
    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<Credentials> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve with a custom variable lookup.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fetch = |name: &str| {
            lookup(name).ok_or_else(|| {
                SpecimenError::validation(format!("credentials variable {} is not set", name))
            })
        };

        match self {
            CredentialsRef::Bearer { token_env } => Ok(Credentials::Bearer(fetch(token_env)?)),
            CredentialsRef::Basic {
                username_env,
                password_env,
            } => Ok(Credentials::Basic {
                username: fetch(username_env)?,
                password: fetch(password_env)?,
            }),
        }
    }
}

/// Identity of the OCR engine and how to invoke it as a subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_name")]
    pub name: String,

    #[serde(default = "default_engine_version")]
    pub version: String,

    /// Program and leading arguments; the image path is appended.
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            version: default_engine_version(),
            command: Vec::new(),
            timeout_secs: default_engine_timeout_secs(),
        }
    }
}

/// Batch dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Worker pool size (None = twice the CPU count).
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Re-run extraction for specimens whose cached result is an error.
    ///
    /// Off by default: a recorded failure is only retried after an engine
    /// version bump.
    #[serde(default)]
    pub retry_failed: bool,

    /// Attempts for resolving an image when the locator reports a transient error.
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            retry_failed: false,
            resolve_attempts: default_resolve_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn worker_count(&self) -> usize {
        self.max_concurrent.unwrap_or_else(|| num_cpus::get() * 2).max(1)
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".specimen-cache")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_max_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_engine_name() -> String {
    "default".to_string()
}

fn default_engine_version() -> String {
    "1".to_string()
}

fn default_engine_timeout_secs() -> u64 {
    120
}

fn default_resolve_attempts() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl SpecimenCacheConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        toml::from_str(&content)
            .map_err(|e| SpecimenError::validation(format!("Invalid TOML in {}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| SpecimenError::validation(format!("Invalid YAML in {}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        serde_json::from_str(&content)
            .map_err(|e| SpecimenError::validation(format!("Invalid JSON in {}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration, picking the format from the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("toml") => Self::from_toml_file(path),
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(SpecimenError::validation(format!(
                "Unsupported config file format: {} (expected .toml, .yaml, .yml or .json)",
                path.display()
            ))),
        }
    }

    /// Discover `specimen-cache.toml` in the current directory or its parents.
    pub fn discover() -> Result<Option<Self>> {
        let current = std::env::current_dir()?;
        Self::discover_from(&current)
    }

    /// Discover `specimen-cache.toml` starting at `start` and walking upwards.
    pub fn discover_from(start: &Path) -> Result<Option<Self>> {
        let mut current = Some(start);

        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Ok(Some(Self::from_toml_file(candidate)?));
            }
            current = dir.parent();
        }

        Ok(None)
    }

    pub fn ocr_cache_dir(&self) -> PathBuf {
        self.state_dir.join("ocr")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.state_dir.join("ledger")
    }

    /// Serialised form stored with each run for reproducibility.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| SpecimenError::validation(format!("Failed to read config file {}: {}", path.display(), e)))
}
