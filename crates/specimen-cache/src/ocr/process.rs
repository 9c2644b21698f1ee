//! Subprocess OCR engine.
//!
//! Runs a configured command with the image path appended and reads a JSON
//! document from stdout:
//!
//! ```json
//! {"text": "Aster sp.", "confidence": 0.9}
//! ```

use super::engine::OcrEngine;
use crate::core::config::EngineConfig;
use crate::error::ExtractError;
use crate::types::Extraction;
use crate::{Result, SpecimenError};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Engine backed by an external program.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    name: String,
    version: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessEngine {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        command: &[String],
        timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        if name.is_empty() || version.is_empty() {
            return Err(SpecimenError::validation("engine name and version must not be empty"));
        }

        let (program, args) = command
            .split_first()
            .ok_or_else(|| SpecimenError::validation("engine.command must name a program"))?;

        Ok(Self {
            name,
            version,
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(
            config.name.clone(),
            config.version.clone(),
            &config.command,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl OcrEngine for ProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    async fn extract(&self, path: &Path) -> std::result::Result<Extraction, ExtractError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExtractError::with_source(format!("Failed to execute {}", self.program), e))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExtractError::with_source(format!("Failed to wait for {}", self.program), e));
            }
            Err(_) => {
                return Err(ExtractError::new(format!(
                    "{} timed out after {} seconds",
                    self.program,
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::new(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_output(&output.stdout)
    }
}

fn parse_output(stdout: &[u8]) -> std::result::Result<Extraction, ExtractError> {
    let extraction: Extraction = serde_json::from_slice(stdout)
        .map_err(|e| ExtractError::with_source("Engine output is not a {text, confidence} JSON document", e))?;

    if !(0.0..=1.0).contains(&extraction.confidence) {
        return Err(ExtractError::new(format!(
            "Engine reported confidence {} outside [0.0, 1.0]",
            extraction.confidence
        )));
    }

    Ok(extraction)
}
