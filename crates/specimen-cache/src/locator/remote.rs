//! Remote object store locator.
//!
//! Talks to S3-compatible endpoints using path-style URLs
//! (`{endpoint}/{bucket}/{prefix}{reference}`) and the `ListObjectsV2`
//! listing protocol. Failures are split so callers can decide about retries:
//! a missing object is `NotFound`, everything network or auth related is
//! `Transient`.

use super::{ImageLocator, LocatorKind, ResolvedImage};
use crate::core::config::{Credentials, StorageConfig};
use crate::types::ImageRef;
use crate::{Result, SpecimenError};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Construction parameters for [`RemoteLocator`].
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    pub staging_dir: PathBuf,
}

impl RemoteOptions {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            prefix: String::new(),
            credentials: None,
            timeout: Duration::from_secs(30),
            staging_dir: std::env::temp_dir().join("specimen-cache-staging"),
        }
    }
}

/// Resolves references to objects in a remote bucket.
#[derive(Debug, Clone)]
pub struct RemoteLocator {
    client: reqwest::Client,
    endpoint: Url,
    bucket: String,
    prefix: String,
    credentials: Option<Credentials>,
    staging_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
}

impl RemoteLocator {
    pub fn new(options: RemoteOptions) -> Result<Self> {
        let endpoint = Url::parse(&options.endpoint).map_err(|e| {
            SpecimenError::validation_with_source(format!("Invalid object store endpoint: {}", options.endpoint), e)
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(SpecimenError::validation(format!(
                "Object store endpoint cannot be used as a base URL: {}",
                options.endpoint
            )));
        }
        if options.bucket.is_empty() || options.bucket.contains('/') {
            return Err(SpecimenError::validation(format!(
                "Invalid bucket name: {:?}",
                options.bucket
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| SpecimenError::validation_with_source("Failed to build HTTP client", e))?;

        std::fs::create_dir_all(&options.staging_dir)?;

        Ok(Self {
            client,
            endpoint,
            bucket: options.bucket,
            prefix: normalize_prefix(&options.prefix),
            credentials: options.credentials,
            staging_dir: options.staging_dir,
        })
    }

    /// Build from storage configuration, resolving credentials from the environment.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| SpecimenError::validation("storage.endpoint is required for the remote backend"))?;
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| SpecimenError::validation("storage.bucket is required for the remote backend"))?;

        let mut options = RemoteOptions::new(endpoint, bucket);
        options.prefix = config.prefix.clone().unwrap_or_default();
        options.timeout = config.timeout();
        options.credentials = config.credentials.as_ref().map(|c| c.resolve()).transpose()?;
        if let Some(staging_dir) = &config.staging_dir {
            options.staging_dir = staging_dir.clone();
        }

        Self::new(options)
    }

    fn bucket_url(&self) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| SpecimenError::validation(format!("Invalid object store endpoint: {}", self.endpoint)))?
            .pop_if_empty()
            .push(&self.bucket);
        Ok(url)
    }

    fn object_url(&self, reference: &ImageRef) -> Result<Url> {
        let mut url = self.bucket_url()?;
        url.path_segments_mut()
            .map_err(|_| SpecimenError::validation(format!("Invalid object store endpoint: {}", self.endpoint)))?
            .extend(self.prefix.split_terminator('/'))
            .extend(reference.components());
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            Some(Credentials::Basic { username, password }) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }

    async fn fetch(&self, reference: &ImageRef) -> Result<Vec<u8>> {
        let url = self.object_url(reference)?;
        tracing::debug!("Fetching {} from {}", reference, url);

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| request_error(e, reference.as_str()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, reference.as_str()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(e, reference.as_str()))?;
        Ok(body.to_vec())
    }

    fn stage(&self, bytes: &[u8]) -> Result<ResolvedImage> {
        let mut staged = tempfile::Builder::new()
            .prefix("specimen-")
            .tempfile_in(&self.staging_dir)?;
        staged.write_all(bytes)?;
        staged.flush()?;
        Ok(ResolvedImage::staged(staged.into_temp_path(), bytes.len() as u64))
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }
}

/// Key prefix as whole path segments: `"/scans//2024"` becomes `"scans/2024/"`.
fn normalize_prefix(prefix: &str) -> String {
    let segments: Vec<&str> = prefix.split('/').filter(|segment| !segment.is_empty()).collect();
    if segments.is_empty() {
        String::new()
    } else {
        format!("{}/", segments.join("/"))
    }
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, reference: &str) -> SpecimenError {
    match status {
        StatusCode::NOT_FOUND => SpecimenError::not_found(reference),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SpecimenError::transient(format!("Object store rejected credentials ({}) for {}", status, reference))
        }
        _ => SpecimenError::transient(format!("Object store returned {} for {}", status, reference)),
    }
}

fn request_error(err: reqwest::Error, reference: &str) -> SpecimenError {
    let message = if err.is_timeout() {
        format!("Timed out fetching {}", reference)
    } else if err.is_connect() {
        format!("Could not connect to object store for {}", reference)
    } else {
        format!("Request failed for {}", reference)
    };
    SpecimenError::transient_with_source(message, err)
}

#[async_trait]
impl ImageLocator for RemoteLocator {
    fn kind(&self) -> LocatorKind {
        LocatorKind::Remote
    }

    async fn resolve(&self, reference: &ImageRef) -> Result<ResolvedImage> {
        let bytes = self.fetch(reference).await?;
        self.stage(&bytes)
    }

    async fn read_bytes(&self, reference: &ImageRef) -> Result<Vec<u8>> {
        self.fetch(reference).await
    }

    async fn list(&self) -> Result<Vec<ImageRef>> {
        let mut references = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut url = self.bucket_url()?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("list-type", "2");
                if !self.prefix.is_empty() {
                    query.append_pair("prefix", &self.prefix);
                }
                if let Some(token) = &continuation {
                    query.append_pair("continuation-token", token);
                }
            }

            let response = self
                .authorize(self.client.get(url))
                .send()
                .await
                .map_err(|e| request_error(e, &self.bucket))?;

            let status = response.status();
            if !status.is_success() {
                return Err(classify_status(status, &self.bucket));
            }

            let body = response.text().await.map_err(|e| request_error(e, &self.bucket))?;
            let page: ListBucketResult = quick_xml::de::from_str(&body).map_err(|e| {
                SpecimenError::serialization_with_source("Failed to parse object listing", e)
            })?;

            for object in page.contents {
                if object.key.ends_with('/') {
                    continue;
                }
                let Some(key) = self.strip_prefix(&object.key) else {
                    continue;
                };
                match ImageRef::new(key) {
                    Ok(reference) => references.push(reference),
                    Err(e) => tracing::debug!("Skipping object key {:?}: {}", object.key, e),
                }
            }

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(token)) => continuation = Some(token),
                _ => break,
            }
        }

        references.sort();
        Ok(references)
    }
}
