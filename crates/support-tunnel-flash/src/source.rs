//! Where manifests and firmware images come from.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{error::FlashError, manifest::Manifest};

/// Fetches manifests and the parts they reference.
#[async_trait]
pub trait FirmwareSource: Send + Sync {
    /// Fetch and parse the manifest at `url`.
    async fn manifest(&self, url: &str) -> Result<Manifest, FlashError>;

    /// Fetch a part. `path` is as written in the manifest at `manifest_url`.
    async fn part(&self, manifest_url: &str, path: &str) -> Result<Vec<u8>, FlashError>;
}

/// Fixed set of manifests and parts.
#[derive(Debug, Clone, Default)]
pub struct MemoryFirmwareSource {
    manifests: HashMap<String, Manifest>,
    parts: HashMap<String, Vec<u8>>,
}

impl MemoryFirmwareSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `manifest` at `url`.
    #[must_use]
    pub fn with_manifest(mut self, url: impl Into<String>, manifest: Manifest) -> Self {
        self.manifests.insert(url.into(), manifest);
        self
    }

    /// Serve `bytes` for the part path `path`.
    #[must_use]
    pub fn with_part(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.parts.insert(path.into(), bytes.into());
        self
    }
}

#[async_trait]
impl FirmwareSource for MemoryFirmwareSource {
    async fn manifest(&self, url: &str) -> Result<Manifest, FlashError> {
        self.manifests
            .get(url)
            .cloned()
            .ok_or_else(|| FlashError::Manifest(format!("{url} not found")))
    }

    async fn part(&self, _manifest_url: &str, path: &str) -> Result<Vec<u8>, FlashError> {
        self.parts.get(path).cloned().ok_or_else(|| FlashError::Part {
            path: path.to_string(),
            reason: "not found".into(),
        })
    }
}

/// Fetches over HTTP. Relative part paths resolve against the manifest URL.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpFirmwareSource {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpFirmwareSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Resolve a part path against the manifest URL.
///
/// # Errors
/// Returns error if either URL is invalid.
#[cfg(feature = "http")]
pub fn resolve_part_url(manifest_url: &str, path: &str) -> Result<reqwest::Url, FlashError> {
    let fail = |e: String| FlashError::Part {
        path: path.to_string(),
        reason: e,
    };
    let base = reqwest::Url::parse(manifest_url).map_err(|e| fail(e.to_string()))?;
    base.join(path).map_err(|e| fail(e.to_string()))
}

#[cfg(feature = "http")]
#[async_trait]
impl FirmwareSource for HttpFirmwareSource {
    async fn manifest(&self, url: &str) -> Result<Manifest, FlashError> {
        let fail = |e: reqwest::Error| FlashError::Manifest(format!("{url}: {e}"));
        tracing::debug!(url, "Fetching firmware manifest");
        let resp = self.client.get(url).send().await.map_err(fail)?;
        let resp = resp.error_for_status().map_err(fail)?;
        let body = resp.text().await.map_err(fail)?;
        Manifest::parse(&body)
    }

    async fn part(&self, manifest_url: &str, path: &str) -> Result<Vec<u8>, FlashError> {
        let url = resolve_part_url(manifest_url, path)?;
        let fail = |e: reqwest::Error| FlashError::Part {
            path: path.to_string(),
            reason: e.to_string(),
        };
        tracing::debug!(%url, "Downloading firmware part");
        let resp = self.client.get(url).send().await.map_err(fail)?;
        let resp = resp.error_for_status().map_err(fail)?;
        Ok(resp.bytes().await.map_err(fail)?.to_vec())
    }
}
