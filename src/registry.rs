//! Remote plugin registry client.
//!
//! The registry exposes `GET {base}/search?q=&tags=` returning a JSON
//! array of plugin records. Plugin bundles are gzipped tarballs of the
//! plugin directory (manifest at the root); downloads are verified
//! against the record's SHA-256 checksum before unpacking.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{PluginError, PluginResult};

/// Default registry base URL.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.plugraph.dev";

/// A plugin entry in the remote registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPlugin {
    /// Plugin name (unique identifier).
    pub name: String,

    /// Latest published version.
    pub version: String,

    /// Plugin description.
    #[serde(default)]
    pub description: Option<String>,

    /// URL of the plugin bundle (gzipped tarball).
    pub download_url: String,

    /// SHA-256 checksum of the bundle.
    #[serde(default)]
    pub checksum: Option<String>,

    /// Plugin author.
    #[serde(default)]
    pub author: Option<String>,

    /// Tags for categorization and search.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Community rating.
    #[serde(default)]
    pub rating: f64,

    /// Download count.
    #[serde(default)]
    pub downloads: u64,

    /// Last publish timestamp (RFC 3339).
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Client for searching the registry and downloading plugin bundles.
pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryClient {
    /// Create a client against the default registry.
    pub fn new() -> PluginResult<Self> {
        Self::with_url(DEFAULT_REGISTRY_URL)
    }

    /// Create a client with a custom registry base URL.
    pub fn with_url(base_url: &str) -> PluginResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("plugraph/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginError::Registry(e.to_string()))?;

        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Search the registry by free-text query and optional tags.
    pub async fn search(&self, query: &str, tags: &[String]) -> PluginResult<Vec<RegistryPlugin>> {
        let url = format!("{}/search", self.base_url);
        let tags_param = tags.join(",");
        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("tags", tags_param.as_str())])
            .send()
            .await
            .map_err(|e| PluginError::Registry(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PluginError::Registry(format!(
                "search failed: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Vec<RegistryPlugin>>()
            .await
            .map_err(|e| PluginError::Registry(format!("invalid registry response: {e}")))
    }

    /// Resolve a plugin by exact name.
    pub async fn find(&self, name: &str) -> PluginResult<Option<RegistryPlugin>> {
        let results = self.search(name, &[]).await?;
        Ok(results.into_iter().find(|p| p.name == name))
    }

    /// Download a plugin bundle, verify its checksum, and unpack it into
    /// `dest_dir`.
    ///
    /// A checksum mismatch rejects the artifact outright. A record
    /// without a checksum still installs, but the returned warnings note
    /// the unverified download.
    pub async fn download(
        &self,
        plugin: &RegistryPlugin,
        dest_dir: &Path,
    ) -> PluginResult<Vec<String>> {
        let response = self
            .client
            .get(&plugin.download_url)
            .send()
            .await
            .map_err(|e| PluginError::Registry(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PluginError::Registry(format!(
                "download failed: HTTP {}",
                response.status()
            )));
        }

        let bytes =
            response.bytes().await.map_err(|e| PluginError::Registry(e.to_string()))?;

        let mut warnings = Vec::new();
        match &plugin.checksum {
            Some(expected) => verify_checksum(&bytes, expected)?,
            None => warnings.push(format!(
                "registry entry for '{}' carries no checksum; download unverified",
                plugin.name
            )),
        }

        unpack_bundle(&bytes, dest_dir)?;
        debug!(plugin = %plugin.name, dest = %dest_dir.display(), "bundle unpacked");
        Ok(warnings)
    }
}

/// Compare the SHA-256 of `bytes` against a hex-encoded checksum.
pub fn verify_checksum(bytes: &[u8], expected: &str) -> PluginResult<()> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let actual = format!("{:x}", hasher.finalize());

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PluginError::Validation(format!(
            "checksum mismatch: expected {expected}, got {actual}"
        )))
    }
}

/// Unpack a gzipped tarball into `dest_dir`.
pub fn unpack_bundle(bytes: &[u8], dest_dir: &Path) -> PluginResult<()> {
    std::fs::create_dir_all(dest_dir)?;
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest_dir)
        .map_err(|e| PluginError::Registry(format!("invalid plugin bundle: {e}")))
}
