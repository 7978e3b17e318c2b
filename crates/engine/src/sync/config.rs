//! Sync configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::retry::RetryConfig;

/// Configuration of the download and upload flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Download settings.
    #[serde(default)]
    pub download: DownloadConfig,

    /// Upload settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Backoff for transient network failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Which resources to download and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Resource types to download, each as its own concurrent task.
    #[serde(default)]
    pub resource_types: Vec<String>,

    /// Extra search parameters per resource type (e.g. `address-city`).
    #[serde(default)]
    pub params: BTreeMap<String, BTreeMap<String, String>>,

    /// Page size requested with `_count`, if set.
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl DownloadConfig {
    /// Adds a resource type to download.
    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_types.push(resource_type.into());
        self
    }

    /// Adds a search parameter for one resource type.
    pub fn with_param(
        mut self,
        resource_type: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.params
            .entry(resource_type.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }
}

/// How squashed changes are grouped into requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Transaction bundles of at most `max_entries` entries.
    Bundle {
        /// Entries per bundle.
        max_entries: usize,
    },
    /// One request per change.
    PerResource,
}

impl Default for UploadStrategy {
    fn default() -> Self {
        UploadStrategy::Bundle { max_entries: 500 }
    }
}

impl UploadStrategy {
    /// Number of changes sent in one request.
    pub fn batch_size(&self) -> usize {
        match self {
            UploadStrategy::Bundle { max_entries } => (*max_entries).max(1),
            UploadStrategy::PerResource => 1,
        }
    }
}

/// Method used to create resources on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMethod {
    /// The server assigns the id.
    #[default]
    Post,
    /// The client-assigned id is kept.
    Put,
}

/// Method used to send updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    /// The full current body.
    Put,
    /// The squashed JSON patch.
    #[default]
    Patch,
}

/// Upload settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Batching.
    #[serde(default)]
    pub strategy: UploadStrategy,

    /// Method for INSERT changes.
    #[serde(default)]
    pub create_method: CreateMethod,

    /// Method for UPDATE changes.
    #[serde(default)]
    pub update_method: UpdateMethod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.upload.strategy.batch_size(), 500);
        assert_eq!(config.upload.create_method, CreateMethod::Post);
        assert_eq!(config.upload.update_method, UpdateMethod::Patch);
    }

    #[test]
    fn test_deserialize_upload_strategy() {
        let config: UploadConfig = serde_json::from_str(
            r#"{"strategy": {"type": "per_resource"}, "create_method": "put", "update_method": "put"}"#,
        )
        .unwrap();
        assert_eq!(config.strategy, UploadStrategy::PerResource);
        assert_eq!(config.strategy.batch_size(), 1);
        assert_eq!(config.create_method, CreateMethod::Put);
    }

    #[test]
    fn test_download_builders() {
        let config = DownloadConfig::default()
            .with_resource_type("Patient")
            .with_param("Patient", "address-city", "NAIROBI");
        assert_eq!(config.resource_types, vec!["Patient"]);
        assert_eq!(config.params["Patient"]["address-city"], "NAIROBI");
    }
}
