// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or no
//! file at all) yields a working engine.
//!
//! ```toml
//! dimension = 1536
//! metric = "cosine"
//!
//! [storage]
//! data_dir = "./ragvec-data"
//!
//! [partition]
//! bucket_width_secs = 604800
//! layout = "per_source"
//!
//! [query]
//! failure_policy = "best_effort"
//! ```

use std::path::{Path, PathBuf};

use ragvec_core::ValidationError;
use ragvec_index::{DistanceMetric, VamanaConfig};
use ragvec_storage::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Embedding dimension shared by every record
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub metric: DistanceMetric,
    /// Background reconciliation period; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_interval_secs: Option<u64>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

fn default_dimension() -> usize {
    1536
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            metric: DistanceMetric::default(),
            reconcile_interval_secs: None,
            storage: StorageConfig::default(),
            index: IndexConfig::default(),
            partition: PartitionConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

/// Record store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    #[serde(default = "default_true")]
    pub sync_on_write: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("ragvec-data")
}
fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            segment_max_bytes: default_segment_max_bytes(),
            sync_on_write: true,
        }
    }
}

/// Graph construction and search knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_max_degree")]
    pub max_degree: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_list_size")]
    pub build_list_size: usize,
    #[serde(default = "default_list_size")]
    pub search_list_size: usize,
}

fn default_max_degree() -> usize {
    32
}
fn default_alpha() -> f32 {
    1.2
}
fn default_list_size() -> usize {
    64
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_degree: default_max_degree(),
            alpha: default_alpha(),
            build_list_size: default_list_size(),
            search_list_size: default_list_size(),
        }
    }
}

/// How records are grouped into partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionLayout {
    /// One partition per (source type, time bucket)
    #[default]
    PerSource,
    /// One partition per time bucket, all source types together
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default = "default_bucket_width_secs")]
    pub bucket_width_secs: u64,
    #[serde(default)]
    pub layout: PartitionLayout,
    /// Drop partitions whose range ended this long ago
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
    /// Seal partitions whose time range has elapsed
    #[serde(default = "default_true")]
    pub auto_seal: bool,
}

fn default_bucket_width_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            bucket_width_secs: default_bucket_width_secs(),
            layout: PartitionLayout::default(),
            retention_secs: None,
            auto_seal: true,
        }
    }
}

/// What a query does when some partitions fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any partition failure fails the whole query
    #[default]
    FailQuery,
    /// Return what the surviving partitions found, flagged as degraded
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Per-partition fetch is `k * overfetch_factor`
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_partition_timeout_ms")]
    pub partition_timeout_ms: u64,
}

fn default_overfetch_factor() -> usize {
    2
}
fn default_partition_timeout_ms() -> u64 {
    2_000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: default_overfetch_factor(),
            failure_policy: FailurePolicy::default(),
            partition_timeout_ms: default_partition_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Defaults for an embedding dimension, rooted at `data_dir`
    pub fn new<P: AsRef<Path>>(dimension: usize, data_dir: P) -> Self {
        Self {
            dimension,
            storage: StorageConfig {
                data_dir: data_dir.as_ref().to_path_buf(),
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn with_data_dir<P: AsRef<Path>>(mut self, data_dir: P) -> Self {
        self.storage.data_dir = data_dir.as_ref().to_path_buf();
        self
    }

    /// Load config from a TOML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            config_error(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| config_error(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Write config as TOML
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| config_error(format!("failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(config_error("dimension must be positive"));
        }
        self.vamana_config()
            .validate()
            .map_err(|e| config_error(e.to_string()))?;
        if self.storage.segment_max_bytes == 0 {
            return Err(config_error("storage.segment_max_bytes must be positive"));
        }
        if self.partition.bucket_width_secs == 0 {
            return Err(config_error("partition.bucket_width_secs must be positive"));
        }
        if self.partition.retention_secs == Some(0) {
            return Err(config_error("partition.retention_secs must be positive"));
        }
        if self.query.overfetch_factor == 0 {
            return Err(config_error("query.overfetch_factor must be at least 1"));
        }
        if self.query.partition_timeout_ms == 0 {
            return Err(config_error("query.partition_timeout_ms must be positive"));
        }
        if self.reconcile_interval_secs == Some(0) {
            return Err(config_error("reconcile_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn vamana_config(&self) -> VamanaConfig {
        VamanaConfig {
            dimension: self.dimension,
            metric: self.metric,
            max_degree: self.index.max_degree,
            alpha: self.index.alpha,
            build_list_size: self.index.build_list_size,
            search_list_size: self.index.search_list_size,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_data_dir(&self.storage.data_dir)
            .with_segment_max_bytes(self.storage.segment_max_bytes)
            .with_sync_on_write(self.storage.sync_on_write)
    }

    pub fn bucket_width_ms(&self) -> u64 {
        self.partition.bucket_width_secs.saturating_mul(1000)
    }

    pub fn retention_ms(&self) -> Option<u64> {
        self.partition.retention_secs.map(|s| s.saturating_mul(1000))
    }
}

fn config_error(message: impl Into<String>) -> EngineError {
    EngineError::Validation(ValidationError::Config(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dimension, 1536);
        assert_eq!(config.bucket_width_ms(), 7 * 24 * 60 * 60 * 1000);
        assert_eq!(config.query.failure_policy, FailurePolicy::FailQuery);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            dimension = 384
            metric = "l2"

            [partition]
            layout = "global"
            retention_secs = 86400

            [query]
            failure_policy = "best_effort"
            "#,
        )
        .unwrap();

        assert_eq!(config.dimension, 384);
        assert_eq!(config.metric, DistanceMetric::L2);
        assert_eq!(config.partition.layout, PartitionLayout::Global);
        assert_eq!(config.retention_ms(), Some(86_400_000));
        assert_eq!(config.query.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.index, IndexConfig::default());
        assert!(config.partition.auto_seal);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ragvec.toml");
        let mut config = EngineConfig::new(768, dir.path().join("data"));
        config.reconcile_interval_secs = Some(30);

        config.save_to(&path).unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.index.alpha = 0.9;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.partition.bucket_width_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.query.overfetch_factor = 0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::Validation(ValidationError::Config(_)))
        ));
    }
}
