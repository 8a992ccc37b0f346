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

//! Retrieval engine facade

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ragvec_core::{Metadata, PartitionId, RecordId, SourceType, Timestamp, VectorRecord};
use ragvec_storage::{CompactionStats, StoreStats, VectorRecordStore};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::coordinator::{QueryCoordinator, SearchRequest, SearchResponse};
use crate::error::{EngineError, Result};
use crate::ingest::{IngestItem, IngestionGateway};
use crate::partition::{
    PartitionInfo, PartitionManager, PartitionSettings, PartitionState, ReconcileReport,
    SealOutcome,
};
use crate::reconcile::Reconciler;

/// Engine-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub records: usize,
    pub partitions: usize,
    pub open_partitions: usize,
    pub sealed_partitions: usize,
    pub unindexed_records: usize,
    pub store: StoreStats,
    pub partition_details: Vec<PartitionInfo>,
}

/// Durable, partitioned vector retrieval.
///
/// Owns the record store, the partition manager and the optional
/// background reconciler. Every method takes `&self`; share the engine
/// across threads behind an `Arc`.
pub struct RetrievalEngine {
    config: EngineConfig,
    store: Arc<VectorRecordStore>,
    manager: Arc<PartitionManager>,
    gateway: IngestionGateway,
    coordinator: QueryCoordinator,
    reconciler: Mutex<Option<Reconciler>>,
    closed: AtomicBool,
}

impl RetrievalEngine {
    /// Open (or create) an engine rooted at `config.storage.data_dir`
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage.data_dir)?;

        let store = Arc::new(VectorRecordStore::open(config.store_config())?);
        let manager = Arc::new(PartitionManager::open(
            PartitionSettings::from_config(&config),
            store.clone(),
        )?);

        if config.partition.auto_seal {
            let sealed = manager.seal_elapsed(Timestamp::now())?;
            if !sealed.is_empty() {
                info!(count = sealed.len(), "Sealed partitions that elapsed while closed");
            }
        }

        let reconciler = match config.reconcile_interval_secs {
            Some(secs) => Some(Reconciler::spawn(
                manager.clone(),
                Duration::from_secs(secs),
                config.partition.auto_seal,
            )?),
            None => None,
        };

        let gateway = IngestionGateway::new(manager.clone(), store.clone(), config.dimension);
        let coordinator =
            QueryCoordinator::new(manager.clone(), store.clone(), config.query.clone());

        info!(
            data_dir = %config.storage.data_dir.display(),
            dimension = config.dimension,
            metric = %config.metric,
            records = store.len(),
            partitions = manager.len(),
            "Retrieval engine opened"
        );

        Ok(Self {
            config,
            store,
            manager,
            gateway,
            coordinator,
            reconciler: Mutex::new(reconciler),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Ingest a record stamped with the current time
    pub fn ingest(
        &self,
        vector: Vec<f32>,
        metadata: Metadata,
        source_type: SourceType,
    ) -> Result<RecordId> {
        self.ensure_open()?;
        Ok(self.gateway.ingest(vector, metadata, source_type)?)
    }

    pub fn ingest_at(
        &self,
        vector: Vec<f32>,
        metadata: Metadata,
        source_type: SourceType,
        created_at: Timestamp,
    ) -> Result<RecordId> {
        self.ensure_open()?;
        Ok(self
            .gateway
            .ingest_at(vector, metadata, source_type, created_at)?)
    }

    /// Per-item results, in input order
    pub fn ingest_batch<I>(&self, items: I) -> Result<Vec<Result<RecordId>>>
    where
        I: IntoIterator<Item = IngestItem>,
    {
        self.ensure_open()?;
        Ok(self
            .gateway
            .ingest_batch(items)
            .into_iter()
            .map(|r| r.map_err(EngineError::from))
            .collect())
    }

    pub fn replace(
        &self,
        id: &RecordId,
        vector: Vec<f32>,
        metadata: Metadata,
        source_type: SourceType,
    ) -> Result<RecordId> {
        self.ensure_open()?;
        Ok(self.gateway.replace(id, vector, metadata, source_type)?)
    }

    pub fn delete(&self, id: &RecordId) -> Result<PartitionId> {
        self.ensure_open()?;
        Ok(self.gateway.delete(id)?)
    }

    pub fn get(&self, id: &RecordId) -> Result<Arc<VectorRecord>> {
        self.ensure_open()?;
        self.store.get(id).ok_or(EngineError::NotFound(*id))
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.ensure_open()?;
        Ok(self.coordinator.search(request)?)
    }

    /// Exhaustive search over stored records
    pub fn search_exact(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.ensure_open()?;
        Ok(self.coordinator.search_exact(request)?)
    }

    pub fn seal(&self, partition: &PartitionId) -> Result<SealOutcome> {
        self.ensure_open()?;
        Ok(self.manager.seal(partition)?)
    }

    pub fn seal_elapsed(&self) -> Result<Vec<PartitionId>> {
        self.ensure_open()?;
        Ok(self.manager.seal_elapsed(Timestamp::now())?)
    }

    pub fn expire(&self) -> Result<Vec<PartitionId>> {
        self.ensure_open()?;
        Ok(self.manager.expire(Timestamp::now())?)
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.ensure_open()?;
        Ok(self.manager.reconcile()?)
    }

    /// Rewrite the record log without deleted or dropped records
    pub fn compact(&self) -> Result<CompactionStats> {
        self.ensure_open()?;
        Ok(self.store.compact()?)
    }

    pub fn partitions(&self) -> Vec<PartitionInfo> {
        self.manager.list().iter().map(|p| p.info()).collect()
    }

    pub fn stats(&self) -> EngineStats {
        let partitions = self.manager.list();
        let sealed = partitions
            .iter()
            .filter(|p| p.state() == PartitionState::Sealed)
            .count();
        EngineStats {
            records: self.store.len(),
            partitions: partitions.len(),
            open_partitions: partitions.len() - sealed,
            sealed_partitions: sealed,
            unindexed_records: partitions.iter().map(|p| p.unindexed().len()).sum(),
            store: self.store.stats(),
            partition_details: partitions.iter().map(|p| p.info()).collect(),
        }
    }

    /// Stop background work and flush everything. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let reconciler = self.reconciler.lock().take();
        if let Some(mut reconciler) = reconciler {
            reconciler.stop();
        }
        self.manager.save_manifest()?;
        self.store.close()?;
        info!("Retrieval engine closed");
        Ok(())
    }
}

impl Drop for RetrievalEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close retrieval engine cleanly");
        }
    }
}
