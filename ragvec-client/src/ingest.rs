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

//! Ingestion Gateway
//!
//! Validates a record, appends it to the durable store, then inserts it
//! into its partition's graph. A record is acknowledged only once both
//! steps succeed; a failed index insert leaves the record durable but
//! flagged for reconciliation.

use std::sync::Arc;

use ragvec_core::{
    validate_vector, Metadata, PartitionId, RecordId, SourceType, Timestamp, VectorRecord,
};
use ragvec_index::IndexError;
use ragvec_storage::{StoreError, VectorRecordStore};
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::partition::PartitionManager;

type Result<T> = std::result::Result<T, IngestError>;

/// One record to ingest; `created_at` defaults to now
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub source_type: SourceType,
    pub created_at: Option<Timestamp>,
}

impl IngestItem {
    pub fn new(vector: Vec<f32>, metadata: Metadata, source_type: SourceType) -> Self {
        Self {
            vector,
            metadata,
            source_type,
            created_at: None,
        }
    }

    pub fn at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

pub struct IngestionGateway {
    manager: Arc<PartitionManager>,
    store: Arc<VectorRecordStore>,
    dimension: usize,
}

impl IngestionGateway {
    pub fn new(
        manager: Arc<PartitionManager>,
        store: Arc<VectorRecordStore>,
        dimension: usize,
    ) -> Self {
        Self {
            manager,
            store,
            dimension,
        }
    }

    pub fn ingest(
        &self,
        vector: Vec<f32>,
        metadata: Metadata,
        source_type: SourceType,
    ) -> Result<RecordId> {
        self.ingest_at(vector, metadata, source_type, Timestamp::now())
    }

    /// Ingest with an explicit creation time
    pub fn ingest_at(
        &self,
        vector: Vec<f32>,
        metadata: Metadata,
        source_type: SourceType,
        created_at: Timestamp,
    ) -> Result<RecordId> {
        validate_vector(&vector, self.dimension)?;

        let record = VectorRecord {
            id: RecordId::at(created_at),
            vector,
            metadata,
            source_type,
            created_at,
        };
        let id = record.id;

        let partition = self.manager.partition_for(source_type, created_at)?;
        let _gate = partition.write_gate()?;
        self.store.put(partition.id(), record.clone())?;

        if let Err(e) = partition.index().insert(&record) {
            partition.mark_unindexed(id);
            warn!(
                record = %id,
                partition = %partition.id(),
                error = %e,
                "Record persisted but not indexed"
            );
            return Err(IngestError::IndexConsistency {
                id,
                partition: partition.id(),
                reason: e.to_string(),
            });
        }

        debug!(record = %id, partition = %partition.id(), "Ingested record");
        Ok(id)
    }

    /// Ingest each item independently; one failure does not stop the rest
    pub fn ingest_batch<I>(&self, items: I) -> Vec<Result<RecordId>>
    where
        I: IntoIterator<Item = IngestItem>,
    {
        items
            .into_iter()
            .map(|item| {
                let created_at = item.created_at.unwrap_or_else(Timestamp::now);
                self.ingest_at(item.vector, item.metadata, item.source_type, created_at)
            })
            .collect()
    }

    /// Remove a record from the store and its partition graph
    pub fn delete(&self, id: &RecordId) -> Result<PartitionId> {
        let partition_id = self.store.delete(id).map_err(|e| match e {
            StoreError::NotFound(id) => IngestError::NotFound(id),
            other => IngestError::Store(other),
        })?;

        if let Some(partition) = self.manager.get(&partition_id) {
            let was_unindexed = partition.forget(id);
            match partition.index().delete(id) {
                Ok(()) => {}
                Err(IndexError::NotFound(_)) if was_unindexed => {}
                Err(e) => {
                    warn!(
                        record = %id,
                        partition = %partition_id,
                        error = %e,
                        "Deleted record missing from partition index"
                    );
                    partition.mark_diverged();
                }
            }
        }
        debug!(record = %id, partition = %partition_id, "Deleted record");
        Ok(partition_id)
    }

    /// Correct a record: the new content is ingested under a fresh id,
    /// then the old record is deleted.
    ///
    /// If the old record cannot be deleted the new one is removed again and
    /// the delete error is returned. Should that removal fail too, both
    /// records exist and `ReplaceIncomplete` names them.
    pub fn replace(
        &self,
        id: &RecordId,
        vector: Vec<f32>,
        metadata: Metadata,
        source_type: SourceType,
    ) -> Result<RecordId> {
        if !self.store.contains(id) {
            return Err(IngestError::NotFound(*id));
        }
        validate_vector(&vector, self.dimension)?;
        let new_id = self.ingest(vector, metadata, source_type)?;
        let removed = self.delete(id).map(|_| ());
        self.settle_replace(id, new_id, removed)
    }

    fn settle_replace(
        &self,
        original: &RecordId,
        replacement: RecordId,
        removed: Result<()>,
    ) -> Result<RecordId> {
        let err = match removed {
            Ok(()) => return Ok(replacement),
            Err(IngestError::NotFound(_)) => {
                debug!(record = %original, "Replaced record was already deleted");
                return Ok(replacement);
            }
            Err(e) => e,
        };

        warn!(
            record = %original,
            replacement = %replacement,
            error = %err,
            "Replace could not delete the original, removing replacement"
        );
        match self.delete(&replacement) {
            Ok(_) | Err(IngestError::NotFound(_)) => Err(err),
            Err(rollback) => Err(IngestError::ReplaceIncomplete {
                original: *original,
                replacement,
                reason: format!("{}; removing replacement failed: {}", err, rollback),
            }),
        }
    }
}
