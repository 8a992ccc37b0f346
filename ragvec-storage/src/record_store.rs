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

//! Vector Record Store
//!
//! Durable, id-addressed storage of `VectorRecord`s grouped by partition.
//! Every mutation is appended to the [`RecordLog`] before it becomes
//! visible, so anything a reader can see survives a restart.
//!
//! ## Concurrency
//!
//! - Operations on the same id serialize on one of a fixed set of striped
//!   locks; operations on different ids proceed in parallel.
//! - `compact` takes the maintenance gate exclusively so the rewritten log
//!   matches the in-memory view exactly.
//! - Scans return an owned snapshot and never block writers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use ragvec_core::{PartitionId, RecordId, VectorRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record_log::{LogConfig, RecordLog, DEFAULT_SEGMENT_MAX_SIZE};

/// Number of per-id lock stripes
const ID_LOCK_STRIPES: usize = 64;

/// Record store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root data directory; the log lives in `<data_dir>/records`
    pub data_dir: PathBuf,
    pub segment_max_bytes: u64,
    pub sync_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("ragvec-data"),
            segment_max_bytes: DEFAULT_SEGMENT_MAX_SIZE,
            sync_on_write: true,
        }
    }
}

impl StoreConfig {
    pub fn with_data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_segment_max_bytes(mut self, bytes: u64) -> Self {
        self.segment_max_bytes = bytes;
        self
    }

    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    fn log_config(&self) -> LogConfig {
        LogConfig::default()
            .with_dir(self.data_dir.join("records"))
            .with_max_segment_size(self.segment_max_bytes)
            .with_sync_on_write(self.sync_on_write)
    }
}

/// Log record payload
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    Put {
        partition: PartitionId,
        record: VectorRecord,
    },
    Delete {
        id: RecordId,
    },
    DropPartition {
        partition: PartitionId,
    },
}

struct StoredRecord {
    partition: PartitionId,
    record: Arc<VectorRecord>,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<RecordId, StoredRecord>,
    partitions: BTreeMap<PartitionId, BTreeSet<RecordId>>,
}

impl StoreState {
    /// Insert, replacing any prior copy (replay is an upsert)
    fn insert(&mut self, partition: PartitionId, record: VectorRecord) {
        let id = record.id;
        self.remove(&id);
        self.partitions.entry(partition).or_default().insert(id);
        self.records.insert(
            id,
            StoredRecord {
                partition,
                record: Arc::new(record),
            },
        );
    }

    fn remove(&mut self, id: &RecordId) -> Option<StoredRecord> {
        let stored = self.records.remove(id)?;
        if let Some(ids) = self.partitions.get_mut(&stored.partition) {
            ids.remove(id);
            if ids.is_empty() {
                self.partitions.remove(&stored.partition);
            }
        }
        Some(stored)
    }

    fn drop_partition(&mut self, partition: &PartitionId) -> usize {
        let ids = self.partitions.remove(partition).unwrap_or_default();
        for id in &ids {
            self.records.remove(id);
        }
        ids.len()
    }

    fn apply(&mut self, entry: LogRecord) {
        match entry {
            LogRecord::Put { partition, record } => self.insert(partition, record),
            LogRecord::Delete { id } => {
                self.remove(&id);
            }
            LogRecord::DropPartition { partition } => {
                self.drop_partition(&partition);
            }
        }
    }
}

/// Restartable snapshot of one partition's records, in id order
#[derive(Debug, Clone)]
pub struct RecordScan {
    partition: PartitionId,
    records: Arc<[Arc<VectorRecord>]>,
    position: usize,
}

impl RecordScan {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Total records in the snapshot, regardless of position
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Restart from the first record
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl Iterator for RecordScan {
    type Item = Arc<VectorRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.position)?.clone();
        self.position += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.records.len() - self.position;
        (remaining, Some(remaining))
    }
}

/// Compaction outcome
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub live_records: usize,
    pub segments_before: usize,
    pub segments_after: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub record_count: usize,
    pub partition_count: usize,
    pub segment_count: usize,
    pub log_bytes: u64,
}

/// Durable vector record store
pub struct VectorRecordStore {
    log: RecordLog,
    state: RwLock<StoreState>,
    id_locks: Box<[Mutex<()>]>,
    /// Shared by mutations, exclusive for compaction
    maintenance: RwLock<()>,
    closed: AtomicBool,
}

impl VectorRecordStore {
    /// Open the store, replaying its log
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut state = StoreState::default();
        let log = RecordLog::open(config.log_config(), |entry| {
            let record: LogRecord = bincode::deserialize(&entry.data).map_err(|e| {
                StoreError::Codec(format!("log entry {}: {}", entry.lsn, e))
            })?;
            state.apply(record);
            Ok(())
        })?;

        info!(
            records = state.records.len(),
            partitions = state.partitions.len(),
            "Record store opened"
        );

        Ok(Self {
            log,
            state: RwLock::new(state),
            id_locks: (0..ID_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            maintenance: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn id_lock(&self, id: &RecordId) -> &Mutex<()> {
        let stripe = (id.as_uuid().as_u128() as usize) % self.id_locks.len();
        &self.id_locks[stripe]
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Durably store a new record under `partition`.
    ///
    /// Either the record is fully persisted and visible, or nothing changes.
    pub fn put(&self, partition: PartitionId, record: VectorRecord) -> Result<()> {
        self.ensure_open()?;
        let _gate = self.maintenance.read();
        let _id_guard = self.id_lock(&record.id).lock();

        if self.state.read().records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }

        let entry = LogRecord::Put { partition, record };
        let data = bincode::serialize(&entry)?;
        self.log.append(&data)?;

        if let LogRecord::Put { partition, record } = entry {
            self.state.write().insert(partition, record);
        }
        Ok(())
    }

    pub fn get(&self, id: &RecordId) -> Option<Arc<VectorRecord>> {
        self.state.read().records.get(id).map(|s| s.record.clone())
    }

    /// Partition currently holding `id`
    pub fn partition_of(&self, id: &RecordId) -> Option<PartitionId> {
        self.state.read().records.get(id).map(|s| s.partition)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.state.read().records.contains_key(id)
    }

    /// Durably remove a record, returning the partition it lived in
    pub fn delete(&self, id: &RecordId) -> Result<PartitionId> {
        self.ensure_open()?;
        let _gate = self.maintenance.read();
        let _id_guard = self.id_lock(id).lock();

        let partition = self.partition_of(id).ok_or(StoreError::NotFound(*id))?;

        let data = bincode::serialize(&LogRecord::Delete { id: *id })?;
        self.log.append(&data)?;
        self.state.write().remove(id);

        debug!(record = %id, partition = %partition, "Record deleted");
        Ok(partition)
    }

    /// Snapshot of every record currently in `partition`
    pub fn scan(&self, partition: &PartitionId) -> RecordScan {
        let state = self.state.read();
        let records: Vec<Arc<VectorRecord>> = state
            .partitions
            .get(partition)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.records.get(id).map(|s| s.record.clone()))
                    .collect()
            })
            .unwrap_or_default();

        RecordScan {
            partition: *partition,
            records: records.into(),
            position: 0,
        }
    }

    /// Ids currently stored in `partition`
    pub fn record_ids(&self, partition: &PartitionId) -> BTreeSet<RecordId> {
        self.state
            .read()
            .partitions
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Partitions holding at least one record
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.state.read().partitions.keys().copied().collect()
    }

    pub fn partition_len(&self, partition: &PartitionId) -> usize {
        self.state
            .read()
            .partitions
            .get(partition)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    /// Durably remove every record of `partition`
    pub fn drop_partition(&self, partition: &PartitionId) -> Result<usize> {
        self.ensure_open()?;
        let _gate = self.maintenance.read();

        let data = bincode::serialize(&LogRecord::DropPartition {
            partition: *partition,
        })?;
        self.log.append(&data)?;
        let removed = self.state.write().drop_partition(partition);

        info!(partition = %partition, removed, "Partition dropped from record store");
        Ok(removed)
    }

    /// Rewrite the log so it holds exactly the live records
    pub fn compact(&self) -> Result<CompactionStats> {
        self.ensure_open()?;
        let _gate = self.maintenance.write();

        let before = self.log.stats();
        let frames: Vec<Vec<u8>> = {
            let state = self.state.read();
            let mut frames = Vec::with_capacity(state.records.len());
            for (partition, ids) in &state.partitions {
                for id in ids {
                    if let Some(stored) = state.records.get(id) {
                        frames.push(bincode::serialize(&LogRecord::Put {
                            partition: *partition,
                            record: (*stored.record).clone(),
                        })?);
                    }
                }
            }
            frames
        };
        let live_records = frames.len();

        self.log.rewrite(frames)?;
        let after = self.log.stats();

        Ok(CompactionStats {
            live_records,
            segments_before: before.segment_count,
            segments_after: after.segment_count,
            bytes_before: before.total_bytes,
            bytes_after: after.total_bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let log = self.log.stats();
        let state = self.state.read();
        StoreStats {
            record_count: state.records.len(),
            partition_count: state.partitions.len(),
            segment_count: log.segment_count,
            log_bytes: log.total_bytes,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    /// Flush and refuse further mutations
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _gate = self.maintenance.write();
        self.log.shutdown()
    }
}
