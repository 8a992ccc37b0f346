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

//! Partition Manager
//!
//! Records are grouped by (source tag, time bucket). Each partition owns
//! one Vamana index published through an [`ArcSwap`], so queries load the
//! current graph without locking while sealing and repair build a
//! replacement off to the side and swap it in.
//!
//! ## Lifecycle
//!
//! ```text
//!   open ──seal──▶ sealed ──retention──▶ dropped
//!    │                │
//!    └── incremental  └── rebuilt graph, snapshot in indexes/<id>.vidx
//!        inserts
//! ```
//!
//! Ingestion holds a partition's write gate shared for the duration of a
//! put; sealing, repair and expiry take it exclusively, so no record can
//! slip into a partition after it has been sealed or dropped.
//!
//! The set of partitions and their states lives in `partitions.json`,
//! rewritten atomically on every lifecycle change.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use ragvec_core::{PartitionId, PartitionTag, RecordId, SourceType, TimeRange, Timestamp};
use ragvec_index::{IndexError, VamanaConfig, VamanaIndex, VamanaStats};
use ragvec_storage::VectorRecordStore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PartitionLayout};
use crate::error::{IngestError, PartitionError};

const MANIFEST_FILE: &str = "partitions.json";
const MANIFEST_VERSION: u32 = 1;
const INDEX_DIR: &str = "indexes";
const SNAPSHOT_EXTENSION: &str = "vidx";

type Result<T> = std::result::Result<T, PartitionError>;

/// Partitioning parameters derived from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct PartitionSettings {
    pub bucket_width_ms: u64,
    pub layout: PartitionLayout,
    pub retention_ms: Option<u64>,
    pub index: VamanaConfig,
    pub data_dir: PathBuf,
}

impl PartitionSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            bucket_width_ms: config.bucket_width_ms(),
            layout: config.partition.layout,
            retention_ms: config.retention_ms(),
            index: config.vamana_config(),
            data_dir: config.storage.data_dir.clone(),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    fn snapshot_path(&self, id: &PartitionId) -> PathBuf {
        self.data_dir
            .join(INDEX_DIR)
            .join(format!("{}.{}", id, SNAPSHOT_EXTENSION))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    /// Accepts inserts; graph grows incrementally
    Open,
    /// Read-only; graph rebuilt from the full record set
    Sealed,
}

/// One (tag, time bucket) shard
pub struct Partition {
    id: PartitionId,
    end: Timestamp,
    gate: RwLock<()>,
    sealed: AtomicBool,
    retired: AtomicBool,
    needs_rebuild: AtomicBool,
    index: ArcSwap<VamanaIndex>,
    /// Durable records whose index insert failed
    unindexed: Mutex<BTreeSet<RecordId>>,
}

impl Partition {
    fn new(id: PartitionId, end: Timestamp, state: PartitionState, index: VamanaIndex) -> Self {
        Self {
            id,
            end,
            gate: RwLock::new(()),
            sealed: AtomicBool::new(state == PartitionState::Sealed),
            retired: AtomicBool::new(false),
            needs_rebuild: AtomicBool::new(false),
            index: ArcSwap::from_pointee(index),
            unindexed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn start(&self) -> Timestamp {
        self.id.start
    }

    /// Exclusive end of the time bucket
    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn state(&self) -> PartitionState {
        if self.is_sealed() {
            PartitionState::Sealed
        } else {
            PartitionState::Open
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Current published graph
    pub fn index(&self) -> Arc<VamanaIndex> {
        self.index.load_full()
    }

    pub fn covers(&self, ts: Timestamp) -> bool {
        self.id.start <= ts && ts < self.end
    }

    pub fn unindexed(&self) -> Vec<RecordId> {
        self.unindexed.lock().iter().copied().collect()
    }

    /// False while some durable record is missing from the graph
    pub fn is_consistent(&self) -> bool {
        !self.needs_rebuild.load(Ordering::Acquire) && self.unindexed.lock().is_empty()
    }

    /// Shared write gate for one ingest; fails once the partition is
    /// sealed or expired
    pub(crate) fn write_gate(&self) -> std::result::Result<RwLockReadGuard<'_, ()>, IngestError> {
        let guard = self.gate.read();
        if self.retired.load(Ordering::Acquire) {
            return Err(IngestError::PartitionExpired(self.id));
        }
        if self.is_sealed() {
            return Err(IngestError::PartitionSealed(self.id));
        }
        Ok(guard)
    }

    pub(crate) fn mark_unindexed(&self, id: RecordId) {
        self.unindexed.lock().insert(id);
    }

    /// Returns whether `id` was waiting for reconciliation
    pub(crate) fn forget(&self, id: &RecordId) -> bool {
        self.unindexed.lock().remove(id)
    }

    /// Graph no longer matches the store; the next reconcile rebuilds it
    pub(crate) fn mark_diverged(&self) {
        self.needs_rebuild.store(true, Ordering::Release);
    }

    pub fn info(&self) -> PartitionInfo {
        let index = self.index();
        let unindexed = self.unindexed.lock().len();
        PartitionInfo {
            id: self.id,
            tag: self.id.tag,
            start: self.id.start,
            end: self.end,
            state: self.state(),
            records: index.len(),
            unindexed,
            consistent: unindexed == 0 && !self.needs_rebuild.load(Ordering::Acquire),
            index: index.stats(),
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("end", &self.end)
            .field("state", &self.state())
            .field("records", &self.index().len())
            .finish()
    }
}

/// Partition summary for stats and listings
#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    #[serde(serialize_with = "serialize_display")]
    pub id: PartitionId,
    #[serde(serialize_with = "serialize_display")]
    pub tag: PartitionTag,
    pub start: Timestamp,
    pub end: Timestamp,
    pub state: PartitionState,
    pub records: usize,
    pub unindexed: usize,
    pub consistent: bool,
    pub index: VamanaStats,
}

fn serialize_display<T: std::fmt::Display, S: Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Result of a seal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealOutcome {
    Sealed { records: usize },
    AlreadySealed,
}

/// Result of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub partitions_checked: usize,
    pub records_repaired: usize,
    pub partitions_rebuilt: usize,
    /// Partitions still inconsistent after the pass
    #[serde(serialize_with = "serialize_ids")]
    pub inconsistent: Vec<PartitionId>,
}

fn serialize_ids<S: Serializer>(
    ids: &[PartitionId],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(ids.iter().map(ToString::to_string))
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    bucket_width_ms: u64,
    partitions: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    id: PartitionId,
    end: Timestamp,
    state: PartitionState,
}

/// Owns every partition and its lifecycle
pub struct PartitionManager {
    settings: PartitionSettings,
    store: Arc<VectorRecordStore>,
    partitions: RwLock<BTreeMap<PartitionId, Arc<Partition>>>,
    manifest_lock: Mutex<()>,
}

impl PartitionManager {
    /// Recover partitions from the manifest and the record store.
    ///
    /// Sealed partitions load their snapshot when it matches the stored
    /// records; anything else is rebuilt from the store.
    pub fn open(settings: PartitionSettings, store: Arc<VectorRecordStore>) -> Result<Self> {
        fs::create_dir_all(settings.data_dir.join(INDEX_DIR))?;

        let mut entries: BTreeMap<PartitionId, (Timestamp, PartitionState)> = BTreeMap::new();
        if let Some(manifest) = load_manifest(&settings.manifest_path())? {
            if manifest.bucket_width_ms != settings.bucket_width_ms {
                return Err(PartitionError::Manifest(format!(
                    "bucket width changed from {}ms to {}ms; existing partitions cannot be remapped",
                    manifest.bucket_width_ms, settings.bucket_width_ms
                )));
            }
            for entry in manifest.partitions {
                entries.insert(entry.id, (entry.end, entry.state));
            }
        }
        for id in store.partitions() {
            entries.entry(id).or_insert_with(|| {
                warn!(partition = %id, "Partition missing from manifest, recovering as open");
                (
                    id.start.saturating_add_millis(settings.bucket_width_ms),
                    PartitionState::Open,
                )
            });
        }

        let loaded = entries
            .into_iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(id, (end, state))| recover_partition(&settings, &store, id, end, state))
            .collect::<Result<Vec<_>>>()?;

        let partitions = loaded
            .into_iter()
            .map(|p| (p.id, Arc::new(p)))
            .collect::<BTreeMap<_, _>>();
        info!(partitions = partitions.len(), "Partition manager opened");

        let manager = Self {
            settings,
            store,
            partitions: RwLock::new(partitions),
            manifest_lock: Mutex::new(()),
        };
        manager.save_manifest()?;
        Ok(manager)
    }

    pub fn settings(&self) -> &PartitionSettings {
        &self.settings
    }

    /// Address of the bucket that owns `(source, ts)`
    pub fn partition_id_for(&self, source: SourceType, ts: Timestamp) -> PartitionId {
        let millis = ts.as_millis();
        let start = millis - millis % self.settings.bucket_width_ms;
        let tag = match self.settings.layout {
            PartitionLayout::PerSource => PartitionTag::Source(source),
            PartitionLayout::Global => PartitionTag::Global,
        };
        PartitionId::new(tag, Timestamp::from_millis(start))
    }

    /// Partition for a new record, created on first use
    pub fn partition_for(&self, source: SourceType, ts: Timestamp) -> Result<Arc<Partition>> {
        let id = self.partition_id_for(source, ts);
        if let Some(partition) = self.partitions.read().get(&id) {
            return Ok(partition.clone());
        }

        let partition = {
            let mut partitions = self.partitions.write();
            if let Some(partition) = partitions.get(&id) {
                return Ok(partition.clone());
            }
            let end = id.start.saturating_add_millis(self.settings.bucket_width_ms);
            let index = VamanaIndex::new(self.settings.index.clone())?;
            let partition = Arc::new(Partition::new(id, end, PartitionState::Open, index));
            partitions.insert(id, partition.clone());
            partition
        };
        info!(partition = %id, "Created partition");
        self.save_manifest()?;
        Ok(partition)
    }

    pub fn get(&self, id: &PartitionId) -> Option<Arc<Partition>> {
        self.partitions.read().get(id).cloned()
    }

    /// All partitions, ordered by id
    pub fn list(&self) -> Vec<Arc<Partition>> {
        self.partitions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    /// Partitions that may hold records of `sources` inside `range`
    pub fn partitions_for_query(
        &self,
        sources: &BTreeSet<SourceType>,
        range: &TimeRange,
    ) -> Vec<Arc<Partition>> {
        self.partitions
            .read()
            .values()
            .filter(|p| p.id.tag.intersects(sources) && range.overlaps(p.id.start, p.end))
            .cloned()
            .collect()
    }

    /// Seal one partition. Sealing a sealed partition is a no-op.
    pub fn seal(&self, id: &PartitionId) -> Result<SealOutcome> {
        let partition = self.get(id).ok_or(PartitionError::Unknown(*id))?;
        let outcome = self.seal_partition(&partition)?;
        if matches!(outcome, SealOutcome::Sealed { .. }) {
            self.save_manifest()?;
        }
        Ok(outcome)
    }

    /// Seal every open partition whose bucket ended at or before `now`
    pub fn seal_elapsed(&self, now: Timestamp) -> Result<Vec<PartitionId>> {
        let mut sealed = Vec::new();
        for partition in self.list() {
            if partition.is_sealed() || partition.end > now {
                continue;
            }
            match self.seal_partition(&partition) {
                Ok(SealOutcome::Sealed { .. }) => sealed.push(partition.id),
                Ok(SealOutcome::AlreadySealed) => {}
                Err(e) => warn!(partition = %partition.id, error = %e, "Failed to seal elapsed partition"),
            }
        }
        if !sealed.is_empty() {
            self.save_manifest()?;
        }
        Ok(sealed)
    }

    fn seal_partition(&self, partition: &Partition) -> Result<SealOutcome> {
        let _gate = partition.gate.write();
        if partition.retired.load(Ordering::Acquire) {
            return Err(PartitionError::Unknown(partition.id));
        }
        if partition.is_sealed() && !partition.needs_rebuild.load(Ordering::Acquire) {
            debug!(partition = %partition.id, "Partition already sealed");
            return Ok(SealOutcome::AlreadySealed);
        }

        partition.sealed.store(true, Ordering::Release);
        let records = self.rebuild_locked(partition)?;
        info!(partition = %partition.id, records, "Sealed partition");
        Ok(SealOutcome::Sealed { records })
    }

    /// Rebuild a partition's graph from the store and publish it.
    ///
    /// Caller holds the write gate.
    fn rebuild_locked(&self, partition: &Partition) -> Result<usize> {
        let built = VamanaIndex::build(
            self.settings.index.clone(),
            self.store.scan(&partition.id),
        );
        let index = match built {
            Ok(index) => index,
            Err(e) => {
                partition.needs_rebuild.store(true, Ordering::Release);
                return Err(e.into());
            }
        };

        if partition.is_sealed() {
            let path = self.settings.snapshot_path(&partition.id);
            if let Err(e) = index.save(&path) {
                warn!(partition = %partition.id, error = %e, "Failed to write index snapshot");
            }
        }

        let records = index.len();
        partition.index.store(Arc::new(index));
        partition.unindexed.lock().clear();
        partition.needs_rebuild.store(false, Ordering::Release);
        Ok(records)
    }

    /// Drop partitions whose bucket ended more than the retention window
    /// before `now`, records and snapshots included.
    ///
    /// Each partition's records are dropped from the store before it leaves
    /// the manifest. A partition whose drop fails stays registered and
    /// searchable; the remaining partitions are still processed, the
    /// manifest is saved for those that were dropped, and the first failure
    /// is returned.
    pub fn expire(&self, now: Timestamp) -> Result<Vec<PartitionId>> {
        let retention = match self.settings.retention_ms {
            Some(retention) => retention,
            None => return Ok(Vec::new()),
        };

        let candidates: Vec<Arc<Partition>> = self
            .list()
            .into_iter()
            .filter(|p| p.end.saturating_add_millis(retention) <= now)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut dropped = Vec::with_capacity(candidates.len());
        let mut first_error = None;
        for partition in candidates {
            let _gate = partition.gate.write();
            let records = match self.store.drop_partition(&partition.id) {
                Ok(records) => records,
                Err(e) => {
                    warn!(partition = %partition.id, error = %e, "Failed to expire partition");
                    first_error.get_or_insert(PartitionError::from(e));
                    continue;
                }
            };
            partition.retired.store(true, Ordering::Release);
            match fs::remove_file(self.settings.snapshot_path(&partition.id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(partition = %partition.id, error = %e, "Failed to remove snapshot"),
            }
            info!(partition = %partition.id, records, "Expired partition");
            dropped.push(partition.id);
        }

        if !dropped.is_empty() {
            {
                let mut partitions = self.partitions.write();
                for id in &dropped {
                    partitions.remove(id);
                }
            }
            self.save_manifest()?;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(dropped),
        }
    }

    /// Re-index records whose insert failed and rebuild partitions whose
    /// graph disagrees with the store
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for partition in self.list() {
            let _gate = partition.gate.write();
            if partition.retired.load(Ordering::Acquire) {
                continue;
            }
            report.partitions_checked += 1;

            if partition.needs_rebuild.load(Ordering::Acquire) {
                match self.rebuild_locked(&partition) {
                    Ok(_) => report.partitions_rebuilt += 1,
                    Err(e) => {
                        warn!(partition = %partition.id, error = %e, "Rebuild failed");
                        report.inconsistent.push(partition.id);
                    }
                }
                continue;
            }

            let pending = std::mem::take(&mut *partition.unindexed.lock());
            let index = partition.index();
            let mut repaired = 0;
            for id in pending {
                let record = match self.store.get(&id) {
                    Some(record) => record,
                    None => continue,
                };
                match index.insert(&record) {
                    Ok(()) | Err(IndexError::DuplicateId(_)) => repaired += 1,
                    Err(e) => {
                        warn!(partition = %partition.id, record = %id, error = %e, "Re-index failed");
                        partition.mark_unindexed(id);
                    }
                }
            }
            report.records_repaired += repaired;
            if repaired > 0 && partition.is_sealed() {
                if let Err(e) = index.save(self.settings.snapshot_path(&partition.id)) {
                    warn!(partition = %partition.id, error = %e, "Failed to refresh snapshot");
                }
            }

            let stored = self.store.partition_len(&partition.id);
            if stored != index.len() {
                warn!(
                    partition = %partition.id,
                    stored,
                    indexed = index.len(),
                    "Index out of sync with store, rebuilding"
                );
                match self.rebuild_locked(&partition) {
                    Ok(_) => report.partitions_rebuilt += 1,
                    Err(e) => warn!(partition = %partition.id, error = %e, "Rebuild failed"),
                }
            }

            if !partition.unindexed.lock().is_empty()
                || partition.needs_rebuild.load(Ordering::Acquire)
            {
                report.inconsistent.push(partition.id);
            }
        }
        Ok(report)
    }

    /// Atomically rewrite the manifest
    pub fn save_manifest(&self) -> Result<()> {
        let _guard = self.manifest_lock.lock();
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            bucket_width_ms: self.settings.bucket_width_ms,
            partitions: self
                .partitions
                .read()
                .values()
                .map(|p| ManifestEntry {
                    id: p.id,
                    end: p.end,
                    state: p.state(),
                })
                .collect(),
        };

        let path = self.settings.manifest_path();
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn load_manifest(path: &Path) -> Result<Option<Manifest>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let manifest: Manifest = serde_json::from_slice(&bytes)?;
    if manifest.version != MANIFEST_VERSION {
        return Err(PartitionError::Manifest(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }
    Ok(Some(manifest))
}

fn recover_partition(
    settings: &PartitionSettings,
    store: &VectorRecordStore,
    id: PartitionId,
    end: Timestamp,
    state: PartitionState,
) -> Result<Partition> {
    if state == PartitionState::Sealed {
        if let Some(index) = load_snapshot(settings, store, &id) {
            debug!(partition = %id, records = index.len(), "Loaded index snapshot");
            return Ok(Partition::new(id, end, state, index));
        }
    }

    let index = VamanaIndex::build(settings.index.clone(), store.scan(&id))?;
    if state == PartitionState::Sealed {
        if let Err(e) = index.save(settings.snapshot_path(&id)) {
            warn!(partition = %id, error = %e, "Failed to write index snapshot");
        }
    }
    debug!(partition = %id, records = index.len(), ?state, "Rebuilt partition index");
    Ok(Partition::new(id, end, state, index))
}

/// Snapshot for a sealed partition, if it still matches the store
fn load_snapshot(
    settings: &PartitionSettings,
    store: &VectorRecordStore,
    id: &PartitionId,
) -> Option<VamanaIndex> {
    let path = settings.snapshot_path(id);
    if !path.exists() {
        warn!(partition = %id, "Snapshot missing, rebuilding");
        return None;
    }
    let index = match VamanaIndex::load(&path) {
        Ok(index) => index,
        Err(e) => {
            warn!(partition = %id, error = %e, "Snapshot unreadable, rebuilding");
            return None;
        }
    };
    if index.config() != &settings.index {
        warn!(partition = %id, "Snapshot built with different index settings, rebuilding");
        return None;
    }
    let indexed: BTreeSet<RecordId> = index.live_ids().into_iter().collect();
    if indexed != store.record_ids(id) {
        warn!(partition = %id, "Snapshot disagrees with stored records, rebuilding");
        return None;
    }
    Some(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragvec_core::{Metadata, VectorRecord};
    use ragvec_index::DistanceMetric;
    use ragvec_storage::StoreConfig;
    use tempfile::{tempdir, TempDir};

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn settings(dir: &Path, layout: PartitionLayout) -> PartitionSettings {
        PartitionSettings {
            bucket_width_ms: DAY_MS,
            layout,
            retention_ms: Some(2 * DAY_MS),
            index: VamanaConfig {
                dimension: 4,
                metric: DistanceMetric::L2,
                max_degree: 8,
                alpha: 1.2,
                build_list_size: 16,
                search_list_size: 16,
            },
            data_dir: dir.to_path_buf(),
        }
    }

    fn open(dir: &TempDir, layout: PartitionLayout) -> (Arc<VectorRecordStore>, PartitionManager) {
        let store = Arc::new(
            VectorRecordStore::open(StoreConfig::default().with_data_dir(dir.path())).unwrap(),
        );
        let manager = PartitionManager::open(settings(dir.path(), layout), store.clone()).unwrap();
        (store, manager)
    }

    fn record(source: SourceType, ts: u64, seed: f32) -> VectorRecord {
        let created_at = Timestamp::from_millis(ts);
        VectorRecord {
            id: RecordId::at(created_at),
            vector: vec![seed, seed + 1.0, seed * 0.5, 1.0],
            metadata: Metadata::new(),
            source_type: source,
            created_at,
        }
    }

    fn ingest(manager: &PartitionManager, store: &VectorRecordStore, record: &VectorRecord) {
        let partition = manager
            .partition_for(record.source_type, record.created_at)
            .unwrap();
        let _gate = partition.write_gate().unwrap();
        store.put(partition.id(), record.clone()).unwrap();
        partition.index().insert(record).unwrap();
    }

    #[test]
    fn test_bucket_assignment() {
        let dir = tempdir().unwrap();
        let (_store, manager) = open(&dir, PartitionLayout::PerSource);

        let id = manager.partition_id_for(SourceType::Pdf, Timestamp::from_millis(DAY_MS + 5));
        assert_eq!(id.tag, PartitionTag::Source(SourceType::Pdf));
        assert_eq!(id.start, Timestamp::from_millis(DAY_MS));

        let edge = manager.partition_id_for(SourceType::Pdf, Timestamp::from_millis(2 * DAY_MS));
        assert_eq!(edge.start, Timestamp::from_millis(2 * DAY_MS));

        let partition = manager
            .partition_for(SourceType::Faq, Timestamp::from_millis(10))
            .unwrap();
        assert!(partition.covers(Timestamp::from_millis(0)));
        assert!(!partition.covers(Timestamp::from_millis(DAY_MS)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_global_layout_shares_partition() {
        let dir = tempdir().unwrap();
        let (_store, manager) = open(&dir, PartitionLayout::Global);

        let a = manager.partition_for(SourceType::Pdf, Timestamp::from_millis(1)).unwrap();
        let b = manager.partition_for(SourceType::Faq, Timestamp::from_millis(2)).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().tag, PartitionTag::Global);
    }

    #[test]
    fn test_query_pruning() {
        let dir = tempdir().unwrap();
        let (_store, manager) = open(&dir, PartitionLayout::PerSource);
        for day in 0..3 {
            for source in [SourceType::Pdf, SourceType::Faq] {
                manager
                    .partition_for(source, Timestamp::from_millis(day * DAY_MS))
                    .unwrap();
            }
        }

        let pdf: BTreeSet<_> = [SourceType::Pdf].into_iter().collect();
        let range = TimeRange::between(
            Timestamp::from_millis(DAY_MS),
            Timestamp::from_millis(2 * DAY_MS),
        );
        let selected = manager.partitions_for_query(&pdf, &range);
        assert_eq!(selected.len(), 1);
        assert_eq!(
            selected[0].id(),
            PartitionId::new(PartitionTag::Source(SourceType::Pdf), Timestamp::from_millis(DAY_MS))
        );

        assert_eq!(manager.partitions_for_query(&SourceType::all(), &TimeRange::all()).len(), 6);
        assert!(manager.partitions_for_query(&BTreeSet::new(), &TimeRange::all()).is_empty());
    }

    #[test]
    fn test_seal_is_idempotent_and_blocks_ingest() {
        let dir = tempdir().unwrap();
        let (store, manager) = open(&dir, PartitionLayout::PerSource);
        for i in 0..20 {
            ingest(&manager, &store, &record(SourceType::Pdf, 100 + i, i as f32));
        }
        let id = manager.partition_id_for(SourceType::Pdf, Timestamp::from_millis(100));

        assert_eq!(manager.seal(&id).unwrap(), SealOutcome::Sealed { records: 20 });
        assert_eq!(manager.seal(&id).unwrap(), SealOutcome::AlreadySealed);

        let partition = manager.get(&id).unwrap();
        assert_eq!(partition.state(), PartitionState::Sealed);
        assert_eq!(partition.index().len(), 20);
        assert!(matches!(
            partition.write_gate(),
            Err(IngestError::PartitionSealed(sealed)) if sealed == id
        ));
        assert!(settings(dir.path(), PartitionLayout::PerSource)
            .snapshot_path(&id)
            .exists());
    }

    #[test]
    fn test_seal_unknown_partition() {
        let dir = tempdir().unwrap();
        let (_store, manager) = open(&dir, PartitionLayout::PerSource);
        let id = PartitionId::new(PartitionTag::Global, Timestamp::from_millis(0));
        assert!(matches!(manager.seal(&id), Err(PartitionError::Unknown(_))));
    }

    #[test]
    fn test_seal_elapsed_only_touches_finished_buckets() {
        let dir = tempdir().unwrap();
        let (store, manager) = open(&dir, PartitionLayout::PerSource);
        ingest(&manager, &store, &record(SourceType::Faq, 10, 1.0));
        ingest(&manager, &store, &record(SourceType::Faq, DAY_MS + 10, 2.0));

        let sealed = manager.seal_elapsed(Timestamp::from_millis(DAY_MS + 20)).unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].start, Timestamp::from_millis(0));

        let open_id = manager.partition_id_for(SourceType::Faq, Timestamp::from_millis(DAY_MS));
        assert_eq!(manager.get(&open_id).unwrap().state(), PartitionState::Open);
    }

    #[test]
    fn test_reopen_restores_states_and_indexes() {
        let dir = tempdir().unwrap();
        let sealed_id;
        let open_id;
        {
            let (store, manager) = open(&dir, PartitionLayout::PerSource);
            for i in 0..10 {
                ingest(&manager, &store, &record(SourceType::Pdf, i, i as f32));
                ingest(&manager, &store, &record(SourceType::Pdf, DAY_MS + i, i as f32));
            }
            sealed_id = manager.partition_id_for(SourceType::Pdf, Timestamp::from_millis(0));
            open_id = manager.partition_id_for(SourceType::Pdf, Timestamp::from_millis(DAY_MS));
            manager.seal(&sealed_id).unwrap();
            store.close().unwrap();
        }

        let (_store, manager) = open(&dir, PartitionLayout::PerSource);
        let sealed = manager.get(&sealed_id).unwrap();
        assert_eq!(sealed.state(), PartitionState::Sealed);
        assert_eq!(sealed.index().len(), 10);
        let open = manager.get(&open_id).unwrap();
        assert_eq!(open.state(), PartitionState::Open);
        assert_eq!(open.index().len(), 10);
    }

    #[test]
    fn test_stale_snapshot_is_rebuilt() {
        let dir = tempdir().unwrap();
        let id;
        {
            let (store, manager) = open(&dir, PartitionLayout::PerSource);
            for i in 0..5 {
                ingest(&manager, &store, &record(SourceType::Gdoc, i, i as f32));
            }
            id = manager.partition_id_for(SourceType::Gdoc, Timestamp::from_millis(0));
            manager.seal(&id).unwrap();
            let victim = store.record_ids(&id).into_iter().next().unwrap();
            store.delete(&victim).unwrap();
            store.close().unwrap();
        }

        let (_store, manager) = open(&dir, PartitionLayout::PerSource);
        assert_eq!(manager.get(&id).unwrap().index().len(), 4);
    }

    #[test]
    fn test_bucket_width_change_rejected() {
        let dir = tempdir().unwrap();
        {
            let (_store, manager) = open(&dir, PartitionLayout::PerSource);
            manager.partition_for(SourceType::Pdf, Timestamp::from_millis(0)).unwrap();
        }
        let store = Arc::new(
            VectorRecordStore::open(StoreConfig::default().with_data_dir(dir.path())).unwrap(),
        );
        let mut changed = settings(dir.path(), PartitionLayout::PerSource);
        changed.bucket_width_ms = DAY_MS / 2;
        assert!(matches!(
            PartitionManager::open(changed, store),
            Err(PartitionError::Manifest(_))
        ));
    }

    #[test]
    fn test_expire_drops_records() {
        let dir = tempdir().unwrap();
        let (store, manager) = open(&dir, PartitionLayout::PerSource);
        ingest(&manager, &store, &record(SourceType::Docx, 5, 1.0));
        ingest(&manager, &store, &record(SourceType::Docx, 3 * DAY_MS, 2.0));

        let expired = manager.expire(Timestamp::from_millis(3 * DAY_MS + 1)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(manager.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.partitions().iter().all(|id| id.start.as_millis() == 3 * DAY_MS));
    }

    #[test]
    fn test_failed_expire_keeps_partition_registered() {
        let dir = tempdir().unwrap();
        let now = Timestamp::from_millis(3 * DAY_MS + 1);
        {
            let (store, manager) = open(&dir, PartitionLayout::PerSource);
            ingest(&manager, &store, &record(SourceType::Docx, 5, 1.0));
            ingest(&manager, &store, &record(SourceType::Docx, 3 * DAY_MS, 2.0));
            manager.save_manifest().unwrap();

            store.close().unwrap();
            assert!(manager.expire(now).is_err());
            assert_eq!(manager.len(), 2);
            assert!(manager.list().iter().all(|p| p.write_gate().is_ok()));
        }

        // Manifest and store still agree after the failed pass
        let (store, manager) = open(&dir, PartitionLayout::PerSource);
        assert_eq!(manager.len(), 2);
        assert_eq!(store.len(), 2);

        assert_eq!(manager.expire(now).unwrap().len(), 1);
        drop(manager);
        drop(store);

        let (store, manager) = open(&dir, PartitionLayout::PerSource);
        assert_eq!(manager.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.partitions().iter().all(|id| id.start.as_millis() == 3 * DAY_MS));
    }

    #[test]
    fn test_reconcile_repairs_unindexed_records() {
        let dir = tempdir().unwrap();
        let (store, manager) = open(&dir, PartitionLayout::PerSource);
        ingest(&manager, &store, &record(SourceType::Pdf, 1, 1.0));

        let orphan = record(SourceType::Pdf, 2, 5.0);
        let partition = manager.partition_for(SourceType::Pdf, orphan.created_at).unwrap();
        store.put(partition.id(), orphan.clone()).unwrap();
        partition.mark_unindexed(orphan.id);
        assert!(!partition.is_consistent());

        let report = manager.reconcile().unwrap();
        assert_eq!(report.records_repaired, 1);
        assert!(report.inconsistent.is_empty());
        assert!(partition.is_consistent());
        assert!(partition.index().contains(&orphan.id));
    }

    #[test]
    fn test_reconcile_rebuilds_diverged_index() {
        let dir = tempdir().unwrap();
        let (store, manager) = open(&dir, PartitionLayout::PerSource);
        ingest(&manager, &store, &record(SourceType::Faq, 1, 1.0));

        let silent = record(SourceType::Faq, 2, 3.0);
        let partition = manager.partition_for(SourceType::Faq, silent.created_at).unwrap();
        store.put(partition.id(), silent.clone()).unwrap();

        let report = manager.reconcile().unwrap();
        assert_eq!(report.partitions_rebuilt, 1);
        assert!(partition.index().contains(&silent.id));
    }
}
