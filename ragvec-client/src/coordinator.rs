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

//! Query Coordinator
//!
//! Fans a query out to every partition that can hold matching records,
//! filters each partition's hits against the stored records, and merges
//! the survivors into one global top-k.
//!
//! ```text
//!            ┌──▶ partition A ──┐
//!  query ────┼──▶ partition B ──┼──▶ filter ──▶ merge (distance, id) ──▶ top-k
//!            └──▶ partition C ──┘
//!                 (rayon pool, deadline)
//! ```
//!
//! Each partition runs on the rayon pool and reports back over a channel.
//! A partition that errors, panics or misses the deadline becomes a
//! [`PartitionFailure`]; the [`FailurePolicy`] decides whether the query
//! fails or returns a degraded result.

use std::collections::{BTreeSet, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use ragvec_core::{
    validate_vector, CancelToken, PartitionId, Predicate, QueryResult, SourceType, TimeRange,
    ValidationError, VectorRecord,
};
use ragvec_index::{DistanceMetric, IndexError};
use ragvec_storage::VectorRecordStore;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{FailurePolicy, QueryConfig};
use crate::error::{PartitionFailure, QueryError};
use crate::partition::{Partition, PartitionManager};

type Result<T> = std::result::Result<T, QueryError>;

/// How often the collector re-checks the caller's cancel token
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A top-k query with optional filters
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub k: usize,
    pub predicate: Predicate,
    /// Source types to search; all of them by default
    pub sources: BTreeSet<SourceType>,
    pub time_range: TimeRange,
    /// Frontier width override
    pub list_size: Option<usize>,
    pub cancel: Option<CancelToken>,
}

impl SearchRequest {
    pub fn new(vector: Vec<f32>, k: usize) -> Self {
        Self {
            vector,
            k,
            predicate: Predicate::default(),
            sources: SourceType::all(),
            time_range: TimeRange::all(),
            list_size: None,
            cancel: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_sources<I: IntoIterator<Item = SourceType>>(mut self, sources: I) -> Self {
        self.sources = sources.into_iter().collect();
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = time_range;
        self
    }

    pub fn with_list_size(mut self, list_size: usize) -> Self {
        self.list_size = Some(list_size);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Merged query answer
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    /// Ascending by distance, ties broken by record id
    pub results: Vec<QueryResult>,
    /// Set when any partition failed or was known to be missing records
    pub degraded: bool,
    pub failures: Vec<PartitionFailure>,
    /// Partitions searched while holding unindexed records
    pub inconsistent_partitions: Vec<PartitionId>,
    pub partitions_searched: usize,
}

/// Filters applied to every candidate after the graph search
#[derive(Debug, Clone)]
struct CandidateFilter {
    sources: BTreeSet<SourceType>,
    time_range: TimeRange,
    predicate: Predicate,
}

impl CandidateFilter {
    fn from_request(request: &SearchRequest) -> Self {
        Self {
            sources: request.sources.clone(),
            time_range: request.time_range,
            predicate: request.predicate.clone(),
        }
    }

    fn admits(&self, record: &VectorRecord) -> bool {
        self.sources.contains(&record.source_type)
            && self.time_range.contains(record.created_at)
            && self.predicate.matches(&record.metadata)
    }
}

fn to_result(record: &VectorRecord, distance: f32) -> QueryResult {
    QueryResult {
        record_id: record.id,
        distance,
        metadata: record.metadata.clone(),
        source_type: record.source_type,
        created_at: record.created_at,
    }
}

/// Per-partition work shared by every worker of one query
struct PartitionQuery {
    vector: Vec<f32>,
    k: usize,
    fetch: usize,
    list_size: usize,
    filter: CandidateFilter,
    store: Arc<VectorRecordStore>,
    cancel: CancelToken,
}

impl PartitionQuery {
    /// Graph search plus filtering. The fetch size doubles while filters
    /// leave fewer than `k` survivors and the graph has more to give.
    fn run(&self, partition: &Partition) -> std::result::Result<Vec<QueryResult>, IndexError> {
        let index = partition.index();
        let mut fetch = self.fetch;
        loop {
            let hits = index.search(
                &self.vector,
                fetch,
                self.list_size.max(fetch),
                Some(&self.cancel),
            )?;
            let exhausted = hits.len() < fetch || fetch >= index.len();
            let admitted: Vec<QueryResult> = hits
                .iter()
                .filter_map(|hit| {
                    // Deleted after the graph was built
                    let record = self.store.get(&hit.id)?;
                    self.filter
                        .admits(&record)
                        .then(|| to_result(&record, hit.distance))
                })
                .collect();

            if admitted.len() >= self.k || exhausted {
                return Ok(admitted);
            }
            fetch = fetch.saturating_mul(2).min(index.len());
        }
    }
}

/// Sort by (distance, id), drop duplicate ids, keep the best `k`
pub fn merge_results(mut hits: Vec<QueryResult>, k: usize) -> Vec<QueryResult> {
    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.record_id.cmp(&b.record_id))
    });
    let mut seen = HashSet::with_capacity(hits.len());
    hits.retain(|hit| seen.insert(hit.record_id));
    hits.truncate(k);
    hits
}

pub struct QueryCoordinator {
    manager: Arc<PartitionManager>,
    store: Arc<VectorRecordStore>,
    settings: QueryConfig,
    dimension: usize,
    metric: DistanceMetric,
    default_list_size: usize,
}

impl QueryCoordinator {
    pub fn new(
        manager: Arc<PartitionManager>,
        store: Arc<VectorRecordStore>,
        settings: QueryConfig,
    ) -> Self {
        let index = manager.settings().index.clone();
        Self {
            manager,
            store,
            settings,
            dimension: index.dimension,
            metric: index.metric,
            default_list_size: index.search_list_size,
        }
    }

    fn validate(&self, request: &SearchRequest) -> Result<()> {
        validate_vector(&request.vector, self.dimension)?;
        if request.k == 0 {
            return Err(ValidationError::InvalidK.into());
        }
        request.predicate.validate()?;
        request.time_range.validate()?;
        Ok(())
    }

    /// Approximate top-k over every relevant partition
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.validate(request)?;
        let caller = request.cancel.clone().unwrap_or_default();
        if caller.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let targets = self
            .manager
            .partitions_for_query(&request.sources, &request.time_range);
        if targets.is_empty() {
            return Ok(SearchResponse::default());
        }

        let fetch = request.k.saturating_mul(self.settings.overfetch_factor);
        let query_token = caller.child();
        let job = Arc::new(PartitionQuery {
            vector: request.vector.clone(),
            k: request.k,
            fetch,
            list_size: request.list_size.unwrap_or(self.default_list_size),
            filter: CandidateFilter::from_request(request),
            store: self.store.clone(),
            cancel: query_token.clone(),
        });

        let (tx, rx) = crossbeam_channel::bounded(targets.len());
        for partition in &targets {
            let job = job.clone();
            let partition = partition.clone();
            let tx = tx.clone();
            rayon::spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| job.run(&partition))) {
                    Ok(Ok(hits)) => Ok(hits),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("partition search panicked".to_string()),
                };
                // Receiver is gone once the query timed out
                let _ = tx.send((partition.id(), outcome));
            });
        }
        drop(tx);

        let deadline = Instant::now() + Duration::from_millis(self.settings.partition_timeout_ms);
        let mut pending: BTreeSet<PartitionId> = targets.iter().map(|p| p.id()).collect();
        let mut hits = Vec::new();
        let mut failures = Vec::new();

        while !pending.is_empty() {
            if caller.is_cancelled() {
                query_token.cancel();
                return Err(QueryError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok((id, outcome)) => {
                    pending.remove(&id);
                    match outcome {
                        Ok(partition_hits) => hits.extend(partition_hits),
                        Err(_) if caller.is_cancelled() => {
                            query_token.cancel();
                            return Err(QueryError::Cancelled);
                        }
                        Err(reason) => {
                            warn!(partition = %id, error = %reason, "Partition search failed");
                            failures.push(PartitionFailure {
                                partition: id,
                                reason,
                            });
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !pending.is_empty() {
            query_token.cancel();
            for id in pending {
                warn!(partition = %id, "Partition search timed out");
                failures.push(PartitionFailure {
                    partition: id,
                    reason: format!(
                        "timed out after {}ms",
                        self.settings.partition_timeout_ms
                    ),
                });
            }
        }

        let inconsistent = targets
            .iter()
            .filter(|p| !p.is_consistent())
            .map(|p| p.id())
            .collect();
        self.finish(hits, failures, inconsistent, targets.len(), request.k)
    }

    /// Apply the failure policy and merge
    fn finish(
        &self,
        hits: Vec<QueryResult>,
        failures: Vec<PartitionFailure>,
        inconsistent: Vec<PartitionId>,
        partitions_searched: usize,
        k: usize,
    ) -> Result<SearchResponse> {
        if !failures.is_empty() && self.settings.failure_policy == FailurePolicy::FailQuery {
            return Err(QueryError::PartialFailure { failures });
        }
        for id in &inconsistent {
            warn!(partition = %id, "Searched partition with unindexed records");
        }

        let results = merge_results(hits, k);
        debug!(
            results = results.len(),
            partitions = partitions_searched,
            failed = failures.len(),
            "Query complete"
        );
        Ok(SearchResponse {
            results,
            degraded: !failures.is_empty() || !inconsistent.is_empty(),
            failures,
            inconsistent_partitions: inconsistent,
            partitions_searched,
        })
    }

    /// Brute-force top-k straight from the record store.
    ///
    /// Same filters and ordering as [`search`](Self::search); used for
    /// recall measurement and as a fallback when graphs are suspect.
    pub fn search_exact(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.validate(request)?;
        let caller = request.cancel.clone().unwrap_or_default();
        if caller.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let targets = self
            .manager
            .partitions_for_query(&request.sources, &request.time_range);
        let filter = CandidateFilter::from_request(request);
        let metric = self.metric;

        let per_partition = targets
            .par_iter()
            .map(|partition| {
                if caller.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                let scored: Vec<QueryResult> = self
                    .store
                    .scan(&partition.id())
                    .filter(|record| filter.admits(record))
                    .map(|record| {
                        to_result(&record, metric.distance(&request.vector, &record.vector))
                    })
                    .collect();
                Ok(merge_results(scored, request.k))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SearchResponse {
            results: merge_results(per_partition.into_iter().flatten().collect(), request.k),
            partitions_searched: targets.len(),
            ..SearchResponse::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionLayout;
    use crate::partition::PartitionSettings;
    use ragvec_core::{Metadata, RecordId, Timestamp, VectorRecord};
    use ragvec_index::VamanaConfig;
    use ragvec_storage::StoreConfig;
    use tempfile::{tempdir, TempDir};

    fn hit(id: RecordId, distance: f32) -> QueryResult {
        QueryResult {
            record_id: id,
            distance,
            metadata: Metadata::new(),
            source_type: SourceType::Pdf,
            created_at: Timestamp::from_millis(0),
        }
    }

    fn coordinator(dir: &TempDir, policy: FailurePolicy) -> QueryCoordinator {
        let store = Arc::new(
            VectorRecordStore::open(StoreConfig::default().with_data_dir(dir.path())).unwrap(),
        );
        let settings = PartitionSettings {
            bucket_width_ms: 1000,
            layout: PartitionLayout::PerSource,
            retention_ms: None,
            index: VamanaConfig::for_dimension(3),
            data_dir: dir.path().to_path_buf(),
        };
        let manager = Arc::new(PartitionManager::open(settings, store.clone()).unwrap());
        let query = QueryConfig {
            failure_policy: policy,
            ..QueryConfig::default()
        };
        QueryCoordinator::new(manager, store, query)
    }

    #[test]
    fn test_merge_orders_and_dedups() {
        let a = RecordId::new();
        let b = RecordId::new();
        let c = RecordId::new();
        let merged = merge_results(
            vec![hit(c, 0.5), hit(a, 0.1), hit(b, 0.1), hit(a, 0.1), hit(c, 0.9)],
            3,
        );
        let ids: Vec<_> = merged.iter().map(|r| r.record_id).collect();
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        assert_eq!(ids, vec![first, second, c]);
        assert_eq!(merged[2].distance, 0.5);
    }

    #[test]
    fn test_failure_policies() {
        let dir = tempdir().unwrap();
        let failure = PartitionFailure {
            partition: PartitionId::new(
                ragvec_core::PartitionTag::Global,
                Timestamp::from_millis(0),
            ),
            reason: "timed out".to_string(),
        };
        let hits = vec![hit(RecordId::new(), 0.2)];

        let strict = coordinator(&dir, FailurePolicy::FailQuery);
        let err = strict
            .finish(hits.clone(), vec![failure.clone()], Vec::new(), 2, 5)
            .unwrap_err();
        assert!(matches!(err, QueryError::PartialFailure { ref failures } if failures.len() == 1));

        let dir = tempdir().unwrap();
        let lenient = coordinator(&dir, FailurePolicy::BestEffort);
        let response = lenient
            .finish(hits, vec![failure], Vec::new(), 2, 5)
            .unwrap();
        assert!(response.degraded);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.failures.len(), 1);
    }

    #[test]
    fn test_request_validation() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir, FailurePolicy::FailQuery);

        let wrong_dim = SearchRequest::new(vec![1.0, 2.0], 3);
        assert!(matches!(
            coordinator.search(&wrong_dim),
            Err(QueryError::Validation(ValidationError::DimensionMismatch { .. }))
        ));

        let zero_k = SearchRequest::new(vec![1.0, 2.0, 3.0], 0);
        assert!(matches!(
            coordinator.search(&zero_k),
            Err(QueryError::Validation(ValidationError::InvalidK))
        ));

        let inverted = SearchRequest::new(vec![1.0, 2.0, 3.0], 1).with_time_range(
            TimeRange::between(Timestamp::from_millis(10), Timestamp::from_millis(5)),
        );
        assert!(coordinator.search(&inverted).is_err());
    }

    #[test]
    fn test_empty_engine_returns_nothing() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir, FailurePolicy::FailQuery);
        let response = coordinator
            .search(&SearchRequest::new(vec![1.0, 0.0, 0.0], 5))
            .unwrap();
        assert!(response.results.is_empty());
        assert!(!response.degraded);
        assert_eq!(response.partitions_searched, 0);
    }

    #[test]
    fn test_precancelled_query() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir, FailurePolicy::FailQuery);
        let token = CancelToken::new();
        token.cancel();
        let request = SearchRequest::new(vec![1.0, 0.0, 0.0], 1).with_cancel(token);
        assert!(matches!(coordinator.search(&request), Err(QueryError::Cancelled)));
        assert!(matches!(
            coordinator.search_exact(&request),
            Err(QueryError::Cancelled)
        ));
    }

    /// Two partitions of ten records each
    fn populated(
        dir: &TempDir,
        policy: FailurePolicy,
        timeout_ms: u64,
    ) -> (Arc<VectorRecordStore>, Arc<PartitionManager>, QueryCoordinator) {
        let store = Arc::new(
            VectorRecordStore::open(StoreConfig::default().with_data_dir(dir.path())).unwrap(),
        );
        let settings = PartitionSettings {
            bucket_width_ms: 1000,
            layout: PartitionLayout::PerSource,
            retention_ms: None,
            index: VamanaConfig::for_dimension(3),
            data_dir: dir.path().to_path_buf(),
        };
        let manager = Arc::new(PartitionManager::open(settings, store.clone()).unwrap());
        for source in [SourceType::Pdf, SourceType::Faq] {
            for i in 0..10u64 {
                let created_at = Timestamp::from_millis(i);
                let record = VectorRecord {
                    id: RecordId::at(created_at),
                    vector: vec![i as f32, 1.0, 0.0],
                    metadata: Metadata::new(),
                    source_type: source,
                    created_at,
                };
                let partition = manager.partition_for(source, created_at).unwrap();
                let _gate = partition.write_gate().unwrap();
                store.put(partition.id(), record.clone()).unwrap();
                partition.index().insert(&record).unwrap();
            }
        }
        let query = QueryConfig {
            failure_policy: policy,
            partition_timeout_ms: timeout_ms,
            ..QueryConfig::default()
        };
        let coordinator = QueryCoordinator::new(manager.clone(), store.clone(), query);
        (store, manager, coordinator)
    }

    /// Holds every rayon worker until dropped, so partition searches queue
    struct BusyPool {
        _release: crossbeam_channel::Sender<()>,
    }

    fn occupy_pool() -> BusyPool {
        let threads = rayon::current_num_threads();
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        for _ in 0..threads {
            let started = started_tx.clone();
            let release = release_rx.clone();
            rayon::spawn(move || {
                let _ = started.send(());
                // Returns once the sender is dropped
                let _ = release.recv();
            });
        }
        for _ in 0..threads {
            started_rx.recv().unwrap();
        }
        BusyPool {
            _release: release_tx,
        }
    }

    #[test]
    fn test_search_over_all_partitions() {
        let dir = tempdir().unwrap();
        let (_store, _manager, coordinator) = populated(&dir, FailurePolicy::FailQuery, 2_000);
        let response = coordinator
            .search(&SearchRequest::new(vec![0.0, 1.0, 0.0], 4))
            .unwrap();
        assert_eq!(response.partitions_searched, 2);
        assert_eq!(response.results.len(), 4);
        assert!(!response.degraded);
        assert!(response.results.iter().all(|r| r.distance <= 1.0));
    }

    #[test]
    fn test_timed_out_partitions_degrade_best_effort_query() {
        let dir = tempdir().unwrap();
        let (_store, _manager, coordinator) = populated(&dir, FailurePolicy::BestEffort, 50);
        let request = SearchRequest::new(vec![0.0, 1.0, 0.0], 3);

        let busy = occupy_pool();
        let outcome = coordinator.search(&request);
        drop(busy);

        let response = outcome.unwrap();
        assert!(response.degraded);
        assert!(response.results.is_empty());
        assert_eq!(response.failures.len(), 2);
        assert!(response
            .failures
            .iter()
            .all(|f| f.reason.contains("timed out")));
    }

    #[test]
    fn test_timed_out_partitions_fail_strict_query() {
        let dir = tempdir().unwrap();
        let (_store, _manager, coordinator) = populated(&dir, FailurePolicy::FailQuery, 50);

        let busy = occupy_pool();
        let outcome = coordinator.search(&SearchRequest::new(vec![0.0, 1.0, 0.0], 3));
        drop(busy);

        match outcome {
            Err(QueryError::PartialFailure { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("expected partial failure, got {:?}", other.map(|r| r.results)),
        }
    }

    #[test]
    fn test_cancel_while_partitions_are_running() {
        let dir = tempdir().unwrap();
        let (_store, _manager, coordinator) = populated(&dir, FailurePolicy::BestEffort, 10_000);
        let token = CancelToken::new();
        let request = SearchRequest::new(vec![0.0, 1.0, 0.0], 3).with_cancel(token.clone());

        let busy = occupy_pool();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            token.cancel();
        });
        let started = Instant::now();
        let outcome = coordinator.search(&request);
        let elapsed = started.elapsed();
        drop(busy);
        canceller.join().unwrap();

        assert!(matches!(outcome, Err(QueryError::Cancelled)));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_unindexed_records_mark_response_degraded() {
        let dir = tempdir().unwrap();
        let (store, manager, coordinator) = populated(&dir, FailurePolicy::FailQuery, 2_000);

        let created_at = Timestamp::from_millis(20);
        let partition = manager.partition_for(SourceType::Pdf, created_at).unwrap();
        let orphan = VectorRecord {
            id: RecordId::at(created_at),
            vector: vec![-1.0, 1.0, 0.0],
            metadata: Metadata::new(),
            source_type: SourceType::Pdf,
            created_at,
        };
        store.put(partition.id(), orphan.clone()).unwrap();
        partition.mark_unindexed(orphan.id);

        let response = coordinator
            .search(&SearchRequest::new(vec![0.0, 1.0, 0.0], 3))
            .unwrap();
        assert!(response.degraded);
        assert!(response.failures.is_empty());
        assert_eq!(response.inconsistent_partitions, vec![partition.id()]);
        assert_eq!(response.results.len(), 3);

        manager.reconcile().unwrap();
        let response = coordinator
            .search(&SearchRequest::new(vec![-1.0, 1.0, 0.0], 1))
            .unwrap();
        assert!(!response.degraded);
        assert_eq!(response.results[0].record_id, orphan.id);
    }
}
