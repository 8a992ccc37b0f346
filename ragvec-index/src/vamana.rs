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

//! Vamana Graph Index (DiskANN-style)
//!
//! A single-layer directed proximity graph. Each node keeps at most
//! `max_degree` out-edges chosen by alpha-RobustPrune, which keeps some
//! long edges so greedy search reaches any region in few hops.
//!
//! ## Layout
//!
//! Nodes live in a dense arena and refer to each other by `u32` slot, so
//! the cyclic neighbor structure needs no shared ownership. A node is
//! never removed from the arena: deletion sets a tombstone that hides it
//! from results while it keeps routing traffic. Tombstones are dropped
//! when the partition is rebuilt.
//!
//! ## Concurrency
//!
//! `insert` and `search` run concurrently. The arena lock is taken for
//! writing only to push a new, still unlinked node; everything else runs
//! under a single shared arena guard plus one neighbor-list lock at a
//! time. A node becomes reachable only once an existing node links to it,
//! and by then its own neighbor list is already in place.
//!
//! ## Construction
//!
//! `build` starts from the medoid, inserts every vector once with
//! `alpha = 1.0`, then runs a second pass with the configured alpha to add
//! long-range edges.

use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use ragvec_core::{validate_vector, CancelToken, RecordId, ValidationError, VectorRecord};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};

/// Maximum out-degree (R in the DiskANN paper)
pub const DEFAULT_MAX_DEGREE: usize = 32;

/// Inline capacity of a neighbor list
const INLINE_DEGREE: usize = 32;

pub(crate) type NeighborList = SmallVec<[u32; INLINE_DEGREE]>;

/// Vamana index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VamanaConfig {
    /// Vector dimension
    pub dimension: usize,
    pub metric: DistanceMetric,
    /// Maximum out-degree for each node (R)
    pub max_degree: usize,
    /// Pruning parameter: higher = longer edges, fewer hops
    /// Typical: 1.0 (short edges), 1.2 (balanced), 1.5 (long edges)
    pub alpha: f32,
    /// Candidate list size during construction (L_build)
    pub build_list_size: usize,
    /// Default candidate list size during query (L_search)
    pub search_list_size: usize,
}

impl Default for VamanaConfig {
    fn default() -> Self {
        Self {
            dimension: 1536,
            metric: DistanceMetric::Cosine,
            max_degree: DEFAULT_MAX_DEGREE,
            alpha: 1.2,
            build_list_size: 64,
            search_list_size: 64,
        }
    }
}

impl VamanaConfig {
    pub fn for_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(IndexError::Config("dimension must be positive".into()));
        }
        if self.max_degree == 0 {
            return Err(IndexError::Config("max_degree must be positive".into()));
        }
        if !(self.alpha.is_finite() && self.alpha >= 1.0) {
            return Err(IndexError::Config(format!(
                "alpha must be >= 1.0, got {}",
                self.alpha
            )));
        }
        if self.build_list_size < self.max_degree {
            return Err(IndexError::Config(format!(
                "build_list_size ({}) must be at least max_degree ({})",
                self.build_list_size, self.max_degree
            )));
        }
        if self.search_list_size == 0 {
            return Err(IndexError::Config("search_list_size must be positive".into()));
        }
        Ok(())
    }
}

/// Graph node
pub(crate) struct Node {
    pub(crate) id: RecordId,
    pub(crate) vector: Box<[f32]>,
    pub(crate) neighbors: RwLock<NeighborList>,
    pub(crate) deleted: AtomicBool,
}

impl Node {
    pub(crate) fn new(id: RecordId, vector: &[f32]) -> Self {
        Self {
            id,
            vector: vector.into(),
            neighbors: RwLock::new(NeighborList::new()),
            deleted: AtomicBool::new(false),
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

/// One search hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: RecordId,
    pub distance: f32,
}

/// Candidate in the bounded search frontier
#[derive(Debug, Clone, Copy)]
struct Candidate {
    slot: u32,
    distance: f32,
    expanded: bool,
    /// Counts toward the frontier bound
    live: bool,
}

/// Cut the frontier just past its `list_size`-th live candidate
fn trim_frontier(frontier: &mut Vec<Candidate>, list_size: usize) -> bool {
    let mut live = 0;
    match frontier.iter().position(|c| {
        live += usize::from(c.live);
        live == list_size
    }) {
        Some(last) => {
            frontier.truncate(last + 1);
            true
        }
        None => false,
    }
}

fn by_distance(a: (f32, u32), b: (f32, u32)) -> CmpOrdering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

/// Outcome of one greedy walk
struct Walk {
    /// Best `list_size` nodes seen, ascending by distance
    frontier: Vec<(u32, f32)>,
    /// Every node whose neighbors were expanded
    expanded: Vec<(u32, f32)>,
}

/// Vamana index over one partition
pub struct VamanaIndex {
    config: VamanaConfig,
    /// Node arena; slots are stable for the life of the index
    pub(crate) nodes: RwLock<Vec<Node>>,
    /// Live record id -> slot
    pub(crate) slots: DashMap<RecordId, u32>,
    pub(crate) entry_point: RwLock<Option<u32>>,
    pub(crate) live: AtomicUsize,
}

impl VamanaIndex {
    pub fn new(config: VamanaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            nodes: RwLock::new(Vec::new()),
            slots: DashMap::new(),
            entry_point: RwLock::new(None),
            live: AtomicUsize::new(0),
        })
    }

    /// Build a graph from scratch over `records`, in the given order
    pub fn build<I, R>(config: VamanaConfig, records: I) -> Result<Self>
    where
        I: IntoIterator<Item = R>,
        R: Borrow<VectorRecord>,
    {
        let index = Self::new(config)?;

        {
            let mut nodes = index.nodes.write();
            for record in records {
                let record = record.borrow();
                validate_vector(&record.vector, index.config.dimension)?;
                if index.slots.contains_key(&record.id) {
                    return Err(IndexError::DuplicateId(record.id));
                }
                index.slots.insert(record.id, nodes.len() as u32);
                nodes.push(Node::new(record.id, &record.vector));
            }
        }

        let nodes = index.nodes.read();
        if nodes.is_empty() {
            drop(nodes);
            return Ok(index);
        }

        let medoid = medoid(&nodes, index.config.metric);
        *index.entry_point.write() = Some(medoid);

        for slot in 0..nodes.len() as u32 {
            if slot != medoid {
                index.link(&nodes, slot, medoid, 1.0);
            }
        }
        if index.config.alpha > 1.0 {
            for slot in 0..nodes.len() as u32 {
                index.link(&nodes, slot, medoid, index.config.alpha);
            }
        }

        index.live.store(nodes.len(), Ordering::Release);
        debug!(
            nodes = nodes.len(),
            medoid,
            alpha = index.config.alpha,
            "Vamana graph built"
        );
        drop(nodes);
        Ok(index)
    }

    pub fn config(&self) -> &VamanaConfig {
        &self.config
    }

    /// Insert one record into the live graph
    pub fn insert(&self, record: &VectorRecord) -> Result<()> {
        self.insert_vector(record.id, &record.vector)
    }

    pub fn insert_vector(&self, id: RecordId, vector: &[f32]) -> Result<()> {
        validate_vector(vector, self.config.dimension)?;

        let slot = {
            let mut nodes = self.nodes.write();
            if self.slots.contains_key(&id) {
                return Err(IndexError::DuplicateId(id));
            }
            let slot = nodes.len() as u32;
            nodes.push(Node::new(id, vector));
            self.slots.insert(id, slot);
            slot
        };

        let entry = {
            let mut entry_point = self.entry_point.write();
            match *entry_point {
                Some(entry) => entry,
                None => {
                    *entry_point = Some(slot);
                    self.live.fetch_add(1, Ordering::AcqRel);
                    return Ok(());
                }
            }
        };

        let nodes = self.nodes.read();
        self.link(&nodes, slot, entry, self.config.alpha);
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Approximate k-NN.
    ///
    /// `list_size` is the frontier width; values below `k` are raised to `k`.
    /// Returns at most `k` live hits ordered by `(distance, id)`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        list_size: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Err(ValidationError::InvalidK.into());
        }
        validate_vector(query, self.config.dimension)?;

        let entry = match *self.entry_point.read() {
            Some(entry) => entry,
            None => return Ok(Vec::new()),
        };

        let nodes = self.nodes.read();
        let walk = self.greedy_search(&nodes, query, entry, list_size.max(k), true, cancel)?;

        let mut hits: Vec<Neighbor> = walk
            .frontier
            .iter()
            .filter_map(|&(slot, distance)| {
                let node = nodes.get(slot as usize)?;
                (!node.is_deleted()).then_some(Neighbor {
                    id: node.id,
                    distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    /// Tombstone a record; it stays in the graph for routing
    pub fn delete(&self, id: &RecordId) -> Result<()> {
        let (_, slot) = self.slots.remove(id).ok_or(IndexError::NotFound(*id))?;
        let nodes = self.nodes.read();
        if let Some(node) = nodes.get(slot as usize) {
            node.deleted.store(true, Ordering::Release);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.slots.contains_key(id)
    }

    /// Ids of every live (non-tombstoned) record
    pub fn live_ids(&self) -> Vec<RecordId> {
        self.slots.iter().map(|entry| *entry.key()).collect()
    }

    /// Live records
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> VamanaStats {
        let nodes = self.nodes.read();
        let mut total_degree = 0usize;
        let mut max_degree = 0usize;
        let mut tombstones = 0usize;
        for node in nodes.iter() {
            let degree = node.neighbors.read().len();
            total_degree += degree;
            max_degree = max_degree.max(degree);
            if node.is_deleted() {
                tombstones += 1;
            }
        }

        VamanaStats {
            node_count: nodes.len(),
            live_count: self.len(),
            tombstones,
            avg_degree: if nodes.is_empty() {
                0.0
            } else {
                total_degree as f32 / nodes.len() as f32
            },
            max_degree,
            memory_bytes: nodes.len() * self.config.dimension * std::mem::size_of::<f32>()
                + total_degree * std::mem::size_of::<u32>(),
        }
    }

    /// Greedy beam search from `entry`.
    ///
    /// Keeps the `list_size` closest nodes seen, always expands the closest
    /// unexpanded one, and stops once every frontier node is expanded.
    /// With `skip_tombstones`, deleted nodes are still expanded for routing
    /// but do not count toward `list_size`.
    fn greedy_search(
        &self,
        nodes: &[Node],
        query: &[f32],
        entry: u32,
        list_size: usize,
        skip_tombstones: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Walk> {
        let list_size = list_size.max(1);
        let metric = self.config.metric;

        let entry_node = match nodes.get(entry as usize) {
            Some(node) => node,
            None => {
                return Ok(Walk {
                    frontier: Vec::new(),
                    expanded: Vec::new(),
                })
            }
        };

        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(entry);
        let is_live = |node: &Node| !skip_tombstones || !node.is_deleted();
        let mut frontier = vec![Candidate {
            slot: entry,
            distance: metric.distance(query, &entry_node.vector),
            expanded: false,
            live: is_live(entry_node),
        }];
        let mut full = trim_frontier(&mut frontier, list_size);
        let mut expanded = Vec::new();

        while let Some(position) = frontier.iter().position(|c| !c.expanded) {
            if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                return Err(IndexError::Cancelled);
            }

            frontier[position].expanded = true;
            let current = frontier[position];
            expanded.push((current.slot, current.distance));

            let neighbors: NeighborList = match nodes.get(current.slot as usize) {
                Some(node) => node.neighbors.read().clone(),
                None => continue,
            };

            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let node = match nodes.get(neighbor as usize) {
                    Some(node) => node,
                    None => continue,
                };
                let distance = metric.distance(query, &node.vector);

                if full {
                    let worst = frontier[frontier.len() - 1];
                    if by_distance((distance, neighbor), (worst.distance, worst.slot))
                        != CmpOrdering::Less
                    {
                        continue;
                    }
                }
                let at = frontier.partition_point(|c| {
                    by_distance((c.distance, c.slot), (distance, neighbor)) == CmpOrdering::Less
                });
                frontier.insert(
                    at,
                    Candidate {
                        slot: neighbor,
                        distance,
                        expanded: false,
                        live: is_live(node),
                    },
                );
                full = trim_frontier(&mut frontier, list_size);
            }
        }

        Ok(Walk {
            frontier: frontier.iter().map(|c| (c.slot, c.distance)).collect(),
            expanded,
        })
    }

    /// Search for `slot`'s neighbors from `entry` and link them both ways
    fn link(&self, nodes: &[Node], slot: u32, entry: u32, alpha: f32) {
        let node = match nodes.get(slot as usize) {
            Some(node) => node,
            None => return,
        };

        // No cancel token, so the walk cannot fail
        let walk = match self.greedy_search(
            nodes,
            &node.vector,
            entry,
            self.config.build_list_size,
            false,
            None,
        ) {
            Ok(walk) => walk,
            Err(_) => return,
        };

        let existing: NeighborList = node.neighbors.read().clone();
        let mut seen: HashSet<u32> = HashSet::new();
        let mut pool: Vec<(u32, f32)> = Vec::new();
        for (candidate, distance) in walk.expanded.into_iter().chain(walk.frontier) {
            if seen.insert(candidate) {
                pool.push((candidate, distance));
            }
        }
        for candidate in existing {
            if seen.insert(candidate) {
                if let Some(other) = nodes.get(candidate as usize) {
                    pool.push((candidate, self.config.metric.distance(&node.vector, &other.vector)));
                }
            }
        }

        let chosen = self.robust_prune(nodes, slot, pool, alpha);
        *node.neighbors.write() = chosen.clone();

        for neighbor in chosen {
            self.add_backlink(nodes, neighbor, slot, alpha);
        }
    }

    /// Add `source` to `target`'s out-edges, re-pruning on overflow
    fn add_backlink(&self, nodes: &[Node], target: u32, source: u32, alpha: f32) {
        let target_node = match nodes.get(target as usize) {
            Some(node) => node,
            None => return,
        };

        let mut neighbors = target_node.neighbors.write();
        if neighbors.contains(&source) {
            return;
        }
        if neighbors.len() < self.config.max_degree {
            neighbors.push(source);
            return;
        }

        let metric = self.config.metric;
        let pool: Vec<(u32, f32)> = neighbors
            .iter()
            .copied()
            .chain(std::iter::once(source))
            .filter_map(|n| {
                nodes
                    .get(n as usize)
                    .map(|other| (n, metric.distance(&target_node.vector, &other.vector)))
            })
            .collect();
        *neighbors = self.robust_prune(nodes, target, pool, alpha);
    }

    /// alpha-RobustPrune.
    ///
    /// Walks candidates nearest first and keeps one unless an already kept
    /// neighbor `s` satisfies `alpha * d(s, c) <= d(base, c)`.
    fn robust_prune(
        &self,
        nodes: &[Node],
        base: u32,
        mut pool: Vec<(u32, f32)>,
        alpha: f32,
    ) -> NeighborList {
        let metric = self.config.metric;
        pool.retain(|&(candidate, _)| {
            candidate != base
                && nodes
                    .get(candidate as usize)
                    .map(|n| !n.is_deleted())
                    .unwrap_or(false)
        });
        pool.sort_by(|a, b| by_distance((a.1, a.0), (b.1, b.0)));

        let mut selected = NeighborList::new();
        for (candidate, distance_to_base) in pool {
            if selected.len() >= self.config.max_degree {
                break;
            }
            let candidate_vector = &nodes[candidate as usize].vector;
            let dominated = selected.iter().any(|&kept| {
                let kept_vector = &nodes[kept as usize].vector;
                alpha * metric.distance(kept_vector, candidate_vector) <= distance_to_base
            });
            if !dominated {
                selected.push(candidate);
            }
        }
        selected
    }
}

/// Node closest to the centroid
fn medoid(nodes: &[Node], metric: DistanceMetric) -> u32 {
    let dimension = nodes.first().map(|n| n.vector.len()).unwrap_or(0);
    let mut centroid = vec![0f64; dimension];
    for node in nodes {
        for (sum, x) in centroid.iter_mut().zip(node.vector.iter()) {
            *sum += *x as f64;
        }
    }
    let count = nodes.len().max(1) as f64;
    let centroid: Vec<f32> = centroid.into_iter().map(|s| (s / count) as f32).collect();

    nodes
        .iter()
        .enumerate()
        .map(|(slot, node)| (slot as u32, metric.distance(&centroid, &node.vector)))
        .min_by(|a, b| by_distance((a.1, a.0), (b.1, b.0)))
        .map(|(slot, _)| slot)
        .unwrap_or(0)
}

/// Index statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct VamanaStats {
    /// Arena size, tombstones included
    pub node_count: usize,
    pub live_count: usize,
    pub tombstones: usize,
    pub avg_degree: f32,
    pub max_degree: usize,
    /// Vectors plus adjacency, excluding allocator overhead
    pub memory_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragvec_core::{Metadata, SourceType, Timestamp};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn random_records(n: usize, dim: usize, seed: u64) -> Vec<VectorRecord> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| VectorRecord {
                id: RecordId::new(),
                vector: (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect(),
                metadata: Metadata::new(),
                source_type: SourceType::Pdf,
                created_at: Timestamp::from_millis(0),
            })
            .collect()
    }

    fn exact_top_k(
        records: &[VectorRecord],
        query: &[f32],
        k: usize,
        metric: DistanceMetric,
    ) -> Vec<RecordId> {
        let mut all: Vec<(f32, RecordId)> = records
            .iter()
            .map(|r| (metric.distance(query, &r.vector), r.id))
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.into_iter().take(k).map(|(_, id)| id).collect()
    }

    fn config(dim: usize, metric: DistanceMetric) -> VamanaConfig {
        VamanaConfig {
            dimension: dim,
            metric,
            max_degree: 24,
            alpha: 1.2,
            build_list_size: 64,
            search_list_size: 64,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(VamanaConfig::for_dimension(8).validate().is_ok());
        let mut bad = VamanaConfig::for_dimension(8);
        bad.alpha = 0.5;
        assert!(matches!(bad.validate(), Err(IndexError::Config(_))));
        let mut bad = VamanaConfig::for_dimension(8);
        bad.build_list_size = 4;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let index = VamanaIndex::new(config(4, DistanceMetric::L2)).unwrap();
        assert!(index.search(&[0.0; 4], 3, 10, None).unwrap().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_and_find_self() {
        let records = random_records(200, 16, 7);
        let index = VamanaIndex::new(config(16, DistanceMetric::L2)).unwrap();
        for record in &records {
            index.insert(record).unwrap();
        }
        assert_eq!(index.len(), 200);

        let probes: Vec<_> = records.iter().step_by(10).collect();
        let found = probes
            .iter()
            .filter(|record| {
                let hits = index.search(&record.vector, 1, 64, None).unwrap();
                hits.first().map(|h| h.id == record.id).unwrap_or(false)
            })
            .count();
        assert!(found >= probes.len() - 1);
    }

    #[test]
    fn test_dimension_and_duplicate_rejected() {
        let records = random_records(2, 8, 1);
        let index = VamanaIndex::new(config(8, DistanceMetric::Cosine)).unwrap();
        index.insert(&records[0]).unwrap();
        assert!(matches!(
            index.insert(&records[0]),
            Err(IndexError::DuplicateId(_))
        ));
        assert!(matches!(
            index.search(&[0.0; 3], 1, 8, None),
            Err(IndexError::Validation(ValidationError::DimensionMismatch { .. }))
        ));
        assert!(matches!(
            index.search(&records[1].vector, 0, 8, None),
            Err(IndexError::Validation(ValidationError::InvalidK))
        ));
    }

    #[test]
    fn test_results_are_ordered_and_bounded() {
        let records = random_records(300, 12, 3);
        let index = VamanaIndex::build(config(12, DistanceMetric::Cosine), &records).unwrap();
        let hits = index.search(&records[5].vector, 10, 40, None).unwrap();
        assert_eq!(hits.len(), 10);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        let unique: HashSet<_> = hits.iter().map(|h| h.id).collect();
        assert_eq!(unique.len(), hits.len());
    }

    #[test]
    fn test_built_graph_recall() {
        let dim = 24;
        let records = random_records(1_000, dim, 42);
        let queries = random_records(50, dim, 4242);
        let index = VamanaIndex::build(config(dim, DistanceMetric::L2), &records).unwrap();

        let stats = index.stats();
        assert_eq!(stats.node_count, 1_000);
        assert!(stats.max_degree <= 24);
        assert!(stats.avg_degree > 1.0);

        let k = 10;
        let mut found = 0usize;
        for query in &queries {
            let truth: HashSet<_> = exact_top_k(&records, &query.vector, k, DistanceMetric::L2)
                .into_iter()
                .collect();
            let hits = index.search(&query.vector, k, 100, None).unwrap();
            found += hits.iter().filter(|h| truth.contains(&h.id)).count();
        }
        let recall = found as f64 / (queries.len() * k) as f64;
        assert!(recall >= 0.9, "recall {} below threshold", recall);
    }

    #[test]
    fn test_tombstones_hide_records() {
        let records = random_records(100, 8, 9);
        let index = VamanaIndex::build(config(8, DistanceMetric::L2), &records).unwrap();

        let victim = &records[17];
        index.delete(&victim.id).unwrap();
        assert!(matches!(index.delete(&victim.id), Err(IndexError::NotFound(_))));
        assert_eq!(index.len(), 99);
        assert_eq!(index.stats().tombstones, 1);

        let hits = index.search(&victim.vector, 5, 32, None).unwrap();
        assert!(hits.iter().all(|h| h.id != victim.id));
        assert!(!hits.is_empty());
    }

    #[test]
    fn test_search_walks_past_deleted_region() {
        let records: Vec<VectorRecord> = (0..300)
            .map(|i| VectorRecord {
                id: RecordId::new(),
                vector: vec![i as f32, 0.0],
                metadata: Metadata::new(),
                source_type: SourceType::Faq,
                created_at: Timestamp::from_millis(0),
            })
            .collect();
        let index = VamanaIndex::new(config(2, DistanceMetric::L2)).unwrap();
        for record in &records {
            index.insert(record).unwrap();
        }
        for record in &records[..200] {
            index.delete(&record.id).unwrap();
        }

        let hits = index.search(&[0.0, 0.0], 10, 16, None).unwrap();
        assert_eq!(hits.len(), 10);

        let truth: HashSet<_> = exact_top_k(&records[200..], &[0.0, 0.0], 10, DistanceMetric::L2)
            .into_iter()
            .collect();
        let found = hits.iter().filter(|h| truth.contains(&h.id)).count();
        assert!(found >= 9, "only {} of the 10 nearest live records found", found);
    }

    #[test]
    fn test_cancelled_search() {
        let records = random_records(50, 8, 11);
        let index = VamanaIndex::build(config(8, DistanceMetric::L2), &records).unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            index.search(&records[0].vector, 3, 16, Some(&token)),
            Err(IndexError::Cancelled)
        ));
    }

    #[test]
    fn test_concurrent_insert_and_search() {
        let records = Arc::new(random_records(400, 16, 21));
        let index = Arc::new(VamanaIndex::new(config(16, DistanceMetric::L2)).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let index = index.clone();
                let records = records.clone();
                std::thread::spawn(move || {
                    for record in records.iter().skip(t).step_by(4) {
                        index.insert(record).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let index = index.clone();
            let records = records.clone();
            std::thread::spawn(move || {
                for record in records.iter().take(100) {
                    let hits = index.search(&record.vector, 5, 32, None).unwrap();
                    assert!(hits.len() <= 5);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(index.len(), 400);
        let found = records
            .iter()
            .filter(|r| {
                index
                    .search(&r.vector, 1, 64, None)
                    .unwrap()
                    .first()
                    .map(|h| h.id == r.id)
                    .unwrap_or(false)
            })
            .count();
        assert!(found as f64 / 400.0 >= 0.95);
    }
}
