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

//! Index Snapshots
//!
//! Sealed partitions persist their rebuilt graph so a restart does not pay
//! for a full rebuild. A snapshot is a gzip-compressed bincode image of the
//! arena (ids, vectors, neighbor slots, tombstones) and the entry point.
//!
//! Snapshots are written to `<path>.tmp` and renamed into place, so a
//! reader only ever sees a complete file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use ragvec_core::RecordId;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::vamana::{NeighborList, Node, VamanaConfig, VamanaIndex};

const SNAPSHOT_VERSION: u32 = 1;

/// Serializable index image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Format version
    pub version: u32,
    pub config: VamanaConfig,
    pub nodes: Vec<SnapshotNode>,
    pub entry_point: Option<u32>,
    /// Unix millis
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: RecordId,
    pub vector: Vec<f32>,
    pub neighbors: Vec<u32>,
    pub deleted: bool,
}

impl VamanaIndex {
    pub fn to_snapshot(&self) -> IndexSnapshot {
        let nodes = self.nodes.read();
        let snapshot_nodes = nodes
            .iter()
            .map(|node| SnapshotNode {
                id: node.id,
                vector: node.vector.to_vec(),
                neighbors: node.neighbors.read().to_vec(),
                deleted: node.deleted.load(Ordering::Acquire),
            })
            .collect();

        IndexSnapshot {
            version: SNAPSHOT_VERSION,
            config: self.config().clone(),
            nodes: snapshot_nodes,
            entry_point: *self.entry_point.read(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// Rebuild an index from a snapshot, rejecting inconsistent images
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(IndexError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        snapshot.config.validate()?;

        let node_count = snapshot.nodes.len();
        if let Some(entry) = snapshot.entry_point {
            if entry as usize >= node_count {
                return Err(IndexError::Snapshot(format!(
                    "entry point {} outside arena of {}",
                    entry, node_count
                )));
            }
        } else if node_count > 0 {
            return Err(IndexError::Snapshot("missing entry point".into()));
        }

        let index = Self::new(snapshot.config.clone())?;
        let mut nodes = Vec::with_capacity(node_count);
        let mut live = 0usize;
        for (slot, stored) in snapshot.nodes.into_iter().enumerate() {
            if stored.vector.len() != snapshot.config.dimension {
                return Err(IndexError::Snapshot(format!(
                    "node {} has dimension {}, expected {}",
                    stored.id,
                    stored.vector.len(),
                    snapshot.config.dimension
                )));
            }
            if stored.neighbors.len() > snapshot.config.max_degree
                || stored.neighbors.iter().any(|&n| n as usize >= node_count)
            {
                return Err(IndexError::Snapshot(format!(
                    "node {} has an invalid neighbor list",
                    stored.id
                )));
            }

            let node = Node::new(stored.id, &stored.vector);
            *node.neighbors.write() = NeighborList::from_vec(stored.neighbors);
            if stored.deleted {
                node.deleted.store(true, Ordering::Release);
            } else {
                if index.slots.insert(stored.id, slot as u32).is_some() {
                    return Err(IndexError::DuplicateId(stored.id));
                }
                live += 1;
            }
            nodes.push(node);
        }

        *index.nodes.write() = nodes;
        *index.entry_point.write() = snapshot.entry_point;
        index.live.store(live, Ordering::Release);
        Ok(index)
    }

    /// Write a snapshot atomically to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");

        let snapshot = self.to_snapshot();
        {
            let file = File::create(&tmp)?;
            let mut encoder =
                flate2::write::GzEncoder::new(BufWriter::new(file), flate2::Compression::fast());
            bincode::serialize_into(&mut encoder, &snapshot)?;
            let mut writer = encoder.finish()?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
        let snapshot: IndexSnapshot = bincode::deserialize_from(decoder)?;
        Self::from_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceMetric;
    use ragvec_core::{Metadata, SourceType, Timestamp, VectorRecord};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn records(n: usize, dim: usize) -> Vec<VectorRecord> {
        let mut rng = StdRng::seed_from_u64(5);
        (0..n)
            .map(|_| VectorRecord {
                id: RecordId::new(),
                vector: (0..dim).map(|_| rng.gen::<f32>()).collect(),
                metadata: Metadata::new(),
                source_type: SourceType::Faq,
                created_at: Timestamp::from_millis(0),
            })
            .collect()
    }

    #[test]
    fn test_save_load_preserves_graph() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("faq-0.vidx");
        let data = records(120, 8);
        let config = VamanaConfig::for_dimension(8).with_metric(DistanceMetric::L2);
        let index = VamanaIndex::build(config, &data).unwrap();
        index.delete(&data[3].id).unwrap();

        index.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = VamanaIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 119);
        assert!(!loaded.contains(&data[3].id));
        assert_eq!(loaded.config(), index.config());

        let query = &data[40].vector;
        let before = index.search(query, 5, 32, None).unwrap();
        let after = loaded.search(query, 5, 32, None).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let data = records(10, 4);
        let index = VamanaIndex::build(VamanaConfig::for_dimension(4), &data).unwrap();

        let mut snapshot = index.to_snapshot();
        snapshot.nodes[0].neighbors.push(999);
        assert!(matches!(
            VamanaIndex::from_snapshot(snapshot),
            Err(IndexError::Snapshot(_))
        ));

        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.vidx");
        fs::write(&path, b"not a snapshot").unwrap();
        assert!(VamanaIndex::load(&path).is_err());
    }
}
