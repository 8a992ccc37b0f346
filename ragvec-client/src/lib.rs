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

//! RagVec Client
//!
//! The retrieval engine: durable ingestion of embedded chunks and
//! filtered top-k search across time- and source-partitioned Vamana
//! indexes.
//!
//! ## Features
//!
//! - **Partitioning**: records grouped by source type and time bucket;
//!   queries only touch partitions that can match
//! - **Snapshot isolation**: each partition publishes its graph through an
//!   atomic pointer, so sealing and repair never block queries
//! - **Fan-out queries**: partitions searched in parallel with a deadline,
//!   merged into a deterministic global top-k
//! - **Failure policy**: fail the query, or return a flagged degraded result
//! - **Reconciliation**: records that missed their index insert are
//!   re-indexed in the background
//!
//! ## Example
//!
//! ```no_run
//! use ragvec_client::{EngineConfig, RetrievalEngine, SearchRequest};
//! use ragvec_core::{Metadata, SourceType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = RetrievalEngine::open(EngineConfig::new(3, "./ragvec-data"))?;
//! engine.ingest(vec![0.1, 0.2, 0.3], Metadata::new(), SourceType::Pdf)?;
//!
//! let request = SearchRequest::new(vec![0.1, 0.2, 0.25], 5).with_sources([SourceType::Pdf]);
//! for hit in engine.search(&request)?.results {
//!     println!("{} {}", hit.record_id, hit.distance);
//! }
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod partition;
pub mod reconcile;

pub use config::{
    EngineConfig, FailurePolicy, IndexConfig, PartitionConfig, PartitionLayout, QueryConfig,
    StorageConfig,
};
pub use coordinator::{merge_results, QueryCoordinator, SearchRequest, SearchResponse};
pub use engine::{EngineStats, RetrievalEngine};
pub use error::{EngineError, IngestError, PartitionError, PartitionFailure, QueryError, Result};
pub use ingest::{IngestItem, IngestionGateway};
pub use partition::{
    Partition, PartitionInfo, PartitionManager, PartitionSettings, PartitionState,
    ReconcileReport, SealOutcome,
};
pub use reconcile::Reconciler;
