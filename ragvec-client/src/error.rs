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

//! Error types for the retrieval engine

use ragvec_core::{PartitionId, RecordId, ValidationError};
use ragvec_index::IndexError;
use ragvec_storage::StoreError;
use serde::Serialize;
use thiserror::Error;

/// One partition that did not contribute to a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionFailure {
    pub partition: PartitionId,
    pub reason: String,
}

impl std::fmt::Display for PartitionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.partition, self.reason)
    }
}

/// Partition lifecycle errors
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    /// Manifest unreadable or inconsistent with configuration
    #[error("partition manifest error: {0}")]
    Manifest(String),

    #[error("unknown partition {0}")]
    Unknown(PartitionId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PartitionError {
    fn from(err: serde_json::Error) -> Self {
        PartitionError::Manifest(err.to_string())
    }
}

/// Ingestion errors
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// Target partition no longer accepts writes
    #[error("partition {0} is sealed")]
    PartitionSealed(PartitionId),

    /// Target partition was dropped by retention
    #[error("partition {0} has expired")]
    PartitionExpired(PartitionId),

    /// Record is durable but missing from its partition index
    #[error("record {id} stored in {partition} but not indexed: {reason}")]
    IndexConsistency {
        id: RecordId,
        partition: PartitionId,
        reason: String,
    },

    #[error("record {0} not found")]
    NotFound(RecordId),

    /// Replacement stored but the original could not be removed
    #[error("replace left both {original} and {replacement} in place: {reason}")]
    ReplaceIncomplete {
        original: RecordId,
        replacement: RecordId,
        reason: String,
    },
}

/// Query errors
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Raised under the fail-query policy
    #[error("{} partition(s) failed: {}", failures.len(), join_failures(failures))]
    PartialFailure { failures: Vec<PartitionFailure> },

    #[error("query cancelled")]
    Cancelled,
}

fn join_failures(failures: &[PartitionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level engine error
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
