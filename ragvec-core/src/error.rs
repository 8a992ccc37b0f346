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

//! Validation errors shared by every RagVec crate
//!
//! All of these are raised before any state is touched: a rejected record
//! or query leaves the store and the indexes exactly as they were.

use thiserror::Error;

use crate::types::Timestamp;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector component {position} is not finite")]
    NonFiniteComponent { position: usize },

    #[error("k must be at least 1")]
    InvalidK,

    #[error("malformed predicate: {0}")]
    MalformedPredicate(String),

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("invalid time range: start {start} is not before end {end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },

    #[error("unknown source type: {0}")]
    UnknownSourceType(String),

    #[error("malformed partition id: {0}")]
    MalformedPartitionId(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Check that `vector` has exactly `dimension` finite components
pub fn validate_vector(vector: &[f32], dimension: usize) -> Result<(), ValidationError> {
    if vector.len() != dimension {
        return Err(ValidationError::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        });
    }
    if let Some(position) = vector.iter().position(|x| !x.is_finite()) {
        return Err(ValidationError::NonFiniteComponent { position });
    }
    Ok(())
}
