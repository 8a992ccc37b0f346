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

//! RagVec Core
//!
//! Fundamental types shared by every RagVec crate.
//!
//! # Core Components
//!
//! - **Records**: `VectorRecord`, `RecordId`, `Timestamp`, `SourceType`
//! - **Metadata**: scalar `MetadataValue` maps and the conjunctive `Predicate`
//! - **Partitions**: `PartitionId` / `PartitionTag` addressing a time bucket
//! - **Validation**: `ValidationError`, raised before any mutation
//! - **Cancellation**: `CancelToken`, shared between a query and its fan-out

pub mod cancel;
pub mod error;
pub mod filter;
pub mod types;

pub use cancel::CancelToken;
pub use error::{ValidationError, validate_vector};
pub use filter::{Clause, FilterOp, Predicate};
pub use types::{
    Metadata, MetadataValue, PartitionId, PartitionTag, QueryResult, RecordId, SourceType,
    TimeRange, Timestamp, VectorRecord, metadata_from_json, metadata_to_json,
};
