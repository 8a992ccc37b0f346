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

//! RagVec Index
//!
//! Approximate nearest-neighbor search over one partition's vectors.
//!
//! - [`distance`]: SIMD distance kernels and the configured metric
//! - [`vamana`]: single-layer Vamana proximity graph (greedy search,
//!   alpha-RobustPrune, tombstone deletion)
//! - [`persistence`]: compressed index snapshots for sealed partitions

pub mod distance;
pub mod error;
pub mod persistence;
pub mod vamana;

pub use distance::DistanceMetric;
pub use error::{IndexError, Result};
pub use persistence::IndexSnapshot;
pub use vamana::{Neighbor, VamanaConfig, VamanaIndex, VamanaStats};
