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

//! RagVec Storage
//!
//! The durable source of truth for vector records. Indexes are derived
//! from what this crate returns and can always be rebuilt from it.
//!
//! - [`record_log`]: segmented, checksummed append-only log
//! - [`record_store`]: id-addressed record store replayed from the log

pub mod error;
pub mod record_log;
pub mod record_store;

pub use error::{Result, StoreError};
pub use record_log::{LogConfig, LogEntry, LogStats, RecordLog, RewriteStats};
pub use record_store::{CompactionStats, RecordScan, StoreConfig, StoreStats, VectorRecordStore};
