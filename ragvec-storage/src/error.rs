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

//! Record store errors

use ragvec_core::RecordId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Codec(String),

    #[error("corrupt record log segment {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("record {0} already exists")]
    DuplicateId(RecordId),

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("record store is closed")]
    Closed,

    #[error("record log is damaged after a failed append; reopen to recover")]
    Poisoned,
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
