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

//! Index errors

use ragvec_core::{RecordId, ValidationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("record {0} is already indexed")]
    DuplicateId(RecordId),

    #[error("record {0} is not in the index")]
    NotFound(RecordId),

    #[error("search cancelled")]
    Cancelled,

    #[error("invalid index configuration: {0}")]
    Config(String),

    #[error("invalid index snapshot: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Snapshot(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
