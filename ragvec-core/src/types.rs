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

//! Record, metadata and partition types
//!
//! These are the values that cross every layer boundary: the ingestion
//! gateway builds `VectorRecord`s, the record store persists them verbatim
//! (bit-exact `f32` components), and the query coordinator hands
//! `QueryResult`s to answer synthesis.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

// ============================================================================
// Identifiers and time
// ============================================================================

/// Globally unique, immutable record identifier.
///
/// Backed by a UUIDv7, so ids sort by creation time and the lower id is
/// also the older record. The query coordinator relies on this ordering to
/// break distance ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Fresh id stamped with the current wall clock
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Fresh id stamped with an explicit creation time (backfilled content)
    pub fn at(created_at: Timestamp) -> Self {
        let millis = created_at.as_millis();
        let ts = uuid::Timestamp::from_unix(
            uuid::NoContext,
            millis / 1000,
            ((millis % 1000) * 1_000_000) as u32,
        );
        Self(Uuid::new_v7(ts))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Milliseconds since the Unix epoch (UTC)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_add_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    pub fn saturating_sub_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Source types
// ============================================================================

/// Origin of an embedded chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Structured question/answer records
    Faq,
    Pdf,
    Docx,
    /// Google Docs
    Gdoc,
}

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::Faq,
        SourceType::Pdf,
        SourceType::Docx,
        SourceType::Gdoc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Faq => "faq",
            SourceType::Pdf => "pdf",
            SourceType::Docx => "docx",
            SourceType::Gdoc => "gdoc",
        }
    }

    /// Every source type, as a query filter set
    pub fn all() -> BTreeSet<SourceType> {
        Self::ALL.into_iter().collect()
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "faq" => Ok(SourceType::Faq),
            "pdf" => Ok(SourceType::Pdf),
            "docx" => Ok(SourceType::Docx),
            "gdoc" => Ok(SourceType::Gdoc),
            other => Err(ValidationError::UnknownSourceType(other.to_string())),
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Scalar metadata value
///
/// Externally tagged on the wire so the binary record codec round-trips it;
/// JSON callers go through `from_json` / `to_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Ordering between two values of comparable types.
    ///
    /// Int and Float compare numerically; mismatched kinds are unordered.
    pub fn compare(&self, other: &MetadataValue) -> Option<Ordering> {
        match (self, other) {
            (MetadataValue::Null, MetadataValue::Null) => Some(Ordering::Equal),
            (MetadataValue::Bool(a), MetadataValue::Bool(b)) => Some(a.cmp(b)),
            (MetadataValue::Int(a), MetadataValue::Int(b)) => Some(a.cmp(b)),
            (MetadataValue::Float(a), MetadataValue::Float(b)) => a.partial_cmp(b),
            (MetadataValue::Int(a), MetadataValue::Float(b)) => (*a as f64).partial_cmp(b),
            (MetadataValue::Float(a), MetadataValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (MetadataValue::Text(a), MetadataValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Convert a JSON scalar; arrays and objects have no metadata form
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(MetadataValue::Null),
            serde_json::Value::Bool(b) => Some(MetadataValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MetadataValue::Int)
                .or_else(|| n.as_f64().map(MetadataValue::Float)),
            serde_json::Value::String(s) => Some(MetadataValue::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetadataValue::Null => serde_json::Value::Null,
            MetadataValue::Bool(b) => serde_json::Value::Bool(*b),
            MetadataValue::Int(i) => serde_json::Value::from(*i),
            MetadataValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            MetadataValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Parse a literal typed on a command line: int, float, bool, null, else text
    pub fn parse_literal(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            return MetadataValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return MetadataValue::Float(f);
            }
        }
        match raw {
            "true" => MetadataValue::Bool(true),
            "false" => MetadataValue::Bool(false),
            "null" => MetadataValue::Null,
            _ => MetadataValue::Text(raw.trim_matches('"').to_string()),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        MetadataValue::Int(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Record metadata (ordered, so encoding is deterministic)
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Metadata map to a JSON object
pub fn metadata_to_json(metadata: &Metadata) -> serde_json::Value {
    serde_json::Value::Object(
        metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// JSON object to a metadata map; nested values are rejected
pub fn metadata_from_json(value: &serde_json::Value) -> Result<Metadata, ValidationError> {
    let object = match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => return Ok(Metadata::new()),
        _ => {
            return Err(ValidationError::MalformedMetadata(
                "metadata must be a JSON object".to_string(),
            ));
        }
    };

    let mut metadata = Metadata::new();
    for (key, raw) in object {
        let value = MetadataValue::from_json(raw).ok_or_else(|| {
            ValidationError::MalformedMetadata(format!("field '{}' is not a scalar", key))
        })?;
        metadata.insert(key.clone(), value);
    }
    Ok(metadata)
}

// ============================================================================
// Records
// ============================================================================

/// One embedded chunk, as persisted by the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: RecordId,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub source_type: SourceType,
    pub created_at: Timestamp,
}

/// One ranked hit returned to answer synthesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub record_id: RecordId,
    pub distance: f32,
    pub metadata: Metadata,
    pub source_type: SourceType,
    pub created_at: Timestamp,
}

// ============================================================================
// Time ranges
// ============================================================================

/// Half-open time range `[start, end)`; a missing bound is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeRange {
    /// Unbounded on both sides
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn until(end: Timestamp) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start.map(|start| start <= ts).unwrap_or(true)
            && self.end.map(|end| ts < end).unwrap_or(true)
    }

    /// Whether `[start, end)` intersects this range
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        if start >= end {
            return false;
        }
        let after_start = self.start.map(|s| end > s).unwrap_or(true);
        let before_end = self.end.map(|e| start < e).unwrap_or(true);
        after_start && before_end
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start >= end => {
                Err(ValidationError::InvalidTimeRange { start, end })
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Partitions
// ============================================================================

/// Which records a partition may own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTag {
    Source(SourceType),
    /// Spans every source type
    Global,
}

impl PartitionTag {
    /// Whether a partition with this tag can hold any of `sources`
    pub fn intersects(&self, sources: &BTreeSet<SourceType>) -> bool {
        match self {
            PartitionTag::Source(source) => sources.contains(source),
            PartitionTag::Global => !sources.is_empty(),
        }
    }

    pub fn admits(&self, source: SourceType) -> bool {
        match self {
            PartitionTag::Source(own) => *own == source,
            PartitionTag::Global => true,
        }
    }
}

impl fmt::Display for PartitionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionTag::Source(source) => f.write_str(source.as_str()),
            PartitionTag::Global => f.write_str("global"),
        }
    }
}

impl FromStr for PartitionTag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("global") {
            Ok(PartitionTag::Global)
        } else {
            s.parse().map(PartitionTag::Source)
        }
    }
}

/// Partition address: tag plus the start of its time bucket
///
/// Rendered as `<tag>-<bucket start millis>`, which is also the on-disk
/// snapshot file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub tag: PartitionTag,
    pub start: Timestamp,
}

impl PartitionId {
    pub fn new(tag: PartitionTag, start: Timestamp) -> Self {
        Self { tag, start }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.tag, self.start)
    }
}

impl FromStr for PartitionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ValidationError::MalformedPartitionId(s.to_string());
        let (tag, start) = s.rsplit_once('-').ok_or_else(malformed)?;
        let tag = tag.parse::<PartitionTag>().map_err(|_| malformed())?;
        let start = start.parse::<u64>().map_err(|_| malformed())?;
        Ok(PartitionId::new(tag, Timestamp::from_millis(start)))
    }
}
