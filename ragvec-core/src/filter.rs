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

//! Metadata predicates
//!
//! A `Predicate` is a conjunction of clauses over scalar metadata fields.
//! An empty predicate matches every record. A clause on a field the record
//! does not carry never matches, whatever the operator.
//!
//! ```ignore
//! let predicate = Predicate::new()
//!     .eq("category", "Shipping")
//!     .range("chunk_index", 0, 10);
//! ```

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{Metadata, MetadataValue};

/// Comparison applied to one metadata field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Equal
    Eq(MetadataValue),
    /// Not equal
    Ne(MetadataValue),
    /// Greater than
    Gt(MetadataValue),
    /// Greater than or equal
    Gte(MetadataValue),
    /// Less than
    Lt(MetadataValue),
    /// Less than or equal
    Lte(MetadataValue),
    /// Member of a set
    In(Vec<MetadataValue>),
}

impl FilterOp {
    fn is_range(&self) -> bool {
        matches!(
            self,
            FilterOp::Gt(_) | FilterOp::Gte(_) | FilterOp::Lt(_) | FilterOp::Lte(_)
        )
    }

    fn apply(&self, value: &MetadataValue) -> bool {
        match self {
            FilterOp::Eq(target) => value.compare(target) == Some(Ordering::Equal),
            FilterOp::Ne(target) => value.compare(target) != Some(Ordering::Equal),
            FilterOp::Gt(target) => value.compare(target) == Some(Ordering::Greater),
            FilterOp::Gte(target) => matches!(
                value.compare(target),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt(target) => value.compare(target) == Some(Ordering::Less),
            FilterOp::Lte(target) => matches!(
                value.compare(target),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In(set) => set
                .iter()
                .any(|target| value.compare(target) == Some(Ordering::Equal)),
        }
    }
}

/// One `field <op> operand` condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub op: FilterOp,
}

impl Clause {
    pub fn new(field: impl Into<String>, op: FilterOp) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.field.trim().is_empty() {
            return Err(ValidationError::MalformedPredicate(
                "empty field name".to_string(),
            ));
        }

        let operands: &[MetadataValue] = match &self.op {
            FilterOp::In(set) if set.is_empty() => {
                return Err(ValidationError::MalformedPredicate(format!(
                    "'{}': empty set",
                    self.field
                )));
            }
            FilterOp::In(set) => set,
            FilterOp::Eq(v)
            | FilterOp::Ne(v)
            | FilterOp::Gt(v)
            | FilterOp::Gte(v)
            | FilterOp::Lt(v)
            | FilterOp::Lte(v) => std::slice::from_ref(v),
        };

        for operand in operands {
            if let MetadataValue::Float(f) = operand {
                if !f.is_finite() {
                    return Err(ValidationError::MalformedPredicate(format!(
                        "'{}': non-finite operand",
                        self.field
                    )));
                }
            }
            if self.op.is_range()
                && matches!(operand, MetadataValue::Bool(_) | MetadataValue::Null)
            {
                return Err(ValidationError::MalformedPredicate(format!(
                    "'{}': range comparison against an unordered value",
                    self.field
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match metadata.get(&self.field) {
            Some(value) => self.op.apply(value),
            None => false,
        }
    }
}

impl FromStr for Clause {
    type Err = ValidationError;

    /// Parse `field=value`, `field!=value`, `field>=value`, `field<=value`,
    /// `field>value`, `field<value` or `field in a,b,c`.
    ///
    /// The leftmost operator wins, so values may themselves contain
    /// operator characters or the word `in`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op_at = s.find(|c: char| matches!(c, '=' | '!' | '<' | '>'));

        if let Some(in_at) = s.find(" in ") {
            if op_at.map_or(true, |at| in_at < at) {
                let values = s[in_at + 4..]
                    .split(',')
                    .filter(|v| !v.trim().is_empty())
                    .map(MetadataValue::parse_literal)
                    .collect();
                let clause = Clause::new(s[..in_at].trim(), FilterOp::In(values));
                clause.validate()?;
                return Ok(clause);
            }
        }

        let at = op_at.ok_or_else(|| {
            ValidationError::MalformedPredicate(format!("no operator in '{}'", s))
        })?;
        let (field, rest) = s.split_at(at);

        const OPERATORS: [&str; 6] = [">=", "<=", "!=", "=", ">", "<"];
        let symbol = OPERATORS
            .iter()
            .copied()
            .find(|symbol| rest.starts_with(symbol))
            .ok_or_else(|| {
                ValidationError::MalformedPredicate(format!("unknown operator in '{}'", s))
            })?;
        let value = MetadataValue::parse_literal(&rest[symbol.len()..]);
        let op = match symbol {
            ">=" => FilterOp::Gte(value),
            "<=" => FilterOp::Lte(value),
            "!=" => FilterOp::Ne(value),
            "=" => FilterOp::Eq(value),
            ">" => FilterOp::Gt(value),
            _ => FilterOp::Lt(value),
        };
        let clause = Clause::new(field.trim(), op);
        clause.validate()?;
        Ok(clause)
    }
}

/// Conjunction of clauses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub clauses: Vec<Clause>,
}

impl Predicate {
    /// Empty predicate (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Equality on every entry of a field map
    pub fn from_equalities<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<MetadataValue>,
    {
        pairs
            .into_iter()
            .fold(Self::new(), |predicate, (field, value)| {
                predicate.eq(field, value)
            })
    }

    pub fn with(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Clause::new(field, FilterOp::Eq(value.into())))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Clause::new(field, FilterOp::Ne(value.into())))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Clause::new(field, FilterOp::Gt(value.into())))
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Clause::new(field, FilterOp::Gte(value.into())))
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Clause::new(field, FilterOp::Lt(value.into())))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Clause::new(field, FilterOp::Lte(value.into())))
    }

    /// Inclusive range `[min, max]`
    pub fn range(
        self,
        field: impl Into<String>,
        min: impl Into<MetadataValue>,
        max: impl Into<MetadataValue>,
    ) -> Self {
        let field = field.into();
        self.gte(field.clone(), min).lte(field, max)
    }

    pub fn one_of<V: Into<MetadataValue>>(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let set = values.into_iter().map(Into::into).collect();
        self.with(Clause::new(field, FilterOp::In(set)))
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Reject malformed clauses. Contradictory but well-formed clauses are
    /// accepted and simply match nothing.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.clauses.iter().try_for_each(Clause::validate)
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.clauses.iter().all(|clause| clause.matches(metadata))
    }
}
