use crate::document::{Document, Value, compare_values};
use crate::errors::DbError;
use crate::query::{CmpOp, Filter};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardKeyKind {
    Range,
    Hash,
}

/// Declares how documents of a sharded collection are partitioned: an
/// ordered field list plus the routing strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardKey {
    pub fields: Vec<String>,
    pub kind: ShardKeyKind,
    pub unique: bool,
}

impl ShardKey {
    #[must_use]
    pub fn hashed(field: impl Into<String>) -> Self {
        Self { fields: vec![field.into()], kind: ShardKeyKind::Hash, unique: false }
    }

    #[must_use]
    pub fn ranged(fields: Vec<String>) -> Self {
        Self { fields, kind: ShardKeyKind::Range, unique: false }
    }

    /// Pulls the shard-key value out of a document: the single field's
    /// value, or an ordered tuple for a compound key.
    /// # Errors
    /// `InvalidInput` when a key field is missing.
    pub fn extract(&self, doc: &Document) -> Result<Value, DbError> {
        if self.fields.len() == 1 {
            return doc
                .get_path(&self.fields[0])
                .cloned()
                .ok_or_else(|| missing_field(&self.fields[0]));
        }
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            parts.push(doc.get_path(field).cloned().ok_or_else(|| missing_field(field))?);
        }
        Ok(Value::Array(parts))
    }

    /// A full shard-key value implied by a filter's top-level equality
    /// conjuncts, when every key field has one.
    #[must_use]
    pub fn extract_from_filter(&self, filter: &Filter) -> Option<Value> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            parts.push(filter_eq(filter, field)?.clone());
        }
        if self.fields.len() == 1 {
            Some(parts.remove(0))
        } else {
            Some(Value::Array(parts))
        }
    }

    /// FNV-1a over the canonical byte form: compound fields sorted by
    /// name, textual renderings concatenated.
    /// # Errors
    /// `InvalidInput` when a key field is missing from the document.
    pub fn hash(&self, doc: &Document) -> Result<u64, DbError> {
        let mut pairs = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = doc.get_path(field).ok_or_else(|| missing_field(field))?;
            pairs.push((field.as_str(), value));
        }
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let mut canonical = String::new();
        for (field, value) in pairs {
            canonical.push_str(field);
            canonical.push('=');
            canonical.push_str(&value.to_string());
            canonical.push(';');
        }
        Ok(fnv1a(canonical.as_bytes()))
    }

    /// Hash of an already-extracted shard-key value (query routing).
    #[must_use]
    pub fn hash_value(&self, value: &Value) -> u64 {
        let mut pairs: Vec<(&str, &Value)> = match value {
            Value::Array(items) if self.fields.len() > 1 => {
                self.fields.iter().map(String::as_str).zip(items.iter()).collect()
            }
            single => vec![(self.fields[0].as_str(), single)],
        };
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let mut canonical = String::new();
        for (field, value) in pairs {
            canonical.push_str(field);
            canonical.push('=');
            canonical.push_str(&value.to_string());
            canonical.push(';');
        }
        fnv1a(canonical.as_bytes())
    }
}

/// Shard-key ordering: nil below any value, numbers cross-compare,
/// compound values field-by-field in declared order with a missing side
/// lesser.
#[must_use]
pub fn compare_shard_values(a: &Value, b: &Value) -> Ordering {
    compare_values(a, b)
}

fn filter_eq<'a>(filter: &'a Filter, field: &str) -> Option<&'a Value> {
    match filter {
        Filter::Cmp { path, op: CmpOp::Eq, value } if path == field => Some(value),
        Filter::And(subs) => subs.iter().find_map(|f| filter_eq(f, field)),
        _ => None,
    }
}

fn missing_field(field: &str) -> DbError {
    DbError::InvalidInput(format!("document is missing shard key field {field}"))
}
