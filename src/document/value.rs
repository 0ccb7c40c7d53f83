use super::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Tagged value, one variant per wire tag. Field order inside embedded
/// documents is preserved by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    ObjectId(ObjectId),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Document(Document),
    Array(Vec<Value>),
}

impl Value {
    /// Wire tag, also used as the type rank for cross-type ordering.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int32(_) => 2,
            Self::Int64(_) => 3,
            Self::Double(_) => 4,
            Self::String(_) => 5,
            Self::Binary(_) => 6,
            Self::ObjectId(_) => 7,
            Self::Timestamp(_) => 8,
            Self::Document(_) => 9,
            Self::Array(_) => 10,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::ObjectId(_) => "objectid",
            Self::Timestamp(_) => "timestamp",
            Self::Document(_) => "document",
            Self::Array(_) => "array",
        }
    }

    /// Numeric view across the three numeric variants.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(i) => Some(f64::from(*i)),
            Self::Int64(i) => Some(*i as f64),
            Self::Double(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int32(i) => write!(f, "{i}"),
            Self::Int64(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => f.write_str(s),
            Self::Binary(b) => write!(f, "binary({})", b.len()),
            Self::ObjectId(id) => f.write_str(&id.hex()),
            Self::Timestamp(t) => write!(f, "ts({t})"),
            Self::Document(d) => write!(f, "{{{} fields}}", d.len()),
            Self::Array(a) => write!(f, "[{} items]", a.len()),
        }
    }
}

/// Compares two values for filter evaluation and shard-key ordering.
/// Numbers cross-compare; `Null` sorts below everything; otherwise
/// mismatched tags order by tag rank so sorting stays total.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
        (Value::ObjectId(x), Value::ObjectId(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xa, ya) in x.iter().zip(y.iter()) {
                let ord = compare_values(xa, ya);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => a.tag().cmp(&b.tag()),
    }
}

/// Ordered field map. Insertion order is preserved; the codec depends
/// on it and `decode(encode(d)) == d` includes order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Resolves a dotted path through embedded documents.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut cur = self.get(first)?;
        for p in parts {
            match cur {
                Value::Document(d) => cur = d.get(p)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    /// Replaces in place when the field exists, otherwise appends.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// The document's `_id`, when present and of ObjectId type.
    #[must_use]
    pub fn id(&self) -> Option<ObjectId> {
        match self.get(super::ID_FIELD) {
            Some(Value::ObjectId(id)) => Some(*id),
            _ => None,
        }
    }

    /// Keeps only the named top-level fields plus `_id`.
    #[must_use]
    pub fn project(&self, fields: &[String]) -> Self {
        let mut out = Self::new();
        if let Some(id) = self.get(super::ID_FIELD) {
            out.set(super::ID_FIELD, id.clone());
        }
        for f in fields {
            if f != super::ID_FIELD
                && let Some(v) = self.get(f)
            {
                out.set(f.clone(), v.clone());
            }
        }
        out
    }
}

/// Builds a [`Document`] from literal fields, in order.
#[macro_export]
macro_rules! doc {
    () => { $crate::document::Document::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut d = $crate::document::Document::new();
        $( d.set($name, $value); )+
        d
    }};
}
