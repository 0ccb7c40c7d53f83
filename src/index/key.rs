use crate::document::{ObjectId, Value};
use crate::errors::DbError;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Declared key type of an index. Every key entering a tree is
/// validated against this tag; a mismatch is `InvalidInput` rather than
/// a silent equal-compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Int64,
    Float64,
    String,
    ObjectId,
    Composite,
}

/// Typed index key. Composite keys compare field-by-field; a shorter
/// tuple is lesser when the longer one matches its prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKey {
    Int64(i64),
    Float64(OrderedFloat<f64>),
    String(String),
    ObjectId(ObjectId),
    Composite(Vec<IndexKey>),
}

impl IndexKey {
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Int64(_) => KeyType::Int64,
            Self::Float64(_) => KeyType::Float64,
            Self::String(_) => KeyType::String,
            Self::ObjectId(_) => KeyType::ObjectId,
            Self::Composite(_) => KeyType::Composite,
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Int64(_) => 0,
            Self::Float64(_) => 1,
            Self::String(_) => 2,
            Self::ObjectId(_) => 3,
            Self::Composite(_) => 4,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(i) => Some(*i as f64),
            Self::Float64(f) => Some(f.into_inner()),
            _ => None,
        }
    }

    /// Converts a document value into a key of the declared type.
    /// Int32 and Timestamp widen to Int64; everything else must match.
    /// # Errors
    /// `InvalidInput` when the value cannot carry the declared type.
    pub fn from_value(value: &Value, key_type: KeyType) -> Result<Self, DbError> {
        let key = Self::from_value_infer(value)?;
        if key.key_type() == key_type {
            Ok(key)
        } else {
            Err(DbError::InvalidInput(format!(
                "value of type {} cannot key a {key_type:?} index",
                value.type_name()
            )))
        }
    }

    /// Infers the key form of an indexable value.
    /// # Errors
    /// `InvalidInput` for non-indexable value types.
    pub fn from_value_infer(value: &Value) -> Result<Self, DbError> {
        Ok(match value {
            Value::Int32(i) => Self::Int64(i64::from(*i)),
            Value::Int64(i) => Self::Int64(*i),
            Value::Timestamp(t) => Self::Int64(*t),
            Value::Double(f) => Self::Float64(OrderedFloat(*f)),
            Value::String(s) => Self::String(s.clone()),
            Value::ObjectId(id) => Self::ObjectId(*id),
            other => {
                return Err(DbError::InvalidInput(format!(
                    "{} values are not indexable",
                    other.type_name()
                )));
            }
        })
    }

    // --- node wire form: tag byte + payload ---

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Int64(i) => {
                buf.push(1);
                buf.extend_from_slice(&i.to_le_bytes());
            }
            Self::Float64(f) => {
                buf.push(2);
                buf.extend_from_slice(&f.into_inner().to_le_bytes());
            }
            Self::String(s) => {
                buf.push(3);
                buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Self::ObjectId(id) => {
                buf.push(4);
                buf.extend_from_slice(id.bytes());
            }
            Self::Composite(items) => {
                buf.push(5);
                buf.push(items.len() as u8);
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }

    #[must_use]
    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Self::Int64(_) | Self::Float64(_) => 9,
            Self::String(s) => 3 + s.len(),
            Self::ObjectId(_) => 13,
            Self::Composite(items) => 2 + items.iter().map(Self::encoded_len).sum::<usize>(),
        }
    }

    pub(crate) fn decode_from(buf: &[u8], pos: &mut usize) -> Result<Self, DbError> {
        let take = |pos: &mut usize, n: usize| -> Result<&[u8], DbError> {
            if *pos + n > buf.len() {
                return Err(DbError::Corruption("truncated index key".into()));
            }
            let slice = &buf[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        };
        let tag = take(pos, 1)?[0];
        Ok(match tag {
            1 => {
                let b = take(pos, 8)?;
                Self::Int64(i64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
            }
            2 => {
                let b = take(pos, 8)?;
                Self::Float64(OrderedFloat(f64::from_le_bytes(b.try_into().unwrap_or([0; 8]))))
            }
            3 => {
                let len = {
                    let b = take(pos, 2)?;
                    u16::from_le_bytes([b[0], b[1]]) as usize
                };
                let s = std::str::from_utf8(take(pos, len)?)
                    .map_err(|_| DbError::Corruption("index key is not UTF-8".into()))?;
                Self::String(s.to_string())
            }
            4 => {
                let raw = take(pos, 12)?;
                let mut bytes = [0u8; 12];
                bytes.copy_from_slice(raw);
                Self::ObjectId(ObjectId::from_bytes(bytes))
            }
            5 => {
                let count = take(pos, 1)?[0] as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Self::decode_from(buf, pos)?);
                }
                Self::Composite(items)
            }
            other => return Err(DbError::Corruption(format!("unknown index key tag {other}"))),
        })
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Float64(a), Self::Float64(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Self::ObjectId(a), Self::ObjectId(b)) => a.cmp(b),
            (Self::Composite(a), Self::Composite(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            // Mixed tags are rejected at the API boundary; rank keeps
            // the order total for anything already persisted.
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(i) => write!(f, "{i}"),
            Self::Float64(x) => write!(f, "{}", x.into_inner()),
            Self::String(s) => f.write_str(s),
            Self::ObjectId(id) => f.write_str(&id.hex()),
            Self::Composite(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_shorter_prefix_is_lesser() {
        let short = IndexKey::Composite(vec![IndexKey::Int64(1)]);
        let long = IndexKey::Composite(vec![IndexKey::Int64(1), IndexKey::Int64(0)]);
        assert!(short < long);
    }

    #[test]
    fn value_conversion_validates_type() {
        let key = IndexKey::from_value(&Value::Int32(5), KeyType::Int64).unwrap();
        assert_eq!(key, IndexKey::Int64(5));
        assert!(IndexKey::from_value(&Value::String("x".into()), KeyType::Int64).is_err());
        assert!(IndexKey::from_value_infer(&Value::Null).is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let keys = vec![
            IndexKey::Int64(-42),
            IndexKey::Float64(OrderedFloat(2.5)),
            IndexKey::String("user".into()),
            IndexKey::ObjectId(ObjectId::new()),
            IndexKey::Composite(vec![IndexKey::String("US".into()), IndexKey::Int64(1001)]),
        ];
        for key in keys {
            let mut buf = Vec::new();
            key.encode_into(&mut buf);
            assert_eq!(buf.len(), key.encoded_len());
            let mut pos = 0;
            assert_eq!(IndexKey::decode_from(&buf, &mut pos).unwrap(), key);
            assert_eq!(pos, buf.len());
        }
    }
}
