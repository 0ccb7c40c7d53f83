use super::key::compare_shard_values;
use crate::document::Value;
use crate::errors::DbError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Active,
    Draining,
    Inactive,
    Unreachable,
}

/// One storage node of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub host: String,
    pub tags: Vec<String>,
    pub state: ShardState,
}

impl Shard {
    #[must_use]
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self { id: id.into(), host: host.into(), tags: Vec::new(), state: ShardState::Active }
    }
}

/// Contiguous shard-key range `[min, max)` owned by one shard. A `None`
/// bound means ±∞.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub shard: String,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub count: u64,
    pub size: u64,
    pub version: u64,
}

impl Chunk {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        shard: impl Into<String>,
        min: Option<Value>,
        max: Option<Value>,
    ) -> Self {
        Self { id: id.into(), shard: shard.into(), min, max, count: 0, size: 0, version: 1 }
    }

    /// `min ≤ v < max`, with missing bounds acting as ±∞.
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        let above_min = self
            .min
            .as_ref()
            .is_none_or(|min| compare_shard_values(value, min) != Ordering::Less);
        let below_max = self
            .max
            .as_ref()
            .is_none_or(|max| compare_shard_values(value, max) == Ordering::Less);
        above_min && below_max
    }

    /// Half-open interval intersection.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let self_before_other = match (&self.max, &other.min) {
            (Some(max), Some(min)) => compare_shard_values(max, min) != Ordering::Greater,
            (None, _) | (_, None) => false,
        };
        let other_before_self = match (&other.max, &self.min) {
            (Some(max), Some(min)) => compare_shard_values(max, min) != Ordering::Greater,
            (None, _) | (_, None) => false,
        };
        !(self_before_other || other_before_self)
    }
}

/// Range-sharding chunk table for one shard-key space. Chunks are kept
/// pairwise non-overlapping; overlap is rejected at registration.
#[derive(Default)]
pub struct ChunkManager {
    chunks: Mutex<Vec<Chunk>>,
}

impl ChunkManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// `Duplicate` for a reused chunk id, `Conflict` when the range
    /// overlaps an existing chunk.
    pub fn add_chunk(&self, chunk: Chunk) -> Result<(), DbError> {
        let mut chunks = self.chunks.lock();
        if chunks.iter().any(|c| c.id == chunk.id) {
            return Err(DbError::Duplicate(format!("chunk {} already registered", chunk.id)));
        }
        if let Some(existing) = chunks.iter().find(|c| c.overlaps(&chunk)) {
            return Err(DbError::Conflict(format!(
                "chunk {} overlaps existing chunk {}",
                chunk.id, existing.id
            )));
        }
        chunks.push(chunk);
        Ok(())
    }

    /// Linear scan for the chunk containing `value`.
    #[must_use]
    pub fn find_chunk(&self, value: &Value) -> Option<Chunk> {
        self.chunks.lock().iter().find(|c| c.contains(value)).cloned()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Chunk> {
        self.chunks.lock().iter().find(|c| c.id == id).cloned()
    }

    #[must_use]
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.lock().clone()
    }

    #[must_use]
    pub fn chunks_for_shard(&self, shard: &str) -> Vec<Chunk> {
        self.chunks.lock().iter().filter(|c| c.shard == shard).cloned().collect()
    }

    /// Splits a chunk at `split_key` into two same-owner halves whose
    /// union is the original range.
    /// # Errors
    /// `NotFound` for an unknown chunk, `InvalidInput` when the key is
    /// outside `[min, max)`.
    pub fn split_chunk(&self, id: &str, split_key: &Value) -> Result<(Chunk, Chunk), DbError> {
        let mut chunks = self.chunks.lock();
        let idx = chunks
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| DbError::NotFound(format!("chunk {id}")))?;
        let original = chunks[idx].clone();
        if !original.contains(split_key) {
            return Err(DbError::InvalidInput(format!(
                "split key {split_key} is outside chunk {id}"
            )));
        }
        let mut lower = Chunk::new(
            format!("{id}.1"),
            original.shard.clone(),
            original.min.clone(),
            Some(split_key.clone()),
        );
        let mut upper = Chunk::new(
            format!("{id}.2"),
            original.shard.clone(),
            Some(split_key.clone()),
            original.max.clone(),
        );
        lower.count = original.count / 2;
        upper.count = original.count - lower.count;
        lower.size = original.size / 2;
        upper.size = original.size - lower.size;
        lower.version = original.version + 1;
        upper.version = original.version + 1;
        chunks.remove(idx);
        chunks.push(lower.clone());
        chunks.push(upper.clone());
        Ok((lower, upper))
    }

    /// Reassigns a chunk's owner and bumps its version. The target must
    /// not be draining.
    /// # Errors
    /// `NotFound` for an unknown chunk, `Conflict` for a draining
    /// target.
    pub fn move_chunk(&self, id: &str, target: &Shard) -> Result<Chunk, DbError> {
        if target.state == ShardState::Draining {
            return Err(DbError::Conflict(format!("shard {} is draining", target.id)));
        }
        let mut chunks = self.chunks.lock();
        let chunk = chunks
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DbError::NotFound(format!("chunk {id}")))?;
        chunk.shard = target.id.clone();
        chunk.version += 1;
        Ok(chunk.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, shard: &str, min: Option<i64>, max: Option<i64>) -> Chunk {
        Chunk::new(id, shard, min.map(Value::Int64), max.map(Value::Int64))
    }

    #[test]
    fn overlap_is_rejected() {
        let mgr = ChunkManager::new();
        mgr.add_chunk(chunk("a", "s1", Some(0), Some(100))).unwrap();
        mgr.add_chunk(chunk("b", "s1", Some(100), Some(200))).unwrap();
        let err = mgr.add_chunk(chunk("c", "s2", Some(50), Some(150))).unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
        let err = mgr.add_chunk(chunk("d", "s2", None, Some(10))).unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[test]
    fn contains_uses_half_open_bounds() {
        let c = chunk("a", "s1", Some(0), Some(100));
        assert!(c.contains(&Value::Int64(0)));
        assert!(c.contains(&Value::Int64(99)));
        assert!(!c.contains(&Value::Int64(100)));
        let unbounded = chunk("b", "s1", None, None);
        assert!(unbounded.contains(&Value::Int64(i64::MIN)));
        assert!(unbounded.contains(&Value::Null));
    }

    #[test]
    fn split_union_equals_original() {
        let mgr = ChunkManager::new();
        mgr.add_chunk(chunk("a", "s1", Some(0), Some(100))).unwrap();
        let (lower, upper) = mgr.split_chunk("a", &Value::Int64(40)).unwrap();
        assert_eq!(lower.min, Some(Value::Int64(0)));
        assert_eq!(lower.max, Some(Value::Int64(40)));
        assert_eq!(upper.min, Some(Value::Int64(40)));
        assert_eq!(upper.max, Some(Value::Int64(100)));
        assert_eq!(lower.shard, "s1");
        assert_eq!(upper.shard, "s1");
        // Every value the original covered lands in exactly one half.
        for v in [0i64, 39, 40, 99] {
            let value = Value::Int64(v);
            assert!(lower.contains(&value) ^ upper.contains(&value));
        }
    }

    #[test]
    fn split_key_must_be_inside() {
        let mgr = ChunkManager::new();
        mgr.add_chunk(chunk("a", "s1", Some(0), Some(100))).unwrap();
        assert!(matches!(
            mgr.split_chunk("a", &Value::Int64(100)),
            Err(DbError::InvalidInput(_))
        ));
        assert!(matches!(
            mgr.split_chunk("a", &Value::Int64(-1)),
            Err(DbError::InvalidInput(_))
        ));
        assert!(matches!(mgr.split_chunk("nope", &Value::Int64(5)), Err(DbError::NotFound(_))));
    }

    #[test]
    fn move_bumps_version_and_guards_draining() {
        let mgr = ChunkManager::new();
        mgr.add_chunk(chunk("a", "s1", Some(0), Some(100))).unwrap();
        let target = Shard::new("s2", "host2:27017");
        let moved = mgr.move_chunk("a", &target).unwrap();
        assert_eq!(moved.shard, "s2");
        assert_eq!(moved.version, 2);

        let mut draining = Shard::new("s3", "host3:27017");
        draining.state = ShardState::Draining;
        assert!(matches!(mgr.move_chunk("a", &draining), Err(DbError::Conflict(_))));
    }
}
