use super::chunk::{Chunk, ChunkManager, Shard};
use super::key::{ShardKey, ShardKeyKind};
use crate::document::Document;
use crate::errors::DbError;
use crate::query::Filter;
use parking_lot::RwLock;
use std::sync::Arc;

/// Routes documents and queries to shards. Hash keys take
/// `hash mod N` over the ordered shard list; range keys resolve the
/// owning chunk. Queries without a full shard-key value scatter-gather
/// to every known shard.
pub struct ShardRouter {
    key: ShardKey,
    shards: RwLock<Vec<Shard>>,
    chunks: Arc<ChunkManager>,
}

impl ShardRouter {
    #[must_use]
    pub fn new(key: ShardKey, shards: Vec<Shard>, chunks: Arc<ChunkManager>) -> Self {
        Self { key, shards: RwLock::new(shards), chunks }
    }

    #[must_use]
    pub fn shard_key(&self) -> &ShardKey {
        &self.key
    }

    #[must_use]
    pub fn shards(&self) -> Vec<Shard> {
        self.shards.read().clone()
    }

    /// # Errors
    /// `Duplicate` for a reused shard id.
    pub fn add_shard(&self, shard: Shard) -> Result<(), DbError> {
        let mut shards = self.shards.write();
        if shards.iter().any(|s| s.id == shard.id) {
            return Err(DbError::Duplicate(format!("shard {} already registered", shard.id)));
        }
        shards.push(shard);
        Ok(())
    }

    /// The shard that owns this document.
    /// # Errors
    /// `InvalidInput` on a missing shard-key field, `NotFound` when no
    /// chunk covers a range-routed value or the shard list is empty.
    pub fn route(&self, doc: &Document) -> Result<Shard, DbError> {
        match self.key.kind {
            ShardKeyKind::Hash => {
                let shards = self.shards.read();
                if shards.is_empty() {
                    return Err(DbError::NotFound("no shards registered".into()));
                }
                let hash = self.key.hash(doc)?;
                let idx = (hash % shards.len() as u64) as usize;
                Ok(shards[idx].clone())
            }
            ShardKeyKind::Range => {
                let value = self.key.extract(doc)?;
                let chunk = self.chunks.find_chunk(&value).ok_or_else(|| {
                    DbError::NotFound(format!("no chunk covers shard key {value}"))
                })?;
                self.shard_by_id(&chunk.shard)
            }
        }
    }

    /// Shards a query must touch: one when the filter pins the full
    /// shard key, otherwise all of them.
    /// # Errors
    /// `NotFound` when routing a pinned value finds no owner.
    pub fn route_query(&self, filter: &Filter) -> Result<Vec<Shard>, DbError> {
        match self.key.extract_from_filter(filter) {
            Some(value) => match self.key.kind {
                ShardKeyKind::Hash => {
                    let shards = self.shards.read();
                    if shards.is_empty() {
                        return Err(DbError::NotFound("no shards registered".into()));
                    }
                    let idx = (self.key.hash_value(&value) % shards.len() as u64) as usize;
                    Ok(vec![shards[idx].clone()])
                }
                ShardKeyKind::Range => {
                    let chunk = self.chunks.find_chunk(&value).ok_or_else(|| {
                        DbError::NotFound(format!("no chunk covers shard key {value}"))
                    })?;
                    Ok(vec![self.shard_by_id(&chunk.shard)?])
                }
            },
            None => Ok(self.shards.read().clone()),
        }
    }

    /// The chunk a range-routed document belongs to (splitting and
    /// balancing decisions).
    /// # Errors
    /// `InvalidInput` on a missing field, `NotFound` without a covering
    /// chunk.
    pub fn chunk_for(&self, doc: &Document) -> Result<Chunk, DbError> {
        let value = self.key.extract(doc)?;
        self.chunks
            .find_chunk(&value)
            .ok_or_else(|| DbError::NotFound(format!("no chunk covers shard key {value}")))
    }

    fn shard_by_id(&self, id: &str) -> Result<Shard, DbError> {
        self.shards
            .read()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("shard {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;

    fn three_shards() -> Vec<Shard> {
        vec![
            Shard::new("s1", "h1:27017"),
            Shard::new("s2", "h2:27017"),
            Shard::new("s3", "h3:27017"),
        ]
    }

    #[test]
    fn hash_routing_is_deterministic() {
        let router = ShardRouter::new(
            ShardKey::hashed("user_id"),
            three_shards(),
            Arc::new(ChunkManager::new()),
        );
        let doc = crate::doc! { "user_id" => Value::String("u-42".into()) };
        let first = router.route(&doc).unwrap();
        for _ in 0..9 {
            assert_eq!(router.route(&doc).unwrap(), first);
        }
    }

    #[test]
    fn hash_routing_spreads_keys() {
        let router = ShardRouter::new(
            ShardKey::hashed("user_id"),
            three_shards(),
            Arc::new(ChunkManager::new()),
        );
        let mut per_shard = std::collections::HashMap::new();
        for i in 0..10_000 {
            let doc = crate::doc! { "user_id" => Value::String(format!("user-{i}")) };
            let shard = router.route(&doc).unwrap();
            *per_shard.entry(shard.id).or_insert(0u32) += 1;
        }
        for (shard, count) in per_shard {
            assert!(
                (3000..=3700).contains(&count),
                "shard {shard} got {count} of 10000 keys"
            );
        }
    }

    #[test]
    fn range_routing_with_compound_key() {
        let chunks = Arc::new(ChunkManager::new());
        chunks
            .add_chunk(Chunk::new(
                "us",
                "sA",
                Some(Value::Array(vec![Value::String("US".into()), Value::Int64(0)])),
                Some(Value::Array(vec![Value::String("US".into()), Value::Int64(10_000)])),
            ))
            .unwrap();
        chunks
            .add_chunk(Chunk::new(
                "uk",
                "sB",
                Some(Value::Array(vec![Value::String("UK".into()), Value::Int64(0)])),
                Some(Value::Array(vec![Value::String("UK".into()), Value::Int64(10_000)])),
            ))
            .unwrap();
        let router = ShardRouter::new(
            ShardKey::ranged(vec!["country".into(), "user_id".into()]),
            vec![Shard::new("sA", "a:27017"), Shard::new("sB", "b:27017")],
            chunks,
        );

        let us = crate::doc! {
            "country" => Value::String("US".into()),
            "user_id" => Value::Int64(1001),
        };
        assert_eq!(router.route(&us).unwrap().id, "sA");

        let uk = crate::doc! {
            "country" => Value::String("UK".into()),
            "user_id" => Value::Int64(500),
        };
        assert_eq!(router.route(&uk).unwrap().id, "sB");

        // No shard-key prefix: scatter-gather to both shards.
        let fanout = router
            .route_query(&Filter::eq("name", Value::String("Alice".into())))
            .unwrap();
        assert_eq!(fanout.len(), 2);
    }

    #[test]
    fn pinned_query_routes_to_one_shard() {
        let router = ShardRouter::new(
            ShardKey::hashed("user_id"),
            three_shards(),
            Arc::new(ChunkManager::new()),
        );
        let doc = crate::doc! { "user_id" => Value::String("u-7".into()) };
        let owner = router.route(&doc).unwrap();
        let routed = router
            .route_query(&Filter::eq("user_id", Value::String("u-7".into())))
            .unwrap();
        assert_eq!(routed, vec![owner]);
    }

    #[test]
    fn missing_key_field_is_invalid_input() {
        let router = ShardRouter::new(
            ShardKey::hashed("user_id"),
            three_shards(),
            Arc::new(ChunkManager::new()),
        );
        let doc = crate::doc! { "name" => Value::String("nobody".into()) };
        assert!(matches!(router.route(&doc), Err(DbError::InvalidInput(_))));
    }
}
