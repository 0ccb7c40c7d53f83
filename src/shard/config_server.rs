use super::chunk::{Chunk, Shard, ShardState};
use super::key::ShardKey;
use crate::errors::DbError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const METADATA_FILE: &str = "config_server_metadata.json";

/// A collection registered for sharding, with its declared key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedCollection {
    pub name: String,
    pub key: ShardKey,
}

/// One chunk registration in the cluster catalog, scoped to the
/// collection whose key space it partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChunkEntry {
    collection: String,
    chunk: Chunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigMetadata {
    version: u64,
    updated_at: DateTime<Utc>,
    shards: Vec<Shard>,
    chunks: Vec<ChunkEntry>,
    sharded_collections: Vec<ShardedCollection>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        Self {
            version: 0,
            updated_at: Utc::now(),
            shards: Vec::new(),
            chunks: Vec::new(),
            sharded_collections: Vec::new(),
        }
    }
}

/// Durable single-node catalog of shards, chunks and sharded
/// collections. Every mutation serializes under one mutex, bumps the
/// monotonically increasing version, and returns only after the new
/// metadata has been renamed into place.
pub struct ConfigServer {
    inner: Mutex<ConfigMetadata>,
    path: PathBuf,
}

impl ConfigServer {
    /// Opens (or initializes) the catalog under `data_dir`.
    /// # Errors
    /// `Io` / `Json` when an existing metadata file cannot be read.
    pub fn open(data_dir: &Path) -> Result<Self, DbError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(METADATA_FILE);
        let metadata = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            ConfigMetadata::default()
        };
        Ok(Self { inner: Mutex::new(metadata), path })
    }

    /// # Errors
    /// `Duplicate` for a reused shard id.
    pub fn register_shard(&self, shard: Shard) -> Result<u64, DbError> {
        let mut meta = self.inner.lock();
        if meta.shards.iter().any(|s| s.id == shard.id) {
            return Err(DbError::Duplicate(format!("shard {} already registered", shard.id)));
        }
        meta.shards.push(shard);
        self.persist(&mut meta)
    }

    /// A shard can only leave the cluster once it owns no chunks.
    /// # Errors
    /// `NotFound` for an unknown shard, `Conflict` while chunks remain.
    pub fn unregister_shard(&self, id: &str) -> Result<u64, DbError> {
        let mut meta = self.inner.lock();
        if !meta.shards.iter().any(|s| s.id == id) {
            return Err(DbError::NotFound(format!("shard {id}")));
        }
        let owned = meta.chunks.iter().filter(|e| e.chunk.shard == id).count();
        if owned > 0 {
            return Err(DbError::Conflict(format!("shard {id} still owns {owned} chunk(s)")));
        }
        meta.shards.retain(|s| s.id != id);
        self.persist(&mut meta)
    }

    /// # Errors
    /// `NotFound` for an unknown shard.
    pub fn set_shard_state(&self, id: &str, state: ShardState) -> Result<u64, DbError> {
        let mut meta = self.inner.lock();
        let shard = meta
            .shards
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| DbError::NotFound(format!("shard {id}")))?;
        shard.state = state;
        self.persist(&mut meta)
    }

    /// Registers a chunk into a collection's key space.
    /// # Errors
    /// `NotFound` for an unknown owner shard, `Conflict` on range
    /// overlap within the same key space, `Duplicate` for a reused id.
    pub fn register_chunk(&self, collection: &str, chunk: Chunk) -> Result<u64, DbError> {
        let mut meta = self.inner.lock();
        if !meta.shards.iter().any(|s| s.id == chunk.shard) {
            return Err(DbError::NotFound(format!("shard {} is not registered", chunk.shard)));
        }
        if meta.chunks.iter().any(|e| e.chunk.id == chunk.id) {
            return Err(DbError::Duplicate(format!("chunk {} already registered", chunk.id)));
        }
        if let Some(existing) = meta
            .chunks
            .iter()
            .filter(|e| e.collection == collection)
            .find(|e| e.chunk.overlaps(&chunk))
        {
            return Err(DbError::Conflict(format!(
                "chunk {} overlaps chunk {} in collection {collection}",
                chunk.id, existing.chunk.id
            )));
        }
        meta.chunks.push(ChunkEntry { collection: collection.to_string(), chunk });
        self.persist(&mut meta)
    }

    /// # Errors
    /// `NotFound` for an unknown chunk.
    pub fn unregister_chunk(&self, id: &str) -> Result<u64, DbError> {
        let mut meta = self.inner.lock();
        if !meta.chunks.iter().any(|e| e.chunk.id == id) {
            return Err(DbError::NotFound(format!("chunk {id}")));
        }
        meta.chunks.retain(|e| e.chunk.id != id);
        self.persist(&mut meta)
    }

    /// Declares a collection sharded. Resharding is rejected.
    /// # Errors
    /// `Conflict` when the collection is already sharded.
    pub fn shard_collection(&self, name: &str, key: ShardKey) -> Result<u64, DbError> {
        let mut meta = self.inner.lock();
        if meta.sharded_collections.iter().any(|c| c.name == name) {
            return Err(DbError::Conflict(format!("collection {name} is already sharded")));
        }
        meta.sharded_collections.push(ShardedCollection { name: name.to_string(), key });
        self.persist(&mut meta)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.inner.lock().updated_at
    }

    #[must_use]
    pub fn shards(&self) -> Vec<Shard> {
        self.inner.lock().shards.clone()
    }

    #[must_use]
    pub fn chunks(&self, collection: &str) -> Vec<Chunk> {
        self.inner
            .lock()
            .chunks
            .iter()
            .filter(|e| e.collection == collection)
            .map(|e| e.chunk.clone())
            .collect()
    }

    #[must_use]
    pub fn sharded_collections(&self) -> Vec<ShardedCollection> {
        self.inner.lock().sharded_collections.clone()
    }

    /// Bumps the version and rewrites the metadata file atomically
    /// (tmp + rename). Called with the mutex held; the mutation is
    /// durable before the caller's lock releases.
    fn persist(&self, meta: &mut ConfigMetadata) -> Result<u64, DbError> {
        meta.version += 1;
        meta.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&*meta)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(meta.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;

    fn server() -> (tempfile::TempDir, ConfigServer) {
        let dir = tempfile::tempdir().unwrap();
        let server = ConfigServer::open(dir.path()).unwrap();
        (dir, server)
    }

    fn chunk(id: &str, shard: &str, min: i64, max: i64) -> Chunk {
        Chunk::new(id, shard, Some(Value::Int64(min)), Some(Value::Int64(max)))
    }

    #[test]
    fn versions_rise_monotonically_across_mutations() {
        let (_dir, server) = server();
        let v1 = server.register_shard(Shard::new("s1", "h1:27017")).unwrap();
        let v2 = server.register_shard(Shard::new("s2", "h2:27017")).unwrap();
        let v3 = server.register_chunk("users", chunk("c1", "s1", 0, 100)).unwrap();
        assert!(v1 < v2 && v2 < v3);
        assert_eq!(server.version(), v3);
    }

    #[test]
    fn unregistering_an_owning_shard_is_conflict() {
        let (_dir, server) = server();
        server.register_shard(Shard::new("s1", "h1:27017")).unwrap();
        server.register_chunk("users", chunk("c1", "s1", 0, 100)).unwrap();
        assert!(matches!(server.unregister_shard("s1"), Err(DbError::Conflict(_))));
        server.unregister_chunk("c1").unwrap();
        server.unregister_shard("s1").unwrap();
        assert!(server.shards().is_empty());
    }

    #[test]
    fn chunk_for_unknown_shard_is_not_found() {
        let (_dir, server) = server();
        assert!(matches!(
            server.register_chunk("users", chunk("c1", "ghost", 0, 100)),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn overlap_guard_is_scoped_per_collection() {
        let (_dir, server) = server();
        server.register_shard(Shard::new("s1", "h1:27017")).unwrap();
        server.register_chunk("users", chunk("c1", "s1", 0, 100)).unwrap();
        assert!(matches!(
            server.register_chunk("users", chunk("c2", "s1", 50, 150)),
            Err(DbError::Conflict(_))
        ));
        // Same range in another collection's key space is fine.
        server.register_chunk("orders", chunk("c3", "s1", 50, 150)).unwrap();
    }

    #[test]
    fn resharding_is_conflict() {
        let (_dir, server) = server();
        server.shard_collection("users", ShardKey::hashed("user_id")).unwrap();
        assert!(matches!(
            server.shard_collection("users", ShardKey::hashed("email")),
            Err(DbError::Conflict(_))
        ));
    }

    #[test]
    fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let version = {
            let server = ConfigServer::open(dir.path()).unwrap();
            server.register_shard(Shard::new("s1", "h1:27017")).unwrap();
            server.shard_collection("users", ShardKey::hashed("user_id")).unwrap()
        };
        let reopened = ConfigServer::open(dir.path()).unwrap();
        assert_eq!(reopened.version(), version);
        assert_eq!(reopened.shards().len(), 1);
        assert_eq!(reopened.sharded_collections().len(), 1);
    }
}
