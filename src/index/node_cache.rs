use super::node::Node;
use crate::errors::DbError;
use crate::storage::{BufferPool, PageId, Wal};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hit-rate counters for one index's node cache, reported separately
/// from the buffer pool underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
    pub dirty: usize,
}

struct CacheInner {
    nodes: LruCache<PageId, Node>,
    dirty: HashSet<PageId>,
}

/// Bounded LRU of decoded B+ tree nodes, layered over the buffer pool.
/// Dirty nodes are written back through the WAL-then-pool protocol on
/// eviction and on `flush_dirty`.
pub struct NodeCache {
    inner: Mutex<CacheInner>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NodeCache {
    #[must_use]
    pub fn new(pool: Arc<BufferPool>, wal: Arc<Wal>, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner { nodes: LruCache::new(cap), dirty: HashSet::new() }),
            pool,
            wal,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a clone of the node, loading it through the buffer pool
    /// on a miss.
    /// # Errors
    /// Surfaces pool/disk errors and `Corruption` from node decoding.
    pub fn get(&self, id: PageId) -> Result<Node, DbError> {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(node.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let page = self.pool.fetch(id)?;
        let node = Node::from_page(&page);
        self.pool.unpin(id);
        let node = node?;
        self.install(&mut inner, id, node.clone(), false)?;
        Ok(node)
    }

    /// Installs a (possibly mutated) node and marks it dirty.
    /// # Errors
    /// Surfaces write-back errors from evicting another dirty node.
    pub fn put(&self, node: Node) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let id = node.page_id;
        self.install(&mut inner, id, node, true)
    }

    /// Drops a node (page freed by a collection drop).
    pub fn evict(&self, id: PageId) {
        let mut inner = self.inner.lock();
        inner.nodes.pop(&id);
        inner.dirty.remove(&id);
    }

    /// Writes every dirty node back through the buffer pool.
    /// # Errors
    /// Surfaces WAL append or pool errors.
    pub fn flush_dirty(&self) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let dirty: Vec<PageId> = inner.dirty.iter().copied().collect();
        for id in dirty {
            if let Some(node) = inner.nodes.peek(&id) {
                let node = node.clone();
                self.write_back(&node)?;
            }
            inner.dirty.remove(&id);
        }
        Ok(())
    }

    #[must_use]
    pub fn metrics(&self) -> NodeCacheMetricsSnapshot {
        let inner = self.inner.lock();
        NodeCacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resident: inner.nodes.len(),
            dirty: inner.dirty.len(),
        }
    }

    fn install(
        &self,
        inner: &mut CacheInner,
        id: PageId,
        node: Node,
        dirty: bool,
    ) -> Result<(), DbError> {
        while inner.nodes.len() >= inner.nodes.cap().get() && inner.nodes.peek(&id).is_none() {
            let Some((victim_id, victim)) = inner.nodes.pop_lru() else { break };
            if inner.dirty.remove(&victim_id) {
                self.write_back(&victim)?;
            }
        }
        inner.nodes.put(id, node);
        if dirty {
            inner.dirty.insert(id);
        }
        Ok(())
    }

    fn write_back(&self, node: &Node) -> Result<(), DbError> {
        let mut page = node.to_page()?;
        let lsn = self.wal.append(node.page_id, None, page.bytes().to_vec())?;
        page.set_lsn(lsn);
        self.pool.put_page(page)?;
        Ok(())
    }
}
